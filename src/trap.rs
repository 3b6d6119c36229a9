//! 中断与异常处理

use bit_field::BitField;

use core::num::Wrapping;
use core::sync::atomic::Ordering;

use crate::consts::trap::*;
use crate::consts::{DPL_USER, PGSIZE, STACKPAGES};
use crate::driver::ide::DISK;
use crate::driver::uart::UART;
use crate::driver::{kbd, lapic};
use crate::mm::{pg_round_down, VR_USTACK};
use crate::process::{CpuManager, Proc, TrapFrame, CPU_MANAGER};
use crate::register::cr2;
use crate::spinlock::SpinLock;

/// 陷阱总入口，由中断向量桩压好陷阱帧后调用。
///
/// # 功能说明
/// 按向量号分发：系统调用、时钟、设备中断与缺页异常。
/// 返回用户态之前兑现挂起的终止请求，时钟中断上强制
/// 正在运行的进程让出处理器。
///
/// # 安全性
/// 必须由向量桩在正确的内核栈上调用，tf 指向刚压好的陷阱帧。
#[no_mangle]
pub unsafe extern "C" fn trap(tf: &mut TrapFrame) {
    if tf.trapno == TRAP_SYSCALL {
        let p = CPU_MANAGER.my_proc();
        p.check_abandon();
        // 系统调用的参数取自本次压下的陷阱帧
        p.data.get_mut().tf = tf as *mut TrapFrame;
        p.syscall();
        p.check_abandon();
        return;
    }

    match tf.trapno {
        t if t == TRAP_IRQ0 + IRQ_TIMER => {
            // 时钟滴答只在 0 号处理器上计数
            if CpuManager::cpu_id() == 0 {
                clock_intr();
            }
            lapic::eoi();
        }
        t if t == TRAP_IRQ0 + IRQ_IDE => {
            DISK.lock().intr();
            lapic::eoi();
        }
        t if t == TRAP_IRQ0 + IRQ_KBD => {
            kbd::intr();
            lapic::eoi();
        }
        t if t == TRAP_IRQ0 + IRQ_COM1 => {
            UART.intr();
            lapic::eoi();
        }
        t if t == TRAP_IRQ0 + 7 || t == TRAP_IRQ0 + IRQ_SPURIOUS => {
            println!(
                "cpu{}: spurious interrupt at {:#x}:{:#x}",
                CpuManager::cpu_id(),
                tf.cs,
                tf.rip
            );
            lapic::eoi();
        }
        t if t == TRAP_PF => {
            page_fault(tf);
        }
        _ => {
            if (tf.cs & 3) as u16 != DPL_USER {
                println!(
                    "unexpected trap {} from cpu {} rip {:#x}",
                    tf.trapno,
                    CpuManager::cpu_id(),
                    tf.rip
                );
                panic!("trap");
            }
            let p = CPU_MANAGER.my_proc();
            println!(
                "pid {}: trap {} err {} on cpu {} rip {:#x} -- kill proc",
                p.pid(),
                tf.trapno,
                tf.err,
                CpuManager::cpu_id(),
                tf.rip
            );
            p.killed.store(true, Ordering::Relaxed);
        }
    }

    // 返回用户态前兑现终止请求；时钟滴答上强制让出处理器
    let from_user = (tf.cs & 3) as u16 == DPL_USER;
    if let Some(p) = CPU_MANAGER.try_my_proc() {
        if from_user {
            p.check_abandon();
        }
        if tf.trapno == TRAP_IRQ0 + IRQ_TIMER {
            CPU_MANAGER.my_cpu_mut().try_yield_proc();
        }
        // 让出期间可能又被 kill
        if from_user {
            p.check_abandon();
        }
    }
}

/// 缺页异常处理。
///
/// # 流程解释
/// 故障地址取自 CR2，按错误码的低位分发：
/// - 存在位清零的用户缺页：换出的页换回内存；
///   落在用户栈基址之下 10 页以内的地址触发栈生长，
///   一次补齐缺失的整段页；
/// - 写只读页（存在位与写位同时置位）：写时复制共享页
///   拆解出私有副本，恢复可写；
/// - 其余情况视作用户程序自身的错误，进程被终止。
/// 内核态的缺页没有合法来源，一律 panic。
unsafe fn page_fault(tf: &mut TrapFrame) {
    let addr = cr2::read();

    if (tf.cs & 3) as u16 != DPL_USER {
        println!(
            "kernel page fault: cr2 {:#x} err {} rip {:#x} cpu {}",
            addr,
            tf.err,
            tf.rip,
            CpuManager::cpu_id()
        );
        panic!("trap");
    }

    let p = CPU_MANAGER.my_proc();
    let pdata = p.data.get_mut();
    let err = tf.err;

    if !err.get_bit(0) {
        // 页不存在：先看是不是换出的页
        if pdata.vspace.is_swapped(addr) {
            if pdata.vspace.swap_in(addr).is_err() {
                panic!("cannot allocate new page for swapped memory");
            }
            pdata.vspace.install();
            return;
        }

        // 用户栈按需向下生长
        let stack_base = pdata.vspace.regions[VR_USTACK].base;
        let stack_bottom = pdata.vspace.regions[VR_USTACK].lowest();
        if addr < stack_bottom && addr >= stack_base - STACKPAGES * PGSIZE {
            let grow_base = pg_round_down(addr);
            let npages = (stack_bottom - grow_base) / PGSIZE;
            if pdata.vspace.add_map(VR_USTACK, grow_base, npages, true).is_err() {
                panic!("cannot allocate space in stack");
            }
            pdata.vspace.regions[VR_USTACK].size += npages * PGSIZE;
            pdata.vspace.invalidate();
            pdata.vspace.install();
            return;
        }
    } else if err.get_bit(1) {
        // 写只读页：拆解写时复制共享
        if pdata.vspace.is_cow(addr) {
            if pdata.vspace.cow_break(addr).is_err() {
                panic!("cannot allocate new page for copy-on-write memory");
            }
            pdata.vspace.install();
            return;
        }
    }

    // 用户程序访问了不属于它的地址
    println!(
        "pid {}: page fault err {} on cpu {} rip {:#x} addr {:#x} -- kill proc",
        p.pid(),
        err,
        CpuManager::cpu_id(),
        tf.rip,
        addr
    );
    p.killed.store(true, Ordering::Relaxed);
}

/// 返回用户空间：恢复陷阱帧并以 iretq 落回用户态。
///
/// # 安全性
/// 只能在当前进程的陷阱帧内容就绪后调用。
pub unsafe fn user_trap_ret() -> ! {
    extern "C" {
        fn trapret(tf: *mut TrapFrame) -> !;
    }

    let p = CPU_MANAGER.my_proc();
    let tf = p.data.get_mut().tf;
    trapret(tf)
}

/// 全局时钟计数器。
static TICKS: SpinLock<Wrapping<usize>> = SpinLock::new(Wrapping(0), "time");

/// 时钟中断：滴答计数加一并唤醒等时间的进程。
fn clock_intr() {
    let mut guard = TICKS.lock();
    *guard += Wrapping(1);
    unsafe {
        crate::process::PROC_MANAGER.wakeup(&TICKS as *const _ as usize);
    }
    drop(guard);
}

/// 让进程休眠 count 个时钟滴答。
///
/// # 返回值
/// - `Ok(())`: 滴答数到齐
/// - `Err(())`: 休眠期间进程被终止
pub fn clock_sleep(p: &Proc, count: usize) -> Result<(), ()> {
    let mut guard = TICKS.lock();
    let old_ticks = *guard;

    while (*guard - old_ticks) < Wrapping(count) {
        if p.killed.load(Ordering::Relaxed) {
            return Err(());
        }
        p.sleep(&TICKS as *const _ as usize, guard);
        guard = TICKS.lock();
    }
    Ok(())
}

/// 开机以来的时钟滴答数。
pub fn clock_read() -> usize {
    TICKS.lock().0
}
