//! 处理器状态管理，用于控制正在执行的进程与中断开关

use array_macro::array;

use core::ptr;

use crate::consts::NCPU;
use crate::driver::lapic;
use crate::mm::kvm_install;
use crate::register::rflags;
use crate::spinlock::SpinLockGuard;

use super::proc::ProcExcl;
use super::{Context, Proc, ProcState, PROC_MANAGER};

/// 全局 CPU 管理器实例。
///
/// 每个处理器对应一个 [`Cpu`]：记录其上正在运行的进程、
/// 调度器自身的切换上下文以及关中断的嵌套深度。
/// 访问自己的 Cpu 结构需要关中断，避免执行中途被迁移。
pub static mut CPU_MANAGER: CpuManager = CpuManager::new();

pub struct CpuManager {
    table: [Cpu; NCPU],
}

impl CpuManager {
    const fn new() -> Self {
        Self {
            table: array![_ => Cpu::new(); NCPU],
        }
    }

    /// 当前处理器的编号。
    /// 必须在禁用中断的情况下调用，
    /// 防止读到编号后进程被迁移到其他处理器。
    #[inline]
    pub unsafe fn cpu_id() -> usize {
        lapic::id()
    }

    /// 当前处理器的 Cpu 结构。必须禁用中断。
    unsafe fn my_cpu(&self) -> &Cpu {
        let id = Self::cpu_id();
        &self.table[id]
    }

    /// 当前处理器的 Cpu 结构的可变引用。必须禁用中断。
    pub unsafe fn my_cpu_mut(&mut self) -> &mut Cpu {
        let id = Self::cpu_id();
        &mut self.table[id]
    }

    /// 当前处理器上正在运行的进程。
    ///
    /// # Panics
    /// 当前处理器没有运行进程（仍在调度器里）时 panic。
    pub fn my_proc(&self) -> &mut Proc {
        let p;
        push_off();
        unsafe {
            let c = self.my_cpu();
            if c.proc.is_null() {
                panic!("my_proc(): no process running");
            }
            p = &mut *c.proc;
        }
        pop_off();
        p
    }

    /// 当前处理器上正在运行的进程；仍在调度器里时返回 None。
    pub fn try_my_proc(&self) -> Option<&mut Proc> {
        let p;
        push_off();
        unsafe {
            let c = self.my_cpu();
            p = c.proc.as_mut();
        }
        pop_off();
        p
    }

    /// 调度器主循环，每个处理器初始化完成后进入，永不返回。
    ///
    /// # 流程解释
    /// 1. 打开中断，保证设备中断能打断空转；
    /// 2. 轮转扫描进程表认领一个 RUNNABLE 进程
    ///    （认领即置为 RUNNING）；
    /// 3. 装载其地址空间，持其排他锁 `swtch` 过去；
    /// 4. 对方让出后回到这里，换回内核页表、清空运行记录。
    ///
    /// # 安全性
    /// 排他锁的所有权随 `swtch` 在调度器与进程之间移交，
    /// 双方各自释放对方获取的那一次。
    pub unsafe fn scheduler(&mut self) -> ! {
        extern "C" {
            fn swtch(old: *mut Context, new: *mut Context);
        }

        let c = self.my_cpu_mut();

        loop {
            // 确保设备能够中断
            rflags::intr_on();

            match PROC_MANAGER.alloc_runnable() {
                Some(p) => {
                    c.proc = p as *mut _;
                    let guard = p.excl.lock();
                    debug_assert_eq!(guard.state, ProcState::RUNNING);

                    let pdata = p.data.get_mut();
                    pdata.vspace.install();
                    swtch(&mut c.scheduler as *mut Context, pdata.get_context());
                    kvm_install();

                    if c.proc.is_null() {
                        panic!("context switch back with no process reference");
                    }
                    c.proc = ptr::null_mut();
                    drop(guard);
                }
                None => {}
            }
        }
    }
}

/// 单个处理器的状态。
/// 只被所在处理器本地访问，不需要额外加锁。
pub struct Cpu {
    /// 正在本处理器上运行的进程，空闲时为空指针。
    proc: *mut Proc,
    /// 调度器自身的切换上下文。
    scheduler: Context,
    /// 关中断的嵌套层数。
    noff: u8,
    /// 第一层关中断之前的中断使能状态，用于成对恢复。
    intena: bool,
}

impl Cpu {
    const fn new() -> Self {
        Self {
            proc: ptr::null_mut(),
            scheduler: Context::new(),
            noff: 0,
            intena: false,
        }
    }

    /// 从进程上下文切回调度器。
    ///
    /// # 流程解释
    /// 进入前必须：持有且仅持有当前进程的排他锁（noff == 1）、
    /// 已改好进程状态（不再是 RUNNING）、中断关闭。
    /// 这些就是进入调度的全部约束，违反任何一条都 panic。
    /// 切回后恢复本处理器的中断记录并把锁还给调用者。
    pub unsafe fn sched<'a>(
        &mut self,
        guard: SpinLockGuard<'a, ProcExcl>,
        ctx: *mut Context,
    ) -> SpinLockGuard<'a, ProcExcl> {
        extern "C" {
            fn swtch(old: *mut Context, new: *mut Context);
        }

        if !guard.holding() {
            panic!("sched(): not holding proc's lock");
        }
        if self.noff != 1 {
            panic!("sched(): cpu holds multi locks");
        }
        if guard.state == ProcState::RUNNING {
            panic!("sched(): proc is running");
        }
        if rflags::intr_get() {
            panic!("sched(): interruptible");
        }

        let intena = self.intena;
        swtch(ctx, &mut self.scheduler as *mut Context);
        self.intena = intena;

        guard
    }

    /// 时钟中断里尝试让当前进程让出处理器。
    pub fn try_yield_proc(&mut self) {
        if !self.proc.is_null() {
            let p = unsafe { self.proc.as_mut().unwrap() };
            let guard = p.excl.lock();
            if guard.state == ProcState::RUNNING {
                drop(guard);
                p.yielding();
            } else {
                drop(guard);
            }
        }
    }
}

/// 关闭本地中断并把嵌套深度加一。
/// 与 [`pop_off`] 成对使用；第一层时记下之前的中断状态。
pub fn push_off() {
    let old = rflags::intr_get();
    rflags::intr_off();
    let c = unsafe { CPU_MANAGER.my_cpu_mut() };
    if c.noff == 0 {
        c.intena = old;
    }
    c.noff += 1;
}

/// 退出一层关中断，嵌套归零且先前中断打开时恢复中断。
///
/// # Panics
/// - 中断竟然处于打开状态（push/pop 配对被破坏）；
/// - 嵌套计数下溢。
pub fn pop_off() {
    if rflags::intr_get() {
        panic!("pop_off(): interruptible");
    }
    let c = unsafe { CPU_MANAGER.my_cpu_mut() };
    if c.noff == 0 {
        panic!("pop_off(): count not match");
    }
    c.noff -= 1;
    if c.noff == 0 && c.intena {
        rflags::intr_on();
    }
}
