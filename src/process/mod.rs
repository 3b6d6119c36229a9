//! 进程控制模块

use array_macro::array;

use core::sync::atomic::Ordering;

use crate::consts::fs::ROOTDEV;
use crate::consts::{KSTACKSIZE, NPROC};
use crate::fs;
use crate::mm::{RawPage, RawQuadPage};
use crate::spinlock::SpinLock;
use crate::trap::user_trap_ret;

pub use cpu::{pop_off, push_off, CpuManager, CPU_MANAGER};
pub use proc::{Proc, ProcState};
pub use trapframe::TrapFrame;

mod context;
mod cpu;
mod proc;
mod trapframe;

use context::Context;

/// 全局进程管理器。
///
/// 持有固定大小的进程表以及父子关系映射，负责进程槽位的
/// 分配与回收、睡眠唤醒、退出与收割。页帧淘汰与换入也经
/// 这里遍历所有进程的地址空间同步虚拟页信息。
pub static mut PROC_MANAGER: ProcManager = ProcManager::new();

pub struct ProcManager {
    /// 进程表。
    table: [Proc; NPROC],
    /// 父子关系：下标为子进程，值为父进程的表内下标。
    parents: SpinLock<[Option<usize>; NPROC]>,
    /// 初始进程的表内下标。
    init_proc: usize,
    /// 进程号分配器。
    pid: SpinLock<usize>,
}

impl ProcManager {
    const fn new() -> Self {
        Self {
            table: array![i => Proc::new(i); NPROC],
            parents: SpinLock::new(array![_ => None; NPROC], "proc parents"),
            init_proc: 0,
            pid: SpinLock::new(1, "pid"),
        }
    }

    /// 为进程表中的每个槽位分配内核栈（4 页）。
    ///
    /// # 安全性
    /// 必须在内核堆可用后、任何进程运行前由首个处理器调用一次。
    pub unsafe fn proc_init(&mut self) {
        for p in self.table.iter_mut() {
            let kstack = RawQuadPage::new_zeroed() as usize;
            p.data.get_mut().set_kstack(kstack);
        }
        debug_assert_eq!(KSTACKSIZE, 4 * crate::consts::PGSIZE);
    }

    /// 分配一个唯一的进程号。
    fn alloc_pid(&self) -> usize {
        let mut pid = self.pid.lock();
        let ret_pid = *pid;
        *pid += 1;
        ret_pid
    }

    /// 找一个 UNUSED 槽位并准备其内核运行环境。
    ///
    /// # 流程解释
    /// 槽位转为 EMBRYO 后分配陷阱帧页与地址空间根页表，
    /// 把上下文设置成从 fork_ret 开始执行（再经 trapret
    /// 弹出陷阱帧回到用户态）。任何一步分配失败都把槽位
    /// 清理回 UNUSED。
    fn alloc_proc(&mut self) -> Option<&mut Proc> {
        let new_pid = self.alloc_pid();

        for p in self.table.iter_mut() {
            let mut guard = p.excl.lock();
            match guard.state {
                ProcState::UNUSED => {
                    guard.state = ProcState::EMBRYO;
                    guard.pid = new_pid;
                    drop(guard);

                    // 持有槽位（EMBRYO 状态），可以直接改私有数据
                    let pd = p.data.get_mut();
                    if pd.vspace.init().is_err() {
                        pd.cleanup();
                        p.excl.lock().cleanup();
                        return None;
                    }
                    pd.init_context();
                    return Some(p);
                }
                _ => drop(guard),
            }
        }

        None
    }

    /// 轮转认领一个 RUNNABLE 进程，认领即转为 RUNNING。
    fn alloc_runnable(&mut self) -> Option<&mut Proc> {
        for p in self.table.iter_mut() {
            let mut guard = p.excl.lock();
            match guard.state {
                ProcState::RUNNABLE => {
                    guard.state = ProcState::RUNNING;
                    drop(guard);
                    return Some(p);
                }
                _ => {
                    drop(guard);
                }
            }
        }

        None
    }

    /// 创建第一个用户进程。
    ///
    /// # 安全性
    /// 只能在系统启动时由首个处理器调用一次。
    pub unsafe fn user_init(&mut self) {
        let p = self
            .alloc_proc()
            .expect("all process should be unused");
        p.user_init();
        let mut guard = p.excl.lock();
        guard.state = ProcState::RUNNABLE;
    }

    /// 唤醒所有在 channel 上休眠的进程。
    /// 调用时不能持有任何进程的排他锁。
    pub fn wakeup(&self, channel: usize) {
        for p in self.table.iter() {
            let mut guard = p.excl.lock();
            if guard.state == ProcState::SLEEPING && guard.channel == channel {
                guard.state = ProcState::RUNNABLE;
            }
            drop(guard);
        }
    }

    /// 登记 child_i 的父进程为 parent_i。
    fn set_parent(&self, child_i: usize, parent_i: usize) {
        let mut guard = self.parents.lock();
        let ret = guard[child_i].replace(parent_i);
        debug_assert!(ret.is_none());
        drop(guard);
    }

    /// 让下标 exit_pi 的进程退出，不再返回。
    ///
    /// # 流程解释
    /// 1. 关闭全部打开文件；
    /// 2. 把孩子过继给初始进程，有孩子时唤醒它；
    /// 3. 唤醒正在等待本进程的父进程；
    /// 4. 持排他锁转为 ZOMBIE 并进入调度器。
    ///    进入 sched 时恰好持这一把自旋锁，满足调度约束。
    fn exiting(&self, exit_pi: usize) -> ! {
        if exit_pi == self.init_proc {
            panic!("init process exiting");
        }

        unsafe {
            self.table[exit_pi].data.get().as_mut().unwrap().close_files();
        }

        let mut parent_map = self.parents.lock();

        // 把子进程过继给 init
        let mut have_child = false;
        for child in parent_map.iter_mut() {
            match child {
                Some(parent) if *parent == exit_pi => {
                    *parent = self.init_proc;
                    have_child = true;
                }
                _ => {}
            }
        }
        if have_child {
            self.wakeup(&self.table[self.init_proc] as *const Proc as usize);
        }
        let exit_parenti = *parent_map[exit_pi].as_ref().unwrap();
        self.wakeup(&self.table[exit_parenti] as *const Proc as usize);

        let mut exit_pexcl = self.table[exit_pi].excl.lock();
        exit_pexcl.state = ProcState::ZOMBIE;
        drop(parent_map);
        unsafe {
            let exit_ctx = self.table[exit_pi].data.get().as_mut().unwrap().get_context();
            CPU_MANAGER.my_cpu_mut().sched(exit_pexcl, exit_ctx);
        }

        unreachable!("exiting {}", exit_pi);
    }

    /// 等待任一子进程退出，返回被收割孩子的进程号。
    ///
    /// # 流程解释
    /// 持父子关系锁扫描自己的孩子：发现 ZOMBIE 即释放其
    /// 内核栈之外的全部资源并把槽位还为 UNUSED；
    /// 有孩子但都未退出时在自己的地址上休眠等退出方唤醒；
    /// 没有孩子（或自己已被终止）返回错误。
    fn waiting(&self, pi: usize) -> Result<usize, ()> {
        let mut parent_map = self.parents.lock();
        let p = unsafe { CPU_MANAGER.my_proc() };

        loop {
            let mut have_child = false;
            for i in 0..NPROC {
                if parent_map[i].is_none() || *parent_map[i].as_ref().unwrap() != pi {
                    continue;
                }

                let mut child_excl = self.table[i].excl.lock();
                have_child = true;
                if child_excl.state != ProcState::ZOMBIE {
                    continue;
                }
                let child_pid = child_excl.pid;
                parent_map[i].take();
                self.table[i].killed.store(false, Ordering::Relaxed);
                let child_data = unsafe { self.table[i].data.get().as_mut().unwrap() };
                child_data.cleanup();
                child_excl.cleanup();
                return Ok(child_pid);
            }

            if !have_child || p.killed.load(Ordering::Relaxed) {
                return Err(());
            }

            // 有孩子，但都还没退出
            let channel = p as *const Proc as usize;
            p.sleep(channel, parent_map);
            parent_map = self.parents.lock();
        }
    }

    /// 终止指定进程号的进程。
    ///
    /// 只设置 killed 标志；SLEEPING 的目标转为 RUNNABLE，
    /// 真正的退出发生在它下一次返回用户态之前。
    pub fn kill(&self, pid: usize) -> Result<(), ()> {
        for i in 0..NPROC {
            let mut guard = self.table[i].excl.lock();
            if guard.state != ProcState::UNUSED && guard.pid == pid {
                self.table[i].killed.store(true, Ordering::Relaxed);
                if guard.state == ProcState::SLEEPING {
                    guard.state = ProcState::RUNNABLE;
                }
                return Ok(());
            }
        }

        Err(())
    }

    /// 页帧淘汰的回调：在所有进程的地址空间里把引用页帧
    /// ppn 的虚拟页标记为已换出到 slot。
    ///
    /// # 安全性
    /// 遍历期间不得有其他执行流修改任何进程的地址空间；
    /// 淘汰路径串行执行，满足这一前提。
    pub unsafe fn mark_swapped(&self, ppn: usize, slot: usize) -> usize {
        let mut count = 0;
        for p in self.table.iter() {
            let pdata = p.data.get().as_mut().unwrap();
            count += pdata.vspace.mark_swapped(ppn, slot);
        }
        count
    }

    /// 换入的回调：把所有进程中引用交换槽 slot 的虚拟页
    /// 改指页帧 ppn。
    pub unsafe fn update_cow_refs(&self, ppn: usize, slot: usize) -> usize {
        let mut count = 0;
        for p in self.table.iter() {
            let pdata = p.data.get().as_mut().unwrap();
            count += pdata.vspace.update_cow_refs(ppn, slot);
        }
        count
    }

    /// 向控制台打印进程列表（Ctrl-P 调试用）。
    pub unsafe fn dump(&self) {
        println!();
        for p in self.table.iter() {
            let guard = p.excl.lock();
            if guard.state == ProcState::UNUSED {
                continue;
            }
            let pid = guard.pid;
            let state = match guard.state {
                ProcState::UNUSED => "unused",
                ProcState::EMBRYO => "embryo",
                ProcState::SLEEPING => "sleep ",
                ProcState::RUNNABLE => "runble",
                ProcState::RUNNING => "run   ",
                ProcState::ZOMBIE => "zombie",
            };
            drop(guard);
            let name = p.data.get().as_ref().unwrap().name_str();
            println!("{} {} {}", pid, state, name);
        }
    }
}

/// fork 出的子进程第一次被调度时从这里开始执行。
///
/// 安全性说明 1：文件系统初始化必须在进程上下文里进行
/// （磁盘 IO 会休眠），因此放在第一个进程首次运行时。
/// 安全性说明 2：此函数不可重入，中断处理程序不得调用。
unsafe fn fork_ret() -> ! {
    static mut INITIALIZED: bool = false;

    // 调度器切过来时仍持有本进程的排他锁
    CPU_MANAGER.my_proc().excl.unlock();

    if !INITIALIZED {
        INITIALIZED = true;
        fs::init(ROOTDEV);
    }

    user_trap_ret();
}
