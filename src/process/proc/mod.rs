//! 进程状态管理，包含 fork、sleep 等多种进程状态操作

use array_macro::array;

use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::consts::fs::NOFILE;
use crate::consts::{
    DPL_USER, KSTACKSIZE, SEG_UCODE, SEG_UDATA, USERTEXT, USERTOP,
};
use crate::fs::File;
use crate::mm::VSpace;
use crate::register::rflags::FL_IF;
use crate::spinlock::{SpinLock, SpinLockGuard};

use self::syscall::Syscall;
use super::cpu::CPU_MANAGER;
use super::{fork_ret, Context, TrapFrame, PROC_MANAGER};

mod elf;
mod syscall;

/// 进程的生命周期状态。
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ProcState {
    /// 槽位空闲。
    UNUSED,
    /// 已被占用，内核运行环境正在搭建。
    EMBRYO,
    /// 在某个通道上休眠。
    SLEEPING,
    /// 就绪，等待调度器挑选。
    RUNNABLE,
    /// 正在某个处理器上运行。
    RUNNING,
    /// 已退出，等待父进程收割。
    ZOMBIE,
}

/// 进程的排他信息，由进程的排他锁保护。
pub struct ProcExcl {
    /// 当前状态。
    pub state: ProcState,
    /// 休眠所在的通道。
    pub channel: usize,
    /// 进程号。
    pub pid: usize,
}

impl ProcExcl {
    const fn new() -> Self {
        Self {
            state: ProcState::UNUSED,
            channel: 0,
            pid: 0,
        }
    }

    /// 把槽位还原为未占用状态。
    pub fn cleanup(&mut self) {
        self.pid = 0;
        self.channel = 0;
        self.state = ProcState::UNUSED;
    }
}

/// 进程的私有数据。
///
/// 只在进程自己运行时访问，或在持有其排他锁的初始化 /
/// 收割路径上访问（例如 fork 填充子进程、wait 释放资源）。
pub struct ProcData {
    /// 内核栈的起始地址（低端）。
    kstack: usize,
    /// 切换上下文。
    context: Context,
    /// 进程名，调试用。
    name: [u8; 16],
    /// 打开文件表，下标即文件描述符。
    open_files: [Option<Arc<File>>; NOFILE],
    /// 陷阱帧页。
    pub tf: *mut TrapFrame,
    /// 用户地址空间。
    pub vspace: VSpace,
}

impl ProcData {
    const fn new() -> Self {
        Self {
            kstack: 0,
            context: Context::new(),
            name: [0; 16],
            open_files: array![_ => None; NOFILE],
            tf: ptr::null_mut(),
            vspace: VSpace::new(),
        }
    }

    pub fn set_kstack(&mut self, kstack: usize) {
        self.kstack = kstack;
    }

    /// 把上下文设置为从 fork_ret 开始执行。
    ///
    /// 陷阱帧固定放在内核栈顶端，trapret 从那里恢复用户现场；
    /// 栈指针落在陷阱帧之下，fork_ret 在其上运行。
    pub fn init_context(&mut self) {
        let tf = self.kstack + KSTACKSIZE - mem::size_of::<TrapFrame>();
        self.tf = tf as *mut TrapFrame;
        unsafe {
            ptr::write_bytes(self.tf, 0, 1);
        }
        self.context.clear();
        self.context.set_rip(fork_ret as *const () as usize);
        self.context.set_rsp(tf);
    }

    pub fn get_context(&mut self) -> *mut Context {
        &mut self.context as *mut _
    }

    /// 进程名（打印用）。
    pub fn name_str(&self) -> &str {
        let len = self.name.iter().position(|c| *c == 0).unwrap_or(16);
        core::str::from_utf8(&self.name[..len]).unwrap_or("?")
    }

    /// 向用户地址空间写 count 字节。
    #[inline]
    pub fn copy_out(&mut self, src: *const u8, dst: usize, count: usize) -> Result<(), ()> {
        self.vspace.write_to_va(dst, src, count)
    }

    /// 从用户地址空间读 count 字节。
    #[inline]
    pub fn copy_in(&mut self, src: usize, dst: *mut u8, count: usize) -> Result<(), ()> {
        self.vspace.read_from_va(src, dst, count)
    }

    /// 分配最小的空闲文件描述符。
    fn alloc_fd(&mut self) -> Option<usize> {
        self.open_files
            .iter()
            .enumerate()
            .find(|(_, f)| f.is_none())
            .map(|(i, _)| i)
    }

    /// 分配一对文件描述符（管道用）。
    fn alloc_fd2(&mut self) -> Option<(usize, usize)> {
        let mut iter = self
            .open_files
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_none())
            .take(2)
            .map(|(i, _)| i);
        let fd1 = iter.next()?;
        let fd2 = iter.next()?;
        Some((fd1, fd2))
    }

    /// 释放用户地址空间（内核栈与其上的陷阱帧位常驻复用）。
    pub fn cleanup(&mut self) {
        self.name[0] = 0;
        self.tf = ptr::null_mut();
        self.vspace.cleanup();
    }

    /// 关闭全部打开文件。
    pub fn close_files(&mut self) {
        for f in self.open_files.iter_mut() {
            drop(f.take());
        }
    }
}

/// 进程实体：排他信息、私有数据与终止标志。
pub struct Proc {
    /// 在进程表中的下标。
    pub index: usize,
    pub excl: SpinLock<ProcExcl>,
    pub data: UnsafeCell<ProcData>,
    /// 被 kill 后置位，下次返回用户态前退出。
    pub killed: AtomicBool,
}

impl Proc {
    pub const fn new(index: usize) -> Self {
        Self {
            index,
            excl: SpinLock::new(ProcExcl::new(), "ProcExcl"),
            data: UnsafeCell::new(ProcData::new()),
            killed: AtomicBool::new(false),
        }
    }

    /// 当前进程号。
    pub fn pid(&self) -> usize {
        self.excl.lock().pid
    }

    /// 初始化第一个用户进程。
    ///
    /// 把 initcode 装进代码区、保留一页用户栈，
    /// 陷阱帧设置成在用户态从 initcode 的起点开始执行。
    pub fn user_init(&mut self) {
        let pd = self.data.get_mut();

        pd.vspace.init_code(USERTEXT, &INITCODE);
        pd.vspace.init_stack().expect("user stack");

        let tf = unsafe { pd.tf.as_mut().unwrap() };
        tf.rip = USERTEXT;
        tf.rsp = USERTOP;
        tf.cs = ((SEG_UCODE << 3) | DPL_USER) as usize;
        tf.ss = ((SEG_UDATA << 3) | DPL_USER) as usize;
        tf.rflags = FL_IF;

        let init_name = b"initcode\0";
        unsafe {
            ptr::copy_nonoverlapping(init_name.as_ptr(), pd.name.as_mut_ptr(), init_name.len());
        }
    }

    /// killed 标志已置位时立即退出。
    pub fn check_abandon(&mut self) {
        if self.killed.load(Ordering::Relaxed) {
            unsafe {
                PROC_MANAGER.exiting(self.index);
            }
        }
    }

    /// 标记并立即退出当前进程。
    pub fn abandon(&mut self) -> ! {
        self.killed.store(true, Ordering::Relaxed);
        unsafe {
            PROC_MANAGER.exiting(self.index);
        }
    }

    /// 处理当前进程发起的系统调用。
    ///
    /// 系统调用编号取自 rax，按编号分发；
    /// 结果写回 rax，错误统一映射为 -1。
    pub fn syscall(&mut self) {
        crate::register::rflags::intr_on();

        let tf = unsafe { self.data.get_mut().tf.as_mut().unwrap() };
        let num = tf.rax;
        let sys_result = match num {
            1 => self.sys_fork(),
            2 => self.sys_exit(),
            3 => self.sys_wait(),
            4 => self.sys_pipe(),
            5 => self.sys_read(),
            6 => self.sys_kill(),
            7 => self.sys_exec(),
            8 => self.sys_fstat(),
            9 => self.sys_chdir(),
            10 => self.sys_dup(),
            11 => self.sys_getpid(),
            12 => self.sys_sbrk(),
            13 => self.sys_sleep(),
            14 => self.sys_uptime(),
            15 => self.sys_open(),
            16 => self.sys_write(),
            17 => self.sys_close(),
            18 => self.sys_crashn(),
            _ => {
                panic!("unknown syscall num: {}", num);
            }
        };
        let tf = unsafe { self.data.get_mut().tf.as_mut().unwrap() };
        tf.rax = match sys_result {
            Ok(ret) => ret,
            Err(()) => -1isize as usize,
        };
    }

    /// 主动让出处理器。
    pub fn yielding(&mut self) {
        let mut guard = self.excl.lock();
        assert_eq!(guard.state, ProcState::RUNNING);
        guard.state = ProcState::RUNNABLE;
        guard = unsafe {
            CPU_MANAGER
                .my_cpu_mut()
                .sched(guard, self.data.get_mut().get_context())
        };
        drop(guard);
    }

    /// 原子地释放 guard 并在 channel 上休眠。
    ///
    /// # 流程解释
    /// 先取得自己的排他锁再放开传入的锁：唤醒方修改状态
    /// 同样要先拿排他锁，因此不会错过任何一次唤醒。
    /// 被唤醒后本函数不重新获取传入的锁，由调用者自理。
    pub fn sleep<T>(&self, channel: usize, guard: SpinLockGuard<'_, T>) {
        let mut excl_guard = self.excl.lock();
        drop(guard);

        excl_guard.channel = channel;
        excl_guard.state = ProcState::SLEEPING;

        unsafe {
            let c = CPU_MANAGER.my_cpu_mut();
            excl_guard = c.sched(excl_guard, &mut (*self.data.get()).context as *mut _);
        }

        excl_guard.channel = 0;
        drop(excl_guard);
    }

    /// 创建当前进程的子进程。
    ///
    /// # 流程解释
    /// 1. 申请一个空槽位并初始化其内核环境；
    /// 2. 以写时复制共享全部用户内存，双方的可写页都降为
    ///    只读 + cow，随后重装自己的页表冲刷旧的可写映射；
    /// 3. 复制陷阱帧并把子进程的 rax 清零（子进程观察到
    ///    fork 返回 0）；
    /// 4. 共享打开文件（引用计数加一）、复制进程名；
    /// 5. 登记父子关系，置子进程为 RUNNABLE。
    ///
    /// 任何失败路径都把半成品子进程清理回 UNUSED。
    fn fork(&mut self) -> Result<usize, ()> {
        let pdata = self.data.get_mut();
        let child = unsafe { PROC_MANAGER.alloc_proc().ok_or(())? };
        let cdata = unsafe { child.data.get().as_mut().unwrap() };

        // 写时复制共享用户内存
        if cdata.vspace.copy_cow(&mut pdata.vspace).is_err() {
            cdata.cleanup();
            child.excl.lock().cleanup();
            return Err(());
        }
        pdata.vspace.install();

        // 克隆陷阱帧，子进程的返回值为 0
        unsafe {
            ptr::copy_nonoverlapping(pdata.tf, cdata.tf, 1);
            cdata.tf.as_mut().unwrap().rax = 0;
        }

        // 共享打开文件，复制进程名
        cdata.open_files.clone_from(&pdata.open_files);
        cdata.name.copy_from_slice(&pdata.name);

        let cpid = child.excl.lock().pid;

        unsafe {
            PROC_MANAGER.set_parent(child.index, self.index);
        }

        let mut cexcl = child.excl.lock();
        cexcl.state = ProcState::RUNNABLE;
        drop(cexcl);

        Ok(cpid)
    }
}

impl Proc {
    /// 第 n 个系统调用参数的原始值（依次在 rdi/rsi/rdx/rcx）。
    fn arg_raw(&self, n: usize) -> usize {
        let tf = unsafe { self.data.get().as_ref().unwrap().tf.as_ref().unwrap() };
        match n {
            0 => tf.rdi,
            1 => tf.rsi,
            2 => tf.rdx,
            3 => tf.rcx,
            _ => panic!("arg_raw: n {} out of range", n),
        }
    }

    /// 取 32 位整数参数。
    #[inline]
    fn arg_i32(&self, n: usize) -> i32 {
        self.arg_raw(n) as i32
    }

    /// 取用户虚拟地址参数（可能为空指针，使用前须经复制检查）。
    #[inline]
    fn arg_addr(&self, n: usize) -> usize {
        self.arg_raw(n)
    }

    /// 取文件描述符参数并验证其已打开。
    #[inline]
    fn arg_fd(&mut self, n: usize) -> Result<usize, ()> {
        let fd = self.arg_raw(n);
        if fd >= NOFILE || self.data.get_mut().open_files[fd].is_none() {
            Err(())
        } else {
            Ok(fd)
        }
    }

    /// 把第 n 个参数当作用户字符串指针，整串复制进 buf。
    fn arg_str(&mut self, n: usize, buf: &mut [u8]) -> Result<(), &'static str> {
        let addr = self.arg_raw(n);
        self.data.get_mut().vspace.copy_in_str(addr, buf)?;
        Ok(())
    }

    /// 从用户地址读出一个 usize。
    fn fetch_addr(&mut self, addr: usize) -> Result<usize, &'static str> {
        let mut ret: usize = 0;
        match self.data.get_mut().copy_in(
            addr,
            &mut ret as *mut usize as *mut u8,
            mem::size_of::<usize>(),
        ) {
            Ok(_) => Ok(ret),
            Err(_) => Err("fetch_addr: copy_in error"),
        }
    }

    /// 从用户地址读出一个以空字符结尾的字符串。
    fn fetch_str(&mut self, addr: usize, dst: &mut [u8]) -> Result<(), &'static str> {
        self.data.get_mut().vspace.copy_in_str(addr, dst)
    }
}

/// 第一个用户程序：调用 exec("/init") ，失败则退出。
/// 装载在 USERTEXT 处，其中内嵌了路径与 argv 数组。
static INITCODE: [u8; 64] = [
    0x48, 0xbf, 0x2a, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, // movabs rdi, 0x1002a
    0x48, 0xbe, 0x30, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, // movabs rsi, 0x10030
    0x48, 0xc7, 0xc0, 0x07, 0x00, 0x00, 0x00, //                   mov rax, SYS_exec
    0xcd, 0x40, //                                                 int 0x40
    0x48, 0xc7, 0xc0, 0x02, 0x00, 0x00, 0x00, //                   mov rax, SYS_exit
    0xcd, 0x40, //                                                 int 0x40
    0xeb, 0xf5, //                                                 jmp exit
    0x00, 0x00, //                                                 （对齐）
    0x2f, 0x69, 0x6e, 0x69, 0x74, 0x00, //                         "/init\0"
    0x2a, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, //             argv[0] = 0x1002a
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //             argv[1] = 0
];
