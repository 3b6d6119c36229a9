//! 内核主入口，完成各处理器的初始化流程

use core::sync::atomic::{AtomicBool, Ordering};

use crate::driver::{console, ide::DISK};
use crate::fs::BCACHE;
use crate::mm::{kvm_init, kvm_install, KERNEL_HEAP, KMEM};
use crate::process::{CpuManager, CPU_MANAGER, PROC_MANAGER};

/// 主处理器是否已完成全局初始化。
/// 其余处理器自旋等待它置位后再各自上线。
static STARTED: AtomicBool = AtomicBool::new(false);

/// 内核主入口，引导代码在每个处理器上调用。
///
/// # 流程解释
/// 0 号处理器串行完成全部全局初始化：控制台、内核堆、
/// 内核页表、用户页帧池、进程表的内核栈、缓冲区缓存、
/// 磁盘与第一个用户进程；文件系统的初始化（需要磁盘 IO）
/// 推迟到第一个进程的首次运行。其余处理器等到 STARTED
/// 置位后装载内核页表即可。所有处理器最终都进入调度器。
///
/// # 安全性
/// 由引导代码在正确设置栈与长模式后调用，每个处理器一次。
#[no_mangle]
pub unsafe extern "C" fn kernel_main() -> ! {
    let cpuid = CpuManager::cpu_id();

    if cpuid == 0 {
        console::init();
        println!();
        println!("xk-rust kernel is booting");
        println!();
        KERNEL_HEAP.kinit();
        kvm_init(); // 内核页表
        KMEM.init(); // 用户页帧池
        PROC_MANAGER.proc_init(); // 进程表的内核栈
        BCACHE.binit(); // 缓冲区缓存
        DISK.lock().init(); // 磁盘
        PROC_MANAGER.user_init(); // 第一个用户进程

        STARTED.store(true, Ordering::SeqCst);
    } else {
        while !STARTED.load(Ordering::SeqCst) {}

        println!("cpu {} starting", cpuid);
        kvm_install(); // 装载内核页表
    }

    #[cfg(feature = "unit_test")]
    crate::test_main_entry();

    CPU_MANAGER.scheduler();
}
