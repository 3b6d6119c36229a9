//! 定义系统内核的输出方法

use core::fmt;
use core::panic;
use core::sync::atomic::Ordering;

use crate::driver::{console, PANICKED};
use crate::spinlock::SpinLock;

/// 零大小类型的打印结构体，用于在多个 CPU 之间对打印操作排序。
struct Print;

impl Print {
    fn print(&self, c: u8) {
        console::putc(c);
    }
}

impl fmt::Write for Print {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.print(byte);
        }
        Ok(())
    }
}

/// 核心打印函数（被宏调用）。
///
/// 正常状态下用自旋锁保证多核输出不交叠；
/// 一旦有处理器 panic，放弃加锁直接输出，避免把诊断信息卡死。
pub fn _print(args: fmt::Arguments<'_>) {
    use fmt::Write;
    static PRINT: SpinLock<()> = SpinLock::new((), "print");

    if PANICKED.load(Ordering::Relaxed) {
        // no need to lock
        Print.write_fmt(args).expect("_print: error");
    } else {
        let guard = PRINT.lock();
        Print.write_fmt(args).expect("_print: error");
        drop(guard);
    }
}

/// 在终端输出一串字符
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::printf::_print(format_args!($($arg)*));
    };
}

/// 在终端输出一行字符
#[macro_export]
macro_rules! println {
    () => {$crate::print!("\n")};
    ($fmt:expr) => {$crate::print!(concat!($fmt, "\n"))};
    ($fmt:expr, $($arg:tt)*) => {
        $crate::print!(concat!($fmt, "\n"), $($arg)*)
    };
}

/// 全局 panic 处理：打印诊断信息，置位 PANICKED 后挂起。
#[panic_handler]
fn panic(info: &panic::PanicInfo<'_>) -> ! {
    crate::println!("{}", info);
    PANICKED.store(true, Ordering::Relaxed);
    loop {}
}

#[no_mangle]
fn abort() -> ! {
    panic!("abort");
}
