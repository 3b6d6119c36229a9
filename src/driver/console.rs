//! 控制台驱动，负责用户输入输出与行编辑

use core::num::Wrapping;
use core::sync::atomic::Ordering;

use crate::consts::driver::*;
use crate::mm::Address;
use crate::process::{CPU_MANAGER, PROC_MANAGER};
use crate::spinlock::SpinLock;

use super::uart;

/// 初始化控制台驱动。
///
/// # 安全性
/// 必须仅在系统启动时调用一次。
pub unsafe fn init() {
    uart::init();
}

/// 从控制台读取数据（设备表的 read 入口）。
///
/// # 功能说明
/// 从行缓冲区读取最多 tot 字节到目标地址：
/// 缓冲区为空时阻塞当前进程，遇到换行或文件结束符提前返回。
///
/// # 返回值
/// - `Ok(n)`: 实际读取的字节数
/// - `Err(())`: 等待期间进程被终止
pub(super) fn read(mut dst: Address, tot: u32) -> Result<u32, ()> {
    let mut console = CONSOLE.lock();

    let mut left = tot;
    while left > 0 {
        // 行缓冲区没有完整输入时等待控制台中断写入
        while console.ri == console.wi {
            let p = unsafe { CPU_MANAGER.my_proc() };
            if p.killed.load(Ordering::Relaxed) {
                return Err(());
            }
            p.sleep(&console.ri as *const Wrapping<_> as usize, console);
            console = CONSOLE.lock();
        }

        let c = console.buf[console.ri.0 % CONSOLE_BUF];
        console.ri += Wrapping(1);

        // 文件结束符，提前返回
        if c == CTRL_EOT {
            if left < tot {
                console.ri -= Wrapping(1);
            }
            break;
        }

        if dst.copy_out(&c as *const u8, 1).is_err() {
            break;
        }
        dst = dst.offset(1);
        left -= 1;

        if c == CTRL_LF {
            break;
        }
    }

    Ok(tot - left)
}

/// 向控制台写入数据（设备表的 write 入口）。
pub(super) fn write(mut src: Address, tot: u32) -> Result<u32, ()> {
    for i in 0..tot {
        let mut c = 0u8;
        if src.copy_in(&mut c as *mut u8, 1).is_err() {
            return Ok(i);
        }
        uart::UART.putc(c);
        src = src.offset(1);
    }
    Ok(tot)
}

/// 输出单个字符，退格展开为"退格-空格-退格"以擦除屏幕上的字符。
pub(crate) fn putc(c: u8) {
    if c == CTRL_BS {
        uart::putc_sync(CTRL_BS);
        uart::putc_sync(b' ');
        uart::putc_sync(CTRL_BS);
    } else {
        uart::putc_sync(c);
    }
}

/// 控制台中断处理。
///
/// # 功能说明
/// 处理串口 / 键盘送来的字符：Ctrl-P 打印进程表，
/// Ctrl-U 删除整行，退格删除单个字符，
/// 其余字符回显并进入行缓冲区；
/// 凑齐一行（或缓冲区满）时唤醒等待输入的进程。
pub(crate) fn intr(c: u8) {
    let mut console = CONSOLE.lock();

    match c {
        CTRL_PRINT_PROCESS => {
            unsafe { PROC_MANAGER.dump() };
        }
        CTRL_BS_LINE => {
            while console.ei != console.wi
                && console.buf[(console.ei - Wrapping(1)).0 % CONSOLE_BUF] != CTRL_LF
            {
                console.ei -= Wrapping(1);
                putc(CTRL_BS);
            }
        }
        CTRL_BS | CTRL_DEL => {
            if console.ei != console.wi {
                console.ei -= Wrapping(1);
                putc(CTRL_BS);
            }
        }
        _ => {
            // 回显
            if c != 0 && (console.ei - console.ri).0 < CONSOLE_BUF {
                let c = if c == CTRL_CR { CTRL_LF } else { c };
                putc(c);
                let ei = console.ei.0 % CONSOLE_BUF;
                console.buf[ei] = c;
                console.ei += Wrapping(1);
                if c == CTRL_LF || c == CTRL_EOT || (console.ei - console.ri).0 == CONSOLE_BUF {
                    console.wi = console.ei;
                    unsafe {
                        PROC_MANAGER.wakeup(&console.ri as *const Wrapping<_> as usize);
                    }
                }
            }
        }
    }
}

static CONSOLE: SpinLock<Console> = SpinLock::new(
    Console {
        buf: [0; CONSOLE_BUF],
        ri: Wrapping(0),
        wi: Wrapping(0),
        ei: Wrapping(0),
    },
    "console",
);

struct Console {
    buf: [u8; CONSOLE_BUF],
    // 读索引
    ri: Wrapping<usize>,
    // 写索引
    wi: Wrapping<usize>,
    // 编辑索引
    ei: Wrapping<usize>,
}
