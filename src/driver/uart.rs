//! 16550 串口驱动（COM1）

use crate::consts::driver::UART_COM1;
use crate::register::port::{inb, outb};

use super::console;

/// 接收缓冲 / 发送保持寄存器。
const RBR: u16 = 0;
const THR: u16 = 0;
/// 中断使能寄存器。
const IER: u16 = 1;
/// FIFO 控制寄存器。
const FCR: u16 = 2;
/// 线路控制寄存器。
const LCR: u16 = 3;
/// 线路状态寄存器。
const LSR: u16 = 5;

pub static UART: Uart = Uart;

pub struct Uart;

/// 初始化串口：设定波特率与帧格式，打开接收中断。
///
/// # 安全性
/// 必须仅在系统启动时调用一次。
pub unsafe fn init() {
    // 关闭中断
    outb(UART_COM1 + IER, 0x00);
    // 进入波特率设定模式，115200 对应除数 1
    outb(UART_COM1 + LCR, 0x80);
    outb(UART_COM1 + 0, 0x01);
    outb(UART_COM1 + 1, 0x00);
    // 8 数据位、无校验、1 停止位
    outb(UART_COM1 + LCR, 0x03);
    // 打开并清空 FIFO
    outb(UART_COM1 + FCR, 0x07);
    // 打开接收中断
    outb(UART_COM1 + IER, 0x01);
}

/// 同步输出一个字符，忙等发送保持寄存器空闲。
pub fn putc_sync(c: u8) {
    unsafe {
        while inb(UART_COM1 + LSR) & 0x20 == 0 {}
        outb(UART_COM1 + THR, c);
    }
}

/// 取走一个已到达的输入字符。
fn getc() -> Option<u8> {
    unsafe {
        if inb(UART_COM1 + LSR) & 0x01 != 0 {
            Some(inb(UART_COM1 + RBR))
        } else {
            None
        }
    }
}

impl Uart {
    /// 输出一个字符。
    pub fn putc(&self, c: u8) {
        putc_sync(c);
    }

    /// 串口中断处理：把到达的字符全部交给控制台。
    pub fn intr(&self) {
        while let Some(c) = getc() {
            console::intr(c);
        }
    }
}
