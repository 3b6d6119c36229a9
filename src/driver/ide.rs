//! IDE 磁盘驱动，提供同步的 512 字节块读写

use crate::consts::driver::IDE_BASE;
use crate::consts::fs::BSIZE;
use crate::fs::Buf;
use crate::register::port::{inb, insl, outb, outsl};
use crate::spinlock::SpinLock;

/// 全局磁盘实例。
/// 缓冲区缓存的 bread / bwrite 最终都落到这里；
/// 传输以轮询方式同步完成，调用返回即数据就绪 / 落盘。
pub static DISK: SpinLock<Ide> = SpinLock::new(Ide::new(), "ide");

/// IDE 状态位。
const IDE_BSY: u8 = 0x80;
const IDE_DRDY: u8 = 0x40;

const CMD_READ: u8 = 0x20;
const CMD_WRITE: u8 = 0x30;

pub struct Ide;

impl Ide {
    const fn new() -> Self {
        Self
    }

    /// 选中主盘并等待其就绪。
    ///
    /// # 安全性
    /// 必须仅在系统启动时调用一次。
    pub unsafe fn init(&mut self) {
        outb(IDE_BASE + 6, 0xe0);
        wait_ready();
        println!("ide: disk ready");
    }

    /// 磁盘中断处理。
    /// 传输以轮询完成，这里只需应答中断本身。
    pub fn intr(&mut self) {}
}

impl SpinLock<Ide> {
    /// 对 buf 指向的磁盘块做一次同步传输。
    ///
    /// # 流程解释
    /// 以 LBA28 编址发出单扇区命令（块大小与扇区大小一致），
    /// 写传输在设备请求数据时灌入 128 个 32 位字，
    /// 读传输在设备就绪后取出同样多的数据。
    ///
    /// # 参数
    /// - `buf`: 目标缓冲块，携带块号与数据区
    /// - `write`: true 表示把缓冲区写入磁盘
    pub fn rw(&self, buf: &mut Buf<'_>, write: bool) {
        let guard = self.lock();

        let lba = buf.read_blockno() as usize;
        unsafe {
            wait_ready();
            outb(IDE_BASE + 2, 1);
            outb(IDE_BASE + 3, (lba & 0xff) as u8);
            outb(IDE_BASE + 4, ((lba >> 8) & 0xff) as u8);
            outb(IDE_BASE + 5, ((lba >> 16) & 0xff) as u8);
            outb(IDE_BASE + 6, 0xe0 | ((lba >> 24) & 0x0f) as u8);
            if write {
                outb(IDE_BASE + 7, CMD_WRITE);
                wait_ready();
                outsl(IDE_BASE, buf.raw_data() as *const u32, BSIZE / 4);
                wait_ready();
            } else {
                outb(IDE_BASE + 7, CMD_READ);
                wait_ready();
                insl(IDE_BASE, buf.raw_data_mut() as *mut u32, BSIZE / 4);
            }
        }

        drop(guard);
    }
}

/// 忙等磁盘退出 BUSY 且进入 READY 状态。
unsafe fn wait_ready() {
    loop {
        let status = inb(IDE_BASE + 7);
        if status & (IDE_BSY | IDE_DRDY) == IDE_DRDY {
            break;
        }
    }
}
