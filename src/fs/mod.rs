//! 文件系统模块

mod bio;
mod block;
mod file;
mod inode;
mod log;
mod superblock;

pub use bio::{Buf, BCACHE};
pub use block::{swapread, swapwrite};
pub use file::{File, Pipe};
pub use inode::{FileStat, Inode, InodeData, InodeType, ICACHE};
pub use log::LOG;

use bio::BufData;
use inode::icheck;
use superblock::SUPER_BLOCK;

/// 初始化文件系统：读入超级块、重放日志、装载 inode 文件。
///
/// 日志恢复必须先于任何 inode 读取，否则内存里可能缓存到
/// 将被重放覆盖的陈旧块。
///
/// # 安全性
/// 必须在首个进程的上下文中调用一次（磁盘 IO 需要休眠）。
pub unsafe fn init(dev: u32) {
    SUPER_BLOCK.init(dev);
    LOG.init(dev);
    ICACHE.init(dev);
    icheck();
    println!("file system: setup done");
}

#[cfg(feature = "unit_test")]
pub mod tests {
    /// 磁盘结构的布局约束。
    pub fn layout() {
        super::inode::tests::layout();
    }

    /// 路径分量切分。
    pub fn skip_path_elems() {
        super::inode::tests::skip_path_elems();
    }

    /// 管道环形缓冲区算术。
    pub fn pipe_ring() {
        super::file::pipe::tests::pipe_ring();
    }

    /// 位图字扫描。
    pub fn bitmap_words() {
        super::block::tests::bitmap_words();
    }
}
