//! 超级块操作

use core::mem::{self, MaybeUninit};
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::consts::fs::BPB;

use super::{BufData, BCACHE};

/// 全局超级块实例。
///
/// # 安全性
/// - 静态可变变量，必须在首个进程的上下文中初始化一次
/// - 初始化完成后只读，通过原子标志同步
pub static mut SUPER_BLOCK: SuperBlock = SuperBlock::uninit();

/// 内存中的超级块副本。
///
/// mkfs 在格式化时写好磁盘布局，这里在启动时读入一次，
/// 此后所有对布局的查询（位图、inode 文件、交换区、日志区
/// 的起始位置）都走这份拷贝。
#[derive(Debug)]
pub struct SuperBlock {
    data: MaybeUninit<RawSuperBlock>,
    initialized: AtomicBool,
}

unsafe impl Sync for SuperBlock {}

impl SuperBlock {
    const fn uninit() -> Self {
        Self {
            data: MaybeUninit::uninit(),
            initialized: AtomicBool::new(false),
        }
    }

    /// 从磁盘块 1 读入超级块。
    ///
    /// # 安全性
    /// 必须由首个常规进程单独调用，dev 必须指向已格式化的磁盘。
    pub unsafe fn init(&mut self, dev: u32) {
        debug_assert_eq!(mem::align_of::<BufData>() % mem::align_of::<RawSuperBlock>(), 0);
        if self.initialized.load(Ordering::Relaxed) {
            return;
        }

        let buf = BCACHE.bread(dev, 1);
        ptr::copy_nonoverlapping(
            buf.raw_data() as *const RawSuperBlock,
            self.data.as_mut_ptr(),
            1,
        );
        self.initialized.store(true, Ordering::SeqCst);
        drop(buf);

        #[cfg(feature = "verbose_init_info")]
        println!("super block data: {:?}", self.data.as_ptr().as_ref().unwrap());
    }

    fn read(&self) -> &RawSuperBlock {
        debug_assert!(self.initialized.load(Ordering::Relaxed));
        unsafe { self.data.as_ptr().as_ref().unwrap() }
    }

    /// 文件系统的总块数。
    pub fn size(&self) -> u32 {
        self.read().size
    }

    /// 空闲位图区的起始块号。
    pub fn bmap_start(&self) -> u32 {
        self.read().bmapstart
    }

    /// inode 文件的起始块号。
    pub fn inode_start(&self) -> u32 {
        self.read().inodestart
    }

    /// 交换区的起始块号。
    pub fn swap_start(&self) -> u32 {
        self.read().swapstart
    }

    /// 日志区的起始块号。
    pub fn log_start(&self) -> u32 {
        self.read().logstart
    }

    /// 管理块 blockno 的位图块号。
    pub fn bitmap_blockno(&self, blockno: u32) -> u32 {
        (blockno / BPB) + self.read().bmapstart
    }
}

/// 磁盘上的超级块，格式化后不再改变。
///
/// 磁盘布局依次是：
/// 引导块 | 超级块 | 空闲位图 | inode 文件与数据块 | 交换区 | 日志区
#[repr(C)]
#[derive(Debug)]
struct RawSuperBlock {
    /// 文件系统映像的总块数。
    size: u32,
    /// 数据块数量。
    nblocks: u32,
    /// 第一个空闲位图块的块号。
    bmapstart: u32,
    /// inode 文件的起始块号。
    inodestart: u32,
    /// 交换区的起始块号。
    swapstart: u32,
    /// 日志区的起始块号。
    logstart: u32,
}
