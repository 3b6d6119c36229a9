//! 内存管理模块

use alloc::boxed::Box;
use core::{alloc::AllocError, ptr};

use crate::consts::{KERNBASE, PGSIZE};
use crate::process::CPU_MANAGER;

pub use kalloc::{KernelHeap, KERNEL_HEAP};
pub use kmem::KMEM;
pub use pagetable::{kvm_init, kvm_install, PageTable, PteFlag};
pub use vspace::{VSpace, VR_CODE, VR_HEAP, VR_USTACK};

pub mod kalloc;
mod kmem;
mod list;
mod pagetable;
mod vspace;

/// 物理页帧分配接口，按页大小对齐从内核堆取整页内存。
///
/// 页表页、陷阱帧、内核栈、管道页这类内核自身使用的整页
/// 都经由该接口分配；用户数据页则走核心映射表（[`KMEM`]）。
pub trait RawPage: Sized {
    /// 分配一个清零页，返回页首指针。
    ///
    /// # 安全性
    /// 返回的指针必须用 `from_raw_and_drop` 释放，且只能释放一次。
    unsafe fn new_zeroed() -> *mut u8 {
        let boxed_page = Box::<Self>::new_zeroed().assume_init();
        Box::into_raw(boxed_page) as *mut u8
    }

    /// 同 `new_zeroed`，内存不足时返回错误而不是 panic。
    unsafe fn try_new_zeroed() -> Result<*mut u8, AllocError> {
        let boxed_page = Box::<Self>::try_new_zeroed()?.assume_init();
        Ok(Box::into_raw(boxed_page) as *mut u8)
    }

    /// 释放 `new_*` 分配的页。
    ///
    /// # 安全性
    /// raw 必须来自本 trait 的分配函数，释放后立即失效。
    unsafe fn from_raw_and_drop(raw: *mut u8) {
        drop(Box::from_raw(raw as *mut Self));
    }
}

/// 单页（4096 字节）内存。
#[repr(C, align(4096))]
pub struct RawSinglePage {
    data: [u8; PGSIZE],
}

impl RawPage for RawSinglePage {}

/// 连续四页内存，用作进程的内核栈。
#[repr(C, align(4096))]
pub struct RawQuadPage {
    data: [u8; PGSIZE * 4],
}

impl RawPage for RawQuadPage {}

/// 物理地址转内核虚拟地址。
#[inline]
pub fn p2v(pa: usize) -> usize {
    pa + KERNBASE
}

/// 内核虚拟地址转物理地址。
#[inline]
pub fn v2p(va: usize) -> usize {
    va - KERNBASE
}

/// 表示不同来源的地址，区分用户虚拟地址与内核指针。
///
/// 文件与设备层的读写统一接收 [`Address`]，
/// 把"复制到哪个地址空间"的判断集中到一处。
#[derive(Clone, Copy, Debug)]
pub enum Address {
    /// 用户空间虚拟地址，经当前进程的地址空间复制。
    Virtual(usize),
    /// 内核空间只读指针。
    Kernel(*const u8),
    /// 内核空间可写指针。
    KernelMut(*mut u8),
}

impl Address {
    /// 计算偏移 count 字节后的新地址。
    pub fn offset(self, count: usize) -> Self {
        debug_assert!(count < isize::MAX as usize);
        match self {
            Self::Virtual(p) => Self::Virtual(p + count),
            Self::Kernel(p) => Self::Kernel(unsafe { p.offset(count as isize) }),
            Self::KernelMut(p) => Self::KernelMut(unsafe { p.offset(count as isize) }),
        }
    }

    /// 从内核指针 src 向本地址复制 count 字节。
    ///
    /// 用户地址经当前进程的 vspace 写入（必要时换入页面、
    /// 拆解写时复制共享）；向只读内核指针写入是逻辑错误。
    pub fn copy_out(self, src: *const u8, count: usize) -> Result<(), ()> {
        match self {
            Self::Virtual(dst) => {
                let p = unsafe { CPU_MANAGER.my_proc() };
                p.data.get_mut().vspace.write_to_va(dst, src, count)
            }
            Self::Kernel(dst) => {
                panic!("cannot copy to a const pointer {:p}", dst)
            }
            Self::KernelMut(dst) => {
                unsafe {
                    ptr::copy(src, dst, count);
                }
                Ok(())
            }
        }
    }

    /// 从本地址向内核指针 dst 复制 count 字节。
    pub fn copy_in(self, dst: *mut u8, count: usize) -> Result<(), ()> {
        match self {
            Self::Virtual(src) => {
                let p = unsafe { CPU_MANAGER.my_proc() };
                p.data.get_mut().vspace.read_from_va(src, dst, count)
            }
            Self::Kernel(src) => {
                unsafe {
                    ptr::copy(src, dst, count);
                }
                Ok(())
            }
            Self::KernelMut(src) => {
                unsafe {
                    ptr::copy(src, dst, count);
                }
                Ok(())
            }
        }
    }
}

/// 向上取整到页边界。
#[inline]
pub fn pg_round_up(address: usize) -> usize {
    (address + (PGSIZE - 1)) & !(PGSIZE - 1)
}

/// 向下取整到页边界。
#[inline]
pub fn pg_round_down(address: usize) -> usize {
    address & !(PGSIZE - 1)
}

#[cfg(feature = "unit_test")]
pub mod tests {
    /// 固定种子下随机淘汰序列应当可复现。
    pub fn rand_sequence() {
        super::kmem::tests::rand_sequence();
    }

    /// 帧分配 / 释放后核心映射表的计数应当平衡。
    pub fn alloc_free() {
        super::kmem::tests::alloc_free();
    }
}
