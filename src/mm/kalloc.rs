//! 内核堆分配器，采用伙伴算法

use bit_field::BitField;

use core::alloc::{GlobalAlloc, Layout};
use core::cmp;
use core::mem::{size_of, MaybeUninit};
use core::ptr;

use super::list::List;
use crate::consts::{KERNBASE, KHEAPTOP, LEAF_SIZE, PGSIZE};
use crate::spinlock::SpinLock;

/// 全局内核堆分配器。
///
/// 通过 `#[global_allocator]` 接管内核中所有 `Box` / `Arc` / `Vec`
/// 的底层内存，管理从内核镜像末尾到 [`KHEAPTOP`] 的物理内存区间。
/// 其后的物理页帧归核心映射表（`mm::kmem`）管理，用作用户页。
///
/// 在调用 [`KernelHeap::kinit`] 之前不允许发生任何堆分配。
#[global_allocator]
pub static KERNEL_HEAP: KernelHeap = KernelHeap::uninit();

#[alloc_error_handler]
fn alloc_error(layout: Layout) -> ! {
    panic!("alloc error: {:?}", layout)
}

/// 内核堆的加锁封装。
pub struct KernelHeap(SpinLock<BuddySystem>);

impl KernelHeap {
    const fn uninit() -> Self {
        Self(SpinLock::new(BuddySystem::uninit(), "kernel heap"))
    }

    /// 初始化内核堆。
    ///
    /// 以链接脚本中 `_end` 符号标记的内核镜像末尾为起点，
    /// 把 [end, KHEAPTOP) 区间交给伙伴系统管理。
    ///
    /// # 安全性
    /// 只能在启动阶段由首个处理器调用一次，调用前不得使用堆。
    pub unsafe fn kinit(&self) {
        extern "C" {
            fn end();
        }
        let end = end as usize;
        let top = KHEAPTOP + KERNBASE;
        println!("kernel heap: available memory [{:#x}, {:#x})", end, top);
        self.0.lock().init(end, top);
        println!("kernel heap: init done");
    }
}

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.0.lock().alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.0.lock().dealloc(ptr, layout)
    }
}

/// 每个块大小等级的管理信息。
struct OrderInfo {
    /// 该等级的空闲块链表。
    free: List,
    /// 每个块一位：置位表示该块已被整块分出。
    alloc: MaybeUninit<*mut [u8]>,
    /// 每个块一位：置位表示该块被拆成了两个子块。
    /// 等级 0 不会被拆分，该字段对其无意义。
    split: MaybeUninit<*mut [u8]>,
}

/// 伙伴系统分配器。
///
/// 堆空间被划分成 `LEAF_SIZE << k` 大小的二的幂块，
/// 分配时逐级拆分、释放时与伙伴块合并。
/// 各等级的位图与空闲链表等元数据保存在被管理区间的开头。
pub struct BuddySystem {
    /// 管理区间的起始地址（按页对齐）。
    base: usize,
    /// 管理区间的实际结束地址。
    actual_end: usize,
    /// 块大小等级数，等级 k 的块大小为 `LEAF_SIZE << k`。
    nsizes: usize,
    initialized: bool,
    infos: MaybeUninit<*mut [OrderInfo]>,
}

unsafe impl Send for BuddySystem {}

impl BuddySystem {
    const fn uninit() -> Self {
        Self {
            base: 0,
            actual_end: 0,
            nsizes: 0,
            initialized: false,
            infos: MaybeUninit::uninit(),
        }
    }

    /// 初始化伙伴系统。
    ///
    /// # 流程解释
    /// 1. 对区间做页对齐，计算需要的等级数；
    /// 2. 在区间开头为每级的链表与位图划出元数据空间；
    /// 3. 把元数据区与对齐补齐区（2 的幂之外的部分）标记为已分配，
    ///    避免被合并或分出；
    /// 4. 把剩余空间按最大对齐块挂入各级空闲链表。
    ///
    /// # 安全性
    /// start / end 必须界定一块本分配器独占的可写内存；只能调用一次。
    unsafe fn init(&mut self, start: usize, end: usize) {
        if self.initialized {
            panic!("buddy system: init twice");
        }

        let mut cur = round_up(start, cmp::max(LEAF_SIZE, PGSIZE));
        self.base = cur;
        self.actual_end = round_down(end, cmp::max(LEAF_SIZE, PGSIZE));
        self.nsizes = log2((self.actual_end - cur) / LEAF_SIZE) + 1;
        if self.actual_end - cur > self.blk_size(self.max_order()) {
            self.nsizes += 1;
        }

        println!(
            "  buddy system: usable memory {:#x} bytes, {} orders",
            self.actual_end - self.base,
            self.nsizes
        );

        // 划出各等级的 OrderInfo
        let infos = carve_slice::<OrderInfo>(&mut cur, self.nsizes);
        self.infos.as_mut_ptr().write(infos);

        for k in 0..self.nsizes {
            let nblk = self.nblk(k);
            let alloc = carve_slice::<u8>(&mut cur, round_up(nblk, 8) / 8);
            let info = self.info_mut(k);
            info.free.init();
            info.alloc.as_mut_ptr().write(alloc);
        }
        for k in 1..self.nsizes {
            let nblk = self.nblk(k);
            let split = carve_slice::<u8>(&mut cur, round_up(nblk, 8) / 8);
            self.info_mut(k).split.as_mut_ptr().write(split);
        }
        cur = round_up(cur, LEAF_SIZE);

        // 元数据与区间外的补齐部分永远视作已分配
        let meta_end = cur;
        self.mark_allocated(self.base, meta_end);
        self.mark_allocated(self.actual_end, self.base + self.blk_size(self.max_order()));

        // 剩余空间挂入空闲链表
        let mut addr = meta_end;
        while addr < self.actual_end {
            let mut k = self.max_order();
            while k > 0
                && ((addr - self.base) % self.blk_size(k) != 0
                    || addr + self.blk_size(k) > self.actual_end)
            {
                k -= 1;
            }
            self.info_mut(k).free.push(addr);
            addr += self.blk_size(k);
        }

        self.initialized = true;
    }

    /// 分配满足 layout 的内存块，失败时返回空指针。
    unsafe fn alloc(&mut self, layout: Layout) -> *mut u8 {
        debug_assert!(self.initialized);
        let size = cmp::max(layout.size(), layout.align());
        let k = self.order_for(size);
        if k >= self.nsizes {
            return ptr::null_mut();
        }

        // 自下而上找到第一个有空闲块的等级
        let mut j = k;
        while j < self.nsizes && self.info_mut(j).free.is_empty() {
            j += 1;
        }
        if j >= self.nsizes {
            return ptr::null_mut();
        }

        let addr = self.info_mut(j).free.pop();
        self.set_alloc(j, self.blk_index(j, addr), true);

        // 逐级拆分直到目标等级
        while j > k {
            self.set_split(j, self.blk_index(j, addr), true);
            j -= 1;
            let buddy = addr + self.blk_size(j);
            self.set_alloc(j, self.blk_index(j, addr), true);
            self.info_mut(j).free.push(buddy);
        }

        addr as *mut u8
    }

    /// 释放 alloc 得到的内存块，并尽可能与伙伴块合并。
    unsafe fn dealloc(&mut self, p: *mut u8, layout: Layout) {
        debug_assert!(self.initialized);
        let size = cmp::max(layout.size(), layout.align());
        let mut k = self.order_for(size);
        let mut addr = p as usize;
        debug_assert!(addr >= self.base && addr < self.actual_end);

        while k < self.max_order() {
            let index = self.blk_index(k, addr);
            self.set_alloc(k, index, false);

            let buddy = index ^ 1;
            if self.get_alloc(k, buddy) || (k > 0 && self.get_split(k, buddy)) {
                break;
            }
            // 伙伴空闲，摘下来与当前块合并
            let buddy_addr = self.blk_addr(k, buddy);
            (buddy_addr as *mut List).as_mut().unwrap().remove();
            addr = cmp::min(addr, buddy_addr);
            k += 1;
            self.set_split(k, self.blk_index(k, addr), false);
        }

        self.set_alloc(k, self.blk_index(k, addr), false);
        self.info_mut(k).free.push(addr);
    }

    #[inline]
    fn max_order(&self) -> usize {
        self.nsizes - 1
    }

    /// 等级 k 的块大小。
    #[inline]
    fn blk_size(&self, k: usize) -> usize {
        LEAF_SIZE << k
    }

    /// 等级 k 的块数量。
    #[inline]
    fn nblk(&self, k: usize) -> usize {
        1 << (self.nsizes - 1 - k)
    }

    /// 容纳 size 字节所需的最小等级。
    #[inline]
    fn order_for(&self, size: usize) -> usize {
        let mut k = 0;
        while self.blk_size(k) < size {
            k += 1;
        }
        k
    }

    #[inline]
    fn blk_index(&self, k: usize, addr: usize) -> usize {
        (addr - self.base) / self.blk_size(k)
    }

    #[inline]
    fn blk_addr(&self, k: usize, index: usize) -> usize {
        self.base + index * self.blk_size(k)
    }

    fn info_mut(&mut self, k: usize) -> &'static mut OrderInfo {
        unsafe {
            self.infos
                .assume_init()
                .as_mut()
                .unwrap()
                .get_unchecked_mut(k)
        }
    }

    fn get_alloc(&mut self, k: usize, index: usize) -> bool {
        if index >= self.nblk(k) {
            return true;
        }
        let bits = unsafe { self.info_mut(k).alloc.assume_init().as_ref().unwrap() };
        bits[index / 8].get_bit(index % 8)
    }

    fn set_alloc(&mut self, k: usize, index: usize, value: bool) {
        let bits = unsafe { self.info_mut(k).alloc.assume_init().as_mut().unwrap() };
        bits[index / 8].set_bit(index % 8, value);
    }

    fn get_split(&mut self, k: usize, index: usize) -> bool {
        let bits = unsafe { self.info_mut(k).split.assume_init().as_ref().unwrap() };
        bits[index / 8].get_bit(index % 8)
    }

    fn set_split(&mut self, k: usize, index: usize, value: bool) {
        let bits = unsafe { self.info_mut(k).split.assume_init().as_mut().unwrap() };
        bits[index / 8].set_bit(index % 8, value);
    }

    /// 把 [lo, hi) 覆盖到的所有块在每个等级上都标记为已分配。
    unsafe fn mark_allocated(&mut self, lo: usize, hi: usize) {
        if lo >= hi {
            return;
        }
        for k in 0..self.nsizes {
            let first = self.blk_index(k, lo);
            let last = self.blk_index(k, hi - 1);
            for i in first..=last {
                if i < self.nblk(k) {
                    self.set_alloc(k, i, true);
                }
            }
        }
    }
}

/// 在 cur 处为 count 个 T 划出一块清零的空间，返回指向它的切片指针。
unsafe fn carve_slice<T>(cur: &mut usize, count: usize) -> *mut [T] {
    *cur = round_up(*cur, cmp::max(size_of::<T>(), 8));
    let start = *cur as *mut T;
    *cur += count * size_of::<T>();
    ptr::write_bytes(start, 0, count);
    ptr::slice_from_raw_parts_mut(start, count)
}

#[inline]
fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

#[inline]
fn round_down(value: usize, align: usize) -> usize {
    value / align * align
}

#[inline]
fn log2(mut value: usize) -> usize {
    let mut k = 0;
    while value > 1 {
        value >>= 1;
        k += 1;
    }
    k
}
