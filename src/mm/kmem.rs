//! 用户页帧分配器：核心映射表、交换映射表与随机淘汰

use alloc::boxed::Box;
use core::ptr;

use crate::consts::fs::{NSWAPSLOT, ROOTDEV};
use crate::consts::{KHEAPTOP, PGSHIFT, PGSIZE, PHYSTOP};
use crate::fs::{swapread, swapwrite};
use crate::process::{CPU_MANAGER, PROC_MANAGER};
use crate::spinlock::SpinLock;

use super::p2v;

/// 全局页帧分配器。
///
/// 管理 [`KHEAPTOP`, `PHYSTOP`) 之间的物理页帧，为用户进程的
/// 代码、堆、栈页提供存储。每个页帧对应一条核心映射表项，
/// 记录引用计数与最后映射到的用户虚拟地址；内存耗尽时按
/// 固定种子的线性同余序列随机挑选用户页写入磁盘交换区。
pub static KMEM: Kmem = Kmem(SpinLock::new(KmemInner::uninit(), "kmem"));

/// 核心映射表项，每个物理页帧一条。
///
/// 不变式：available 为真时 refs 必为 0；已分配页 refs >= 1；
/// user 为真时 va 非 0，此时该页帧才可能被淘汰到交换区。
pub struct CoreMapEntry {
    /// 页帧是否空闲。
    pub available: bool,
    /// 置位期间禁止淘汰该页帧（写时复制的拷贝源在复制中）。
    pub pinned: bool,
    /// 是否映射为用户页。
    pub user: bool,
    /// 引用计数，共享映射每多一个加一。
    pub refs: u32,
    /// 最后映射到的用户虚拟地址，0 表示内核页或空闲页。
    pub va: usize,
}

/// 交换映射表项，每个交换槽一条，与核心映射表项的约束对应。
struct SwapMapEntry {
    used: bool,
    refs: u32,
    va: usize,
}

pub struct Kmem(SpinLock<KmemInner>);

pub struct KmemInner {
    /// 核心映射表，下标 i 对应页帧号 base_ppn + i。
    pool: Option<Box<[CoreMapEntry]>>,
    /// 交换映射表，每个槽对应交换区中连续 8 块。
    swap: Option<Box<[SwapMapEntry]>>,
    /// 页帧池中第一个页帧的页帧号。
    base_ppn: usize,
    npages: usize,
    free_pages: usize,
    pages_in_use: usize,
    pages_in_swap: usize,
    /// 随机淘汰使用的线性同余序列状态。
    rand_next: u64,
}

impl KmemInner {
    const fn uninit() -> Self {
        Self {
            pool: None,
            swap: None,
            base_ppn: 0,
            npages: 0,
            free_pages: 0,
            pages_in_use: 0,
            pages_in_swap: 0,
            rand_next: 1,
        }
    }

    /// 返回 [0, limit) 内的伪随机数。
    /// 固定序列保证同一种子下的淘汰顺序可复现。
    fn rand(&mut self, limit: usize) -> usize {
        self.rand_next = self
            .rand_next
            .wrapping_mul(1103515245)
            .wrapping_add(12345);
        ((self.rand_next / 65536) % limit as u64) as usize
    }

    fn set_rand(&mut self, seed: u64) {
        self.rand_next = seed;
    }

    fn pool(&mut self) -> &mut [CoreMapEntry] {
        self.pool.as_mut().unwrap()
    }

    fn swap(&mut self) -> &mut [SwapMapEntry] {
        self.swap.as_mut().unwrap()
    }

    /// 线性扫描一个空闲页帧，成功时以引用计数 1 取走。
    fn try_alloc(&mut self) -> Option<usize> {
        let base = self.base_ppn;
        for i in 0..self.npages {
            let entry = &mut self.pool()[i];
            if entry.available {
                entry.available = false;
                entry.refs = 1;
                entry.user = false;
                entry.va = 0;
                self.pages_in_use += 1;
                self.free_pages -= 1;
                return Some(base + i);
            }
        }
        None
    }

    /// 随机抽样挑选一个可淘汰的用户页帧，返回表内下标。
    ///
    /// 拒绝空闲页、未映射为用户页的页以及复制中被钉住的页；
    /// 连续 100 次都没有命中说明用户页帧几乎耗尽，直接 panic。
    fn pick_victim(&mut self) -> usize {
        let npages = self.npages;
        for _ in 0..100 {
            let i = self.rand(npages);
            let entry = &self.pool()[i];
            if entry.va != 0 && !entry.available && !entry.pinned {
                debug_assert!(entry.refs > 0);
                return i;
            }
        }
        panic!("kmem: tried 100 random indices for a user page, all failed");
    }

    /// 线性扫描一个空闲交换槽并占用它。
    fn take_swap_slot(&mut self, refs: u32, va: usize) -> Option<usize> {
        for i in 0..NSWAPSLOT {
            let entry = &mut self.swap()[i];
            if !entry.used {
                entry.used = true;
                entry.refs = refs;
                entry.va = va;
                self.pages_in_swap += 1;
                return Some(i);
            }
        }
        None
    }
}

impl Kmem {
    /// 初始化页帧池与交换映射表。
    ///
    /// # 安全性
    /// 只能在内核堆可用之后、首个进程运行之前调用一次。
    pub unsafe fn init(&self) {
        let npages = (PHYSTOP - KHEAPTOP) / PGSIZE;
        let mut pool = Box::<[CoreMapEntry]>::new_zeroed_slice(npages).assume_init();
        for entry in pool.iter_mut() {
            entry.available = true;
        }
        let swap = Box::<[SwapMapEntry]>::new_zeroed_slice(NSWAPSLOT).assume_init();

        let mut inner = self.0.lock();
        inner.base_ppn = KHEAPTOP >> PGSHIFT;
        inner.npages = npages;
        inner.free_pages = npages;
        inner.pool = Some(pool);
        inner.swap = Some(swap);
        inner.set_rand(1);
        drop(inner);

        println!("kmem: {} user page frames", npages);
    }

    /// 分配一个页帧，返回其页帧号。
    ///
    /// 先扫描空闲页帧；页帧池耗尽时淘汰一个用户页到交换区，
    /// 把腾出的页帧直接转交给调用者。交换区也满时返回 None。
    pub fn kalloc(&self) -> Option<usize> {
        let mut inner = self.0.lock();
        if let Some(ppn) = inner.try_alloc() {
            drop(inner);
            unsafe { ptr::write_bytes(page_ptr(ppn), 0, PGSIZE) };
            return Some(ppn);
        }
        drop(inner);
        let ppn = self.evict_page(true)?;
        unsafe { ptr::write_bytes(page_ptr(ppn), 0, PGSIZE) };
        Some(ppn)
    }

    /// 释放对页帧的一个引用。
    ///
    /// 引用计数归零时用 0x02 填充整页以便暴露悬空引用，
    /// 然后把页帧退回空闲池。
    pub fn kfree(&self, ppn: usize) {
        let mut inner = self.0.lock();
        let i = ppn - inner.base_ppn;
        let entry = &mut inner.pool()[i];
        debug_assert!(!entry.available && entry.refs > 0);
        entry.refs -= 1;
        if entry.refs == 0 {
            unsafe { ptr::write_bytes(page_ptr(ppn), 2, PGSIZE) };
            entry.available = true;
            entry.user = false;
            entry.va = 0;
            inner.pages_in_use -= 1;
            inner.free_pages += 1;
        }
        drop(inner);
    }

    /// 把页帧登记为映射到 va 的用户页，此后它可以被淘汰。
    pub fn mark_user(&self, ppn: usize, va: usize) {
        let mut inner = self.0.lock();
        let i = ppn - inner.base_ppn;
        let entry = &mut inner.pool()[i];
        entry.user = true;
        entry.va = va;
    }

    /// 把页帧登记为内核使用，从淘汰候选中移除。
    pub fn mark_kernel(&self, ppn: usize) {
        let mut inner = self.0.lock();
        let i = ppn - inner.base_ppn;
        let entry = &mut inner.pool()[i];
        entry.user = false;
        entry.va = 0;
    }

    /// 增加页帧的引用计数（建立共享映射时调用）。
    pub fn incr_ref(&self, ppn: usize) {
        let mut inner = self.0.lock();
        let i = ppn - inner.base_ppn;
        let entry = &mut inner.pool()[i];
        debug_assert!(!entry.available && entry.refs > 0);
        entry.refs += 1;
    }

    /// 增加交换槽的引用计数。
    pub fn swap_incr_ref(&self, slot: usize) {
        let mut inner = self.0.lock();
        let entry = &mut inner.swap()[slot];
        debug_assert!(entry.used && entry.refs > 0);
        entry.refs += 1;
    }

    /// 释放对交换槽的一个引用，计数归零时回收该槽。
    pub fn swap_free(&self, slot: usize) {
        let mut inner = self.0.lock();
        let entry = &mut inner.swap()[slot];
        debug_assert!(entry.used && entry.refs > 0);
        entry.refs -= 1;
        if entry.refs == 0 {
            entry.used = false;
            inner.pages_in_swap -= 1;
        }
    }

    /// 淘汰一个用户页帧到交换区。
    ///
    /// # 流程解释
    /// 1. 持锁随机挑选牺牲页，占用一个空闲交换槽，
    ///    把引用计数与用户虚拟地址搬到交换槽上；
    /// 2. 根据 iskalloc 把页帧转交给调用者（refs = 1）
    ///    或退回空闲池；
    /// 3. 放锁后把页面内容写入交换区（磁盘 IO 会休眠，
    ///    不能持自旋锁跨越）；
    /// 4. 遍历进程表把引用该页帧的虚拟页标记为已换出，
    ///    最后重装当前进程的页表以冲刷过期映射。
    ///
    /// # 返回值
    /// - `Some(ppn)`: 腾出（或转交）的页帧号
    /// - `None`: 交换区已满
    pub fn evict_page(&self, iskalloc: bool) -> Option<usize> {
        let mut inner = self.0.lock();

        let i = inner.pick_victim();
        let base = inner.base_ppn;
        let (refs, va) = {
            let entry = &inner.pool()[i];
            (entry.refs, entry.va)
        };
        let slot = match inner.take_swap_slot(refs, va) {
            Some(s) => s,
            None => return None,
        };
        let entry = &mut inner.pool()[i];
        if iskalloc {
            entry.refs = 1;
            debug_assert!(!entry.available);
        } else {
            entry.available = true;
            entry.refs = 0;
        }
        entry.user = false;
        entry.va = 0;
        if !iskalloc {
            inner.pages_in_use -= 1;
            inner.free_pages += 1;
        }
        let ppn = base + i;
        drop(inner);

        // 页面内容落盘，再同步各进程的虚拟页信息
        swapwrite(ROOTDEV, slot, page_ptr(ppn));
        unsafe {
            PROC_MANAGER.mark_swapped(ppn, slot);
            let p = CPU_MANAGER.my_proc();
            p.data.get_mut().vspace.install();
        }

        Some(ppn)
    }

    /// 写时复制的拆解：引用计数大于 1 时复制出私有页。
    ///
    /// # 流程解释
    /// 复制期间把源页帧钉住，防止新页分配触发的淘汰把
    /// 复制源写进交换区。复制完成后源页引用计数减一，
    /// `ppn` 原地改写为新页帧号；引用计数为 1 时无事发生。
    pub fn ppage_copy(&self, ppn: &mut usize) -> Result<(), ()> {
        let mut inner = self.0.lock();
        let i = *ppn - inner.base_ppn;
        debug_assert!(inner.pool()[i].refs != 0);
        if inner.pool()[i].refs <= 1 {
            return Ok(());
        }

        inner.pool()[i].pinned = true;
        let new_ppn = match inner.try_alloc() {
            Some(p) => p,
            None => {
                drop(inner);
                match self.evict_page(true) {
                    Some(p) => {
                        inner = self.0.lock();
                        p
                    }
                    None => {
                        self.0.lock().pool()[i].pinned = false;
                        return Err(());
                    }
                }
            }
        };
        unsafe {
            ptr::copy_nonoverlapping(page_ptr(*ppn) as *const u8, page_ptr(new_ppn), PGSIZE);
        }
        inner.pool()[i].refs -= 1;
        inner.pool()[i].pinned = false;
        drop(inner);

        *ppn = new_ppn;
        Ok(())
    }

    /// 把交换槽中的页面换回内存，返回新页帧号。
    ///
    /// # 流程解释
    /// 1. 分配新页帧（可能引发另一次淘汰）；
    /// 2. 把交换槽上的引用计数与虚拟地址搬回核心映射表项，
    ///    释放交换槽；
    /// 3. 从交换区读回页面内容；
    /// 4. 遍历进程表，把所有引用该交换槽的虚拟页改指新页帧。
    pub fn swappage_copy(&self, slot: usize) -> Result<usize, ()> {
        let ppn = self.kalloc().ok_or(())?;

        let mut inner = self.0.lock();
        let (refs, va) = {
            let entry = &inner.swap()[slot];
            debug_assert!(entry.used && entry.refs > 0 && entry.va != 0);
            (entry.refs, entry.va)
        };
        let base = inner.base_ppn;
        let entry = &mut inner.pool()[ppn - base];
        entry.user = true;
        entry.refs = refs;
        entry.va = va;
        let swap_entry = &mut inner.swap()[slot];
        swap_entry.used = false;
        swap_entry.refs = 0;
        inner.pages_in_swap -= 1;
        drop(inner);

        swapread(ROOTDEV, slot, page_ptr(ppn));
        unsafe {
            PROC_MANAGER.update_cow_refs(ppn, slot);
        }

        Ok(ppn)
    }

    /// 预留 n 个空闲页帧，不够就持续淘汰。
    ///
    /// # Panics
    /// 交换区耗尽时 panic。
    pub fn ensure_free_pages(&self, n: usize) {
        loop {
            let inner = self.0.lock();
            if inner.free_pages >= n {
                return;
            }
            drop(inner);
            if self.evict_page(false).is_none() {
                panic!("kmem: run out of swap region memory");
            }
        }
    }
}

/// 页帧号对应的内核虚拟地址。
#[inline]
fn page_ptr(ppn: usize) -> *mut u8 {
    p2v(ppn << PGSHIFT) as *mut u8
}

#[cfg(feature = "unit_test")]
pub mod tests {
    use super::*;

    /// 同一种子产生同一淘汰序列，换种子则不同。
    pub fn rand_sequence() {
        let mut a = KmemInner::uninit();
        let mut b = KmemInner::uninit();
        a.set_rand(1);
        b.set_rand(1);
        let first: [usize; 8] = core::array::from_fn(|_| a.rand(4096));
        for i in 0..8 {
            let v = b.rand(4096);
            assert_eq!(first[i], v);
            assert!(v < 4096);
        }
        b.set_rand(2);
        let mut differs = false;
        for i in 0..8 {
            if b.rand(4096) != first[i] {
                differs = true;
            }
        }
        assert!(differs);
    }

    /// 分配 / 释放平衡，释放后的页帧被 0x02 覆写。
    pub fn alloc_free() {
        let ppn = KMEM.kalloc().expect("kalloc");
        unsafe {
            assert_eq!(*page_ptr(ppn), 0);
        }
        KMEM.kfree(ppn);
        unsafe {
            assert_eq!(*page_ptr(ppn), 2);
        }
    }
}
