//! x86-64 四级页表的配置与管理

use array_macro::array;
use bit_field::BitField;

use alloc::boxed::Box;
use core::ptr;

use crate::consts::driver::LAPIC_BASE;
use crate::consts::{KERNBASE, PGMASKLEN, PGSHIFT, PGSIZE, PHYSTOP};
use crate::register::cr3;

use super::{p2v, v2p};

bitflags! {
    /// 页表项权限标志。
    ///
    /// 对应 x86-64 页表项的低位控制位，
    /// 用于设置页面的存在 / 可写 / 用户态访问权限。
    pub struct PteFlag: usize {
        /// 存在位（Present）。
        const P = 1 << 0;
        /// 写权限（Writable）。
        const W = 1 << 1;
        /// 用户态访问权限（User）。
        const U = 1 << 2;
        /// 访问位，由硬件置位。
        const A = 1 << 5;
        /// 脏位，由硬件置位。
        const D = 1 << 6;
    }
}

/// 页表项中物理地址所占的位段。
const PTE_ADDR_MASK: usize = 0x000f_ffff_ffff_f000;

/// 单个页表项，封装裸的 64 位表项数据。
#[repr(C)]
#[derive(Debug)]
pub struct PageTableEntry {
    data: usize,
}

impl PageTableEntry {
    #[inline]
    pub fn is_valid(&self) -> bool {
        (self.data & PteFlag::P.bits()) > 0
    }

    #[inline]
    fn is_user(&self) -> bool {
        (self.data & PteFlag::U.bits()) > 0
    }

    /// 下一级页表的内核虚拟地址。
    #[inline]
    fn as_page_table(&self) -> *mut PageTable {
        p2v(self.data & PTE_ADDR_MASK) as *mut PageTable
    }

    /// 表项记录的物理地址。
    #[inline]
    pub fn as_phys_addr(&self) -> usize {
        self.data & PTE_ADDR_MASK
    }

    #[inline]
    fn write_zero(&mut self) {
        self.data = 0;
    }

    /// 写入指向下一级页表的表项。
    /// 中间级放开 W/U，访问控制由叶子项决定。
    #[inline]
    fn write_branch(&mut self, pa: usize) {
        self.data = (pa & PTE_ADDR_MASK) | (PteFlag::P | PteFlag::W | PteFlag::U).bits();
    }

    /// 写入叶子表项。
    #[inline]
    fn write_perm(&mut self, pa: usize, perm: PteFlag) {
        self.data = (pa & PTE_ADDR_MASK) | (perm | PteFlag::P).bits();
    }
}

/// 一页大小的页表，含 512 个表项。
///
/// 同一个结构用于 PML4 / PDPT / PD / PT 四个层级；
/// 进程页表的高半区（表项 256 起）与内核页表共享子表。
#[repr(C, align(4096))]
pub struct PageTable {
    data: [PageTableEntry; 512],
}

/// 内核页表。
/// 启动时由 [`kvm_init`] 填充，此后只读；
/// 每张进程页表的高半区都从这里复制。
pub static mut KERNEL_PAGETABLE: PageTable = PageTable::empty();

/// 构建内核页表并切换过去。
///
/// 把 [KERNBASE, KERNBASE+PHYSTOP) 直映射到物理内存，
/// 外加局部 APIC 的寄存器页。
///
/// # 安全性
/// 只能在启动阶段由首个处理器调用一次，内核堆必须已可用。
pub unsafe fn kvm_init() {
    let kpgt = ptr::addr_of_mut!(KERNEL_PAGETABLE).as_mut().unwrap();
    kpgt.map_pages(KERNBASE, PHYSTOP, 0, PteFlag::W)
        .expect("kvm map physical memory");
    kpgt.map_pages(p2v(LAPIC_BASE), PGSIZE, LAPIC_BASE, PteFlag::W)
        .expect("kvm map lapic");
    kvm_install();
}

/// 把当前处理器切换到内核页表。
pub unsafe fn kvm_install() {
    cr3::write(v2p(ptr::addr_of!(KERNEL_PAGETABLE) as usize));
}

impl PageTable {
    pub const fn empty() -> Self {
        Self {
            data: array![_ => PageTableEntry { data: 0 }; 512],
        }
    }

    /// 页表根的物理地址，可直接写入 CR3。
    pub fn as_pml4_pa(&self) -> usize {
        v2p(self as *const PageTable as usize)
    }

    /// 虚拟地址在 level 级页表中的索引。
    #[inline]
    fn page_num(va: usize, level: usize) -> usize {
        let low = PGSHIFT + level * PGMASKLEN;
        va.get_bits(low..low + PGMASKLEN)
    }

    /// 分配一张新的进程页表根。
    ///
    /// 低半区全空，高半区复制内核页表的顶级表项，
    /// 使每个进程的地址空间都带有完整的内核映射。
    pub fn alloc_proc_pagetable() -> Option<Box<Self>> {
        let mut pagetable = unsafe { Box::<Self>::try_new_zeroed().ok()?.assume_init() };
        unsafe {
            let kpgt = ptr::addr_of!(KERNEL_PAGETABLE).as_ref().unwrap();
            for i in 256..512 {
                pagetable.data[i].data = kpgt.data[i].data;
            }
        }
        Some(pagetable)
    }

    /// 在页表中建立 [va, va+size) 到 [pa, ...) 的连续映射。
    ///
    /// # 流程解释
    /// 虚拟区间按页对齐后逐页调用 `walk_alloc` 找到叶子表项，
    /// 中间级页表不存在时动态分配。目标表项已有映射时说明
    /// 内核逻辑出错，直接 panic。
    ///
    /// # 可能的错误
    /// - 中间级页表分配失败时返回 `Err`。
    pub fn map_pages(
        &mut self,
        va: usize,
        size: usize,
        pa: usize,
        perm: PteFlag,
    ) -> Result<(), &'static str> {
        let mut va = super::pg_round_down(va);
        let last = super::pg_round_up(va + size);
        let mut pa = pa;

        while va != last {
            match self.walk_alloc(va) {
                Some(pte) => {
                    if pte.is_valid() {
                        println!("va: {:#x}, pa: {:#x}, pte: {:#x}", va, pa, pte.data);
                        panic!("remap");
                    }
                    pte.write_perm(pa, perm);
                    va += PGSIZE;
                    pa += PGSIZE;
                }
                None => return Err("PageTable.map_pages: no memory for new page table"),
            }
        }

        Ok(())
    }

    /// 找到 va 对应的叶子表项，路径上缺失的页表动态分配。
    fn walk_alloc(&mut self, va: usize) -> Option<&mut PageTableEntry> {
        let mut pgt = self as *mut PageTable;
        for level in (1..=3).rev() {
            let pte = unsafe { &mut pgt.as_mut().unwrap().data[Self::page_num(va, level)] };

            if pte.is_valid() {
                pgt = pte.as_page_table();
            } else {
                let zeroed_pgt = unsafe { Box::<Self>::try_new_zeroed().ok()?.assume_init() };
                pgt = Box::into_raw(zeroed_pgt);
                pte.write_branch(v2p(pgt as usize));
            }
        }
        unsafe { Some(&mut pgt.as_mut().unwrap().data[Self::page_num(va, 0)]) }
    }

    /// 与 [`Self::walk_alloc`] 相同，但路径缺失时返回 None。
    fn walk_mut(&mut self, va: usize) -> Option<&mut PageTableEntry> {
        let mut pgt = self as *mut PageTable;
        for level in (1..=3).rev() {
            let pte = unsafe { &mut pgt.as_mut().unwrap().data[Self::page_num(va, level)] };
            if pte.is_valid() {
                pgt = pte.as_page_table();
            } else {
                return None;
            }
        }
        unsafe { Some(&mut pgt.as_mut().unwrap().data[Self::page_num(va, 0)]) }
    }

    /// 查询 va 对应的物理地址，要求映射存在且允许用户访问。
    pub fn walk_addr(&mut self, va: usize) -> Result<usize, &'static str> {
        match self.walk_mut(super::pg_round_down(va)) {
            Some(pte) => {
                if !pte.is_valid() {
                    Err("pte not valid")
                } else if !pte.is_user() {
                    Err("pte not mapped for user")
                } else {
                    Ok(pte.as_phys_addr())
                }
            }
            None => Err("va not mapped"),
        }
    }

    /// 把 va 的叶子表项改写为给定映射，None 表示撤销映射。
    ///
    /// 虚拟页信息是映射状态的唯一权威来源，本函数负责把
    /// 页表项同步成与之一致（换出清除、换入重建、权限更新）。
    pub fn resync_leaf(&mut self, va: usize, mapping: Option<(usize, PteFlag)>) {
        match mapping {
            Some((pa, perm)) => match self.walk_alloc(va) {
                Some(pte) => pte.write_perm(pa, perm),
                None => panic!("resync_leaf: no memory for new page table"),
            },
            None => {
                if let Some(pte) = self.walk_mut(va) {
                    pte.write_zero();
                }
            }
        }
    }

    /// 清空高半区的顶级表项。
    /// 进程页表销毁前调用，避免共享的内核子表被连带释放。
    pub fn clear_kernel_half(&mut self) {
        for i in 256..512 {
            self.data[i].write_zero();
        }
    }

    /// 递归释放所有中间级页表页。
    ///
    /// depth 为当前页表距叶子级的层数，根页表为 3。
    /// 叶子表项必须已经全部撤销，否则说明调用者漏掉了
    /// 物理页的回收，直接 panic。
    pub fn free_walk(&mut self, depth: usize) {
        for pte in self.data.iter_mut() {
            if !pte.is_valid() {
                continue;
            }
            if depth == 0 {
                panic!("pagetable: leaf pte still mapped");
            }
            let child = pte.as_page_table();
            unsafe {
                child.as_mut().unwrap().free_walk(depth - 1);
                drop(Box::from_raw(child));
            }
            pte.write_zero();
        }
    }
}
