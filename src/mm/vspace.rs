//! 进程虚拟地址空间：区域表、虚拟页信息与写时复制

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cmp::min;
use core::ptr;

use crate::consts::{PGSHIFT, PGSIZE, USERTOP};
use crate::register::cr3;

use super::pagetable::{PageTable, PteFlag};
use super::{p2v, pg_round_down, KMEM};

/// 代码区（含只读文本与可写数据段）。
pub const VR_CODE: usize = 0;
/// 堆区，sbrk 向上生长。
pub const VR_HEAP: usize = 1;
/// 用户栈区，缺页时向下生长。
pub const VR_USTACK: usize = 2;

const NREGION: usize = 3;

/// 区域的生长方向。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum GrowDir {
    Up,
    Down,
}

/// 虚拟页的当前去向。
///
/// 页面要么落在某个物理页帧上，要么整页躺在交换区的某个槽里。
/// writable / cow 跨换出换入保留，换回内存的写时复制页
/// 仍旧以只读共享方式映射。
#[derive(Clone, Copy, Debug)]
pub enum VpiState {
    Frame { ppn: usize, writable: bool, cow: bool },
    Swapped { slot: usize, writable: bool, cow: bool },
}

/// 单个虚拟页的信息。
#[derive(Clone, Copy, Debug)]
pub struct VPageInfo {
    pub va: usize,
    pub state: VpiState,
}

/// 一段连续的虚拟地址区域。
///
/// 向上生长的区域占据 [base, base+size)；
/// 向下生长的区域（用户栈）以 base 为最高地址，
/// 占据 [base-size, base)。
pub struct VRegion {
    pub base: usize,
    pub size: usize,
    dir: GrowDir,
    pages: Vec<VPageInfo>,
}

impl VRegion {
    const fn new(dir: GrowDir) -> Self {
        Self {
            base: 0,
            size: 0,
            dir,
            pages: Vec::new(),
        }
    }

    /// 区域当前占据的最低地址。
    pub fn lowest(&self) -> usize {
        match self.dir {
            GrowDir::Up => self.base,
            GrowDir::Down => self.base - self.size,
        }
    }

    /// 区域当前占据的最高地址（不含）。
    pub fn highest(&self) -> usize {
        match self.dir {
            GrowDir::Up => self.base + self.size,
            GrowDir::Down => self.base,
        }
    }

    fn contains(&self, va: usize) -> bool {
        self.size > 0 && va >= self.lowest() && va < self.highest()
    }

    fn vpi_mut(&mut self, va: usize) -> Option<&mut VPageInfo> {
        let page = pg_round_down(va);
        self.pages.iter_mut().find(|vpi| vpi.va == page)
    }
}

/// 进程的虚拟地址空间。
///
/// 由代码 / 堆 / 用户栈三个区域和一张四级页表根组成。
/// 区域里的虚拟页信息是映射状态的唯一权威来源，
/// 页表项只是它的缓存，通过 [`VSpace::invalidate`] 重建。
pub struct VSpace {
    pub regions: [VRegion; NREGION],
    pagetable: Option<Box<PageTable>>,
}

/// 虚拟页信息对应的页表叶子内容。
fn leaf_mapping(vpi: &VPageInfo) -> Option<(usize, PteFlag)> {
    match vpi.state {
        VpiState::Frame { ppn, writable, cow } => {
            let mut perm = PteFlag::U;
            if writable && !cow {
                perm |= PteFlag::W;
            }
            Some((ppn << PGSHIFT, perm))
        }
        VpiState::Swapped { .. } => None,
    }
}

impl VSpace {
    pub const fn new() -> Self {
        Self {
            regions: [
                VRegion::new(GrowDir::Up),
                VRegion::new(GrowDir::Up),
                VRegion::new(GrowDir::Down),
            ],
            pagetable: None,
        }
    }

    /// 初始化一个空的地址空间：分配页表根，清空三个区域。
    pub fn init(&mut self) -> Result<(), ()> {
        debug_assert!(self.pagetable.is_none());
        self.pagetable = Some(PageTable::alloc_proc_pagetable().ok_or(())?);
        for region in self.regions.iter_mut() {
            region.base = 0;
            region.size = 0;
            region.pages.clear();
        }
        self.regions[VR_USTACK].base = USERTOP;
        Ok(())
    }

    /// 是否已经初始化。
    pub fn is_initialized(&self) -> bool {
        self.pagetable.is_some()
    }

    /// 把本地址空间装入 CR3。
    pub fn install(&self) {
        unsafe {
            cr3::write(self.pagetable.as_ref().unwrap().as_pml4_pa());
        }
    }

    /// 按虚拟页信息重建整张页表的叶子项。
    /// 区域状态变更后调用，随后的 [`VSpace::install`] 冲刷 TLB。
    pub fn invalidate(&mut self) {
        let pagetable = self.pagetable.as_mut().unwrap();
        for region in self.regions.iter() {
            for vpi in region.pages.iter() {
                pagetable.resync_leaf(vpi.va, leaf_mapping(vpi));
            }
        }
    }

    /// 找到覆盖 va 的区域编号。
    pub fn region_of(&self, va: usize) -> Option<usize> {
        self.regions.iter().position(|r| r.contains(va))
    }

    /// 给区域 r 新映射 npages 个页，起始于页对齐地址 va。
    ///
    /// # 流程解释
    /// 先向页帧池预约足够的空闲页（必要时触发换出），
    /// 然后逐页分配清零页帧、登记为可淘汰的用户页、
    /// 追加虚拟页信息并写入页表叶子项。
    /// 本函数不调整区域的 size，由调用者按语义更新。
    pub fn add_map(
        &mut self,
        r: usize,
        va: usize,
        npages: usize,
        writable: bool,
    ) -> Result<(), ()> {
        debug_assert_eq!(va % PGSIZE, 0);
        if npages == 0 {
            return Ok(());
        }
        KMEM.ensure_free_pages(npages);

        for i in 0..npages {
            let page_va = va + i * PGSIZE;
            // 淘汰回调会同步改写各地址空间，分配期间不得持有
            // 对区域或页表的借用
            let ppn = KMEM.kalloc().ok_or(())?;
            KMEM.mark_user(ppn, page_va);

            let region = &mut self.regions[r];
            debug_assert!(region.vpi_mut(page_va).is_none());
            let vpi = VPageInfo {
                va: page_va,
                state: VpiState::Frame {
                    ppn,
                    writable,
                    cow: false,
                },
            };
            region.pages.push(vpi);
            self.pagetable
                .as_mut()
                .ok_or(())?
                .resync_leaf(page_va, leaf_mapping(&vpi));
        }
        Ok(())
    }

    /// 把 initcode 装进代码区的第一页。
    pub fn init_code(&mut self, base: usize, code: &[u8]) {
        if code.len() >= PGSIZE {
            panic!("initcode more than a page");
        }
        self.regions[VR_CODE].base = base;
        self.add_map(VR_CODE, base, 1, false).expect("map initcode");
        self.regions[VR_CODE].size = PGSIZE;
        self.regions[VR_HEAP].base = base + PGSIZE;

        let ppn = match self.regions[VR_CODE].pages[0].state {
            VpiState::Frame { ppn, .. } => ppn,
            _ => unreachable!(),
        };
        unsafe {
            ptr::copy_nonoverlapping(code.as_ptr(), p2v(ppn << PGSHIFT) as *mut u8, code.len());
        }
    }

    /// 在用户空间顶端保留初始的一页用户栈。
    pub fn init_stack(&mut self) -> Result<(), ()> {
        let region = &self.regions[VR_USTACK];
        debug_assert_eq!(region.base, USERTOP);
        debug_assert_eq!(region.size, 0);
        self.add_map(VR_USTACK, USERTOP - PGSIZE, 1, true)?;
        self.regions[VR_USTACK].size = PGSIZE;
        Ok(())
    }

    /// 以写时复制的方式把 src 的用户内存复制到本地址空间。
    ///
    /// # 流程解释
    /// 逐区域共享 src 的全部页帧与交换槽：引用计数加一，
    /// 原本可写的页在双方的虚拟页信息里都改成只读 + cow。
    /// 最后重建双方的页表叶子项；调用者负责在合适的时机
    /// 重新装载页表以冲刷旧的可写映射。
    pub fn copy_cow(&mut self, src: &mut VSpace) -> Result<(), ()> {
        for r in 0..NREGION {
            self.regions[r].base = src.regions[r].base;
            self.regions[r].size = src.regions[r].size;
            self.regions[r].pages.clear();

            for vpi in src.regions[r].pages.iter_mut() {
                let shared = match vpi.state {
                    VpiState::Frame { ppn, writable, cow } => {
                        KMEM.incr_ref(ppn);
                        VpiState::Frame {
                            ppn,
                            writable: false,
                            cow: cow || writable,
                        }
                    }
                    VpiState::Swapped {
                        slot,
                        writable,
                        cow,
                    } => {
                        KMEM.swap_incr_ref(slot);
                        VpiState::Swapped {
                            slot,
                            writable: false,
                            cow: cow || writable,
                        }
                    }
                };
                vpi.state = shared;
                self.regions[r].pages.push(VPageInfo {
                    va: vpi.va,
                    state: shared,
                });
            }
        }
        src.invalidate();
        self.invalidate();
        Ok(())
    }

    /// 把虚拟页 va 的写时复制共享拆解成私有可写页。
    ///
    /// 页帧引用计数为 1 时只需改写权限；否则复制出新页帧，
    /// 并把它登记为映射在 va 上的用户页。
    pub fn cow_break(&mut self, va: usize) -> Result<(), ()> {
        let r = self.region_of(va).ok_or(())?;
        let page_va = pg_round_down(va);
        let mut ppn = match self.regions[r].vpi_mut(va) {
            Some(VPageInfo {
                state: VpiState::Frame { ppn, cow: true, .. },
                ..
            }) => *ppn,
            _ => return Err(()),
        };

        // 复制期间不持有对区域或页表的借用：
        // 复制触发的淘汰会同步改写各地址空间
        KMEM.ppage_copy(&mut ppn)?;
        KMEM.mark_user(ppn, page_va);

        let region = &mut self.regions[r];
        let pagetable = self.pagetable.as_mut().ok_or(())?;
        let vpi = region.vpi_mut(va).ok_or(())?;
        vpi.state = VpiState::Frame {
            ppn,
            writable: true,
            cow: false,
        };
        pagetable.resync_leaf(page_va, leaf_mapping(vpi));
        Ok(())
    }

    /// 把换出的虚拟页 va 换回内存。
    ///
    /// 换入由页帧池完成并广播到进程表里的所有地址空间；
    /// 本地址空间可能尚未挂到进程上（例如 exec 构建期间），
    /// 因此这里再把自己的虚拟页信息同步一遍。
    pub fn swap_in(&mut self, va: usize) -> Result<(), ()> {
        let r = self.region_of(va).ok_or(())?;
        let (slot, writable, cow) = match self.regions[r].vpi_mut(va) {
            Some(VPageInfo {
                state: VpiState::Swapped {
                    slot,
                    writable,
                    cow,
                },
                ..
            }) => (*slot, *writable, *cow),
            _ => return Err(()),
        };

        let ppn = KMEM.swappage_copy(slot)?;

        let region = &mut self.regions[r];
        let pagetable = self.pagetable.as_mut().ok_or(())?;
        let vpi = region.vpi_mut(va).unwrap();
        if let VpiState::Swapped { slot: s, .. } = vpi.state {
            if s == slot {
                vpi.state = VpiState::Frame { ppn, writable, cow };
                pagetable.resync_leaf(vpi.va, leaf_mapping(vpi));
            }
        }
        Ok(())
    }

    /// 虚拟页 va 当前是否处于换出状态。
    pub fn is_swapped(&mut self, va: usize) -> bool {
        match self.region_of(va) {
            Some(r) => matches!(
                self.regions[r].vpi_mut(va),
                Some(VPageInfo {
                    state: VpiState::Swapped { .. },
                    ..
                })
            ),
            None => false,
        }
    }

    /// 虚拟页 va 是否是待拆解的写时复制页。
    pub fn is_cow(&mut self, va: usize) -> bool {
        match self.region_of(va) {
            Some(r) => matches!(
                self.regions[r].vpi_mut(va),
                Some(VPageInfo {
                    state: VpiState::Frame { cow: true, .. },
                    ..
                })
            ),
            None => false,
        }
    }

    /// 内核向（可能未装载的）用户地址空间写入 count 字节。
    ///
    /// 逐页解析目标虚拟页：换出的页先换回，写时复制共享页
    /// 先拆解成私有页，然后经内核直映射写入页帧。
    /// 写入不检查用户可写位，exec 正是借此向只读代码页装载内容。
    pub fn write_to_va(&mut self, dst: usize, mut src: *const u8, mut count: usize) -> Result<(), ()> {
        let mut va = dst;
        while count > 0 {
            let ppn = self.resolve_frame(va, true)?;
            let offset = va % PGSIZE;
            let n = min(PGSIZE - offset, count);
            unsafe {
                ptr::copy(src, (p2v(ppn << PGSHIFT) as *mut u8).add(offset), n);
                src = src.add(n);
            }
            va += n;
            count -= n;
        }
        Ok(())
    }

    /// 从用户地址空间读出 count 字节到内核缓冲区。
    pub fn read_from_va(&mut self, src: usize, mut dst: *mut u8, mut count: usize) -> Result<(), ()> {
        let mut va = src;
        while count > 0 {
            let ppn = self.resolve_frame(va, false)?;
            let offset = va % PGSIZE;
            let n = min(PGSIZE - offset, count);
            unsafe {
                ptr::copy((p2v(ppn << PGSHIFT) as *const u8).add(offset), dst, n);
                dst = dst.add(n);
            }
            va += n;
            count -= n;
        }
        Ok(())
    }

    /// 从用户虚拟地址复制一个以空字符结尾的字符串。
    pub fn copy_in_str(&mut self, srcva: usize, dst: &mut [u8]) -> Result<(), &'static str> {
        let mut va = srcva;
        let mut i = 0usize;
        while i < dst.len() {
            let ppn = self.resolve_frame(va, false).map_err(|_| "va not mapped")?;
            let offset = va % PGSIZE;
            let src = p2v(ppn << PGSHIFT) as *const u8;
            let count = min(PGSIZE - offset, dst.len() - i);
            for j in 0..count {
                let c = unsafe { ptr::read(src.add(offset + j)) };
                dst[i] = c;
                if c == 0 {
                    return Ok(());
                }
                i += 1;
            }
            va += count;
        }
        Err("copy_in_str: dst not enough space")
    }

    /// 虚拟页 va 对应页帧的内核指针，装载器直写页面内容用。
    /// 与写路径一样按需换入页面、拆解写时复制共享。
    pub fn page_for_write(&mut self, va: usize) -> Result<*mut u8, ()> {
        let ppn = self.resolve_frame(va, true)?;
        Ok(p2v(ppn << PGSHIFT) as *mut u8)
    }

    /// 解析 va 所在虚拟页当前的页帧号，按需换入 / 拆解共享。
    fn resolve_frame(&mut self, va: usize, for_write: bool) -> Result<usize, ()> {
        if self.is_swapped(va) {
            self.swap_in(va)?;
        }
        if for_write && self.is_cow(va) {
            self.cow_break(va)?;
        }
        let r = self.region_of(va).ok_or(())?;
        match self.regions[r].vpi_mut(va) {
            Some(VPageInfo {
                state: VpiState::Frame { ppn, .. },
                ..
            }) => Ok(*ppn),
            _ => Err(()),
        }
    }

    /// 淘汰路径的回调：把引用页帧 ppn 的虚拟页改记为已换出。
    /// 返回受影响的虚拟页数量。
    pub fn mark_swapped(&mut self, ppn: usize, slot: usize) -> usize {
        let mut count = 0;
        let pagetable = match self.pagetable.as_mut() {
            Some(p) => p,
            None => return 0,
        };
        for region in self.regions.iter_mut() {
            for vpi in region.pages.iter_mut() {
                if let VpiState::Frame {
                    ppn: p,
                    writable,
                    cow,
                } = vpi.state
                {
                    if p == ppn {
                        vpi.state = VpiState::Swapped {
                            slot,
                            writable,
                            cow,
                        };
                        pagetable.resync_leaf(vpi.va, None);
                        count += 1;
                    }
                }
            }
        }
        count
    }

    /// 换入路径的回调：把引用交换槽 slot 的虚拟页改指页帧 ppn。
    /// 返回受影响的虚拟页数量。
    pub fn update_cow_refs(&mut self, ppn: usize, slot: usize) -> usize {
        let mut count = 0;
        let pagetable = match self.pagetable.as_mut() {
            Some(p) => p,
            None => return 0,
        };
        for region in self.regions.iter_mut() {
            for vpi in region.pages.iter_mut() {
                if let VpiState::Swapped {
                    slot: s,
                    writable,
                    cow,
                } = vpi.state
                {
                    if s == slot {
                        vpi.state = VpiState::Frame { ppn, writable, cow };
                        pagetable.resync_leaf(vpi.va, leaf_mapping(vpi));
                        count += 1;
                    }
                }
            }
        }
        count
    }

    /// 释放地址空间持有的全部资源。
    ///
    /// 逐页归还页帧与交换槽引用，撤销叶子映射，
    /// 清掉与内核共享的高半区表项后释放整棵页表。
    pub fn cleanup(&mut self) {
        let mut pagetable = match self.pagetable.take() {
            Some(p) => p,
            None => return,
        };
        for region in self.regions.iter_mut() {
            for vpi in region.pages.iter() {
                match vpi.state {
                    VpiState::Frame { ppn, .. } => {
                        pagetable.resync_leaf(vpi.va, None);
                        KMEM.kfree(ppn);
                    }
                    VpiState::Swapped { slot, .. } => {
                        KMEM.swap_free(slot);
                    }
                }
            }
            region.pages.clear();
            region.base = 0;
            region.size = 0;
        }
        pagetable.clear_kernel_half();
        pagetable.free_walk(3);
        drop(pagetable);
    }
}

impl Drop for VSpace {
    fn drop(&mut self) {
        self.cleanup();
    }
}
