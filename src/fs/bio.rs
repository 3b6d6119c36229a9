//! 缓冲区缓存层

use array_macro::array;

use core::ops::{Deref, DerefMut};
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::consts::fs::{BSIZE, NBUF};
use crate::driver::ide::DISK;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::SpinLock;

pub static BCACHE: Bcache = Bcache::new();

/// 磁盘块的内存缓存。
///
/// 固定大小的缓冲块池，按 (dev, blockno) 缓存磁盘块内容，
/// 同一磁盘块在内存中至多存在一份拷贝。
/// 元信息（块号、引用计数、LRU 链表）由自旋锁保护，
/// 块数据本身由各自的睡眠锁保护，可以跨磁盘 IO 持有。
pub struct Bcache {
    /// LRU 链表与各缓冲块的元信息。
    ctrl: SpinLock<BufLru>,
    /// 缓冲块的数据与状态位，与元信息按下标一一对应。
    bufs: [BufInner; NBUF],
}

impl Bcache {
    const fn new() -> Self {
        Self {
            ctrl: SpinLock::new(BufLru::new(), "BufLru"),
            bufs: array![_ => BufInner::new(); NBUF],
        }
    }

    /// 初始化 LRU 双向链表。
    ///
    /// # 安全性
    /// 必须仅在系统启动时调用一次。
    pub fn binit(&self) {
        let mut ctrl = self.ctrl.lock();
        let len = ctrl.inner.len();

        ctrl.head = &mut ctrl.inner[0];
        ctrl.tail = &mut ctrl.inner[len - 1];

        ctrl.inner[0].prev = ptr::null_mut();
        ctrl.inner[0].next = &mut ctrl.inner[1];
        ctrl.inner[len - 1].prev = &mut ctrl.inner[len - 2];
        ctrl.inner[len - 1].next = ptr::null_mut();
        for i in 1..(len - 1) {
            ctrl.inner[i].prev = &mut ctrl.inner[i - 1];
            ctrl.inner[i].next = &mut ctrl.inner[i + 1];
        }

        ctrl.inner
            .iter_mut()
            .enumerate()
            .for_each(|(i, b)| b.index = i);
    }

    /// 定位 (dev, blockno) 的缓冲块，未缓存时回收一个空闲块顶替。
    ///
    /// # 流程解释
    /// 持元信息锁查找命中项；未命中时从 LRU 尾部回收引用计数
    /// 为零的块并改挂到新块号上。返回的 [`Buf`] 已持有数据
    /// 睡眠锁；是否需要读盘由调用者根据 valid 位决定。
    ///
    /// # Panics
    /// 所有缓冲块都在使用中时 panic。
    fn bget(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let mut ctrl = self.ctrl.lock();

        match ctrl.find_cached(dev, blockno) {
            Some((index, rc_ptr)) => {
                drop(ctrl);
                Buf {
                    index,
                    dev,
                    blockno,
                    rc_ptr,
                    data: Some(self.bufs[index].data.lock()),
                }
            }
            None => {
                // 未命中，回收最久未使用的空闲缓冲块
                match ctrl.recycle(dev, blockno) {
                    Some((index, rc_ptr)) => {
                        self.bufs[index].valid.store(false, Ordering::Relaxed);
                        self.bufs[index].dirty.store(false, Ordering::Relaxed);
                        drop(ctrl);
                        Buf {
                            index,
                            dev,
                            blockno,
                            rc_ptr,
                            data: Some(self.bufs[index].data.lock()),
                        }
                    }
                    None => panic!("no usable buffer"),
                }
            }
        }
    }

    /// 读出 (dev, blockno) 对应的缓冲块，必要时从磁盘装载。
    pub fn bread<'a>(&'a self, dev: u32, blockno: u32) -> Buf<'a> {
        let mut b = self.bget(dev, blockno);
        if !self.bufs[b.index].valid.load(Ordering::Relaxed) {
            DISK.rw(&mut b, false);
            self.bufs[b.index].valid.store(true, Ordering::Relaxed);
        }
        b
    }

    /// 释放缓冲块引用；计数归零时移到 LRU 头部等待复用。
    fn brelse(&self, index: usize) {
        self.ctrl.lock().move_if_no_ref(index);
    }
}

/// 一个已定位的缓冲块，持有其数据睡眠锁。
///
/// 离开作用域时自动释放锁并归还引用（LRU 移动），
/// 调用者经 raw_data / raw_data_mut 访问 512 字节的数据区。
pub struct Buf<'a> {
    /// 在缓冲块池中的下标。
    index: usize,
    dev: u32,
    blockno: u32,
    /// 指向元信息中引用计数的裸指针，pin / unpin 用。
    rc_ptr: *mut usize,
    /// 数据睡眠锁的守卫，生命周期内始终为 Some。
    data: Option<SleepLockGuard<'a, BufData>>,
}

impl<'a> Buf<'a> {
    pub fn read_blockno(&self) -> u32 {
        self.blockno
    }

    /// 把缓冲块同步写入磁盘，并清除脏标记。
    pub fn bwrite(&mut self) {
        DISK.rw(self, true);
        BCACHE.bufs[self.index].dirty.store(false, Ordering::Relaxed);
    }

    /// 标记缓冲块为脏。
    /// 日志层把块登记进事务时调用；写回仍由 bwrite 显式完成。
    pub fn mark_dirty(&self) {
        BCACHE.bufs[self.index].dirty.store(true, Ordering::Relaxed);
    }

    /// 指向数据区的只读指针。
    pub fn raw_data(&self) -> *const BufData {
        let guard = self.data.as_ref().unwrap();
        guard.deref()
    }

    /// 指向数据区的可写指针。
    pub fn raw_data_mut(&mut self) -> *mut BufData {
        let guard = self.data.as_mut().unwrap();
        guard.deref_mut()
    }

    /// 把引用计数加一，钉住缓冲块防止被回收。
    ///
    /// # 安全性
    /// 必须与 unpin 配对，否则该块永远不会被复用。
    pub unsafe fn pin(&self) {
        let rc = *self.rc_ptr;
        *self.rc_ptr = rc + 1;
    }

    /// 解除 pin 施加的引用。
    ///
    /// # 安全性
    /// 必须与 pin 配对调用。
    pub unsafe fn unpin(&self) {
        let rc = *self.rc_ptr;
        if rc <= 1 {
            panic!("buf unpin not match");
        }
        *self.rc_ptr = rc - 1;
    }
}

impl<'a> Drop for Buf<'a> {
    fn drop(&mut self) {
        drop(self.data.take());
        BCACHE.brelse(self.index);
    }
}

/// 缓冲块元信息的 LRU 链表。
///
/// 从头部查找命中、从尾部回收空闲，
/// 引用计数归零的块移动到头部以延迟被替换。
struct BufLru {
    inner: [BufCtrl; NBUF],
    head: *mut BufCtrl,
    tail: *mut BufCtrl,
}

/// 裸指针默认不是 Send，这里的指针只指向结构体自身的数组。
unsafe impl Send for BufLru {}

impl BufLru {
    const fn new() -> Self {
        Self {
            inner: array![_ => BufCtrl::new(); NBUF],
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    /// 从头部查找命中的缓冲块，命中时引用计数加一。
    fn find_cached(&mut self, dev: u32, blockno: u32) -> Option<(usize, *mut usize)> {
        let mut b = self.head;
        while !b.is_null() {
            let bref = unsafe { b.as_mut().unwrap() };
            if bref.dev == dev && bref.blockno == blockno {
                bref.refcnt += 1;
                return Some((bref.index, &mut bref.refcnt));
            }
            b = bref.next;
        }
        None
    }

    /// 从尾部回收一个引用计数为零的缓冲块，改挂到新块号上。
    fn recycle(&mut self, dev: u32, blockno: u32) -> Option<(usize, *mut usize)> {
        let mut b = self.tail;
        while !b.is_null() {
            let bref = unsafe { b.as_mut().unwrap() };
            if bref.refcnt == 0 {
                bref.dev = dev;
                bref.blockno = blockno;
                bref.refcnt += 1;
                return Some((bref.index, &mut bref.refcnt));
            }
            b = bref.prev;
        }
        None
    }

    /// 引用计数减一；归零时把该块移动到链表头部。
    fn move_if_no_ref(&mut self, index: usize) {
        let b = &mut self.inner[index];
        b.refcnt -= 1;
        if b.refcnt == 0 && !ptr::eq(self.head, b) {
            // b 在尾部时先前移尾指针
            if ptr::eq(self.tail, b) && !b.prev.is_null() {
                self.tail = b.prev;
            }

            // 摘下 b
            unsafe {
                b.next.as_mut().map(|b_next| b_next.prev = b.prev);
                b.prev.as_mut().map(|b_prev| b_prev.next = b.next);
            }

            // 接回头部
            b.prev = ptr::null_mut();
            b.next = self.head;
            unsafe {
                self.head.as_mut().map(|old_head| old_head.prev = b);
            }
            self.head = b;
        }
    }
}

/// 单个缓冲块的元信息与链表指针。
struct BufCtrl {
    dev: u32,
    blockno: u32,
    prev: *mut BufCtrl,
    next: *mut BufCtrl,
    /// 活跃引用数；日志 pin 的块计数不归零，不会被回收。
    refcnt: usize,
    /// 在缓冲块池中的下标。
    index: usize,
}

impl BufCtrl {
    const fn new() -> Self {
        Self {
            dev: 0,
            blockno: 0,
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
            refcnt: 0,
            index: 0,
        }
    }
}

/// 缓冲块的数据与状态位。
struct BufInner {
    /// 数据区是否已从磁盘装载。
    valid: AtomicBool,
    /// 自上次写回以来是否被日志层修改过。
    dirty: AtomicBool,
    /// 512 字节的块数据，由睡眠锁保护。
    data: SleepLock<BufData>,
}

impl BufInner {
    const fn new() -> Self {
        Self {
            valid: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            data: SleepLock::new(BufData::new(), "BufData"),
        }
    }
}

/// 块数据区。
/// 对齐到 8 字节，保证超级块 / 日志头 / dinode 等
/// 结构体可以直接按指针从中读取。
#[repr(C, align(8))]
pub struct BufData([u8; BSIZE]);

impl BufData {
    const fn new() -> Self {
        Self([0; BSIZE])
    }
}
