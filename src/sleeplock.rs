//! 睡眠锁模块
//! 基于进程休眠 / 唤醒机制的同步原语，适合可能长时间持有的锁。
//!
//! 与自旋锁不同，锁被占用时等待者让出 CPU 而不是忙等，
//! 因此睡眠锁可以跨越会阻塞的磁盘 IO 持有。

use core::cell::{Cell, UnsafeCell};
use core::ops::{Deref, DerefMut, Drop};

use crate::process::{CPU_MANAGER, PROC_MANAGER};
use crate::spinlock::SpinLock;

/// 阻塞式互斥锁。
///
/// 内部由一把小自旋锁保护 `locked` 标志与持有者 pid；
/// 获取失败的进程在 `locked` 字段的地址上休眠，
/// 释放时唤醒所有等待者重新竞争。
///
/// # 字段说明
/// - `lock`: 保护内部状态的自旋锁
/// - `locked`: 锁是否被占用
/// - `pid`: 当前持有者的进程号（未持有时无意义）
/// - `name`: 调试名称
/// - `data`: 被保护的数据
pub struct SleepLock<T: ?Sized> {
    lock: SpinLock<()>,
    locked: Cell<bool>,
    pid: Cell<usize>,
    name: &'static str,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: SpinLock::new((), "sleeplock"),
            locked: Cell::new(false),
            pid: Cell::new(0),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// 获取睡眠锁，锁被占用时当前进程进入休眠。
    ///
    /// # 流程解释
    /// 1. 先取内部自旋锁保护 `locked` 标志；
    /// 2. 若已被占用，在 `locked` 的地址上休眠，醒来后重试；
    /// 3. 占有锁后记录当前进程号，返回守卫。
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut guard = self.lock.lock();

        while self.locked.get() {
            unsafe {
                CPU_MANAGER.my_proc().sleep(self.locked.as_ptr() as usize, guard);
            }
            guard = self.lock.lock();
        }
        self.locked.set(true);
        self.pid.set(unsafe { CPU_MANAGER.my_proc() }.pid());
        drop(guard);

        SleepLockGuard {
            lock: &self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 当前进程是否持有此锁。
    pub fn holding(&self) -> bool {
        let guard = self.lock.lock();
        let ret = self.locked.get() && self.pid.get() == unsafe { CPU_MANAGER.my_proc() }.pid();
        drop(guard);
        ret
    }

    /// 释放锁并唤醒等待者（由守卫的 Drop 调用）。
    fn unlock(&self) {
        let guard = self.lock.lock();
        self.locked.set(false);
        self.pid.set(0);
        unsafe {
            PROC_MANAGER.wakeup(self.locked.as_ptr() as usize);
        }
        drop(guard);
    }
}

/// 睡眠锁守卫，存在即代表锁被持有。
pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
