//! 自旋锁模块
//! 自旋锁把数据包裹在自身内部，持锁期间关闭本地中断。

use core::cell::{Cell, UnsafeCell};
use core::ops::{Deref, DerefMut, Drop};
use core::sync::atomic::{fence, AtomicBool, Ordering};

use crate::process::{pop_off, push_off, CpuManager};

/// 忙等互斥锁，用于保护内核中的共享数据。
///
/// 获取锁时先通过 [`push_off`] 关闭本地中断（防止中断处理程序
/// 再次请求同一把锁造成死锁），随后以原子交换忙等。
/// 锁内记录当前持有者的 CPU 编号，同一 CPU 重复获取会直接 panic。
///
/// # 类型参数
/// - `T`: 被保护的数据类型，可以是不定长类型（`?Sized`）。
#[derive(Debug)]
pub struct SpinLock<T: ?Sized> {
    lock: AtomicBool,
    name: &'static str,
    cpuid: Cell<isize>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// 创建一把新的自旋锁，name 仅用于调试输出。
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: AtomicBool::new(false),
            name,
            cpuid: Cell::new(-1),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// 获取自旋锁并返回守卫对象。
    ///
    /// 守卫实现了 `Deref` / `DerefMut`，可直接访问被保护数据；
    /// 守卫离开作用域时自动释放锁并恢复中断计数。
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        SpinLockGuard {
            lock: &self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 当前 CPU 是否持有此锁。
    /// 必须在中断关闭的情况下调用。
    unsafe fn holding(&self) -> bool {
        self.lock.load(Ordering::Relaxed) && (self.cpuid.get() == CpuManager::cpu_id() as isize)
    }

    fn acquire(&self) {
        push_off();
        if unsafe { self.holding() } {
            panic!("spinlock {} acquire", self.name);
        }
        while self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Acquire)
            .is_err()
        {}
        fence(Ordering::SeqCst);
        unsafe { self.cpuid.set(CpuManager::cpu_id() as isize) };
    }

    fn release(&self) {
        if unsafe { !self.holding() } {
            panic!("spinlock {} release", self.name);
        }
        self.cpuid.set(-1);
        fence(Ordering::SeqCst);
        self.lock.store(false, Ordering::Release);
        pop_off();
    }

    /// 不经过守卫直接释放锁。
    ///
    /// # 安全性
    /// 仅用于 fork_ret 这类从调度器手中接过锁的特殊路径，
    /// 调用者必须确实持有该锁，并且此后不再访问被保护数据。
    pub unsafe fn unlock(&self) {
        self.release();
    }
}

/// 自旋锁守卫，存在即代表锁被持有。
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl<'a, T> SpinLockGuard<'a, T> {
    /// 当前 CPU 是否持有守卫对应的锁，调试用。
    /// 必须在中断关闭的情况下调用。
    pub unsafe fn holding(&self) -> bool {
        self.lock.holding()
    }
}

#[cfg(feature = "unit_test")]
pub mod tests {
    use super::*;

    /// 基础功能：取锁、改数据、守卫自动释放后可再次取锁。
    pub fn smoke() {
        let m = SpinLock::new(0usize, "smoke");
        {
            let mut g = m.lock();
            *g = 42;
        }
        assert_eq!(*m.lock(), 42);
    }
}
