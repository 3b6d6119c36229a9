//! 管道操作

use alloc::sync::Arc;
use core::cmp::min;
use core::mem;
use core::sync::atomic::Ordering;

use crate::consts::PGSIZE;
use crate::mm::Address;
use crate::process::{CPU_MANAGER, PROC_MANAGER};
use crate::spinlock::SpinLock;

use super::{File, FileInner};

/// 环形缓冲区的容量：一页减去管道头部的预算。
pub const PIPESIZE: usize = PGSIZE - 128;

/// 用户内存与环形缓冲区之间的中转块大小。
/// 用户页的复制可能触发换入而休眠，不能在持管道锁时进行，
/// 因此数据先经内核栈上的中转缓冲区倒一次手。
const CHUNK: usize = 512;

/// 进程间的单向字节流。
///
/// 整个管道（头部加环形缓冲区）占据一次页大小的分配。
/// head / tail 是单调递增的 64 位计数器，取模得到缓冲区
/// 下标，二者之差即缓冲的字节数；读写两端各有一个打开
/// 标志，休眠通道就取这两个标志的地址。
#[derive(Debug)]
pub struct Pipe(SpinLock<PipeInner>);

impl Pipe {
    /// 创建一个管道，返回读写两端的文件。
    ///
    /// # 流程解释
    /// 分配一个页大小的管道体，置两端为打开状态，
    /// 再构造一个只读文件与一个只写文件共享它。
    /// 任何一步分配失败都返回 None。
    pub fn create() -> Option<(Arc<File>, Arc<File>)> {
        debug_assert!(mem::size_of::<Pipe>() + 16 <= PGSIZE);

        // 读写两端各占一个全局文件名额
        super::reserve_file_slot()?;
        if super::reserve_file_slot().is_none() {
            super::release_file_slot();
            return None;
        }

        let pipe = match Arc::<Self>::try_new(Pipe(SpinLock::new(
            PipeInner {
                read_open: true,
                write_open: true,
                head: 0,
                tail: 0,
                data: [0; PIPESIZE],
            },
            "pipe",
        ))) {
            Ok(p) => p,
            Err(_) => {
                super::release_file_slot();
                super::release_file_slot();
                return None;
            }
        };

        let read_file = match Arc::try_new(File {
            inner: FileInner::Pipe(Arc::clone(&pipe)),
            readable: true,
            writable: false,
        }) {
            Ok(f) => f,
            Err(_) => {
                // 还没有任何 File 建成，两端标志与名额手动收场
                pipe.close(false);
                pipe.close(true);
                super::release_file_slot();
                super::release_file_slot();
                return None;
            }
        };
        let write_file = match Arc::try_new(File {
            inner: FileInner::Pipe(Arc::clone(&pipe)),
            readable: false,
            writable: true,
        }) {
            Ok(f) => f,
            Err(_) => {
                // 写端没建起来：手动关写端，读端随 read_file 销毁收场
                pipe.close(true);
                super::release_file_slot();
                drop(read_file);
                return None;
            }
        };

        Some((read_file, write_file))
    }

    /// 从管道读出至多 count 字节到用户地址 addr。
    ///
    /// # 流程解释
    /// 缓冲区为空且写端仍打开时，在写端标志的地址上休眠；
    /// 写端已关闭的空管道返回 0 表示文件结束。
    /// 有数据后按中转块逐段搬运：持锁把环形缓冲区的内容
    /// （可能跨越末尾，分前后两段）倒进栈上的中转缓冲区并
    /// 推进 head，放锁唤醒等空间的写者，再复制到用户内存。
    /// 管道被读空即返回，不再等待后续数据。
    ///
    /// # 返回值
    /// - `Ok(n)`: 实际读出的字节数
    /// - `Ok(0)`: 写端已关闭且缓冲区为空（EOF）
    /// - `Err(())`: 等待期间进程被终止
    pub(super) fn read(&self, addr: usize, count: u32) -> Result<u32, ()> {
        let p = unsafe { CPU_MANAGER.my_proc() };
        let mut chunk = [0u8; CHUNK];

        let mut pipe = self.0.lock();
        while pipe.head == pipe.tail {
            if !pipe.write_open {
                return Ok(0);
            }
            if p.killed.load(Ordering::Relaxed) {
                return Err(());
            }
            let channel = &pipe.write_open as *const bool as usize;
            p.sleep(channel, pipe);
            pipe = self.0.lock();
        }

        let want = count as usize;
        let mut dst = Address::Virtual(addr);
        let mut tot = 0usize;
        while tot < want && pipe.head != pipe.tail {
            let n = min(min(want - tot, (pipe.tail - pipe.head) as usize), CHUNK);
            let (first, second) = spans(pipe.head, n);
            let head_index = (pipe.head % PIPESIZE as u64) as usize;
            chunk[..first].copy_from_slice(&pipe.data[head_index..head_index + first]);
            if second > 0 {
                chunk[first..n].copy_from_slice(&pipe.data[..second]);
            }
            pipe.head += n as u64;

            // 放锁后唤醒写者并复制到用户空间
            let channel = &pipe.read_open as *const bool as usize;
            drop(pipe);
            unsafe {
                PROC_MANAGER.wakeup(channel);
            }
            if dst.copy_out(chunk.as_ptr(), n).is_err() {
                return Ok(tot as u32);
            }
            dst = dst.offset(n);
            tot += n;
            pipe = self.0.lock();
        }
        drop(pipe);

        Ok(tot as u32)
    }

    /// 把用户地址 addr 处的 count 字节写入管道。
    ///
    /// # 流程解释
    /// 按中转块推进：先在无锁状态把用户数据取到栈上的
    /// 中转缓冲区，再持锁写入环形缓冲区。缓冲区满时唤醒
    /// 读者并在读端标志的地址上休眠；写入跨越缓冲区末尾时
    /// 先填满尾部再从头部续写。读端关闭即失败。
    ///
    /// # 返回值
    /// - `Ok(n)`: 实际写入的字节数
    /// - `Err(())`: 读端已关闭，或等待期间进程被终止
    pub(super) fn write(&self, addr: usize, count: u32) -> Result<u32, ()> {
        let p = unsafe { CPU_MANAGER.my_proc() };
        let mut chunk = [0u8; CHUNK];

        let want = count as usize;
        let mut src = Address::Virtual(addr);
        let mut tot = 0usize;
        while tot < want {
            let n = min(want - tot, CHUNK);
            if src.copy_in(chunk.as_mut_ptr(), n).is_err() {
                return if tot > 0 { Ok(tot as u32) } else { Err(()) };
            }

            let mut pipe = self.0.lock();
            let mut done = 0usize;
            while done < n {
                if !pipe.read_open || p.killed.load(Ordering::Relaxed) {
                    return Err(());
                }
                let space = PIPESIZE - (pipe.tail - pipe.head) as usize;
                if space == 0 {
                    // 缓冲区满：唤醒读者后在读端标志上休眠
                    let readers = &pipe.write_open as *const bool as usize;
                    unsafe {
                        PROC_MANAGER.wakeup(readers);
                    }
                    let channel = &pipe.read_open as *const bool as usize;
                    p.sleep(channel, pipe);
                    pipe = self.0.lock();
                    continue;
                }
                let m = min(n - done, space);
                let (first, second) = spans(pipe.tail, m);
                let tail_index = (pipe.tail % PIPESIZE as u64) as usize;
                pipe.data[tail_index..tail_index + first]
                    .copy_from_slice(&chunk[done..done + first]);
                if second > 0 {
                    pipe.data[..second].copy_from_slice(&chunk[done + first..done + m]);
                }
                pipe.tail += m as u64;
                done += m;
            }
            let channel = &pipe.write_open as *const bool as usize;
            drop(pipe);
            unsafe {
                PROC_MANAGER.wakeup(channel);
            }
            src = src.offset(n);
            tot += n;
        }

        Ok(tot as u32)
    }

    /// 关闭管道的一端。
    ///
    /// 清掉对应的打开标志，并在该标志的地址上唤醒：
    /// 写端关闭唤醒等数据的读者（它们随后读到 EOF），
    /// 读端关闭唤醒等空间的写者（它们随后得到错误）。
    pub(super) fn close(&self, is_write: bool) {
        let mut pipe = self.0.lock();
        let channel = if is_write {
            pipe.write_open = false;
            &pipe.write_open as *const bool as usize
        } else {
            pipe.read_open = false;
            &pipe.read_open as *const bool as usize
        };
        drop(pipe);
        unsafe {
            PROC_MANAGER.wakeup(channel);
        }
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        // 两端都关闭后才会走到这里，页随之释放
        debug_assert!({
            let guard = self.0.lock();
            !guard.read_open && !guard.write_open
        });
    }
}

/// 从计数器位置 pos 起搬运 n 字节时跨越缓冲区末尾的切分。
#[inline]
fn spans(pos: u64, n: usize) -> (usize, usize) {
    let offset = (pos % PIPESIZE as u64) as usize;
    let first = min(n, PIPESIZE - offset);
    (first, n - first)
}

/// 管道的内部状态。
#[derive(Debug)]
struct PipeInner {
    /// 读端是否打开；关闭后写入返回错误。
    read_open: bool,
    /// 写端是否打开；关闭后空管道的读取返回 EOF。
    write_open: bool,
    /// 读位置，单调递增。
    head: u64,
    /// 写位置，单调递增，`tail - head` 即缓冲的字节数。
    tail: u64,
    /// 环形缓冲区。
    data: [u8; PIPESIZE],
}

#[cfg(feature = "unit_test")]
pub mod tests {
    use super::*;

    /// 环形缓冲区跨越末尾时的切分算术。
    pub fn pipe_ring() {
        // 不跨界：全部落在第一段
        assert_eq!(spans(0, 10), (10, 0));
        // 正好写到末尾
        assert_eq!(spans((PIPESIZE - 8) as u64, 8), (8, 0));
        // 跨界：前段到末尾，后段从头开始
        assert_eq!(spans((PIPESIZE - 3) as u64, 8), (3, 5));
        // 计数器超过容量整数倍后按取模定位
        let pos = (PIPESIZE * 3 + 5) as u64;
        assert_eq!(spans(pos, PIPESIZE - 5), (PIPESIZE - 5, 0));
    }
}
