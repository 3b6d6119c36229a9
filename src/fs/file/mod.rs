//! 文件以及管道相关的操作

use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::consts::driver::NDEV;
use crate::consts::fs::{NFILE, O_CREATE, O_RDONLY, O_RDWR, O_WRONLY};
use crate::mm::Address;

use super::inode::FileStat;
use super::{Inode, InodeType, ICACHE};

pub(crate) mod pipe;

pub use pipe::Pipe;

/// 全系统当前存活的打开文件数量，上限为 NFILE。
static FILES_IN_USE: AtomicUsize = AtomicUsize::new(0);

/// 打开文件的内核抽象。
///
/// 统一表示常规文件、设备文件与管道三类实体，由
/// `Arc<File>` 管理引用计数：dup 与 fork 克隆同一个 `Arc`，
/// 引用归零时关闭底层资源。常规文件的读写偏移保存在这里，
/// 因此复制出的描述符共享同一个偏移。
#[derive(Debug)]
pub struct File {
    /// 按文件类别携带各自的资源句柄。
    inner: FileInner,
    readable: bool,
    writable: bool,
}

unsafe impl Send for File {}
unsafe impl Sync for File {}

impl File {
    /// 打开（或创建）路径对应的文件。
    ///
    /// # 流程解释
    /// 1. 路径解析失败且带有创建标志时，在根目录下新建文件；
    /// 2. 文件存在后去掉创建标志，余下的值即访问模式；
    /// 3. 目录只允许只读打开，设备 inode 校验设备号合法；
    /// 4. 占用一个全局文件名额并构造 `Arc<File>`。
    ///
    /// # 参数
    /// - `path`: 以空字节结尾的路径
    /// - `mode`: 打开模式，`O_RDONLY`/`O_WRONLY`/`O_RDWR`，
    ///   可叠加 `O_CREATE`
    ///
    /// # 返回值
    /// - `Some(file)`: 打开成功
    /// - `None`: 路径不存在且未要求创建、创建失败、模式不合法
    ///   或全局文件名额耗尽
    pub fn open(path: &[u8], mode: i32) -> Option<Arc<Self>> {
        let inode = match ICACHE.namei(path) {
            Some(i) => i,
            None => {
                if mode < O_CREATE {
                    return None;
                }
                ICACHE.addfile(path)?
            }
        };
        let mode = if mode >= O_CREATE { mode - O_CREATE } else { mode };

        let readable = mode == O_RDONLY || mode == O_RDWR;
        let writable = mode == O_WRONLY || mode == O_RDWR;

        let idata = inode.lock();
        let inner;
        match idata.get_itype() {
            InodeType::Empty => panic!("file: open an empty inode"),
            InodeType::Directory => {
                if mode != O_RDONLY {
                    drop(idata);
                    return None;
                }
                drop(idata);
                inner = FileInner::Regular(FileRegular {
                    offset: UnsafeCell::new(0),
                    inode: Some(inode),
                });
            }
            InodeType::File => {
                drop(idata);
                inner = FileInner::Regular(FileRegular {
                    offset: UnsafeCell::new(0),
                    inode: Some(inode),
                });
            }
            InodeType::Device => {
                let devid = idata.get_devid();
                if devid < 0 || devid as usize >= NDEV {
                    drop(idata);
                    return None;
                }
                drop(idata);
                inner = FileInner::Device(FileDevice {
                    inode: Some(inode),
                });
            }
        }

        reserve_file_slot()?;
        match Arc::try_new(File {
            inner,
            readable,
            writable,
        }) {
            Ok(f) => Some(f),
            Err(_) => {
                FILES_IN_USE.fetch_sub(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// 从文件读出至多 count 字节到用户地址 addr。
    ///
    /// 管道走管道的阻塞读；常规文件在 inode 锁内读取并推进
    /// 偏移（读到文件末尾自然截断）；设备 inode 由 inode 层
    /// 分发到设备函数表。
    pub fn fread(&self, addr: usize, count: u32) -> Result<u32, ()> {
        if !self.readable {
            return Err(());
        }

        match self.inner {
            FileInner::Pipe(ref pipe) => pipe.read(addr, count),
            FileInner::Regular(ref file) => {
                let mut idata = file.inode.as_ref().unwrap().lock();
                let offset = unsafe { &mut *file.offset.get() };
                match idata.readi(Address::Virtual(addr), *offset, count) {
                    Ok(read_count) => {
                        *offset += read_count;
                        drop(idata);
                        Ok(read_count)
                    }
                    Err(()) => Err(()),
                }
            }
            FileInner::Device(ref dev) => {
                let mut idata = dev.inode.as_ref().unwrap().lock();
                idata.readi(Address::Virtual(addr), 0, count)
            }
        }
    }

    /// 把用户地址 addr 处的 count 字节写入文件。
    ///
    /// 常规文件的每个被触及的块由 inode 层包成独立事务，
    /// 成功后推进偏移。
    pub fn fwrite(&self, addr: usize, count: u32) -> Result<u32, ()> {
        if !self.writable {
            return Err(());
        }

        match self.inner {
            FileInner::Pipe(ref pipe) => pipe.write(addr, count),
            FileInner::Regular(ref file) => {
                let mut idata = file.inode.as_ref().unwrap().lock();
                let offset = unsafe { &mut *file.offset.get() };
                match idata.writei(Address::Virtual(addr), *offset, count) {
                    Ok(written) => {
                        *offset += written;
                        drop(idata);
                        Ok(written)
                    }
                    Err(()) => Err(()),
                }
            }
            FileInner::Device(ref dev) => {
                let mut idata = dev.inode.as_ref().unwrap().lock();
                idata.writei(Address::Virtual(addr), 0, count)
            }
        }
    }

    /// 查询文件的状态信息。
    /// 管道没有 inode，不支持状态查询。
    pub fn fstat(&self, stat: &mut FileStat) -> Result<(), ()> {
        let inode: &Inode;
        match self.inner {
            FileInner::Pipe(_) => return Err(()),
            FileInner::Regular(ref file) => inode = file.inode.as_ref().unwrap(),
            FileInner::Device(ref dev) => inode = dev.inode.as_ref().unwrap(),
        }
        let idata = inode.lock();
        idata.istat(stat);
        Ok(())
    }
}

impl Drop for File {
    /// 最后一个引用消失时关闭文件。
    /// 管道端关闭会唤醒对端；inode 引用随之归还缓存。
    fn drop(&mut self) {
        match self.inner {
            FileInner::Pipe(ref pipe) => pipe.close(self.writable),
            FileInner::Regular(ref mut file) => {
                drop(file.inode.take());
            }
            FileInner::Device(ref mut dev) => {
                drop(dev.inode.take());
            }
        }
        FILES_IN_USE.fetch_sub(1, Ordering::Relaxed);
    }
}

/// 退还一个全局打开文件名额。
pub(super) fn release_file_slot() {
    FILES_IN_USE.fetch_sub(1, Ordering::Relaxed);
}

/// 占用一个全局打开文件名额，超过 NFILE 时失败。
pub(super) fn reserve_file_slot() -> Option<()> {
    FILES_IN_USE
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
            if n < NFILE {
                Some(n + 1)
            } else {
                None
            }
        })
        .ok()
        .map(|_| ())
}

/// 文件内部的具体类别。
#[derive(Debug)]
enum FileInner {
    /// 管道端，引用计数共享管道体。
    Pipe(Arc<Pipe>),
    /// 常规文件，带读写偏移与 inode。
    Regular(FileRegular),
    /// 设备文件，读写经 inode 层分发到设备函数表。
    Device(FileDevice),
}

/// 常规文件的内部状态。
#[derive(Debug)]
struct FileRegular {
    /// 读写偏移。`UnsafeCell` 提供内部可变性，
    /// 实际访问由 inode 的睡眠锁串行化。
    offset: UnsafeCell<u32>,
    /// 关闭时经 `Option::take` 释放。
    inode: Option<Inode>,
}

/// 设备文件的内部状态。
#[derive(Debug)]
struct FileDevice {
    inode: Option<Inode>,
}
