//! 索引节点层

use array_macro::array;

use core::cmp::min;
use core::{mem, ptr};

use crate::consts::driver::NDEV;
use crate::consts::fs::{
    BSIZE, DIRSIZ, EXTENTBLOCKS, INODEFILEINO, MAXFILESIZE, NEXTENT, NINODE, ROOTDEV, ROOTINUM,
};
use crate::driver::DEVICES;
use crate::mm::Address;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::SpinLock;

use super::block::balloc;
use super::{BufData, BCACHE, LOG, SUPER_BLOCK};

/// 全局 inode 缓存。
///
/// 磁盘上的 inode 并不分布在固定的 inode 区里，而是集中存放在
/// 一个普通文件（inode 文件，inum 0）的内容中；新建文件就是向
/// inode 文件追加一条 dinode。缓存为活跃 inode 提供内存副本、
/// 引用计数与互斥，inode 文件自身在缓存里有一个常驻条目。
pub static ICACHE: InodeCache = InodeCache::new();

pub struct InodeCache {
    /// 各缓存槽的元信息（设备号、inode 号、引用计数）。
    meta: SpinLock<[InodeMeta; NINODE]>,
    /// 各缓存槽的 dinode 副本，由各自的睡眠锁保护。
    data: [SleepLock<InodeData>; NINODE],
    /// inode 文件的常驻副本。
    /// 读写任何 dinode 都要经过它，锁序固定为先普通 inode 后它。
    inodefile: SleepLock<InodeData>,
}

impl InodeCache {
    const fn new() -> Self {
        Self {
            meta: SpinLock::new(array![_ => InodeMeta::new(); NINODE], "InodeMeta"),
            data: array![_ => SleepLock::new(InodeData::new(), "InodeData"); NINODE],
            inodefile: SleepLock::new(InodeData::new(), "InodeFile"),
        }
    }

    /// 装载 inode 文件自身的 dinode。
    ///
    /// inode 文件的 dinode 是它自己内容的第一条记录，
    /// 固定落在 inode 区的第一个块上，直接从那里读出。
    ///
    /// # 安全性
    /// 必须在文件系统初始化时调用一次。
    pub unsafe fn init(&self, dev: u32) {
        let mut ifile = self.inodefile.lock();
        debug_assert!(ifile.valid.is_none());

        let buf = BCACHE.bread(dev, SUPER_BLOCK.inode_start());
        ifile.dinode = ptr::read(buf.raw_data() as *const DiskInode);
        drop(buf);
        ifile.valid = Some((dev, INODEFILEINO));
        if ifile.dinode.itype == InodeType::Empty {
            panic!("inode file: empty dinode");
        }
        drop(ifile);
    }

    /// 在缓存中定位 (dev, inum)，未缓存时占用一个空闲槽。
    ///
    /// 返回的句柄带引用计数；dinode 内容推迟到第一次
    /// [`Inode::lock`] 时才从磁盘装载。
    ///
    /// # Panics
    /// 缓存槽耗尽时 panic。
    fn get(&self, dev: u32, inum: u32) -> Inode {
        let mut guard = self.meta.lock();

        let mut empty_i: Option<usize> = None;
        for i in 0..NINODE {
            if guard[i].inum == inum && guard[i].refs > 0 && guard[i].dev == dev {
                guard[i].refs += 1;
                return Inode { dev, inum, index: i };
            }
            if empty_i.is_none() && guard[i].refs == 0 {
                empty_i = Some(i);
            }
        }

        let empty_i = match empty_i {
            Some(i) => i,
            None => panic!("inode: not enough"),
        };
        guard[empty_i].dev = dev;
        guard[empty_i].inum = inum;
        guard[empty_i].refs = 1;
        Inode {
            dev,
            inum,
            index: empty_i,
        }
    }

    /// 通过引用计数克隆一个 inode 句柄。
    fn dup(&self, inode: &Inode) -> Inode {
        let mut guard = self.meta.lock();
        guard[inode.index].refs += 1;
        Inode {
            dev: inode.dev,
            inum: inode.inum,
            index: inode.index,
        }
    }

    /// 归还一个 inode 句柄的引用。
    ///
    /// 磁盘上的 inode 没有删除操作，引用计数归零时只需作废
    /// 缓存内容，槽位即可复用。
    fn put(&self, inode: &mut Inode) {
        let mut guard = self.meta.lock();
        let i = inode.index;
        if guard[i].refs == 1 {
            // 引用计数为 1，数据锁必然无人持有，不会阻塞
            let mut idata = self.data[i].lock();
            idata.valid.take();
            drop(idata);
        }
        guard[i].refs -= 1;
        drop(guard);
    }

    /// 从 inode 文件读出编号 inum 的 dinode。
    fn read_dinode(&self, inum: u32, dinode: &mut DiskInode) {
        let mut ifile = self.inodefile.lock();
        let dst = Address::KernelMut(dinode as *mut DiskInode as *mut u8);
        ifile
            .readi(dst, inum * INODE_SIZE, INODE_SIZE)
            .expect("read dinode");
        drop(ifile);
    }

    /// 把编号 inum 的 dinode 写回 inode 文件。
    /// 必须在事务中调用。
    fn write_dinode(&self, inum: u32, dinode: &DiskInode) {
        let mut ifile = self.inodefile.lock();
        let src = Address::Kernel(dinode as *const DiskInode as *const u8);
        match ifile.writei(src, inum * INODE_SIZE, INODE_SIZE) {
            Ok(n) if n as usize == mem::size_of::<DiskInode>() => {}
            _ => panic!("write dinode"),
        }
        drop(ifile);
    }

    /// 路径解析的公共部分。
    ///
    /// # 流程解释
    /// 路径总是从根目录（inum 1）出发：前导斜杠被折叠，
    /// 每个路径分量拷入 name 后在当前目录中查找下一级。
    /// is_parent 为真时在最后一个分量之前停住，
    /// 返回父目录并把最后一个分量留在 name 里。
    fn namex(&self, path: &[u8], name: &mut [u8; DIRSIZ], is_parent: bool) -> Option<Inode> {
        let mut inode = self.get(ROOTDEV, ROOTINUM);

        let mut cur: usize = 0;
        loop {
            cur = skip_path(path, cur, name);
            if cur == 0 {
                break;
            }
            let mut data_guard = inode.lock();
            if data_guard.dinode.itype != InodeType::Directory {
                drop(data_guard);
                return None;
            }
            if is_parent && path[cur] == 0 {
                drop(data_guard);
                return Some(inode);
            }
            match data_guard.dir_lookup(name) {
                None => {
                    drop(data_guard);
                    return None;
                }
                Some(next_inode) => {
                    drop(data_guard);
                    inode = next_inode;
                }
            }
        }

        if is_parent {
            // 只有查询根目录的父目录时会走到这里
            None
        } else {
            Some(inode)
        }
    }

    /// 解析路径，返回对应的 inode。
    pub fn namei(&self, path: &[u8]) -> Option<Inode> {
        let mut name: [u8; DIRSIZ] = [0; DIRSIZ];
        self.namex(path, &mut name, false)
    }

    /// 解析路径，返回父目录的 inode，最后一个分量留在 name 中。
    pub fn namei_parent(&self, path: &[u8], name: &mut [u8; DIRSIZ]) -> Option<Inode> {
        self.namex(path, name, true)
    }

    /// 在根目录下创建一个普通文件。
    ///
    /// # 流程解释
    /// 整个创建在一个事务里完成：
    /// 1. 预分配一个 32 块的 extent，组装新的 dinode；
    /// 2. 把 dinode 追加到 inode 文件末尾，inum 即其下标；
    /// 3. 向根目录追加一条指向新 inode 的目录项。
    ///
    /// # 返回值
    /// - `Some(inode)`: 新文件的句柄
    /// - `None`: 路径不合法（不是根目录下的单级名字）
    pub fn addfile(&self, path: &[u8]) -> Option<Inode> {
        let mut name: [u8; DIRSIZ] = [0; DIRSIZ];
        let dir_inode = self.namei_parent(path, &mut name)?;
        if dir_inode.inum != ROOTINUM {
            return None;
        }

        LOG.begin_tx();

        // 组装带一个预分配 extent 的新 dinode
        let mut dinode = DiskInode::new();
        dinode.itype = InodeType::File;
        dinode.devid = ROOTDEV as i16;
        dinode.size = 0;
        dinode.extents[0] = Extent {
            startblkno: balloc(ROOTDEV),
            nblocks: EXTENTBLOCKS as u32,
        };

        // 追加到 inode 文件末尾
        let mut ifile = self.inodefile.lock();
        let offset = ifile.dinode.size;
        let src = Address::Kernel(&dinode as *const DiskInode as *const u8);
        match ifile.writei(src, offset, INODE_SIZE) {
            Ok(n) if n == INODE_SIZE => {}
            _ => {
                drop(ifile);
                LOG.commit_tx();
                return None;
            }
        }
        let inum = ifile.dinode.size / INODE_SIZE - 1;
        drop(ifile);

        // 根目录追加目录项
        let mut dir_idata = dir_inode.lock();
        if dir_idata.dir_append(&name, inum).is_err() {
            drop(dir_idata);
            LOG.commit_tx();
            return None;
        }
        drop(dir_idata);
        drop(dir_inode);

        LOG.commit_tx();

        Some(self.get(ROOTDEV, inum))
    }
}

/// 从 path 的 cur 位置取出一个路径分量写入 name，
/// 返回下一个未处理字符的位置；路径结束时返回 0。
///
/// 前导与后随的斜杠都被折叠，分量超过 DIRSIZ 时截断。
fn skip_path(path: &[u8], mut cur: usize, name: &mut [u8; DIRSIZ]) -> usize {
    while path[cur] == b'/' {
        cur += 1;
    }
    if path[cur] == 0 {
        return 0;
    }

    let start = cur;
    while path[cur] != b'/' && path[cur] != 0 {
        cur += 1;
    }
    let count = min(cur - start, DIRSIZ);
    name.fill(0);
    name[..count].copy_from_slice(&path[start..start + count]);

    while path[cur] == b'/' {
        cur += 1;
    }
    cur
}

/// 活跃 inode 的轻量句柄。
///
/// 只携带定位信息，实际数据经 [`Inode::lock`] 访问；
/// 克隆与销毁即引用计数的增减。
#[derive(Debug)]
pub struct Inode {
    dev: u32,
    inum: u32,
    /// 在缓存中的槽位下标。
    index: usize,
}

impl Clone for Inode {
    fn clone(&self) -> Self {
        ICACHE.dup(self)
    }
}

impl Inode {
    pub fn inum(&self) -> u32 {
        self.inum
    }

    /// 锁住 inode 并返回其数据守卫，首次访问时装载 dinode。
    ///
    /// # 流程解释
    /// dinode 的装载经由 inode 文件的一次常规读完成，
    /// 这会短暂地拿住 inode 文件的睡眠锁；锁序固定为
    /// 先普通 inode、后 inode 文件，与写回路径一致。
    pub fn lock<'a>(&'a self) -> SleepLockGuard<'a, InodeData> {
        let mut guard = ICACHE.data[self.index].lock();

        if guard.valid.is_none() {
            let mut dinode = DiskInode::new();
            ICACHE.read_dinode(self.inum, &mut dinode);
            guard.dinode = dinode;
            guard.valid = Some((self.dev, self.inum));
            if guard.dinode.itype == InodeType::Empty {
                panic!("inode: lock an empty inode");
            }
        }

        guard
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        ICACHE.put(self);
    }
}

/// 缓存槽的元信息。
struct InodeMeta {
    dev: u32,
    inum: u32,
    refs: usize,
}

impl InodeMeta {
    const fn new() -> Self {
        Self {
            dev: 0,
            inum: 0,
            refs: 0,
        }
    }
}

/// inode 在内存中的副本。
#[derive(Debug)]
pub struct InodeData {
    /// `Some((dev, inum))` 表示 dinode 已装载。
    valid: Option<(u32, u32)>,
    dinode: DiskInode,
}

impl InodeData {
    const fn new() -> Self {
        Self {
            valid: None,
            dinode: DiskInode::new(),
        }
    }

    #[inline]
    pub fn get_itype(&self) -> InodeType {
        self.dinode.itype
    }

    #[inline]
    pub fn get_devid(&self) -> i16 {
        self.dinode.devid
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.dinode.size
    }

    /// 本条目是否就是 inode 文件。
    #[inline]
    fn is_inodefile(&self) -> bool {
        matches!(self.valid, Some((_, INODEFILEINO)))
    }

    /// 从 inode 读出数据。
    ///
    /// # 功能说明
    /// 设备 inode 分发到设备函数表；普通文件沿 extent 表
    /// 逐块行走，从 off 开始复制至多 n 字节到 dst，
    /// 读取范围超出文件大小时截断。
    ///
    /// # 流程解释
    /// 行走以文件块号 foff 为游标：extoff 走到当前 extent
    /// 末尾就切到下一个 extent；foff 进入 off 覆盖的块之后
    /// 才开始真正复制，每块最多复制到块尾。
    ///
    /// # 返回值
    /// - `Ok(n)`: 实际读出的字节数
    /// - `Err(())`: 起始偏移越过文件末尾 / 偏移溢出 / 设备读失败
    pub fn readi(&mut self, mut dst: Address, off: u32, n: u32) -> Result<u32, ()> {
        if self.dinode.itype == InodeType::Device {
            let devid = self.dinode.devid;
            if devid < 0 || devid as usize >= NDEV {
                return Err(());
            }
            let dev_read = DEVICES[devid as usize].as_ref().ok_or(())?.read;
            return dev_read(dst, n);
        }

        if off > self.dinode.size || off.checked_add(n).is_none() {
            return Err(());
        }
        let n = min(n, self.dinode.size - off);

        let (dev, _) = *self.valid.as_ref().unwrap();
        let mut off = off as usize;
        let n = n as usize;
        let mut tot: usize = 0;
        let mut extno: usize = 0;
        let mut extoff: u32 = 0;
        let mut foff: usize = 0;
        while tot < n {
            let mut extent = &self.dinode.extents[extno];
            debug_assert!(extent.nblocks > 0);
            if extoff >= extent.nblocks {
                // 本 extent 走完，切到下一个
                extno += 1;
                debug_assert!(extno < NEXTENT);
                extent = &self.dinode.extents[extno];
                extoff = 0;
            }
            if foff >= off / BSIZE {
                let buf = BCACHE.bread(dev, extent.startblkno + extoff);
                let m = min(n - tot, BSIZE - off % BSIZE);
                let src_ptr = unsafe { (buf.raw_data() as *const u8).add(off % BSIZE) };
                dst.copy_out(src_ptr, m)?;
                drop(buf);
                off += m;
                tot += m;
                dst = dst.offset(m);
            }
            extoff += 1;
            foff += 1;
        }
        Ok(n as u32)
    }

    /// 向 inode 写入数据。
    ///
    /// # 功能说明
    /// 设备 inode 分发到设备函数表；普通文件沿 extent 表
    /// 行走，写到未分配的 extent 时认领 32 个新块。
    /// 每个被触及的目标块构成一次独立事务（除非调用者已经
    /// 持有日志）：数据块与更新后的 dinode 一起记入日志。
    ///
    /// # 返回值
    /// - `Ok(n)`: 写入的字节数
    /// - `Err(())`: 偏移越过文件末尾 / 超出文件大小上限 /
    ///   需要分配第六个 extent / 设备写失败
    pub fn writei(&mut self, mut src: Address, off: u32, n: u32) -> Result<u32, ()> {
        if self.dinode.itype == InodeType::Device {
            let devid = self.dinode.devid;
            if devid < 0 || devid as usize >= NDEV {
                return Err(());
            }
            let dev_write = DEVICES[devid as usize].as_ref().ok_or(())?.write;
            return dev_write(src, n);
        }

        if off > self.dinode.size || off.checked_add(n).is_none() {
            return Err(());
        }
        if (off + n) as usize > MAXFILESIZE {
            return Err(());
        }

        let (dev, inum) = *self.valid.as_ref().unwrap();
        let log_started = LOG.holding();
        let old_off = off as usize;
        let mut off = off as usize;
        let n = n as usize;
        let mut tot: usize = 0;
        let mut extno: usize = 0;
        let mut extoff: u32 = 0;
        let mut foff: usize = 0;
        while tot < n {
            if extoff >= self.dinode.extents[extno].nblocks
                && self.dinode.extents[extno].nblocks != 0
            {
                // 本 extent 走完，切到下一个
                extno += 1;
                extoff = 0;
            }

            if foff >= off / BSIZE {
                if !log_started {
                    LOG.begin_tx();
                }

                if self.dinode.extents[extno].nblocks == 0 {
                    // 空 extent，认领新块
                    if extno == NEXTENT - 1 {
                        if !log_started {
                            LOG.commit_tx();
                        }
                        return Err(());
                    }
                    self.dinode.extents[extno] = Extent {
                        startblkno: balloc(dev),
                        nblocks: EXTENTBLOCKS as u32,
                    };
                }

                let extent = &self.dinode.extents[extno];
                let mut buf = BCACHE.bread(dev, extent.startblkno + extoff);
                let m = min(n - tot, BSIZE - off % BSIZE);
                let dst_ptr = unsafe { (buf.raw_data_mut() as *mut u8).add(off % BSIZE) };
                if src.copy_in(dst_ptr, m).is_err() {
                    drop(buf);
                    if !log_started {
                        LOG.commit_tx();
                    }
                    return Ok(tot as u32);
                }
                LOG.write(buf);
                off += m;
                tot += m;
                src = src.offset(m);

                // 更新文件大小并把 dinode 写回
                if (old_off + tot) as u32 > self.dinode.size {
                    self.dinode.size = (old_off + tot) as u32;
                }
                if self.is_inodefile() {
                    // inode 文件自己的 dinode 固定在 inode 区首块的开头
                    let mut dbuf = BCACHE.bread(dev, unsafe { SUPER_BLOCK.inode_start() });
                    unsafe {
                        ptr::write(dbuf.raw_data_mut() as *mut DiskInode, self.dinode);
                    }
                    LOG.write(dbuf);
                } else {
                    ICACHE.write_dinode(inum, &self.dinode);
                }

                if !log_started {
                    LOG.commit_tx();
                }
            }
            extoff += 1;
            foff += 1;
        }
        Ok(n as u32)
    }

    /// 填充 inode 的状态信息。
    pub fn istat(&self, stat: &mut FileStat) {
        let (dev, inum) = self.valid.unwrap();
        stat.itype = self.dinode.itype as i16;
        stat.dev = dev;
        stat.inum = inum;
        stat.size = self.dinode.size;
    }

    /// 在目录中查找名字对应的目录项。
    ///
    /// 目录内容是 16 字节定长记录的数组；inum 为 0 的记录是
    /// 空槽，名字按 DIRSIZ 字节整体比较（不足部分补零）。
    fn dir_lookup(&mut self, name: &[u8; DIRSIZ]) -> Option<Inode> {
        let (dev, _) = *self.valid.as_ref().unwrap();
        if self.dinode.itype != InodeType::Directory {
            panic!("dir_lookup: inode type not dir");
        }

        let de_size = mem::size_of::<DirEntry>() as u32;
        let mut dir_entry = DirEntry::empty();
        let dir_entry_ptr = Address::KernelMut(&mut dir_entry as *mut DirEntry as *mut u8);
        for offset in (0..self.dinode.size).step_by(de_size as usize) {
            match self.readi(dir_entry_ptr, offset, de_size) {
                Ok(n) if n == de_size => {}
                _ => panic!("dir_lookup: read dir entry"),
            }
            if dir_entry.inum == 0 {
                continue;
            }
            if dir_entry.name == *name {
                return Some(ICACHE.get(dev, dir_entry.inum as u32));
            }
        }

        None
    }

    /// 向目录末尾追加一条目录项。
    /// 必须在事务中调用。
    fn dir_append(&mut self, name: &[u8; DIRSIZ], inum: u32) -> Result<(), ()> {
        if inum > u16::MAX as u32 {
            panic!("dir_append: inum {} too large", inum);
        }

        let mut dir_entry = DirEntry::empty();
        dir_entry.inum = inum as u16;
        dir_entry.name.copy_from_slice(name);

        let de_size = mem::size_of::<DirEntry>() as u32;
        let offset = self.dinode.size;
        let src = Address::Kernel(&dir_entry as *const DirEntry as *const u8);
        match self.writei(src, offset, de_size) {
            Ok(n) if n == de_size => Ok(()),
            _ => Err(()),
        }
    }
}

/// dinode 的字节大小，inode 文件按它整除寻址。
const INODE_SIZE: u32 = mem::size_of::<DiskInode>() as u32;

/// 单个块中的 dinode 数量。
pub const IPB: usize = BSIZE / mem::size_of::<DiskInode>();

/// 文件系统各结构的布局约束，初始化时校验一次。
pub fn icheck() {
    debug_assert_eq!(mem::size_of::<DiskInode>(), 64);
    debug_assert_eq!(mem::size_of::<DirEntry>(), 16);
    debug_assert_eq!(mem::align_of::<BufData>() % mem::align_of::<DiskInode>(), 0);
    debug_assert_eq!(mem::align_of::<BufData>() % mem::align_of::<DirEntry>(), 0);
    debug_assert!(MAXFILESIZE <= u32::MAX as usize);
}

/// 文件状态信息，fstat 系统调用向用户空间报告的结构。
#[repr(C)]
#[derive(Debug)]
pub struct FileStat {
    /// 文件类型。
    pub itype: i16,
    /// 所在设备号。
    pub dev: u32,
    /// inode 编号。
    pub inum: u32,
    /// 文件大小（字节）。
    pub size: u32,
}

impl FileStat {
    pub const fn uninit() -> Self {
        Self {
            itype: 0,
            dev: 0,
            inum: 0,
            size: 0,
        }
    }
}

/// 一段连续的磁盘块，(起始块号, 块数)。
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Extent {
    pub startblkno: u32,
    pub nblocks: u32,
}

/// 磁盘上的 inode 记录。
///
/// 填充到 64 字节，保证一个块里恰好容纳整数个 dinode。
/// 文件内容由至多 6 个 extent 描述，extent 一经分配固定 32 块。
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct DiskInode {
    /// 文件类型。
    itype: InodeType,
    /// 设备号（仅设备 inode 使用）。
    devid: i16,
    /// 文件大小（字节）。
    size: u32,
    /// 文件数据的 extent 表。
    extents: [Extent; NEXTENT],
    /// 填充到 64 字节。
    pad: [u8; 8],
}

impl DiskInode {
    const fn new() -> Self {
        Self {
            itype: InodeType::Empty,
            devid: 0,
            size: 0,
            extents: [Extent {
                startblkno: 0,
                nblocks: 0,
            }; NEXTENT],
            pad: [0; 8],
        }
    }
}

/// inode 类型。
#[repr(i16)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InodeType {
    Empty = 0,
    Directory = 1,
    File = 2,
    Device = 3,
}

/// 目录项：16 字节定长记录。
#[repr(C)]
struct DirEntry {
    /// 目标 inode 编号，0 表示空槽。
    inum: u16,
    /// 文件名，不足 14 字节时补零。
    name: [u8; DIRSIZ],
}

impl DirEntry {
    const fn empty() -> Self {
        Self {
            inum: 0,
            name: [0; DIRSIZ],
        }
    }
}

#[cfg(feature = "unit_test")]
pub mod tests {
    use super::*;

    /// 磁盘结构的尺寸约束。
    pub fn layout() {
        assert_eq!(mem::size_of::<DiskInode>(), 64);
        assert_eq!(mem::size_of::<DirEntry>(), 16);
        assert_eq!(IPB, 8);
    }

    /// 路径分量的切分与折叠。
    pub fn skip_path_elems() {
        let mut name = [0u8; DIRSIZ];

        let path = b"/a/bb/c\0";
        let cur = skip_path(path, 0, &mut name);
        assert_eq!(&name[..2], b"a\0");
        let cur = skip_path(path, cur, &mut name);
        assert_eq!(&name[..3], b"bb\0");
        let cur = skip_path(path, cur, &mut name);
        assert_eq!(&name[..2], b"c\0");
        assert_eq!(skip_path(path, cur, &mut name), 0);

        // 多余的斜杠被折叠
        let path = b"///echo\0";
        let cur = skip_path(path, 0, &mut name);
        assert_eq!(&name[..5], b"echo\0");
        assert_eq!(skip_path(path, cur, &mut name), 0);

        // 超长分量截断到 DIRSIZ
        let path = b"aaaaaaaaaaaaaaaaaa\0";
        skip_path(path, 0, &mut name);
        assert_eq!(name, [b'a'; DIRSIZ]);
    }
}
