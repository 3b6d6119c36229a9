//! 日志层：基于重做日志的崩溃一致性

use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::consts::fs::LOGSLOTS;
use crate::process::{CPU_MANAGER, PROC_MANAGER};
use crate::register::port;
use crate::spinlock::SpinLock;

use super::{BufData, BCACHE, SUPER_BLOCK};
use super::bio::Buf;

/// 全局日志实例，所有磁盘写事务的唯一入口。
///
/// 日志区位于磁盘末尾：一个日志头块后面跟着 19 个数据槽。
/// 事务协议是单写者的重做日志：begin_tx 清空磁盘上的日志头，
/// log_write 把被改的块先写进日志槽再更新日志头，
/// commit_tx 先持久化 committed 标志、再把各槽安装回原位、
/// 最后清空日志头。任何时刻断电，重启后的恢复流程都能把
/// 文件系统收敛到事务前或事务后的完整快照。
pub static LOG: Log = Log::new();

pub struct Log {
    state: SpinLock<LogState>,
    /// 测试钩子：倒数第 n 次日志写之后触发重启。
    crashn_enable: AtomicBool,
    crashn: AtomicUsize,
}

/// 日志的互斥状态。
/// 事务持有者以睡眠等待的方式独占日志，
/// pid 记录持有者以支持写路径上的重入检查。
struct LogState {
    locked: bool,
    pid: usize,
    dev: u32,
    start: u32,
}

/// 磁盘上的日志头。
#[repr(C)]
struct LogHeader {
    /// 置 1 表示其后的槽位已构成完整事务，重启后需要重放。
    committed: i16,
    /// 本事务已记录的块修改数量。
    nchanges: u32,
    /// 各槽位对应的目标块号。
    blocknos: [u32; LOGSLOTS],
}

impl Log {
    const fn new() -> Self {
        Self {
            state: SpinLock::new(
                LogState {
                    locked: false,
                    pid: 0,
                    dev: 0,
                    start: 0,
                },
                "log",
            ),
            crashn_enable: AtomicBool::new(false),
            crashn: AtomicUsize::new(0),
        }
    }

    /// 初始化日志层并执行崩溃恢复。
    ///
    /// # 流程解释
    /// 读入日志头：committed 为 1 说明上次关机前有一个已提交
    /// 但未安装完的事务，把每个日志槽重放到它的目标块上，
    /// 然后清空日志头；否则磁盘上的内容就是一致的，直接丢弃
    /// 残留的日志记录。
    ///
    /// # 安全性
    /// 必须在任何文件系统写操作之前、由首个进程调用一次。
    pub unsafe fn init(&self, dev: u32) {
        debug_assert!(mem::size_of::<LogHeader>() < crate::consts::fs::BSIZE);
        debug_assert_eq!(mem::align_of::<BufData>() % mem::align_of::<LogHeader>(), 0);

        let start = SUPER_BLOCK.log_start();
        let mut state = self.state.lock();
        state.dev = dev;
        state.start = start;
        drop(state);

        println!("file system: checking logs");
        let header = self.read_header(dev, start);
        if header.committed == 1 {
            println!("file system: recovering from logs");
            self.install(dev, start, &header);
            self.clear_header(dev, start);
        } else {
            println!("file system: no need to recover");
        }
    }

    /// 开始一个事务，独占日志直到 commit_tx。
    ///
    /// 日志被其他进程占用时在日志地址上休眠等待；
    /// 占有后把磁盘上的日志头清零，确保中途断电不会把
    /// 上一个事务的残留当成本事务的一部分重放。
    pub fn begin_tx(&self) {
        let mut state = self.state.lock();
        while state.locked {
            let channel = self as *const Log as usize;
            unsafe {
                CPU_MANAGER.my_proc().sleep(channel, state);
            }
            state = self.state.lock();
        }
        state.locked = true;
        state.pid = unsafe { CPU_MANAGER.my_proc() }.pid();
        let (dev, start) = (state.dev, state.start);
        drop(state);

        self.clear_header(dev, start);
    }

    /// 当前进程是否正处于一个未提交的事务中。
    pub fn holding(&self) -> bool {
        let state = self.state.lock();
        state.locked && state.pid == unsafe { CPU_MANAGER.my_proc() }.pid()
    }

    /// 把一个被修改的缓冲块记入当前事务。
    ///
    /// # 流程解释
    /// 1. 标记缓冲块为脏（写回推迟到提交时的安装阶段）；
    /// 2. 把块内容复制进下一个日志槽并写盘；
    /// 3. 把目标块号追加进日志头并写盘（先槽后头，
    ///    保证日志头引用的槽位一定已经完整落盘）。
    ///
    /// # Panics
    /// - 调用者不在事务中；
    /// - 单个事务超过 19 个块修改。
    pub fn write(&self, buf: Buf<'_>) {
        if !self.holding() {
            panic!("log: write outside of transaction");
        }
        let state = self.state.lock();
        let (dev, start) = (state.dev, state.start);
        drop(state);

        buf.mark_dirty();

        let mut header = self.read_header(dev, start);
        if header.nchanges as usize >= LOGSLOTS {
            panic!("log: too many changes in one transaction");
        }

        // 本事务里已经记录过的块只需更新槽内容
        let mut slot = header.nchanges;
        for i in 0..header.nchanges {
            if header.blocknos[i as usize] == buf.read_blockno() {
                slot = i;
                break;
            }
        }

        let mut log_buf = BCACHE.bread(dev, start + 1 + slot);
        unsafe {
            ptr::copy(buf.raw_data(), log_buf.raw_data_mut(), 1);
        }
        log_buf.bwrite();
        drop(log_buf);

        if slot == header.nchanges {
            header.blocknos[slot as usize] = buf.read_blockno();
            header.nchanges += 1;
            self.write_header(dev, start, &header);
        }
        drop(buf);

        self.crashn_tick();
    }

    /// 提交当前事务并释放日志。
    ///
    /// # 流程解释
    /// 1. 把日志头的 committed 置 1 并写盘——这是事务的
    ///    原子提交点，此前断电恢复丢弃日志，此后断电恢复重放；
    /// 2. 把每个日志槽安装到它的目标块上并写盘；
    /// 3. 清空日志头（committed 回到 0）并写盘；
    /// 4. 释放日志，唤醒等待事务的进程。
    pub fn commit_tx(&self) {
        if !self.holding() {
            panic!("log: commit outside of transaction");
        }
        let state = self.state.lock();
        let (dev, start) = (state.dev, state.start);
        drop(state);

        let mut header = self.read_header(dev, start);
        header.committed = 1;
        self.write_header(dev, start, &header);

        self.install(dev, start, &header);

        self.clear_header(dev, start);

        let mut state = self.state.lock();
        state.locked = false;
        state.pid = 0;
        unsafe {
            PROC_MANAGER.wakeup(self as *const Log as usize);
        }
        drop(state);
    }

    /// 把日志槽 0..nchanges 安装到各自的目标块。
    fn install(&self, dev: u32, start: u32, header: &LogHeader) {
        for i in 0..header.nchanges {
            let log_buf = BCACHE.bread(dev, start + 1 + i);
            let mut data_buf = BCACHE.bread(dev, header.blocknos[i as usize]);
            unsafe {
                ptr::copy(log_buf.raw_data(), data_buf.raw_data_mut(), 1);
            }
            data_buf.bwrite();
            drop(log_buf);
            drop(data_buf);
        }
    }

    fn read_header(&self, dev: u32, start: u32) -> LogHeader {
        let buf = BCACHE.bread(dev, start);
        let mut header = LogHeader {
            committed: 0,
            nchanges: 0,
            blocknos: [0; LOGSLOTS],
        };
        unsafe {
            ptr::copy_nonoverlapping(buf.raw_data() as *const LogHeader, &mut header, 1);
        }
        drop(buf);
        header
    }

    fn write_header(&self, dev: u32, start: u32, header: &LogHeader) {
        let mut buf = BCACHE.bread(dev, start);
        unsafe {
            ptr::copy_nonoverlapping(header, buf.raw_data_mut() as *mut LogHeader, 1);
        }
        buf.bwrite();
        drop(buf);
    }

    fn clear_header(&self, dev: u32, start: u32) {
        let header = LogHeader {
            committed: 0,
            nchanges: 0,
            blocknos: [0; LOGSLOTS],
        };
        self.write_header(dev, start, &header);
    }

    /// 预约在第 n 次日志写之后重启机器（崩溃一致性测试用）。
    pub fn crashn_arm(&self, n: usize) {
        self.crashn.store(n, Ordering::Relaxed);
        self.crashn_enable.store(true, Ordering::Relaxed);
    }

    fn crashn_tick(&self) {
        if self.crashn_enable.load(Ordering::Relaxed) {
            if self.crashn.fetch_sub(1, Ordering::Relaxed) <= 1 {
                reboot();
            }
        }
    }
}

/// 通过键盘控制器触发机器复位。
fn reboot() -> ! {
    unsafe {
        while port::inb(0x64) & 0x02 != 0 {}
        port::outb(0x64, 0xfe);
    }
    loop {
        unsafe {
            core::arch::asm!("hlt");
        }
    }
}
