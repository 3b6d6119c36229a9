//! 所有系统调用接口实现

use array_macro::array;

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::mem;

use crate::consts::fs::O_CREATE;
use crate::consts::{MAXARG, MAXARGLEN, MAXPATH, PGSIZE};
use crate::fs::{File, FileStat, Pipe, LOG};
use crate::mm::{pg_round_up, VR_HEAP};
use crate::process::PROC_MANAGER;
use crate::trap;

use super::{elf, Proc};

/// 系统调用结果类型。
pub type SysResult = Result<usize, ()>;

/// 系统调用接口，由 [`Proc`] 实现。
///
/// 每个方法对应一个系统调用编号，返回值写回用户的 rax；
/// `Err(())` 统一映射为 -1。
pub trait Syscall {
    fn sys_fork(&mut self) -> SysResult;
    fn sys_exit(&mut self) -> SysResult;
    fn sys_wait(&mut self) -> SysResult;
    fn sys_pipe(&mut self) -> SysResult;
    fn sys_read(&mut self) -> SysResult;
    fn sys_kill(&mut self) -> SysResult;
    fn sys_exec(&mut self) -> SysResult;
    fn sys_fstat(&mut self) -> SysResult;
    fn sys_chdir(&mut self) -> SysResult;
    fn sys_dup(&mut self) -> SysResult;
    fn sys_getpid(&mut self) -> SysResult;
    fn sys_sbrk(&mut self) -> SysResult;
    fn sys_sleep(&mut self) -> SysResult;
    fn sys_uptime(&mut self) -> SysResult;
    fn sys_open(&mut self) -> SysResult;
    fn sys_write(&mut self) -> SysResult;
    fn sys_close(&mut self) -> SysResult;
    fn sys_crashn(&mut self) -> SysResult;
}

impl Syscall for Proc {
    /// 创建子进程。
    /// 父进程得到子进程号，子进程从同一现场返回 0。
    fn sys_fork(&mut self) -> SysResult {
        let ret = self.fork();

        #[cfg(feature = "trace_syscall")]
        println!("[{}].fork() = {:?}(pid)", self.pid(), ret);

        ret
    }

    /// 终止当前进程，不再返回。
    fn sys_exit(&mut self) -> SysResult {
        #[cfg(feature = "trace_syscall")]
        println!("[{}].exit()", self.pid());

        unsafe {
            PROC_MANAGER.exiting(self.index);
        }
    }

    /// 等待任一子进程退出，返回其进程号。
    fn sys_wait(&mut self) -> SysResult {
        let ret = unsafe { PROC_MANAGER.waiting(self.index) };

        #[cfg(feature = "trace_syscall")]
        println!("[{}].wait() = {:?}(pid)", self.pid(), ret);

        ret
    }

    /// 创建管道，把读写两端的描述符写入用户数组。
    fn sys_pipe(&mut self) -> SysResult {
        let fds_addr = self.arg_addr(0);
        let addr_fdread = fds_addr;
        let addr_fdwrite = fds_addr + mem::size_of::<u32>();

        let pdata = self.data.get_mut();
        let (fd_read, fd_write) = pdata.alloc_fd2().ok_or(())?;

        let (file_read, file_write) = Pipe::create().ok_or(())?;

        let fd_read_u32 = fd_read as u32;
        let fd_write_u32 = fd_write as u32;
        pdata.copy_out(
            &fd_read_u32 as *const u32 as *const u8,
            addr_fdread,
            mem::size_of::<u32>(),
        )?;
        pdata.copy_out(
            &fd_write_u32 as *const u32 as *const u8,
            addr_fdwrite,
            mem::size_of::<u32>(),
        )?;

        pdata.open_files[fd_read].replace(file_read);
        pdata.open_files[fd_write].replace(file_write);

        #[cfg(feature = "trace_syscall")]
        println!("[{}].pipe({:#x}) = fd[{},{}]", self.pid(), fds_addr, fd_read, fd_write);

        Ok(0)
    }

    /// 从文件描述符读数据。
    fn sys_read(&mut self) -> SysResult {
        let fd = self.arg_fd(0)?;
        let user_addr = self.arg_addr(1);
        let count = self.arg_i32(2);
        if count <= 0 {
            return Err(());
        }
        let count = count as u32;

        let file = self.data.get_mut().open_files[fd].as_ref().unwrap();
        let file = Arc::clone(file);
        let ret = file.fread(user_addr, count);

        #[cfg(feature = "trace_syscall")]
        println!("[{}].read(fd={}, addr={:#x}, count={}) = {:?}", self.pid(), fd, user_addr, count, ret);

        ret.map(|n| n as usize)
    }

    /// 终止指定进程号的进程。
    fn sys_kill(&mut self) -> SysResult {
        let pid = self.arg_i32(0);
        if pid < 0 {
            return Err(());
        }
        let ret = unsafe { PROC_MANAGER.kill(pid as usize) };

        #[cfg(feature = "trace_syscall")]
        println!("[{}].kill(pid={}) = {:?}", self.pid(), pid, ret);

        ret.map(|()| 0)
    }

    /// 替换当前进程的映像并执行。
    ///
    /// # 流程解释
    /// 读出路径与 argv 指针数组：逐个取出参数字符串复制到
    /// 内核缓冲，遇到空指针即参数结束，交给 ELF 装载器。
    fn sys_exec(&mut self) -> SysResult {
        let mut path: [u8; MAXPATH] = [0; MAXPATH];
        self.arg_str(0, &mut path).map_err(syscall_warning)?;

        let mut result: SysResult = Err(());
        let mut error = "too many arguments";
        let uargv = self.arg_addr(1);
        let mut argv: [Option<Box<[u8; MAXARGLEN]>>; MAXARG] = array![_ => None; MAXARG];
        for i in 0..MAXARG {
            // 第 i 个参数字符串的用户地址
            let uarg = match self.fetch_addr(uargv + i * mem::size_of::<usize>()) {
                Ok(addr) => addr,
                Err(s) => {
                    error = s;
                    break;
                }
            };
            if uarg == 0 {
                match elf::load(self, &path, &argv[..i]) {
                    Ok(ret) => result = Ok(ret),
                    Err(s) => error = s,
                }
                break;
            }

            match Box::try_new_zeroed() {
                Ok(b) => unsafe { argv[i] = Some(b.assume_init()) },
                Err(_) => {
                    error = "not enough kernel memory";
                    break;
                }
            }

            if let Err(s) = self.fetch_str(uarg, argv[i].as_deref_mut().unwrap()) {
                error = s;
                break;
            }
        }

        #[cfg(feature = "trace_syscall")]
        println!("[{}].exec({:#x}) = {:?}", self.pid(), uargv, result);

        if result.is_err() {
            syscall_warning(error);
        }
        result
    }

    /// 查询文件状态并写到用户空间。
    fn sys_fstat(&mut self) -> SysResult {
        let fd = self.arg_fd(0)?;
        let addr = self.arg_addr(1);
        let mut stat = FileStat::uninit();
        let file = self.data.get_mut().open_files[fd].as_ref().unwrap();
        let file = Arc::clone(file);
        if file.fstat(&mut stat).is_err() {
            return Err(());
        }
        self.data.get_mut().copy_out(
            &stat as *const FileStat as *const u8,
            addr,
            mem::size_of::<FileStat>(),
        )?;

        #[cfg(feature = "trace_syscall")]
        println!("[{}].fstat(fd={}, addr={:#x}) = {:?}", self.pid(), fd, addr, stat);

        Ok(0)
    }

    /// 切换工作目录。本内核的路径一律从根目录解析，不支持。
    fn sys_chdir(&mut self) -> SysResult {
        Err(())
    }

    /// 复制文件描述符，二者共享同一打开文件与偏移。
    fn sys_dup(&mut self) -> SysResult {
        let old_fd = self.arg_fd(0)?;
        let pd = self.data.get_mut();
        let new_fd = pd.alloc_fd().ok_or(())?;

        let old_file = pd.open_files[old_fd].as_ref().unwrap();
        let new_file = Arc::clone(old_file);
        let none_file = pd.open_files[new_fd].replace(new_file);
        debug_assert!(none_file.is_none());

        #[cfg(feature = "trace_syscall")]
        println!("[{}].dup({}) = {}(fd)", self.pid(), old_fd, new_fd);

        Ok(new_fd)
    }

    /// 当前进程号。
    fn sys_getpid(&mut self) -> SysResult {
        Ok(self.pid())
    }

    /// 调整堆的断点，返回旧断点。
    ///
    /// n <= 0 时不做映射直接返回当前断点；
    /// 增长时映射覆盖新区间的页并更新堆大小，
    /// 随后重装页表使新映射生效。
    fn sys_sbrk(&mut self) -> SysResult {
        let n = self.arg_i32(0);
        let pd = self.data.get_mut();
        let heap = &pd.vspace.regions[VR_HEAP];
        let old_break = heap.base + heap.size;

        if n <= 0 {
            return Ok(old_break);
        }

        let new_break = old_break + n as usize;
        let map_from = pg_round_up(old_break);
        let map_to = pg_round_up(new_break);
        if map_to > map_from {
            let npages = (map_to - map_from) / PGSIZE;
            if pd.vspace.add_map(VR_HEAP, map_from, npages, true).is_err() {
                return Err(());
            }
        }
        pd.vspace.regions[VR_HEAP].size += n as usize;
        pd.vspace.install();

        #[cfg(feature = "trace_syscall")]
        println!("[{}].sbrk({}) = {:#x}", self.pid(), n, old_break);

        Ok(old_break)
    }

    /// 休眠 n 个时钟滴答。
    fn sys_sleep(&mut self) -> SysResult {
        let n = self.arg_i32(0);
        if n < 0 {
            return Err(());
        }
        trap::clock_sleep(self, n as usize).map(|()| 0)
    }

    /// 开机以来的时钟滴答数。
    fn sys_uptime(&mut self) -> SysResult {
        Ok(trap::clock_read())
    }

    /// 打开（或创建）文件，返回最小的空闲描述符。
    ///
    /// 只带创建标志而不带访问模式的请求被拒绝。
    fn sys_open(&mut self) -> SysResult {
        let mut path: [u8; MAXPATH] = [0; MAXPATH];
        self.arg_str(0, &mut path).map_err(syscall_warning)?;
        let mode = self.arg_i32(1);
        if mode == O_CREATE {
            return Err(());
        }

        let pd = self.data.get_mut();
        let fd = pd.alloc_fd().ok_or(())?;
        let file = File::open(&path, mode).ok_or(())?;
        let none_file = pd.open_files[fd].replace(file);
        debug_assert!(none_file.is_none());

        #[cfg(feature = "trace_syscall")]
        println!("[{}].open(mode={:#x}) = {}(fd)", self.pid(), mode, fd);

        Ok(fd)
    }

    /// 向文件描述符写数据。
    fn sys_write(&mut self) -> SysResult {
        let fd = self.arg_fd(0)?;
        let user_addr = self.arg_addr(1);
        let count = self.arg_i32(2);
        if count <= 0 {
            return Err(());
        }
        let count = count as u32;

        let file = self.data.get_mut().open_files[fd].as_ref().unwrap();
        let file = Arc::clone(file);
        let ret = file.fwrite(user_addr, count);

        #[cfg(feature = "trace_syscall")]
        println!("[{}].write(fd={}, addr={:#x}, count={}) = {:?}", self.pid(), fd, user_addr, count, ret);

        ret.map(|n| n as usize)
    }

    /// 关闭文件描述符。
    fn sys_close(&mut self) -> SysResult {
        let fd = self.arg_fd(0)?;
        let file = self.data.get_mut().open_files[fd].take();
        drop(file);

        #[cfg(feature = "trace_syscall")]
        println!("[{}].close({})", self.pid(), fd);

        Ok(0)
    }

    /// 预约在第 n 次日志写之后触发重启（崩溃一致性测试）。
    fn sys_crashn(&mut self) -> SysResult {
        let n = self.arg_i32(0);
        if n < 0 {
            return Err(());
        }
        LOG.crashn_arm(n as usize);
        Ok(0)
    }
}

/// 打印一条系统调用层的警告。
fn syscall_warning<T>(s: T) -> ()
where
    T: core::fmt::Display,
{
    #[cfg(feature = "kernel_warning")]
    println!("kernel syscall warning: {}", s);
    #[cfg(not(feature = "kernel_warning"))]
    drop(s);
}
