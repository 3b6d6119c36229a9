//! 从文件系统装载 ELF 映像并完成 exec

use alloc::boxed::Box;
use core::cmp::{max, min};
use core::mem::{self, MaybeUninit};

use crate::consts::{MAXARG, MAXARGLEN, PGSIZE, USERTOP};
use crate::fs::{InodeData, ICACHE};
use crate::mm::{pg_round_up, Address, VSpace, VR_CODE, VR_HEAP};
use crate::sleeplock::SleepLockGuard;

use super::Proc;

/// 把 path 指向的 ELF 可执行文件装进一个全新的地址空间，
/// 在新用户栈上摆好命令行参数，最后替换进程当前的映像。
///
/// # 流程解释
/// 1. 解析路径并校验 ELF 头的魔数；
/// 2. 新建地址空间：保留一页用户栈，
///    逐个装载 LOAD 程序段进代码区（权限取自段标志），
///    堆区紧跟在装载的最高地址之后；
/// 3. 自栈顶向下依次压入参数字符串与 argv 指针数组，
///    为约定的返回地址留出空位；
/// 4. 一切就绪后才改写进程：替换地址空间（旧映像随之释放）、
///    设置陷阱帧的入口 / 栈指针 / argc / argv、更新进程名。
///    失败路径不触碰旧映像，exec 返回错误后进程照常运行。
///
/// # 返回值
/// - `Ok(0)`: 装载完成，返回用户态后从新映像的入口执行
/// - `Err(msg)`: 路径、格式、内存或参数布局的错误描述
pub fn load(
    p: &mut Proc,
    path: &[u8],
    argv: &[Option<Box<[u8; MAXARGLEN]>>],
) -> Result<usize, &'static str> {
    let inode = ICACHE.namei(path).ok_or("cannot name inode")?;
    let mut idata = inode.lock();

    // 校验 ELF 头
    let elf_size = mem::size_of::<ElfHeader>() as u32;
    let mut elf = MaybeUninit::<ElfHeader>::uninit();
    match idata.readi(
        Address::KernelMut(elf.as_mut_ptr() as *mut u8),
        0,
        elf_size,
    ) {
        Ok(n) if n == elf_size => {}
        _ => return Err("cannot read elf header"),
    }
    let elf = unsafe { elf.assume_init() };
    if elf.magic != ELF_MAGIC {
        return Err("bad elf magic number");
    }

    // 新地址空间；构建期间的失败路径由 Drop 负责回收
    let mut vs = VSpace::new();
    vs.init().map_err(|_| "mem not enough")?;
    vs.init_stack().map_err(|_| "not enough memory for user stack")?;

    // 装载各个程序段
    let ph_size = mem::size_of::<ProgHeader>() as u32;
    let mut off = elf.phoff as u32;
    let mut loaded = false;
    let mut code_end = 0usize;
    for _ in 0..elf.phnum {
        let mut ph = MaybeUninit::<ProgHeader>::uninit();
        match idata.readi(Address::KernelMut(ph.as_mut_ptr() as *mut u8), off, ph_size) {
            Ok(n) if n == ph_size => {}
            _ => return Err("cannot read elf program header"),
        }
        let ph = unsafe { ph.assume_init() };
        off += ph_size;

        if ph.pg_type != ELF_PROG_LOAD {
            continue;
        }
        if ph.memsz < ph.filesz
            || ph.vaddr.checked_add(ph.memsz).is_none()
            || ph.vaddr as usize % PGSIZE != 0
        {
            return Err("one program header meta not correct");
        }

        let start = ph.vaddr as usize;
        let end = start + ph.memsz as usize;
        if !loaded {
            vs.regions[VR_CODE].base = start;
            loaded = true;
        }
        let npages = (pg_round_up(end) - start) / PGSIZE;
        let writable = ph.flags & ELF_PROG_FLAG_WRITE != 0;
        vs.add_map(VR_CODE, start, npages, writable)
            .map_err(|_| "not enough memory for program segment")?;
        code_end = max(code_end, end);
        vs.regions[VR_CODE].size = pg_round_up(code_end) - vs.regions[VR_CODE].base;

        load_seg(&mut vs, start, &mut idata, ph.off as u32, ph.filesz as u32)?;
    }
    drop(idata);
    drop(inode);
    if !loaded {
        return Err("no loadable segment");
    }

    // 堆区紧跟在装载映像之后
    vs.regions[VR_HEAP].base = pg_round_up(code_end);

    // 在新用户栈上摆放命令行参数
    let stack_bottom = USERTOP - PGSIZE;
    let mut sp = USERTOP;
    let argc = argv.len();
    debug_assert!(argc < MAXARG);
    let mut ustack = [0usize; MAXARG + 1];
    for i in 0..argc {
        let arg = argv[i].as_deref().unwrap();
        let count = arg.iter().position(|x| *x == 0).unwrap() + 1;
        sp -= count;
        sp = align_sp(sp);
        if sp < stack_bottom {
            return Err("cmd args too much for stack");
        }
        vs.write_to_va(sp, arg.as_ptr(), count)
            .map_err(|_| "copy cmd args to new stack go wrong")?;
        ustack[i] = sp;
    }
    debug_assert_eq!(ustack[argc], 0);
    sp -= (argc + 1) * mem::size_of::<usize>();
    sp = align_sp(sp);
    if sp < stack_bottom {
        return Err("cmd args too much for stack");
    }
    vs.write_to_va(sp, ustack.as_ptr() as *const u8, (argc + 1) * mem::size_of::<usize>())
        .map_err(|_| "copy cmd args to new stack go wrong")?;
    let argv_ptr = sp;

    // 为约定的返回地址留出空位
    sp -= mem::size_of::<usize>();
    let zero = 0usize;
    vs.write_to_va(sp, &zero as *const usize as *const u8, mem::size_of::<usize>())
        .map_err(|_| "copy cmd args to new stack go wrong")?;

    // 改写进程：替换地址空间并设置陷阱帧
    let pdata = p.data.get_mut();
    let tf = unsafe { pdata.tf.as_mut().unwrap() };
    tf.rip = elf.entry as usize;
    tf.rsp = sp;
    tf.rdi = argc;
    tf.rsi = argv_ptr;

    let name_off = path
        .iter()
        .position(|x| *x != b'/')
        .unwrap_or(0);
    let count = min(path.len() - name_off, pdata.name.len());
    for i in 0..count {
        pdata.name[i] = path[i + name_off];
    }

    // 先切到新页表再释放旧映像，期间 CR3 始终指向活页表
    let old_vs = mem::replace(&mut pdata.vspace, vs);
    pdata.vspace.install();
    drop(old_vs);

    Ok(0)
}

/// 把一个程序段的文件内容读进新地址空间。
/// va 必须页对齐且对应的页已经映射。
fn load_seg(
    vs: &mut VSpace,
    va: usize,
    idata: &mut SleepLockGuard<'_, InodeData>,
    offset: u32,
    size: u32,
) -> Result<(), &'static str> {
    if va % PGSIZE != 0 {
        panic!("load_seg: va {:#x} not page aligned", va);
    }

    for i in (0..size).step_by(PGSIZE) {
        let page = vs
            .page_for_write(va + i as usize)
            .map_err(|_| "segment page not mapped")?;
        let count = min(size - i, PGSIZE as u32);
        match idata.readi(Address::KernelMut(page), offset + i, count) {
            Ok(n) if n == count => {}
            _ => return Err("load program section error"),
        }
    }

    Ok(())
}

#[inline(always)]
fn align_sp(sp: usize) -> usize {
    sp - (sp % 16)
}

/// ELF 文件头。
#[repr(C)]
struct ElfHeader {
    /// 魔数，固定为 0x464C457F。
    magic: u32,
    elf: [u8; 12],
    elf_type: u16,
    machine: u16,
    version: u32,
    /// 程序入口的虚拟地址。
    entry: u64,
    /// 程序头表在文件中的偏移。
    phoff: u64,
    shoff: u64,
    flags: u32,
    ehsize: u16,
    phentsize: u16,
    /// 程序头数量。
    phnum: u16,
    shentsize: u16,
    shnum: u16,
    shstrndx: u16,
}

/// ELF 程序头，描述一个装载段。
#[repr(C)]
struct ProgHeader {
    pg_type: u32,
    flags: u32,
    off: u64,
    vaddr: u64,
    paddr: u64,
    filesz: u64,
    memsz: u64,
    align: u64,
}

const ELF_MAGIC: u32 = 0x464C457F;
const ELF_PROG_LOAD: u32 = 1;
const ELF_PROG_FLAG_WRITE: u32 = 2;
