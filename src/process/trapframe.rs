//! 用户进程的陷阱帧

/// 陷入内核时保存的用户态寄存器现场。
///
/// 中断向量桩按这一布局把通用寄存器压入内核栈，
/// 硬件在末尾追加 rip/cs/rflags/rsp/ss；
/// trapret 按相同布局恢复并以 iretq 返回用户态。
/// 系统调用的编号放在 rax，参数依次在 rdi/rsi/rdx/rcx，
/// 返回值写回 rax。
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    /*   0 */ pub rax: usize,
    /*   8 */ pub rbx: usize,
    /*  16 */ pub rcx: usize,
    /*  24 */ pub rdx: usize,
    /*  32 */ pub rbp: usize,
    /*  40 */ pub rsi: usize,
    /*  48 */ pub rdi: usize,
    /*  56 */ pub r8: usize,
    /*  64 */ pub r9: usize,
    /*  72 */ pub r10: usize,
    /*  80 */ pub r11: usize,
    /*  88 */ pub r12: usize,
    /*  96 */ pub r13: usize,
    /* 104 */ pub r14: usize,
    /* 112 */ pub r15: usize,

    /// 触发本次陷入的向量号。
    /* 120 */ pub trapno: usize,
    /// 硬件错误码（缺页时含存在 / 写 / 用户位）。
    /* 128 */ pub err: usize,

    /* 136 */ pub rip: usize,
    /* 144 */ pub cs: usize,
    /* 152 */ pub rflags: usize,
    /* 160 */ pub rsp: usize,
    /* 168 */ pub ss: usize,
}
