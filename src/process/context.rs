//! 上下文切换时保存的被调用者保存寄存器

/// 内核线程的切换上下文。
///
/// `swtch` 把被调用者保存寄存器存入旧上下文、从新上下文恢复，
/// 调度器与进程之间的控制权移交全靠这一结构。
/// 新建进程把 rip 指向 fork_ret、rsp 指向内核栈顶，
/// 第一次被调度时便从那里开始执行。
#[repr(C)]
#[derive(Debug)]
pub struct Context {
    /*  0 */ pub r15: usize,
    /*  8 */ pub r14: usize,
    /* 16 */ pub r13: usize,
    /* 24 */ pub r12: usize,
    /* 32 */ pub rbx: usize,
    /* 40 */ pub rbp: usize,
    /* 48 */ pub rsp: usize,
    /* 56 */ pub rip: usize,
}

impl Context {
    pub const fn new() -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            rbx: 0,
            rbp: 0,
            rsp: 0,
            rip: 0,
        }
    }

    /// 清空全部寄存器。
    pub fn clear(&mut self) {
        self.r15 = 0;
        self.r14 = 0;
        self.r13 = 0;
        self.r12 = 0;
        self.rbx = 0;
        self.rbp = 0;
        self.rsp = 0;
        self.rip = 0;
    }

    #[inline]
    pub fn set_rip(&mut self, rip: usize) {
        self.rip = rip;
    }

    #[inline]
    pub fn set_rsp(&mut self, rsp: usize) {
        self.rsp = rsp;
    }
}
