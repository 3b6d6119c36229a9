//! xk-rust 内核入口

#![no_std]
#![feature(allocator_api)]
#![feature(alloc_error_handler)]
#![feature(new_zeroed_alloc)]
#![allow(dead_code)]
#![warn(rust_2018_idioms)]

#[macro_use]
extern crate bitflags;

extern crate alloc;

#[macro_use]
mod printf;

mod consts;
mod driver;
mod fs;
mod mm;
mod process;
mod register;
mod rmain;
mod sleeplock;
mod spinlock;
mod trap;

#[cfg(feature = "unit_test")]
fn test_main_entry() {
    use process::CpuManager;

    let cpu_id = unsafe { CpuManager::cpu_id() };

    // 只需要在单个处理器上执行的测试用例
    if cpu_id == 0 {
        spinlock::tests::smoke();
        fs::tests::layout();
        fs::tests::skip_path_elems();
        fs::tests::pipe_ring();
        fs::tests::bitmap_words();
        mm::tests::rand_sequence();
        mm::tests::alloc_free();

        println!("all tests pass.");
    }
}
