//! 设备驱动模块，包含串口、控制台、键盘与磁盘的驱动

use core::sync::atomic::AtomicBool;

use crate::{consts::driver::NDEV, mm::Address};

pub mod console;
pub mod ide;
pub mod kbd;
pub mod lapic;
pub mod uart;

/// 用于表示是否有任何处理器触发了 panic。
pub(crate) static PANICKED: AtomicBool = AtomicBool::new(false);

/// 设备函数表，设备 inode 以 devid 为下标在这里分发读写。
pub static DEVICES: [Option<Device>; NDEV] = [
    /* 0 */ None,
    /* 1 */ Some(Device { read: console::read, write: console::write }),
    /* 2 */ None,
    /* 3 */ None,
    /* 4 */ None,
    /* 5 */ None,
    /* 6 */ None,
    /* 7 */ None,
    /* 8 */ None,
    /* 9 */ None,
];

pub struct Device {
    /// 从设备读取 count 个字节写到 [Address]。
    pub read: fn(Address, u32) -> Result<u32, ()>,
    /// 把 [Address] 处的 count 个字节写入设备。
    pub write: fn(Address, u32) -> Result<u32, ()>,
}
