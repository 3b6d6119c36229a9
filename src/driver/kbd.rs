//! PS/2 键盘驱动

use crate::consts::driver::{KBD_DATA, KBD_STATUS};
use crate::register::port::inb;

use super::console;

/// 第一套扫描码到 ASCII 的映射（不处理修饰键）。
#[rustfmt::skip]
static NORMAL_MAP: [u8; 0x3a] = [
    0,    0x1b, b'1', b'2', b'3', b'4', b'5', b'6',
    b'7', b'8', b'9', b'0', b'-', b'=', 0x08, b'\t',
    b'q', b'w', b'e', b'r', b't', b'y', b'u', b'i',
    b'o', b'p', b'[', b']', b'\n', 0,   b'a', b's',
    b'd', b'f', b'g', b'h', b'j', b'k', b'l', b';',
    b'\'', b'`', 0,   b'\\', b'z', b'x', b'c', b'v',
    b'b', b'n', b'm', b',', b'.', b'/', 0,    b'*',
    0,    b' ',
];

/// 键盘中断处理：取出扫描码，通码翻译后交给控制台。
pub fn intr() {
    unsafe {
        if inb(KBD_STATUS) & 0x01 == 0 {
            return;
        }
        let sc = inb(KBD_DATA);
        if sc & 0x80 != 0 {
            // 断码（按键抬起）直接忽略
            return;
        }
        if let Some(&c) = NORMAL_MAP.get(sc as usize) {
            if c != 0 {
                console::intr(c);
            }
        }
    }
}
