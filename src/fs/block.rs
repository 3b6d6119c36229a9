//! 磁盘块分配与交换区块 IO

use core::ptr;

use crate::consts::fs::{BPB, BSIZE, EXTENTBLOCKS, SWAPSLOTBLOCKS};

use super::{BCACHE, LOG, SUPER_BLOCK};

/// 在空闲位图中认领一个 32 块的 extent，返回起始块号。
///
/// # 流程解释
/// 逐个读出位于 [bmapstart, inodestart) 的位图块，把块内容
/// 当作 32 位字的数组扫描：一个全零的字代表 32 个连续的
/// 空闲块。找到后整字置满、把位图块记入当前事务，
/// 起始块号由位图块号与字下标换算得到。
///
/// # Panics
/// - 位图中不存在全零的字（extent 区耗尽）；
/// - 换算出的块号落在了数据区之外（位图被写坏）。
pub fn balloc(dev: u32) -> u32 {
    let (bmap_start, inode_start, total) = unsafe {
        (
            SUPER_BLOCK.bmap_start(),
            SUPER_BLOCK.inode_start(),
            SUPER_BLOCK.size(),
        )
    };

    for bm_blockno in bmap_start..inode_start {
        let mut buf = BCACHE.bread(dev, bm_blockno);
        let words =
            unsafe { &mut *(buf.raw_data_mut() as *mut [u32; BSIZE / 4]) };
        match find_free_word(words) {
            Some(i) => {
                words[i] = u32::MAX;
                LOG.write(buf);

                let addr = (bm_blockno - bmap_start) * BPB + (i as u32) * EXTENTBLOCKS as u32;
                assert!(addr > inode_start, "balloc: extent inside metadata");
                assert!(addr + (EXTENTBLOCKS as u32) <= total, "balloc: extent out of disk");
                return addr;
            }
            None => drop(buf),
        }
    }

    panic!("balloc: no more free space in extent region");
}

/// 找到第一个全零的位图字。
fn find_free_word(words: &[u32]) -> Option<usize> {
    words.iter().position(|w| *w == 0)
}

/// 把一页内容从交换槽读回 addr。
/// 每个槽对应交换区中连续的 8 块。
pub fn swapread(dev: u32, slot: usize, addr: *mut u8) {
    let swap_start = unsafe { SUPER_BLOCK.swap_start() };
    for i in 0..SWAPSLOTBLOCKS {
        let blockno = swap_start + (slot * SWAPSLOTBLOCKS + i) as u32;
        let buf = BCACHE.bread(dev, blockno);
        unsafe {
            ptr::copy_nonoverlapping(buf.raw_data() as *const u8, addr.add(i * BSIZE), BSIZE);
        }
        drop(buf);
    }
}

/// 把 addr 处的一页写进交换槽。
/// 交换流量不经过日志，槽的占用状态由交换映射表权威记录。
pub fn swapwrite(dev: u32, slot: usize, addr: *const u8) {
    let swap_start = unsafe { SUPER_BLOCK.swap_start() };
    for i in 0..SWAPSLOTBLOCKS {
        let blockno = swap_start + (slot * SWAPSLOTBLOCKS + i) as u32;
        let mut buf = BCACHE.bread(dev, blockno);
        unsafe {
            ptr::copy_nonoverlapping(addr.add(i * BSIZE), buf.raw_data_mut() as *mut u8, BSIZE);
        }
        buf.bwrite();
        drop(buf);
    }
}

#[cfg(feature = "unit_test")]
pub mod tests {
    use super::*;

    /// 位图字扫描只认领全零的字。
    pub fn bitmap_words() {
        let words = [u32::MAX, 0xffff_0000, 0, u32::MAX];
        assert_eq!(find_free_word(&words), Some(2));
        let full = [u32::MAX; 8];
        assert_eq!(find_free_word(&full), None);
        let part = [0x1u32];
        assert_eq!(find_free_word(&part), None);
    }
}
