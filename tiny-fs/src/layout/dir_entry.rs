use core::{mem, ptr, slice};

use crate::NAME_MAX;

/// 目录项：定长记录，指向一个 inode 扇区。
#[derive(Debug, Default, Clone)]
#[repr(C)]
pub struct DirEntry {
    inode_sector: u32,
    // 最后一字节留给 \0
    name: [u8; NAME_MAX + 1],
    in_use: u8,
}

// 目录项大小固定，目录文件按它的整倍数寻址
const _: () = assert!(mem::size_of::<DirEntry>() == DirEntry::SIZE);

impl DirEntry {
    pub const SIZE: usize = 20;

    /// `name` 须已通过长度校验
    pub fn new(name: &str, inode_sector: u32) -> Self {
        let bytes = name.as_bytes();
        debug_assert!(!bytes.is_empty() && bytes.len() <= NAME_MAX);

        let mut buf = [0; NAME_MAX + 1];
        buf[..bytes.len()].copy_from_slice(bytes);

        Self {
            inode_sector,
            name: buf,
            in_use: 1,
        }
    }

    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&c| c == 0).unwrap();
        core::str::from_utf8(&self.name[..len]).unwrap()
    }

    /// 按字节比较名字。扫描到的槽位可能来自被当作目录遍历的
    /// 文件数据，不假定其内容是合法字符串。
    pub fn name_matches(&self, name: &str) -> bool {
        let bytes = name.as_bytes();
        bytes.len() <= NAME_MAX && &self.name[..bytes.len()] == bytes && self.name[bytes.len()] == 0
    }

    #[inline]
    pub fn inode_sector(&self) -> u32 {
        self.inode_sector
    }

    #[inline]
    pub fn in_use(&self) -> bool {
        self.in_use != 0
    }

    /// 释放槽位；留下的名字与扇区号无意义
    #[inline]
    pub fn vacate(&mut self) {
        self.in_use = 0;
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(ptr::from_ref(self).cast(), Self::SIZE) }
    }

    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(ptr::from_mut(self).cast(), Self::SIZE) }
    }
}
