//! # 磁盘数据结构层
//!
//! 磁盘布局：
//! 第 0 扇区是空闲位图文件的 inode，第 1 扇区是根目录的 inode，
//! 其余扇区全部经由空闲位图分配。
//!
//! 每个 inode 恰占一个扇区；目录的数据区是定长目录项的紧密数组。

mod inode;
pub(crate) use inode::DiskInode;

mod dir_entry;
pub(crate) use dir_entry::DirEntry;
