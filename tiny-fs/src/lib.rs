//! # tiny-fs 的整体架构，自上而下
//!
//! 1. 进程层：当前工作目录、文件描述符表、系统调用表面
//! 2. 文件系统服务层：挂载/格式化与粗粒度加锁的入口
//! 3. 路径解析层：把路径拆成 `(父目录, 末项名)`
//! 4. 目录层：目录 = 数据为定长目录项数组的 inode
//! 5. 索引节点层：多级块索引、按需增长、打开表与延迟删除
//! 6. 空闲位图层：全盘扇区的分配与回收
//! 7. 扇区缓存层：写回缓存、LRU 淘汰、预读与周期性刷写
//! 8. 块设备接口层：读写设备的接口（`block-dev` crate）

// 进程层
mod process;
pub use process::{Fd, Process, Stat, StatKind, FD_STDIN, FD_STDOUT};

// 文件系统服务层
mod filesys;
pub use filesys::FileSys;

// 路径解析层
mod path;

// 目录层
mod dir;
pub use dir::Dir;

// 索引节点层
mod inode;
pub use inode::Inode;

// 空闲位图层
mod free_map;

// 磁盘数据结构层
mod layout;

// 扇区缓存层
mod cache;
pub use cache::SectorCache;

// 错误类型
mod error;

pub use error::Error;

#[cfg(test)]
mod testing;

pub use block_dev::{BlockDevice, SECTOR_SIZE};

/// inode 扇区的标识魔数
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// 空闲位图文件的 inode 所在扇区
pub const FREE_MAP_SECTOR: u32 = 0;
/// 根目录的 inode 所在扇区
pub const ROOT_DIR_SECTOR: u32 = 1;

/// 文件或目录名的最大长度（字节）
pub const NAME_MAX: usize = 14;
/// 路径的最大长度（字节）
pub const PATH_MAX: usize = 256;

type DataSector = [u8; SECTOR_SIZE];
