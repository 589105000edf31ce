//! # 目录层
//!
//! 目录就是数据区为定长目录项数组的 inode。查找、添加、删除都是
//! 对这个数组的线性扫描，一次读一项。
//!
//! 每个目录都带 `.` 与 `..` 两项（由创建者插入，根目录的在挂载时
//! 补上），所以路径解析无需为它们写特殊分支。

use std::sync::Arc;

use log::debug;

use crate::filesys::FsCore;
use crate::inode::Inode;
use crate::layout::DirEntry;
use crate::{Error, NAME_MAX, ROOT_DIR_SECTOR};

/// 目录句柄：持有打开的 inode 和顺序遍历的游标。
pub struct Dir {
    inode: Arc<Inode>,
    /// 字节游标，初始越过 `.` 与 `..`
    pos: usize,
}

impl Dir {
    /// 在指定扇区建立容纳 `entry_cnt` 个目录项的目录 inode。
    /// `.` 与 `..` 由调用者随后插入。
    pub(crate) fn create(core: &Arc<FsCore>, sector: u32, entry_cnt: usize) -> bool {
        Inode::create(core, sector, (entry_cnt * DirEntry::SIZE) as u32, true)
    }

    /// 接管 `inode` 的所有权；句柄销毁时关闭之
    pub(crate) fn open(inode: Arc<Inode>) -> Self {
        Self {
            inode,
            pos: 2 * DirEntry::SIZE,
        }
    }

    pub(crate) fn open_root(core: &Arc<FsCore>) -> Self {
        Self::open(Inode::open(core, ROOT_DIR_SECTOR))
    }

    /// 同一 inode 上的新句柄，游标独立
    pub(crate) fn reopen(&self) -> Self {
        Self::open(self.inode.reopen())
    }

    #[inline]
    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// 按名字查找，命中则返回新打开的 inode，由调用者关闭
    pub fn lookup(&self, name: &str) -> Option<Arc<Inode>> {
        self.slot(name)
            .map(|(_, entry)| Inode::open(self.inode.core(), entry.inode_sector()))
    }

    /// 添加一项。复用首个空槽，没有空槽则把目录文件撑大一项。
    pub fn add(&self, name: &str, sector: u32) -> Result<(), Error> {
        if name.is_empty() {
            return Err(Error::BadPath);
        }
        if name.len() > NAME_MAX {
            return Err(Error::NameTooLong);
        }
        if self.slot(name).is_some() {
            return Err(Error::AlreadyExists);
        }

        let mut offset = 0;
        while let Some(entry) = self.entry_at(offset) {
            if !entry.in_use() {
                break;
            }
            offset += DirEntry::SIZE;
        }

        let entry = DirEntry::new(name, sector);
        if self.inode.write_at(offset, entry.as_bytes()) != DirEntry::SIZE {
            return Err(Error::NoSpace);
        }
        Ok(())
    }

    /// 删除名为 `name` 的项：槽位立即腾空，inode 标记删除，
    /// 回收推迟到它最后一次被关闭。
    pub fn remove(&self, name: &str) -> Result<(), Error> {
        let (offset, mut entry) = self.slot(name).ok_or(Error::NotFound)?;

        let inode = Inode::open(self.inode.core(), entry.inode_sector());
        entry.vacate();
        if self.inode.write_at(offset, entry.as_bytes()) != DirEntry::SIZE {
            inode.close();
            return Err(Error::NoSpace);
        }

        debug!("dir {}: removed {:?}", self.inode.inumber(), name);
        inode.remove();
        inode.close();
        Ok(())
    }

    /// 从游标处读出下一个在用项的名字。`.` 与 `..` 因游标初值而被跳过。
    pub fn readdir(&mut self) -> Option<String> {
        while let Some(entry) = self.entry_at(self.pos) {
            self.pos += DirEntry::SIZE;
            if entry.in_use() {
                return Some(entry.name().to_owned());
            }
        }
        None
    }

    /// 除 `.` 与 `..` 外没有任何在用项
    pub fn is_empty(&self) -> bool {
        let mut offset = 0;
        while let Some(entry) = self.entry_at(offset) {
            offset += DirEntry::SIZE;
            if entry.in_use() && !entry.name_matches(".") && !entry.name_matches("..") {
                return false;
            }
        }
        true
    }

    /// 名字对应的 `(字节偏移, 目录项)`
    fn slot(&self, name: &str) -> Option<(usize, DirEntry)> {
        let mut offset = 0;
        while let Some(entry) = self.entry_at(offset) {
            if entry.in_use() && entry.name_matches(name) {
                return Some((offset, entry));
            }
            offset += DirEntry::SIZE;
        }
        None
    }

    /// 只有完整读满一项才算数；目录末尾的短读即扫描终点
    fn entry_at(&self, offset: usize) -> Option<DirEntry> {
        let mut entry = DirEntry::default();
        (self.inode.read_at(offset, entry.as_bytes_mut()) == DirEntry::SIZE).then_some(entry)
    }
}

impl Drop for Dir {
    fn drop(&mut self) {
        Arc::clone(&self.inode).close();
    }
}
