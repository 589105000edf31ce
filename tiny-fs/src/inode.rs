//! # 索引节点层
//!
//! 每个磁盘 inode 在内存中至多有一个 [`Inode`]：打开已打开的
//! inode 得到同一对象，引用计数加一。计数归零的那次关闭把缓存的
//! 磁盘 inode 写回；若此前被标记删除，还要归还全部数据扇区和
//! inode 扇区本身。
//!
//! 打开表只存弱引用做回查，对象的生命期由 `open_count` 驱动，
//! 不由表驱动。

use std::sync::{Arc, Weak};

use log::debug;
use spin::Mutex;

use crate::filesys::FsCore;
use crate::layout::DiskInode;

/// 内存中的 inode。
pub struct Inode {
    sector: u32,
    core: Arc<FsCore>,
    state: Mutex<InodeState>,
}

struct InodeState {
    open_count: u32,
    /// 已标记删除，最后一次关闭时回收
    removed: bool,
    deny_write_count: u32,
    /// 磁盘 inode 的缓存副本
    disk: DiskInode,
}

impl Inode {
    /// 在指定扇区初始化一个新的磁盘 inode 并增长到 `length` 字节。
    /// 增长失败时不留下任何已分配扇区，返回假。
    pub(crate) fn create(core: &Arc<FsCore>, sector: u32, length: u32, is_dir: bool) -> bool {
        let mut disk = DiskInode::new(is_dir);
        if !disk.grow_to(length, &core.cache, &core.device, &core.free_map) {
            return false;
        }
        disk.store(&core.cache, &core.device, sector);
        true
    }

    /// 返回 `sector` 对应的唯一内存 inode；不存在则从磁盘装入。
    pub(crate) fn open(core: &Arc<FsCore>, sector: u32) -> Arc<Self> {
        let mut table = core.open_inodes.lock();
        table.retain(|(_, weak)| weak.strong_count() > 0);

        if let Some(inode) = table
            .iter()
            .find_map(|(held, weak)| (*held == sector).then(|| weak.upgrade()).flatten())
        {
            inode.state.lock().open_count += 1;
            return inode;
        }

        let inode = Arc::new(Self {
            sector,
            core: Arc::clone(core),
            state: Mutex::new(InodeState {
                open_count: 1,
                removed: false,
                deny_write_count: 0,
                disk: DiskInode::load(&core.cache, &core.device, sector),
            }),
        });
        table.push((sector, Arc::downgrade(&inode)));
        inode
    }

    /// 再次打开同一对象
    pub fn reopen(self: &Arc<Self>) -> Arc<Self> {
        self.state.lock().open_count += 1;
        Arc::clone(self)
    }

    /// 关闭一个引用。计数归零时写回磁盘 inode、从打开表注销，
    /// 被删除的还要归还它占用的全部扇区。
    pub fn close(self: Arc<Self>) {
        // 锁序与 open 一致：先打开表，后 inode 状态
        let mut table = self.core.open_inodes.lock();
        let mut state = self.state.lock();
        debug_assert!(state.open_count > 0);
        state.open_count -= 1;
        if state.open_count > 0 {
            return;
        }

        table.retain(|(sector, _)| *sector != self.sector);
        drop(table);

        state.disk.store(&self.core.cache, &self.core.device, self.sector);

        if state.removed {
            debug!("inode {}: reclaimed on last close", self.sector);
            state
                .disk
                .release(&self.core.cache, &self.core.device, &self.core.free_map);
            self.core.free_map.release(self.sector, 1);
        }
    }

    /// 标记删除；真正的回收推迟到最后一次关闭
    pub fn remove(&self) {
        self.state.lock().removed = true;
    }

    /// 从 `offset` 读入 `buf`，返回实际读取字节数
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let state = self.state.lock();
        state
            .disk
            .read_at(offset, buf, &self.core.cache, &self.core.device)
    }

    /// 把 `buf` 写入 `offset` 处，必要时先把文件增长到
    /// `offset + buf.len()` 字节。增长失败或写被拒绝时返回 0。
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> usize {
        let mut state = self.state.lock();
        if state.deny_write_count > 0 {
            return 0;
        }

        let end = offset + buf.len();
        if end > state.disk.length() as usize
            && !state
                .disk
                .grow_to(end as u32, &self.core.cache, &self.core.device, &self.core.free_map)
        {
            return 0;
        }

        state
            .disk
            .write_at(offset, buf, &self.core.cache, &self.core.device)
    }

    pub fn deny_write(&self) {
        let mut state = self.state.lock();
        state.deny_write_count += 1;
        debug_assert!(state.deny_write_count <= state.open_count);
    }

    pub fn allow_write(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.deny_write_count > 0);
        state.deny_write_count -= 1;
    }

    /// inode 号即其所在扇区号
    #[inline]
    pub fn inumber(&self) -> u32 {
        self.sector
    }

    pub fn length(&self) -> u32 {
        self.state.lock().disk.length()
    }

    pub fn is_dir(&self) -> bool {
        self.state.lock().disk.is_dir()
    }

    pub fn parent(&self) -> u32 {
        self.state.lock().disk.parent()
    }

    /// 把 `child` 的父目录指向 `parent`
    pub(crate) fn set_parent(core: &Arc<FsCore>, parent: u32, child: u32) {
        let child = Self::open(core, child);
        child.state.lock().disk.set_parent(parent);
        child.close();
    }

    pub(crate) fn core(&self) -> &Arc<FsCore> {
        &self.core
    }

    pub(crate) fn open_count(&self) -> u32 {
        self.state.lock().open_count
    }

    /// 一次加锁取出 `(长度, 占用扇区数)`，两者来自同一时刻
    pub(crate) fn snapshot(&self) -> (u32, u32) {
        let state = self.state.lock();
        (state.disk.length(), state.disk.total_sectors_used())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemDisk;
    use crate::SECTOR_SIZE;

    fn core(sectors: usize) -> Arc<FsCore> {
        FsCore::for_device(MemDisk::new(sectors))
    }

    fn sectors_used(inode: &Inode) -> u32 {
        inode.snapshot().1
    }

    fn fresh_inode(core: &Arc<FsCore>, length: u32) -> Arc<Inode> {
        let sector = core.free_map.allocate(1).unwrap();
        assert!(Inode::create(core, sector, length, false));
        Inode::open(core, sector)
    }

    #[test]
    fn create_then_open_reports_length() {
        let core = core(4096);
        let inode = fresh_inode(&core, 1000);

        assert_eq!(inode.length(), 1000);
        assert_eq!(sectors_used(&inode), 2);
        assert!(!inode.is_dir());
    }

    #[test]
    fn open_twice_returns_same_object() {
        let core = core(4096);
        let first = fresh_inode(&core, 0);
        let second = Inode::open(&core, first.inumber());

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.open_count(), 2);

        second.close();
        first.close();
    }

    #[test]
    fn write_read_round_trip_across_sectors() {
        let core = core(4096);
        let inode = fresh_inode(&core, 0);

        let data: Vec<u8> = (0..3 * SECTOR_SIZE + 37).map(|i| i as u8).collect();
        assert_eq!(inode.write_at(200, &data), data.len());

        let mut out = vec![0; data.len()];
        assert_eq!(inode.read_at(200, &mut out), data.len());
        assert_eq!(out, data);
        assert_eq!(inode.length() as usize, 200 + data.len());
    }

    #[test]
    fn growth_reaches_indirect_and_double_levels() {
        let core = core(20000);
        let inode = fresh_inode(&core, 0);

        // 六个跨级边界各写一个字节
        let marks = [
            0,
            10 * SECTOR_SIZE - 1,
            10 * SECTOR_SIZE,
            (10 + 128) * SECTOR_SIZE - 1,
            (10 + 128) * SECTOR_SIZE,
            (10 + 128 + 128) * SECTOR_SIZE,
        ];
        for &offset in &marks {
            assert_eq!(inode.write_at(offset, &[0xaa]), 1);
        }

        for &offset in &marks {
            let mut byte = [0];
            assert_eq!(inode.read_at(offset, &mut byte), 1);
            assert_eq!(byte[0], 0xaa, "offset {offset}");
        }

        // 其余字节保持为零
        let mut byte = [0xff];
        inode.read_at(10 * SECTOR_SIZE + 1, &mut byte);
        assert_eq!(byte[0], 0);

        // (10 + 128 + 128) 个数据扇区零散写满后：数据 267 扇区
        assert_eq!(sectors_used(&inode), 267);
        assert_eq!(inode.length() as usize, (10 + 128 + 128) * SECTOR_SIZE + 1);
    }

    #[test]
    fn rewrite_does_not_allocate() {
        let core = core(4096);
        let inode = fresh_inode(&core, 3 * SECTOR_SIZE as u32);

        let used = sectors_used(&inode);
        assert_eq!(inode.write_at(100, b"already allocated"), 17);
        assert_eq!(sectors_used(&inode), used);
    }

    #[test]
    fn deny_write_blocks_until_allowed() {
        let core = core(4096);
        let inode = fresh_inode(&core, 0);

        inode.deny_write();
        assert_eq!(inode.write_at(0, b"nope"), 0);

        inode.allow_write();
        assert_eq!(inode.write_at(0, b"fine"), 4);
    }

    #[test]
    fn removed_inode_returns_sectors_on_last_close() {
        let core = core(4096);
        let before = core.free_map.free_sectors();

        let inode = fresh_inode(&core, 5 * SECTOR_SIZE as u32);
        let other = inode.reopen();

        inode.remove();
        other.close();
        // 仍有一个引用，扇区尚未归还
        assert!(core.free_map.free_sectors() < before);

        inode.close();
        assert_eq!(core.free_map.free_sectors(), before);
    }

    #[test]
    fn allocation_failure_leaves_file_untouched() {
        let core = core(64);
        let inode = fresh_inode(&core, 0);

        assert_eq!(inode.write_at(0, b"ok"), 2);
        let used = sectors_used(&inode);

        // 远超设备容量的增长必须整体失败
        assert_eq!(inode.write_at(SECTOR_SIZE * 1000, b"x"), 0);
        assert_eq!(sectors_used(&inode), used);
        assert_eq!(inode.length() as usize, 2);
    }
}
