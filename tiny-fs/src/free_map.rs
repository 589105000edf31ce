//! # 空闲位图层
//!
//! 记录全盘每个扇区的分配情况。位图常驻内存，
//! 持久化为一个隐藏文件：它的 inode 固定在 [`FREE_MAP_SECTOR`]，
//! 数据区经由索引节点层读写。

use std::sync::Arc;

use block_dev::BlockDevice;
use log::debug;
use spin::Mutex;

use crate::cache::SectorCache;
use crate::layout::DiskInode;
use crate::{FREE_MAP_SECTOR, ROOT_DIR_SECTOR};

/// 位组
type Group = u64;
const GROUP_BITS: usize = Group::BITS as usize;
const GROUP_BYTES: usize = core::mem::size_of::<Group>();

pub(crate) struct FreeMap {
    inner: Mutex<Bits>,
}

struct Bits {
    groups: Vec<Group>,
    /// 有效位数，即设备扇区数
    sectors: u32,
}

impl FreeMap {
    /// 全空的位图，仅预占位图自身与根目录的 inode 扇区
    pub fn new(sector_count: u32) -> Self {
        let mut bits = Bits {
            groups: vec![0; (sector_count as usize).div_ceil(GROUP_BITS)],
            sectors: sector_count,
        };
        bits.set(FREE_MAP_SECTOR);
        bits.set(ROOT_DIR_SECTOR);

        Self {
            inner: Mutex::new(bits),
        }
    }

    /// 分配 `n` 个连续扇区，返回首扇区号；空间不足返回空。
    pub fn allocate(&self, n: u32) -> Option<u32> {
        let mut bits = self.inner.lock();
        let start = bits.scan(n)?;
        for sector in start..start + n {
            bits.set(sector);
        }
        Some(start)
    }

    /// 归还从 `sector` 起的 `n` 个扇区
    pub fn release(&self, sector: u32, n: u32) {
        let mut bits = self.inner.lock();
        for sector in sector..sector + n {
            // 归还的扇区必须在分配状态
            debug_assert!(bits.get(sector));
            bits.clear(sector);
        }
    }

    /// 尚未分配的扇区数
    pub fn free_sectors(&self) -> u32 {
        let bits = self.inner.lock();
        let used: u32 = bits.groups.iter().map(|group| group.count_ones()).sum();
        bits.sectors - used
    }

    /// 格式化：在磁盘上建立位图文件并写入当前内容
    pub fn create(&self, cache: &SectorCache, device: &Arc<dyn BlockDevice>) -> bool {
        let mut disk = DiskInode::new(false);
        if !disk.grow_to(self.byte_len() as u32, cache, device, self) {
            return false;
        }
        disk.store(cache, device, FREE_MAP_SECTOR);

        let buf = self.to_bytes();
        disk.write_at(0, &buf, cache, device) == buf.len()
    }

    /// 从磁盘装入位图内容
    pub fn open(&self, cache: &SectorCache, device: &Arc<dyn BlockDevice>) {
        let disk = DiskInode::load(cache, device, FREE_MAP_SECTOR);
        let mut buf = vec![0u8; self.byte_len()];
        let read = disk.read_at(0, &mut buf, cache, device);
        debug_assert_eq!(read, buf.len());

        self.inner.lock().load_bytes(&buf);
        debug!("free map opened: {} sectors free", self.free_sectors());
    }

    /// 把位图内容写回磁盘上的位图文件
    pub fn close(&self, cache: &SectorCache, device: &Arc<dyn BlockDevice>) {
        let disk = DiskInode::load(cache, device, FREE_MAP_SECTOR);
        let buf = self.to_bytes();
        let written = disk.write_at(0, &buf, cache, device);
        debug_assert_eq!(written, buf.len());
    }

    fn byte_len(&self) -> usize {
        self.inner.lock().groups.len() * GROUP_BYTES
    }

    fn to_bytes(&self) -> Vec<u8> {
        let bits = self.inner.lock();
        let mut buf = Vec::with_capacity(bits.groups.len() * GROUP_BYTES);
        for group in &bits.groups {
            buf.extend_from_slice(&group.to_le_bytes());
        }
        buf
    }
}

impl Bits {
    #[inline]
    fn get(&self, sector: u32) -> bool {
        let (group, bit) = locate(sector);
        self.groups[group] & (1 << bit) != 0
    }

    #[inline]
    fn set(&mut self, sector: u32) {
        let (group, bit) = locate(sector);
        self.groups[group] |= 1 << bit;
    }

    #[inline]
    fn clear(&mut self, sector: u32) {
        let (group, bit) = locate(sector);
        self.groups[group] &= !(1 << bit);
    }

    /// 找一段长为 `n` 的连续空闲区，返回首扇区号
    fn scan(&self, n: u32) -> Option<u32> {
        if n == 1 {
            // 逐组找还有 0 位的组
            return self
                .groups
                .iter()
                .enumerate()
                .find_map(|(group, &bits)| {
                    (bits != Group::MAX).then(|| (group * GROUP_BITS) as u32 + bits.trailing_ones())
                })
                .filter(|&sector| sector < self.sectors);
        }

        let mut run = 0;
        for sector in 0..self.sectors {
            run = if self.get(sector) { 0 } else { run + 1 };
            if run == n {
                return Some(sector + 1 - n);
            }
        }
        None
    }

    fn load_bytes(&mut self, buf: &[u8]) {
        debug_assert_eq!(buf.len(), self.groups.len() * GROUP_BYTES);
        for (group, chunk) in self
            .groups
            .iter_mut()
            .zip(buf.chunks_exact(GROUP_BYTES))
        {
            *group = Group::from_le_bytes(chunk.try_into().unwrap());
        }
    }
}

#[inline]
fn locate(sector: u32) -> (usize, usize) {
    (
        sector as usize / GROUP_BITS,
        sector as usize % GROUP_BITS,
    )
}
