//! 多级块索引
//! - 直接索引：inode 内联的 10 个扇区号
//! - 一级间接：`blocks[10]` 指向一个装满扇区号的索引扇区
//! - 二级间接：`blocks[11]` 指向一个索引扇区，它的每一项再指向一个一级索引扇区
//!
//! 用量计数器（`direct_used` 等）记录每一级已填到哪里，
//! 增长沿计数器向上走，释放沿计数器走回零。

use core::{mem, ptr, slice};
use std::sync::Arc;

use block_dev::{BlockDevice, SECTOR_SIZE};
use log::debug;

use crate::cache::SectorCache;
use crate::free_map::FreeMap;
use crate::{DataSector, INODE_MAGIC, ROOT_DIR_SECTOR};

/// inode 内联的直接扇区号个数
pub const DIRECT_COUNT: usize = 10;
/// 一个索引扇区容纳的扇区号个数
pub const INDIRECT_COUNT: usize = SECTOR_SIZE / mem::size_of::<u32>();

/// 只用直接索引时的数据扇区容量
const DIRECT_CAP: usize = DIRECT_COUNT;
/// 用上一级索引时的数据扇区容量
const INDIRECT1_CAP: usize = DIRECT_CAP + INDIRECT_COUNT;
/// 用上二级索引时的数据扇区容量，即单文件上限
pub const MAX_SECTORS: usize = INDIRECT1_CAP + INDIRECT_COUNT * INDIRECT_COUNT;

/// 索引扇区：整个扇区连续存储扇区号
pub type IndexSector = [u32; INDIRECT_COUNT];

/// 磁盘上的 inode，恰好一个扇区。
#[derive(Debug, Clone)]
#[repr(C)]
pub struct DiskInode {
    /// [0, 10) 直接；[10] 一级间接；[11] 二级间接
    blocks: [u32; DIRECT_COUNT + 2],
    direct_used: u32,
    /// 一级索引扇区是否已分配（0/1）
    indirect_used: u32,
    indirect_block_count: u32,
    /// 二级索引扇区是否已分配（0/1）
    double_used: u32,
    double_l1_count: u32,
    /// 末尾未填满的一级索引扇区（位于 `double_l1_count` 槽）的填充数
    double_l2_count: u32,
    total_sectors_used: u32,
    /// 文件长度（字节）
    length: u32,
    magic: u32,
    is_dir: u32,
    /// 父目录 inode 的扇区号；文件默认指向根
    parent: u32,
    _reserved: [u32; 105],
}

const _: () = assert!(mem::size_of::<DiskInode>() == SECTOR_SIZE);

impl DiskInode {
    pub fn new(is_dir: bool) -> Self {
        Self {
            blocks: [0; DIRECT_COUNT + 2],
            direct_used: 0,
            indirect_used: 0,
            indirect_block_count: 0,
            double_used: 0,
            double_l1_count: 0,
            double_l2_count: 0,
            total_sectors_used: 0,
            length: 0,
            magic: INODE_MAGIC,
            is_dir: is_dir as u32,
            parent: ROOT_DIR_SECTOR,
            _reserved: [0; 105],
        }
    }

    /// 从缓存读入指定扇区上的 inode
    pub fn load(cache: &SectorCache, device: &Arc<dyn BlockDevice>, sector: u32) -> Self {
        let mut inode = Self::new(false);
        cache.read(device, sector, inode.as_bytes_mut());
        debug_assert_eq!(inode.magic, INODE_MAGIC);
        inode
    }

    /// 经缓存写回指定扇区
    pub fn store(&self, cache: &SectorCache, device: &Arc<dyn BlockDevice>, sector: u32) {
        cache.write(device, sector, self.as_bytes());
    }

    #[inline]
    pub fn length(&self) -> u32 {
        self.length
    }

    #[inline]
    pub fn is_dir(&self) -> bool {
        self.is_dir != 0
    }

    #[inline]
    pub fn parent(&self) -> u32 {
        self.parent
    }

    #[inline]
    pub fn set_parent(&mut self, parent: u32) {
        self.parent = parent;
    }

    #[inline]
    pub fn total_sectors_used(&self) -> u32 {
        self.total_sectors_used
    }

    /// 容纳 `length` 字节所需的数据扇区数
    #[inline]
    pub fn sectors_for(length: u32) -> u32 {
        length.div_ceil(SECTOR_SIZE as u32)
    }

    fn as_bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(ptr::from_ref(self).cast(), SECTOR_SIZE) }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(ptr::from_mut(self).cast(), SECTOR_SIZE) }
    }

    /// 字节偏移所在的数据扇区号。`pos >= length` 视为越界。
    fn byte_to_sector(
        &self,
        pos: usize,
        cache: &SectorCache,
        device: &Arc<dyn BlockDevice>,
    ) -> Option<u32> {
        if pos >= self.length as usize {
            return None;
        }

        let index = pos / SECTOR_SIZE;
        if index < DIRECT_CAP {
            Some(self.blocks[index])
        } else if index < INDIRECT1_CAP {
            let entries = read_index(cache, device, self.blocks[DIRECT_COUNT]);
            Some(entries[index - DIRECT_CAP])
        } else {
            // 剔去直接与一级索引覆盖的部分
            let index = index - INDIRECT1_CAP;
            let l1 = read_index(cache, device, self.blocks[DIRECT_COUNT + 1]);
            let l2 = read_index(cache, device, l1[index / INDIRECT_COUNT]);
            Some(l2[index % INDIRECT_COUNT])
        }
    }

    /// 从指定字节偏移读出数据填充 `buf`，返回实际读取的字节数。
    /// 到达文件末尾时提前停止。
    pub fn read_at(
        &self,
        offset: usize,
        buf: &mut [u8],
        cache: &SectorCache,
        device: &Arc<dyn BlockDevice>,
    ) -> usize {
        let mut offset = offset;
        let mut remain = buf.len();
        let mut read = 0;
        let mut bounce: DataSector = [0; SECTOR_SIZE];

        while remain > 0 {
            let Some(sector) = self.byte_to_sector(offset, cache, device) else {
                break;
            };
            let sector_ofs = offset % SECTOR_SIZE;
            let inode_left = self.length as usize - offset;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = remain.min(inode_left).min(sector_left);

            if sector_ofs == 0 && chunk == SECTOR_SIZE {
                // 整扇区直接进调用者缓冲区
                cache.read(device, sector, &mut buf[read..read + SECTOR_SIZE]);
            } else {
                cache.read(device, sector, &mut bounce);
                buf[read..read + chunk].copy_from_slice(&bounce[sector_ofs..sector_ofs + chunk]);
            }

            offset += chunk;
            read += chunk;
            remain -= chunk;
        }

        read
    }

    /// 把 `buf` 写入指定字节偏移，返回实际写入的字节数。
    /// 不增长文件；超出 `length` 的部分被截断，调用者须先增长。
    pub fn write_at(
        &self,
        offset: usize,
        buf: &[u8],
        cache: &SectorCache,
        device: &Arc<dyn BlockDevice>,
    ) -> usize {
        let mut offset = offset;
        let mut remain = buf.len();
        let mut written = 0;
        let mut bounce: DataSector = [0; SECTOR_SIZE];

        while remain > 0 {
            let Some(sector) = self.byte_to_sector(offset, cache, device) else {
                break;
            };
            let sector_ofs = offset % SECTOR_SIZE;
            let inode_left = self.length as usize - offset;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = remain.min(inode_left).min(sector_left);

            if sector_ofs == 0 && chunk == SECTOR_SIZE {
                cache.write(device, sector, &buf[written..written + SECTOR_SIZE]);
            } else {
                // 部分扇区：除非要覆盖该扇区的全部剩余内容，否则先取回旧数据
                if sector_ofs > 0 || chunk < sector_left {
                    cache.read(device, sector, &mut bounce);
                } else {
                    bounce.fill(0);
                }
                bounce[sector_ofs..sector_ofs + chunk].copy_from_slice(&buf[written..written + chunk]);
                cache.write(device, sector, &bounce);
            }

            offset += chunk;
            written += chunk;
            remain -= chunk;
        }

        written
    }

    /// 把文件增长到能容纳 `new_length` 字节，新扇区全部清零。
    ///
    /// 分配失败时整体回滚：本次调用取得的扇区全部归还，
    /// 计数器与长度恢复原值，返回假。
    pub fn grow_to(
        &mut self,
        new_length: u32,
        cache: &SectorCache,
        device: &Arc<dyn BlockDevice>,
        free_map: &FreeMap,
    ) -> bool {
        debug_assert!(new_length >= self.length);
        let snapshot = self.clone();
        let mut taken = Vec::new();

        self.length = new_length;
        if self.fill(cache, device, free_map, &mut taken).is_some() {
            return true;
        }

        debug!(
            "inode grow to {} bytes failed after {} sectors; rolling back",
            new_length,
            taken.len()
        );
        for sector in taken {
            free_map.release(sector, 1);
        }
        *self = snapshot;
        false
    }

    /// 增长主体：沿计数器把缺额补齐。任何一次分配失败都返回空。
    fn fill(
        &mut self,
        cache: &SectorCache,
        device: &Arc<dyn BlockDevice>,
        free_map: &FreeMap,
        taken: &mut Vec<u32>,
    ) -> Option<()> {
        if Self::sectors_for(self.length) as usize > MAX_SECTORS {
            return None;
        }

        let mut need = Self::sectors_for(self.length).saturating_sub(self.total_sectors_used);
        let zeros: DataSector = [0; SECTOR_SIZE];
        let mut alloc = |taken: &mut Vec<u32>| -> Option<u32> {
            let sector = free_map.allocate(1)?;
            taken.push(sector);
            Some(sector)
        };

        while need > 0 {
            if (self.direct_used as usize) < DIRECT_COUNT {
                /* 直接索引 */
                let sector = alloc(taken)?;
                cache.write(device, sector, &zeros);
                self.blocks[self.direct_used as usize] = sector;
                self.direct_used += 1;
                self.total_sectors_used += 1;
                need -= 1;
            } else if (self.indirect_block_count as usize) < INDIRECT_COUNT {
                /* 一级索引 */
                let mut entries: IndexSector = [0; INDIRECT_COUNT];
                if self.indirect_used == 1 {
                    entries = read_index(cache, device, self.blocks[DIRECT_COUNT]);
                } else {
                    self.blocks[DIRECT_COUNT] = alloc(taken)?;
                }

                let mut i = self.indirect_block_count as usize;
                while i < INDIRECT_COUNT && need > 0 {
                    let sector = alloc(taken)?;
                    cache.write(device, sector, &zeros);
                    entries[i] = sector;
                    self.indirect_block_count += 1;
                    self.total_sectors_used += 1;
                    need -= 1;
                    i += 1;
                }

                write_index(cache, device, self.blocks[DIRECT_COUNT], &entries);
                self.indirect_used = 1;
            } else {
                /* 二级索引 */
                let mut l1: IndexSector = [0; INDIRECT_COUNT];
                if self.double_used == 1 {
                    l1 = read_index(cache, device, self.blocks[DIRECT_COUNT + 1]);
                } else {
                    self.blocks[DIRECT_COUNT + 1] = alloc(taken)?;
                }

                while (self.double_l1_count as usize) < INDIRECT_COUNT && need > 0 {
                    let slot = self.double_l1_count as usize;
                    let mut l2: IndexSector = [0; INDIRECT_COUNT];
                    // 计数器只描述当前槽：非零说明该槽的一级索引扇区
                    // 已存在且填到一半，否则这是一个新槽
                    if self.double_l2_count > 0 {
                        l2 = read_index(cache, device, l1[slot]);
                    } else {
                        l1[slot] = alloc(taken)?;
                    }

                    let mut j = self.double_l2_count as usize;
                    while j < INDIRECT_COUNT && need > 0 {
                        let sector = alloc(taken)?;
                        cache.write(device, sector, &zeros);
                        l2[j] = sector;
                        self.double_l2_count += 1;
                        self.total_sectors_used += 1;
                        need -= 1;
                        j += 1;
                    }

                    write_index(cache, device, l1[slot], &l2);
                    // 填满一个槽才进位
                    if self.double_l2_count as usize == INDIRECT_COUNT {
                        self.double_l2_count = 0;
                        self.double_l1_count += 1;
                    }
                }

                write_index(cache, device, self.blocks[DIRECT_COUNT + 1], &l1);
                self.double_used = 1;
            }
        }

        Some(())
    }

    /// 增长的镜像：释放全部数据扇区，再释放每个索引扇区，
    /// 最后把计数器与长度归零。
    pub fn release(
        &mut self,
        cache: &SectorCache,
        device: &Arc<dyn BlockDevice>,
        free_map: &FreeMap,
    ) {
        /* 直接索引 */
        for i in 0..self.direct_used as usize {
            free_map.release(self.blocks[i], 1);
        }

        /* 一级索引 */
        if self.indirect_used == 1 {
            let entries = read_index(cache, device, self.blocks[DIRECT_COUNT]);
            for &sector in entries.iter().take(self.indirect_block_count as usize) {
                free_map.release(sector, 1);
            }
            free_map.release(self.blocks[DIRECT_COUNT], 1);
        }

        /* 二级索引 */
        if self.double_used == 1 {
            let l1 = read_index(cache, device, self.blocks[DIRECT_COUNT + 1]);

            // 已填满的槽
            for &l1_sector in l1.iter().take(self.double_l1_count as usize) {
                let l2 = read_index(cache, device, l1_sector);
                for &sector in l2.iter() {
                    free_map.release(sector, 1);
                }
                free_map.release(l1_sector, 1);
            }

            // 末尾未填满的槽
            if self.double_l2_count > 0 {
                let l1_sector = l1[self.double_l1_count as usize];
                let l2 = read_index(cache, device, l1_sector);
                for &sector in l2.iter().take(self.double_l2_count as usize) {
                    free_map.release(sector, 1);
                }
                free_map.release(l1_sector, 1);
            }

            free_map.release(self.blocks[DIRECT_COUNT + 1], 1);
        }

        let is_dir = self.is_dir();
        let parent = self.parent;
        *self = Self::new(is_dir);
        self.parent = parent;
    }
}

fn read_index(cache: &SectorCache, device: &Arc<dyn BlockDevice>, sector: u32) -> IndexSector {
    let mut entries: IndexSector = [0; INDIRECT_COUNT];
    let buf =
        unsafe { slice::from_raw_parts_mut(entries.as_mut_ptr().cast::<u8>(), SECTOR_SIZE) };
    cache.read(device, sector, buf);
    entries
}

fn write_index(
    cache: &SectorCache,
    device: &Arc<dyn BlockDevice>,
    sector: u32,
    entries: &IndexSector,
) {
    let buf = unsafe { slice::from_raw_parts(entries.as_ptr().cast::<u8>(), SECTOR_SIZE) };
    cache.write(device, sector, buf);
}
