//! 测试公用的内存盘

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use block_dev::{BlockDevice, SECTOR_SIZE};

use crate::DataSector;

pub(crate) struct MemDisk {
    sectors: Mutex<Vec<u8>>,
    pub reads: AtomicU64,
}

impl MemDisk {
    pub fn new(count: usize) -> Arc<Self> {
        Arc::new(Self {
            sectors: Mutex::new(vec![0; count * SECTOR_SIZE]),
            reads: AtomicU64::new(0),
        })
    }

    /// 绕过缓存直接看设备内容
    pub fn raw(&self, sector: u32) -> DataSector {
        let sectors = self.sectors.lock().unwrap();
        let start = sector as usize * SECTOR_SIZE;
        let mut out = [0; SECTOR_SIZE];
        out.copy_from_slice(&sectors[start..start + SECTOR_SIZE]);
        out
    }
}

impl BlockDevice for MemDisk {
    fn read_sector(&self, sector: u32, buf: &mut [u8]) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let sectors = self.sectors.lock().unwrap();
        let start = sector as usize * SECTOR_SIZE;
        buf.copy_from_slice(&sectors[start..start + SECTOR_SIZE]);
    }

    fn write_sector(&self, sector: u32, buf: &[u8]) {
        let mut sectors = self.sectors.lock().unwrap();
        let start = sector as usize * SECTOR_SIZE;
        sectors[start..start + SECTOR_SIZE].copy_from_slice(buf);
    }

    fn sector_count(&self) -> u32 {
        (self.sectors.lock().unwrap().len() / SECTOR_SIZE) as u32
    }
}
