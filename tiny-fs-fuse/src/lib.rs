#[cfg(test)]
mod tests;

use std::fs::File;
use std::io::{Read, Write};
use std::io::{Seek, SeekFrom};
use std::sync::Mutex;

use block_dev::{BlockDevice, SECTOR_SIZE};

/// A disk image backed by an ordinary host file.
pub struct BlockFile(pub Mutex<File>);

impl BlockDevice for BlockFile {
    fn read_sector(&self, sector: u32, buf: &mut [u8]) {
        let mut file = self.0.lock().unwrap();
        file.seek(SeekFrom::Start(sector as u64 * SECTOR_SIZE as u64))
            .expect("seeking error");
        assert_eq!(
            file.read(buf).unwrap(),
            SECTOR_SIZE,
            "not a complete sector!"
        );
    }

    fn write_sector(&self, sector: u32, buf: &[u8]) {
        let mut file = self.0.lock().unwrap();
        file.seek(SeekFrom::Start(sector as u64 * SECTOR_SIZE as u64))
            .expect("seeking error");
        assert_eq!(
            file.write(buf).unwrap(),
            SECTOR_SIZE,
            "not a complete sector!"
        );
    }

    fn sector_count(&self) -> u32 {
        let file = self.0.lock().unwrap();
        (file.metadata().unwrap().len() / SECTOR_SIZE as u64) as u32
    }
}
