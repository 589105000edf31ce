use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Arc, Mutex};

use block_dev::SECTOR_SIZE;
use tiny_fs::{FileSys, Process};

use crate::BlockFile;

/// 10 MiB image: roomy enough for the double-indirect scenarios.
const IMAGE_SECTORS: u32 = 20 * 1024;

fn create_image(path: &Path, sectors: u32) -> Arc<BlockFile> {
    let fd = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .unwrap();
    fd.set_len(sectors as u64 * SECTOR_SIZE as u64).unwrap();
    Arc::new(BlockFile(Mutex::new(fd)))
}

fn reopen_image(path: &Path) -> Arc<BlockFile> {
    let fd = OpenOptions::new().read(true).write(true).open(path).unwrap();
    Arc::new(BlockFile(Mutex::new(fd)))
}

fn fresh_fs(dir: &tempfile::TempDir) -> Arc<FileSys> {
    let image = dir.path().join("fs.img");
    FileSys::mount(create_image(&image, IMAGE_SECTORS), true)
}

#[test]
fn multi_level_index_boundaries_survive_remount() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("fs.img");

    // Last direct byte, first indirect byte, last indirect byte, first
    // double-indirect byte, and the first byte of the second level-2 block.
    let marks = [
        0,
        10 * SECTOR_SIZE - 1,
        10 * SECTOR_SIZE,
        (10 + 128) * SECTOR_SIZE - 1,
        (10 + 128) * SECTOR_SIZE,
        (10 + 128 + 128) * SECTOR_SIZE,
    ];

    {
        let fs = FileSys::mount(create_image(&image, IMAGE_SECTORS), true);
        let process = Process::new(&fs);
        assert!(process.create("/big", 0));

        let fd = process.open("/big").unwrap();
        for &mark in &marks {
            assert!(process.seek(fd, mark));
            assert_eq!(process.write(fd, &[0xaa]), Some(1));
        }
        process.close(fd);
        fs.shutdown();
    }

    let fs = FileSys::mount(reopen_image(&image), false);
    let process = Process::new(&fs);
    let fd = process.open("/big").unwrap();

    for &mark in &marks {
        let mut byte = [0];
        assert!(process.seek(fd, mark));
        assert_eq!(process.read(fd, &mut byte), Some(1));
        assert_eq!(byte[0], 0xaa, "offset {mark}");
    }

    // Everything in between stays zero.
    for &other in &[
        1,
        10 * SECTOR_SIZE - 2,
        64 * SECTOR_SIZE,
        137 * SECTOR_SIZE,
        200 * SECTOR_SIZE + 7,
    ] {
        let mut byte = [0xff];
        assert!(process.seek(fd, other));
        assert_eq!(process.read(fd, &mut byte), Some(1));
        assert_eq!(byte[0], 0, "offset {other}");
    }
}

#[test]
fn sparse_growth_via_seek() {
    const MIB: usize = 1 << 20;

    let dir = tempfile::tempdir().unwrap();
    let fs = fresh_fs(&dir);
    let process = Process::new(&fs);

    assert!(process.create("/s", 0));
    let fd = process.open("/s").unwrap();
    assert!(process.seek(fd, MIB));
    assert_eq!(process.write(fd, b"X"), Some(1));
    process.close(fd);

    let fd = process.open("/s").unwrap();
    assert_eq!(process.filesize(fd), Some((MIB + 1) as u32));
    assert_eq!(
        process.stat(fd).unwrap().blocks,
        (MIB + 1).div_ceil(SECTOR_SIZE) as u32
    );

    // The hole reads back as zeros.
    let mut buf = vec![0u8; 64 * 1024];
    let mut checked = 0;
    while checked < MIB {
        assert_eq!(process.read(fd, &mut buf), Some(buf.len()));
        assert!(buf.iter().all(|&b| b == 0), "hole dirty near {checked}");
        checked += buf.len();
    }
    let mut last = [0];
    assert_eq!(process.read(fd, &mut last), Some(1));
    assert_eq!(&last, b"X");
}

#[test]
fn removal_is_deferred_until_last_close() {
    let dir = tempfile::tempdir().unwrap();
    let fs = fresh_fs(&dir);
    let a = Process::new(&fs);
    let b = Process::new(&fs);

    assert!(a.create("/f", 4096));
    let fd = a.open("/f").unwrap();
    assert_eq!(a.write(fd, b"hello"), Some(5));

    let free_before_remove = fs.free_sectors();
    assert!(b.remove("/f"));

    // The name is gone but A's handle still works.
    assert_eq!(b.open("/f"), None);
    assert!(a.seek(fd, 0));
    let mut buf = [0; 5];
    assert_eq!(a.read(fd, &mut buf), Some(5));
    assert_eq!(&buf, b"hello");
    assert_eq!(fs.free_sectors(), free_before_remove);

    // Last close returns the 8 data sectors plus the inode sector.
    a.close(fd);
    assert_eq!(fs.free_sectors(), free_before_remove + 8 + 1);
}

#[test]
fn non_empty_directory_cannot_be_removed() {
    let dir = tempfile::tempdir().unwrap();
    let fs = fresh_fs(&dir);
    let process = Process::new(&fs);

    assert!(process.mkdir("/d"));
    assert!(process.create("/d/x", 0));

    assert!(!process.remove("/d"));
    assert!(process.remove("/d/x"));
    assert!(process.remove("/d"));
}

#[test]
fn open_directory_cannot_be_removed() {
    let dir = tempfile::tempdir().unwrap();
    let fs = fresh_fs(&dir);
    let process = Process::new(&fs);

    assert!(process.mkdir("/d"));
    let fd = process.open("/d").unwrap();
    assert!(!process.remove("/d"));

    process.close(fd);
    assert!(process.remove("/d"));
}

#[test]
fn working_directory_cannot_be_removed() {
    let dir = tempfile::tempdir().unwrap();
    let fs = fresh_fs(&dir);
    let a = Process::new(&fs);
    let b = Process::new(&fs);

    assert!(a.mkdir("/e"));
    assert!(b.chdir("/e"));
    assert!(!a.remove("/e"));

    assert!(b.chdir("/"));
    assert!(a.remove("/e"));
}

#[test]
fn redundant_separators_and_trailing_slash() {
    let dir = tempfile::tempdir().unwrap();
    let fs = fresh_fs(&dir);
    let process = Process::new(&fs);

    assert!(process.mkdir("/a"));
    assert!(process.mkdir("/a//b/"));
    assert!(process.chdir("//a///b/."));

    let fd = process.open("/a/b").unwrap();
    assert_eq!(process.cwd_inumber(), process.inumber(fd).unwrap());
}

#[test]
fn dirty_data_reaches_the_image_only_on_flush() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("fs.img");
    let fs = FileSys::mount(create_image(&image, 4096), true);
    let process = Process::new(&fs);

    let marker = b"tiny-fs-marker-0";
    assert!(process.create("/k", 0));
    let fd = process.open("/k").unwrap();
    assert_eq!(process.write(fd, marker), Some(marker.len()));

    // Bypassing the cache, the device still holds the old contents.
    assert!(!image_contains(&image, marker));

    fs.flush();
    assert!(image_contains(&image, marker));
}

fn image_contains(image: &Path, needle: &[u8]) -> bool {
    let bytes = std::fs::read(image).unwrap();
    bytes.windows(needle.len()).any(|window| window == needle)
}

#[test]
fn bulk_write_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let fs = fresh_fs(&dir);
    let process = Process::new(&fs);

    let data: Vec<u8> = (0..100_000).map(|i| (i * 7 % 251) as u8).collect();
    assert!(process.create("/blob", 0));
    let fd = process.open("/blob").unwrap();
    assert_eq!(process.write(fd, &data), Some(data.len()));

    assert!(process.seek(fd, 0));
    let mut out = vec![0u8; data.len()];
    assert_eq!(process.read(fd, &mut out), Some(data.len()));
    assert_eq!(out, data);
}

#[test]
fn rewriting_allocated_space_allocates_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let fs = fresh_fs(&dir);
    let process = Process::new(&fs);

    assert!(process.create("/g", 4096));
    let fd = process.open("/g").unwrap();
    assert_eq!(process.stat(fd).unwrap().blocks, 8);

    assert_eq!(process.write(fd, &[7; 100]), Some(100));
    assert_eq!(process.stat(fd).unwrap().blocks, 8);
}

#[test]
fn opening_twice_yields_the_same_inode() {
    let dir = tempfile::tempdir().unwrap();
    let fs = fresh_fs(&dir);
    let process = Process::new(&fs);
    assert!(process.create("/x", 0));

    let root = fs.root_dir();
    let first = fs.open_node(&root, "/x").unwrap();
    let second = fs.open_node(&root, "/x").unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    second.close();
    first.close();
}

#[test]
fn denied_writes_return_zero() {
    let dir = tempfile::tempdir().unwrap();
    let fs = fresh_fs(&dir);
    let process = Process::new(&fs);
    assert!(process.create("/w", 0));
    let fd = process.open("/w").unwrap();

    let root = fs.root_dir();
    let node = fs.open_node(&root, "/w").unwrap();
    node.deny_write();
    assert_eq!(process.write(fd, b"nope"), Some(0));

    node.allow_write();
    assert_eq!(process.write(fd, b"fine"), Some(4));
    node.close();
}

#[test]
fn directory_tree_survives_remount() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("fs.img");

    {
        let fs = FileSys::mount(create_image(&image, 4096), true);
        let process = Process::new(&fs);
        assert!(process.mkdir("/docs"));
        assert!(process.create("/docs/readme", 0));
        let fd = process.open("/docs/readme").unwrap();
        assert_eq!(process.write(fd, b"persisted"), Some(9));
        process.close(fd);
        fs.shutdown();
    }

    let fs = FileSys::mount(reopen_image(&image), false);
    let process = Process::new(&fs);
    assert!(process.chdir("/docs"));

    let fd = process.open("readme").unwrap();
    let mut buf = [0; 9];
    assert_eq!(process.read(fd, &mut buf), Some(9));
    assert_eq!(&buf, b"persisted");
}
