//! # 文件系统服务层
//!
//! [`FileSys`] 把各层装配起来：挂载与格式化、面向路径的
//! 创建/打开/删除/建目录，以及卸载时的持久化。
//!
//! 系统调用层进来的入口在一把进程级互斥锁下全程串行，
//! 缓存的行级纪律由此升格为完整的目录操作原子性；
//! `chdir` 只改每进程状态，有意不在此锁下。

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use block_dev::BlockDevice;
use log::{debug, info};

use crate::cache::SectorCache;
use crate::dir::Dir;
use crate::free_map::FreeMap;
use crate::inode::Inode;
use crate::path;
use crate::{Error, ROOT_DIR_SECTOR};

/// 根目录的初始容量（目录项数）
const ROOT_DIR_ENTRIES: usize = 100;

/// 各层共享的基座。
pub(crate) struct FsCore {
    pub(crate) device: Arc<dyn BlockDevice>,
    pub(crate) cache: Arc<SectorCache>,
    pub(crate) free_map: FreeMap,
    /// 打开 inode 表：`(扇区号, 弱引用)`，见索引节点层
    pub(crate) open_inodes: spin::Mutex<Vec<(u32, Weak<Inode>)>>,
}

impl FsCore {
    pub(crate) fn for_device(device: Arc<dyn BlockDevice>) -> Arc<Self> {
        Arc::new(Self {
            cache: SectorCache::new(),
            free_map: FreeMap::new(device.sector_count()),
            open_inodes: spin::Mutex::new(Vec::new()),
            device,
        })
    }
}

/// 一个挂载的文件系统。
pub struct FileSys {
    core: Arc<FsCore>,
    /// 粗粒度入口锁
    lock: Mutex<()>,
}

impl FileSys {
    /// 挂载设备。`format` 为真时先格式化：建立空闲位图文件和
    /// 一个空的根目录。根目录建立失败属于配置故障，直接 panic。
    pub fn mount(device: Arc<dyn BlockDevice>, format: bool) -> Arc<Self> {
        let core = FsCore::for_device(device);
        let fs = Arc::new(Self {
            core,
            lock: Mutex::new(()),
        });

        if format {
            fs.format();
        }
        fs.core.free_map.open(&fs.core.cache, &fs.core.device);

        // 根目录的 `.` 与 `..` 都指向自己；已存在时 add 失败即可
        let root = Dir::open_root(&fs.core);
        let _ = root.add(".", ROOT_DIR_SECTOR);
        let _ = root.add("..", ROOT_DIR_SECTOR);

        info!(
            "file system mounted, {} sectors free",
            fs.core.free_map.free_sectors()
        );
        fs
    }

    fn format(&self) {
        info!("formatting file system");
        if !self.core.free_map.create(&self.core.cache, &self.core.device) {
            panic!("free map creation failed");
        }
        if !Dir::create(&self.core, ROOT_DIR_SECTOR, ROOT_DIR_ENTRIES) {
            panic!("root directory creation failed");
        }
        self.core.free_map.close(&self.core.cache, &self.core.device);
    }

    /// 卸载前的收尾：先持久化空闲位图，再同步刷写缓存。
    pub fn shutdown(&self) {
        let _guard = self.lock.lock().unwrap();
        self.core.free_map.close(&self.core.cache, &self.core.device);
        self.core.cache.flush();
    }

    /// 把所有脏扇区写回设备
    pub fn flush(&self) {
        self.core.cache.flush();
    }

    /// 打开一个指向根目录的新句柄
    pub fn root_dir(&self) -> Dir {
        Dir::open_root(&self.core)
    }

    /// 尚未分配的扇区数
    pub fn free_sectors(&self) -> u32 {
        self.core.free_map.free_sectors()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap()
    }

    /// 建立 `initial_size` 字节的普通文件
    pub fn create(&self, cwd: &Dir, path: &str, initial_size: u32) -> bool {
        let _guard = self.lock();
        self.create_locked(cwd, path, initial_size).is_ok()
    }

    fn create_locked(&self, cwd: &Dir, path: &str, initial_size: u32) -> Result<(), Error> {
        let (parent, name) = path::find_dir(&self.core, cwd, path).ok_or(Error::BadPath)?;
        let dir = Dir::open(parent);

        let sector = self.core.free_map.allocate(1).ok_or(Error::NoSpace)?;
        if !Inode::create(&self.core, sector, initial_size, false) {
            self.core.free_map.release(sector, 1);
            return Err(Error::NoSpace);
        }

        if let Err(err) = dir.add(&name, sector) {
            // 数据扇区随 inode 一起回收
            let inode = Inode::open(&self.core, sector);
            inode.remove();
            inode.close();
            return Err(err);
        }

        debug!("created {path:?} ({initial_size} bytes) at sector {sector}");
        Ok(())
    }

    /// 解析路径并打开它指向的 inode；文件还是目录由调用者分辨
    pub fn open_node(&self, cwd: &Dir, path: &str) -> Option<Arc<Inode>> {
        let _guard = self.lock();
        let (parent, name) = path::find_dir(&self.core, cwd, path)?;
        let dir = Dir::open(parent);
        dir.lookup(&name)
    }

    /// 删除文件或空目录
    pub fn remove(&self, cwd: &Dir, path: &str) -> bool {
        let _guard = self.lock();
        self.remove_locked(cwd, path).is_ok()
    }

    fn remove_locked(&self, cwd: &Dir, path: &str) -> Result<(), Error> {
        let (parent, name) = path::find_dir(&self.core, cwd, path).ok_or(Error::BadPath)?;
        let dir = Dir::open(parent);
        let inode = dir.lookup(&name).ok_or(Error::NotFound)?;

        if inode.is_dir() {
            let probe = Dir::open(inode.reopen());
            let empty = probe.is_empty();
            drop(probe);

            if !empty {
                inode.close();
                return Err(Error::DirectoryNotEmpty);
            }
            // 本次 lookup 占一个计数；再多就是别处的句柄或某个
            // 进程的工作目录
            if inode.open_count() > 1 {
                inode.close();
                return Err(Error::DirectoryInUse);
            }
        }

        let removed = dir.remove(&name);
        inode.close();
        removed
    }

    /// 建立子目录并装入 `.` 与 `..`
    pub fn mkdir(&self, cwd: &Dir, path: &str) -> bool {
        let _guard = self.lock();
        self.mkdir_locked(cwd, path).is_ok()
    }

    fn mkdir_locked(&self, cwd: &Dir, path: &str) -> Result<(), Error> {
        let (parent, name) = path::find_dir(&self.core, cwd, path).ok_or(Error::BadPath)?;
        let dir = Dir::open(parent);

        let sector = self.core.free_map.allocate(1).ok_or(Error::NoSpace)?;
        if !Dir::create(&self.core, sector, 0) {
            self.core.free_map.release(sector, 1);
            return Err(Error::NoSpace);
        }

        if let Err(err) = dir.add(&name, sector) {
            let inode = Inode::open(&self.core, sector);
            inode.remove();
            inode.close();
            return Err(err);
        }

        let child = Dir::open(Inode::open(&self.core, sector));
        let _ = child.add(".", sector);
        let _ = child.add("..", dir.inode().inumber());
        Inode::set_parent(&self.core, dir.inode().inumber(), sector);

        debug!("mkdir {path:?} at sector {sector}");
        Ok(())
    }

    /// `chdir` 专用：不取入口锁地解析出一个目录句柄。
    /// 它只改每进程状态，与其它入口的原子性无关。
    pub fn resolve_dir(&self, cwd: &Dir, path: &str) -> Option<Dir> {
        let (parent, name) = path::find_dir(&self.core, cwd, path)?;
        let dir = Dir::open(parent);
        let inode = dir.lookup(&name)?;
        if !inode.is_dir() {
            inode.close();
            return None;
        }
        Some(Dir::open(inode))
    }
}
