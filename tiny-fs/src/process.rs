//! # 进程层
//!
//! 每个进程持有：当前工作目录、打开文件表、从 2 起步的描述符
//! 计数器。描述符 0 与 1 保留给控制台，不对应任何 inode。
//!
//! 除 `chdir` 外，凡进入文件系统的操作都在 [`FileSys`] 的粗粒度
//! 锁下全程执行。

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;

use enumflags2::bitflags;
use log::debug;
use spin::Mutex;

use crate::dir::Dir;
use crate::filesys::FileSys;
use crate::inode::Inode;

pub type Fd = usize;

/// 控制台输入
pub const FD_STDIN: Fd = 0;
/// 控制台输出
pub const FD_STDOUT: Fd = 1;

pub struct Process {
    fs: Arc<FileSys>,
    inner: Mutex<ProcessInner>,
}

struct ProcessInner {
    cwd: Dir,
    files: BTreeMap<Fd, Handle>,
    next_fd: Fd,
}

/// 打开的对象：文件带字节偏移，目录带遍历游标。
/// 在描述符边界用标签变体区分两者，而不是互相转换。
enum Handle {
    File { inode: Arc<Inode>, offset: usize },
    Dir(Dir),
}

impl Handle {
    fn inode(&self) -> &Arc<Inode> {
        match self {
            Handle::File { inode, .. } => inode,
            Handle::Dir(dir) => dir.inode(),
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        // 目录句柄自行关闭它的 inode
        if let Handle::File { inode, .. } = self {
            Arc::clone(inode).close();
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub kind: StatKind,
    /// inode 号
    pub inode: u32,
    /// 文件长度（字节）
    pub size: u32,
    /// 占用的数据扇区数
    pub blocks: u32,
}

#[allow(clippy::upper_case_acronyms)]
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    DIR = 0o040000,
    FILE = 0o100000,
}

impl Process {
    /// 新进程：工作目录为根，描述符从 2 起分配
    pub fn new(fs: &Arc<FileSys>) -> Self {
        Self {
            fs: Arc::clone(fs),
            inner: Mutex::new(ProcessInner {
                cwd: fs.root_dir(),
                files: BTreeMap::new(),
                next_fd: 2,
            }),
        }
    }

    pub fn create(&self, path: &str, initial_size: u32) -> bool {
        let inner = self.inner.lock();
        self.fs.create(&inner.cwd, path, initial_size)
    }

    pub fn remove(&self, path: &str) -> bool {
        let inner = self.inner.lock();
        self.fs.remove(&inner.cwd, path)
    }

    /// 打开文件或目录，返回新描述符
    pub fn open(&self, path: &str) -> Option<Fd> {
        let mut inner = self.inner.lock();
        let node = self.fs.open_node(&inner.cwd, path)?;

        let handle = if node.is_dir() {
            Handle::Dir(Dir::open(node))
        } else {
            Handle::File {
                inode: node,
                offset: 0,
            }
        };

        let fd = inner.next_fd;
        inner.next_fd += 1;
        inner.files.insert(fd, handle);
        debug!("open {path:?} -> fd {fd}");
        Some(fd)
    }

    pub fn close(&self, fd: Fd) -> bool {
        let mut inner = self.inner.lock();
        let _guard = self.fs.lock();
        inner.files.remove(&fd).is_some()
    }

    pub fn filesize(&self, fd: Fd) -> Option<u32> {
        let inner = self.inner.lock();
        let _guard = self.fs.lock();
        inner.files.get(&fd).map(|handle| handle.inode().length())
    }

    /// 描述符 0 读控制台；目录不可读
    pub fn read(&self, fd: Fd, buf: &mut [u8]) -> Option<usize> {
        if fd == FD_STDIN {
            return std::io::stdin().read(buf).ok();
        }

        let mut inner = self.inner.lock();
        let _guard = self.fs.lock();
        let Handle::File { inode, offset } = inner.files.get_mut(&fd)? else {
            return None;
        };

        let read = inode.read_at(*offset, buf);
        *offset += read;
        Some(read)
    }

    /// 描述符 1 写控制台；目录不可写
    pub fn write(&self, fd: Fd, buf: &[u8]) -> Option<usize> {
        if fd == FD_STDOUT {
            std::io::stdout().write_all(buf).ok()?;
            return Some(buf.len());
        }

        let mut inner = self.inner.lock();
        let _guard = self.fs.lock();
        let Handle::File { inode, offset } = inner.files.get_mut(&fd)? else {
            return None;
        };

        let written = inode.write_at(*offset, buf);
        *offset += written;
        Some(written)
    }

    /// 把下一次读写的位置移到 `pos`。越过文件末尾的写会先把
    /// 文件增长过去，中间是零。
    pub fn seek(&self, fd: Fd, pos: usize) -> bool {
        let mut inner = self.inner.lock();
        let _guard = self.fs.lock();
        match inner.files.get_mut(&fd) {
            Some(Handle::File { offset, .. }) => {
                *offset = pos;
                true
            }
            _ => false,
        }
    }

    pub fn tell(&self, fd: Fd) -> Option<usize> {
        let inner = self.inner.lock();
        let _guard = self.fs.lock();
        match inner.files.get(&fd) {
            Some(Handle::File { offset, .. }) => Some(*offset),
            _ => None,
        }
    }

    /// 只改本进程的工作目录，不取文件系统入口锁
    pub fn chdir(&self, path: &str) -> bool {
        let mut inner = self.inner.lock();
        match self.fs.resolve_dir(&inner.cwd, path) {
            Some(dir) => {
                // 旧工作目录随赋值关闭
                inner.cwd = dir;
                true
            }
            None => false,
        }
    }

    pub fn mkdir(&self, path: &str) -> bool {
        let inner = self.inner.lock();
        self.fs.mkdir(&inner.cwd, path)
    }

    /// 读出目录的下一项名字；`.` 与 `..` 不会出现
    pub fn readdir(&self, fd: Fd) -> Option<String> {
        let mut inner = self.inner.lock();
        match inner.files.get_mut(&fd)? {
            Handle::Dir(dir) => dir.readdir(),
            Handle::File { .. } => None,
        }
    }

    pub fn isdir(&self, fd: Fd) -> Option<bool> {
        let inner = self.inner.lock();
        inner.files.get(&fd).map(|handle| handle.inode().is_dir())
    }

    pub fn inumber(&self, fd: Fd) -> Option<u32> {
        let inner = self.inner.lock();
        inner.files.get(&fd).map(|handle| handle.inode().inumber())
    }

    /// 当前工作目录的 inode 号
    pub fn cwd_inumber(&self) -> u32 {
        self.inner.lock().cwd.inode().inumber()
    }

    pub fn stat(&self, fd: Fd) -> Option<Stat> {
        let inner = self.inner.lock();
        let inode = inner.files.get(&fd)?.inode();
        // 长度与扇区数取自同一次加锁，并发增长下不会各取一半
        let (size, blocks) = inode.snapshot();
        Some(Stat {
            kind: if inode.is_dir() {
                StatKind::DIR
            } else {
                StatKind::FILE
            },
            inode: inode.inumber(),
            size,
            blocks,
        })
    }
}
