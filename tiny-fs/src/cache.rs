//! # 扇区缓存层
//!
//! 设备读写速度慢于内存读写速度，因此所有对块设备的访问都经过
//! 一个固定容量的写回缓存：脏扇区只在淘汰、显式刷写或周期性
//! 刷写时才落盘。
//!
//! 缓存行各带一把锁，行锁在设备I/O期间持续持有；除淘汰扫描中
//! 短暂地同时持有候选行与当前行外，任何任务同一时刻至多持有一把
//! 行锁，因此不会死锁。
//!
//! 缓存自带两个后台任务：
//! - `flusher`：每 5000ms 刷写一次全部脏行；
//! - `read-ahead`：消费预读队列，把顺序下一扇区提前装入缓存。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use block_dev::{BlockDevice, SECTOR_SIZE};
use log::trace;

use crate::DataSector;

/// 缓存行数，不会动态增长
pub const CACHE_SIZE: usize = 64;
/// 预读队列的容量
pub const READ_AHEAD_BUFFER_SIZE: usize = 64;
/// 周期性刷写的间隔
const FLUSH_INTERVAL: Duration = Duration::from_millis(5000);

/// 单个缓存行。
///
/// `valid == false` 时 `dirty` 必为假，`data` 无意义；
/// `dirty == true` 时 `data` 是该扇区的权威副本，设备上的是旧值。
struct CacheLine {
    valid: bool,
    dirty: bool,
    device: Option<Arc<dyn BlockDevice>>,
    sector: u32,
    /// 最近一次访问的单调计数，LRU 淘汰的键
    last_used: u64,
    data: DataSector,
}

impl CacheLine {
    fn empty() -> Self {
        Self {
            valid: false,
            dirty: false,
            device: None,
            sector: 0,
            last_used: 0,
            data: [0; SECTOR_SIZE],
        }
    }

    fn matches(&self, device: &Arc<dyn BlockDevice>, sector: u32) -> bool {
        self.valid
            && self.sector == sector
            && self
                .device
                .as_ref()
                .is_some_and(|held| Arc::ptr_eq(held, device))
    }
}

/// 预读请求的有界缓冲区。
///
/// 生产者是每次缓存读（投递 `sector + 1`），消费者是 `read-ahead`
/// 任务。按后进先出弹出。
struct ReadAheadBuffer {
    pending: Mutex<Vec<(Arc<dyn BlockDevice>, u32)>>,
    not_full: Condvar,
    not_empty: Condvar,
}

/// 写回式扇区缓存，索引节点层与目录层的全部设备流量都由它中转。
pub struct SectorCache {
    lines: Vec<Mutex<CacheLine>>,
    tick: AtomicU64,
    read_ahead: ReadAheadBuffer,
}

impl SectorCache {
    /// 建立缓存并启动两个后台任务。任务持有缓存的引用，
    /// 与进程同寿命，不可取消。
    pub fn new() -> Arc<Self> {
        let cache = Arc::new(Self {
            lines: (0..CACHE_SIZE).map(|_| Mutex::new(CacheLine::empty())).collect(),
            tick: AtomicU64::new(0),
            read_ahead: ReadAheadBuffer {
                pending: Mutex::new(Vec::with_capacity(READ_AHEAD_BUFFER_SIZE)),
                not_full: Condvar::new(),
                not_empty: Condvar::new(),
            },
        });

        let worker = Arc::clone(&cache);
        thread::Builder::new()
            .name("flusher".into())
            .spawn(move || loop {
                worker.flush();
                thread::sleep(FLUSH_INTERVAL);
            })
            .expect("failed to spawn cache flusher");

        let worker = Arc::clone(&cache);
        thread::Builder::new()
            .name("read-ahead".into())
            .spawn(move || worker.run_read_ahead())
            .expect("failed to spawn read-ahead worker");

        cache
    }

    /// 把扇区读入 `buf`，并投递对 `sector + 1` 的预读。
    pub fn read(&self, device: &Arc<dyn BlockDevice>, sector: u32, buf: &mut [u8]) {
        assert_eq!(buf.len(), SECTOR_SIZE);

        let mut line = match self.find(device, sector) {
            Some(line) => line,
            None => self.install(device, sector),
        };
        buf.copy_from_slice(&line.data);
        line.last_used = self.touch();
        drop(line);

        self.put_read_ahead(device, sector + 1);
    }

    /// 使缓存成为该扇区的权威副本并标脏；不发生设备写。
    pub fn write(&self, device: &Arc<dyn BlockDevice>, sector: u32, buf: &[u8]) {
        assert_eq!(buf.len(), SECTOR_SIZE);

        let mut line = match self.find(device, sector) {
            Some(line) => line,
            None => {
                // 写未命中不读设备：整行内容即将被覆盖
                let mut line = self.choose_evict();
                line.device = Some(Arc::clone(device));
                line.sector = sector;
                line
            }
        };
        line.data.copy_from_slice(buf);
        line.dirty = true;
        line.last_used = self.touch();
    }

    /// 把所有脏行写回设备。返回时，刷写请求之前完成的写都已落盘。
    pub fn flush(&self) {
        for line in &self.lines {
            let mut line = line.lock().unwrap();
            debug_assert!(line.valid || !line.dirty);
            if line.dirty {
                let device = line.device.clone().unwrap();
                device.write_sector(line.sector, &line.data);
                line.dirty = false;
            }
        }
    }

    fn touch(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    /// 在全部缓存行中定位扇区。命中时返回仍然锁住的行，由调用者释放；
    /// 不命中返回空。
    fn find(&self, device: &Arc<dyn BlockDevice>, sector: u32) -> Option<MutexGuard<'_, CacheLine>> {
        for line in &self.lines {
            let guard = line.lock().unwrap();
            if guard.matches(device, sector) {
                return Some(guard);
            }
        }
        None
    }

    /// 选出一个可复用的行并锁住返回。
    ///
    /// 优先取无效行；否则取 `last_used` 最小者。被选中的脏行先在
    /// 持锁状态下写回原扇区。返回的行 `valid == true`、`dirty == false`，
    /// 身份字段等待调用者覆盖。
    fn choose_evict(&self) -> MutexGuard<'_, CacheLine> {
        let mut victim: Option<MutexGuard<'_, CacheLine>> = None;

        for line in &self.lines {
            let guard = line.lock().unwrap();
            if !guard.valid {
                victim = Some(guard);
                break;
            }
            match &victim {
                // 落选的行随 guard 一起解锁
                Some(held) if held.last_used <= guard.last_used => {}
                _ => victim = Some(guard),
            }
        }

        // CACHE_SIZE > 0，扫描必有结果
        let mut victim = victim.unwrap();
        if victim.dirty {
            trace!(
                "cache: write back sector {} before reuse",
                victim.sector
            );
            let device = victim.device.clone().unwrap();
            device.write_sector(victim.sector, &victim.data);
        }
        victim.valid = true;
        victim.dirty = false;
        victim
    }

    /// 未命中路径：淘汰一行、改写身份、从设备装入。
    fn install(&self, device: &Arc<dyn BlockDevice>, sector: u32) -> MutexGuard<'_, CacheLine> {
        let mut line = self.choose_evict();
        line.device = Some(Arc::clone(device));
        line.sector = sector;
        device.read_sector(sector, &mut line.data);
        line
    }

    /// 预读的生产者。队列满时阻塞等待。
    fn put_read_ahead(&self, device: &Arc<dyn BlockDevice>, sector: u32) {
        let mut pending = self.read_ahead.pending.lock().unwrap();
        while pending.len() == READ_AHEAD_BUFFER_SIZE {
            pending = self.read_ahead.not_full.wait(pending).unwrap();
        }
        pending.push((Arc::clone(device), sector));
        self.read_ahead.not_empty.notify_one();
    }

    /// 预读的消费者，后台任务主体。
    ///
    /// 预读只是优化：越界的请求直接丢弃，已缓存的扇区什么也不发生。
    fn run_read_ahead(&self) {
        loop {
            let mut pending = self.read_ahead.pending.lock().unwrap();
            while pending.is_empty() {
                pending = self.read_ahead.not_empty.wait(pending).unwrap();
            }
            let (device, sector) = pending.pop().unwrap();

            if sector < device.sector_count() {
                trace!("read-ahead: sector {sector}");
                match self.find(&device, sector) {
                    // 已缓存，无事发生
                    Some(line) => drop(line),
                    None => {
                        let mut line = self.install(&device, sector);
                        line.last_used = self.touch();
                    }
                }
            }

            self.read_ahead.not_full.notify_one();
            drop(pending);
        }
    }
}
