#![allow(dead_code)]

use std::sync::Arc;

use granite::buffer_pool::BufferPoolManager;
use granite::disk::DiskManager;
use granite::wal::LogManager;
use tempfile::TempDir;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn disk(dir: &TempDir) -> Arc<DiskManager> {
    Arc::new(DiskManager::open(dir.path().join("test.db"), dir.path().join("test.log")).unwrap())
}

pub fn buffer_pool(dir: &TempDir, size: usize) -> Arc<BufferPoolManager> {
    Arc::new(BufferPoolManager::new(size, disk(dir), None))
}

pub fn logged_stack(
    dir: &TempDir,
    pool_size: usize,
) -> (Arc<DiskManager>, Arc<LogManager>, Arc<BufferPoolManager>) {
    let disk = disk(dir);
    let log = Arc::new(LogManager::new(Arc::clone(&disk)));
    let bpm = Arc::new(BufferPoolManager::new(
        pool_size,
        Arc::clone(&disk),
        Some(Arc::clone(&log)),
    ));
    (disk, log, bpm)
}
