use std::sync::{Arc, Mutex};

use anyhow::Result;
use tempfile::TempDir;

use crate::{buffer::BufferManager, disk::DiskManager};

pub fn setup_pool(num_frames: usize) -> Result<(TempDir, Arc<Mutex<BufferManager>>)> {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir()?;
    let data_file_path = dir.path().join("heap.db");
    let disk_manager = DiskManager::new(data_file_path.to_str().unwrap(), 256)?;
    let buffer_manager = Arc::new(Mutex::new(BufferManager::new(disk_manager, num_frames)));
    Ok((dir, buffer_manager))
}
