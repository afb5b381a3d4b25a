use std::{
    collections::HashMap,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use log::debug;

use crate::{
    common::{PageId, INVALID_PAGE_ID, PAGE_SIZE},
    disk::DiskManager,
    errors::{Result, StorageError},
    page,
};

use self::replacer::ClockReplacer;

mod replacer;

pub type PageRef = Arc<RwLock<Box<[u8]>>>;

pub(crate) fn read_guard(page: &PageRef) -> Result<RwLockReadGuard<'_, Box<[u8]>>> {
    page.read()
        .map_err(|_| StorageError::Internal("page latch poisoned".to_string()))
}

pub(crate) fn write_guard(page: &PageRef) -> Result<RwLockWriteGuard<'_, Box<[u8]>>> {
    page.write()
        .map_err(|_| StorageError::Internal("page latch poisoned".to_string()))
}

#[derive(Clone, Copy)]
pub enum PinMode<'a> {
    DiskIo,
    Memcpy(&'a [u8]),
    Noop,
}

pub struct Frame {
    page: PageRef,
    page_id: PageId,
    pin_count: u32,
    dirty: bool,
    referenced: bool,
    valid: bool,
}

impl Frame {
    fn new() -> Self {
        Self {
            page: Arc::new(RwLock::new(page::empty_page())),
            page_id: INVALID_PAGE_ID,
            pin_count: 0,
            dirty: false,
            referenced: false,
            valid: false,
        }
    }
    fn add_pin_count(&mut self) {
        self.pin_count += 1;
    }
    fn sub_pin_count(&mut self) {
        self.pin_count -= 1;
    }
    fn is_pinned(&self) -> bool {
        self.pin_count > 0
    }
    fn copy_page(&self, data: &[u8]) -> Result<()> {
        assert!(data.len() == PAGE_SIZE);
        let mut page = write_guard(&self.page)?;
        page.copy_from_slice(data);
        Ok(())
    }
}

pub struct BufferManager {
    disk_manager: DiskManager,
    frames: Vec<Frame>,
    page_table: HashMap<PageId, usize>,
    replacer: ClockReplacer,
}

impl BufferManager {
    pub fn new(disk_manager: DiskManager, num_frames: usize) -> Self {
        assert!(num_frames > 0);
        Self {
            disk_manager,
            frames: (0..num_frames).map(|_| Frame::new()).collect(),
            page_table: HashMap::new(),
            replacer: ClockReplacer::new(),
        }
    }

    pub fn pin_page(&mut self, page_id: PageId, mode: PinMode) -> Result<PageRef> {
        if page_id == INVALID_PAGE_ID {
            return Err(StorageError::InvalidArgument(
                "cannot pin the invalid page id".to_string(),
            ));
        }
        if let Some(&frame_id) = self.page_table.get(&page_id) {
            if let PinMode::Memcpy(_) = mode {
                return Err(StorageError::InvalidArgument(format!(
                    "memcpy pin would clobber resident page {}",
                    page_id.0
                )));
            }
            let frame = &mut self.frames[frame_id];
            frame.add_pin_count();
            return Ok(frame.page.clone());
        }

        let frame_id = self
            .replacer
            .pick_victim(&mut self.frames)
            .ok_or(StorageError::PoolExhausted)?;

        // the victim goes to disk before its frame is reused
        if self.frames[frame_id].valid {
            let old_page_id = self.frames[frame_id].page_id;
            if self.frames[frame_id].dirty {
                debug!("evicting dirty page {} from frame {}", old_page_id.0, frame_id);
                let data = read_guard(&self.frames[frame_id].page)?;
                self.disk_manager.write_page(old_page_id, &data)?;
            }
            self.page_table.remove(&old_page_id);
            self.frames[frame_id].valid = false;
        }

        match mode {
            PinMode::DiskIo => {
                let mut data = write_guard(&self.frames[frame_id].page)?;
                self.disk_manager.read_page(page_id, &mut data)?;
            }
            PinMode::Memcpy(data) => self.frames[frame_id].copy_page(data)?,
            PinMode::Noop => {}
        }

        let frame = &mut self.frames[frame_id];
        frame.page_id = page_id;
        frame.dirty = false;
        frame.valid = true;
        frame.referenced = true;
        frame.pin_count = 1;
        self.page_table.insert(page_id, frame_id);
        Ok(self.frames[frame_id].page.clone())
    }

    pub fn unpin_page(&mut self, page_id: PageId, is_dirty: bool) -> Result<()> {
        let frame_id = *self.page_table.get(&page_id).ok_or_else(|| {
            StorageError::InvalidArgument(format!("page {} is not resident", page_id.0))
        })?;
        let frame = &mut self.frames[frame_id];
        if !frame.is_pinned() {
            return Err(StorageError::InvalidArgument(format!(
                "page {} is not pinned",
                page_id.0
            )));
        }
        frame.sub_pin_count();
        if is_dirty {
            frame.dirty = true;
        }
        Ok(())
    }

    pub fn new_page(&mut self, run_size: usize) -> Result<(PageId, PageRef)> {
        let first = self.disk_manager.allocate_run(run_size)?;
        let data = page::empty_page();
        match self.pin_page(first, PinMode::Memcpy(&data)) {
            Ok(page) => Ok((first, page)),
            Err(err) => {
                // do not leak the run when the pin fails
                let _ = self.disk_manager.deallocate_run(first, run_size);
                Err(err)
            }
        }
    }

    pub fn free_page(&mut self, page_id: PageId) -> Result<()> {
        if let Some(&frame_id) = self.page_table.get(&page_id) {
            let frame = &mut self.frames[frame_id];
            if frame.is_pinned() {
                return Err(StorageError::InvalidArgument(format!(
                    "page {} is pinned",
                    page_id.0
                )));
            }
            frame.valid = false;
            frame.dirty = false;
            self.page_table.remove(&page_id);
        }
        self.disk_manager.deallocate_page(page_id)
    }

    pub fn flush_page(&mut self, page_id: PageId) -> Result<()> {
        let frame_id = *self.page_table.get(&page_id).ok_or_else(|| {
            StorageError::InvalidArgument(format!("page {} is not resident", page_id.0))
        })?;
        if self.frames[frame_id].valid && self.frames[frame_id].dirty {
            {
                let data = read_guard(&self.frames[frame_id].page)?;
                self.disk_manager.write_page(page_id, &data)?;
            }
            self.frames[frame_id].dirty = false;
        }
        Ok(())
    }

    pub fn flush_all_frames(&mut self) -> Result<()> {
        let page_ids = self.page_table.keys().cloned().collect::<Vec<_>>();
        for page_id in page_ids {
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn num_unpinned(&self) -> usize {
        self.frames.iter().filter(|frame| !frame.is_pinned()).count()
    }

    pub fn disk(&self) -> &DiskManager {
        &self.disk_manager
    }

    pub fn disk_mut(&mut self) -> &mut DiskManager {
        &mut self.disk_manager
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::setup_pool;
    use anyhow::Result;

    #[test]
    fn test_pin_count_errors() -> Result<()> {
        let (_dir, bm) = setup_pool(2)?;
        let mut bm = bm.lock().unwrap();

        let (page_id, _page) = bm.new_page(1)?;
        let image = page::empty_page();
        assert!(matches!(
            bm.pin_page(page_id, PinMode::Memcpy(&image)),
            Err(StorageError::InvalidArgument(_))
        ));
        assert!(matches!(
            bm.free_page(page_id),
            Err(StorageError::InvalidArgument(_))
        ));

        bm.pin_page(page_id, PinMode::DiskIo)?;
        bm.unpin_page(page_id, false)?;
        bm.unpin_page(page_id, false)?;
        assert!(matches!(
            bm.unpin_page(page_id, false),
            Err(StorageError::InvalidArgument(_))
        ));
        assert!(matches!(
            bm.unpin_page(PageId(99), false),
            Err(StorageError::InvalidArgument(_))
        ));
        assert!(matches!(
            bm.flush_page(PageId(99)),
            Err(StorageError::InvalidArgument(_))
        ));

        Ok(())
    }

    #[test]
    fn test_pool_exhaustion_without_leak() -> Result<()> {
        let (_dir, bm) = setup_pool(2)?;
        let mut bm = bm.lock().unwrap();

        bm.new_page(1)?;
        bm.new_page(1)?;
        assert_eq!(bm.num_unpinned(), 0);

        let before = bm.disk().allocated_pages();
        assert!(matches!(bm.new_page(1), Err(StorageError::PoolExhausted)));
        assert_eq!(bm.disk().allocated_pages(), before);

        Ok(())
    }

    #[test]
    fn test_eviction_round_trip() -> Result<()> {
        let (_dir, bm) = setup_pool(1)?;
        let mut bm = bm.lock().unwrap();

        let (page_id1, page1) = bm.new_page(1)?;
        page1.write().unwrap()[0] = 42;
        bm.unpin_page(page_id1, true)?;

        // the second page takes the only frame and forces a write-back
        let (page_id2, _page2) = bm.new_page(1)?;
        bm.unpin_page(page_id2, false)?;

        let page1 = bm.pin_page(page_id1, PinMode::DiskIo)?;
        assert_eq!(page1.read().unwrap()[0], 42);
        bm.unpin_page(page_id1, false)?;
        assert_eq!(bm.num_frames(), 1);
        assert_eq!(bm.num_unpinned(), 1);

        Ok(())
    }

    #[test]
    fn test_free_page() -> Result<()> {
        let (_dir, bm) = setup_pool(2)?;
        let mut bm = bm.lock().unwrap();

        let (page_id, _page) = bm.new_page(1)?;
        bm.unpin_page(page_id, true)?;
        bm.free_page(page_id)?;
        assert_eq!(bm.disk().allocated_pages(), 0);
        assert!(matches!(
            bm.pin_page(page_id, PinMode::DiskIo),
            Err(StorageError::InvalidArgument(_))
        ));

        // freeing a page that is not resident still reaches the disk manager
        let page_id = bm.disk_mut().allocate_page()?;
        bm.free_page(page_id)?;
        assert_eq!(bm.disk().allocated_pages(), 0);

        Ok(())
    }

    #[test]
    fn test_noop_pin() -> Result<()> {
        let (_dir, bm) = setup_pool(1)?;
        let mut bm = bm.lock().unwrap();

        let page_id = bm.disk_mut().allocate_page()?;
        let page = bm.pin_page(page_id, PinMode::Noop)?;
        page.write().unwrap()[..4].copy_from_slice(&[1, 2, 3, 4]);
        bm.unpin_page(page_id, true)?;

        // evict it, then read it back from disk
        let (page_id2, _page2) = bm.new_page(1)?;
        bm.unpin_page(page_id2, false)?;
        let page = bm.pin_page(page_id, PinMode::DiskIo)?;
        assert_eq!(&page.read().unwrap()[..4], &[1, 2, 3, 4]);
        bm.unpin_page(page_id, false)?;

        Ok(())
    }

    #[test]
    fn test_flush_and_restart() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let data_file_path = dir.path().join("data");
        let page_id = {
            let disk_manager = DiskManager::new(data_file_path.to_str().unwrap(), 64)?;
            let mut bm = BufferManager::new(disk_manager, 3);
            let (page_id, page) = bm.new_page(1)?;
            page.write().unwrap()[10] = 7;
            bm.unpin_page(page_id, true)?;
            bm.flush_all_frames()?;
            page_id
        };

        let disk_manager = DiskManager::new(data_file_path.to_str().unwrap(), 64)?;
        let mut bm = BufferManager::new(disk_manager, 3);
        let page = bm.pin_page(page_id, PinMode::DiskIo)?;
        assert_eq!(page.read().unwrap()[10], 7);
        bm.unpin_page(page_id, false)?;

        Ok(())
    }
}
