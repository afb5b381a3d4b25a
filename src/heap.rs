use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, warn};

use crate::{
    buffer::{write_guard, BufferManager, PageRef, PinMode},
    common::{PageId, Rid, INVALID_PAGE_ID},
    errors::{Result, StorageError},
    page::{
        self,
        dir_page::{DirPage, MAX_ENTRIES},
        heap_page::{HeapPage, MAX_RECORD_SIZE, SLOT_SIZE},
    },
};

pub mod scan;

use self::scan::HeapScan;

pub struct HeapFile {
    name: Option<String>,
    is_temp: bool,
    head_id: PageId,
    buffer_manager: Arc<Mutex<BufferManager>>,
    deleted: bool,
}

fn lock(buffer_manager: &Arc<Mutex<BufferManager>>) -> Result<MutexGuard<'_, BufferManager>> {
    buffer_manager
        .lock()
        .map_err(|_| StorageError::Internal("buffer manager lock poisoned".to_string()))
}

impl HeapFile {
    // opens the heap file registered under `name`, creating it on first use
    pub fn open(buffer_manager: Arc<Mutex<BufferManager>>, name: &str) -> Result<Self> {
        let head_id = {
            let mut bm = lock(&buffer_manager)?;
            match bm.disk().get_file_entry(name) {
                Some(head_id) => head_id,
                None => {
                    let head_id = Self::create_empty(&mut bm)?;
                    bm.disk_mut().add_file_entry(name, head_id)?;
                    head_id
                }
            }
        };
        Ok(Self {
            name: Some(name.to_string()),
            is_temp: false,
            head_id,
            buffer_manager,
            deleted: false,
        })
    }

    // an anonymous heap file, deleted when the handle drops
    pub fn temp(buffer_manager: Arc<Mutex<BufferManager>>) -> Result<Self> {
        let head_id = {
            let mut bm = lock(&buffer_manager)?;
            Self::create_empty(&mut bm)?
        };
        Ok(Self {
            name: None,
            is_temp: true,
            head_id,
            buffer_manager,
            deleted: false,
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn insert_record(&self, record: &[u8]) -> Result<Rid> {
        if record.len() > MAX_RECORD_SIZE {
            return Err(StorageError::InvalidArgument(format!(
                "record of {} bytes exceeds the page capacity of {}",
                record.len(),
                MAX_RECORD_SIZE
            )));
        }
        let mut bm = lock(&self.buffer_manager)?;
        let page_id = self.avail_page(&mut bm, record.len())?;
        let page = bm.pin_page(page_id, PinMode::DiskIo)?;
        let inserted = {
            let mut data = write_guard(&page)?;
            let mut heap_page = HeapPage::new(&mut data);
            heap_page
                .insert_record(record)
                .map(|slot| (slot, heap_page.free_space()))
        };
        let (slot, free_space) = match inserted {
            Ok(inserted) => inserted,
            Err(err) => {
                bm.unpin_page(page_id, false)?;
                return Err(err);
            }
        };
        bm.unpin_page(page_id, true)?;
        self.update_dir_entry(&mut bm, page_id, 1, free_space)?;
        Ok(Rid::new(page_id, slot))
    }

    pub fn select_record(&self, rid: Rid) -> Result<Vec<u8>> {
        let mut bm = lock(&self.buffer_manager)?;
        let page = bm.pin_page(rid.page_id, PinMode::DiskIo)?;
        let selected = {
            let mut data = write_guard(&page)?;
            HeapPage::new(&mut data).select_record(rid.slot)
        };
        bm.unpin_page(rid.page_id, false)?;
        selected
    }

    pub fn update_record(&self, rid: Rid, record: &[u8]) -> Result<()> {
        let mut bm = lock(&self.buffer_manager)?;
        let page = bm.pin_page(rid.page_id, PinMode::DiskIo)?;
        let updated = {
            let mut data = write_guard(&page)?;
            HeapPage::new(&mut data).update_record(rid.slot, record)
        };
        bm.unpin_page(rid.page_id, updated.is_ok())?;
        updated
    }

    pub fn delete_record(&self, rid: Rid) -> Result<()> {
        let mut bm = lock(&self.buffer_manager)?;
        let page = bm.pin_page(rid.page_id, PinMode::DiskIo)?;
        let deleted = {
            let mut data = write_guard(&page)?;
            let mut heap_page = HeapPage::new(&mut data);
            heap_page
                .delete_record(rid.slot)
                .map(|()| heap_page.free_space())
        };
        let free_space = match deleted {
            Ok(free_space) => free_space,
            Err(err) => {
                bm.unpin_page(rid.page_id, false)?;
                return Err(err);
            }
        };
        bm.unpin_page(rid.page_id, true)?;
        self.update_dir_entry(&mut bm, rid.page_id, -1, free_space)
    }

    pub fn rec_count(&self) -> Result<usize> {
        let mut bm = lock(&self.buffer_manager)?;
        let mut count = 0i64;
        let mut dir_id = self.head_id;
        while dir_id != INVALID_PAGE_ID {
            let page = bm.pin_page(dir_id, PinMode::DiskIo)?;
            let next = {
                let mut data = write_guard(&page)?;
                let dir = DirPage::new(&mut data);
                for index in 0..dir.entry_count() {
                    count += dir.entry_rec_cnt(index) as i64;
                }
                dir.next_page()
            };
            bm.unpin_page(dir_id, false)?;
            dir_id = next;
        }
        Ok(count as usize)
    }

    pub fn open_scan(&self) -> HeapScan {
        HeapScan::new(Arc::clone(&self.buffer_manager), self.head_id)
    }

    // frees every page of the file and drops its name entry
    pub fn delete(mut self) -> Result<()> {
        self.deleted = true;
        let buffer_manager = Arc::clone(&self.buffer_manager);
        let mut bm = lock(&buffer_manager)?;
        self.delete_chain(&mut bm)
    }

    fn create_empty(bm: &mut BufferManager) -> Result<PageId> {
        let head_id = bm.disk_mut().allocate_page()?;
        let mut image = page::empty_page();
        DirPage::new(&mut image).init(head_id);
        bm.pin_page(head_id, PinMode::Memcpy(&image))?;
        bm.unpin_page(head_id, true)?;
        debug!("created heap file head at page {}", head_id.0);
        Ok(head_id)
    }

    // first data page with room for a record of `rec_len` bytes plus its slot
    fn avail_page(&self, bm: &mut BufferManager, rec_len: usize) -> Result<PageId> {
        let mut dir_id = self.head_id;
        while dir_id != INVALID_PAGE_ID {
            let page = bm.pin_page(dir_id, PinMode::DiskIo)?;
            let (hit, next) = {
                let mut data = write_guard(&page)?;
                let dir = DirPage::new(&mut data);
                let hit = (0..dir.entry_count())
                    .find(|&index| {
                        dir.entry_free_cnt(index) as i64 >= (rec_len + SLOT_SIZE) as i64
                    })
                    .map(|index| dir.entry_page_id(index));
                (hit, dir.next_page())
            };
            bm.unpin_page(dir_id, false)?;
            if let Some(page_id) = hit {
                return Ok(page_id);
            }
            dir_id = next;
        }
        self.insert_page(bm)
    }

    // on a hit the directory page stays pinned for the caller to modify
    fn find_dir_entry(
        &self,
        bm: &mut BufferManager,
        page_id: PageId,
    ) -> Result<(PageId, PageRef, usize)> {
        let mut dir_id = self.head_id;
        loop {
            let page = bm.pin_page(dir_id, PinMode::DiskIo)?;
            let (index, next) = {
                let mut data = write_guard(&page)?;
                let dir = DirPage::new(&mut data);
                let index = (0..dir.entry_count()).find(|&index| dir.entry_page_id(index) == page_id);
                (index, dir.next_page())
            };
            if let Some(index) = index {
                return Ok((dir_id, page, index));
            }
            bm.unpin_page(dir_id, false)?;
            if next == INVALID_PAGE_ID {
                return Err(StorageError::Internal(format!(
                    "no directory entry for data page {}",
                    page_id.0
                )));
            }
            dir_id = next;
        }
    }

    fn update_dir_entry(
        &self,
        bm: &mut BufferManager,
        page_id: PageId,
        delta_rec: i16,
        free_space: u16,
    ) -> Result<()> {
        let (dir_id, page, index) = self.find_dir_entry(bm, page_id)?;
        let (rec_cnt, prev, next, entry_cnt) = {
            let mut data = write_guard(&page)?;
            let mut dir = DirPage::new(&mut data);
            let rec_cnt = dir.entry_rec_cnt(index) + delta_rec;
            dir.set_entry_rec_cnt(index, rec_cnt);
            dir.set_entry_free_cnt(index, free_space as i16);
            (rec_cnt, dir.prev_page(), dir.next_page(), dir.entry_count())
        };
        bm.unpin_page(dir_id, true)?;
        if rec_cnt < 1 {
            self.delete_page(bm, page_id, dir_id, index, prev, next, entry_cnt)?;
        }
        Ok(())
    }

    // inserts a fresh data page, growing the directory chain if every
    // directory page is full
    fn insert_page(&self, bm: &mut BufferManager) -> Result<PageId> {
        let mut dir_id = self.head_id;
        let mut page = bm.pin_page(dir_id, PinMode::DiskIo)?;
        loop {
            let (entry_cnt, next) = {
                let mut data = write_guard(&page)?;
                let dir = DirPage::new(&mut data);
                (dir.entry_count(), dir.next_page())
            };

            if entry_cnt < MAX_ENTRIES {
                let page_id = match bm.disk_mut().allocate_page() {
                    Ok(page_id) => page_id,
                    Err(err) => {
                        bm.unpin_page(dir_id, false)?;
                        return Err(err);
                    }
                };
                let mut image = page::empty_page();
                let mut heap_page = HeapPage::new(&mut image);
                heap_page.init(page_id);
                let free_space = heap_page.free_space();
                {
                    let mut data = write_guard(&page)?;
                    DirPage::new(&mut data).append_entry(page_id, 0, free_space as i16);
                }
                bm.unpin_page(dir_id, true)?;
                bm.pin_page(page_id, PinMode::Memcpy(&image))?;
                bm.unpin_page(page_id, true)?;
                debug!("added data page {} to directory page {}", page_id.0, dir_id.0);
                return Ok(page_id);
            }

            if next != INVALID_PAGE_ID {
                bm.unpin_page(dir_id, false)?;
                page = bm.pin_page(next, PinMode::DiskIo)?;
                dir_id = next;
            } else {
                let new_dir_id = match bm.disk_mut().allocate_page() {
                    Ok(new_dir_id) => new_dir_id,
                    Err(err) => {
                        bm.unpin_page(dir_id, false)?;
                        return Err(err);
                    }
                };
                {
                    let mut data = write_guard(&page)?;
                    DirPage::new(&mut data).set_next_page(new_dir_id);
                }
                bm.unpin_page(dir_id, true)?;
                let mut image = page::empty_page();
                let mut dir = DirPage::new(&mut image);
                dir.init(new_dir_id);
                dir.set_prev_page(dir_id);
                page = bm.pin_page(new_dir_id, PinMode::Memcpy(&image))?;
                debug!("added directory page {} to the chain", new_dir_id.0);
                dir_id = new_dir_id;
            }
        }
    }

    // removes the data page and its directory entry; an emptied directory
    // page is unlinked from the chain unless it is the head
    fn delete_page(
        &self,
        bm: &mut BufferManager,
        page_id: PageId,
        dir_id: PageId,
        index: usize,
        prev: PageId,
        next: PageId,
        entry_cnt: usize,
    ) -> Result<()> {
        if entry_cnt >= 2 || dir_id == self.head_id {
            let page = bm.pin_page(dir_id, PinMode::DiskIo)?;
            {
                let mut data = write_guard(&page)?;
                DirPage::new(&mut data).compact(index);
            }
            bm.unpin_page(dir_id, true)?;
        } else {
            if prev != INVALID_PAGE_ID {
                let page = bm.pin_page(prev, PinMode::DiskIo)?;
                {
                    let mut data = write_guard(&page)?;
                    DirPage::new(&mut data).set_next_page(next);
                }
                bm.unpin_page(prev, true)?;
            }
            if next != INVALID_PAGE_ID {
                let page = bm.pin_page(next, PinMode::DiskIo)?;
                {
                    let mut data = write_guard(&page)?;
                    DirPage::new(&mut data).set_prev_page(prev);
                }
                bm.unpin_page(next, true)?;
            }
            debug!("freeing empty directory page {}", dir_id.0);
            bm.free_page(dir_id)?;
        }
        debug!("freeing empty data page {}", page_id.0);
        bm.free_page(page_id)
    }

    fn delete_chain(&self, bm: &mut BufferManager) -> Result<()> {
        let mut dir_id = self.head_id;
        while dir_id != INVALID_PAGE_ID {
            let page = bm.pin_page(dir_id, PinMode::DiskIo)?;
            let (data_pages, next) = {
                let mut data = write_guard(&page)?;
                let mut dir = DirPage::new(&mut data);
                let data_pages = (0..dir.entry_count())
                    .map(|index| dir.entry_page_id(index))
                    .collect::<Vec<_>>();
                let next = dir.next_page();
                dir.clear_entries();
                (data_pages, next)
            };
            bm.unpin_page(dir_id, true)?;
            for page_id in data_pages {
                bm.free_page(page_id)?;
            }
            bm.free_page(dir_id)?;
            dir_id = next;
        }
        if !self.is_temp {
            if let Some(name) = &self.name {
                bm.disk_mut().delete_file_entry(name)?;
            }
        }
        Ok(())
    }
}

impl Drop for HeapFile {
    fn drop(&mut self) {
        if self.is_temp && !self.deleted {
            self.deleted = true;
            let buffer_manager = Arc::clone(&self.buffer_manager);
            let lock_result = lock(&buffer_manager);
            if let Ok(mut bm) = lock_result {
                if let Err(err) = self.delete_chain(&mut bm) {
                    warn!("failed to delete temporary heap file: {}", err);
                }
            }
        }
    }
}
