use std::sync::{Arc, Mutex};

use crate::{
    buffer::{write_guard, BufferManager, PinMode},
    common::{PageId, Rid, INVALID_PAGE_ID},
    page::{dir_page::DirPage, heap_page::HeapPage},
};

// Iterates records in directory order, then slot order. At most one page
// is pinned at a time; the records of a data page are copied out while it
// is pinned and handed out afterwards.
pub struct HeapScan {
    buffer_manager: Arc<Mutex<BufferManager>>,
    next_dir_id: Option<PageId>,
    data_pages: Vec<PageId>,
    page_index: usize,
    records: Vec<(Rid, Vec<u8>)>,
    record_index: usize,
}

impl HeapScan {
    pub(crate) fn new(buffer_manager: Arc<Mutex<BufferManager>>, head_id: PageId) -> Self {
        Self {
            buffer_manager,
            next_dir_id: Some(head_id),
            data_pages: Vec::new(),
            page_index: 0,
            records: Vec::new(),
            record_index: 0,
        }
    }

    fn load_data_page(&mut self, page_id: PageId) -> Option<()> {
        let mut bm = self.buffer_manager.lock().ok()?;
        let page = bm.pin_page(page_id, PinMode::DiskIo).ok()?;
        let records = write_guard(&page).ok().map(|mut data| {
            HeapPage::new(&mut data)
                .records()
                .into_iter()
                .map(|(slot, bytes)| (Rid::new(page_id, slot), bytes))
                .collect::<Vec<_>>()
        });
        bm.unpin_page(page_id, false).ok()?;
        self.records = records?;
        self.record_index = 0;
        Some(())
    }

    fn load_dir_page(&mut self, dir_id: PageId) -> Option<()> {
        let mut bm = self.buffer_manager.lock().ok()?;
        let page = bm.pin_page(dir_id, PinMode::DiskIo).ok()?;
        let loaded = write_guard(&page).ok().map(|mut data| {
            let dir = DirPage::new(&mut data);
            let data_pages = (0..dir.entry_count())
                .map(|index| dir.entry_page_id(index))
                .collect::<Vec<_>>();
            (data_pages, dir.next_page())
        });
        bm.unpin_page(dir_id, false).ok()?;
        let (data_pages, next) = loaded?;
        self.data_pages = data_pages;
        self.page_index = 0;
        self.next_dir_id = (next != INVALID_PAGE_ID).then_some(next);
        Some(())
    }
}

impl Iterator for HeapScan {
    type Item = (Rid, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.record_index < self.records.len() {
                let item = self.records[self.record_index].clone();
                self.record_index += 1;
                return Some(item);
            }
            if self.page_index < self.data_pages.len() {
                let page_id = self.data_pages[self.page_index];
                self.page_index += 1;
                self.load_data_page(page_id)?;
                continue;
            }
            let dir_id = self.next_dir_id?;
            self.load_dir_page(dir_id)?;
        }
    }
}
