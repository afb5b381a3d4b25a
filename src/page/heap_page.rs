use crate::{
    common::{PageId, INVALID_PAGE_ID, PAGE_SIZE},
    errors::{Result, StorageError},
};

const SLOT_CNT_OFFSET: usize = 0;
const SLOT_CNT_SIZE: usize = 2;
const USED_PTR_OFFSET: usize = SLOT_CNT_OFFSET + SLOT_CNT_SIZE;
const USED_PTR_SIZE: usize = 2;
const FREE_SPACE_OFFSET: usize = USED_PTR_OFFSET + USED_PTR_SIZE;
const FREE_SPACE_SIZE: usize = 2;
const PAGE_TYPE_OFFSET: usize = FREE_SPACE_OFFSET + FREE_SPACE_SIZE;
const PAGE_TYPE_SIZE: usize = 2;
const PREV_PAGE_OFFSET: usize = PAGE_TYPE_OFFSET + PAGE_TYPE_SIZE;
const PREV_PAGE_SIZE: usize = 4;
const NEXT_PAGE_OFFSET: usize = PREV_PAGE_OFFSET + PREV_PAGE_SIZE;
const NEXT_PAGE_SIZE: usize = 4;
const CUR_PAGE_OFFSET: usize = NEXT_PAGE_OFFSET + NEXT_PAGE_SIZE;
const CUR_PAGE_SIZE: usize = 4;
pub const HEADER_SIZE: usize = SLOT_CNT_SIZE
    + USED_PTR_SIZE
    + FREE_SPACE_SIZE
    + PAGE_TYPE_SIZE
    + PREV_PAGE_SIZE
    + NEXT_PAGE_SIZE
    + CUR_PAGE_SIZE;

const SLOT_LEN_SIZE: usize = 2;
const SLOT_OFFSET_SIZE: usize = 2;
pub const SLOT_SIZE: usize = SLOT_LEN_SIZE + SLOT_OFFSET_SIZE;
pub const MAX_RECORD_SIZE: usize = PAGE_SIZE - HEADER_SIZE - SLOT_SIZE;

pub const DATA_PAGE_TYPE: u16 = 11;

// a deleted slot keeps its position so other record ids stay stable
const EMPTY_SLOT: u16 = u16::MAX;

pub struct HeapPage<'a> {
    data: &'a mut [u8],
}

impl<'a> HeapPage<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        assert!(data.len() == PAGE_SIZE);
        HeapPage { data }
    }

    pub fn init(&mut self, page_id: PageId) {
        self.set_slot_count(0);
        self.set_used_ptr(PAGE_SIZE as u16);
        self.set_free_space((PAGE_SIZE - HEADER_SIZE) as u16);
        self.data[PAGE_TYPE_OFFSET..(PAGE_TYPE_OFFSET + PAGE_TYPE_SIZE)]
            .copy_from_slice(&DATA_PAGE_TYPE.to_le_bytes());
        self.set_prev_page(INVALID_PAGE_ID);
        self.set_next_page(INVALID_PAGE_ID);
        self.set_cur_page(page_id);
    }

    pub fn insert_record(&mut self, record: &[u8]) -> Result<u16> {
        if record.len() > MAX_RECORD_SIZE {
            return Err(StorageError::InvalidArgument(format!(
                "record of {} bytes does not fit on a page",
                record.len()
            )));
        }
        let slot_cnt = self.slot_count();
        let empty = (0..slot_cnt).find(|&i| self.slot_len(i) == EMPTY_SLOT);
        let needed = match empty {
            Some(_) => record.len(),
            None => record.len() + SLOT_SIZE,
        };
        if self.gap() < needed {
            return Err(StorageError::InvalidArgument(format!(
                "no room for a record of {} bytes",
                record.len()
            )));
        }

        let slot = match empty {
            Some(slot) => slot,
            None => {
                self.set_slot_count(slot_cnt + 1);
                slot_cnt
            }
        };
        let used_ptr = self.used_ptr() - record.len() as u16;
        self.data[used_ptr as usize..(used_ptr as usize + record.len())].copy_from_slice(record);
        self.set_used_ptr(used_ptr);
        self.set_slot(slot, record.len() as u16, used_ptr);
        self.set_free_space(self.free_space() - (record.len() + SLOT_SIZE) as u16);
        Ok(slot)
    }

    pub fn select_record(&self, slot: u16) -> Result<Vec<u8>> {
        let (len, offset) = self.check_slot(slot)?;
        Ok(self.data[offset as usize..(offset as usize + len as usize)].to_vec())
    }

    pub fn update_record(&mut self, slot: u16, record: &[u8]) -> Result<()> {
        let (len, offset) = self.check_slot(slot)?;
        if record.len() != len as usize {
            return Err(StorageError::InvalidArgument(format!(
                "record length {} does not match stored length {}",
                record.len(),
                len
            )));
        }
        self.data[offset as usize..(offset as usize + len as usize)].copy_from_slice(record);
        Ok(())
    }

    pub fn delete_record(&mut self, slot: u16) -> Result<()> {
        let (len, offset) = self.check_slot(slot)?;
        let used_ptr = self.used_ptr();

        // close the hole in the record area and fix up the shifted slots
        self.data
            .copy_within(used_ptr as usize..offset as usize, (used_ptr + len) as usize);
        for i in 0..self.slot_count() {
            let other_len = self.slot_len(i);
            let other_offset = self.slot_offset(i);
            if other_len != EMPTY_SLOT && other_offset < offset {
                self.set_slot(i, other_len, other_offset + len);
            }
        }
        self.set_used_ptr(used_ptr + len);
        self.set_slot(slot, EMPTY_SLOT, 0);
        self.set_free_space(self.free_space() + len + SLOT_SIZE as u16);

        let mut slot_cnt = self.slot_count();
        while slot_cnt > 0 && self.slot_len(slot_cnt - 1) == EMPTY_SLOT {
            slot_cnt -= 1;
        }
        self.set_slot_count(slot_cnt);
        Ok(())
    }

    pub fn records(&self) -> Vec<(u16, Vec<u8>)> {
        (0..self.slot_count())
            .filter(|&i| self.slot_len(i) != EMPTY_SLOT)
            .map(|i| {
                let offset = self.slot_offset(i) as usize;
                let len = self.slot_len(i) as usize;
                (i, self.data[offset..(offset + len)].to_vec())
            })
            .collect()
    }

    pub fn free_space(&self) -> u16 {
        let mut bytes = [0u8; 2];
        bytes.copy_from_slice(&self.data[FREE_SPACE_OFFSET..(FREE_SPACE_OFFSET + FREE_SPACE_SIZE)]);
        u16::from_le_bytes(bytes)
    }

    pub fn cur_page(&self) -> PageId {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.data[CUR_PAGE_OFFSET..(CUR_PAGE_OFFSET + CUR_PAGE_SIZE)]);
        PageId(u32::from_le_bytes(bytes))
    }

    pub fn set_cur_page(&mut self, page_id: PageId) {
        self.data[CUR_PAGE_OFFSET..(CUR_PAGE_OFFSET + CUR_PAGE_SIZE)]
            .copy_from_slice(&page_id.0.to_le_bytes());
    }

    pub fn prev_page(&self) -> PageId {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.data[PREV_PAGE_OFFSET..(PREV_PAGE_OFFSET + PREV_PAGE_SIZE)]);
        PageId(u32::from_le_bytes(bytes))
    }

    pub fn set_prev_page(&mut self, page_id: PageId) {
        self.data[PREV_PAGE_OFFSET..(PREV_PAGE_OFFSET + PREV_PAGE_SIZE)]
            .copy_from_slice(&page_id.0.to_le_bytes());
    }

    pub fn next_page(&self) -> PageId {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.data[NEXT_PAGE_OFFSET..(NEXT_PAGE_OFFSET + NEXT_PAGE_SIZE)]);
        PageId(u32::from_le_bytes(bytes))
    }

    pub fn set_next_page(&mut self, page_id: PageId) {
        self.data[NEXT_PAGE_OFFSET..(NEXT_PAGE_OFFSET + NEXT_PAGE_SIZE)]
            .copy_from_slice(&page_id.0.to_le_bytes());
    }

    pub fn slot_count(&self) -> u16 {
        let mut bytes = [0u8; 2];
        bytes.copy_from_slice(&self.data[SLOT_CNT_OFFSET..(SLOT_CNT_OFFSET + SLOT_CNT_SIZE)]);
        u16::from_le_bytes(bytes)
    }

    fn check_slot(&self, slot: u16) -> Result<(u16, u16)> {
        if slot >= self.slot_count() || self.slot_len(slot) == EMPTY_SLOT {
            return Err(StorageError::InvalidArgument(format!(
                "no record in slot {} of page {}",
                slot,
                self.cur_page().0
            )));
        }
        Ok((self.slot_len(slot), self.slot_offset(slot)))
    }

    // contiguous bytes between the slot array and the record area
    fn gap(&self) -> usize {
        self.used_ptr() as usize - HEADER_SIZE - self.slot_count() as usize * SLOT_SIZE
    }

    fn used_ptr(&self) -> u16 {
        let mut bytes = [0u8; 2];
        bytes.copy_from_slice(&self.data[USED_PTR_OFFSET..(USED_PTR_OFFSET + USED_PTR_SIZE)]);
        u16::from_le_bytes(bytes)
    }

    fn set_used_ptr(&mut self, used_ptr: u16) {
        self.data[USED_PTR_OFFSET..(USED_PTR_OFFSET + USED_PTR_SIZE)]
            .copy_from_slice(&used_ptr.to_le_bytes());
    }

    fn set_free_space(&mut self, free_space: u16) {
        self.data[FREE_SPACE_OFFSET..(FREE_SPACE_OFFSET + FREE_SPACE_SIZE)]
            .copy_from_slice(&free_space.to_le_bytes());
    }

    fn set_slot_count(&mut self, slot_cnt: u16) {
        self.data[SLOT_CNT_OFFSET..(SLOT_CNT_OFFSET + SLOT_CNT_SIZE)]
            .copy_from_slice(&slot_cnt.to_le_bytes());
    }

    fn slot_len(&self, slot: u16) -> u16 {
        let offset = HEADER_SIZE + slot as usize * SLOT_SIZE;
        let mut bytes = [0u8; 2];
        bytes.copy_from_slice(&self.data[offset..(offset + SLOT_LEN_SIZE)]);
        u16::from_le_bytes(bytes)
    }

    fn slot_offset(&self, slot: u16) -> u16 {
        let offset = HEADER_SIZE + slot as usize * SLOT_SIZE + SLOT_LEN_SIZE;
        let mut bytes = [0u8; 2];
        bytes.copy_from_slice(&self.data[offset..(offset + SLOT_OFFSET_SIZE)]);
        u16::from_le_bytes(bytes)
    }

    fn set_slot(&mut self, slot: u16, len: u16, record_offset: u16) {
        let offset = HEADER_SIZE + slot as usize * SLOT_SIZE;
        self.data[offset..(offset + SLOT_LEN_SIZE)].copy_from_slice(&len.to_le_bytes());
        self.data[(offset + SLOT_LEN_SIZE)..(offset + SLOT_SIZE)]
            .copy_from_slice(&record_offset.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::empty_page;
    use anyhow::Result;

    fn fresh_page(data: &mut [u8]) -> HeapPage {
        let mut page = HeapPage::new(data);
        page.init(PageId(7));
        page
    }

    #[test]
    fn test_insert_select() -> Result<()> {
        let mut data = empty_page();
        let mut page = fresh_page(&mut data);
        let before = page.free_space();

        let slot1 = page.insert_record(b"hello")?;
        let slot2 = page.insert_record(b"world!")?;
        assert_eq!(page.select_record(slot1)?, b"hello");
        assert_eq!(page.select_record(slot2)?, b"world!");
        assert_eq!(page.free_space(), before - (5 + 4) - (6 + 4));
        assert_eq!(page.cur_page(), PageId(7));

        Ok(())
    }

    #[test]
    fn test_update() -> Result<()> {
        let mut data = empty_page();
        let mut page = fresh_page(&mut data);

        let slot = page.insert_record(b"hello")?;
        page.update_record(slot, b"world")?;
        assert_eq!(page.select_record(slot)?, b"world");
        assert!(matches!(
            page.update_record(slot, b"too long"),
            Err(StorageError::InvalidArgument(_))
        ));
        assert!(matches!(
            page.update_record(9, b"hello"),
            Err(StorageError::InvalidArgument(_))
        ));

        Ok(())
    }

    #[test]
    fn test_delete_compacts() -> Result<()> {
        let mut data = empty_page();
        let mut page = fresh_page(&mut data);
        let before = page.free_space();

        let slot1 = page.insert_record(b"first")?;
        let slot2 = page.insert_record(b"second")?;
        let slot3 = page.insert_record(b"third")?;
        page.delete_record(slot2)?;

        // the survivors keep their slots and contents
        assert_eq!(page.select_record(slot1)?, b"first");
        assert_eq!(page.select_record(slot3)?, b"third");
        assert!(matches!(
            page.select_record(slot2),
            Err(StorageError::InvalidArgument(_))
        ));
        assert_eq!(page.free_space(), before - (5 + 4) - (5 + 4));

        // the empty slot is reused before a new one is added
        let slot4 = page.insert_record(b"fourth")?;
        assert_eq!(slot4, slot2);
        assert_eq!(page.select_record(slot4)?, b"fourth");
        assert_eq!(page.slot_count(), 3);

        Ok(())
    }

    #[test]
    fn test_delete_trims_trailing_slots() -> Result<()> {
        let mut data = empty_page();
        let mut page = fresh_page(&mut data);
        let before = page.free_space();

        let slot1 = page.insert_record(b"first")?;
        let slot2 = page.insert_record(b"second")?;
        page.delete_record(slot2)?;
        assert_eq!(page.slot_count(), 1);
        page.delete_record(slot1)?;
        assert_eq!(page.slot_count(), 0);
        assert_eq!(page.free_space(), before);

        Ok(())
    }

    #[test]
    fn test_record_too_large() {
        let mut data = empty_page();
        let mut page = fresh_page(&mut data);

        let record = vec![0u8; MAX_RECORD_SIZE + 1];
        assert!(matches!(
            page.insert_record(&record),
            Err(StorageError::InvalidArgument(_))
        ));
        assert!(page.insert_record(&vec![0u8; MAX_RECORD_SIZE]).is_ok());
    }

    #[test]
    fn test_page_fills_up() -> Result<()> {
        let mut data = empty_page();
        let mut page = fresh_page(&mut data);

        let record = vec![7u8; 100];
        let mut inserted = 0;
        while page.free_space() as usize >= record.len() + SLOT_SIZE {
            page.insert_record(&record)?;
            inserted += 1;
        }
        assert_eq!(inserted, (PAGE_SIZE - HEADER_SIZE) / (100 + SLOT_SIZE));
        assert!(matches!(
            page.insert_record(&record),
            Err(StorageError::InvalidArgument(_))
        ));

        Ok(())
    }
}
