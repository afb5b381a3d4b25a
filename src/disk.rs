use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
};

use log::debug;

use crate::{
    common::{PageId, INVALID_PAGE_ID, PAGE_SIZE},
    errors::{Result, StorageError},
};

const CAPACITY_OFFSET: usize = 0;
const CAPACITY_SIZE: usize = 4;
const ENTRY_CNT_OFFSET: usize = CAPACITY_OFFSET + CAPACITY_SIZE;
const ENTRY_CNT_SIZE: usize = 2;
const MAP_OFFSET: usize = ENTRY_CNT_OFFSET + ENTRY_CNT_SIZE;

// Page 0 of the file holds the allocation bitmap and the file-name
// directory; it is never handed out as a page id.
pub struct DiskManager {
    file: File,
    capacity: u32,
    page_map: Vec<u8>,
    file_entries: HashMap<String, PageId>,
}

impl DiskManager {
    pub fn new(path: &str, capacity: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let size = file.metadata()?.len();
        let disk_manager = if size == 0 {
            let map_len = (capacity as usize + 7) / 8;
            if capacity < 2 || MAP_OFFSET + map_len > PAGE_SIZE {
                return Err(StorageError::InvalidArgument(format!(
                    "unsupported page file capacity {}",
                    capacity
                )));
            }
            file.set_len(capacity as u64 * PAGE_SIZE as u64)?;
            let mut disk_manager = Self {
                file,
                capacity,
                page_map: vec![0u8; map_len],
                file_entries: HashMap::new(),
            };
            disk_manager.set_allocated(0);
            disk_manager.write_header()?;
            disk_manager
        } else {
            let mut disk_manager = Self {
                file,
                capacity: 0,
                page_map: Vec::new(),
                file_entries: HashMap::new(),
            };
            disk_manager.read_header()?;
            disk_manager
        };
        Ok(disk_manager)
    }

    pub fn read_page(&mut self, page_id: PageId, data: &mut [u8]) -> Result<()> {
        assert!(data.len() == PAGE_SIZE);
        self.check_allocated(page_id)?;
        let offset = page_id.0 as u64 * PAGE_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(data)?;
        Ok(())
    }

    pub fn write_page(&mut self, page_id: PageId, data: &[u8]) -> Result<()> {
        assert!(data.len() == PAGE_SIZE);
        self.check_allocated(page_id)?;
        let offset = page_id.0 as u64 * PAGE_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.file.sync_all()?;
        Ok(())
    }

    pub fn allocate_page(&mut self) -> Result<PageId> {
        self.allocate_run(1)
    }

    pub fn allocate_run(&mut self, run_size: usize) -> Result<PageId> {
        assert!(run_size >= 1);
        let mut first = 1u32;
        while first as usize + run_size <= self.capacity as usize {
            match (0..run_size as u32).find(|&i| self.is_allocated(first + i)) {
                None => {
                    for i in 0..run_size as u32 {
                        self.set_allocated(first + i);
                    }
                    self.write_header()?;
                    debug!("allocated run of {} pages at {}", run_size, first);
                    return Ok(PageId(first));
                }
                Some(taken) => first += taken + 1,
            }
        }
        Err(StorageError::InvalidArgument(format!(
            "no free run of {} pages",
            run_size
        )))
    }

    pub fn deallocate_page(&mut self, page_id: PageId) -> Result<()> {
        self.deallocate_run(page_id, 1)
    }

    pub fn deallocate_run(&mut self, first: PageId, run_size: usize) -> Result<()> {
        assert!(run_size >= 1);
        for i in 0..run_size {
            self.check_allocated(PageId(first.0 + i as u32))?;
        }
        for i in 0..run_size {
            self.clear_allocated(first.0 + i as u32);
        }
        self.write_header()?;
        debug!("deallocated run of {} pages at {}", run_size, first.0);
        Ok(())
    }

    pub fn add_file_entry(&mut self, name: &str, page_id: PageId) -> Result<()> {
        if self.file_entries.contains_key(name) {
            return Err(StorageError::InvalidArgument(format!(
                "file entry {} already exists",
                name
            )));
        }
        let used: usize = self
            .file_entries
            .keys()
            .map(|n| 4 + 2 + n.len())
            .sum::<usize>()
            + 4
            + 2
            + name.len();
        if MAP_OFFSET + self.page_map.len() + used > PAGE_SIZE {
            return Err(StorageError::InvalidArgument(
                "file directory is full".to_string(),
            ));
        }
        self.file_entries.insert(name.to_string(), page_id);
        self.write_header()
    }

    pub fn get_file_entry(&self, name: &str) -> Option<PageId> {
        self.file_entries.get(name).copied()
    }

    pub fn delete_file_entry(&mut self, name: &str) -> Result<()> {
        if self.file_entries.remove(name).is_none() {
            return Err(StorageError::InvalidArgument(format!(
                "no file entry for {}",
                name
            )));
        }
        self.write_header()
    }

    pub fn allocated_pages(&self) -> u32 {
        (1..self.capacity).filter(|&id| self.is_allocated(id)).count() as u32
    }

    fn check_allocated(&self, page_id: PageId) -> Result<()> {
        if page_id == INVALID_PAGE_ID
            || page_id.0 >= self.capacity
            || !self.is_allocated(page_id.0)
        {
            return Err(StorageError::InvalidArgument(format!(
                "page {} is not allocated",
                page_id.0
            )));
        }
        Ok(())
    }

    fn is_allocated(&self, id: u32) -> bool {
        self.page_map[id as usize / 8] & (1u8 << (id % 8)) != 0
    }

    fn set_allocated(&mut self, id: u32) {
        self.page_map[id as usize / 8] |= 1u8 << (id % 8);
    }

    fn clear_allocated(&mut self, id: u32) {
        self.page_map[id as usize / 8] &= !(1u8 << (id % 8));
    }

    fn write_header(&mut self) -> Result<()> {
        let mut data = vec![0u8; PAGE_SIZE];
        data[CAPACITY_OFFSET..(CAPACITY_OFFSET + CAPACITY_SIZE)]
            .copy_from_slice(&self.capacity.to_le_bytes());
        data[ENTRY_CNT_OFFSET..(ENTRY_CNT_OFFSET + ENTRY_CNT_SIZE)]
            .copy_from_slice(&(self.file_entries.len() as u16).to_le_bytes());
        data[MAP_OFFSET..(MAP_OFFSET + self.page_map.len())].copy_from_slice(&self.page_map);
        let mut offset = MAP_OFFSET + self.page_map.len();
        for (name, page_id) in &self.file_entries {
            data[offset..(offset + 4)].copy_from_slice(&page_id.0.to_le_bytes());
            data[(offset + 4)..(offset + 6)].copy_from_slice(&(name.len() as u16).to_le_bytes());
            data[(offset + 6)..(offset + 6 + name.len())].copy_from_slice(name.as_bytes());
            offset += 6 + name.len();
        }
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&data)?;
        self.file.sync_all()?;
        Ok(())
    }

    fn read_header(&mut self) -> Result<()> {
        let mut data = vec![0u8; PAGE_SIZE];
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut data)?;

        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&data[CAPACITY_OFFSET..(CAPACITY_OFFSET + CAPACITY_SIZE)]);
        self.capacity = u32::from_le_bytes(bytes);
        let map_len = (self.capacity as usize + 7) / 8;
        if self.capacity < 2 || MAP_OFFSET + map_len > PAGE_SIZE {
            return Err(StorageError::Internal(
                "corrupt page file header".to_string(),
            ));
        }
        self.page_map = data[MAP_OFFSET..(MAP_OFFSET + map_len)].to_vec();

        let mut bytes = [0u8; 2];
        bytes.copy_from_slice(&data[ENTRY_CNT_OFFSET..(ENTRY_CNT_OFFSET + ENTRY_CNT_SIZE)]);
        let entry_cnt = u16::from_le_bytes(bytes);
        let mut offset = MAP_OFFSET + map_len;
        self.file_entries = HashMap::new();
        for _ in 0..entry_cnt {
            if offset + 6 > PAGE_SIZE {
                return Err(StorageError::Internal(
                    "corrupt page file header".to_string(),
                ));
            }
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&data[offset..(offset + 4)]);
            let page_id = PageId(u32::from_le_bytes(bytes));
            let mut bytes = [0u8; 2];
            bytes.copy_from_slice(&data[(offset + 4)..(offset + 6)]);
            let name_len = u16::from_le_bytes(bytes) as usize;
            if offset + 6 + name_len > PAGE_SIZE {
                return Err(StorageError::Internal(
                    "corrupt page file header".to_string(),
                ));
            }
            let name = String::from_utf8(data[(offset + 6)..(offset + 6 + name_len)].to_vec())
                .map_err(|_| StorageError::Internal("corrupt page file header".to_string()))?;
            self.file_entries.insert(name, page_id);
            offset += 6 + name_len;
        }
        Ok(())
    }
}
