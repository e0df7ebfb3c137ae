//! The header page: page 0 of the database file, a tiny catalog mapping
//! index names to their root page ids.

use crate::page::PageData;
use crate::{PageId, PAGE_SIZE};

const OFF_COUNT: usize = 8;
const RECORDS_START: usize = 12;
const NAME_SIZE: usize = 32;
const RECORD_SIZE: usize = NAME_SIZE + 4;
const MAX_RECORDS: usize = (PAGE_SIZE - RECORDS_START) / RECORD_SIZE;

pub struct HeaderPageRef<'a> {
    data: &'a PageData,
}

pub struct HeaderPageMut<'a> {
    data: &'a mut PageData,
}

fn encode_name(name: &str) -> Option<[u8; NAME_SIZE]> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > NAME_SIZE {
        return None;
    }
    let mut out = [0u8; NAME_SIZE];
    out[..bytes.len()].copy_from_slice(bytes);
    Some(out)
}

impl<'a> HeaderPageRef<'a> {
    pub fn new(data: &'a PageData) -> Self {
        Self { data }
    }

    pub fn record_count(&self) -> usize {
        self.data.read_u32(OFF_COUNT) as usize
    }

    fn find(&self, name: &str) -> Option<usize> {
        let encoded = encode_name(name)?;
        (0..self.record_count()).find(|&i| {
            let base = RECORDS_START + i * RECORD_SIZE;
            self.data.bytes()[base..base + NAME_SIZE] == encoded
        })
    }

    pub fn get_record_value(&self, name: &str) -> Option<PageId> {
        let i = self.find(name)?;
        Some(self.data.read_i32(RECORDS_START + i * RECORD_SIZE + NAME_SIZE))
    }
}

impl<'a> HeaderPageMut<'a> {
    pub fn new(data: &'a mut PageData) -> Self {
        Self { data }
    }

    pub fn as_ref(&self) -> HeaderPageRef<'_> {
        HeaderPageRef { data: self.data }
    }

    pub fn insert_record(&mut self, name: &str, root_page_id: PageId) -> bool {
        let Some(encoded) = encode_name(name) else {
            return false;
        };
        let count = self.as_ref().record_count();
        if count >= MAX_RECORDS || self.as_ref().find(name).is_some() {
            return false;
        }
        let base = RECORDS_START + count * RECORD_SIZE;
        self.data.bytes_mut()[base..base + NAME_SIZE].copy_from_slice(&encoded);
        self.data.write_i32(base + NAME_SIZE, root_page_id);
        self.data.write_u32(OFF_COUNT, count as u32 + 1);
        true
    }

    pub fn update_record(&mut self, name: &str, root_page_id: PageId) -> bool {
        let Some(i) = self.as_ref().find(name) else {
            return false;
        };
        self.data
            .write_i32(RECORDS_START + i * RECORD_SIZE + NAME_SIZE, root_page_id);
        true
    }

    pub fn delete_record(&mut self, name: &str) -> bool {
        let Some(i) = self.as_ref().find(name) else {
            return false;
        };
        let count = self.as_ref().record_count();
        // Compact by moving the last record into the hole.
        if i != count - 1 {
            let last = RECORDS_START + (count - 1) * RECORD_SIZE;
            let hole = RECORDS_START + i * RECORD_SIZE;
            let moved: [u8; RECORD_SIZE] = self.data.bytes()[last..last + RECORD_SIZE]
                .try_into()
                .expect("record slice has a fixed width");
            self.data.bytes_mut()[hole..hole + RECORD_SIZE].copy_from_slice(&moved);
        }
        self.data.write_u32(OFF_COUNT, count as u32 - 1);
        true
    }
}
