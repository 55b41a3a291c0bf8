//! HPACK dynamic table (RFC 7541 section 2.3.2).
//!
//! A FIFO of recently indexed header fields. Index 1 is the newest entry;
//! evictions happen from the oldest end until the size accounting
//! (name + value + 32 per entry) fits the current maximum.

use bytes::Bytes;

#[derive(Debug, Clone)]
pub struct Entry {
    pub name: String,
    pub value: Bytes,
}

impl Entry {
    /// RFC 7541 section 4.1 size.
    pub fn size(&self) -> usize {
        self.name.len() + self.value.len() + 32
    }
}

#[derive(Debug)]
pub struct DynamicTable {
    entries: std::collections::VecDeque<Entry>,
    max_size: usize,
    current_size: usize,
}

impl DynamicTable {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: std::collections::VecDeque::new(),
            max_size,
            current_size: 0,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn current_size(&self) -> usize {
        self.current_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Change the maximum size, evicting from the oldest end as needed.
    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        while self.current_size > self.max_size {
            self.evict_oldest();
        }
    }

    /// Get an entry by 1-based dynamic index (newest first).
    pub fn get(&self, index: usize) -> Option<&Entry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index - 1)
    }

    /// 1-based index of an exact (name, value) match.
    pub fn find(&self, name: &str, value: &[u8]) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.name == name && e.value == value)
            .map(|idx| idx + 1)
    }

    /// 1-based index of the first entry with a matching name.
    pub fn find_name(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.name == name)
            .map(|idx| idx + 1)
    }

    /// Insert a field at index 1. An entry larger than the whole table
    /// empties it instead (RFC 7541 section 4.4).
    pub fn add(&mut self, name: String, value: Bytes) {
        let entry = Entry { name, value };
        let entry_size = entry.size();

        while self.current_size + entry_size > self.max_size && !self.entries.is_empty() {
            self.evict_oldest();
        }

        if entry_size > self.max_size {
            self.entries.clear();
            self.current_size = 0;
            return;
        }

        self.current_size += entry_size;
        self.entries.push_front(entry);
    }

    fn evict_oldest(&mut self) {
        if let Some(entry) = self.entries.pop_back() {
            self.current_size -= entry.size();
        }
    }
}
