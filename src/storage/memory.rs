//! # In-Memory Page Storage
//!
//! `MemoryStorage` keeps the pages of one collection file in heap buffers.
//! It backs `FileManager::in_memory` and serves as the page simulator for
//! tests that exercise odd page sizes without touching the file system.
//!
//! Pages are individually boxed so growing the file never moves existing
//! page contents.

use eyre::{ensure, Result};

#[derive(Debug)]
pub struct MemoryStorage {
    pages: Vec<Box<[u8]>>,
    page_size: usize,
}

impl MemoryStorage {
    pub fn new(page_size: usize) -> Self {
        Self {
            pages: Vec::new(),
            page_size,
        }
    }

    pub fn page(&self, page_no: u32) -> Result<&[u8]> {
        ensure!(
            (page_no as usize) < self.pages.len(),
            "page {} out of bounds (page_count={})",
            page_no,
            self.pages.len()
        );
        Ok(&self.pages[page_no as usize])
    }

    pub fn page_mut(&mut self, page_no: u32) -> Result<&mut [u8]> {
        ensure!(
            (page_no as usize) < self.pages.len(),
            "page {} out of bounds (page_count={})",
            page_no,
            self.pages.len()
        );
        Ok(&mut self.pages[page_no as usize])
    }

    pub fn grow(&mut self, new_page_count: u32) {
        let page_size = self.page_size;
        while self.pages.len() < new_page_count as usize {
            self.pages.push(vec![0u8; page_size].into_boxed_slice());
        }
    }

    pub fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }
}
