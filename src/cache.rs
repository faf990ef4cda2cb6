//! Per-connection disk arena for spilled send buffers.
//!
//! Each connection that exceeds its memory budget gets a private cache file.
//! Records are appended at the end of the file; freed records go onto a
//! free-list and are reused by capacity. Small records are padded up to
//! [`MIN_BLOCK_CAPACITY`] so slightly-larger writes can reuse their slots.
//! When every record has been reclaimed the arena resets to length zero.
//! The file is deleted when the owning connection goes away.
//!
//! I/O is synchronous std::fs on purpose: reads and writes happen from the
//! single-threaded event loop between suspension points, and a failure here
//! is fatal to the owning connection anyway.

use std::{
    fs::{self, File, OpenOptions},
    io::{Error, ErrorKind, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    process,
    time::{SystemTime, UNIX_EPOCH},
};

pub const MIN_BLOCK_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy)]
struct Block {
    position: u64,
    length: usize,
    capacity: usize,
}

pub struct FileCache {
    path: PathBuf,
    file: Option<File>,
    next_record_id: u64,
    end: u64,
    records: std::collections::HashMap<u64, Block>,
    free: Vec<Block>,
}

impl FileCache {
    /// Prepares a cache under `dir` for connection `conn_id`. No file is
    /// created until the first write.
    pub fn new(dir: &Path, conn_id: u32) -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let path = dir.join(format!("{}-{}-{}.spill", process::id(), conn_id, millis));

        FileCache {
            path,
            file: None,
            next_record_id: 1,
            end: 0,
            records: std::collections::HashMap::new(),
            free: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    fn file(&mut self) -> Result<&mut File, Error> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&self.path)?;
            self.file = Some(file);
        }

        Ok(self.file.as_mut().unwrap())
    }

    /// Stores `data` and returns the record id to read it back with.
    pub fn write(&mut self, data: &[u8]) -> Result<u64, Error> {
        let block = match self.take_free_block(data.len()) {
            Some(mut block) => {
                block.length = data.len();
                block
            }
            None => {
                let capacity = data.len().max(MIN_BLOCK_CAPACITY);
                let block = Block {
                    position: self.end,
                    length: data.len(),
                    capacity,
                };
                self.end += capacity as u64;
                block
            }
        };

        let file = self.file()?;
        file.seek(SeekFrom::Start(block.position))?;
        file.write_all(data)?;
        if block.capacity > data.len() {
            // Pad fresh blocks so the file length matches the arena end.
            let pad = vec![0u8; block.capacity - data.len()];
            file.write_all(&pad)?;
        }

        let id = self.next_record_id;
        self.next_record_id += 1;
        self.records.insert(id, block);
        Ok(id)
    }

    pub fn read(&mut self, record_id: u64) -> Result<Vec<u8>, Error> {
        let block = *self
            .records
            .get(&record_id)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, "no such cache record"))?;

        let file = self.file()?;
        file.seek(SeekFrom::Start(block.position))?;
        let mut data = vec![0u8; block.length];
        file.read_exact(&mut data)?;
        Ok(data)
    }

    /// Releases a record's block for reuse. Resets the arena once nothing is
    /// stored anymore.
    pub fn remove(&mut self, record_id: u64) {
        if let Some(block) = self.records.remove(&record_id) {
            self.free.push(block);
        }

        if self.records.is_empty() {
            self.free.clear();
            self.end = 0;
        }
    }

    fn take_free_block(&mut self, length: usize) -> Option<Block> {
        let index = self.free.iter().position(|block| block.capacity >= length)?;
        Some(self.free.swap_remove(index))
    }

    /// Drops the backing file. Errors are ignored; there is nothing useful to
    /// do about a failed unlink at teardown.
    pub fn delete(&mut self) {
        self.records.clear();
        self.free.clear();
        self.end = 0;
        if self.file.take().is_some() {
            let _ = fs::remove_file(&self.path);
        }
    }
}

impl Drop for FileCache {
    fn drop(&mut self) {
        self.delete();
    }
}
