//! Block buffer cache.
//!
//! The buffer cache holds cached copies of disk block contents and is the
//! synchronization point for blocks shared by concurrent operations: a
//! [`Buf`] handle owns its entry's lock for as long as it lives, so a
//! prepare/mutate/commit sequence on a directory page is a critical section
//! bounded by the handle's lifetime.
//!
//! Interface:
//! * To get a buffer for a particular disk block, call `read`.
//! * Mutating the data through the handle marks the buffer dirty.
//! * Dropping the handle releases the block; `flush` writes dirty buffers
//!   back to the device.

use std::collections::HashMap;
use std::sync::Arc;

use spin::mutex::MutexGuard;
use spin::Mutex;

use crate::device::BlockDevice;
use crate::error::Result;
use crate::param::BSIZE;

pub struct BufEntry {
    blockno: u32,
    inner: Mutex<BufInner>,
}

struct BufInner {
    /// Has data been read from disk?
    valid: bool,
    /// Must data be written back?
    dirty: bool,
    data: BufData,
}

/// Block-sized buffer, aligned so that on-disk records with `u32` fields can
/// be reinterpreted in place.
#[repr(align(8))]
pub struct BufData {
    inner: [u8; BSIZE],
}

impl core::ops::Deref for BufData {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl core::ops::DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

/// A locked buffer.
///
/// The entry's lock is held from construction until drop; the raw pointer is
/// the leaked lock guard and is only dereferenced while `self` is alive.
pub struct Buf {
    entry: Arc<BufEntry>,
    inner: *mut BufInner,
}

impl Buf {
    fn new(entry: Arc<BufEntry>) -> Self {
        let guard = entry.inner.lock();
        let inner = MutexGuard::leak(guard) as *mut BufInner;
        Self { entry, inner }
    }

    pub fn data(&self) -> &BufData {
        // SAFETY: `self.inner` is the leaked guard of the lock this handle
        // holds; shared access is tied to `&self`.
        unsafe { &(*self.inner).data }
    }

    /// Returns the buffer contents for mutation and marks the buffer dirty.
    pub fn data_mut(&mut self) -> &mut BufData {
        // SAFETY: as in `data`, and `&mut self` is exclusive.
        let inner = unsafe { &mut *self.inner };
        inner.dirty = true;
        &mut inner.data
    }
}

impl Drop for Buf {
    fn drop(&mut self) {
        // SAFETY: the guard obtained in `new` was leaked and never released;
        // this is its paired unlock.
        unsafe { self.entry.inner.force_unlock() };
    }
}

/// Cache of block buffers, keyed by block number.
pub struct Bcache {
    dev: Arc<dyn BlockDevice>,
    entries: Mutex<HashMap<u32, Arc<BufEntry>>>,
}

impl Bcache {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        Self {
            dev,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, blockno: u32) -> Arc<BufEntry> {
        let mut entries = self.entries.lock();
        entries
            .entry(blockno)
            .or_insert_with(|| {
                Arc::new(BufEntry {
                    blockno,
                    inner: Mutex::new(BufInner {
                        valid: false,
                        dirty: false,
                        data: BufData { inner: [0; BSIZE] },
                    }),
                })
            })
            .clone()
    }

    /// Returns a locked buffer with the contents of the indicated block.
    pub fn read(&self, blockno: u32) -> Result<Buf> {
        let buf = Buf::new(self.entry(blockno));
        // SAFETY: the handle holds the entry lock.
        let inner = unsafe { &mut *buf.inner };
        if !inner.valid {
            self.dev.read_block(blockno, &mut inner.data.inner)?;
            inner.valid = true;
        }
        Ok(buf)
    }

    /// Returns a locked buffer with its contents all zeroed, skipping the
    /// device read.
    pub fn get_zeroed(&self, blockno: u32) -> Result<Buf> {
        let mut buf = Buf::new(self.entry(blockno));
        buf.data_mut().fill(0);
        // SAFETY: the handle holds the entry lock.
        unsafe { (*buf.inner).valid = true };
        Ok(buf)
    }

    /// Writes every dirty buffer back to the device.
    ///
    /// The caller must not hold any [`Buf`] while flushing.
    pub fn flush(&self) -> Result<()> {
        let entries: Vec<Arc<BufEntry>> = self.entries.lock().values().cloned().collect();
        for entry in entries {
            let mut inner = entry.inner.lock();
            if inner.valid && inner.dirty {
                self.dev.write_block(entry.blockno, &inner.data.inner)?;
                inner.dirty = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDisk;

    #[test]
    fn read_caches_and_flush_writes_back() {
        let disk = MemDisk::new(8);
        let cache = Bcache::new(disk.clone());

        {
            let mut buf = cache.read(5).unwrap();
            buf.data_mut()[0] = 0x5A;
        }
        // Not yet on the device.
        let mut raw = [0u8; BSIZE];
        disk.read_block(5, &mut raw).unwrap();
        assert_eq!(raw[0], 0);

        cache.flush().unwrap();
        disk.read_block(5, &mut raw).unwrap();
        assert_eq!(raw[0], 0x5A);
    }

    #[test]
    fn get_zeroed_skips_device_read() {
        let disk = MemDisk::new(8);
        let mut raw = [0u8; BSIZE];
        raw[7] = 0xFF;
        disk.write_block(2, &raw).unwrap();

        let cache = Bcache::new(disk);
        let buf = cache.get_zeroed(2).unwrap();
        assert_eq!(buf.data()[7], 0);
    }
}
