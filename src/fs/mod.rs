//! Filesystem core.
//!
//! [`BitsFs`] ties the components together: the superblock and its
//! counters, the two bitmap allocators, the inode table, and the composed
//! operations the surrounding VFS layer drives (create, link, unlink,
//! mkdir, rmdir, rename, lookup, data read/write).
//!
//! Locking: the superblock counters sit behind one spinlock; each in-memory
//! inode carries its own lock; directory pages are locked individually
//! through their buffers for the duration of a mutation. Cross-inode
//! operations are serialized by the caller, as a kernel VFS would.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use scopeguard::ScopeGuard;
use spin::Mutex;

use crate::bio::Bcache;
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::param::*;

pub mod bitmap;
pub mod blockmap;
pub mod dir;
pub mod inode;
pub mod superblock;

use bitmap::Bitmap;
use dir::{ftype_of, DirEntry};
use inode::{is_dir, is_lnk, is_reg, Inode, InodeInner, S_IFDIR, S_IFMT, S_IFREG};
use superblock::SbInfo;

/// Seconds since the epoch, as stored in on-disk timestamps.
pub(crate) fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

bitflags! {
    /// Flags accepted by [`BitsFs::rename`].
    pub struct RenameFlags: u32 {
        /// Fail instead of replacing an existing target.
        const NOREPLACE = 0x1;
    }
}

/// Per-mount options.
#[derive(Clone, Copy, Debug, Default)]
pub struct MountOptions {
    /// Owner stamped on inodes created through this mount.
    pub uid: u16,
}

/// An opened filesystem instance.
pub struct BitsFs {
    bcache: Bcache,
    /// The superblock and its counters, behind the one superblock lock.
    sbi: Mutex<SbInfo>,
    /// Index of in-memory inodes.
    itable: Mutex<HashMap<u32, Arc<Inode>>>,
    block_bitmap: Bitmap,
    inode_bitmap: Bitmap,
    uid: u16,
}

impl BitsFs {
    /// Opens the filesystem on `dev` and loads the root inode.
    ///
    /// The formatter leaves the root inode and root data block unmarked in
    /// the bitmaps; every mount sets those two bits, which is idempotent.
    pub fn mount(dev: Arc<dyn BlockDevice>, opts: MountOptions) -> Result<Self> {
        let logical_bs = dev.logical_block_size();
        let bcache = Bcache::new(dev);

        let mut sbi = SbInfo::load(&bcache, logical_bs).map_err(|e| {
            log::error!("cannot find a valid bitsfs on this device: {}", e);
            e
        })?;
        if sbi.mount_state != FS_STATE_CLEAN {
            log::warn!("filesystem was not unmounted cleanly (state {})", sbi.mount_state);
        }
        sbi.set_mount_time(now_secs());

        let block_bitmap = Bitmap::new(
            BLOCK_BITMAP_BLOCK,
            (BLOCK_BITMAP_BLOCKS * (BSIZE as u32) * 8).min(sbi.data_blocks()),
        );
        let inode_bitmap = Bitmap::new(INODE_BITMAP_BLOCK, sbi.inodes_count());

        let fs = Self {
            bcache,
            sbi: Mutex::new(sbi),
            itable: Mutex::new(HashMap::new()),
            block_bitmap,
            inode_bitmap,
            uid: opts.uid,
        };

        let root = fs.iget(ROOT_INO)?;
        {
            let ip = root.lock();
            if !ip.is_dir() || ip.blocks == 0 || ip.size == 0 {
                log::error!("corrupt root inode: mode={:o} blocks={}", ip.mode, ip.blocks);
                return Err(Error::Corrupted("corrupt root inode"));
            }
        }
        fs.block_bitmap.set(&fs.bcache, 0)?;
        fs.inode_bitmap.set(&fs.bcache, ROOT_INO - 1)?;

        {
            let sbi = fs.sbi.lock();
            log::info!(
                "mounted bitsfs: {} blocks, {} inodes, {} blocks free",
                sbi.blocks_count(),
                sbi.inodes_count(),
                sbi.free_blocks
            );
        }
        Ok(fs)
    }

    /// The root directory.
    pub fn root(&self) -> Result<Arc<Inode>> {
        self.iget(ROOT_INO)
    }

    /// Writes the counters and every dirty buffer back to the device.
    pub fn sync(&self) -> Result<()> {
        self.sbi.lock().store(&self.bcache, now_secs())?;
        self.bcache.flush()
    }

    /// Flushes and consumes the instance.
    pub fn unmount(self) -> Result<()> {
        self.sync()?;
        log::info!("unmounted bitsfs");
        Ok(())
    }

    /// Looks `name` up in `dir` and loads the inode it names.
    pub fn lookup(&self, dir: &Arc<Inode>, name: &[u8]) -> Result<Arc<Inode>> {
        let mut dp = dir.lock();
        if !dp.is_dir() {
            return Err(Error::InvalidArgument);
        }
        let loc = self.find_entry(&mut dp, name)?;
        drop(dp);
        self.iget(loc.ino)
    }

    /// Thin lookup returning just the inode number.
    pub fn get_ino_by_name(&self, dir: &Arc<Inode>, name: &[u8]) -> Result<u32> {
        let mut dp = dir.lock();
        if !dp.is_dir() {
            return Err(Error::InvalidArgument);
        }
        Ok(self.find_entry(&mut dp, name)?.ino)
    }

    /// Creates a regular file named `name` in `dir`.
    ///
    /// `mode` may carry a file type; bare permission bits make a regular
    /// file.
    pub fn create(&self, dir: &Arc<Inode>, name: &[u8], mode: u16) -> Result<Arc<Inode>> {
        let mode = if mode & S_IFMT == 0 { S_IFREG | mode } else { mode };
        let mut dp = dir.lock();
        if !dp.is_dir() {
            return Err(Error::InvalidArgument);
        }

        let inode = self.new_inode(&mut dp, mode)?;
        let inode = scopeguard::guard(inode, |inode| {
            let mut ip = inode.lock();
            ip.nlink = ip.nlink.saturating_sub(1);
            drop(ip);
            let _ = self.evict_inode(&inode);
        });
        {
            let mut ip = inode.lock();
            self.write_inode(&mut ip)?;
        }
        self.add_link(&mut dp, name, inode.ino, ftype_of(mode))?;
        Ok(ScopeGuard::into_inner(inode))
    }

    /// Adds a second name for `old` in `dir`.
    pub fn link(&self, old: &Arc<Inode>, dir: &Arc<Inode>, name: &[u8]) -> Result<()> {
        let mode = {
            let mut ip = old.lock();
            if ip.is_dir() {
                return Err(Error::InvalidArgument);
            }
            ip.ctime = now_secs();
            ip.nlink += 1;
            self.write_inode(&mut ip)?;
            ip.mode
        };

        let mut dp = dir.lock();
        match self.add_link(&mut dp, name, old.ino, ftype_of(mode)) {
            Ok(()) => Ok(()),
            Err(e) => {
                drop(dp);
                let mut ip = old.lock();
                ip.nlink = ip.nlink.saturating_sub(1);
                self.write_inode(&mut ip)?;
                Err(e)
            }
        }
    }

    /// Removes `name` from `dir` and drops one link of its inode.
    pub fn unlink(&self, dir: &Arc<Inode>, name: &[u8]) -> Result<()> {
        if name == b"." || name == b".." {
            return Err(Error::InvalidArgument);
        }
        let mut dp = dir.lock();
        let loc = self.find_entry(&mut dp, name)?;
        self.delete_entry(&mut dp, &loc)?;
        let dir_ctime = dp.ctime;
        drop(dp);

        let inode = self.iget(loc.ino)?;
        let mut ip = inode.lock();
        ip.ctime = dir_ctime;
        if ip.nlink == 0 {
            log::error!("unlink: inode {} already has no links", ip.ino);
        } else {
            ip.nlink -= 1;
        }
        self.write_inode(&mut ip)
    }

    /// Creates a directory named `name` in `dir`.
    pub fn mkdir(&self, dir: &Arc<Inode>, name: &[u8], mode: u16) -> Result<Arc<Inode>> {
        let mode = S_IFDIR | (mode & !S_IFMT);
        let mut dp = dir.lock();
        if !dp.is_dir() {
            return Err(Error::InvalidArgument);
        }

        // For the forthcoming `..`.
        dp.nlink += 1;
        if let Err(e) = self.write_inode(&mut dp) {
            dp.nlink -= 1;
            return Err(e);
        }

        match self.mkdir_inner(&mut dp, name, mode) {
            Ok(inode) => Ok(inode),
            Err(e) => {
                dp.nlink = dp.nlink.saturating_sub(1);
                let _ = self.write_inode(&mut dp);
                Err(e)
            }
        }
    }

    fn mkdir_inner(
        &self,
        dp: &mut InodeInner,
        name: &[u8],
        mode: u16,
    ) -> Result<Arc<Inode>> {
        let inode = self.new_inode(dp, mode)?;
        let inode = scopeguard::guard(inode, |inode| {
            let mut ip = inode.lock();
            ip.nlink = ip.nlink.saturating_sub(2);
            drop(ip);
            let _ = self.evict_inode(&inode);
        });
        {
            let mut ip = inode.lock();
            // `.` refers to the directory itself.
            ip.nlink += 1;
            self.make_empty(&mut ip, dp.ino)?;
        }
        self.add_link(dp, name, inode.ino, FT_DIR)?;
        Ok(ScopeGuard::into_inner(inode))
    }

    /// Removes the empty directory `name` from `dir`.
    pub fn rmdir(&self, dir: &Arc<Inode>, name: &[u8]) -> Result<()> {
        let ino = self.get_ino_by_name(dir, name)?;
        let inode = self.iget(ino)?;
        {
            let mut ip = inode.lock();
            if !ip.is_dir() {
                return Err(Error::InvalidArgument);
            }
            if !self.is_empty_dir(&mut ip)? {
                return Err(Error::NotEmpty);
            }
        }

        self.unlink(dir, name)?;

        {
            let mut ip = inode.lock();
            ip.size = 0;
            ip.nlink = ip.nlink.saturating_sub(1);
            self.write_inode(&mut ip)?;
        }
        let mut dp = dir.lock();
        dp.nlink = dp.nlink.saturating_sub(1);
        self.write_inode(&mut dp)
    }

    /// Moves `old_dir/old_name` to `new_dir/new_name`, replacing an existing
    /// target unless `NOREPLACE` is given. A directory moved across parents
    /// gets its `..` entry rewritten.
    pub fn rename(
        &self,
        old_dir: &Arc<Inode>,
        old_name: &[u8],
        new_dir: &Arc<Inode>,
        new_name: &[u8],
        flags: u32,
    ) -> Result<()> {
        if flags & !RenameFlags::NOREPLACE.bits() != 0 {
            return Err(Error::InvalidArgument);
        }
        if old_name == b"." || old_name == b".." || new_name == b"." || new_name == b".." {
            return Err(Error::InvalidArgument);
        }
        let noreplace = flags & RenameFlags::NOREPLACE.bits() != 0;
        let same_dir = Arc::ptr_eq(old_dir, new_dir);

        let mut odp = old_dir.lock();
        if !odp.is_dir() {
            return Err(Error::InvalidArgument);
        }
        let old_loc = self.find_entry(&mut odp, old_name)?;
        drop(odp);

        let old_inode = self.iget(old_loc.ino)?;
        let (old_mode, old_is_dir) = {
            let ip = old_inode.lock();
            (ip.mode, ip.is_dir())
        };
        let dotdot_loc = if old_is_dir {
            let mut ip = old_inode.lock();
            Some(self.dotdot(&mut ip)?)
        } else {
            None
        };

        let mut ndp = new_dir.lock();
        if !ndp.is_dir() {
            return Err(Error::InvalidArgument);
        }
        match self.find_entry(&mut ndp, new_name) {
            Ok(new_loc) => {
                if noreplace {
                    return Err(Error::Exists);
                }
                let target = self.iget(new_loc.ino)?;
                if old_is_dir {
                    let mut tp = target.lock();
                    if !self.is_empty_dir(&mut tp)? {
                        return Err(Error::NotEmpty);
                    }
                }
                self.set_link(&mut ndp, &new_loc, old_inode.ino, ftype_of(old_mode), true)?;
                drop(ndp);

                let mut tp = target.lock();
                tp.ctime = now_secs();
                if old_is_dir {
                    // The target directory's `..` is gone with it.
                    tp.nlink = tp.nlink.saturating_sub(1);
                }
                tp.nlink = tp.nlink.saturating_sub(1);
                self.write_inode(&mut tp)?;
            }
            Err(Error::NotFound) => {
                self.add_link(&mut ndp, new_name, old_inode.ino, ftype_of(old_mode))?;
                if old_is_dir {
                    ndp.nlink += 1;
                    self.write_inode(&mut ndp)?;
                }
                drop(ndp);
            }
            Err(e) => return Err(e),
        }

        {
            let mut ip = old_inode.lock();
            ip.ctime = now_secs();
            self.write_inode(&mut ip)?;
        }

        let mut odp = old_dir.lock();
        self.delete_entry(&mut odp, &old_loc)?;

        if let Some(dd) = dotdot_loc {
            if !same_dir {
                let mut ip = old_inode.lock();
                self.set_link(&mut ip, &dd, new_dir.ino, FT_DIR, false)?;
            }
            odp.nlink = odp.nlink.saturating_sub(1);
            self.write_inode(&mut odp)?;
        }
        Ok(())
    }

    /// Releases the content of files whose mode admits data blocks.
    pub fn truncate(&self, inode: &Arc<Inode>) -> Result<()> {
        let mut ip = inode.lock();
        if !(is_reg(ip.mode) || is_dir(ip.mode) || is_lnk(ip.mode)) {
            return Ok(());
        }
        self.truncate_blocks(&mut ip)?;
        ip.i_data = [0; NMAP];
        ip.size = 0;
        let now = now_secs();
        ip.mtime = now;
        ip.ctime = now;
        self.write_inode(&mut ip)
    }

    /// Reads file content at byte offset `off`.
    pub fn read_at(&self, inode: &Arc<Inode>, off: u32, dst: &mut [u8]) -> Result<usize> {
        let mut ip = inode.lock();
        self.read_data(&mut ip, off, dst)
    }

    /// Writes file content at byte offset `off`, growing the file as needed.
    pub fn write_at(&self, inode: &Arc<Inode>, off: u32, src: &[u8]) -> Result<usize> {
        let mut ip = inode.lock();
        self.write_data(&mut ip, off, src)
    }

    /// Lists the live entries of a directory.
    pub fn readdir(&self, dir: &Arc<Inode>) -> Result<Vec<DirEntry>> {
        let mut dp = dir.lock();
        if !dp.is_dir() {
            return Err(Error::InvalidArgument);
        }
        self.readdir_guard(&mut dp)
    }
}
