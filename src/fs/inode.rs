//! Inodes.
//!
//! An inode describes a single unnamed file. The on-disk record holds the
//! file's mode, owner, size, timestamps, link count, and the 16-slot block
//! map; records are laid out sequentially in the inode table, 32 per block,
//! with inode `n` occupying slot `n - 1`.
//!
//! The filesystem keeps an index of in-use inodes in memory to give
//! concurrent operations a single object per inode number to lock. The
//! in-memory inode carries bookkeeping that is not stored on disk: the
//! dynamic state bits and the directory lookup hint.
//!
//! Inode numbers are 1-based: 1 is the reserved bad-blocks inode and is
//! never readable, 2 is the root directory.

use std::sync::Arc;

use bitflags::bitflags;
use spin::mutex::MutexGuard;
use spin::Mutex;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes, LayoutVerified};

use crate::error::{Error, Result};
use crate::fs::now_secs;
use crate::fs::BitsFs;
use crate::param::*;

/// File-type mask of the mode field.
pub const S_IFMT: u16 = 0xF000;
/// Regular file.
pub const S_IFREG: u16 = 0x8000;
/// Directory.
pub const S_IFDIR: u16 = 0x4000;
/// Symbolic link.
pub const S_IFLNK: u16 = 0xA000;

pub fn is_reg(mode: u16) -> bool {
    mode & S_IFMT == S_IFREG
}

pub fn is_dir(mode: u16) -> bool {
    mode & S_IFMT == S_IFDIR
}

pub fn is_lnk(mode: u16) -> bool {
    mode & S_IFMT == S_IFLNK
}

bitflags! {
    /// Dynamic inode state; never stored on disk.
    pub struct InodeState: u16 {
        /// Freshly allocated, not yet written back.
        const NEW = 0x0001;
        /// Allocation detected an index collision; do not persist.
        const BAD = 0x0002;
    }
}

/// On-disk inode record. All integers little-endian.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct RawInode {
    pub mode: u16,
    pub uid: u16,
    pub size: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub gid: u16,
    pub links_count: u16,
    pub blocks: u32,
    pub flags: u32,
    pub block: [u32; NMAP],
    pub file_acl: u32,
    pub dir_acl: u32,
    pub reserved: [u32; 5],
}

const_assert_eq!(core::mem::size_of::<RawInode>(), INODE_SIZE);

/// In-memory copy of an inode, guarded by the per-inode lock.
pub struct InodeInner {
    pub ino: u32,
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    pub size: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub nlink: u16,
    pub blocks: u32,
    pub flags: u32,
    pub file_acl: u32,
    pub dir_acl: u32,
    pub state: InodeState,
    /// Cached block map; mirrors the on-disk `block` array.
    pub i_data: [u32; NMAP],
    /// Page where the last successful name search landed. Advisory only.
    pub dir_start_lookup: u32,
}

impl InodeInner {
    pub fn is_dir(&self) -> bool {
        is_dir(self.mode)
    }
}

/// An in-memory inode. Metadata-mutating operations on one inode serialize
/// through `lock`.
pub struct Inode {
    pub ino: u32,
    inner: Mutex<InodeInner>,
}

pub type InodeGuard<'a> = MutexGuard<'a, InodeInner>;

impl Inode {
    pub fn lock(&self) -> InodeGuard<'_> {
        self.inner.lock()
    }
}

impl BitsFs {
    fn check_ino(&self, ino: u32) -> Result<()> {
        if ino == 0 || ino < ROOT_INO {
            return Err(Error::InvalidInode(ino));
        }
        if ino > self.sbi.lock().inodes_count() {
            return Err(Error::InvalidInode(ino));
        }
        Ok(())
    }

    /// Loads inode `ino`, either from the in-memory index or from the inode
    /// table on disk.
    pub fn iget(&self, ino: u32) -> Result<Arc<Inode>> {
        self.check_ino(ino)?;
        if let Some(inode) = self.itable.lock().get(&ino) {
            return Ok(inode.clone());
        }

        let (blockno, offset) = self.sbi.lock().inode_location(ino);
        let buf = self.bcache.read(blockno)?;
        let (raw, _) = LayoutVerified::<_, RawInode>::new_from_prefix(
            &buf.data()[offset..],
        )
        .ok_or(Error::Corrupted("inode record does not fit its block"))?;
        let raw: RawInode = *raw;
        drop(buf);

        let nlink = u16::from_le(raw.links_count);
        let mode = u16::from_le(raw.mode);
        let dtime = u32::from_le(raw.dtime);
        if nlink == 0 && (mode == 0 || dtime != 0) {
            // This inode is deleted.
            return Err(Error::StaleInode(ino));
        }

        let mut i_data = [0u32; NMAP];
        for (d, s) in i_data.iter_mut().zip(&raw.block) {
            *d = u32::from_le(*s);
        }

        let inode = Arc::new(Inode {
            ino,
            inner: Mutex::new(InodeInner {
                ino,
                mode,
                uid: u16::from_le(raw.uid),
                gid: u16::from_le(raw.gid),
                size: u32::from_le(raw.size),
                atime: u32::from_le(raw.atime),
                ctime: u32::from_le(raw.ctime),
                mtime: u32::from_le(raw.mtime),
                dtime,
                nlink,
                blocks: u32::from_le(raw.blocks),
                flags: u32::from_le(raw.flags),
                file_acl: u32::from_le(raw.file_acl),
                dir_acl: if is_dir(mode) {
                    u32::from_le(raw.dir_acl)
                } else {
                    0
                },
                state: InodeState::empty(),
                i_data,
                dir_start_lookup: 0,
            }),
        });

        Ok(self
            .itable
            .lock()
            .entry(ino)
            .or_insert(inode)
            .clone())
    }

    /// Copies a modified in-memory inode to its table record. Must be called
    /// after every change to a field that lives on disk.
    pub fn write_inode(&self, ip: &mut InodeInner) -> Result<()> {
        let (blockno, offset) = self.sbi.lock().inode_location(ip.ino);
        let mut buf = self.bcache.read(blockno)?;
        let (mut raw, _) = LayoutVerified::<_, RawInode>::new_from_prefix(
            &mut buf.data_mut()[offset..],
        )
        .ok_or(Error::Corrupted("inode record does not fit its block"))?;

        raw.mode = ip.mode.to_le();
        raw.uid = ip.uid.to_le();
        raw.size = ip.size.to_le();
        raw.atime = ip.atime.to_le();
        raw.ctime = ip.ctime.to_le();
        raw.mtime = ip.mtime.to_le();
        raw.dtime = ip.dtime.to_le();
        raw.gid = ip.gid.to_le();
        raw.links_count = ip.nlink.to_le();
        raw.blocks = ip.blocks.to_le();
        raw.flags = ip.flags.to_le();
        raw.file_acl = ip.file_acl.to_le();
        if !is_reg(ip.mode) {
            raw.dir_acl = ip.dir_acl.to_le();
        }
        for (d, s) in raw.block.iter_mut().zip(&ip.i_data) {
            *d = s.to_le();
        }

        ip.state.remove(InodeState::NEW);
        Ok(())
    }

    /// Allocates a fresh inode for a child of `parent`.
    pub(crate) fn new_inode(&self, parent: &mut InodeInner, mode: u16) -> Result<Arc<Inode>> {
        let pos = self
            .inode_bitmap
            .alloc_single(&self.bcache, ROOT_INO - 1)?;
        let ino = pos + 1;

        {
            let mut sbi = self.sbi.lock();
            sbi.free_inodes -= 1;
            if is_dir(mode) {
                sbi.dirs += 1;
            }
        }

        let now = now_secs();
        let inode = Arc::new(Inode {
            ino,
            inner: Mutex::new(InodeInner {
                ino,
                mode,
                uid: self.uid,
                gid: parent.gid,
                size: 0,
                atime: now,
                ctime: now,
                mtime: now,
                dtime: 0,
                nlink: 1,
                blocks: 0,
                flags: 0,
                file_acl: 0,
                dir_acl: 0,
                state: InodeState::NEW,
                i_data: [0; NMAP],
                dir_start_lookup: 0,
            }),
        });

        let mut itable = self.itable.lock();
        if itable.contains_key(&ino) {
            // The bitmap and the index disagree about this number.
            log::error!("inode number already in use: {}", ino);
            inode.lock().state.insert(InodeState::BAD);
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "inode index collision",
            )));
        }
        itable.insert(ino, inode.clone());
        Ok(inode)
    }

    /// Clears the inode's bitmap bit.
    fn free_inode(&self, ino: u32) -> Result<()> {
        if !self.inode_bitmap.clear(&self.bcache, ino - 1)? {
            log::error!("free_inode: bit already cleared for inode {}", ino);
        } else {
            let mut sbi = self.sbi.lock();
            sbi.free_inodes += 1;
        }
        Ok(())
    }

    /// Drops an inode from the in-memory index. If it has no links left and
    /// is not bad, its record is stamped with a deletion time, its blocks
    /// are released, and its inode number becomes allocatable again.
    pub fn evict_inode(&self, inode: &Arc<Inode>) -> Result<()> {
        self.itable.lock().remove(&inode.ino);

        let mut ip = inode.lock();
        if ip.nlink != 0 || ip.state.contains(InodeState::BAD) {
            return Ok(());
        }

        ip.dtime = now_secs();
        self.write_inode(&mut ip)?;
        ip.size = 0;
        if ip.blocks != 0 {
            self.truncate_blocks(&mut ip)?;
        }
        let was_dir = ip.is_dir();
        let ino = ip.ino;
        drop(ip);

        self.free_inode(ino)?;
        if was_dir {
            self.sbi.lock().dirs -= 1;
        }
        Ok(())
    }

    /// Copies data out of the inode's content, starting at byte `off`.
    /// Returns the number of bytes read; reads past end-of-file are clamped.
    pub fn read_data(&self, ip: &mut InodeInner, off: u32, dst: &mut [u8]) -> Result<usize> {
        let mut n = dst.len() as u32;
        if off > ip.size || off.wrapping_add(n) < off {
            return Ok(0);
        }
        if off + n > ip.size {
            n = ip.size - off;
        }

        let mut tot: u32 = 0;
        let mut off = off;
        while tot < n {
            let map = self.get_block(ip, off / BSIZE as u32, false)?;
            let buf = self.bcache.read(map.blockno)?;
            let m = (n - tot).min(BSIZE as u32 - off % BSIZE as u32);
            let begin = (off % BSIZE as u32) as usize;
            dst[tot as usize..(tot + m) as usize]
                .copy_from_slice(&buf.data()[begin..begin + m as usize]);
            tot += m;
            off += m;
        }
        Ok(tot as usize)
    }

    /// Copies data into the inode's content at byte `off`, allocating blocks
    /// on demand. Extends the file size when the write lands past it.
    pub fn write_data(&self, ip: &mut InodeInner, off: u32, src: &[u8]) -> Result<usize> {
        let n = src.len() as u32;
        let end = off.checked_add(n).ok_or(Error::FileTooLarge)?;
        if end as u64 > (NDIRECT as u64 + NINDIRECT as u64 * EXTENT_BLOCKS as u64) * BSIZE as u64
        {
            return Err(Error::FileTooLarge);
        }

        let mut tot: u32 = 0;
        let mut off = off;
        while tot < n {
            let map = self.get_block(ip, off / BSIZE as u32, true)?;
            let mut buf = self.bcache.read(map.blockno)?;
            let m = (n - tot).min(BSIZE as u32 - off % BSIZE as u32);
            let begin = (off % BSIZE as u32) as usize;
            buf.data_mut()[begin..begin + m as usize]
                .copy_from_slice(&src[tot as usize..(tot + m) as usize]);
            tot += m;
            off += m;
        }

        if off > ip.size {
            ip.size = off;
        }
        ip.mtime = now_secs();
        // Write the inode back even if the size did not change: the loop may
        // have added blocks to the map.
        self.write_inode(ip)?;
        Ok(tot as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDisk;
    use crate::fs::{BitsFs, MountOptions};
    use crate::mkfs;

    fn mounted() -> BitsFs {
        let disk = MemDisk::new(8192);
        mkfs::format(disk.as_ref()).unwrap();
        BitsFs::mount(disk, MountOptions::default()).unwrap()
    }

    #[test]
    fn reserved_inode_numbers_are_rejected() {
        let fs = mounted();
        assert!(matches!(fs.iget(0), Err(Error::InvalidInode(0))));
        assert!(matches!(fs.iget(BAD_INO), Err(Error::InvalidInode(1))));
        assert!(matches!(fs.iget(99999), Err(Error::InvalidInode(_))));
    }

    #[test]
    fn free_slots_read_as_stale() {
        let fs = mounted();
        assert!(matches!(fs.iget(3), Err(Error::StaleInode(3))));
    }

    #[test]
    fn new_inodes_start_at_three() {
        let disk = MemDisk::new(8192);
        mkfs::format(disk.as_ref()).unwrap();
        let fs = BitsFs::mount(disk, MountOptions { uid: 42 }).unwrap();
        let root = fs.root().unwrap();

        let mut dp = root.lock();
        let a = fs.new_inode(&mut dp, S_IFREG | 0o644).unwrap();
        let b = fs.new_inode(&mut dp, S_IFREG | 0o644).unwrap();
        assert_eq!(a.ino, 3);
        assert_eq!(b.ino, 4);

        let ip = a.lock();
        assert_eq!(ip.uid, 42);
        assert_eq!(ip.nlink, 1);
        assert!(ip.state.contains(InodeState::NEW));
        assert_eq!(ip.i_data, [0; NMAP]);
    }

    #[test]
    fn write_back_clears_the_new_state() {
        let fs = mounted();
        let root = fs.root().unwrap();
        let file = fs.create(&root, b"f", 0o644).unwrap();
        let ip = file.lock();
        assert!(!ip.state.contains(InodeState::NEW));
    }

    #[test]
    fn evicted_inode_number_is_reusable() {
        let fs = mounted();
        let root = fs.root().unwrap();

        let file = fs.create(&root, b"f", 0o644).unwrap();
        assert_eq!(file.ino, 3);
        fs.write_at(&file, 0, &[7u8; 100]).unwrap();

        fs.unlink(&root, b"f").unwrap();
        fs.evict_inode(&file).unwrap();

        // The record is readable as deleted, and the number comes back.
        assert!(matches!(fs.iget(3), Err(Error::StaleInode(3))));
        let again = fs.create(&root, b"g", 0o644).unwrap();
        assert_eq!(again.ino, 3);
    }

    #[test]
    fn data_round_trips_across_block_boundaries() {
        let fs = mounted();
        let root = fs.root().unwrap();
        let file = fs.create(&root, b"f", 0o644).unwrap();

        let data: Vec<u8> = (0..BSIZE + 1000).map(|i| (i % 251) as u8).collect();
        assert_eq!(fs.write_at(&file, 100, &data).unwrap(), data.len());
        assert_eq!(file.lock().size as usize, 100 + data.len());

        let mut read = vec![0u8; data.len()];
        assert_eq!(fs.read_at(&file, 100, &mut read).unwrap(), data.len());
        assert_eq!(read, data);

        // The unwritten head of block 0 reads back as zeros.
        let mut head = [0xFFu8; 100];
        fs.read_at(&file, 0, &mut head).unwrap();
        assert!(head.iter().all(|&b| b == 0));
    }

    #[test]
    fn reads_clamp_at_end_of_file() {
        let fs = mounted();
        let root = fs.root().unwrap();
        let file = fs.create(&root, b"f", 0o644).unwrap();
        fs.write_at(&file, 0, b"abc").unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(fs.read_at(&file, 0, &mut buf).unwrap(), 3);
        assert_eq!(fs.read_at(&file, 3, &mut buf).unwrap(), 0);
        assert_eq!(fs.read_at(&file, 100, &mut buf).unwrap(), 0);
    }

    #[test]
    fn writes_past_the_map_are_too_large() {
        let fs = mounted();
        let root = fs.root().unwrap();
        let file = fs.create(&root, b"f", 0o644).unwrap();

        let max = (NDIRECT as u32 + NINDIRECT as u32 * EXTENT_BLOCKS) * BSIZE as u32;
        assert!(matches!(
            fs.write_at(&file, max, b"x"),
            Err(Error::FileTooLarge)
        ));
    }
}
