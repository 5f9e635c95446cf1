//! Directory pages.
//!
//! A directory's data is an array of fixed 64-byte slot records inside
//! page-sized chunks of its file content. A slot with a zero inode field is
//! unused; removed entries stay in place with the inode field zeroed and
//! are never compacted. A zero `rec_len` marks the never-written tail of a
//! page and terminates that page's slot walk; every live slot carries
//! `rec_len == 64`.
//!
//! Page 0 of every directory starts with `.` and `..`.

use arrayvec::ArrayVec;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes, LayoutVerified};

use crate::bio::Buf;
use crate::error::{Error, Result};
use crate::fs::inode::{is_dir, InodeInner};
use crate::fs::{now_secs, BitsFs};
use crate::param::*;

/// Directory entry slot as laid out on disk.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct Dirent {
    pub inode: u32,
    pub rec_len: u16,
    pub name_len: u8,
    pub file_type: u8,
    pub name: [u8; DENT_NAME_LEN],
}

const_assert_eq!(core::mem::size_of::<Dirent>(), DENT_LEN);

impl Dirent {
    pub(crate) fn new(ino: u32, name: &[u8], file_type: u8) -> Self {
        let mut name_buf = [0u8; DENT_NAME_LEN];
        name_buf[..name.len()].copy_from_slice(name);
        Self {
            inode: ino.to_le(),
            rec_len: (DENT_LEN as u16).to_le(),
            name_len: name.len() as u8,
            file_type,
            name: name_buf,
        }
    }

    pub fn ino(&self) -> u32 {
        u32::from_le(self.inode)
    }

    pub fn rec_len(&self) -> u16 {
        u16::from_le(self.rec_len)
    }

    pub fn name(&self) -> &[u8] {
        &self.name[..(self.name_len as usize).min(DENT_NAME_LEN)]
    }

    fn matches(&self, name: &[u8]) -> bool {
        self.ino() != 0 && self.name() == name
    }
}

/// Location of a slot found in a directory, plus its target inode.
pub(crate) struct SlotLoc {
    pub page: u32,
    pub index: usize,
    pub ino: u32,
}

/// A live directory entry, as yielded by [`BitsFs::readdir`].
pub struct DirEntry {
    pub ino: u32,
    pub file_type: u8,
    pub name: ArrayVec<u8, DENT_NAME_LEN>,
}

/// The directory-entry file type for an inode mode.
pub(crate) fn ftype_of(mode: u16) -> u8 {
    if is_dir(mode) {
        FT_DIR
    } else {
        FT_REG_FILE
    }
}

fn read_slot(buf: &Buf, index: usize) -> Dirent {
    let off = index * DENT_LEN;
    let (slot, _) =
        LayoutVerified::<_, Dirent>::new_from_prefix(&buf.data()[off..off + DENT_LEN])
            .expect("directory slots are aligned in the page");
    *slot
}

fn write_slot(buf: &mut Buf, index: usize, de: &Dirent) {
    let off = index * DENT_LEN;
    buf.data_mut()[off..off + DENT_LEN].copy_from_slice(de.as_bytes());
}

/// Pages spanned by the directory's content.
fn dir_pages(ip: &InodeInner) -> u32 {
    (ip.size as usize + BSIZE - 1) as u32 / BSIZE as u32
}

/// Offset of the last valid byte in `page`, plus one.
fn last_byte(ip: &InodeInner, page: u32) -> usize {
    (ip.size as usize - page as usize * BSIZE).min(BSIZE)
}

impl BitsFs {
    /// Physical block of directory page `page`; the page must exist.
    fn dir_page_block(&self, ip: &mut InodeInner, page: u32) -> Result<u32> {
        match self.get_block(ip, page, false) {
            Ok(map) => Ok(map.blockno),
            Err(Error::NotFound) => Err(Error::Corrupted("directory page unmapped")),
            Err(e) => Err(e),
        }
    }

    /// Finds the slot holding `name`.
    ///
    /// The scan starts at the page of the directory's last successful
    /// search and wraps around; a hit updates the hint.
    pub(crate) fn find_entry(&self, ip: &mut InodeInner, name: &[u8]) -> Result<SlotLoc> {
        if name.len() > DENT_NAME_LEN {
            return Err(Error::NameTooLong);
        }
        let npages = dir_pages(ip);
        if npages == 0 {
            return Err(Error::NotFound);
        }

        let start = if ip.dir_start_lookup < npages {
            ip.dir_start_lookup
        } else {
            0
        };
        let mut n = start;
        loop {
            let blockno = self.dir_page_block(ip, n)?;
            let buf = self.bcache.read(blockno)?;
            let nslots = last_byte(ip, n) / DENT_LEN;
            for index in 0..nslots {
                let de = read_slot(&buf, index);
                if de.rec_len() == 0 {
                    // Never-written tail: nothing further exists in this page.
                    break;
                }
                if de.rec_len() as usize != DENT_LEN {
                    return Err(Error::Corrupted("directory entry with bad rec_len"));
                }
                if de.matches(name) {
                    ip.dir_start_lookup = n;
                    return Ok(SlotLoc {
                        page: n,
                        index,
                        ino: de.ino(),
                    });
                }
            }
            drop(buf);
            n += 1;
            if n >= npages {
                n = 0;
            }
            if n == start {
                return Err(Error::NotFound);
            }
        }
    }

    /// Returns the `..` slot: byte offset 64 of page 0.
    pub(crate) fn dotdot(&self, ip: &mut InodeInner) -> Result<SlotLoc> {
        if (ip.size as usize) < 2 * DENT_LEN {
            return Err(Error::Corrupted("directory too small for dot entries"));
        }
        let blockno = self.dir_page_block(ip, 0)?;
        let buf = self.bcache.read(blockno)?;
        let de = read_slot(&buf, 1);
        Ok(SlotLoc {
            page: 0,
            index: 1,
            ino: de.ino(),
        })
    }

    /// Appends `(name -> ino)` to the directory.
    ///
    /// The append position is the directory's end (or a zero-`rec_len`
    /// tail slot); zeroed slots of removed entries are not reused, so the
    /// directory grows monotonically.
    pub(crate) fn add_link(
        &self,
        ip: &mut InodeInner,
        name: &[u8],
        ino: u32,
        file_type: u8,
    ) -> Result<()> {
        if name.len() > DENT_NAME_LEN {
            return Err(Error::NameTooLong);
        }
        let npages = dir_pages(ip);

        for n in 0..=npages {
            // One page past the current end is a fresh, zeroed page.
            let blockno = if n < npages {
                self.dir_page_block(ip, n)?
            } else {
                self.get_block(ip, n, true)?.blockno
            };
            let mut buf = self.bcache.read(blockno)?;
            let dir_end = if n < npages { last_byte(ip, n) } else { 0 };

            let mut offset = 0;
            while offset + DENT_LEN <= BSIZE {
                if offset == dir_end {
                    // Reached the end of stored entries: append here.
                    return self.commit_slot(ip, &mut buf, n, offset, name, ino, file_type);
                }
                let de = read_slot(&buf, offset / DENT_LEN);
                if de.rec_len() == 0 {
                    return self.commit_slot(ip, &mut buf, n, offset, name, ino, file_type);
                }
                if de.rec_len() as usize != DENT_LEN {
                    return Err(Error::Corrupted("directory entry with bad rec_len"));
                }
                if de.matches(name) {
                    return Err(Error::Exists);
                }
                offset += DENT_LEN;
            }
        }
        Err(Error::Corrupted("directory walk overran its pages"))
    }

    fn commit_slot(
        &self,
        ip: &mut InodeInner,
        buf: &mut Buf,
        page: u32,
        offset: usize,
        name: &[u8],
        ino: u32,
        file_type: u8,
    ) -> Result<()> {
        write_slot(buf, offset / DENT_LEN, &Dirent::new(ino, name, file_type));

        let end = page as usize * BSIZE + offset + DENT_LEN;
        if end > ip.size as usize {
            // Directory sizes stay page-aligned; the zeroed remainder of the
            // page is the end-of-directory region.
            ip.size = ((page + 1) as usize * BSIZE) as u32;
        }
        let now = now_secs();
        ip.mtime = now;
        ip.ctime = now;
        self.write_inode(ip)
    }

    /// Removes an entry by zeroing its inode field in place.
    pub(crate) fn delete_entry(&self, ip: &mut InodeInner, loc: &SlotLoc) -> Result<()> {
        let blockno = self.dir_page_block(ip, loc.page)?;
        let mut buf = self.bcache.read(blockno)?;
        let mut de = read_slot(&buf, loc.index);
        de.inode = 0;
        write_slot(&mut buf, loc.index, &de);
        drop(buf);

        let now = now_secs();
        ip.mtime = now;
        ip.ctime = now;
        self.write_inode(ip)
    }

    /// Repoints an existing slot at `ino`.
    pub(crate) fn set_link(
        &self,
        ip: &mut InodeInner,
        loc: &SlotLoc,
        ino: u32,
        file_type: u8,
        update_times: bool,
    ) -> Result<()> {
        let blockno = self.dir_page_block(ip, loc.page)?;
        let mut buf = self.bcache.read(blockno)?;
        let mut de = read_slot(&buf, loc.index);
        de.inode = ino.to_le();
        de.file_type = file_type;
        write_slot(&mut buf, loc.index, &de);
        drop(buf);

        if update_times {
            let now = now_secs();
            ip.mtime = now;
            ip.ctime = now;
        }
        self.write_inode(ip)
    }

    /// Writes the initial `.` and `..` entries of a fresh directory.
    pub(crate) fn make_empty(&self, ip: &mut InodeInner, parent_ino: u32) -> Result<()> {
        let blockno = self.get_block(ip, 0, true)?.blockno;
        let mut buf = self.bcache.get_zeroed(blockno)?;
        write_slot(&mut buf, 0, &Dirent::new(ip.ino, b".", FT_DIR));
        write_slot(&mut buf, 1, &Dirent::new(parent_ino, b"..", FT_DIR));
        drop(buf);

        ip.size = BSIZE as u32;
        self.write_inode(ip)
    }

    /// Whether the directory holds nothing besides `.` and `..`.
    pub(crate) fn is_empty_dir(&self, ip: &mut InodeInner) -> Result<bool> {
        for n in 0..dir_pages(ip) {
            let blockno = self.dir_page_block(ip, n)?;
            let buf = self.bcache.read(blockno)?;
            for index in 0..last_byte(ip, n) / DENT_LEN {
                let de = read_slot(&buf, index);
                if de.rec_len() == 0 {
                    break;
                }
                if de.ino() == 0 {
                    continue;
                }
                // Only `.` pointing at this directory and `..` may remain.
                if de.name_len == 0 || de.name[0] != b'.' {
                    return Ok(false);
                }
                if de.name_len > 2 {
                    return Ok(false);
                }
                if de.name_len < 2 {
                    if de.ino() != ip.ino {
                        return Ok(false);
                    }
                } else if de.name[1] != b'.' {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Lists the live entries of a directory in slot order.
    pub fn readdir_guard(&self, ip: &mut InodeInner) -> Result<Vec<DirEntry>> {
        let mut out = Vec::new();
        for n in 0..dir_pages(ip) {
            let blockno = self.dir_page_block(ip, n)?;
            let buf = self.bcache.read(blockno)?;
            for index in 0..last_byte(ip, n) / DENT_LEN {
                let de = read_slot(&buf, index);
                if de.rec_len() == 0 {
                    break;
                }
                if de.ino() != 0 {
                    let mut name = ArrayVec::new();
                    name.try_extend_from_slice(de.name())
                        .map_err(|_| Error::Corrupted("entry name overruns its slot"))?;
                    out.push(DirEntry {
                        ino: de.ino(),
                        file_type: de.file_type,
                        name,
                    });
                }
            }
        }
        Ok(out)
    }
}
