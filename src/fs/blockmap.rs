//! Logical-to-physical block translation.
//!
//! An inode's 16-slot map is a hybrid of two levels. Slots `0..12` are
//! direct: each addresses one data block. Slots `12..16` are indirect: each
//! holds the first physical block of a contiguous 1024-block extent, so the
//! map is entirely self-describing with no pointer blocks on disk. The
//! total addressable file is `(12 + 4 * 1024)` blocks.
//!
//! Allocation keeps the map dense: mapping block `i` first fills every
//! unallocated slot before it, so a file's direct slots never contain holes
//! and prefix reads stay cheap.

use crate::error::{Error, Result};
use crate::fs::inode::{is_dir, is_lnk, is_reg, InodeInner};
use crate::fs::BitsFs;
use crate::param::*;

/// Result of mapping a logical block.
pub struct BlockMapping {
    /// Physical block number.
    pub blockno: u32,
    /// Blocks the caller may transfer contiguously at this mapping.
    pub contiguous: u32,
    /// Whether this call allocated at least one block.
    pub new: bool,
}

impl BitsFs {
    /// Allocates one data block, zeroes it, and charges it to `ip`.
    /// Returns the physical block number.
    fn alloc_data_block(&self, ip: &mut InodeInner) -> Result<u32> {
        let pos = self.block_bitmap.alloc_single(&self.bcache, 0)?;
        let blockno = pos + DATA_BLOCK;
        self.bcache.get_zeroed(blockno)?;
        ip.blocks += 1;
        self.sbi.lock().free_blocks -= 1;
        Ok(blockno)
    }

    /// Allocates a 1024-block extent, zeroes it, and charges it to `ip`.
    /// Returns the extent's first physical block number.
    fn alloc_extent(&self, ip: &mut InodeInner) -> Result<u32> {
        let pos = self.block_bitmap.alloc_range(&self.bcache, EXTENT_BLOCKS)?;
        let blockno = pos + DATA_BLOCK;
        for b in blockno..blockno + EXTENT_BLOCKS {
            self.bcache.get_zeroed(b)?;
        }
        ip.blocks += EXTENT_BLOCKS;
        self.sbi.lock().free_blocks -= EXTENT_BLOCKS as i64;
        Ok(blockno)
    }

    /// Maps logical block `iblock` of `ip` to a physical block.
    ///
    /// With `create`, every slot needed to reach `iblock` is allocated:
    /// direct slots singly, indirect slots as whole extents. Without
    /// `create` the map is only consulted; an unallocated slot reports
    /// `NotFound`. Partially performed allocations stay in the map on
    /// failure; the inode is dirty and must be written back.
    pub fn get_block(
        &self,
        ip: &mut InodeInner,
        iblock: u32,
        create: bool,
    ) -> Result<BlockMapping> {
        let mut new = false;

        let (slot, offset, contiguous) = if (iblock as usize) < NDIRECT {
            (iblock as usize, 0, iblock + 1)
        } else {
            let off = iblock + 1 - NDIRECT as u32;
            let slot = NDIRECT as u32 - 1
                + if off % EXTENT_BLOCKS == 0 {
                    off / EXTENT_BLOCKS
                } else {
                    off / EXTENT_BLOCKS + 1
                };
            if slot as usize >= NMAP {
                log::error!("logical block {} beyond the block map", iblock);
                return Err(Error::FileTooLarge);
            }
            (slot as usize, off % EXTENT_BLOCKS, EXTENT_BLOCKS)
        };

        if !create {
            if ip.i_data[slot] == 0 {
                return Err(Error::NotFound);
            }
            return Ok(BlockMapping {
                blockno: ip.i_data[slot] + offset,
                contiguous,
                new: false,
            });
        }

        // Fill every direct slot up to the target so the prefix stays dense.
        let direct_end = slot.min(NDIRECT - 1);
        for n in 0..=direct_end {
            if ip.i_data[n] == 0 {
                let blockno = self.alloc_data_block(ip)?;
                ip.i_data[n] = blockno;
                new = true;
            }
        }

        if slot >= NDIRECT {
            for n in NDIRECT..=slot {
                if ip.i_data[n] == 0 {
                    let blockno = self.alloc_extent(ip)?;
                    ip.i_data[n] = blockno;
                    new = true;
                }
            }
        }

        Ok(BlockMapping {
            blockno: ip.i_data[slot] + offset,
            contiguous,
            new,
        })
    }

    /// Releases every block the map addresses: one bit per direct slot, a
    /// 1024-bit run per indirect slot. The caller zeroes `i_data` and resets
    /// the size afterwards.
    pub fn truncate_blocks(&self, ip: &mut InodeInner) -> Result<()> {
        if !(is_reg(ip.mode) || is_dir(ip.mode) || is_lnk(ip.mode)) {
            return Ok(());
        }

        let mut freed: i64 = 0;
        for n in 0..NDIRECT {
            let v = ip.i_data[n];
            if v != 0 {
                if !self.block_bitmap.clear(&self.bcache, v - DATA_BLOCK)? {
                    log::error!("truncate: block {} already free", v);
                }
                freed += 1;
            }
        }
        for n in NDIRECT..NMAP {
            let v = ip.i_data[n];
            if v != 0 {
                for k in 0..EXTENT_BLOCKS {
                    if !self.block_bitmap.clear(&self.bcache, v - DATA_BLOCK + k)? {
                        log::error!("truncate: block {} already free", v + k);
                    }
                }
                freed += EXTENT_BLOCKS as i64;
            }
        }

        ip.blocks = 0;
        self.sbi.lock().free_blocks += freed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDisk;
    use crate::fs::{BitsFs, MountOptions};
    use crate::mkfs;
    use crate::param::*;

    fn mounted() -> BitsFs {
        let disk = MemDisk::new(8192);
        mkfs::format(disk.as_ref()).unwrap();
        BitsFs::mount(disk, MountOptions::default()).unwrap()
    }

    #[test]
    fn direct_slots_fill_densely() {
        let fs = mounted();
        let root = fs.root().unwrap();
        let file = fs.create(&root, b"f", 0o644).unwrap();
        let mut ip = file.lock();

        let map = fs.get_block(&mut ip, 3, true).unwrap();
        assert!(map.new);
        assert_eq!(map.contiguous, 4);
        // Every earlier direct slot was allocated too.
        for n in 0..=3 {
            assert_ne!(ip.i_data[n], 0);
        }
        for n in 4..NMAP {
            assert_eq!(ip.i_data[n], 0);
        }
        assert_eq!(ip.blocks, 4);
    }

    #[test]
    fn mapping_is_stable_until_truncate() {
        let fs = mounted();
        let root = fs.root().unwrap();
        let file = fs.create(&root, b"f", 0o644).unwrap();
        let mut ip = file.lock();

        let p = fs.get_block(&mut ip, 7, true).unwrap().blockno;
        assert_eq!(fs.get_block(&mut ip, 7, false).unwrap().blockno, p);
        assert_eq!(fs.get_block(&mut ip, 7, true).unwrap().blockno, p);

        fs.truncate_blocks(&mut ip).unwrap();
        ip.i_data = [0; NMAP];
        assert!(matches!(
            fs.get_block(&mut ip, 7, false),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn indirect_slot_maps_into_an_extent() {
        let fs = mounted();
        let root = fs.root().unwrap();
        let file = fs.create(&root, b"f", 0o644).unwrap();
        let mut ip = file.lock();

        // Logical block 12 is the first to need an indirect slot.
        let map = fs.get_block(&mut ip, 12, true).unwrap();
        assert!(map.new);
        assert_eq!(map.contiguous, EXTENT_BLOCKS);
        for n in 0..NDIRECT {
            assert_ne!(ip.i_data[n], 0, "direct slot {} left unallocated", n);
        }
        let extent = ip.i_data[NDIRECT];
        assert_ne!(extent, 0);
        assert_eq!(map.blockno, extent + 1);
        assert_eq!(ip.blocks, NDIRECT as u32 + EXTENT_BLOCKS);

        // The last block served by slot 12 wraps to the extent start.
        let map = fs.get_block(&mut ip, 12 + EXTENT_BLOCKS - 1, true).unwrap();
        assert!(!map.new);
        assert_eq!(map.blockno, extent);
    }

    #[test]
    fn block_index_past_the_map_is_too_large() {
        let fs = mounted();
        let root = fs.root().unwrap();
        let file = fs.create(&root, b"f", 0o644).unwrap();
        let mut ip = file.lock();

        let max = NDIRECT as u32 + NINDIRECT as u32 * EXTENT_BLOCKS;
        assert!(matches!(
            fs.get_block(&mut ip, max, true),
            Err(Error::FileTooLarge)
        ));
    }

    #[test]
    fn truncate_returns_blocks_to_the_bitmap() {
        let fs = mounted();
        let root = fs.root().unwrap();
        let file = fs.create(&root, b"f", 0o644).unwrap();
        let mut ip = file.lock();

        let b0 = fs.get_block(&mut ip, 0, true).unwrap().blockno;
        let before = fs.sbi.lock().free_blocks;
        fs.truncate_blocks(&mut ip).unwrap();
        ip.i_data = [0; NMAP];
        assert_eq!(fs.sbi.lock().free_blocks, before + 1);
        assert!(!fs
            .block_bitmap
            .get(&fs.bcache, b0 - DATA_BLOCK)
            .unwrap());
    }
}
