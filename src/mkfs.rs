//! Image formatter.
//!
//! Writes a freshly initialised filesystem onto a raw device: superblock,
//! zeroed bitmaps, zeroed inode table, the root inode, and the root
//! directory's `.`/`..` entries. The root's bitmap bits are deliberately
//! left clear; the mount path sets them (idempotently) on every mount.

use zerocopy::AsBytes;

use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::fs::dir::Dirent;
use crate::fs::inode::{RawInode, S_IFDIR};
use crate::fs::now_secs;
use crate::fs::superblock::RawSuperblock;
use crate::param::*;

/// Formats `dev`. Refuses devices smaller than [`MIN_DEV_BYTES`].
pub fn format(dev: &dyn BlockDevice) -> Result<()> {
    let nblocks = dev.nblocks();
    if (nblocks as u64) * (BSIZE as u64) < MIN_DEV_BYTES {
        log::error!(
            "device too small: {} blocks, need at least {}",
            nblocks,
            MIN_DEV_BYTES / BSIZE as u64
        );
        return Err(Error::InvalidArgument);
    }

    let inode_count = INODE_TABLE_BLOCKS * (BSIZE as u32) / INODE_SIZE as u32;
    let now = now_secs();
    let zero = [0u8; BSIZE];

    // Superblock.
    let sb = RawSuperblock {
        inodes_count: inode_count.to_le(),
        blocks_count: nblocks.to_le(),
        free_inodes_count: (inode_count - 1).to_le(),
        free_blocks_count: (nblocks - DATA_BLOCK - 1).to_le(),
        block_bitmap_block: BLOCK_BITMAP_BLOCK.to_le(),
        inode_bitmap_block: INODE_BITMAP_BLOCK.to_le(),
        inode_table_block: INODE_TABLE_BLOCK.to_le(),
        data_block: DATA_BLOCK.to_le(),
        block_size: (BSIZE as u32).to_le(),
        first_ino: ROOT_INO.to_le(),
        inode_size: (INODE_SIZE as u32).to_le(),
        mtime: 0,
        wtime: now.to_le(),
        magic: SUPER_MAGIC.to_le(),
        state: FS_STATE_CLEAN.to_le(),
        creator_os: OS_LINUX.to_le(),
        name: *FS_NAME,
        reserved: [0; 239],
    };
    let mut block = [0u8; BSIZE];
    block[..core::mem::size_of::<RawSuperblock>()].copy_from_slice(sb.as_bytes());
    dev.write_block(SUPER_BLOCK, &block)?;

    // Bitmaps and inode table start out all clear.
    for b in BLOCK_BITMAP_BLOCK..BLOCK_BITMAP_BLOCK + BLOCK_BITMAP_BLOCKS {
        dev.write_block(b, &zero)?;
    }
    dev.write_block(INODE_BITMAP_BLOCK, &zero)?;
    for b in INODE_TABLE_BLOCK..INODE_TABLE_BLOCK + INODE_TABLE_BLOCKS {
        dev.write_block(b, &zero)?;
    }

    // Root inode, in slot `ROOT_INO - 1` of the table's first block.
    let root = RawInode {
        mode: (S_IFDIR | 0o755).to_le(),
        uid: 0,
        size: (BSIZE as u32).to_le(),
        atime: now.to_le(),
        ctime: now.to_le(),
        mtime: now.to_le(),
        dtime: 0,
        gid: 0,
        links_count: 2u16.to_le(),
        blocks: 1u32.to_le(),
        flags: 0,
        block: {
            let mut map = [0u32; NMAP];
            map[0] = DATA_BLOCK.to_le();
            map
        },
        file_acl: 0,
        dir_acl: 0,
        reserved: [0; 5],
    };
    let mut block = [0u8; BSIZE];
    let off = (ROOT_INO - 1) as usize * INODE_SIZE;
    block[off..off + INODE_SIZE].copy_from_slice(root.as_bytes());
    dev.write_block(INODE_TABLE_BLOCK, &block)?;

    // Root directory content: `.` and `..`, both the root itself.
    let mut block = [0u8; BSIZE];
    block[..DENT_LEN].copy_from_slice(Dirent::new(ROOT_INO, b".", FT_DIR).as_bytes());
    block[DENT_LEN..2 * DENT_LEN]
        .copy_from_slice(Dirent::new(ROOT_INO, b"..", FT_DIR).as_bytes());
    dev.write_block(DATA_BLOCK, &block)?;

    log::info!(
        "formatted bitsfs: {} blocks, {} inodes",
        nblocks,
        inode_count
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDisk;

    fn block_of(disk: &MemDisk, bno: u32) -> [u8; BSIZE] {
        let mut block = [0u8; BSIZE];
        disk.read_block(bno, &mut block).unwrap();
        block
    }

    #[test]
    fn refuses_devices_below_the_minimum() {
        let disk = MemDisk::new(63);
        assert!(matches!(
            format(disk.as_ref()),
            Err(Error::InvalidArgument)
        ));
        // Past the size gate but too small for the fixed layout: the failed
        // write surfaces unchanged.
        assert!(matches!(
            format(MemDisk::new(64).as_ref()),
            Err(Error::Io(_))
        ));
        assert!(format(MemDisk::new(136).as_ref()).is_ok());
    }

    #[test]
    fn formats_a_one_mib_device() {
        let disk = MemDisk::new(256);
        format(disk.as_ref()).unwrap();

        // Superblock magic, little-endian, after thirteen u32 fields.
        let sb = block_of(&disk, SUPER_BLOCK);
        assert_eq!(&sb[52..54], &[0x99, 0xEF]);
        assert_eq!(&sb[60..66], b"bitsfs");

        // Bitmaps are all clear; the root bits are set at mount, not here.
        for b in BLOCK_BITMAP_BLOCK..=INODE_BITMAP_BLOCK {
            assert!(block_of(&disk, b).iter().all(|&x| x == 0));
        }

        // Inode table: only the root record is populated.
        let table = block_of(&disk, INODE_TABLE_BLOCK);
        assert!(table[..INODE_SIZE].iter().all(|&x| x == 0));
        assert!(table[INODE_SIZE..2 * INODE_SIZE].iter().any(|&x| x != 0));
        for b in INODE_TABLE_BLOCK + 1..INODE_TABLE_BLOCK + INODE_TABLE_BLOCKS {
            assert!(block_of(&disk, b).iter().all(|&x| x == 0));
        }

        // Root directory data: `.` then `..`, both inode 2.
        let data = block_of(&disk, DATA_BLOCK);
        assert_eq!(&data[0..4], &ROOT_INO.to_le_bytes());
        assert_eq!(data[8], b'.');
        assert_eq!(&data[64..68], &ROOT_INO.to_le_bytes());
        assert_eq!(&data[72..74], b"..");
    }

    #[test]
    fn root_inode_record_matches_the_layout() {
        let disk = MemDisk::new(256);
        format(disk.as_ref()).unwrap();

        let table = block_of(&disk, INODE_TABLE_BLOCK);
        let rec = &table[INODE_SIZE..2 * INODE_SIZE];
        let mode = u16::from_le_bytes([rec[0], rec[1]]);
        assert_eq!(mode, S_IFDIR | 0o755);
        let size = u32::from_le_bytes([rec[4], rec[5], rec[6], rec[7]]);
        assert_eq!(size, BSIZE as u32);
        let links = u16::from_le_bytes([rec[26], rec[27]]);
        assert_eq!(links, 2);
        let blocks = u32::from_le_bytes([rec[28], rec[29], rec[30], rec[31]]);
        assert_eq!(blocks, 1);
        let block0 = u32::from_le_bytes([rec[36], rec[37], rec[38], rec[39]]);
        assert_eq!(block0, DATA_BLOCK);
    }
}
