// Disk layout:
// [ superblock | inode bitmap | data bitmap | inode blocks | data blocks ]

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::{env::args, fs::OpenOptions};

use bytemuck::{Pod, Zeroable};

/// Block size, matching the driver and cache.
const BSIZE: u32 = 512;
/// Size of the filesystem image, in blocks.
const FSSIZE: u32 = 2000;
/// Number of inodes the image has room for.
const NINODES: u32 = 200;

/// Number of direct block addresses in an inode.
const NDIRECT: u32 = 12;
/// Number of block addresses reachable through the indirect pointer.
const NINDIRECT: u32 = BSIZE / (size_of::<u32>() as u32);
/// Max file size this tool can write (blocks). The full double-indirect
/// range is reachable by the filesystem at runtime; mkfs only ever
/// embeds small seed files, so it does not need it.
const MAXFILE: u32 = NDIRECT + NINDIRECT;

/// Directory entry name size.
const DIRNAME_MAX: usize = 28;

/// Inodes per block.
const IPB: u32 = BSIZE / (size_of::<DiskInode>() as u32);
/// Bits per bitmap block.
const BPB: u32 = BSIZE * 8;

const INODE_BITMAP_BLOCKS: u32 = NINODES.div_ceil(BPB);
const INODE_BLOCKS: u32 = NINODES.div_ceil(IPB);
/// Fixed point: one data-bitmap block covers BPB data blocks, and the
/// image is small enough that this never needs a second iteration.
const DATA_BITMAP_BLOCKS: u32 = 1;
const NMETA: u32 = 1 + INODE_BITMAP_BLOCKS + DATA_BITMAP_BLOCKS + INODE_BLOCKS;
const DATA_BLOCKS: u32 = FSSIZE - NMETA;

const ROOT_INODE: u32 = 0;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct SuperBlock {
    block_count: u32,
    inode_bitmap_block_count: u32,
    data_bitmap_block_count: u32,
    inode_block_count: u32,
    root_directory_inode: u16,
    reserved: [u16; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct DiskInode {
    size: u32,
    direct: [u32; NDIRECT as usize],
    indirect: u32,
    dindirect: [u32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct DirEntry {
    name: [u8; DIRNAME_MAX],
    inum: u16,
    reserved: u16,
}

fn main() {
    let args = args().collect::<Vec<String>>();
    if args.len() < 2 {
        println!("Usage: mkfs <fs.img> [files]");
        std::process::exit(1);
    }

    assert_eq!(size_of::<SuperBlock>(), 24);
    assert_eq!(size_of::<DiskInode>(), 64);
    assert_eq!(size_of::<DirEntry>(), 32);

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&args[1])
        .expect("failed to open image file");

    let sb = SuperBlock {
        block_count: FSSIZE,
        inode_bitmap_block_count: INODE_BITMAP_BLOCKS,
        data_bitmap_block_count: DATA_BITMAP_BLOCKS,
        inode_block_count: INODE_BLOCKS,
        root_directory_inode: ROOT_INODE as u16,
        reserved: [0; 3],
    };
    println!("{sb:?}");

    let zeros = vec![0u8; BSIZE as usize];
    for i in 0..FSSIZE {
        write_block(&file, i, &zeros);
    }

    let mut sb_buf = [0u8; BSIZE as usize];
    sb_buf[..size_of::<SuperBlock>()].copy_from_slice(bytemuck::bytes_of(&sb));
    write_block(&file, 0, &sb_buf);

    let layout = Layout::new(&sb);

    mark_inode_allocated(&file, &layout, ROOT_INODE);
    write_inode(&file, &layout, ROOT_INODE, &DiskInode::zeroed());

    let mut free_block = 0u32;
    for path in &args[2..] {
        let name = std::path::Path::new(path)
            .file_name()
            .expect("bad file name")
            .to_str()
            .expect("non-utf8 file name");
        assert!(name.len() <= DIRNAME_MAX, "name too long: {name}");

        let inum = allocate_inode(&file, &layout);
        let contents = std::fs::read(path).expect("failed to read input file");
        append_inode(&file, &layout, &mut free_block, inum, &contents);

        let mut entry_name = [0u8; DIRNAME_MAX];
        entry_name[..name.len()].copy_from_slice(name.as_bytes());
        let entry = DirEntry {
            name: entry_name,
            inum: inum as u16,
            reserved: 0,
        };
        append_inode(
            &file,
            &layout,
            &mut free_block,
            ROOT_INODE,
            bytemuck::bytes_of(&entry),
        );
    }

    println!("done");
}

struct Layout {
    inode_bitmap_start: u32,
    data_bitmap_start: u32,
    inode_area_start: u32,
    data_area_start: u32,
}

impl Layout {
    fn new(sb: &SuperBlock) -> Self {
        let inode_bitmap_start = 1;
        let data_bitmap_start = inode_bitmap_start + sb.inode_bitmap_block_count;
        let inode_area_start = data_bitmap_start + sb.data_bitmap_block_count;
        let data_area_start = inode_area_start + sb.inode_block_count;
        Layout {
            inode_bitmap_start,
            data_bitmap_start,
            inode_area_start,
            data_area_start,
        }
    }
}

fn write_block(file: &File, block: u32, buf: &[u8]) {
    file.write_at(buf, (block * BSIZE) as u64)
        .expect("failed to write block");
}

fn read_block(file: &File, block: u32, buf: &mut [u8]) {
    file.read_at(buf, (block * BSIZE) as u64)
        .expect("failed to read block");
}

fn mark_inode_allocated(file: &File, layout: &Layout, inum: u32) {
    let block = layout.inode_bitmap_start + inum / BPB;
    let mut buf = [0u8; BSIZE as usize];
    read_block(file, block, &mut buf);
    let bit = inum % BPB;
    buf[(bit / 8) as usize] |= 1 << (bit % 8);
    write_block(file, block, &buf);
}

fn allocate_inode(file: &File, layout: &Layout) -> u32 {
    for inum in 0..NINODES {
        let block = layout.inode_bitmap_start + inum / BPB;
        let mut buf = [0u8; BSIZE as usize];
        read_block(file, block, &mut buf);
        let bit = inum % BPB;
        if buf[(bit / 8) as usize] & (1 << (bit % 8)) == 0 {
            buf[(bit / 8) as usize] |= 1 << (bit % 8);
            write_block(file, block, &buf);
            write_inode(file, layout, inum, &DiskInode::zeroed());
            return inum;
        }
    }
    panic!("out of inodes");
}

fn write_inode(file: &File, layout: &Layout, inum: u32, inode: &DiskInode) {
    let block = layout.inode_area_start + inum / IPB;
    let mut buf = [0u8; BSIZE as usize];
    read_block(file, block, &mut buf);
    let offset = (inum % IPB) as usize * size_of::<DiskInode>();
    buf[offset..offset + size_of::<DiskInode>()].copy_from_slice(bytemuck::bytes_of(inode));
    write_block(file, block, &buf);
}

fn read_inode(file: &File, layout: &Layout, inum: u32) -> DiskInode {
    let block = layout.inode_area_start + inum / IPB;
    let mut buf = [0u8; BSIZE as usize];
    read_block(file, block, &mut buf);
    let offset = (inum % IPB) as usize * size_of::<DiskInode>();
    *bytemuck::from_bytes(&buf[offset..offset + size_of::<DiskInode>()])
}

/// Allocates the next free data block, relative to the data area. Block
/// 0 is skipped: a `DiskInode` pointer field uses 0 to mean "unset", so
/// relative block 0 must stay reserved and never be handed out.
fn next_data_block(file: &File, layout: &Layout, free_block: &mut u32) -> u32 {
    if *free_block == 0 {
        *free_block = 1;
    }
    assert!(*free_block < DATA_BLOCKS, "image out of data blocks");
    let rel = *free_block;
    *free_block += 1;

    let bitmap_block = layout.data_bitmap_start + rel / BPB;
    let mut buf = [0u8; BSIZE as usize];
    read_block(file, bitmap_block, &mut buf);
    let bit = rel % BPB;
    buf[(bit / 8) as usize] |= 1 << (bit % 8);
    write_block(file, bitmap_block, &buf);

    rel
}

fn append_inode(file: &File, layout: &Layout, free_block: &mut u32, inum: u32, mut data: &[u8]) {
    let mut din = read_inode(file, layout, inum);
    let mut offset = din.size;

    while !data.is_empty() {
        let fbn = offset / BSIZE;
        assert!(fbn < MAXFILE, "file exceeds mkfs's direct+indirect range");

        let rel = if fbn < NDIRECT {
            if din.direct[fbn as usize] == 0 {
                din.direct[fbn as usize] = next_data_block(file, layout, free_block);
            }
            din.direct[fbn as usize]
        } else {
            if din.indirect == 0 {
                din.indirect = next_data_block(file, layout, free_block);
            }
            let indirect_rel = din.indirect;
            let mut indirect_buf = [0u8; BSIZE as usize];
            read_block(file, layout.data_area_start + indirect_rel, &mut indirect_buf);

            let index = (fbn - NDIRECT) as usize;
            let byte_offset = index * 4;
            let stored =
                u32::from_le_bytes(indirect_buf[byte_offset..byte_offset + 4].try_into().unwrap());
            if stored == 0 {
                let new_rel = next_data_block(file, layout, free_block);
                indirect_buf[byte_offset..byte_offset + 4].copy_from_slice(&new_rel.to_le_bytes());
                write_block(file, layout.data_area_start + indirect_rel, &indirect_buf);
                new_rel
            } else {
                stored
            }
        };

        let block_offset = (offset - fbn * BSIZE) as usize;
        let n = data.len().min(((fbn + 1) * BSIZE - offset) as usize);

        let mut buf = [0u8; BSIZE as usize];
        read_block(file, layout.data_area_start + rel, &mut buf);
        buf[block_offset..block_offset + n].copy_from_slice(&data[..n]);
        write_block(file, layout.data_area_start + rel, &buf);

        offset += n as u32;
        data = &data[n..];
    }

    din.size = offset;
    write_inode(file, layout, inum, &din);
}
