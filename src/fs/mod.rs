//! Fixed-layout indexed filesystem.
//!
//! On-disk layout, all fields little-endian:
//!
//! ```text
//! block 0        superblock
//! inode bitmap   one bit per inode
//! data bitmap    one bit per data block
//! inode area     fixed-size DiskInode records, packed
//! data area      file content, indirection blocks, directory entries
//! ```
//!
//! There is exactly one mount and one flat directory (the root); there is
//! no journaling, so a crash mid-write leaves whatever blocks had already
//! reached the cache's backing device.

use std::collections::HashMap;
use std::ptr;
use std::sync::{Arc, Mutex};

use crate::cache::BlockCache;
use crate::device::BlockDevice;
use crate::error::{KernelError, Result};
use crate::handle::{Handle, IoBackend};
use crate::param::{BSIZE, DIRNAME_MAX, IPB, NDIRECT, NINDIRECT};

/// Control operations understood by an open file's handle.
pub const FCNTL_GETEND: u32 = 0;
pub const FCNTL_SETEND: u32 = 1;
pub const FCNTL_GETPOS: u32 = 2;
pub const FCNTL_SETPOS: u32 = 3;

/// Inodes packed per block.
const IPB_INODE: u32 = (BSIZE / size_of::<DiskInode>()) as u32;
/// Block indices addressable through a single indirection level.
const PTRS_PER_DINDIRECT: usize = IPB * IPB;

/// On-disk superblock, read once at mount.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SuperBlock {
    pub block_count: u32,
    pub inode_bitmap_block_count: u32,
    pub data_bitmap_block_count: u32,
    pub inode_block_count: u32,
    pub root_directory_inode: u16,
    pub reserved: [u16; 3],
}

const _: () = assert!(size_of::<SuperBlock>() == 24);

/// On-disk inode: a size plus the addressing scheme from §4.C — direct
/// pointers, one indirect pointer, two double-indirect pointers. Every
/// pointer is a 0-based index into the data area, not an absolute block
/// number.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskInode {
    pub size: u32,
    pub direct: [u32; NDIRECT],
    pub indirect: u32,
    pub dindirect: [u32; 2],
}

const _: () = assert!(size_of::<DiskInode>() == 64);

/// Fixed-size directory entry: a NUL-padded name and an inode index.
#[derive(Debug, Clone, Copy)]
pub struct DirEntry {
    pub name: [u8; DIRNAME_MAX],
    pub inum: u16,
    _reserved: u16,
}

const _: () = assert!(size_of::<DirEntry>() == 32);

impl DirEntry {
    fn name_string(&self) -> String {
        name_to_string(&self.name)
    }

    fn to_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[..DIRNAME_MAX].copy_from_slice(&self.name);
        out[DIRNAME_MAX..DIRNAME_MAX + 2].copy_from_slice(&self.inum.to_le_bytes());
        out
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        let mut name = [0u8; DIRNAME_MAX];
        name.copy_from_slice(&bytes[..DIRNAME_MAX]);
        let inum = u16::from_le_bytes([bytes[DIRNAME_MAX], bytes[DIRNAME_MAX + 1]]);
        DirEntry {
            name,
            inum,
            _reserved: 0,
        }
    }
}

fn name_to_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Region offsets derived from the superblock at mount time.
struct Layout {
    inode_bitmap_start: u32,
    data_bitmap_start: u32,
    inode_area_start: u32,
    data_area_start: u32,
    data_block_count: u32,
}

impl Layout {
    fn from_superblock(sb: &SuperBlock) -> Self {
        let inode_bitmap_start = 1;
        let data_bitmap_start = inode_bitmap_start + sb.inode_bitmap_block_count;
        let inode_area_start = data_bitmap_start + sb.data_bitmap_block_count;
        let data_area_start = inode_area_start + sb.inode_block_count;
        let data_block_count = sb.block_count.saturating_sub(data_area_start);
        Layout {
            inode_bitmap_start,
            data_bitmap_start,
            inode_area_start,
            data_area_start,
            data_block_count,
        }
    }
}

/// In-memory state for one entry in the open-file table: a snapshot of
/// its directory entry, its cached inode, and (when open) a cursor.
struct OpenSlot {
    name: [u8; DIRNAME_MAX],
    inode: DiskInode,
    opened: bool,
    pos: u64,
}

impl OpenSlot {
    fn name_string(&self) -> String {
        name_to_string(&self.name)
    }
}

/// A mounted filesystem. Created once via [`MountRegistry::mount`] (or
/// directly via [`Filesystem::mount`] in tests), shared by every open
/// file's handle.
pub struct Filesystem {
    cache: Arc<BlockCache>,
    #[allow(dead_code)]
    device: Arc<dyn BlockDevice>,
    sb: SuperBlock,
    layout: Layout,
    root_inum: u32,
    root_inode: Mutex<DiskInode>,
    open_table: Mutex<HashMap<u16, OpenSlot>>,
}

impl Filesystem {
    /// Reads the superblock, walks the root directory and pre-populates
    /// the open-file table.
    pub fn mount(device: Arc<dyn BlockDevice>) -> Result<Arc<Self>> {
        device.open()?;
        let cache = Arc::new(BlockCache::new(device.clone()));
        let sb = Self::read_superblock(&cache)?;
        let layout = Layout::from_superblock(&sb);

        let fs = Arc::new(Filesystem {
            cache,
            device,
            root_inum: sb.root_directory_inode as u32,
            sb,
            layout,
            root_inode: Mutex::new(DiskInode::default()),
            open_table: Mutex::new(HashMap::new()),
        });

        let root = fs.read_inode(fs.root_inum)?;
        *fs.root_inode.lock().unwrap() = root;
        fs.populate_open_table()?;
        Ok(fs)
    }

    fn read_superblock(cache: &Arc<BlockCache>) -> Result<SuperBlock> {
        let h = cache.get(0)?;
        let sb = unsafe { ptr::read_unaligned(h.data().as_ptr() as *const SuperBlock) };
        if sb.block_count == 0 || sb.inode_block_count == 0 || sb.data_bitmap_block_count == 0 {
            return Err(KernelError::BadFormat);
        }
        Ok(sb)
    }

    fn populate_open_table(&self) -> Result<()> {
        let count = self.dirent_count();
        let mut table = self.open_table.lock().unwrap();
        for i in 0..count {
            let entry = self.read_dirent(i)?;
            if entry.name[0] == 0 {
                continue;
            }
            let inode = self.read_inode(entry.inum as u32)?;
            table.insert(
                entry.inum,
                OpenSlot {
                    name: entry.name,
                    inode,
                    opened: false,
                    pos: 0,
                },
            );
        }
        Ok(())
    }

    fn abs(&self, rel: u32) -> u64 {
        (self.layout.data_area_start as u64 + rel as u64) * BSIZE as u64
    }

    // ---- inode area ----

    fn read_inode(&self, inum: u32) -> Result<DiskInode> {
        let block = self.layout.inode_area_start + inum / IPB_INODE;
        let offset = (inum % IPB_INODE) as usize * size_of::<DiskInode>();
        let h = self.cache.get(block as u64 * BSIZE as u64)?;
        let inode = unsafe { ptr::read_unaligned(h.data()[offset..].as_ptr() as *const DiskInode) };
        Ok(inode)
    }

    fn write_inode(&self, inum: u32, inode: &DiskInode) -> Result<()> {
        let block = self.layout.inode_area_start + inum / IPB_INODE;
        let offset = (inum % IPB_INODE) as usize * size_of::<DiskInode>();
        let mut h = self.cache.get(block as u64 * BSIZE as u64)?;
        unsafe {
            ptr::write_unaligned(h.data_mut()[offset..].as_mut_ptr() as *mut DiskInode, *inode);
        }
        h.mark_dirty();
        Ok(())
    }

    // ---- bitmaps ----

    fn bitmap_test(&self, bitmap_start: u32, bit: u32) -> Result<bool> {
        let block = bitmap_start + bit / (BSIZE as u32 * 8);
        let byte = (bit / 8) % BSIZE as u32;
        let mask = 1u8 << (bit % 8);
        let h = self.cache.get(block as u64 * BSIZE as u64)?;
        Ok(h.data()[byte as usize] & mask != 0)
    }

    fn bitmap_set(&self, bitmap_start: u32, bit: u32, value: bool) -> Result<()> {
        let block = bitmap_start + bit / (BSIZE as u32 * 8);
        let byte = (bit / 8) % BSIZE as u32;
        let mask = 1u8 << (bit % 8);
        let mut h = self.cache.get(block as u64 * BSIZE as u64)?;
        if value {
            h.data_mut()[byte as usize] |= mask;
        } else {
            h.data_mut()[byte as usize] &= !mask;
        }
        h.mark_dirty();
        Ok(())
    }

    fn bitmap_alloc(&self, bitmap_start: u32, start_bit: u32, count: u32, err: KernelError) -> Result<u32> {
        for bit in start_bit..count {
            if !self.bitmap_test(bitmap_start, bit)? {
                self.bitmap_set(bitmap_start, bit, true)?;
                return Ok(bit);
            }
        }
        Err(err)
    }

    fn alloc_inode(&self) -> Result<u32> {
        self.bitmap_alloc(
            self.layout.inode_bitmap_start,
            0,
            self.sb.inode_block_count * IPB_INODE,
            KernelError::NoFreeInode,
        )
    }

    /// Relative data block 0 is never handed out: a `DiskInode` pointer
    /// field uses 0 to mean "not yet allocated", so block 0 has to stay
    /// reserved to keep that sentinel unambiguous.
    fn alloc_data_block(&self) -> Result<u32> {
        self.bitmap_alloc(
            self.layout.data_bitmap_start,
            1,
            self.layout.data_block_count,
            KernelError::NoFreeDataBlock,
        )
    }

    fn free_data_block(&self, rel: u32) -> Result<()> {
        self.bitmap_set(self.layout.data_bitmap_start, rel, false)
    }

    fn zero_block(&self, rel: u32) -> Result<()> {
        let mut h = self.cache.get(self.abs(rel))?;
        h.data_mut().fill(0);
        h.mark_dirty();
        Ok(())
    }

    // ---- inode addressing (§4.C) ----

    /// Reads (or, when `alloc`, allocates) the entry at `idx` inside the
    /// indirection block `spine_rel`. Used for the single indirect level
    /// and for both levels of the double indirect.
    fn entry_in_block(&self, spine_rel: u32, idx: usize, alloc: bool) -> Result<u32> {
        let pos = self.abs(spine_rel);
        let existing = {
            let h = self.cache.get(pos)?;
            u32::from_le_bytes(h.data()[idx * 4..idx * 4 + 4].try_into().unwrap())
        };
        if existing != 0 {
            return Ok(existing);
        }
        if !alloc {
            return Err(KernelError::BadFormat);
        }
        let new_rel = self.alloc_data_block()?;
        self.zero_block(new_rel)?;
        let mut h = self.cache.get(pos)?;
        h.data_mut()[idx * 4..idx * 4 + 4].copy_from_slice(&new_rel.to_le_bytes());
        h.mark_dirty();
        Ok(new_rel)
    }

    /// Resolves in-file block index `k` to a data-area-relative block
    /// number, allocating along the way when `alloc` is set.
    fn map_block(&self, inode: &mut DiskInode, k: usize, alloc: bool) -> Result<u32> {
        if k >= crate::param::MAXFILE {
            return Err(KernelError::InvalidArgument);
        }

        if k < NDIRECT {
            if inode.direct[k] == 0 {
                if !alloc {
                    return Err(KernelError::BadFormat);
                }
                let b = self.alloc_data_block()?;
                self.zero_block(b)?;
                inode.direct[k] = b;
            }
            return Ok(inode.direct[k]);
        }

        let k1 = k - NDIRECT;
        if k1 < NINDIRECT {
            if inode.indirect == 0 {
                if !alloc {
                    return Err(KernelError::BadFormat);
                }
                let b = self.alloc_data_block()?;
                self.zero_block(b)?;
                inode.indirect = b;
            }
            return self.entry_in_block(inode.indirect, k1, alloc);
        }

        let k2 = k1 - NINDIRECT;
        let which = k2 / PTRS_PER_DINDIRECT;
        if which >= inode.dindirect.len() {
            return Err(KernelError::InvalidArgument);
        }
        let k3 = k2 % PTRS_PER_DINDIRECT;
        if inode.dindirect[which] == 0 {
            if !alloc {
                return Err(KernelError::BadFormat);
            }
            let b = self.alloc_data_block()?;
            self.zero_block(b)?;
            inode.dindirect[which] = b;
        }
        let l1 = k3 / IPB;
        let l2 = k3 % IPB;
        let l1_block = self.entry_in_block(inode.dindirect[which], l1, alloc)?;
        self.entry_in_block(l1_block, l2, alloc)
    }

    /// Frees every block reachable from `inode`, including spine blocks.
    fn free_all_blocks(&self, inode: &DiskInode) -> Result<()> {
        for &rel in &inode.direct {
            if rel != 0 {
                self.free_data_block(rel)?;
            }
        }
        if inode.indirect != 0 {
            self.free_indirect_tree(inode.indirect, 1)?;
        }
        for &rel in &inode.dindirect {
            if rel != 0 {
                self.free_indirect_tree(rel, 2)?;
            }
        }
        Ok(())
    }

    fn free_indirect_tree(&self, rel: u32, levels: u32) -> Result<()> {
        let pos = self.abs(rel);
        let mut children = [0u32; IPB];
        {
            let h = self.cache.get(pos)?;
            for (i, slot) in children.iter_mut().enumerate() {
                *slot = u32::from_le_bytes(h.data()[i * 4..i * 4 + 4].try_into().unwrap());
            }
        }
        for &child in &children {
            if child == 0 {
                continue;
            }
            if levels > 1 {
                self.free_indirect_tree(child, levels - 1)?;
            } else {
                self.free_data_block(child)?;
            }
        }
        self.free_data_block(rel)
    }

    // ---- root directory ----

    fn dirent_count(&self) -> u64 {
        self.root_inode.lock().unwrap().size as u64 / size_of::<DirEntry>() as u64
    }

    fn read_dirent(&self, idx: u64) -> Result<DirEntry> {
        let pos = idx * size_of::<DirEntry>() as u64;
        let k = pos as usize / BSIZE;
        let off = pos as usize % BSIZE;
        let rel = {
            let mut root = self.root_inode.lock().unwrap();
            self.map_block(&mut root, k, false)?
        };
        let h = self.cache.get(self.abs(rel))?;
        Ok(DirEntry::from_bytes(
            &h.data()[off..off + size_of::<DirEntry>()],
        ))
    }

    fn write_dirent(&self, idx: u64, entry: &DirEntry) -> Result<()> {
        let pos = idx * size_of::<DirEntry>() as u64;
        let k = pos as usize / BSIZE;
        let off = pos as usize % BSIZE;
        let rel = {
            let mut root = self.root_inode.lock().unwrap();
            self.map_block(&mut root, k, false)?
        };
        let mut h = self.cache.get(self.abs(rel))?;
        h.data_mut()[off..off + size_of::<DirEntry>()].copy_from_slice(&entry.to_bytes());
        h.mark_dirty();
        Ok(())
    }

    fn append_dirent(&self, entry: &DirEntry) -> Result<()> {
        let mut root = self.root_inode.lock().unwrap();
        let pos = root.size as u64;
        let k = pos as usize / BSIZE;
        let off = pos as usize % BSIZE;
        let rel = self.map_block(&mut root, k, true)?;
        {
            let mut h = self.cache.get(self.abs(rel))?;
            h.data_mut()[off..off + size_of::<DirEntry>()].copy_from_slice(&entry.to_bytes());
            h.mark_dirty();
        }
        root.size += size_of::<DirEntry>() as u32;
        self.write_inode(self.root_inum, &root)
    }

    /// Removes the last directory entry, shrinking the root by one slot.
    /// Spine (indirect/double-indirect) blocks of the root directory are
    /// never reclaimed by this, only the final data block when it falls
    /// completely out of range — directories small enough for everyday
    /// use never allocate spine blocks in the first place.
    fn truncate_last_dirent(&self) -> Result<()> {
        let mut root = self.root_inode.lock().unwrap();
        let old_size = root.size as u64;
        let new_size = old_size - size_of::<DirEntry>() as u64;
        if new_size % BSIZE as u64 == 0 && new_size < old_size {
            let k = (new_size as usize) / BSIZE;
            if k < NDIRECT && root.direct[k] != 0 {
                let rel = root.direct[k];
                root.direct[k] = 0;
                self.free_data_block(rel)?;
            }
        }
        root.size = new_size as u32;
        self.write_inode(self.root_inum, &root)
    }

    fn find_by_name(table: &HashMap<u16, OpenSlot>, name: &str) -> Option<u16> {
        table
            .iter()
            .find(|(_, slot)| slot.name_string() == name)
            .map(|(&inum, _)| inum)
    }

    // ---- public filesystem operations (§4.C) ----

    pub fn create(&self, name: &str) -> Result<()> {
        if name.is_empty() || name.len() > DIRNAME_MAX {
            return Err(KernelError::InvalidArgument);
        }

        let mut table = self.open_table.lock().unwrap();
        if Self::find_by_name(&table, name).is_some() {
            return Err(KernelError::AlreadyExists);
        }

        let inum = self.alloc_inode()?;
        let blank = DiskInode::default();
        self.write_inode(inum, &blank)?;

        let mut name_bytes = [0u8; DIRNAME_MAX];
        name_bytes[..name.len()].copy_from_slice(name.as_bytes());
        let entry = DirEntry {
            name: name_bytes,
            inum: inum as u16,
            _reserved: 0,
        };
        self.append_dirent(&entry)?;

        table.insert(
            inum as u16,
            OpenSlot {
                name: name_bytes,
                inode: blank,
                opened: false,
                pos: 0,
            },
        );
        Ok(())
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        let mut table = self.open_table.lock().unwrap();
        let inum = Self::find_by_name(&table, name).ok_or(KernelError::NotFound)?;
        if table.get(&inum).unwrap().opened {
            return Err(KernelError::Busy);
        }
        let slot = table.remove(&inum).unwrap();
        drop(table);

        self.free_all_blocks(&slot.inode)?;
        self.bitmap_set(self.layout.inode_bitmap_start, inum as u32, false)?;

        let count = self.dirent_count();
        let mut target = None;
        for i in 0..count {
            if self.read_dirent(i)?.name_string() == name {
                target = Some(i);
                break;
            }
        }
        let idx = target.ok_or(KernelError::NotFound)?;
        let last = count - 1;
        if idx != last {
            let last_entry = self.read_dirent(last)?;
            self.write_dirent(idx, &last_entry)?;
        }
        self.truncate_last_dirent()
    }

    pub fn open(self: &Arc<Self>, name: &str) -> Result<Handle> {
        let mut table = self.open_table.lock().unwrap();
        let inum = Self::find_by_name(&table, name).ok_or(KernelError::NotFound)?;
        let slot = table.get_mut(&inum).unwrap();
        if slot.opened {
            return Err(KernelError::Busy);
        }
        slot.opened = true;
        slot.pos = 0;
        drop(table);

        Ok(Handle::new(Arc::new(FileBackend {
            fs: self.clone(),
            inum,
        })))
    }

    pub fn list_root(&self) -> Vec<String> {
        self.open_table
            .lock()
            .unwrap()
            .values()
            .map(OpenSlot::name_string)
            .collect()
    }

    pub fn flush(&self) -> Result<()> {
        self.cache.flush()
    }

    fn close_inode(&self, inum: u16) -> Result<()> {
        if let Some(slot) = self.open_table.lock().unwrap().get_mut(&inum) {
            slot.opened = false;
            slot.pos = 0;
        }
        Ok(())
    }

    fn read_file(&self, inum: u16, buf: &mut [u8]) -> Result<usize> {
        let mut table = self.open_table.lock().unwrap();
        let slot = table.get_mut(&inum).ok_or(KernelError::NotFound)?;

        let size = slot.inode.size as u64;
        if slot.pos >= size {
            return Ok(0);
        }
        let n = (buf.len() as u64).min(size - slot.pos) as usize;

        let mut done = 0usize;
        while done < n {
            let file_pos = slot.pos as usize + done;
            let k = file_pos / BSIZE;
            let off = file_pos % BSIZE;
            let rel = self.map_block(&mut slot.inode, k, false)?;
            let h = self.cache.get(self.abs(rel))?;
            let take = (BSIZE - off).min(n - done);
            buf[done..done + take].copy_from_slice(&h.data()[off..off + take]);
            done += take;
        }
        slot.pos += done as u64;
        Ok(done)
    }

    fn write_file(&self, inum: u16, buf: &[u8]) -> Result<usize> {
        let mut table = self.open_table.lock().unwrap();
        let slot = table.get_mut(&inum).ok_or(KernelError::NotFound)?;

        let n = buf.len();
        let mut done = 0usize;
        while done < n {
            let file_pos = slot.pos + done as u64;
            let k = (file_pos as usize) / BSIZE;
            let off = (file_pos as usize) % BSIZE;
            let rel = self.map_block(&mut slot.inode, k, true)?;
            let take = (BSIZE - off).min(n - done);
            {
                let mut h = self.cache.get(self.abs(rel))?;
                h.data_mut()[off..off + take].copy_from_slice(&buf[done..done + take]);
                h.mark_dirty();
            }
            done += take;
            if file_pos + take as u64 > slot.inode.size as u64 {
                slot.inode.size = (file_pos + take as u64) as u32;
            }
        }
        slot.pos += done as u64;
        self.write_inode(inum as u32, &slot.inode)?;
        Ok(done)
    }

    fn control_file(&self, inum: u16, op: u32, arg: &mut u64) -> Result<()> {
        let mut table = self.open_table.lock().unwrap();
        let slot = table.get_mut(&inum).ok_or(KernelError::NotFound)?;

        match op {
            FCNTL_GETEND => {
                *arg = slot.inode.size as u64;
                Ok(())
            }
            FCNTL_SETEND => {
                let new_size = *arg;
                let old_size = slot.inode.size as u64;
                if new_size < old_size {
                    return Err(KernelError::NotSupported);
                }
                let mut pos = old_size;
                while pos < new_size {
                    let k = (pos as usize) / BSIZE;
                    let off = (pos as usize) % BSIZE;
                    let rel = self.map_block(&mut slot.inode, k, true)?;
                    let take = ((BSIZE - off) as u64).min(new_size - pos) as usize;
                    let mut h = self.cache.get(self.abs(rel))?;
                    h.data_mut()[off..off + take].fill(0);
                    h.mark_dirty();
                    pos += take as u64;
                }
                slot.inode.size = new_size as u32;
                self.write_inode(inum as u32, &slot.inode)
            }
            FCNTL_GETPOS => {
                *arg = slot.pos;
                Ok(())
            }
            FCNTL_SETPOS => {
                slot.pos = (*arg).min(slot.inode.size as u64);
                Ok(())
            }
            _ => Err(KernelError::NotSupported),
        }
    }
}

struct FileBackend {
    fs: Arc<Filesystem>,
    inum: u16,
}

impl IoBackend for FileBackend {
    fn close(&self) -> Result<()> {
        self.fs.close_inode(self.inum)
    }
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.fs.read_file(self.inum, buf)
    }
    fn write(&self, buf: &[u8]) -> Result<usize> {
        self.fs.write_file(self.inum, buf)
    }
    fn control(&self, op: u32, arg: &mut u64) -> Result<()> {
        self.fs.control_file(self.inum, op, arg)
    }
}

/// Registry of mounted filesystems. Exactly one mount is supported at a
/// time, matching the Non-goal of a single-volume filesystem.
#[derive(Default)]
pub struct MountRegistry {
    mount: Mutex<Option<(String, Arc<Filesystem>)>>,
}

impl MountRegistry {
    pub fn new() -> Self {
        Self {
            mount: Mutex::new(None),
        }
    }

    pub fn mount(&self, name: &str, device: Arc<dyn BlockDevice>) -> Result<Arc<Filesystem>> {
        let mut guard = self.mount.lock().unwrap();
        if guard.is_some() {
            return Err(KernelError::AlreadyExists);
        }
        let fs = Filesystem::mount(device)?;
        *guard = Some((name.to_string(), fs.clone()));
        Ok(fs)
    }

    pub fn get(&self, name: &str) -> Result<Arc<Filesystem>> {
        match &*self.mount.lock().unwrap() {
            Some((n, fs)) if n == name => Ok(fs.clone()),
            _ => Err(KernelError::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct VecDevice(StdMutex<Vec<u8>>);

    impl BlockDevice for VecDevice {
        fn block_size(&self) -> usize {
            BSIZE
        }
        fn open(&self) -> Result<()> {
            Ok(())
        }
        fn close(&self) -> Result<()> {
            Ok(())
        }
        fn fetch(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
            let data = self.0.lock().unwrap();
            let start = pos as usize;
            buf.copy_from_slice(&data[start..start + buf.len()]);
            Ok(buf.len())
        }
        fn store(&self, pos: u64, buf: &[u8]) -> Result<usize> {
            let mut data = self.0.lock().unwrap();
            let start = pos as usize;
            data[start..start + buf.len()].copy_from_slice(buf);
            Ok(buf.len())
        }
        fn control(&self, _op: crate::device::ControlOp, arg: &mut u64) -> Result<()> {
            *arg = self.0.lock().unwrap().len() as u64;
            Ok(())
        }
    }

    /// Builds a blank image: superblock + root inode marked allocated,
    /// everything else zeroed.
    fn blank_image(blocks: usize) -> Arc<dyn BlockDevice> {
        let mut bytes = vec![0u8; blocks * BSIZE];
        let sb = SuperBlock {
            block_count: blocks as u32,
            inode_bitmap_block_count: 1,
            data_bitmap_block_count: 1,
            inode_block_count: 2,
            root_directory_inode: 0,
            reserved: [0; 3],
        };
        unsafe {
            ptr::write_unaligned(bytes.as_mut_ptr() as *mut SuperBlock, sb);
        }
        // mark inode 0 (root) allocated in the inode bitmap (block 1)
        bytes[BSIZE] |= 1;
        Arc::new(VecDevice(StdMutex::new(bytes)))
    }

    #[test]
    fn mount_empty_image() {
        let fs = Filesystem::mount(blank_image(64)).unwrap();
        assert!(fs.list_root().is_empty());
    }

    #[test]
    fn create_write_read_roundtrip() {
        let fs = Filesystem::mount(blank_image(64)).unwrap();
        fs.create("hello.txt").unwrap();

        let h = fs.open("hello.txt").unwrap();
        h.write(b"Hello, world!").unwrap();
        drop(h);

        let h = fs.open("hello.txt").unwrap();
        let mut buf = [0u8; 13];
        let n = h.read(&mut buf).unwrap();
        assert_eq!(n, 13);
        assert_eq!(&buf, b"Hello, world!");

        let mut size = 0u64;
        h.control(FCNTL_GETEND, &mut size).unwrap();
        assert_eq!(size, 13);
    }

    #[test]
    fn double_open_is_busy() {
        let fs = Filesystem::mount(blank_image(64)).unwrap();
        fs.create("a").unwrap();
        let _h1 = fs.open("a").unwrap();
        assert_eq!(fs.open("a").unwrap_err(), KernelError::Busy);
    }

    #[test]
    fn delete_then_open_not_found() {
        let fs = Filesystem::mount(blank_image(64)).unwrap();
        fs.create("a").unwrap();
        fs.delete("a").unwrap();
        assert_eq!(fs.open("a").unwrap_err(), KernelError::NotFound);
        assert!(fs.list_root().is_empty());
    }

    #[test]
    fn set_end_zero_fills_tail() {
        let fs = Filesystem::mount(blank_image(64)).unwrap();
        fs.create("a").unwrap();
        let h = fs.open("a").unwrap();
        h.write(b"ab").unwrap();
        let mut arg = 8u64;
        h.control(FCNTL_SETEND, &mut arg).unwrap();

        let mut pos = 0u64;
        h.control(FCNTL_SETPOS, &mut pos).unwrap();
        let mut buf = [0xffu8; 8];
        let n = h.read(&mut buf).unwrap();
        assert_eq!(n, 8);
        assert_eq!(&buf, b"ab\0\0\0\0\0\0");
    }

    #[test]
    fn write_spans_direct_and_indirect_blocks() {
        // data area has plenty of room: 256 blocks, well past NDIRECT.
        let fs = Filesystem::mount(blank_image(512)).unwrap();
        fs.create("big.bin").unwrap();
        let h = fs.open("big.bin").unwrap();

        let total = (NDIRECT + 4) * BSIZE;
        let payload: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
        let written = h.write(&payload).unwrap();
        assert_eq!(written, total);

        let mut pos = 0u64;
        h.control(FCNTL_SETPOS, &mut pos).unwrap();
        let mut back = vec![0u8; total];
        let mut off = 0;
        while off < total {
            let n = h.read(&mut back[off..]).unwrap();
            assert!(n > 0);
            off += n;
        }
        assert_eq!(back, payload);
    }
}
