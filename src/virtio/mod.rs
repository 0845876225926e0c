//! virtio-blk driver.
//!
//! Implements the legacy three-descriptor-chain request format from
//! section 5.2 of the VirtIO 1.1 spec, over queue 0 only. Register access
//! is abstracted behind [`DeviceIo`] so the ring protocol logic can be
//! driven by either real MMIO ([`mmio::MmioDeviceIo`]) or a synchronous
//! software device model ([`loopback::LoopbackDeviceIo`]) for tests.

pub mod loopback;
pub mod mmio;

use std::sync::{Arc, Condvar, Mutex};

use log::{debug, trace, warn};

use crate::device::{BlockDevice, ControlOp};
use crate::error::{KernelError, Result};
use crate::param::{BSIZE, NUM};

// virtio mmio control registers, mapped starting at the device's base
// address. from qemu virtio_mmio.h
pub const VIRTIO_MMIO_MAGIC_VALUE: usize = 0x000; // 0x74726976
pub const VIRTIO_MMIO_VERSION: usize = 0x004; // version; should be 2
pub const VIRTIO_MMIO_DEVICE_ID: usize = 0x008; // device type; 1 is net, 2 is disk
pub const VIRTIO_MMIO_VENDOR_ID: usize = 0x00c; // 0x554d4551
pub const VIRTIO_MMIO_DEVICE_FEATURES: usize = 0x010;
pub const VIRTIO_MMIO_DRIVER_FEATURES: usize = 0x020;
pub const VIRTIO_MMIO_QUEUE_SEL: usize = 0x030; // select queue, write-only
pub const VIRTIO_MMIO_QUEUE_NUM_MAX: usize = 0x034; // max size of current queue, read-only
pub const VIRTIO_MMIO_QUEUE_NUM: usize = 0x038; // size of current queue, write-only
pub const VIRTIO_MMIO_QUEUE_READY: usize = 0x044; // ready bit
pub const VIRTIO_MMIO_QUEUE_NOTIFY: usize = 0x050; // write-only
pub const VIRTIO_MMIO_INTERRUPT_STATUS: usize = 0x060; // read-only
pub const VIRTIO_MMIO_INTERRUPT_ACK: usize = 0x064; // write-only
pub const VIRTIO_MMIO_STATUS: usize = 0x070; // read/write
pub const VIRTIO_MMIO_QUEUE_DESC_LOW: usize = 0x080; // descriptor table addr, write-only
pub const VIRTIO_MMIO_QUEUE_DESC_HIGH: usize = 0x084;
pub const VIRTIO_MMIO_DRIVER_DESC_LOW: usize = 0x090; // avail ring addr, write-only
pub const VIRTIO_MMIO_DRIVER_DESC_HIGH: usize = 0x094;
pub const VIRTIO_MMIO_DEVICE_DESC_LOW: usize = 0x0a0; // used ring addr, write-only
pub const VIRTIO_MMIO_DEVICE_DESC_HIGH: usize = 0x0a4;

// status register bits, from qemu virtio_config.h
const VIRTIO_CONFIG_S_ACKNOWLEDGE: u32 = 1;
const VIRTIO_CONFIG_S_DRIVER: u32 = 2;
const VIRTIO_CONFIG_S_DRIVER_OK: u32 = 4;
const VIRTIO_CONFIG_S_FEATURES_OK: u32 = 8;

// device feature bits
const VIRTIO_BLK_F_RO: u32 = 5;
const VIRTIO_BLK_F_SCSI: u32 = 7;
const VIRTIO_BLK_F_CONFIG_WCE: u32 = 11;
const VIRTIO_BLK_F_MQ: u32 = 12;
const VIRTIO_F_ANY_LAYOUT: u32 = 27;
const VIRTIO_RING_F_INDIRECT_DESC: u32 = 28;
const VIRTIO_RING_F_EVENT_IDX: u32 = 29;

const VRING_DESC_F_NEXT: u16 = 1;
const VRING_DESC_F_WRITE: u16 = 2;

const VIRTIO_BLK_T_IN: u32 = 0;
const VIRTIO_BLK_T_OUT: u32 = 1;

/// Abstracts the device's memory-mapped register file so the ring
/// protocol above can be exercised without real hardware.
pub trait DeviceIo: Send + Sync {
    fn read32(&self, reg: usize) -> u32;
    fn write32(&self, reg: usize, value: u32);
    /// Device capacity in 512-byte sectors, as read from the virtio-blk
    /// config space (offset 0x100, field `capacity`).
    fn capacity_sectors(&self) -> u64;
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct VirtqDesc {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

#[repr(C)]
struct VirtqAvail {
    flags: u16,
    idx: u16,
    ring: [u16; NUM],
    unused: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct VirtqUsedElem {
    id: u32,
    len: u32,
}

#[repr(C)]
struct VirtqUsed {
    flags: u16,
    idx: u16,
    ring: [VirtqUsedElem; NUM],
}

/// The format of the first descriptor in a disk request. Followed by two
/// more descriptors containing the block data and a one-byte status.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct BlockReq {
    r#type: u32,
    reserved: u32,
    sector: u64,
}

#[derive(Debug, Clone, Copy)]
struct Info {
    status: u8,
    done: bool,
}

struct State {
    desc: Box<[VirtqDesc; NUM]>,
    avail: Box<VirtqAvail>,
    used: Box<VirtqUsed>,
    free: [bool; NUM],
    used_idx: u16,
    info: [Info; NUM],
    ops: [BlockReq; NUM],
}

impl State {
    fn alloc_desc(&mut self) -> Option<usize> {
        self.free.iter_mut().position(|f| {
            if *f {
                *f = false;
                true
            } else {
                false
            }
        })
    }

    fn free_desc(&mut self, i: usize) {
        self.desc[i] = VirtqDesc {
            addr: 0,
            len: 0,
            flags: 0,
            next: 0,
        };
        self.free[i] = true;
    }

    fn free_chain(&mut self, mut i: usize) {
        loop {
            let flags = self.desc[i].flags;
            let next = self.desc[i].next;
            self.free_desc(i);
            if flags & VRING_DESC_F_NEXT != 0 {
                i = next as usize;
            } else {
                break;
            }
        }
    }

    fn alloc3_desc(&mut self) -> Option<[usize; 3]> {
        let a = self.alloc_desc()?;
        let b = match self.alloc_desc() {
            Some(b) => b,
            None => {
                self.free_desc(a);
                return None;
            }
        };
        let c = match self.alloc_desc() {
            Some(c) => c,
            None => {
                self.free_desc(a);
                self.free_desc(b);
                return None;
            }
        };
        Some([a, b, c])
    }
}

/// virtio-blk driver, generic over how its registers are reached.
pub struct VirtioBlockDevice<T: DeviceIo> {
    io: T,
    state: Mutex<State>,
    cond: Condvar,
    capacity: u64,
}

impl<T: DeviceIo> VirtioBlockDevice<T> {
    /// Performs the attach handshake (sections 3.1/4.2.3 of the spec) and
    /// returns a ready-to-use driver.
    pub fn init(io: T) -> Result<Arc<Self>> {
        if io.read32(VIRTIO_MMIO_MAGIC_VALUE) != 0x7472_6976
            || io.read32(VIRTIO_MMIO_VERSION) != 2
            || io.read32(VIRTIO_MMIO_DEVICE_ID) != 2
            || io.read32(VIRTIO_MMIO_VENDOR_ID) != 0x554d_4551
        {
            warn!("virtio: device signature mismatch");
            return Err(KernelError::IoError);
        }

        let mut status: u32 = 0;
        io.write32(VIRTIO_MMIO_STATUS, status);

        status |= VIRTIO_CONFIG_S_ACKNOWLEDGE;
        io.write32(VIRTIO_MMIO_STATUS, status);

        status |= VIRTIO_CONFIG_S_DRIVER;
        io.write32(VIRTIO_MMIO_STATUS, status);

        let mut features = io.read32(VIRTIO_MMIO_DEVICE_FEATURES);
        features &= !(1 << VIRTIO_BLK_F_RO);
        features &= !(1 << VIRTIO_BLK_F_SCSI);
        features &= !(1 << VIRTIO_BLK_F_CONFIG_WCE);
        features &= !(1 << VIRTIO_BLK_F_MQ);
        features &= !(1 << VIRTIO_F_ANY_LAYOUT);
        features &= !(1 << VIRTIO_RING_F_EVENT_IDX);
        features &= !(1 << VIRTIO_RING_F_INDIRECT_DESC);
        io.write32(VIRTIO_MMIO_DRIVER_FEATURES, features);

        status |= VIRTIO_CONFIG_S_FEATURES_OK;
        io.write32(VIRTIO_MMIO_STATUS, status);

        if io.read32(VIRTIO_MMIO_STATUS) & VIRTIO_CONFIG_S_FEATURES_OK == 0 {
            warn!("virtio: feature negotiation rejected");
            return Err(KernelError::IoError);
        }

        io.write32(VIRTIO_MMIO_QUEUE_SEL, 0);
        if io.read32(VIRTIO_MMIO_QUEUE_READY) != 0 {
            warn!("virtio: queue 0 already in use");
            return Err(KernelError::IoError);
        }

        let max = io.read32(VIRTIO_MMIO_QUEUE_NUM_MAX);
        if max == 0 || (max as usize) < NUM {
            warn!("virtio: queue 0 too short");
            return Err(KernelError::IoError);
        }
        io.write32(VIRTIO_MMIO_QUEUE_NUM, NUM as u32);

        let desc = Box::new(
            [VirtqDesc {
                addr: 0,
                len: 0,
                flags: 0,
                next: 0,
            }; NUM],
        );
        let avail = Box::new(VirtqAvail {
            flags: 0,
            idx: 0,
            ring: [0; NUM],
            unused: 0,
        });
        let used = Box::new(VirtqUsed {
            flags: 0,
            idx: 0,
            ring: [VirtqUsedElem { id: 0, len: 0 }; NUM],
        });

        let desc_addr = desc.as_ref() as *const _ as usize;
        io.write32(VIRTIO_MMIO_QUEUE_DESC_LOW, desc_addr as u32);
        io.write32(VIRTIO_MMIO_QUEUE_DESC_HIGH, (desc_addr >> 32) as u32);

        let avail_addr = avail.as_ref() as *const _ as usize;
        io.write32(VIRTIO_MMIO_DRIVER_DESC_LOW, avail_addr as u32);
        io.write32(VIRTIO_MMIO_DRIVER_DESC_HIGH, (avail_addr >> 32) as u32);

        let used_addr = used.as_ref() as *const _ as usize;
        io.write32(VIRTIO_MMIO_DEVICE_DESC_LOW, used_addr as u32);
        io.write32(VIRTIO_MMIO_DEVICE_DESC_HIGH, (used_addr >> 32) as u32);

        io.write32(VIRTIO_MMIO_QUEUE_READY, 1);

        status |= VIRTIO_CONFIG_S_DRIVER_OK;
        io.write32(VIRTIO_MMIO_STATUS, status);

        let capacity = io.capacity_sectors() * 512;
        debug!("virtio: attached, capacity {capacity} bytes");

        Ok(Arc::new(VirtioBlockDevice {
            io,
            capacity,
            state: Mutex::new(State {
                desc,
                avail,
                used,
                free: [true; NUM],
                used_idx: 0,
                info: [Info {
                    status: 0,
                    done: false,
                }; NUM],
                ops: [BlockReq {
                    r#type: 0,
                    reserved: 0,
                    sector: 0,
                }; NUM],
            }),
            cond: Condvar::new(),
        }))
    }

    /// Issues one request (read if `write` is false) and blocks until it
    /// completes.
    fn rw(&self, pos: u64, buf_ptr: *mut u8, write: bool) -> Result<usize> {
        let mut guard = self.state.lock().unwrap();
        let ids = loop {
            if let Some(ids) = guard.alloc3_desc() {
                break ids;
            }
            guard = self.cond.wait(guard).unwrap();
        };

        let sector = pos / 512;
        guard.ops[ids[0]] = BlockReq {
            r#type: if write { VIRTIO_BLK_T_OUT } else { VIRTIO_BLK_T_IN },
            reserved: 0,
            sector,
        };

        let op_addr = &guard.ops[ids[0]] as *const _ as u64;
        guard.desc[ids[0]] = VirtqDesc {
            addr: op_addr,
            len: size_of::<BlockReq>() as u32,
            flags: VRING_DESC_F_NEXT,
            next: ids[1] as u16,
        };
        guard.desc[ids[1]] = VirtqDesc {
            addr: buf_ptr as u64,
            len: BSIZE as u32,
            flags: VRING_DESC_F_NEXT | if write { 0 } else { VRING_DESC_F_WRITE },
            next: ids[2] as u16,
        };

        guard.info[ids[0]].status = 0xff;
        guard.info[ids[0]].done = false;
        let status_addr = &guard.info[ids[0]].status as *const _ as u64;
        guard.desc[ids[2]] = VirtqDesc {
            addr: status_addr,
            len: 1,
            flags: VRING_DESC_F_WRITE,
            next: 0,
        };

        let avail_slot = guard.avail.idx as usize % NUM;
        guard.avail.ring[avail_slot] = ids[0] as u16;
        guard.avail.idx = guard.avail.idx.wrapping_add(1);

        drop(guard);
        self.io.write32(VIRTIO_MMIO_QUEUE_NOTIFY, 0);

        let mut guard = self.state.lock().unwrap();
        while !guard.info[ids[0]].done {
            guard = self.cond.wait(guard).unwrap();
        }

        let status = guard.info[ids[0]].status;
        guard.free_chain(ids[0]);
        drop(guard);
        self.cond.notify_all();

        if status != 0 {
            Err(KernelError::IoError)
        } else {
            Ok(BSIZE)
        }
    }

    /// Drains the used ring and wakes any request waiting on completion.
    /// Invoked by whatever delivers the device's interrupt: a real
    /// kernel's trap handler, or the loopback test double directly.
    pub fn handle_interrupt(&self) {
        let ack = self.io.read32(VIRTIO_MMIO_INTERRUPT_STATUS);
        self.io.write32(VIRTIO_MMIO_INTERRUPT_ACK, ack & 3);

        let mut guard = self.state.lock().unwrap();
        while guard.used_idx != guard.used.idx {
            let id = guard.used.ring[guard.used_idx as usize % NUM].id as usize;
            guard.info[id].done = true;
            guard.used_idx = guard.used_idx.wrapping_add(1);
            trace!("virtio: completed descriptor chain {id}");
        }
        drop(guard);
        self.cond.notify_all();
    }
}

impl<T: DeviceIo> BlockDevice for VirtioBlockDevice<T> {
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
        if pos as usize % BSIZE != 0 || buf.len() % BSIZE != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let remaining = self.capacity.saturating_sub(pos);
        let n = (buf.len() as u64).min(remaining) as usize;
        if n == 0 {
            return Ok(0);
        }
        for (i, chunk) in buf[..n].chunks_mut(BSIZE).enumerate() {
            self.rw(pos + (i * BSIZE) as u64, chunk.as_mut_ptr(), false)?;
        }
        Ok(n)
    }

    fn store(&self, pos: u64, buf: &[u8]) -> Result<usize> {
        if pos as usize % BSIZE != 0 || buf.len() % BSIZE != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let remaining = self.capacity.saturating_sub(pos);
        let n = (buf.len() as u64).min(remaining) as usize;
        if n == 0 {
            return Ok(0);
        }
        for (i, chunk) in buf[..n].chunks(BSIZE).enumerate() {
            self.rw(pos + (i * BSIZE) as u64, chunk.as_ptr() as *mut u8, true)?;
        }
        Ok(n)
    }

    fn control(&self, op: ControlOp, arg: &mut u64) -> Result<()> {
        match op {
            ControlOp::GetEnd => {
                *arg = self.capacity;
                Ok(())
            }
        }
    }
}

// SAFETY: the driver only ever touches the ring memory while holding
// `state`; the raw pointers stored in descriptors point at heap
// allocations (`desc`/`avail`/`used`/`ops`) owned by the same `State`.
unsafe impl<T: DeviceIo> Send for VirtioBlockDevice<T> {}
unsafe impl<T: DeviceIo> Sync for VirtioBlockDevice<T> {}
