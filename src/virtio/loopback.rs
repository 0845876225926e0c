//! Software device model for testing the ring protocol in [`super`]
//! without real hardware: a `DeviceIo` that processes a request
//! synchronously, inside the `QUEUE_NOTIFY` register write, against an
//! in-memory byte vector.

use std::sync::{Arc, Mutex, Weak};

use super::{
    BlockReq, DeviceIo, VIRTIO_MMIO_DEVICE_DESC_HIGH, VIRTIO_MMIO_DEVICE_DESC_LOW,
    VIRTIO_MMIO_DEVICE_FEATURES, VIRTIO_MMIO_DEVICE_ID, VIRTIO_MMIO_DRIVER_DESC_HIGH,
    VIRTIO_MMIO_DRIVER_DESC_LOW, VIRTIO_MMIO_INTERRUPT_ACK, VIRTIO_MMIO_INTERRUPT_STATUS,
    VIRTIO_MMIO_MAGIC_VALUE, VIRTIO_MMIO_QUEUE_DESC_HIGH, VIRTIO_MMIO_QUEUE_DESC_LOW,
    VIRTIO_MMIO_QUEUE_NOTIFY, VIRTIO_MMIO_QUEUE_NUM_MAX, VIRTIO_MMIO_QUEUE_READY,
    VIRTIO_MMIO_STATUS, VIRTIO_MMIO_VENDOR_ID, VIRTIO_MMIO_VERSION, VirtioBlockDevice, VirtqAvail,
    VirtqDesc, VirtqUsed, VirtqUsedElem,
};
use crate::param::NUM;

const VIRTIO_BLK_T_IN: u32 = 0;

#[derive(Default)]
struct Regs {
    status: u32,
    queue_ready: u32,
    interrupt_status: u32,
    desc_lo: u32,
    desc_hi: u32,
    avail_lo: u32,
    avail_hi: u32,
    used_lo: u32,
    used_hi: u32,
    last_avail_idx: u16,
}

/// A virtio-blk device model backed by a plain in-memory buffer. Used by
/// integration tests to drive the real ring-protocol driver end to end.
pub struct LoopbackDeviceIo {
    regs: Mutex<Regs>,
    storage: Mutex<Vec<u8>>,
    driver: Mutex<Option<Weak<VirtioBlockDevice<LoopbackDeviceIo>>>>,
}

impl LoopbackDeviceIo {
    pub fn new(capacity_bytes: usize) -> Self {
        LoopbackDeviceIo {
            regs: Mutex::new(Regs::default()),
            storage: Mutex::new(vec![0u8; capacity_bytes]),
            driver: Mutex::new(None),
        }
    }

    fn process_notify(&self) {
        let (desc_addr, avail_addr, used_addr) = {
            let regs = self.regs.lock().unwrap();
            (
                (regs.desc_lo as u64 | ((regs.desc_hi as u64) << 32)) as usize,
                (regs.avail_lo as u64 | ((regs.avail_hi as u64) << 32)) as usize,
                (regs.used_lo as u64 | ((regs.used_hi as u64) << 32)) as usize,
            )
        };

        // SAFETY: these addresses were handed to us by the driver's own
        // `init`, which allocated them as `Box<[...]>` kept alive for the
        // life of the `VirtioBlockDevice`; we only read/write the exact
        // repr(C) layouts it wrote there.
        let desc = unsafe { &*(desc_addr as *const [VirtqDesc; NUM]) };
        let avail = unsafe { &*(avail_addr as *const VirtqAvail) };
        let used = unsafe { &mut *(used_addr as *mut VirtqUsed) };

        let mut regs = self.regs.lock().unwrap();
        while regs.last_avail_idx != avail.idx {
            let head = avail.ring[regs.last_avail_idx as usize % NUM] as usize;
            let data_idx = desc[head].next as usize;
            let status_idx = desc[data_idx].next as usize;

            let header = unsafe { &*(desc[head].addr as *const BlockReq) };
            let sector = header.sector as usize;
            let data_addr = desc[data_idx].addr as usize;
            let data_len = desc[data_idx].len as usize;

            let ok = {
                let mut storage = self.storage.lock().unwrap();
                let start = sector * 512;
                if start + data_len > storage.len() {
                    false
                } else if header.r#type == VIRTIO_BLK_T_IN {
                    let dst = unsafe {
                        std::slice::from_raw_parts_mut(data_addr as *mut u8, data_len)
                    };
                    dst.copy_from_slice(&storage[start..start + data_len]);
                    true
                } else {
                    let src = unsafe {
                        std::slice::from_raw_parts(data_addr as *const u8, data_len)
                    };
                    storage[start..start + data_len].copy_from_slice(src);
                    true
                }
            };

            unsafe {
                *(desc[status_idx].addr as *mut u8) = if ok { 0 } else { 1 };
            }

            let used_slot = used.idx as usize % NUM;
            used.ring[used_slot] = VirtqUsedElem {
                id: head as u32,
                len: data_len as u32,
            };
            used.idx = used.idx.wrapping_add(1);

            regs.last_avail_idx = regs.last_avail_idx.wrapping_add(1);
        }
        regs.interrupt_status |= 1;
        drop(regs);

        if let Some(driver) = self.driver.lock().unwrap().as_ref().and_then(Weak::upgrade) {
            driver.handle_interrupt();
        }
    }
}

impl DeviceIo for LoopbackDeviceIo {
    fn read32(&self, reg: usize) -> u32 {
        match reg {
            VIRTIO_MMIO_MAGIC_VALUE => 0x7472_6976,
            VIRTIO_MMIO_VERSION => 2,
            VIRTIO_MMIO_DEVICE_ID => 2,
            VIRTIO_MMIO_VENDOR_ID => 0x554d_4551,
            VIRTIO_MMIO_DEVICE_FEATURES => 0,
            VIRTIO_MMIO_QUEUE_NUM_MAX => NUM as u32,
            VIRTIO_MMIO_QUEUE_READY => self.regs.lock().unwrap().queue_ready,
            VIRTIO_MMIO_STATUS => self.regs.lock().unwrap().status,
            VIRTIO_MMIO_INTERRUPT_STATUS => self.regs.lock().unwrap().interrupt_status,
            _ => 0,
        }
    }

    fn write32(&self, reg: usize, value: u32) {
        match reg {
            VIRTIO_MMIO_STATUS => self.regs.lock().unwrap().status = value,
            VIRTIO_MMIO_QUEUE_READY => self.regs.lock().unwrap().queue_ready = value,
            VIRTIO_MMIO_INTERRUPT_ACK => self.regs.lock().unwrap().interrupt_status &= !value,
            VIRTIO_MMIO_QUEUE_DESC_LOW => self.regs.lock().unwrap().desc_lo = value,
            VIRTIO_MMIO_QUEUE_DESC_HIGH => self.regs.lock().unwrap().desc_hi = value,
            VIRTIO_MMIO_DRIVER_DESC_LOW => self.regs.lock().unwrap().avail_lo = value,
            VIRTIO_MMIO_DRIVER_DESC_HIGH => self.regs.lock().unwrap().avail_hi = value,
            VIRTIO_MMIO_DEVICE_DESC_LOW => self.regs.lock().unwrap().used_lo = value,
            VIRTIO_MMIO_DEVICE_DESC_HIGH => self.regs.lock().unwrap().used_hi = value,
            VIRTIO_MMIO_QUEUE_NOTIFY => self.process_notify(),
            _ => {}
        }
    }

    fn capacity_sectors(&self) -> u64 {
        (self.storage.lock().unwrap().len() / 512) as u64
    }
}

/// Builds a loopback virtio-blk device of `capacity_bytes` and attaches
/// the driver to it, ready for `fetch`/`store`.
pub fn attach(capacity_bytes: usize) -> crate::error::Result<Arc<VirtioBlockDevice<LoopbackDeviceIo>>> {
    let io = LoopbackDeviceIo::new(capacity_bytes);
    let device = VirtioBlockDevice::init(io)?;
    *device.io.driver.lock().unwrap() = Some(Arc::downgrade(&device));
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BlockDevice, ControlOp};

    #[test]
    fn round_trip_single_block() {
        let dev = attach(64 * 512).unwrap();
        let mut out = [0u8; 512];
        out[0] = 7;
        dev.store(0, &out).unwrap();

        let mut back = [0u8; 512];
        dev.fetch(0, &mut back).unwrap();
        assert_eq!(back[0], 7);
    }

    #[test]
    fn reports_capacity() {
        let dev = attach(32 * 512).unwrap();
        let mut arg = 0u64;
        dev.control(ControlOp::GetEnd, &mut arg).unwrap();
        assert_eq!(arg, 32 * 512);
    }

    #[test]
    fn rejects_unaligned_offset() {
        let dev = attach(4 * 512).unwrap();
        let mut buf = [0u8; 512];
        assert!(dev.fetch(3, &mut buf).is_err());
    }
}
