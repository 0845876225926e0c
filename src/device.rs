//! Storage-interface vtable and the registry that publishes named devices
//! to the layers above them (the cache's backing device lookup at mount).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{KernelError, Result};
use crate::handle::{Handle, IoBackend};

/// Control operations a `BlockDevice` understands, per the `FCNTL_*`
/// family in the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    GetEnd,
}

/// Operations a block-addressed storage backend must provide. The cache
/// and filesystem depend on this trait only, never on a concrete driver.
pub trait BlockDevice: Send + Sync {
    /// Logical sector size in bytes.
    fn block_size(&self) -> usize;

    fn open(&self) -> Result<()>;
    fn close(&self) -> Result<()>;

    /// Reads `buf.len()` bytes starting at byte offset `pos`. `pos` and
    /// `buf.len()` must be multiples of `block_size()`.
    fn fetch(&self, pos: u64, buf: &mut [u8]) -> Result<usize>;

    /// Writes `buf.len()` bytes starting at byte offset `pos`. `pos` and
    /// `buf.len()` must be multiples of `block_size()`.
    fn store(&self, pos: u64, buf: &[u8]) -> Result<usize>;

    fn control(&self, op: ControlOp, arg: &mut u64) -> Result<()>;
}

/// Registry of named block devices. One filesystem mount looks its
/// backing device up here by name; multiple devices may be registered at
/// once even though only one mount is supported above it.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<String, Arc<dyn BlockDevice>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, name: &str, device: Arc<dyn BlockDevice>) -> Result<()> {
        let mut devices = self.devices.lock().unwrap();
        if devices.contains_key(name) {
            return Err(KernelError::AlreadyExists);
        }
        devices.insert(name.to_string(), device);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<dyn BlockDevice>> {
        self.devices
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or(KernelError::NotFound)
    }
}

/// Adapts a [`BlockDevice`] to [`IoBackend`] for callers that want a raw,
/// unbuffered handle to a device instead of going through the cache and
/// filesystem (used by the image-builder and by diagnostics).
struct RawDeviceBackend {
    device: Arc<dyn BlockDevice>,
    cursor: Mutex<u64>,
}

impl IoBackend for RawDeviceBackend {
    fn close(&self) -> Result<()> {
        self.device.close()
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut pos = self.cursor.lock().unwrap();
        let n = self.device.fetch(*pos, buf)?;
        *pos += n as u64;
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut pos = self.cursor.lock().unwrap();
        let n = self.device.store(*pos, buf)?;
        *pos += n as u64;
        Ok(n)
    }

    fn control(&self, op: u32, arg: &mut u64) -> Result<()> {
        match op {
            crate::fs::FCNTL_GETEND => self.device.control(ControlOp::GetEnd, arg),
            crate::fs::FCNTL_GETPOS => {
                *arg = *self.cursor.lock().unwrap();
                Ok(())
            }
            crate::fs::FCNTL_SETPOS => {
                *self.cursor.lock().unwrap() = *arg;
                Ok(())
            }
            _ => Err(KernelError::NotSupported),
        }
    }
}

/// Opens `device` for raw, unbuffered reads and writes at a private
/// cursor, bypassing the block cache and filesystem entirely.
pub fn open_raw(device: Arc<dyn BlockDevice>) -> Result<Handle> {
    device.open()?;
    Ok(Handle::new(Arc::new(RawDeviceBackend {
        device,
        cursor: Mutex::new(0),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullDevice;

    impl BlockDevice for NullDevice {
        fn block_size(&self) -> usize {
            512
        }
        fn open(&self) -> Result<()> {
            Ok(())
        }
        fn close(&self) -> Result<()> {
            Ok(())
        }
        fn fetch(&self, _pos: u64, buf: &mut [u8]) -> Result<usize> {
            buf.fill(0);
            Ok(buf.len())
        }
        fn store(&self, _pos: u64, buf: &[u8]) -> Result<usize> {
            Ok(buf.len())
        }
        fn control(&self, _op: ControlOp, arg: &mut u64) -> Result<()> {
            *arg = 4096;
            Ok(())
        }
    }

    #[test]
    fn registry_rejects_duplicate_names() {
        let registry = DeviceRegistry::new();
        registry.register("disk0", Arc::new(NullDevice)).unwrap();
        assert_eq!(
            registry
                .register("disk0", Arc::new(NullDevice))
                .unwrap_err(),
            KernelError::AlreadyExists
        );
    }

    #[test]
    fn raw_handle_advances_cursor() {
        let handle = open_raw(Arc::new(NullDevice)).unwrap();
        let mut buf = [0u8; 512];
        handle.read(&mut buf).unwrap();
        let mut pos = 0u64;
        handle.control(crate::fs::FCNTL_GETPOS, &mut pos).unwrap();
        assert_eq!(pos, 512);
    }
}
