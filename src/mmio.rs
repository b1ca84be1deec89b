//! Memory-mapped VirtIO transport.
//!
//! Implements [`Transport`] over the virtio-mmio register map, covering both
//! the legacy (version 1, page-frame queue interface) and the modern
//! (version 2, split address registers) variants. Register access is
//! bounds-checked volatile I/O; the device-specific configuration region
//! starts at offset 0x100 of the same window.

use core::marker::PhantomData;
use core::mem::size_of;
use core::ptr::NonNull;

use crate::platform::{PhysAddr, Platform};
use crate::transport::{DeviceStatus, QueueNotifier, Transport, TransportError};
use crate::PAGE_SIZE;

/// Memory-mapped configuration window for one VirtIO device.
#[derive(Clone, Copy, Debug)]
pub struct MmioConfig {
    base: NonNull<u8>,
    length: usize,
}

impl MmioConfig {
    /// # Safety
    ///
    /// Caller must ensure `base..base+length` is mapped as a VirtIO MMIO
    /// register window for the device's lifetime and that no other party
    /// performs conflicting register accesses.
    pub const unsafe fn new(base: NonNull<u8>, length: usize) -> Self {
        Self { base, length }
    }

    fn ptr<T>(&self, offset: usize) -> Result<*mut T, TransportError> {
        let width = size_of::<T>();
        let end = offset
            .checked_add(width)
            .ok_or(TransportError::RegisterOutOfRange { offset })?;
        if end > self.length {
            return Err(TransportError::RegisterOutOfRange { offset });
        }
        // SAFETY: the window covers offset..end per the check above.
        Ok(unsafe { self.base.as_ptr().add(offset) } as *mut T)
    }
}

/// Register-map implementation of [`Transport`].
pub struct MmioTransport<P: Platform> {
    cfg: MmioConfig,
    version: u32,
    device_id: u32,
    _platform: PhantomData<P>,
}

impl<P: Platform> MmioTransport<P> {
    const MAGIC_VALUE: u32 = 0x7472_6976;
    const HEADER_LEN: usize = 0x100;
    const VERSION_LEGACY: u32 = 1;
    const VERSION_MODERN: u32 = 2;

    const RESET_RETRIES: u32 = 1000;
    const RESET_POLL_DELAY_US: u32 = 10;

    const REG_MAGIC: usize = 0x000;
    const REG_VERSION: usize = 0x004;
    const REG_DEVICE_ID: usize = 0x008;
    const REG_DEVICE_FEATURES: usize = 0x010;
    const REG_DEVICE_FEATURES_SEL: usize = 0x014;
    const REG_DRIVER_FEATURES: usize = 0x020;
    const REG_DRIVER_FEATURES_SEL: usize = 0x024;
    const REG_GUEST_PAGE_SIZE: usize = 0x028;
    const REG_QUEUE_SEL: usize = 0x030;
    const REG_QUEUE_NUM_MAX: usize = 0x034;
    const REG_QUEUE_NUM: usize = 0x038;
    const REG_QUEUE_ALIGN: usize = 0x03c;
    const REG_QUEUE_PFN: usize = 0x040;
    const REG_QUEUE_READY: usize = 0x044;
    const REG_QUEUE_NOTIFY: usize = 0x050;
    const REG_INTERRUPT_STATUS: usize = 0x060;
    const REG_INTERRUPT_ACK: usize = 0x064;
    const REG_STATUS: usize = 0x070;
    const REG_QUEUE_DESC_LOW: usize = 0x080;
    const REG_QUEUE_DESC_HIGH: usize = 0x084;
    const REG_QUEUE_DRIVER_LOW: usize = 0x090;
    const REG_QUEUE_DRIVER_HIGH: usize = 0x094;
    const REG_QUEUE_DEVICE_LOW: usize = 0x0a0;
    const REG_QUEUE_DEVICE_HIGH: usize = 0x0a4;

    /// Attempt to build a transport around the provided register window.
    ///
    /// Verifies the magic value and revision; a window full of sentinel
    /// garbage fails here rather than surfacing later as ring corruption.
    pub fn from_config(cfg: MmioConfig) -> Result<Self, TransportError> {
        if cfg.length < Self::HEADER_LEN {
            return Err(TransportError::RegisterOutOfRange {
                offset: Self::HEADER_LEN,
            });
        }
        let probe = Self {
            cfg,
            version: 0,
            device_id: 0,
            _platform: PhantomData,
        };
        let magic = probe.read32(Self::REG_MAGIC)?;
        if magic != Self::MAGIC_VALUE {
            return Err(TransportError::BadMagic { found: magic });
        }
        let version = probe.read32(Self::REG_VERSION)?;
        if version != Self::VERSION_LEGACY && version != Self::VERSION_MODERN {
            return Err(TransportError::BadVersion { found: version });
        }
        let device_id = probe.read32(Self::REG_DEVICE_ID)?;

        let dev = Self {
            cfg,
            version,
            device_id,
            _platform: PhantomData,
        };
        if dev.is_legacy() {
            // The legacy queue interface expresses ring addresses in frames
            // of this size.
            dev.write32(Self::REG_GUEST_PAGE_SIZE, PAGE_SIZE as u32)?;
        }
        Ok(dev)
    }

    fn read32(&self, offset: usize) -> Result<u32, TransportError> {
        let ptr = self.cfg.ptr::<u32>(offset)?;
        // SAFETY: range checked by `ptr`.
        Ok(unsafe { core::ptr::read_volatile(ptr) })
    }

    fn write32(&self, offset: usize, value: u32) -> Result<(), TransportError> {
        let ptr = self.cfg.ptr::<u32>(offset)?;
        // SAFETY: range checked by `ptr`.
        unsafe { core::ptr::write_volatile(ptr, value) };
        Ok(())
    }

    fn write64(
        &self,
        low_offset: usize,
        high_offset: usize,
        addr: PhysAddr,
    ) -> Result<(), TransportError> {
        let raw = addr.as_u64();
        self.write32(low_offset, raw as u32)?;
        self.write32(high_offset, (raw >> 32) as u32)
    }
}

impl<P: Platform> QueueNotifier for MmioTransport<P> {
    fn notify_queue(&self, queue_index: u16) -> Result<(), TransportError> {
        self.write32(Self::REG_QUEUE_NOTIFY, queue_index as u32)
    }
}

impl<P: Platform> Transport for MmioTransport<P> {
    fn device_id(&self) -> u32 {
        self.device_id
    }

    fn is_legacy(&self) -> bool {
        self.version == Self::VERSION_LEGACY
    }

    fn reset(&self) -> Result<(), TransportError> {
        self.write32(Self::REG_STATUS, 0)?;
        for _ in 0..Self::RESET_RETRIES {
            if self.read32(Self::REG_STATUS)? == 0 {
                return Ok(());
            }
            P::usleep(Self::RESET_POLL_DELAY_US);
        }
        Err(TransportError::ResetTimeout)
    }

    fn status(&self) -> DeviceStatus {
        let raw = self.read32(Self::REG_STATUS).unwrap_or(0);
        DeviceStatus::from_bits_truncate(raw as u8)
    }

    fn set_status(&self, status: DeviceStatus) {
        let _ = self.write32(Self::REG_STATUS, status.bits() as u32);
    }

    fn read_device_features(&self, select: u32) -> u32 {
        if self.write32(Self::REG_DEVICE_FEATURES_SEL, select).is_err() {
            return 0;
        }
        self.read32(Self::REG_DEVICE_FEATURES).unwrap_or(0)
    }

    fn write_driver_features(&self, select: u32, value: u32) {
        let _ = self.write32(Self::REG_DRIVER_FEATURES_SEL, select);
        let _ = self.write32(Self::REG_DRIVER_FEATURES, value);
    }

    fn select_queue(&self, queue_index: u16) -> Result<(), TransportError> {
        self.write32(Self::REG_QUEUE_SEL, queue_index as u32)
    }

    fn queue_max_size(&self) -> Result<u16, TransportError> {
        Ok(self.read32(Self::REG_QUEUE_NUM_MAX)? as u16)
    }

    fn set_queue_size(&self, size: u16) -> Result<(), TransportError> {
        self.write32(Self::REG_QUEUE_NUM, size as u32)
    }

    fn set_queue_addresses(
        &self,
        desc: PhysAddr,
        avail: PhysAddr,
        used: PhysAddr,
    ) -> Result<(), TransportError> {
        if self.is_legacy() {
            // Legacy devices take one page frame number and derive the ring
            // layout from it; the queue allocation guarantees the prescribed
            // contiguous layout.
            if desc.as_u64() % PAGE_SIZE as u64 != 0 {
                return Err(TransportError::MisalignedQueue);
            }
            self.write32(Self::REG_QUEUE_ALIGN, PAGE_SIZE as u32)?;
            self.write32(Self::REG_QUEUE_PFN, (desc.as_u64() / PAGE_SIZE as u64) as u32)
        } else {
            self.write64(Self::REG_QUEUE_DESC_LOW, Self::REG_QUEUE_DESC_HIGH, desc)?;
            self.write64(Self::REG_QUEUE_DRIVER_LOW, Self::REG_QUEUE_DRIVER_HIGH, avail)?;
            self.write64(Self::REG_QUEUE_DEVICE_LOW, Self::REG_QUEUE_DEVICE_HIGH, used)
        }
    }

    fn set_queue_ready(&self, ready: bool) -> Result<(), TransportError> {
        if self.is_legacy() {
            // Writing the PFN already activated the queue.
            return Ok(());
        }
        self.write32(Self::REG_QUEUE_READY, if ready { 1 } else { 0 })
    }

    fn queue_term(&self, queue_index: u16) -> Result<(), TransportError> {
        self.select_queue(queue_index)?;
        if self.is_legacy() {
            self.write32(Self::REG_QUEUE_PFN, 0)
        } else {
            self.write32(Self::REG_QUEUE_READY, 0)
        }
    }

    fn read_config(&self, offset: usize, out: &mut [u8]) -> Result<(), TransportError> {
        let end = offset
            .checked_add(out.len())
            .ok_or(TransportError::ConfigOutOfRange {
                offset,
                len: out.len(),
            })?;
        if Self::HEADER_LEN + end > self.cfg.length {
            return Err(TransportError::ConfigOutOfRange {
                offset,
                len: out.len(),
            });
        }
        for (index, byte) in out.iter_mut().enumerate() {
            let ptr = self.cfg.ptr::<u8>(Self::HEADER_LEN + offset + index)?;
            // SAFETY: range checked above.
            *byte = unsafe { core::ptr::read_volatile(ptr) };
        }
        Ok(())
    }

    fn interrupt_status(&self) -> u32 {
        self.read32(Self::REG_INTERRUPT_STATUS).unwrap_or(0)
    }

    fn ack_interrupt(&self, status: u32) {
        let _ = self.write32(Self::REG_INTERRUPT_ACK, status);
    }
}
