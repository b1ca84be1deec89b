//! Transport contract shared by all VirtIO bus attachments.

use core::fmt;

use bitflags::bitflags;

use crate::platform::PhysAddr;

bitflags! {
    /// Device status register bits. Bits accumulate monotonically through
    /// initialization; `FAILED` is a terminal sink until the next reset.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DeviceStatus: u8 {
        const ACKNOWLEDGE = 1;
        const DRIVER = 2;
        const DRIVER_OK = 4;
        const FEATURES_OK = 8;
        const NEEDS_RESET = 64;
        const FAILED = 128;
    }
}

impl DeviceStatus {
    pub fn with(self, other: DeviceStatus) -> DeviceStatus {
        self.union(other)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// Register window returned something other than the `virt` magic.
    BadMagic { found: u32 },
    /// Device speaks a revision this driver does not.
    BadVersion { found: u32 },
    /// Status did not clear within the reset retry budget.
    ResetTimeout,
    /// Register access past the end of the mapped window.
    RegisterOutOfRange { offset: usize },
    /// Device-specific configuration access past the config region.
    ConfigOutOfRange { offset: usize, len: usize },
    /// Requested queue index is unavailable.
    QueueUnavailable,
    /// Queue address not representable on this transport.
    MisalignedQueue,
    /// Queue notify region unavailable.
    NotifyUnavailable,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic { found } => write!(f, "bad VirtIO magic value 0x{found:08x}"),
            Self::BadVersion { found } => write!(f, "unsupported VirtIO revision {found}"),
            Self::ResetTimeout => write!(f, "device did not acknowledge reset"),
            Self::RegisterOutOfRange { offset } => {
                write!(f, "register offset 0x{offset:x} outside mapped window")
            }
            Self::ConfigOutOfRange { offset, len } => {
                write!(f, "config access at 0x{offset:x}+{len} outside device config")
            }
            Self::QueueUnavailable => write!(f, "requested queue index is unavailable"),
            Self::MisalignedQueue => write!(f, "queue memory not aligned for this transport"),
            Self::NotifyUnavailable => write!(f, "queue notify region unavailable"),
        }
    }
}

pub trait QueueNotifier {
    /// Tell the device to examine a queue. Callers must have made all ring
    /// updates globally visible first.
    fn notify_queue(&self, queue_index: u16) -> Result<(), TransportError>;
}

/// Register-level access to one VirtIO device instance.
///
/// The trait hides the bus flavour (memory-mapped or PCI capability layout)
/// from the queue engine and the device drivers. All methods take `&self`;
/// the underlying register file is the synchronization domain.
pub trait Transport: QueueNotifier {
    /// Device-type tag from the transport header (1 = net, 2 = block, ...).
    fn device_id(&self) -> u32;

    /// Whether the device predates v1.0 and therefore uses guest-native
    /// byte order and the legacy queue interface.
    fn is_legacy(&self) -> bool;

    /// Write zero to the status register and wait for the device to observe
    /// it.
    fn reset(&self) -> Result<(), TransportError>;

    fn status(&self) -> DeviceStatus;

    /// Write a cumulative status value. Callers supply all bits set so far.
    fn set_status(&self, status: DeviceStatus);

    /// Read one 32-bit window of the device feature set.
    fn read_device_features(&self, select: u32) -> u32;

    /// Write one 32-bit window of the driver feature set.
    fn write_driver_features(&self, select: u32, value: u32);

    fn select_queue(&self, queue_index: u16) -> Result<(), TransportError>;

    /// Maximum size of the currently selected queue; zero means the queue
    /// does not exist.
    fn queue_max_size(&self) -> Result<u16, TransportError>;

    fn set_queue_size(&self, size: u16) -> Result<(), TransportError>;

    /// Publish the physical addresses of the three ring structures for the
    /// currently selected queue.
    fn set_queue_addresses(
        &self,
        desc: PhysAddr,
        avail: PhysAddr,
        used: PhysAddr,
    ) -> Result<(), TransportError>;

    fn set_queue_ready(&self, ready: bool) -> Result<(), TransportError>;

    /// Detach the given queue from the device.
    fn queue_term(&self, queue_index: u16) -> Result<(), TransportError>;

    /// Read from the device-specific configuration region.
    fn read_config(&self, offset: usize, out: &mut [u8]) -> Result<(), TransportError>;

    fn interrupt_status(&self) -> u32;

    fn ack_interrupt(&self, status: u32);

    /// Full 64-bit device feature set, composed from the select windows.
    fn read_device_features64(&self) -> u64 {
        let low = self.read_device_features(0) as u64;
        let high = self.read_device_features(1) as u64;
        low | (high << 32)
    }

    /// Write the full 64-bit driver feature set through the select windows.
    fn write_driver_features64(&self, features: u64) {
        self.write_driver_features(0, features as u32);
        self.write_driver_features(1, (features >> 32) as u32);
    }
}
