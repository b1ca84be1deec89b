//! Guest-side VirtIO driver core.
//!
//! This crate implements the split-virtqueue transport protocol and the two
//! device-class drivers built on top of it: block storage ([`blk`]) and
//! network interfaces ([`net`]). Bus-level discovery is out of scope; callers
//! construct a [`transport::Transport`] (for memory-mapped devices, via
//! [`mmio::MmioTransport`]) and hand it to a driver together with a
//! [`platform::Platform`] implementation providing aligned DMA-capable
//! memory.

#![cfg_attr(not(test), no_std)]

pub mod blk;
pub mod device;
pub mod endian;
pub mod mmio;
pub mod negotiate;
pub mod net;
pub mod platform;
pub mod queue;
pub mod transport;

#[cfg(test)]
mod testing;

pub use blk::{VirtioBlkDevice, VirtioBlkError};
pub use device::{BlockDevice, LinkState, NetworkDevice};
pub use endian::WireFormat;
pub use mmio::{MmioConfig, MmioTransport};
pub use negotiate::{Handshake, Negotiated, NegotiationError};
pub use net::{VirtioNetDevice, VirtioNetError};
pub use platform::{DmaError, DmaRegion, PhysAddr, Platform};
pub use queue::{QueueError, VirtQueue};
pub use transport::{DeviceStatus, QueueNotifier, Transport, TransportError};

/// Granularity of queue allocations and of the legacy page-frame interface.
pub const PAGE_SIZE: usize = 4096;

/// Standard VirtIO device identifiers.
pub mod device_id {
    /// Network card.
    pub const NET: u32 = 1;
    /// Block device.
    pub const BLOCK: u32 = 2;
}

/// Feature bits shared by all VirtIO device classes.
pub mod features {
    /// Negotiation bit indicating compliance with the modern (v1.0+)
    /// specification; devices that negotiate it use little-endian on the
    /// wire.
    pub const VERSION_1: u64 = 1 << 32;
}
