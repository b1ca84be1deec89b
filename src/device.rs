//! Contracts consumed by upper layers (filesystems, network stacks).

use core::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
    Unknown,
}

/// Common abstraction for block-oriented storage backends.
pub trait BlockDevice {
    type Error: fmt::Debug;

    /// Logical block size in bytes.
    fn block_size(&self) -> u32;

    /// Device capacity in logical blocks.
    fn num_blocks(&self) -> u64;

    fn is_read_only(&self) -> bool;

    /// Read whole blocks starting at `lba` into `buffer`.
    fn read_blocks(&mut self, lba: u64, buffer: &mut [u8]) -> Result<(), Self::Error>;

    /// Write whole blocks starting at `lba` from `buffer`.
    fn write_blocks(&mut self, lba: u64, buffer: &[u8]) -> Result<(), Self::Error>;

    /// Flush any device-side write cache.
    fn flush(&mut self) -> Result<(), Self::Error>;
}

/// Common contract for Ethernet-like network devices.
///
/// Drivers expose synchronous transmit/receive primitives so the higher
/// layers can stay transport-agnostic.
pub trait NetworkDevice {
    type Error: fmt::Debug;

    /// Hardware MAC address (zeroed if unavailable).
    fn mac_address(&self) -> [u8; 6];

    /// Maximum payload size supported by the interface.
    fn mtu(&self) -> usize;

    fn link_state(&self) -> LinkState {
        LinkState::Unknown
    }

    /// Transmit one Ethernet frame; returns the number of bytes queued.
    fn transmit_frame(&mut self, frame: &[u8]) -> Result<usize, Self::Error>;

    /// Receive one Ethernet frame into `buffer`.
    ///
    /// Returns `Ok(None)` if no frame is pending.
    fn receive_frame(&mut self, buffer: &mut [u8]) -> Result<Option<usize>, Self::Error>;
}
