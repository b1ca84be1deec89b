//! VirtIO network device driver.
//!
//! Queue 0 receives, queue 1 transmits. Each queue uses half its depth in
//! two-descriptor slots (virtio-net header + frame data) carved out of a
//! per-queue buffer pool. Receive buffers are pre-posted at open; transmit
//! reuses slots deterministically from the available index and never waits
//! for the device.

use core::fmt;
use core::ptr;

use bitflags::bitflags;
use log::{debug, trace, warn};

use crate::device::{LinkState, NetworkDevice};
use crate::negotiate::{Handshake, NegotiationError};
use crate::platform::{DmaError, DmaRegion, Platform};
use crate::queue::{DescriptorFlags, QueueError, VirtQueue, AVAIL_F_NO_INTERRUPT};
use crate::transport::{DeviceStatus, Transport, TransportError};
use crate::{device_id, features};

/// Frame capacity of one buffer slot: the Ethernet MTU plus header margin.
pub const BUFFER_ENTRY_SIZE: usize = 1526;

const RX_QUEUE_INDEX: u16 = 0;
const TX_QUEUE_INDEX: u16 = 1;
const MAX_QUEUE_SIZE: u16 = 256;
const MIN_QUEUE_SIZE: u16 = 2;
const DEFAULT_MTU: usize = 1500;

/// Net header sizes locked in at negotiation: the modern layout appends
/// `num_buffers`.
const LEGACY_HEADER_SIZE: usize = 10;
const MODERN_HEADER_SIZE: usize = 12;

const CFG_MAC: usize = 0;
const CFG_STATUS: usize = 6;

bitflags! {
    struct FeatureBits: u64 {
        const MAC = 1 << 5;
        const STATUS = 1 << 16;
    }
}

bitflags! {
    struct NetStatus: u16 {
        const LINK_UP = 1;
    }
}

const SUPPORTED_FEATURES: u64 =
    features::VERSION_1 | FeatureBits::MAC.bits() | FeatureBits::STATUS.bits();

#[derive(Debug)]
pub enum VirtioNetError {
    Negotiation(NegotiationError),
    Transport(TransportError),
    Queue(QueueError),
    Dma(DmaError),
    /// Transport carries something other than a network device.
    DeviceMismatch(u32),
    /// Frame exceeds the per-slot capacity. The device is intact.
    FrameTooLarge { len: usize, max: usize },
    /// Used-ring id does not head any pre-posted receive chain.
    InvalidRxDescriptor(u32),
    /// Completion shorter than the net header.
    ShortFrame(usize),
    /// Payload longer than a slot can hold.
    RxOverflow { capacity: usize, received: usize },
    /// Payload descriptor points outside the receive pool.
    BufferOutsidePool,
    /// Device was closed or latched FAILED.
    DeviceFailed,
}

impl fmt::Display for VirtioNetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Negotiation(err) => write!(f, "negotiation: {err}"),
            Self::Transport(err) => write!(f, "transport: {err}"),
            Self::Queue(err) => write!(f, "queue: {err}"),
            Self::Dma(err) => write!(f, "dma: {err}"),
            Self::DeviceMismatch(id) => write!(f, "device id {id} is not a network device"),
            Self::FrameTooLarge { len, max } => write!(f, "frame of {len} bytes exceeds {max}"),
            Self::InvalidRxDescriptor(id) => write!(f, "used id {id} is not a receive chain head"),
            Self::ShortFrame(len) => write!(f, "completion of {len} bytes lacks a net header"),
            Self::RxOverflow { capacity, received } => {
                write!(f, "received {received} bytes into a {capacity}-byte slot")
            }
            Self::BufferOutsidePool => write!(f, "descriptor address outside the receive pool"),
            Self::DeviceFailed => write!(f, "device has failed; reset required"),
        }
    }
}

impl From<NegotiationError> for VirtioNetError {
    fn from(value: NegotiationError) -> Self {
        Self::Negotiation(value)
    }
}

impl From<TransportError> for VirtioNetError {
    fn from(value: TransportError) -> Self {
        Self::Transport(value)
    }
}

impl From<QueueError> for VirtioNetError {
    fn from(value: QueueError) -> Self {
        Self::Queue(value)
    }
}

impl From<DmaError> for VirtioNetError {
    fn from(value: DmaError) -> Self {
        Self::Dma(value)
    }
}

pub struct VirtioNetDevice<T: Transport, P: Platform> {
    transport: T,
    hdr_size: usize,
    rx: VirtQueue<P>,
    tx: VirtQueue<P>,
    rx_pool: DmaRegion<P>,
    tx_pool: DmaRegion<P>,
    mac: [u8; 6],
    link_state: LinkState,
    failed: bool,
}

impl<T: Transport, P: Platform> VirtioNetDevice<T, P> {
    /// Bring the interface up: negotiate, build both queues, pre-post the
    /// receive ring, and read the MAC.
    pub fn open(transport: T) -> Result<Self, VirtioNetError> {
        if transport.device_id() != device_id::NET {
            return Err(VirtioNetError::DeviceMismatch(transport.device_id()));
        }

        let mut handshake = Handshake::begin(&transport)?;
        let negotiated = handshake
            .negotiate(&transport, SUPPORTED_FEATURES)
            .map_err(|err| fail(&mut handshake, &transport, err.into()))?;
        let wire = negotiated.wire;
        let hdr_size = if wire.is_modern() {
            MODERN_HEADER_SIZE
        } else {
            LEGACY_HEADER_SIZE
        };

        let mut rx = VirtQueue::new(&transport, RX_QUEUE_INDEX, wire, MAX_QUEUE_SIZE)
            .map_err(|err| fail(&mut handshake, &transport, err.into()))?;
        let mut tx = VirtQueue::new(&transport, TX_QUEUE_INDEX, wire, MAX_QUEUE_SIZE)
            .map_err(|err| fail(&mut handshake, &transport, err.into()))?;
        for queue in [&rx, &tx] {
            if queue.size() < MIN_QUEUE_SIZE {
                let err = QueueError::TooSmall(queue.size());
                return Err(fail(&mut handshake, &transport, err.into()));
            }
        }

        let slot_size = hdr_size + BUFFER_ENTRY_SIZE;
        let rx_slots = rx.size() as usize / 2;
        let tx_slots = tx.size() as usize / 2;
        let mut rx_pool = DmaRegion::<P>::allocate(slot_size * rx_slots, 16)
            .map_err(|err| fail(&mut handshake, &transport, err.into()))?;
        let mut tx_pool = DmaRegion::<P>::allocate(slot_size * tx_slots, 16)
            .map_err(|err| fail(&mut handshake, &transport, err.into()))?;
        rx_pool.zero();
        tx_pool.zero();

        // Pre-post every receive slot as a header+data chain.
        for i in 0..rx_slots {
            let base = i * slot_size;
            let id = (2 * i) as u16;
            let header_pa = rx_pool
                .phys_at(base)
                .map_err(|err| fail(&mut handshake, &transport, err.into()))?;
            let data_pa = rx_pool
                .phys_at(base + hdr_size)
                .map_err(|err| fail(&mut handshake, &transport, err.into()))?;
            rx.fill_desc(
                id,
                header_pa,
                hdr_size as u32,
                DescriptorFlags::WRITE | DescriptorFlags::NEXT,
                id + 1,
            );
            rx.fill_desc(id + 1, data_pa, BUFFER_ENTRY_SIZE as u32, DescriptorFlags::WRITE, 0);
            rx.publish(id);
        }
        rx.set_avail_flags(0);
        rx.sync_used_cursor();

        tx.set_avail_flags(AVAIL_F_NO_INTERRUPT);

        handshake.finish(&transport);
        transport.notify_queue(RX_QUEUE_INDEX)?;

        let (mac, link_state) = read_identity(&transport, negotiated.features)?;
        debug!(
            "virtio-net up: mac {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}, \
             rx/tx {} + {} slots, header {hdr_size}",
            mac[0], mac[1], mac[2], mac[3], mac[4], mac[5], rx_slots, tx_slots
        );

        Ok(Self {
            transport,
            hdr_size,
            rx,
            tx,
            rx_pool,
            tx_pool,
            mac,
            link_state,
            failed: false,
        })
    }

    pub fn mac_address(&self) -> [u8; 6] {
        self.mac
    }

    pub fn mtu(&self) -> usize {
        DEFAULT_MTU
    }

    pub fn link_state(&self) -> LinkState {
        self.link_state
    }

    fn slot_size(&self) -> usize {
        self.hdr_size + BUFFER_ENTRY_SIZE
    }

    /// Queue one Ethernet frame for transmission and notify the device.
    /// Returns the number of bytes accepted; completion is not awaited.
    pub fn transmit(&mut self, frame: &[u8]) -> Result<usize, VirtioNetError> {
        if self.failed {
            return Err(VirtioNetError::DeviceFailed);
        }
        if frame.len() > BUFFER_ENTRY_SIZE {
            return Err(VirtioNetError::FrameTooLarge {
                len: frame.len(),
                max: BUFFER_ENTRY_SIZE,
            });
        }

        // Reap whatever the device already consumed; keeps the cursor
        // within a lap of the ring.
        while self.tx.poll_used().is_some() {}

        let size = self.tx.size();
        let slots = size as usize / 2;
        let idx = self.tx.avail_idx();
        let slot = idx as usize % slots;
        let id = idx.wrapping_mul(2) % size;
        let base = slot * self.slot_size();
        let hdr_size = self.hdr_size;

        // Zeroed net header, then the payload, in the slot's own bytes.
        // SAFETY: slot bounds derive from the pool sizing at open.
        unsafe {
            ptr::write_bytes(self.tx_pool.ptr_at(base), 0, hdr_size);
            ptr::copy_nonoverlapping(
                frame.as_ptr(),
                self.tx_pool.ptr_at(base + hdr_size),
                frame.len(),
            );
        }

        let header_pa = self.tx_pool.phys_at(base)?;
        let data_pa = self.tx_pool.phys_at(base + hdr_size)?;
        self.tx.free_desc(id);
        self.tx.free_desc((id + 1) % size);
        self.tx
            .fill_desc(id, header_pa, hdr_size as u32, DescriptorFlags::NEXT, id + 1);
        self.tx
            .fill_desc((id + 1) % size, data_pa, frame.len() as u32, DescriptorFlags::empty(), 0);

        self.tx.publish(id);
        self.transport.notify_queue(TX_QUEUE_INDEX)?;
        trace!("virtio-net tx {} bytes in slot {slot} (head {id})", frame.len());
        Ok(frame.len())
    }

    /// Raw length (net header included) of the next pending receive
    /// completion, or zero if nothing arrived.
    pub fn receive_check(&self) -> usize {
        self.rx.peek_used_len().unwrap_or(0) as usize
    }

    /// Copy the next received frame into `buf` and re-post its buffer.
    ///
    /// Returns zero when nothing is pending. Frames longer than `buf` are
    /// truncated; the copied length is returned either way.
    pub fn receive(&mut self, buf: &mut [u8]) -> Result<usize, VirtioNetError> {
        if self.failed {
            return Err(VirtioNetError::DeviceFailed);
        }
        let Some(elem) = self.rx.poll_used() else {
            return Ok(0);
        };

        let size = self.rx.size();
        if elem.id >= size as u32 || elem.id % 2 != 0 {
            return Err(self.fatal(VirtioNetError::InvalidRxDescriptor(elem.id)));
        }
        let head = elem.id as u16;
        let total = elem.len as usize;
        if total < self.hdr_size {
            return Err(self.fatal(VirtioNetError::ShortFrame(total)));
        }
        let payload_len = total - self.hdr_size;
        if payload_len > BUFFER_ENTRY_SIZE {
            return Err(self.fatal(VirtioNetError::RxOverflow {
                capacity: BUFFER_ENTRY_SIZE,
                received: payload_len,
            }));
        }

        // The device hands back addresses; trust only what falls on the
        // pool slot this chain was posted with.
        let slot = head as usize / 2;
        let payload_offset = slot * self.slot_size() + self.hdr_size;
        let expected_pa = self.rx_pool.phys_at(payload_offset)?;
        let payload_desc = self.rx.read_desc((head + 1) % size);
        if payload_desc.addr != expected_pa.as_u64() {
            return Err(self.fatal(VirtioNetError::BufferOutsidePool));
        }

        let copied = payload_len.min(buf.len());
        if copied < payload_len {
            warn!(
                "virtio-net rx truncated: frame of {payload_len} bytes into {} byte buffer",
                buf.len()
            );
        }
        // SAFETY: payload_offset..+copied is inside the pool per the slot
        // arithmetic above; the device finished writing before publishing
        // the used entry.
        unsafe {
            ptr::copy_nonoverlapping(
                self.rx_pool.ptr_at(payload_offset),
                buf.as_mut_ptr(),
                copied,
            );
        }

        // Hand the chain straight back to the device.
        self.rx.publish(head);
        self.transport.notify_queue(RX_QUEUE_INDEX)?;
        trace!("virtio-net rx {copied} of {payload_len} bytes (head {head})");
        Ok(copied)
    }

    /// A malformed completion means the device can no longer be trusted:
    /// latch FAILED and refuse further traffic.
    fn fatal(&mut self, err: VirtioNetError) -> VirtioNetError {
        self.failed = true;
        self.transport.set_status(DeviceStatus::FAILED);
        err
    }

    /// Acknowledge whatever interrupt cause the device currently reports.
    pub fn handle_interrupt(&self) -> u32 {
        let status = self.transport.interrupt_status();
        if status != 0 {
            self.transport.ack_interrupt(status);
        }
        status
    }

    /// Quiesce and tear down the interface. All outstanding buffers are
    /// void once this returns; the pools are released on drop.
    pub fn close(mut self) -> Result<(), VirtioNetError> {
        self.failed = true;
        self.transport.set_status(DeviceStatus::FAILED);
        let reset = self.transport.reset();
        let _ = self.transport.queue_term(RX_QUEUE_INDEX);
        let _ = self.transport.queue_term(TX_QUEUE_INDEX);
        reset.map_err(VirtioNetError::from)
    }
}

impl<T: Transport, P: Platform> NetworkDevice for VirtioNetDevice<T, P> {
    type Error = VirtioNetError;

    fn mac_address(&self) -> [u8; 6] {
        self.mac
    }

    fn mtu(&self) -> usize {
        DEFAULT_MTU
    }

    fn link_state(&self) -> LinkState {
        self.link_state
    }

    fn transmit_frame(&mut self, frame: &[u8]) -> Result<usize, Self::Error> {
        self.transmit(frame)
    }

    fn receive_frame(&mut self, buffer: &mut [u8]) -> Result<Option<usize>, Self::Error> {
        match self.receive(buffer)? {
            0 => Ok(None),
            len => Ok(Some(len)),
        }
    }
}

fn fail<T: Transport>(
    handshake: &mut Handshake,
    transport: &T,
    err: VirtioNetError,
) -> VirtioNetError {
    handshake.fail(transport);
    err
}

fn read_identity<T: Transport>(
    transport: &T,
    negotiated: u64,
) -> Result<([u8; 6], LinkState), VirtioNetError> {
    let mut mac = [0u8; 6];
    if negotiated & FeatureBits::MAC.bits() != 0 {
        transport.read_config(CFG_MAC, &mut mac)?;
    } else {
        warn!("virtio-net device offers no MAC; using a zeroed address");
    }
    let link_state = if negotiated & FeatureBits::STATUS.bits() != 0 {
        let mut bytes = [0u8; 2];
        transport.read_config(CFG_STATUS, &mut bytes)?;
        if u16::from_le_bytes(bytes) & NetStatus::LINK_UP.bits() != 0 {
            LinkState::Up
        } else {
            LinkState::Down
        }
    } else {
        LinkState::Unknown
    };
    Ok((mac, link_state))
}
