//! VirtIO block device driver.
//!
//! Requests are framed as three-descriptor chains (header, data, status
//! trailer) allocated deterministically from the available index. Submission
//! and completion are separate operations: `submit_*` publishes a chain and
//! returns, `try_complete` polls the used ring once and reports the
//! status-byte outcome. The blocking `read_blocks`/`write_blocks`/`flush`
//! helpers wrap the pair with a bounded spin.

use core::fmt;

use bitflags::bitflags;
use log::{debug, trace, warn};

use crate::device::BlockDevice;
use crate::endian::WireFormat;
use crate::negotiate::{Handshake, NegotiationError};
use crate::platform::{DmaError, DmaRegion, PhysAddr, Platform};
use crate::queue::{DescriptorFlags, QueueError, VirtQueue};
use crate::transport::{DeviceStatus, Transport, TransportError};
use crate::{device_id, features};

/// The request unit the virtio-blk wire format is defined in.
pub const SECTOR_SIZE: u32 = 512;

const QUEUE_INDEX: u16 = 0;
const MAX_QUEUE_SIZE: u16 = 128;
/// Descriptor slots reserved per request: header, data, status.
const REQUEST_DESCRIPTORS: u16 = 3;
const SPIN_LIMIT: usize = 5_000_000;

const CFG_CAPACITY: usize = 0;
const CFG_GEOMETRY: usize = 16;
const CFG_BLK_SIZE: usize = 20;

bitflags! {
    struct FeatureBits: u64 {
        const RO = 1 << 5;
        const BLK_SIZE = 1 << 6;
        const FLUSH = 1 << 9;
    }
}

const SUPPORTED_FEATURES: u64 = features::VERSION_1
    | FeatureBits::RO.bits()
    | FeatureBits::BLK_SIZE.bits()
    | FeatureBits::FLUSH.bits();

#[repr(u32)]
#[derive(Clone, Copy, Debug)]
enum RequestType {
    In = 0,
    Out = 1,
    Flush = 4,
}

/// Disk geometry as advertised in the configuration region.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VirtioBlkGeometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors: u8,
}

#[derive(Debug)]
pub enum VirtioBlkError {
    Negotiation(NegotiationError),
    Transport(TransportError),
    Queue(QueueError),
    Dma(DmaError),
    /// Transport carries something other than a block device.
    DeviceMismatch(u32),
    /// Block size not a multiple of the 512-byte sector unit.
    UnsupportedBlockSize(u32),
    /// Buffer length not a whole number of blocks.
    UnalignedBuffer,
    AddressOverflow,
    /// Request extends beyond the device capacity. The device is intact.
    OutOfRange,
    /// A request is already in flight; this driver submits serially.
    RequestInFlight,
    NoRequestInFlight,
    /// Device reported an I/O error for the request.
    Io,
    /// Device rejected the request type.
    Unsupported,
    /// Device reported an unknown status byte.
    DeviceStatus(u8),
    ReadOnly,
    FlushUnsupported,
    /// Device was shut down or latched FAILED; reset before reuse.
    DeviceFailed,
    Timeout,
}

impl fmt::Display for VirtioBlkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Negotiation(err) => write!(f, "negotiation: {err}"),
            Self::Transport(err) => write!(f, "transport: {err}"),
            Self::Queue(err) => write!(f, "queue: {err}"),
            Self::Dma(err) => write!(f, "dma: {err}"),
            Self::DeviceMismatch(id) => write!(f, "device id {id} is not a block device"),
            Self::UnsupportedBlockSize(size) => write!(f, "unsupported block size {size}"),
            Self::UnalignedBuffer => write!(f, "buffer is not a whole number of blocks"),
            Self::AddressOverflow => write!(f, "request address arithmetic overflowed"),
            Self::OutOfRange => write!(f, "request extends beyond device capacity"),
            Self::RequestInFlight => write!(f, "a request is already in flight"),
            Self::NoRequestInFlight => write!(f, "no request in flight"),
            Self::Io => write!(f, "device reported an I/O error"),
            Self::Unsupported => write!(f, "device rejected the request type"),
            Self::DeviceStatus(status) => write!(f, "unknown device status 0x{status:02x}"),
            Self::ReadOnly => write!(f, "device is read-only"),
            Self::FlushUnsupported => write!(f, "device does not support flush"),
            Self::DeviceFailed => write!(f, "device has failed; reset required"),
            Self::Timeout => write!(f, "timed out waiting for completion"),
        }
    }
}

impl From<NegotiationError> for VirtioBlkError {
    fn from(value: NegotiationError) -> Self {
        Self::Negotiation(value)
    }
}

impl From<TransportError> for VirtioBlkError {
    fn from(value: TransportError) -> Self {
        Self::Transport(value)
    }
}

impl From<QueueError> for VirtioBlkError {
    fn from(value: QueueError) -> Self {
        Self::Queue(value)
    }
}

impl From<DmaError> for VirtioBlkError {
    fn from(value: DmaError) -> Self {
        Self::Dma(value)
    }
}

pub struct VirtioBlkDevice<T: Transport, P: Platform> {
    transport: T,
    queue: VirtQueue<P>,
    wire: WireFormat,
    block_size: u32,
    capacity_sectors: u64,
    read_only: bool,
    flush_supported: bool,
    failed: bool,
    pending: Option<PendingRequest<P>>,
}

struct PendingRequest<P: Platform> {
    buffers: RequestBuffers<P>,
    ty: RequestType,
    data_len: usize,
}

impl<T: Transport, P: Platform> VirtioBlkDevice<T, P> {
    /// Bring the device up: negotiation handshake, queue 0, geometry.
    pub fn new(transport: T) -> Result<Self, VirtioBlkError> {
        if transport.device_id() != device_id::BLOCK {
            return Err(VirtioBlkError::DeviceMismatch(transport.device_id()));
        }

        let mut handshake = Handshake::begin(&transport)?;
        let negotiated = handshake
            .negotiate(&transport, SUPPORTED_FEATURES)
            .map_err(|err| fail(&mut handshake, &transport, err.into()))?;

        let queue = VirtQueue::new(&transport, QUEUE_INDEX, negotiated.wire, MAX_QUEUE_SIZE)
            .map_err(|err| fail(&mut handshake, &transport, err.into()))?;
        if queue.size() < REQUEST_DESCRIPTORS {
            let err = QueueError::TooSmall(queue.size());
            return Err(fail(&mut handshake, &transport, err.into()));
        }

        let wire = negotiated.wire;
        let capacity_sectors = read_config_u64(&transport, wire, CFG_CAPACITY)
            .map_err(|err| fail(&mut handshake, &transport, err.into()))?;
        let block_size = if negotiated.features & FeatureBits::BLK_SIZE.bits() != 0 {
            let size = read_config_u32(&transport, wire, CFG_BLK_SIZE)
                .map_err(|err| fail(&mut handshake, &transport, err.into()))?;
            if size == 0 { SECTOR_SIZE } else { size }
        } else {
            SECTOR_SIZE
        };
        if block_size % SECTOR_SIZE != 0 {
            let err = VirtioBlkError::UnsupportedBlockSize(block_size);
            return Err(fail(&mut handshake, &transport, err));
        }
        let geometry = read_geometry(&transport, wire)
            .map_err(|err| fail(&mut handshake, &transport, err.into()))?;

        handshake.finish(&transport);
        debug!(
            "virtio-blk up: {capacity_sectors} sectors, block size {block_size}, \
             chs {}/{}/{}",
            geometry.cylinders, geometry.heads, geometry.sectors
        );

        Ok(Self {
            transport,
            queue,
            wire,
            block_size,
            capacity_sectors,
            read_only: negotiated.features & FeatureBits::RO.bits() != 0,
            flush_supported: negotiated.features & FeatureBits::FLUSH.bits() != 0,
            failed: false,
            pending: None,
        })
    }

    /// Negotiated logical block size in bytes.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Capacity in 512-byte sectors, as the device advertises it.
    pub fn capacity_sectors(&self) -> u64 {
        self.capacity_sectors
    }

    /// Publish a read request for `len` bytes starting at block `lba`.
    pub fn submit_read(&mut self, lba: u64, len: usize) -> Result<(), VirtioBlkError> {
        self.submit(RequestType::In, lba, len, None)
    }

    /// Publish a write request taking its payload from `data`.
    pub fn submit_write(&mut self, lba: u64, data: &[u8]) -> Result<(), VirtioBlkError> {
        if self.read_only {
            return Err(VirtioBlkError::ReadOnly);
        }
        self.submit(RequestType::Out, lba, data.len(), Some(data))
    }

    pub fn submit_flush(&mut self) -> Result<(), VirtioBlkError> {
        if !self.flush_supported {
            return Err(VirtioBlkError::FlushUnsupported);
        }
        self.submit(RequestType::Flush, 0, 0, None)
    }

    fn submit(
        &mut self,
        ty: RequestType,
        lba: u64,
        data_len: usize,
        source: Option<&[u8]>,
    ) -> Result<(), VirtioBlkError> {
        if self.failed {
            return Err(VirtioBlkError::DeviceFailed);
        }
        if self.pending.is_some() {
            return Err(VirtioBlkError::RequestInFlight);
        }
        let sector = match ty {
            RequestType::Flush => 0,
            _ => self.validate_range(lba, data_len)?,
        };

        let mut buffers = RequestBuffers::<P>::new(data_len)?;
        buffers.write_header(self.wire, ty, sector);
        if let Some(src) = source {
            buffers.copy_from(src);
        }

        let size = self.queue.size();
        let head = (self.queue.avail_idx().wrapping_mul(REQUEST_DESCRIPTORS)) % size;
        let data_id = (head + 1) % size;
        let status_id = (head + 2) % size;

        self.queue.fill_desc(
            head,
            buffers.header_phys(),
            RequestBuffers::<P>::HEADER_SIZE as u32,
            DescriptorFlags::NEXT,
            data_id,
        );
        if data_len > 0 {
            let mut flags = DescriptorFlags::NEXT;
            if matches!(ty, RequestType::In) {
                flags |= DescriptorFlags::WRITE;
            }
            let data_phys = buffers.data_phys().ok_or(VirtioBlkError::AddressOverflow)?;
            self.queue.fill_desc(data_id, data_phys, data_len as u32, flags, status_id);
            self.queue
                .fill_desc(status_id, buffers.status_phys(), 1, DescriptorFlags::WRITE, 0);
        } else {
            self.queue
                .fill_desc(data_id, buffers.status_phys(), 1, DescriptorFlags::WRITE, 0);
            // The third slot of the stride stays unused for data-less
            // requests.
            self.queue.free_desc(status_id);
        }

        self.queue.publish(head);
        self.pending = Some(PendingRequest {
            buffers,
            ty,
            data_len,
        });
        trace!(
            "virtio-blk submit type={:?} sector={sector} len={data_len} head={head}",
            ty
        );
        self.transport.notify_queue(QUEUE_INDEX)?;
        Ok(())
    }

    /// Poll the used ring once for the in-flight request.
    ///
    /// Returns `Ok(None)` while the device is still working. On completion
    /// the status trailer decides the outcome; read payloads are copied
    /// into `out`.
    pub fn try_complete(&mut self, out: &mut [u8]) -> Result<Option<usize>, VirtioBlkError> {
        if self.failed {
            return Err(VirtioBlkError::DeviceFailed);
        }
        if self.pending.is_none() {
            return Err(VirtioBlkError::NoRequestInFlight);
        }
        if self.queue.poll_used().is_none() {
            return Ok(None);
        }
        let pending = self.pending.take().expect("pending checked above");
        let status = pending.buffers.status();
        trace!("virtio-blk complete status=0x{status:02x} len={}", pending.data_len);
        match status {
            0 => {
                if matches!(pending.ty, RequestType::In) {
                    let copied = pending.data_len.min(out.len());
                    if copied < pending.data_len {
                        warn!(
                            "virtio-blk read truncated: {} of {} bytes",
                            copied, pending.data_len
                        );
                    }
                    pending.buffers.copy_into(&mut out[..copied]);
                    Ok(Some(copied))
                } else {
                    Ok(Some(pending.data_len))
                }
            }
            1 => Err(VirtioBlkError::Io),
            2 => Err(VirtioBlkError::Unsupported),
            other => Err(VirtioBlkError::DeviceStatus(other)),
        }
    }

    fn drain(&mut self, out: &mut [u8]) -> Result<usize, VirtioBlkError> {
        let mut spins: usize = 0;
        loop {
            if let Some(copied) = self.try_complete(out)? {
                return Ok(copied);
            }
            spins += 1;
            if spins >= SPIN_LIMIT {
                // The request stays pending so its buffers outlive a late
                // device write; a later try_complete may still reap it.
                warn!("virtio-blk completion timeout after {spins} polls");
                return Err(VirtioBlkError::Timeout);
            }
            core::hint::spin_loop();
        }
    }

    fn validate_range(&self, lba: u64, len: usize) -> Result<u64, VirtioBlkError> {
        if len % self.block_size as usize != 0 {
            return Err(VirtioBlkError::UnalignedBuffer);
        }
        let sectors_per_block = (self.block_size / SECTOR_SIZE) as u64;
        let transfer_sectors = (len as u64) / SECTOR_SIZE as u64;
        let start_sector = lba
            .checked_mul(sectors_per_block)
            .ok_or(VirtioBlkError::AddressOverflow)?;
        let end_sector = start_sector
            .checked_add(transfer_sectors)
            .ok_or(VirtioBlkError::AddressOverflow)?;
        if end_sector > self.capacity_sectors {
            return Err(VirtioBlkError::OutOfRange);
        }
        Ok(start_sector)
    }

    /// Quiesce the device: latch FAILED, then reset. Outstanding buffers
    /// are void afterwards.
    pub fn shutdown(&mut self) {
        self.transport.set_status(DeviceStatus::FAILED);
        let _ = self.transport.reset();
        self.failed = true;
        self.pending = None;
    }
}

impl<T: Transport, P: Platform> BlockDevice for VirtioBlkDevice<T, P> {
    type Error = VirtioBlkError;

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn num_blocks(&self) -> u64 {
        self.capacity_sectors * SECTOR_SIZE as u64 / self.block_size as u64
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn read_blocks(&mut self, lba: u64, buffer: &mut [u8]) -> Result<(), Self::Error> {
        self.submit_read(lba, buffer.len())?;
        self.drain(buffer)?;
        Ok(())
    }

    fn write_blocks(&mut self, lba: u64, buffer: &[u8]) -> Result<(), Self::Error> {
        self.submit_write(lba, buffer)?;
        self.drain(&mut [])?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.submit_flush()?;
        self.drain(&mut [])?;
        Ok(())
    }
}

fn fail<T: Transport>(
    handshake: &mut Handshake,
    transport: &T,
    err: VirtioBlkError,
) -> VirtioBlkError {
    handshake.fail(transport);
    err
}

fn read_config_u32<T: Transport>(
    transport: &T,
    wire: WireFormat,
    offset: usize,
) -> Result<u32, TransportError> {
    let mut bytes = [0u8; 4];
    transport.read_config(offset, &mut bytes)?;
    Ok(wire.from_dev32(u32::from_ne_bytes(bytes)))
}

fn read_config_u64<T: Transport>(
    transport: &T,
    wire: WireFormat,
    offset: usize,
) -> Result<u64, TransportError> {
    let mut bytes = [0u8; 8];
    transport.read_config(offset, &mut bytes)?;
    Ok(wire.from_dev64(u64::from_ne_bytes(bytes)))
}

fn read_geometry<T: Transport>(
    transport: &T,
    wire: WireFormat,
) -> Result<VirtioBlkGeometry, TransportError> {
    let mut bytes = [0u8; 4];
    transport.read_config(CFG_GEOMETRY, &mut bytes)?;
    Ok(VirtioBlkGeometry {
        cylinders: wire.from_dev16(u16::from_ne_bytes([bytes[0], bytes[1]])),
        heads: bytes[2],
        sectors: bytes[3],
    })
}

/// DMA bounce area for one request: header, payload, status trailer.
///
/// The submitter owns the area for the whole flight of the request; the
/// descriptors only borrow it.
struct RequestBuffers<P: Platform> {
    region: DmaRegion<P>,
    data_len: usize,
}

impl<P: Platform> RequestBuffers<P> {
    const HEADER_SIZE: usize = 16;
    const STATUS_SENTINEL: u8 = 0xFF;

    fn new(data_len: usize) -> Result<Self, DmaError> {
        let total = Self::HEADER_SIZE + data_len + 1;
        let mut region = DmaRegion::<P>::allocate(total, 16)?;
        region.zero();
        let buffers = Self { region, data_len };
        // Prime the trailer so a stale zero can never masquerade as a
        // successful completion.
        unsafe { buffers.status_ptr().write_volatile(Self::STATUS_SENTINEL) };
        Ok(buffers)
    }

    fn status_offset(&self) -> usize {
        Self::HEADER_SIZE + self.data_len
    }

    fn header_phys(&self) -> PhysAddr {
        self.region.phys_base()
    }

    fn data_phys(&self) -> Option<PhysAddr> {
        if self.data_len == 0 {
            None
        } else {
            self.region.phys_at(Self::HEADER_SIZE).ok()
        }
    }

    fn status_phys(&self) -> PhysAddr {
        self.region
            .phys_at(self.status_offset())
            .expect("status trailer inside allocation")
    }

    fn status_ptr(&self) -> *mut u8 {
        self.region.ptr_at(self.status_offset())
    }

    fn write_header(&mut self, wire: WireFormat, ty: RequestType, sector: u64) {
        let base = self.region.ptr_at(0);
        // SAFETY: header occupies the first 16 bytes of the exclusively
        // owned region; the device reads it concurrently once published.
        unsafe {
            (base as *mut u32).write_volatile(wire.to_dev32(ty as u32));
            (base.add(4) as *mut u32).write_volatile(0);
            (base.add(8) as *mut u64).write_volatile(wire.to_dev64(sector));
        }
    }

    fn copy_from(&mut self, source: &[u8]) {
        debug_assert_eq!(source.len(), self.data_len);
        // SAFETY: payload area is HEADER_SIZE..HEADER_SIZE+data_len.
        unsafe {
            core::ptr::copy_nonoverlapping(
                source.as_ptr(),
                self.region.ptr_at(Self::HEADER_SIZE),
                source.len().min(self.data_len),
            );
        }
    }

    fn copy_into(&self, out: &mut [u8]) {
        let len = out.len().min(self.data_len);
        // SAFETY: as in `copy_from`; the device has finished writing by the
        // time the used entry was observed.
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.region.ptr_at(Self::HEADER_SIZE),
                out.as_mut_ptr(),
                len,
            );
        }
    }

    fn status(&self) -> u8 {
        // SAFETY: trailer byte is inside the region.
        unsafe { self.status_ptr().read_volatile() }
    }
}
