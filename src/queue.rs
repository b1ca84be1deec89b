//! Split virtqueue engine.
//!
//! Lays out the descriptor table, available ring and used ring in one
//! physically-contiguous allocation, publishes it to the transport, and
//! mediates all subsequent ring traffic. The rings are shared with a
//! hypervisor peer that runs concurrently: every field access is volatile,
//! passes through the byte-order adapter, and the publish/observe paths are
//! bracketed by full fences. The queue also carries the wrap-safe used-ring
//! cursor, so two queues on one device never share progress state.

use core::mem::size_of;
use core::ptr;
use core::sync::atomic::{fence, Ordering};

use bitflags::bitflags;

use crate::endian::WireFormat;
use crate::platform::{DmaError, DmaRegion, PhysAddr, Platform};
use crate::transport::{Transport, TransportError};
use crate::PAGE_SIZE;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DescriptorFlags: u16 {
        /// Chain continues at `next`.
        const NEXT = 1;
        /// Buffer is written by the device.
        const WRITE = 2;
        const INDIRECT = 4;
    }
}

/// Available-ring flag asking the device not to interrupt on consumption.
pub const AVAIL_F_NO_INTERRUPT: u16 = 1;

/// Descriptor table entry as defined by the VirtIO specification.
#[repr(C, align(16))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

/// One entry of the used ring, already converted to guest byte order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UsedElem {
    pub id: u32,
    pub len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The device reports the queue as nonexistent (maximum size zero).
    Unavailable(u16),
    /// Queue size is not the power of two the split layout requires.
    InvalidSize(u16),
    /// Queue exists but is too shallow for the driver's chain geometry.
    TooSmall(u16),
    Transport(TransportError),
    Dma(DmaError),
}

impl core::fmt::Display for QueueError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Unavailable(index) => write!(f, "queue {index} unavailable on this device"),
            Self::InvalidSize(size) => write!(f, "queue size {size} is not a power of two"),
            Self::TooSmall(size) => write!(f, "queue size {size} below driver minimum"),
            Self::Transport(err) => write!(f, "transport fault: {err}"),
            Self::Dma(err) => write!(f, "queue memory: {err}"),
        }
    }
}

impl From<TransportError> for QueueError {
    fn from(value: TransportError) -> Self {
        Self::Transport(value)
    }
}

impl From<DmaError> for QueueError {
    fn from(value: DmaError) -> Self {
        Self::Dma(value)
    }
}

/// Offsets of the three ring structures within one allocation.
///
/// Descriptor table first (16-byte entries), available ring directly after,
/// used ring pushed up to the next page boundary. The page alignment keeps
/// the layout compatible with the legacy page-frame interface while
/// satisfying the modern 16/2/4-byte minimums.
#[derive(Clone, Copy, Debug)]
struct VirtQueueLayout {
    avail_offset: usize,
    used_offset: usize,
    total_size: usize,
}

impl VirtQueueLayout {
    const DESC_ENTRY_SIZE: usize = size_of::<Descriptor>();
    // flags + idx + ring + used_event / avail_event trailers.
    const AVAIL_HEADER_SIZE: usize = 2 + 2;
    const AVAIL_TRAILER_SIZE: usize = 2;
    const USED_HEADER_SIZE: usize = 2 + 2;
    const USED_ELEMENT_SIZE: usize = 8;
    const USED_TRAILER_SIZE: usize = 2;

    fn new(queue_size: u16) -> Self {
        let entries = queue_size as usize;
        let desc_size = Self::DESC_ENTRY_SIZE * entries;
        let avail_offset = desc_size;
        let avail_size = Self::AVAIL_HEADER_SIZE + 2 * entries + Self::AVAIL_TRAILER_SIZE;
        let used_offset = align_up(avail_offset + avail_size, PAGE_SIZE);
        let used_size =
            Self::USED_HEADER_SIZE + Self::USED_ELEMENT_SIZE * entries + Self::USED_TRAILER_SIZE;
        let total_size = used_offset + align_up(used_size, size_of::<u32>());
        Self {
            avail_offset,
            used_offset,
            total_size,
        }
    }
}

/// One split virtqueue bound to a transport queue index.
pub struct VirtQueue<P: Platform> {
    index: u16,
    size: u16,
    wire: WireFormat,
    region: DmaRegion<P>,
    avail_offset: usize,
    used_offset: usize,
    /// Guest-side shadow of `avail.idx`; the ring copy is derived from it.
    avail_idx: u16,
    /// First used-ring entry not yet observed. Wrap-safe 16-bit counter.
    last_used: u16,
}

impl<P: Platform> VirtQueue<P> {
    /// Select queue `index`, size it, allocate and zero its rings, and
    /// publish their addresses.
    ///
    /// The device's maximum is clamped to `max_size`; the result must be a
    /// power of two. The queue is left ready but empty, with both cursors
    /// at zero.
    pub fn new<T: Transport>(
        transport: &T,
        index: u16,
        wire: WireFormat,
        max_size: u16,
    ) -> Result<Self, QueueError> {
        transport.select_queue(index)?;
        let device_max = transport.queue_max_size()?;
        if device_max == 0 {
            return Err(QueueError::Unavailable(index));
        }
        let size = device_max.min(max_size);
        if !size.is_power_of_two() {
            return Err(QueueError::InvalidSize(size));
        }
        transport.set_queue_size(size)?;

        let layout = VirtQueueLayout::new(size);
        let mut region = DmaRegion::<P>::allocate(layout.total_size, PAGE_SIZE)?;
        region.zero();

        transport.set_queue_addresses(
            region.phys_base(),
            region.phys_at(layout.avail_offset)?,
            region.phys_at(layout.used_offset)?,
        )?;
        transport.set_queue_ready(true)?;

        Ok(Self {
            index,
            size,
            wire,
            region,
            avail_offset: layout.avail_offset,
            used_offset: layout.used_offset,
            avail_idx: 0,
            last_used: 0,
        })
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    /// Current guest-side available index (count of chains ever published).
    pub fn avail_idx(&self) -> u16 {
        self.avail_idx
    }

    fn desc_ptr(&self, id: u16) -> *mut Descriptor {
        debug_assert!(id < self.size);
        self.region.ptr_at(VirtQueueLayout::DESC_ENTRY_SIZE * id as usize) as *mut Descriptor
    }

    fn avail_field(&self, byte_offset: usize) -> *mut u16 {
        self.region.ptr_at(self.avail_offset + byte_offset) as *mut u16
    }

    fn used_field(&self, byte_offset: usize) -> *mut u8 {
        self.region.ptr_at(self.used_offset + byte_offset)
    }

    /// Write one descriptor entry through the byte-order adapter.
    pub fn fill_desc(&mut self, id: u16, addr: PhysAddr, len: u32, flags: DescriptorFlags, next: u16) {
        let entry = self.desc_ptr(id);
        // SAFETY: `id` is in-table and the region outlives `self`. Field
        // writes are volatile because the device reads them concurrently.
        unsafe {
            ptr::addr_of_mut!((*entry).addr).write_volatile(self.wire.to_dev64(addr.as_u64()));
            ptr::addr_of_mut!((*entry).len).write_volatile(self.wire.to_dev32(len));
            ptr::addr_of_mut!((*entry).flags).write_volatile(self.wire.to_dev16(flags.bits()));
            ptr::addr_of_mut!((*entry).next).write_volatile(self.wire.to_dev16(next % self.size));
        }
    }

    /// Return a descriptor slot to its zeroed sentinel state.
    ///
    /// Only valid for slots whose chain has been observed on the used ring
    /// (or never published); the host must no longer reference them.
    pub fn free_desc(&mut self, id: u16) {
        let entry = self.desc_ptr(id);
        // SAFETY: as in `fill_desc`.
        unsafe {
            ptr::addr_of_mut!((*entry).addr).write_volatile(0);
            ptr::addr_of_mut!((*entry).len).write_volatile(0);
            ptr::addr_of_mut!((*entry).flags).write_volatile(0);
            ptr::addr_of_mut!((*entry).next).write_volatile(0);
        }
    }

    /// Read back one descriptor entry, converted to guest byte order.
    pub fn read_desc(&self, id: u16) -> Descriptor {
        let entry = self.desc_ptr(id);
        // SAFETY: as in `fill_desc`; reads are volatile.
        unsafe {
            Descriptor {
                addr: self.wire.from_dev64(ptr::addr_of!((*entry).addr).read_volatile()),
                len: self.wire.from_dev32(ptr::addr_of!((*entry).len).read_volatile()),
                flags: self.wire.from_dev16(ptr::addr_of!((*entry).flags).read_volatile()),
                next: self.wire.from_dev16(ptr::addr_of!((*entry).next).read_volatile()),
            }
        }
    }

    pub fn set_avail_flags(&mut self, flags: u16) {
        // SAFETY: in-bounds ring field, volatile by contract.
        unsafe { self.avail_field(0).write_volatile(self.wire.to_dev16(flags)) };
    }

    /// Publish a descriptor chain head on the available ring.
    ///
    /// All descriptor writes for the chain must precede this call; the
    /// fence makes them globally visible before the index increment, and a
    /// second fence orders the increment before any subsequent notify.
    pub fn publish(&mut self, head: u16) {
        let slot = (self.avail_idx % self.size) as usize;
        // SAFETY: ring slot is in-bounds; accesses are volatile.
        unsafe {
            self.avail_field(VirtQueueLayout::AVAIL_HEADER_SIZE + 2 * slot)
                .write_volatile(self.wire.to_dev16(head));
        }
        fence(Ordering::SeqCst);
        self.avail_idx = self.avail_idx.wrapping_add(1);
        // SAFETY: `avail.idx` lives at offset 2 of the ring header.
        unsafe { self.avail_field(2).write_volatile(self.wire.to_dev16(self.avail_idx)) };
        fence(Ordering::SeqCst);
    }

    /// Device-side used index, straight from shared memory.
    pub fn used_idx(&self) -> u16 {
        // SAFETY: `used.idx` lives at offset 2 of the used header.
        let raw = unsafe { (self.used_field(2) as *const u16).read_volatile() };
        self.wire.from_dev16(raw)
    }

    /// Number of completions published by the device but not yet observed.
    pub fn pending_used(&self) -> u16 {
        self.used_idx().wrapping_sub(self.last_used)
    }

    fn used_elem_at(&self, cursor: u16) -> UsedElem {
        let slot = (cursor % self.size) as usize;
        let base = VirtQueueLayout::USED_HEADER_SIZE + VirtQueueLayout::USED_ELEMENT_SIZE * slot;
        // SAFETY: slot is in-bounds; the device only writes entries below
        // `used.idx`, which the caller has already observed.
        unsafe {
            UsedElem {
                id: self.wire.from_dev32((self.used_field(base) as *const u32).read_volatile()),
                len: self
                    .wire
                    .from_dev32((self.used_field(base + 4) as *const u32).read_volatile()),
            }
        }
    }

    /// Observe the next used-ring entry, if the device has published one.
    pub fn poll_used(&mut self) -> Option<UsedElem> {
        if self.used_idx() == self.last_used {
            return None;
        }
        fence(Ordering::SeqCst);
        let elem = self.used_elem_at(self.last_used);
        self.last_used = self.last_used.wrapping_add(1);
        Some(elem)
    }

    /// Length of the next pending completion without consuming it.
    pub fn peek_used_len(&self) -> Option<u32> {
        if self.used_idx() == self.last_used {
            return None;
        }
        fence(Ordering::SeqCst);
        Some(self.used_elem_at(self.last_used).len)
    }

    /// Align the used cursor with the device's current index, discarding
    /// anything already on the ring. Used once at bring-up.
    pub fn sync_used_cursor(&mut self) {
        self.last_used = self.used_idx();
    }

    /// Physical region backing this queue's rings (for diagnostics).
    pub fn region_base(&self) -> PhysAddr {
        self.region.phys_base()
    }
}

fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{StubTransport, TestPlatform};

    fn queue(transport: &StubTransport) -> VirtQueue<TestPlatform> {
        VirtQueue::new(transport, 0, WireFormat::MODERN, 256).expect("queue init")
    }

    #[test]
    fn zero_sized_queue_is_unavailable() {
        let transport = StubTransport::modern(0);
        assert_eq!(
            VirtQueue::<TestPlatform>::new(&transport, 0, WireFormat::MODERN, 256).err(),
            Some(QueueError::Unavailable(0))
        );
    }

    #[test]
    fn non_power_of_two_rejected() {
        let transport = StubTransport::modern(6);
        assert_eq!(
            VirtQueue::<TestPlatform>::new(&transport, 0, WireFormat::MODERN, 256).err(),
            Some(QueueError::InvalidSize(6))
        );
    }

    #[test]
    fn layout_is_contiguous_and_ordered() {
        let layout = VirtQueueLayout::new(8);
        assert_eq!(layout.avail_offset, 8 * 16);
        assert!(layout.used_offset >= layout.avail_offset + 4 + 16 + 2);
        assert_eq!(layout.used_offset % PAGE_SIZE, 0);
        assert!(layout.total_size >= layout.used_offset + 4 + 64 + 2);
    }

    #[test]
    fn publish_advances_ring_and_shadow() {
        let transport = StubTransport::modern(8);
        let mut vq = queue(&transport);
        vq.fill_desc(0, PhysAddr::new(0x1000), 64, DescriptorFlags::NEXT, 1);
        vq.fill_desc(1, PhysAddr::new(0x2000), 64, DescriptorFlags::WRITE, 0);
        vq.publish(0);

        assert_eq!(vq.avail_idx(), 1);
        let rings = transport.rings(0).expect("rings published");
        assert_eq!(rings.avail_idx(), 1);
        assert_eq!(rings.avail_entry(0), 0);
        let desc = rings.desc(0);
        assert_eq!(desc.addr, 0x1000);
        assert_eq!(desc.flags, DescriptorFlags::NEXT.bits());
        assert_eq!(desc.next, 1);
    }

    #[test]
    fn chain_next_wraps_inside_the_table() {
        let transport = StubTransport::modern(8);
        let mut vq = queue(&transport);
        vq.fill_desc(7, PhysAddr::new(0x1000), 16, DescriptorFlags::NEXT, 8);
        assert_eq!(vq.read_desc(7).next, 0);
    }

    #[test]
    fn poll_used_tracks_cursor() {
        let transport = StubTransport::modern(8);
        let mut vq = queue(&transport);
        assert_eq!(vq.poll_used(), None);

        let rings = transport.rings(0).expect("rings");
        rings.complete(3, 128);
        assert_eq!(vq.peek_used_len(), Some(128));
        assert_eq!(vq.pending_used(), 1);
        assert_eq!(vq.poll_used(), Some(UsedElem { id: 3, len: 128 }));
        assert_eq!(vq.poll_used(), None);
        assert_eq!(vq.pending_used(), 0);
    }

    #[test]
    fn cursor_survives_index_wraparound() {
        let transport = StubTransport::modern(8);
        let mut vq = queue(&transport);
        vq.avail_idx = u16::MAX;
        vq.last_used = u16::MAX;
        vq.publish(2);
        assert_eq!(vq.avail_idx(), 0);

        let rings = transport.rings(0).expect("rings");
        rings.force_used_idx(u16::MAX);
        rings.complete(2, 32);
        assert_eq!(vq.pending_used(), 1);
        assert_eq!(vq.poll_used(), Some(UsedElem { id: 2, len: 32 }));
        assert_eq!(vq.last_used, 0);
    }

    #[test]
    fn free_desc_resets_the_slot() {
        let transport = StubTransport::modern(8);
        let mut vq = queue(&transport);
        vq.fill_desc(4, PhysAddr::new(0xabc0), 96, DescriptorFlags::WRITE, 5);
        vq.free_desc(4);
        assert_eq!(vq.read_desc(4), Descriptor::default());
    }
}
