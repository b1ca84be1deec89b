//! Shared test support: a heap-backed platform with identity physical
//! addressing, device-side ring accessors for fake hypervisors, and a
//! register-recording stub transport.

use std::alloc::{alloc, dealloc, Layout};
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;
use std::vec::Vec;

use crate::endian::WireFormat;
use crate::platform::{PhysAddr, Platform};
use crate::queue::Descriptor;
use crate::transport::{DeviceStatus, QueueNotifier, Transport, TransportError};

/// Hosted platform: plain heap allocations, physical address == virtual
/// address. Lets a fake device dereference ring contents directly.
pub(crate) struct TestPlatform;

impl Platform for TestPlatform {
    fn alloc_aligned(size: usize, align: usize) -> Option<(NonNull<u8>, PhysAddr)> {
        let layout = Layout::from_size_align(size, align).ok()?;
        // SAFETY: layout has non-zero size; callers guarantee size > 0.
        let ptr = unsafe { alloc(layout) };
        NonNull::new(ptr).map(|va| (va, PhysAddr::new(va.as_ptr() as u64)))
    }

    unsafe fn free_aligned(va: NonNull<u8>, size: usize, align: usize) {
        let layout = Layout::from_size_align(size, align).expect("layout was valid at alloc");
        dealloc(va.as_ptr(), layout);
    }
}

/// Read guest memory through the identity mapping.
pub(crate) fn read_guest(pa: u64, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    // SAFETY: test allocations are identity-mapped and outlive the rings
    // that reference them.
    unsafe { core::ptr::copy_nonoverlapping(pa as *const u8, out.as_mut_ptr(), len) };
    out
}

/// Write guest memory through the identity mapping.
pub(crate) fn write_guest(pa: u64, bytes: &[u8]) {
    // SAFETY: as in `read_guest`.
    unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), pa as *mut u8, bytes.len()) };
}

/// Device-side view of one published virtqueue: walks the available ring,
/// reads descriptors, and completes chains onto the used ring the way a
/// hypervisor would.
#[derive(Clone)]
pub(crate) struct DeviceRings {
    desc: u64,
    avail: u64,
    used: u64,
    size: u16,
    wire: WireFormat,
    last_avail: Cell<u16>,
}

impl DeviceRings {
    pub(crate) fn new(desc: u64, avail: u64, used: u64, size: u16, wire: WireFormat) -> Self {
        Self {
            desc,
            avail,
            used,
            size,
            wire,
            last_avail: Cell::new(0),
        }
    }

    fn read16(&self, pa: u64) -> u16 {
        // SAFETY: ring addresses come from a live queue allocation.
        self.wire.from_dev16(unsafe { (pa as *const u16).read_volatile() })
    }

    fn write16(&self, pa: u64, value: u16) {
        // SAFETY: as in `read16`.
        unsafe { (pa as *mut u16).write_volatile(self.wire.to_dev16(value)) };
    }

    fn write32(&self, pa: u64, value: u32) {
        // SAFETY: as in `read16`.
        unsafe { (pa as *mut u32).write_volatile(self.wire.to_dev32(value)) };
    }

    pub(crate) fn avail_idx(&self) -> u16 {
        self.read16(self.avail + 2)
    }

    pub(crate) fn avail_entry(&self, slot: u16) -> u16 {
        self.read16(self.avail + 4 + 2 * (slot % self.size) as u64)
    }

    /// Next chain head the guest published, if any.
    pub(crate) fn pop_avail(&self) -> Option<u16> {
        let cursor = self.last_avail.get();
        if cursor == self.avail_idx() {
            return None;
        }
        let head = self.avail_entry(cursor % self.size);
        self.last_avail.set(cursor.wrapping_add(1));
        Some(head)
    }

    /// Decoded descriptor table entry.
    pub(crate) fn desc(&self, id: u16) -> Descriptor {
        let base = self.desc + 16 * (id % self.size) as u64;
        // SAFETY: descriptor table spans size entries from `desc`.
        unsafe {
            Descriptor {
                addr: self.wire.from_dev64((base as *const u64).read_volatile()),
                len: self.wire.from_dev32(((base + 8) as *const u32).read_volatile()),
                flags: self.read16(base + 12),
                next: self.read16(base + 14),
            }
        }
    }

    pub(crate) fn used_idx(&self) -> u16 {
        self.read16(self.used + 2)
    }

    /// Overwrite the device-side used index (wraparound tests).
    pub(crate) fn force_used_idx(&self, value: u16) {
        self.write16(self.used + 2, value);
    }

    /// Publish one completion on the used ring.
    pub(crate) fn complete(&self, id: u32, len: u32) {
        let idx = self.used_idx();
        let slot = (idx % self.size) as u64;
        let entry = self.used + 4 + 8 * slot;
        self.write32(entry, id);
        self.write32(entry + 4, len);
        self.write16(self.used + 2, idx.wrapping_add(1));
    }
}

/// Minimal recording transport for queue and negotiation tests: registers
/// behave, nothing services the rings.
pub(crate) struct StubTransport {
    legacy: bool,
    queue_max: u16,
    status: Cell<u8>,
    status_writes: RefCell<Vec<u8>>,
    host_features: Cell<u64>,
    driver_features: Cell<u64>,
    veto_features_ok: Cell<bool>,
    selected: Cell<u16>,
    queue_sizes: Cell<[u16; 4]>,
    rings: RefCell<[Option<DeviceRings>; 4]>,
    notified: RefCell<Vec<u16>>,
}

impl StubTransport {
    pub(crate) fn legacy(queue_max: u16) -> Self {
        Self::build(true, queue_max)
    }

    pub(crate) fn modern(queue_max: u16) -> Self {
        Self::build(false, queue_max)
    }

    fn build(legacy: bool, queue_max: u16) -> Self {
        Self {
            legacy,
            queue_max,
            status: Cell::new(0),
            status_writes: RefCell::new(Vec::new()),
            host_features: Cell::new(0),
            driver_features: Cell::new(0),
            veto_features_ok: Cell::new(false),
            selected: Cell::new(0),
            queue_sizes: Cell::new([0; 4]),
            rings: RefCell::new([None, None, None, None]),
            notified: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn set_host_features(&self, features: u64) {
        self.host_features.set(features);
    }

    /// Make the device clear FEATURES_OK whenever the driver sets it.
    pub(crate) fn veto_features_ok(&self) {
        self.veto_features_ok.set(true);
    }

    pub(crate) fn status_writes(&self) -> Vec<u8> {
        self.status_writes.borrow().clone()
    }

    pub(crate) fn clear_status_log(&self) {
        self.status_writes.borrow_mut().clear();
    }

    /// Device-side view of the rings published for `queue_index`.
    pub(crate) fn rings(&self, queue_index: u16) -> Option<DeviceRings> {
        self.rings.borrow()[queue_index as usize].clone()
    }
}

impl QueueNotifier for StubTransport {
    fn notify_queue(&self, queue_index: u16) -> Result<(), TransportError> {
        self.notified.borrow_mut().push(queue_index);
        Ok(())
    }
}

impl Transport for StubTransport {
    fn device_id(&self) -> u32 {
        0
    }

    fn is_legacy(&self) -> bool {
        self.legacy
    }

    fn reset(&self) -> Result<(), TransportError> {
        self.status.set(0);
        Ok(())
    }

    fn status(&self) -> DeviceStatus {
        DeviceStatus::from_bits_truncate(self.status.get())
    }

    fn set_status(&self, status: DeviceStatus) {
        self.status_writes.borrow_mut().push(status.bits());
        let mut stored = status;
        if self.veto_features_ok.get() {
            stored.remove(DeviceStatus::FEATURES_OK);
        }
        self.status.set(stored.bits());
    }

    fn read_device_features(&self, select: u32) -> u32 {
        (self.host_features.get() >> (32 * select as u64)) as u32
    }

    fn write_driver_features(&self, select: u32, value: u32) {
        let shift = 32 * select as u64;
        let mask = !(0xFFFF_FFFFu64 << shift);
        self.driver_features
            .set((self.driver_features.get() & mask) | ((value as u64) << shift));
    }

    fn select_queue(&self, queue_index: u16) -> Result<(), TransportError> {
        if queue_index >= 4 {
            return Err(TransportError::QueueUnavailable);
        }
        self.selected.set(queue_index);
        Ok(())
    }

    fn queue_max_size(&self) -> Result<u16, TransportError> {
        Ok(self.queue_max)
    }

    fn set_queue_size(&self, size: u16) -> Result<(), TransportError> {
        let mut sizes = self.queue_sizes.get();
        sizes[self.selected.get() as usize] = size;
        self.queue_sizes.set(sizes);
        Ok(())
    }

    fn set_queue_addresses(
        &self,
        desc: PhysAddr,
        avail: PhysAddr,
        used: PhysAddr,
    ) -> Result<(), TransportError> {
        let index = self.selected.get() as usize;
        let wire = if self.legacy {
            WireFormat::LEGACY
        } else {
            WireFormat::MODERN
        };
        self.rings.borrow_mut()[index] = Some(DeviceRings::new(
            desc.as_u64(),
            avail.as_u64(),
            used.as_u64(),
            self.queue_sizes.get()[index],
            wire,
        ));
        Ok(())
    }

    fn set_queue_ready(&self, _ready: bool) -> Result<(), TransportError> {
        Ok(())
    }

    fn queue_term(&self, _queue_index: u16) -> Result<(), TransportError> {
        Ok(())
    }

    fn read_config(&self, _offset: usize, out: &mut [u8]) -> Result<(), TransportError> {
        out.fill(0);
        Ok(())
    }

    fn interrupt_status(&self) -> u32 {
        0
    }

    fn ack_interrupt(&self, _status: u32) {}
}
