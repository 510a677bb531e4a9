//! Per-URB transfer records and the in-flight registry.

use std::collections::HashMap;
use std::ptr::{self, NonNull};

use libc::{c_int, c_uint, c_void};
use libusb1_sys::*;

use crate::host::HostInner;
use crate::proto::{BulkPacketHeader, ControlPacketHeader, InterruptPacketHeader};

/// USB specifies a 5 second max timeout.
pub(crate) const CTRL_TIMEOUT: c_uint = 5000;
pub(crate) const BULK_TIMEOUT: c_uint = 5000;
pub(crate) const ISO_TIMEOUT: c_uint = 1000;
/// No timeout for interrupt transfers.
pub(crate) const INTERRUPT_TIMEOUT: c_uint = 0;

/// `iso_packet_idx` value marking a transfer as handed to libusb.
pub(crate) const ISO_SUBMITTED: c_int = -1;

/// The peer header that triggered a transfer, replayed at completion
/// time. Iso transfers carry no saved header; their packet headers are
/// rebuilt per packet.
pub(crate) enum SavedHeader {
    None,
    Control(ControlPacketHeader),
    Bulk(BulkPacketHeader),
    Interrupt(InterruptPacketHeader),
}

/// State of one URB. The record and its libusb transfer are a pair: the
/// record owns the transfer and its payload buffer, the transfer's
/// `user_data` is a non-owning back-reference to the record. Records are
/// handled as raw pointers (`Box::into_raw` at allocation,
/// `Box::from_raw` in [`Transfer::free`]) so that ownership can ride
/// along with the in-flight transfer across the completion callback.
pub(crate) struct Transfer {
    /// Back pointer to the host; valid for the record's whole life
    /// because the host drains all transfers before going away.
    pub host: *const HostInner,
    pub xfer: NonNull<libusb_transfer>,
    /// Payload storage the libusb transfer points into. Moving the `Vec`
    /// value does not move the heap block, so the pointer handed to
    /// libusb stays valid.
    pub buffer: Vec<u8>,
    pub id: u32,
    pub cancelled: bool,
    pub iso_packet_idx: c_int,
    pub header: SavedHeader,
}

impl Transfer {
    /// Allocates a record plus its libusb transfer and links the two.
    /// Returns None when libusb cannot allocate, in which case the
    /// triggering packet is dropped just like the out-of-memory path of
    /// any other transport.
    pub fn alloc(host: *const HostInner, iso_packets: c_int) -> Option<*mut Transfer> {
        let xfer = NonNull::new(unsafe { libusb_alloc_transfer(iso_packets) })?;
        let record = Box::into_raw(Box::new(Transfer {
            host,
            xfer,
            buffer: Vec::new(),
            id: 0,
            cancelled: false,
            iso_packet_idx: 0,
            header: SavedHeader::None,
        }));
        unsafe { (*xfer.as_ptr()).user_data = record as *mut c_void };
        Some(record)
    }

    /// Frees a record and its libusb transfer.
    ///
    /// # Safety
    /// `transfer` must come from [`Transfer::alloc`], must not be in
    /// flight with libusb, and must not be used afterwards.
    pub unsafe fn free(transfer: *mut Transfer) {
        if transfer.is_null() {
            return;
        }
        let record = Box::from_raw(transfer);
        libusb_free_transfer(record.xfer.as_ptr());
    }
}

/// Pointer to the `i`th iso packet descriptor of a transfer.
pub(crate) unsafe fn iso_packet_desc(
    xfer: *mut libusb_transfer,
    i: usize,
) -> *mut libusb_iso_packet_descriptor {
    ptr::addr_of_mut!((*xfer).iso_packet_desc)
        .cast::<libusb_iso_packet_descriptor>()
        .add(i)
}

/// Start of the `i`th iso packet inside the transfer buffer. Packets
/// are laid out back to back, each taking its descriptor's length.
pub(crate) unsafe fn iso_packet_buffer(xfer: *mut libusb_transfer, i: usize) -> *mut u8 {
    let mut offset = 0isize;
    for j in 0..i {
        offset += (*iso_packet_desc(xfer, j)).length as isize;
    }
    (*xfer).buffer.offset(offset)
}

/// The in-flight control, bulk and interrupt-OUT transfers, keyed by
/// peer id. Iso rings and interrupt-IN transfers live in their endpoint
/// slots instead. Exists to support cancel-by-id across the two actors;
/// all access happens under the host lock.
#[derive(Default)]
pub(crate) struct Registry {
    transfers: HashMap<u32, *mut Transfer>,
}

impl Registry {
    pub fn insert(&mut self, transfer: *mut Transfer) {
        let id = unsafe { (*transfer).id };
        self.transfers.insert(id, transfer);
    }

    /// Removes `transfer` if it is still the one registered under its id.
    /// A peer that reuses a live id replaces the registry entry; the
    /// replaced transfer then completes without touching the newcomer.
    pub fn remove(&mut self, transfer: *mut Transfer) {
        let id = unsafe { (*transfer).id };
        if self.transfers.get(&id) == Some(&transfer) {
            self.transfers.remove(&id);
        }
    }

    pub fn find(&self, id: u32) -> Option<*mut Transfer> {
        self.transfers.get(&id).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = *mut Transfer> + '_ {
        self.transfers.values().copied()
    }
}
