//! The interrupt engines: a single persistent receiving transfer per
//! interrupt-IN endpoint, resubmitted on every completion, and one-shot
//! transfers for interrupt-OUT guest packets.

use std::ptr;
use std::sync::atomic::Ordering;

use libc::c_int;
use libusb1_sys::constants::*;
use libusb1_sys::*;
use log::{debug, error, warn};

use crate::endpoint::ep_to_index;
use crate::host::{trace_data, DeviceState, HostInner};
use crate::proto::{ep_type, InterruptPacketHeader, InterruptReceivingStatusHeader, Status};
use crate::transfer::{SavedHeader, Transfer, INTERRUPT_TIMEOUT};

impl HostInner {
    fn send_interrupt_recv_status(&self, id: u32, endpoint: u8, status: Status) {
        self.parser
            .send_interrupt_receiving_status(id, &InterruptReceivingStatusHeader { endpoint, status });
    }

    /// Submits the persistent receiving transfer. On failure the slot is
    /// emptied and the caller must not touch the transfer again.
    fn submit_interrupt_in_transfer(&self, st: &mut DeviceState, ep: u8) -> Status {
        let idx = ep_to_index(ep);
        let transfer = st.endpoints[idx].interrupt_in_transfer;
        let r = unsafe { libusb_submit_transfer((*transfer).xfer.as_ptr()) };
        if r < 0 {
            error!("submitting interrupt transfer on ep {:02X}: {}", ep, r);
            unsafe { Transfer::free(transfer) };
            st.endpoints[idx].interrupt_in_transfer = ptr::null_mut();
            return Status::Stall;
        }
        Status::Success
    }

    fn alloc_interrupt_in_transfer(&self, st: &mut DeviceState, ep: u8) -> Status {
        let idx = ep_to_index(ep);
        if st.endpoints[idx].kind != ep_type::INTERRUPT {
            error!("received start interrupt packet for non interrupt ep {:02X}", ep);
            return Status::Inval;
        }
        if ep & LIBUSB_ENDPOINT_IN == 0 {
            error!("received start interrupt packet for non input ep {:02X}", ep);
            return Status::Inval;
        }

        let transfer = match Transfer::alloc(self as *const HostInner, 0) {
            Some(t) => t,
            None => return Status::Ioerror,
        };
        unsafe {
            (*transfer).buffer = vec![0u8; st.endpoints[idx].max_packetsize];
            libusb_fill_interrupt_transfer(
                (*transfer).xfer.as_ptr(),
                st.handle(),
                ep,
                (*transfer).buffer.as_mut_ptr(),
                (*transfer).buffer.len() as c_int,
                interrupt_packet_complete,
                transfer as *mut libc::c_void,
                INTERRUPT_TIMEOUT,
            );
        }
        st.endpoints[idx].interrupt_in_transfer = transfer;
        Status::Success
    }

    pub(crate) fn cancel_interrupt_in_transfer(&self, st: &mut DeviceState, ep: u8) {
        let idx = ep_to_index(ep);
        let transfer = st.endpoints[idx].interrupt_in_transfer;
        if transfer.is_null() {
            // Already stopped
            return;
        }
        unsafe {
            libusb_cancel_transfer((*transfer).xfer.as_ptr());
            (*transfer).cancelled = true;
        }
        st.cancels_pending += 1;
        st.endpoints[idx].interrupt_in_transfer = ptr::null_mut();
    }

    pub(crate) fn handle_start_interrupt_receiving(&self, id: u32, ep: u8) {
        let status;
        {
            let mut st = self.state.lock().unwrap();
            status = if self.disconnected.load(Ordering::SeqCst) {
                Status::Ioerror
            } else if !st.endpoints[ep_to_index(ep)].interrupt_in_transfer.is_null() {
                error!("received interrupt start for already active ep {:02X}", ep);
                Status::Inval
            } else {
                match self.alloc_interrupt_in_transfer(&mut st, ep) {
                    Status::Success => self.submit_interrupt_in_transfer(&mut st, ep),
                    _ => Status::Stall,
                }
            };
        }
        self.send_interrupt_recv_status(id, ep, status);
        self.flush_writes();
    }

    pub(crate) fn handle_stop_interrupt_receiving(&self, id: u32, ep: u8) {
        let mut status = Status::Success;
        if self.disconnected.load(Ordering::SeqCst) {
            status = Status::Ioerror;
        } else {
            let mut st = self.state.lock().unwrap();
            self.cancel_interrupt_in_transfer(&mut st, ep);
        }
        self.send_interrupt_recv_status(id, ep, status);
        self.flush_writes();
    }

    /// A guest interrupt packet for an output endpoint: one transfer per
    /// request, like bulk.
    pub(crate) fn handle_interrupt_packet(
        &self,
        id: u32,
        header: InterruptPacketHeader,
        data: Vec<u8>,
    ) {
        let ep = header.endpoint;
        debug!("interrupt submit ep {:02X} len {}", ep, header.length);

        if self.disconnected.load(Ordering::SeqCst) {
            self.send_interrupt_status(id, header, Status::Ioerror);
            return;
        }

        let mut st = self.state.lock().unwrap();
        let idx = ep_to_index(ep);
        if st.endpoints[idx].kind != ep_type::INTERRUPT {
            error!("received interrupt packet for non interrupt ep {:02X}", ep);
            drop(st);
            self.send_interrupt_status(id, header, Status::Inval);
            return;
        }
        if data.len() > st.endpoints[idx].max_packetsize {
            error!("received interrupt out packet larger than wMaxPacketSize");
            drop(st);
            self.send_interrupt_status(id, header, Status::Inval);
            return;
        }

        trace_data("interrupt data out:", &data);

        let transfer = match Transfer::alloc(self as *const HostInner, 0) {
            Some(t) => t,
            None => return,
        };
        unsafe {
            // Re-use the buffer the parser handed over
            (*transfer).buffer = data;
            libusb_fill_interrupt_transfer(
                (*transfer).xfer.as_ptr(),
                st.handle(),
                ep,
                (*transfer).buffer.as_mut_ptr(),
                (*transfer).buffer.len() as c_int,
                interrupt_packet_complete,
                transfer as *mut libc::c_void,
                INTERRUPT_TIMEOUT,
            );
            (*transfer).id = id;
            (*transfer).header = SavedHeader::Interrupt(header);
        }
        st.registry.insert(transfer);

        let r = unsafe { libusb_submit_transfer((*transfer).xfer.as_ptr()) };
        drop(st);
        if r < 0 {
            error!("submitting interrupt transfer on ep {:02X}: {}", ep, r);
            unsafe {
                (*(*transfer).xfer.as_ptr()).actual_length = 0;
                (*(*transfer).xfer.as_ptr()).status = r;
            }
            interrupt_packet_complete(unsafe { (*transfer).xfer.as_ptr() });
        }
    }
}

pub(crate) extern "system" fn interrupt_packet_complete(xfer: *mut libusb_transfer) {
    let transfer = unsafe { (*xfer).user_data } as *mut Transfer;
    let host = unsafe { &*(*transfer).host };
    let ep = unsafe { (*xfer).endpoint };
    let status = host.status_to_peer(unsafe { (*xfer).status });
    let mut len = unsafe { (*xfer).actual_length } as usize;
    debug!(
        "interrupt complete ep {:02X} status {:?} len {}",
        ep, status, len
    );

    if ep & LIBUSB_ENDPOINT_IN == 0 {
        // Output endpoints are easy
        let mut header = match unsafe { &(*transfer).header } {
            SavedHeader::Interrupt(h) => *h,
            _ => return,
        };
        header.status = status;
        header.length = len as u16;
        host.parser
            .send_interrupt_packet(unsafe { (*transfer).id }, &header, &[]);
        host.remove_and_free_transfer(transfer);
        host.flush_writes();
        return;
    }

    // Everything below is the persistent input receiver
    let mut st = host.state.lock().unwrap();
    if unsafe { (*transfer).cancelled } {
        st.cancels_pending -= 1;
        unsafe { Transfer::free(transfer) };
        drop(st);
        host.flush_writes();
        return;
    }

    trace_data("interrupt data in:", unsafe { &(&(*transfer).buffer)[..len] });

    let mut forward = true;
    match unsafe { (*xfer).status } {
        LIBUSB_TRANSFER_COMPLETED => {}
        LIBUSB_TRANSFER_STALL => {
            warn!("interrupt endpoint {:02X} stalled, clearing stall", ep);
            let r = unsafe { libusb_clear_halt(st.handle(), ep) };
            if r < 0 {
                // Could not clear the stall, stop receiving
                host.send_interrupt_recv_status(unsafe { (*transfer).id }, ep, Status::Stall);
                unsafe { Transfer::free(transfer) };
                st.endpoints[ep_to_index(ep)].interrupt_in_transfer = ptr::null_mut();
                drop(st);
                host.flush_writes();
                return;
            }
            unsafe { (*transfer).id = 0 };
            forward = false;
        }
        LIBUSB_TRANSFER_NO_DEVICE => {
            host.handle_disconnect();
            unsafe { Transfer::free(transfer) };
            st.endpoints[ep_to_index(ep)].interrupt_in_transfer = ptr::null_mut();
            drop(st);
            host.flush_writes();
            return;
        }
        code => {
            error!("interrupt in error on endpoint {:02X}: {}", ep, code);
            len = 0;
        }
    }

    if forward {
        let header = InterruptPacketHeader {
            endpoint: ep,
            status,
            length: len as u16,
        };
        let data = unsafe { &(&(*transfer).buffer)[..len] };
        host.parser
            .send_interrupt_packet(unsafe { (*transfer).id }, &header, data);
        unsafe { (*transfer).id += 1 };
    }

    // The submit failure path frees the transfer, so read the id first
    let id = unsafe { (*transfer).id };
    let resubmit = host.submit_interrupt_in_transfer(&mut st, ep);
    if resubmit != Status::Success {
        host.send_interrupt_recv_status(id, ep, resubmit);
    }
    drop(st);
    host.flush_writes();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::new_test_host;
    use crate::test_support::{RecordingParser, Sent};

    #[test]
    fn starting_on_a_non_interrupt_endpoint_reports_stall() {
        let parser = RecordingParser::new();
        let sent = parser.sent();
        let host = new_test_host(Box::new(parser));
        host.disconnected.store(false, Ordering::SeqCst);
        {
            let mut st = host.state.lock().unwrap();
            st.endpoints[ep_to_index(0x82)].kind = ep_type::BULK;
        }

        host.handle_start_interrupt_receiving(11, 0x82);

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Sent::InterruptRecvStatus { id, endpoint, status } => {
                assert_eq!((*id, *endpoint, *status), (11, 0x82, Status::Stall));
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn starting_on_an_output_endpoint_reports_stall() {
        let parser = RecordingParser::new();
        let sent = parser.sent();
        let host = new_test_host(Box::new(parser));
        host.disconnected.store(false, Ordering::SeqCst);
        {
            let mut st = host.state.lock().unwrap();
            st.endpoints[ep_to_index(0x02)].kind = ep_type::INTERRUPT;
            st.endpoints[ep_to_index(0x02)].max_packetsize = 8;
        }

        host.handle_start_interrupt_receiving(12, 0x02);

        let sent = sent.lock().unwrap();
        assert_eq!(sent[0].status(), Some(Status::Stall));
    }

    #[test]
    fn starting_twice_is_invalid() {
        let parser = RecordingParser::new();
        let sent = parser.sent();
        let host = new_test_host(Box::new(parser));
        host.disconnected.store(false, Ordering::SeqCst);

        let dummy = Transfer::alloc(ptr::null(), 0).unwrap();
        {
            let mut st = host.state.lock().unwrap();
            let slot = &mut st.endpoints[ep_to_index(0x83)];
            slot.kind = ep_type::INTERRUPT;
            slot.max_packetsize = 8;
            slot.interrupt_in_transfer = dummy;
        }

        host.handle_start_interrupt_receiving(13, 0x83);

        {
            let sent = sent.lock().unwrap();
            assert_eq!(sent[0].status(), Some(Status::Inval));
        }

        let mut st = host.state.lock().unwrap();
        st.endpoints[ep_to_index(0x83)].interrupt_in_transfer = ptr::null_mut();
        unsafe { Transfer::free(dummy) };
    }

    #[test]
    fn oversized_out_packets_are_rejected() {
        let parser = RecordingParser::new();
        let sent = parser.sent();
        let host = new_test_host(Box::new(parser));
        host.disconnected.store(false, Ordering::SeqCst);
        {
            let mut st = host.state.lock().unwrap();
            let slot = &mut st.endpoints[ep_to_index(0x02)];
            slot.kind = ep_type::INTERRUPT;
            slot.max_packetsize = 8;
        }

        host.handle_interrupt_packet(
            21,
            InterruptPacketHeader {
                endpoint: 0x02,
                status: Status::Success,
                length: 9,
            },
            vec![0u8; 9],
        );

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Sent::InterruptPacket { id, header, data } => {
                assert_eq!(*id, 21);
                assert_eq!(header.status, Status::Inval);
                assert_eq!(header.length, 0);
                assert!(data.is_empty());
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn stopping_an_idle_receiver_succeeds() {
        let parser = RecordingParser::new();
        let sent = parser.sent();
        let host = new_test_host(Box::new(parser));
        host.disconnected.store(false, Ordering::SeqCst);
        {
            let mut st = host.state.lock().unwrap();
            st.endpoints[ep_to_index(0x83)].kind = ep_type::INTERRUPT;
        }

        host.handle_stop_interrupt_receiving(31, 0x83);

        let sent = sent.lock().unwrap();
        assert_eq!(sent[0].status(), Some(Status::Success));
    }
}
