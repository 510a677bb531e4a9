//! The isochronous stream engine: a prefilled ring of in-flight
//! transfers per endpoint.
//!
//! Input streams submit the whole ring up front and resubmit each
//! transfer as it completes. Output streams buffer guest packets into
//! the ring and only bring it up once half the capacity is queued, so a
//! bursty guest cannot immediately underrun the device.

use std::ptr;
use std::sync::atomic::Ordering;

use libc::{c_int, c_uint};
use libusb1_sys::constants::*;
use libusb1_sys::*;
use log::{debug, error, warn};

use crate::endpoint::{
    ep_to_index, MAX_ISO_PACKETS_PER_TRANSFER, MAX_ISO_TRANSFER_COUNT,
};
use crate::host::HostInner;
use crate::proto::{ep_type, IsoPacketHeader, IsoStreamStatusHeader, Status};
use crate::transfer::{iso_packet_buffer, iso_packet_desc, Transfer, ISO_SUBMITTED, ISO_TIMEOUT};

use crate::host::DeviceState;

/// Outcome of a transfer-level or packet-level status check.
enum IsoResult {
    Ok,
    /// This packet (or transfer) is bad, but the stream carries on.
    PacketBorked,
    /// The stream is down: no resubmit, no per-packet processing. Any
    /// status message the guest needs has already been sent.
    StreamBorked,
}

impl HostInner {
    fn send_iso_status(&self, id: u32, endpoint: u8, status: Status) {
        self.parser
            .send_iso_stream_status(id, &IsoStreamStatusHeader { endpoint, status });
    }

    /// Hands one ring transfer to libusb. On failure the whole stream is
    /// torn down; the caller must not touch the transfer afterwards.
    fn submit_iso_transfer(&self, st: &mut DeviceState, transfer: *mut Transfer) -> Status {
        let xfer = unsafe { (*transfer).xfer.as_ptr() };
        let r = unsafe { libusb_submit_transfer(xfer) };
        if r < 0 {
            let ep = unsafe { (*xfer).endpoint };
            error!(
                "submitting iso transfer on ep {:02X}: {}, stopping stream",
                ep, r
            );
            self.cancel_iso_stream(st, ep);
            return self.status_to_peer(r);
        }
        unsafe { (*transfer).iso_packet_idx = ISO_SUBMITTED };
        Status::Success
    }

    /// Checks a transfer or per-packet status code. On a stall this
    /// performs the full recovery dance: cancel the stream, clear the
    /// halt, re-allocate with the same geometry and, for input
    /// endpoints, resubmit. Successful recovery is transparent to the
    /// guest; every failure sends a single stall status.
    fn handle_iso_status(&self, st: &mut DeviceState, id: u32, ep: u8, code: c_int) -> IsoResult {
        match code {
            LIBUSB_TRANSFER_COMPLETED => IsoResult::Ok,
            // Some backends report scheduling gaps with a bare errno
            c if c == -libc::EXDEV => IsoResult::Ok,
            LIBUSB_TRANSFER_CANCELLED => {
                // Stream was intentionally stopped
                IsoResult::StreamBorked
            }
            LIBUSB_TRANSFER_STALL => {
                warn!("iso stream on endpoint {:02X} stalled, clearing stall", ep);
                let idx = ep_to_index(ep);
                let pkts_per_transfer = st.endpoints[idx].iso_pkts_per_transfer;
                let transfer_count = st.endpoints[idx].iso_transfer_count;

                self.cancel_iso_stream(st, ep);
                let r = unsafe { libusb_clear_halt(st.handle(), ep) };
                if r < 0 {
                    self.send_iso_status(id, ep, Status::Stall);
                    return IsoResult::StreamBorked;
                }
                if self.alloc_iso_stream(st, ep, pkts_per_transfer, transfer_count)
                    != Status::Success
                {
                    self.send_iso_status(id, ep, Status::Stall);
                    return IsoResult::StreamBorked;
                }
                if ep & LIBUSB_ENDPOINT_IN != 0 {
                    for i in 0..transfer_count as usize {
                        let transfer = st.endpoints[idx].iso_transfers[i];
                        unsafe { (*transfer).id = i as u32 * pkts_per_transfer as u32 };
                        if self.submit_iso_transfer(st, transfer) != Status::Success {
                            self.send_iso_status(id, ep, Status::Stall);
                            return IsoResult::StreamBorked;
                        }
                    }
                    st.endpoints[idx].iso_started = true;
                }
                // Stall cleared, no status message needed
                IsoResult::StreamBorked
            }
            LIBUSB_TRANSFER_NO_DEVICE => {
                self.handle_disconnect();
                IsoResult::StreamBorked
            }
            _ => {
                error!("iso stream error on endpoint {:02X}: {}", ep, code);
                IsoResult::PacketBorked
            }
        }
    }

    fn alloc_iso_stream(
        &self,
        st: &mut DeviceState,
        ep: u8,
        pkts_per_transfer: u8,
        transfer_count: u8,
    ) -> Status {
        let idx = ep_to_index(ep);
        if st.endpoints[idx].kind != ep_type::ISO {
            error!("start iso stream on non iso endpoint {:02X}", ep);
            return Status::Inval;
        }
        if pkts_per_transfer < 1
            || pkts_per_transfer as usize > MAX_ISO_PACKETS_PER_TRANSFER
            || transfer_count < 1
            || transfer_count as usize > MAX_ISO_TRANSFER_COUNT
        {
            error!(
                "start iso stream with invalid pkts_per_urb {} or no_urbs {}",
                pkts_per_transfer, transfer_count
            );
            return Status::Inval;
        }
        if st.endpoints[idx].iso_transfer_count != 0 {
            error!("received iso start for already started iso stream");
            return Status::Inval;
        }

        debug!(
            "allocating iso stream ep {:02X} packet-size {} pkts {} urbs {}",
            ep, st.endpoints[idx].max_packetsize, pkts_per_transfer, transfer_count
        );
        let handle = st.handle();
        let buf_size = st.endpoints[idx].max_packetsize * pkts_per_transfer as usize;
        for i in 0..transfer_count as usize {
            let transfer = match Transfer::alloc(self as *const HostInner, pkts_per_transfer as c_int)
            {
                Some(t) => t,
                None => {
                    for j in 0..i {
                        unsafe { Transfer::free(st.endpoints[idx].iso_transfers[j]) };
                        st.endpoints[idx].iso_transfers[j] = ptr::null_mut();
                    }
                    return Status::Ioerror;
                }
            };
            unsafe {
                (*transfer).buffer = vec![0u8; buf_size];
                libusb_fill_iso_transfer(
                    (*transfer).xfer.as_ptr(),
                    handle,
                    ep,
                    (*transfer).buffer.as_mut_ptr(),
                    buf_size as c_int,
                    pkts_per_transfer as c_int,
                    iso_packet_complete,
                    transfer as *mut libc::c_void,
                    ISO_TIMEOUT,
                );
                libusb_set_iso_packet_lengths(
                    (*transfer).xfer.as_ptr(),
                    st.endpoints[idx].max_packetsize as c_uint,
                );
            }
            st.endpoints[idx].iso_transfers[i] = transfer;
        }

        let slot = &mut st.endpoints[idx];
        slot.iso_out_idx = 0;
        slot.iso_out_queued = 0;
        slot.iso_drop_packets = 0;
        slot.iso_pkts_per_transfer = pkts_per_transfer;
        slot.iso_transfer_count = transfer_count;
        Status::Success
    }

    /// Cancels submitted ring transfers (their records are freed by the
    /// completion callback), frees idle ones and zeroes the ring.
    pub(crate) fn cancel_iso_stream(&self, st: &mut DeviceState, ep: u8) {
        let idx = ep_to_index(ep);
        for i in 0..st.endpoints[idx].iso_transfer_count as usize {
            let transfer = st.endpoints[idx].iso_transfers[i];
            if transfer.is_null() {
                continue;
            }
            if unsafe { (*transfer).iso_packet_idx } == ISO_SUBMITTED {
                unsafe {
                    libusb_cancel_transfer((*transfer).xfer.as_ptr());
                    (*transfer).cancelled = true;
                }
                st.cancels_pending += 1;
            } else {
                unsafe { Transfer::free(transfer) };
            }
            st.endpoints[idx].iso_transfers[i] = ptr::null_mut();
        }

        let slot = &mut st.endpoints[idx];
        slot.iso_out_idx = 0;
        slot.iso_out_queued = 0;
        slot.iso_started = false;
        slot.iso_drop_packets = 0;
        slot.iso_pkts_per_transfer = 0;
        slot.iso_transfer_count = 0;
    }

    pub(crate) fn handle_start_iso_stream(&self, id: u32, ep: u8, pkts_per_urb: u8, no_urbs: u8) {
        let mut status;
        {
            let mut st = self.state.lock().unwrap();
            if self.disconnected.load(Ordering::SeqCst) {
                status = Status::Ioerror;
            } else {
                status = self.alloc_iso_stream(&mut st, ep, pkts_per_urb, no_urbs);
                if status != Status::Success {
                    status = Status::Stall;
                } else if ep & LIBUSB_ENDPOINT_IN != 0 {
                    // Input streams start reading right away
                    let idx = ep_to_index(ep);
                    for i in 0..no_urbs as usize {
                        let transfer = st.endpoints[idx].iso_transfers[i];
                        unsafe { (*transfer).id = i as u32 * pkts_per_urb as u32 };
                        if self.submit_iso_transfer(&mut st, transfer) != Status::Success {
                            status = Status::Stall;
                            break;
                        }
                    }
                    if status == Status::Success {
                        st.endpoints[idx].iso_started = true;
                    }
                }
            }
        }
        self.send_iso_status(id, ep, status);
        self.flush_writes();
    }

    pub(crate) fn handle_stop_iso_stream(&self, id: u32, ep: u8) {
        let mut status = Status::Success;
        if self.disconnected.load(Ordering::SeqCst) {
            status = Status::Ioerror;
        } else {
            let mut st = self.state.lock().unwrap();
            self.cancel_iso_stream(&mut st, ep);
        }
        self.send_iso_status(id, ep, status);
        self.flush_writes();
    }

    /// A guest iso packet for an output stream: validate, buffer into the
    /// ring, and submit following the start policy.
    pub(crate) fn handle_iso_packet(&self, id: u32, header: IsoPacketHeader, data: Vec<u8>) {
        let ep = header.endpoint;
        let mut status = Status::Success;
        {
            let mut st = self.state.lock().unwrap();
            let idx = ep_to_index(ep);
            if self.disconnected.load(Ordering::SeqCst) {
                status = Status::Ioerror;
            } else if st.endpoints[idx].kind != ep_type::ISO {
                error!("received iso packet for non iso ep {:02X}", ep);
                status = Status::Inval;
            } else if st.endpoints[idx].iso_transfer_count == 0 {
                error!("received iso out packet for non started iso stream");
                status = Status::Inval;
            } else if data.len() > st.endpoints[idx].max_packetsize {
                error!("received iso out packet larger than wMaxPacketSize");
                status = Status::Inval;
            } else if st.endpoints[idx].iso_drop_packets > 0 {
                st.endpoints[idx].iso_drop_packets -= 1;
            } else {
                status = self.queue_iso_out_packet(&mut st, id, ep, &data);
            }
        }
        if status != Status::Success {
            self.send_iso_status(id, ep, status);
            self.flush_writes();
        }
    }

    fn queue_iso_out_packet(
        &self,
        st: &mut DeviceState,
        id: u32,
        ep: u8,
        data: &[u8],
    ) -> Status {
        let idx = ep_to_index(ep);
        let pkts_per_transfer = st.endpoints[idx].iso_pkts_per_transfer as usize;
        let transfer_count = st.endpoints[idx].iso_transfer_count as usize;

        let i = st.endpoints[idx].iso_out_idx as usize;
        let transfer = st.endpoints[idx].iso_transfers[i];
        let mut j = unsafe { (*transfer).iso_packet_idx };
        if j == ISO_SUBMITTED {
            debug!("overflow of iso out queue on ep {:02X}, dropping packet", ep);
            // The stream is interrupted anyway; drop enough packets to
            // get back to the target buffer size
            st.endpoints[idx].iso_drop_packets =
                ((pkts_per_transfer * transfer_count) / 2) as u32;
            return Status::Success;
        }

        // The first packet's id names the whole urb
        if j == 0 {
            unsafe { (*transfer).id = id };
        }
        unsafe {
            let xfer = (*transfer).xfer.as_ptr();
            let dst = iso_packet_buffer(xfer, j as usize);
            ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
            (*iso_packet_desc(xfer, j as usize)).length = data.len() as c_uint;
        }
        debug!(
            "iso-out queue ep {:02X} urb {} pkt {} len {} id {}",
            ep,
            i,
            j,
            data.len(),
            unsafe { (*transfer).id }
        );

        j += 1;
        unsafe { (*transfer).iso_packet_idx = j };
        st.endpoints[idx].iso_out_queued += 1;
        if j as usize == pkts_per_transfer {
            st.endpoints[idx].iso_out_idx = ((i + 1) % transfer_count) as u8;
        }

        if st.endpoints[idx].iso_started {
            if j as usize == pkts_per_transfer
                && self.submit_iso_transfer(st, transfer) != Status::Success
            {
                return Status::Stall;
            }
        } else if st.endpoints[idx].iso_out_queued as usize
            >= (pkts_per_transfer * transfer_count) / 2
        {
            // Half of the ring is buffered; bring the stream up by
            // submitting the first half of the urbs
            debug!("iso-out starting stream on ep {:02X}", ep);
            for k in 0..transfer_count / 2 {
                let transfer = st.endpoints[idx].iso_transfers[k];
                if self.submit_iso_transfer(st, transfer) != Status::Success {
                    return Status::Stall;
                }
            }
            st.endpoints[idx].iso_started = true;
        }
        Status::Success
    }
}

pub(crate) extern "system" fn iso_packet_complete(xfer: *mut libusb_transfer) {
    let transfer = unsafe { (*xfer).user_data } as *mut Transfer;
    let host = unsafe { &*(*transfer).host };
    let ep = unsafe { (*xfer).endpoint };
    let is_in = ep & LIBUSB_ENDPOINT_IN != 0;

    let mut st = host.state.lock().unwrap();
    if unsafe { (*transfer).cancelled } {
        st.cancels_pending -= 1;
        unsafe { Transfer::free(transfer) };
        drop(st);
        host.flush_writes();
        return;
    }

    // Mark the transfer completed, iow no longer submitted
    unsafe { (*transfer).iso_packet_idx = 0 };

    let num_iso_packets = unsafe { (*xfer).num_iso_packets };
    let code = unsafe { (*xfer).status };
    let completed_id = unsafe { (*transfer).id };

    let mut do_resubmit = false;
    match host.handle_iso_status(&mut st, completed_id, ep, code) {
        IsoResult::Ok => {
            // Check per packet status and forward input payloads
            let mut stream_ok = true;
            for i in 0..num_iso_packets as usize {
                let (pkt_code, mut len) = unsafe {
                    let desc = &*iso_packet_desc(xfer, i);
                    (desc.status, desc.actual_length as usize)
                };
                let status = host.status_to_peer(pkt_code);
                match host.handle_iso_status(&mut st, unsafe { (*transfer).id }, ep, pkt_code) {
                    IsoResult::Ok => {}
                    IsoResult::PacketBorked => {
                        if is_in {
                            len = 0;
                        } else {
                            // At most one iso status message per urb
                            host.send_iso_status(unsafe { (*transfer).id }, ep, status);
                            stream_ok = false;
                            break;
                        }
                    }
                    IsoResult::StreamBorked => {
                        stream_ok = false;
                        break;
                    }
                }
                if is_in {
                    let id = unsafe { (*transfer).id };
                    debug!("iso-in complete ep {:02X} pkt {} len {} id {}", ep, i, len, id);
                    let header = IsoPacketHeader {
                        endpoint: ep,
                        status,
                        length: len as u16,
                    };
                    let data =
                        unsafe { std::slice::from_raw_parts(iso_packet_buffer(xfer, i), len) };
                    host.parser.send_iso_packet(id, &header, data);
                    unsafe { (*transfer).id += 1 };
                } else {
                    debug!(
                        "iso-out complete ep {:02X} pkt {} len {} id {}",
                        ep,
                        i,
                        len,
                        unsafe { (*transfer).id }
                    );
                }
            }

            if stream_ok {
                if is_in {
                    do_resubmit = true;
                } else {
                    // With no transfer submitted anywhere the stream has
                    // underrun; re-arm it through the half-fill rule.
                    let idx = ep_to_index(ep);
                    let count = st.endpoints[idx].iso_transfer_count as usize;
                    let any_submitted = (0..count).any(|i| {
                        let t = st.endpoints[idx].iso_transfers[i];
                        !t.is_null() && unsafe { (*t).iso_packet_idx } == ISO_SUBMITTED
                    });
                    if !any_submitted {
                        debug!("underflow of iso out queue on ep {:02X}", ep);
                        // Re-fill buffers before submitting urbs again
                        for i in 0..count {
                            let t = st.endpoints[idx].iso_transfers[i];
                            if !t.is_null() {
                                unsafe { (*t).iso_packet_idx = 0 };
                            }
                        }
                        let slot = &mut st.endpoints[idx];
                        slot.iso_out_idx = 0;
                        slot.iso_started = false;
                        slot.iso_drop_packets = 0;
                        slot.iso_out_queued = 0;
                    }
                }
            }
        }
        IsoResult::PacketBorked => {
            let status = host.status_to_peer(code);
            if is_in {
                let header = IsoPacketHeader {
                    endpoint: ep,
                    status,
                    length: 0,
                };
                host.parser.send_iso_packet(completed_id, &header, &[]);
                unsafe { (*transfer).id += num_iso_packets as u32 };
                do_resubmit = true;
            } else {
                host.send_iso_status(completed_id, ep, status);
            }
        }
        IsoResult::StreamBorked => {}
    }

    if do_resubmit {
        // Skip over the ids carried by the other in-flight transfers of
        // the ring
        let idx = ep_to_index(ep);
        let transfer_count = st.endpoints[idx].iso_transfer_count as u32;
        unsafe {
            (*transfer).id += (transfer_count - 1) * num_iso_packets as u32;
        }
        let resubmit_id = unsafe { (*transfer).id };
        if host.submit_iso_transfer(&mut st, transfer) != Status::Success {
            host.send_iso_status(resubmit_id, ep, Status::Stall);
        }
    }

    drop(st);
    host.flush_writes();
}
