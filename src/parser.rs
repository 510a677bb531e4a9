//! The binding between the engine and the external wire parser.
//!
//! The parser owns framing, capability negotiation and transport
//! buffering. The engine talks to it through [`Parser`] and receives
//! decoded commands back through [`CommandHandler`] during
//! [`Parser::do_read`]. Both directions may be driven from different
//! threads; implementations must serialize their own write path, the
//! engine serializes its own state.

use std::io;

use crate::filter::FilterRule;
use crate::proto::{
    AltSettingStatusHeader, BulkPacketHeader, Cap, ConfigurationStatusHeader, ControlPacketHeader,
    DeviceConnectHeader, EpInfo, InterfaceInfo, InterruptPacketHeader,
    InterruptReceivingStatusHeader, IsoPacketHeader, IsoStreamStatusHeader,
};

/// Flags passed to [`Parser::init`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitFlags {
    /// Run the parser in usb-host mode.
    pub usb_host: bool,
    /// The transport write callback takes ownership of buffers handed to it.
    pub write_cb_owns_buffer: bool,
}

/// Host-level conditions surfaced through [`crate::Host::read_guest_data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadStatus {
    /// Nothing special happened.
    Ok = 0,
    /// The peer's filter rejected the device.
    DeviceRejected = 1,
    /// The device could not be re-claimed and has been dropped.
    DeviceLost = 2,
}

/// The wire parser as consumed by the engine.
///
/// Payload buffers flow in both directions as owned `Vec<u8>`; handing a
/// buffer over transfers the responsibility to free it, so there is no
/// separate free routine.
pub trait Parser: Send + Sync {
    /// One-time setup: our version string, the capabilities we advertise
    /// and the protocol mode flags.
    fn init(&self, version: &str, caps: &[Cap], flags: InitFlags);

    /// Whether the peer's capabilities have been received yet.
    fn have_peer_caps(&self) -> bool;

    /// Whether the peer advertised `cap`.
    fn peer_has_cap(&self, cap: Cap) -> bool;

    /// Reads and parses guest data, invoking `handler` for every decoded
    /// command.
    fn do_read(&self, handler: &dyn CommandHandler) -> io::Result<()>;

    /// Writes buffered data towards the guest.
    fn do_write(&self) -> io::Result<()>;

    /// Whether buffered data is waiting to be written.
    fn has_data_to_write(&self) -> bool;

    fn send_device_connect(&self, connect: &DeviceConnectHeader);
    fn send_device_disconnect(&self);
    fn send_interface_info(&self, info: &InterfaceInfo);
    fn send_ep_info(&self, info: &EpInfo);
    fn send_configuration_status(&self, id: u32, status: &ConfigurationStatusHeader);
    fn send_alt_setting_status(&self, id: u32, status: &AltSettingStatusHeader);
    fn send_iso_stream_status(&self, id: u32, status: &IsoStreamStatusHeader);
    fn send_interrupt_receiving_status(&self, id: u32, status: &InterruptReceivingStatusHeader);
    fn send_control_packet(&self, id: u32, header: &ControlPacketHeader, data: &[u8]);
    fn send_bulk_packet(&self, id: u32, header: &BulkPacketHeader, data: &[u8]);
    fn send_iso_packet(&self, id: u32, header: &IsoPacketHeader, data: &[u8]);
    fn send_interrupt_packet(&self, id: u32, header: &InterruptPacketHeader, data: &[u8]);
}

/// Decoded peer commands, dispatched by the parser from within
/// [`Parser::do_read`].
pub trait CommandHandler {
    fn hello(&self, version: &str);
    fn reset(&self);
    fn set_configuration(&self, id: u32, configuration: u8);
    fn get_configuration(&self, id: u32);
    fn set_alt_setting(&self, id: u32, interface: u8, alt: u8);
    fn get_alt_setting(&self, id: u32, interface: u8);
    fn start_iso_stream(&self, id: u32, endpoint: u8, pkts_per_urb: u8, no_urbs: u8);
    fn stop_iso_stream(&self, id: u32, endpoint: u8);
    fn start_interrupt_receiving(&self, id: u32, endpoint: u8);
    fn stop_interrupt_receiving(&self, id: u32, endpoint: u8);
    fn alloc_bulk_streams(&self, id: u32, endpoints: u32, no_streams: u32);
    fn free_bulk_streams(&self, id: u32, endpoints: u32);
    fn cancel_data_packet(&self, id: u32);
    fn filter_reject(&self);
    fn filter_filter(&self, rules: Vec<FilterRule>);
    fn device_disconnect_ack(&self);
    fn control_packet(&self, id: u32, header: ControlPacketHeader, data: Vec<u8>);
    fn bulk_packet(&self, id: u32, header: BulkPacketHeader, data: Vec<u8>);
    fn iso_packet(&self, id: u32, header: IsoPacketHeader, data: Vec<u8>);
    fn interrupt_packet(&self, id: u32, header: InterruptPacketHeader, data: Vec<u8>);
}
