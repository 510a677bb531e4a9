//! Peer-level protocol types.
//!
//! These are the headers and status codes exchanged with the usb-guest.
//! Serialization onto the wire is the parser's job; the engine only fills
//! and interprets the fields.

use libc::c_int;
use libusb1_sys::constants::*;

use crate::error::Error;

/// Status codes reported to the peer in packet and status headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Status {
    #[default]
    Success = 0,
    Cancelled = 1,
    Inval = 2,
    Ioerror = 3,
    Stall = 4,
    Timeout = 5,
    /// Reserved, never generated by the host side.
    Babble = 6,
}

impl Status {
    /// Maps a libusb transfer status (>= 0) or a libusb error code (< 0)
    /// to the peer status space. Handling both in one conversion lets a
    /// submission error travel through the regular completion path as a
    /// synthetic transfer status, since the two code ranges do not
    /// overlap. The second value reports whether the code means the
    /// device is gone, which the caller must turn into disconnect
    /// handling.
    pub(crate) fn from_libusb(code: c_int) -> (Status, bool) {
        match code {
            LIBUSB_TRANSFER_COMPLETED => (Status::Success, false),
            LIBUSB_TRANSFER_ERROR => (Status::Ioerror, false),
            LIBUSB_TRANSFER_TIMED_OUT => (Status::Timeout, false),
            LIBUSB_TRANSFER_CANCELLED => (Status::Cancelled, false),
            LIBUSB_TRANSFER_STALL => (Status::Stall, false),
            LIBUSB_TRANSFER_NO_DEVICE => (Status::Ioerror, true),
            LIBUSB_TRANSFER_OVERFLOW => (Status::Ioerror, false),
            LIBUSB_ERROR_INVALID_PARAM => (Status::Inval, false),
            LIBUSB_ERROR_NO_DEVICE => (Status::Ioerror, true),
            LIBUSB_ERROR_TIMEOUT => (Status::Timeout, false),
            _ => (Status::Ioerror, false),
        }
    }

    /// Folds a peer status into a crate result for the public API.
    pub(crate) fn into_result(self) -> crate::error::Result<()> {
        match self {
            Status::Success => Ok(()),
            Status::Cancelled => Err(Error::Interrupted),
            Status::Inval => Err(Error::InvalidParam),
            Status::Stall => Err(Error::Pipe),
            Status::Timeout => Err(Error::Timeout),
            Status::Ioerror | Status::Babble => Err(Error::Io),
        }
    }
}

/// Device speed as reported in the device-connect header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Speed {
    Low = 0,
    Full = 1,
    High = 2,
    Super = 3,
    Unknown = 255,
}

/// Endpoint transfer types in the peer encoding. For valid endpoints
/// these equal the low two bits of the descriptor's `bmAttributes`.
pub mod ep_type {
    pub const CONTROL: u8 = 0;
    pub const ISO: u8 = 1;
    pub const BULK: u8 = 2;
    pub const INTERRUPT: u8 = 3;
    pub const INVALID: u8 = 255;
}

/// Protocol capabilities negotiated with the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cap {
    BulkStreams,
    ConnectDeviceVersion,
    Filter,
    DeviceDisconnectAck,
}

impl Cap {
    /// Bit position of the capability in the caps words.
    pub fn bit(self) -> u32 {
        match self {
            Cap::BulkStreams => 0,
            Cap::ConnectDeviceVersion => 1,
            Cap::Filter => 2,
            Cap::DeviceDisconnectAck => 3,
        }
    }
}

/// Header of a device-connect notification.
#[derive(Debug, Clone, Copy)]
pub struct DeviceConnectHeader {
    pub speed: Speed,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version_bcd: u16,
}

/// Wire image of the device-connect header sent to peers that lack the
/// connect-device-version capability. The layout must stay bit-exact
/// with old peers, hence the packed representation.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct DeviceConnectCompatHeader {
    pub speed: u8,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceConnectCompatHeader {
    /// Serializes the header in wire (little endian) order.
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0] = self.speed;
        buf[1] = self.device_class;
        buf[2] = self.device_subclass;
        buf[3] = self.device_protocol;
        buf[4..6].copy_from_slice(&self.vendor_id.to_le_bytes());
        buf[6..8].copy_from_slice(&self.product_id.to_le_bytes());
        buf
    }
}

impl From<&DeviceConnectHeader> for DeviceConnectCompatHeader {
    fn from(connect: &DeviceConnectHeader) -> Self {
        DeviceConnectCompatHeader {
            speed: connect.speed as u8,
            device_class: connect.device_class,
            device_subclass: connect.device_subclass,
            device_protocol: connect.device_protocol,
            vendor_id: connect.vendor_id,
            product_id: connect.product_id,
        }
    }
}

/// Per-interface identification sent after (re)claiming a configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct InterfaceInfo {
    pub interface_count: u32,
    pub interface: [u8; 32],
    pub interface_class: [u8; 32],
    pub interface_subclass: [u8; 32],
    pub interface_protocol: [u8; 32],
}

/// Endpoint table snapshot sent alongside [`InterfaceInfo`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EpInfo {
    pub kind: [u8; 32],
    pub interval: [u8; 32],
    pub interface: [u8; 32],
}

/// Header of a control data packet, either direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlPacketHeader {
    pub endpoint: u8,
    pub request: u8,
    pub requesttype: u8,
    pub status: Status,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

/// Header of a bulk data packet, either direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkPacketHeader {
    pub endpoint: u8,
    pub status: Status,
    pub length: u16,
}

/// Header of a single iso packet, either direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IsoPacketHeader {
    pub endpoint: u8,
    pub status: Status,
    pub length: u16,
}

/// Header of an interrupt data packet, either direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterruptPacketHeader {
    pub endpoint: u8,
    pub status: Status,
    pub length: u16,
}

/// Reply to a set/get-configuration command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigurationStatusHeader {
    pub status: Status,
    pub configuration: u8,
}

/// Reply to a set/get-alt-setting command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AltSettingStatusHeader {
    pub status: Status,
    pub interface: u8,
    pub alt: u8,
}

/// Reply to a start/stop-iso-stream command, and unsolicited stream errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoStreamStatusHeader {
    pub endpoint: u8,
    pub status: Status,
}

/// Reply to a start/stop-interrupt-receiving command, and unsolicited
/// receiver errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptReceivingStatusHeader {
    pub endpoint: u8,
    pub status: Status,
}
