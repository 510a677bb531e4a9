//! Host side USB redirection engine.
//!
//! This library binds to a concrete USB device through `libusb` and
//! exposes it across a bidirectional byte stream to a remote guest
//! (typically a virtual machine) that drives the device as if it were
//! attached locally. Peer commands are translated into control, bulk,
//! interrupt and isochronous transfers; completions and stream status
//! flow back to the peer.
//!
//! Wire framing lives in an external parser, plugged in through the
//! [`Parser`] trait; decoded commands come back through
//! [`CommandHandler`]. Transport I/O stays with the caller: pump
//! [`Host::read_guest_data`] when guest data arrives and
//! [`Host::write_guest_data`] when the transport can take more, and run
//! the libusb event loop as usual.
//!
//! The engine is safe to drive from two threads: the parser read path
//! and the libusb completion path may run concurrently.

mod endpoint;
mod error;
pub mod filter;
mod host;
mod interrupt;
mod iso;
mod parser;
mod proto;
mod transfer;

#[cfg(test)]
mod test_support;

pub use crate::error::{Error, Result};
pub use crate::filter::{check_device_filter, check_filter, ClassCodes, FilterRule};
pub use crate::host::{FlushWrites, Host, OpenFlags};
pub use crate::parser::{CommandHandler, InitFlags, Parser, ReadStatus};
pub use crate::proto::{
    ep_type, AltSettingStatusHeader, BulkPacketHeader, Cap, ConfigurationStatusHeader,
    ControlPacketHeader, DeviceConnectCompatHeader, DeviceConnectHeader, EpInfo, InterfaceInfo,
    InterruptPacketHeader, InterruptReceivingStatusHeader, IsoPacketHeader, IsoStreamStatusHeader,
    Speed, Status,
};
