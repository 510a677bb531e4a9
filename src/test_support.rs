//! A recording parser stand-in for unit tests.

use std::io;
use std::sync::{Arc, Mutex};

use crate::parser::{CommandHandler, InitFlags, Parser};
use crate::proto::{
    AltSettingStatusHeader, BulkPacketHeader, Cap, ConfigurationStatusHeader, ControlPacketHeader,
    DeviceConnectHeader, EpInfo, InterfaceInfo, InterruptPacketHeader,
    InterruptReceivingStatusHeader, IsoPacketHeader, IsoStreamStatusHeader, Status,
};

/// Everything the engine handed to the parser for sending.
#[derive(Debug, Clone)]
pub(crate) enum Sent {
    DeviceConnect(DeviceConnectHeader),
    DeviceDisconnect,
    InterfaceInfo(InterfaceInfo),
    EpInfo(EpInfo),
    ConfigurationStatus {
        id: u32,
        status: Status,
        configuration: u8,
    },
    AltSettingStatus {
        id: u32,
        status: Status,
        interface: u8,
        alt: u8,
    },
    IsoStreamStatus {
        id: u32,
        endpoint: u8,
        status: Status,
    },
    InterruptRecvStatus {
        id: u32,
        endpoint: u8,
        status: Status,
    },
    ControlPacket {
        id: u32,
        header: ControlPacketHeader,
        data: Vec<u8>,
    },
    BulkPacket {
        id: u32,
        header: BulkPacketHeader,
        data: Vec<u8>,
    },
    IsoPacket {
        id: u32,
        header: IsoPacketHeader,
        data: Vec<u8>,
    },
    InterruptPacket {
        id: u32,
        header: InterruptPacketHeader,
        data: Vec<u8>,
    },
}

impl Sent {
    /// The status carried by the packet, if it has one.
    pub(crate) fn status(&self) -> Option<Status> {
        match self {
            Sent::ConfigurationStatus { status, .. }
            | Sent::AltSettingStatus { status, .. }
            | Sent::IsoStreamStatus { status, .. }
            | Sent::InterruptRecvStatus { status, .. } => Some(*status),
            Sent::ControlPacket { header, .. } => Some(header.status),
            Sent::BulkPacket { header, .. } => Some(header.status),
            Sent::IsoPacket { header, .. } => Some(header.status),
            Sent::InterruptPacket { header, .. } => Some(header.status),
            _ => None,
        }
    }
}

/// Parser double that records every send and answers capability queries
/// from a configurable set.
pub(crate) struct RecordingParser {
    sent: Arc<Mutex<Vec<Sent>>>,
    pub(crate) peer_caps: Mutex<Option<Vec<Cap>>>,
}

impl RecordingParser {
    pub(crate) fn new() -> Self {
        RecordingParser {
            sent: Arc::new(Mutex::new(Vec::new())),
            peer_caps: Mutex::new(None),
        }
    }

    /// Shared handle to the record of sent packets.
    pub(crate) fn sent(&self) -> Arc<Mutex<Vec<Sent>>> {
        self.sent.clone()
    }

    fn record(&self, sent: Sent) {
        self.sent.lock().unwrap().push(sent);
    }
}

impl Parser for RecordingParser {
    fn init(&self, _version: &str, _caps: &[Cap], _flags: InitFlags) {}

    fn have_peer_caps(&self) -> bool {
        self.peer_caps.lock().unwrap().is_some()
    }

    fn peer_has_cap(&self, cap: Cap) -> bool {
        self.peer_caps
            .lock()
            .unwrap()
            .as_ref()
            .map(|caps| caps.contains(&cap))
            .unwrap_or(false)
    }

    fn do_read(&self, _handler: &dyn CommandHandler) -> io::Result<()> {
        Ok(())
    }

    fn do_write(&self) -> io::Result<()> {
        Ok(())
    }

    fn has_data_to_write(&self) -> bool {
        false
    }

    fn send_device_connect(&self, connect: &DeviceConnectHeader) {
        self.record(Sent::DeviceConnect(*connect));
    }

    fn send_device_disconnect(&self) {
        self.record(Sent::DeviceDisconnect);
    }

    fn send_interface_info(&self, info: &InterfaceInfo) {
        self.record(Sent::InterfaceInfo(*info));
    }

    fn send_ep_info(&self, info: &EpInfo) {
        self.record(Sent::EpInfo(*info));
    }

    fn send_configuration_status(&self, id: u32, status: &ConfigurationStatusHeader) {
        self.record(Sent::ConfigurationStatus {
            id,
            status: status.status,
            configuration: status.configuration,
        });
    }

    fn send_alt_setting_status(&self, id: u32, status: &AltSettingStatusHeader) {
        self.record(Sent::AltSettingStatus {
            id,
            status: status.status,
            interface: status.interface,
            alt: status.alt,
        });
    }

    fn send_iso_stream_status(&self, id: u32, status: &IsoStreamStatusHeader) {
        self.record(Sent::IsoStreamStatus {
            id,
            endpoint: status.endpoint,
            status: status.status,
        });
    }

    fn send_interrupt_receiving_status(&self, id: u32, status: &InterruptReceivingStatusHeader) {
        self.record(Sent::InterruptRecvStatus {
            id,
            endpoint: status.endpoint,
            status: status.status,
        });
    }

    fn send_control_packet(&self, id: u32, header: &ControlPacketHeader, data: &[u8]) {
        self.record(Sent::ControlPacket {
            id,
            header: *header,
            data: data.to_vec(),
        });
    }

    fn send_bulk_packet(&self, id: u32, header: &BulkPacketHeader, data: &[u8]) {
        self.record(Sent::BulkPacket {
            id,
            header: *header,
            data: data.to_vec(),
        });
    }

    fn send_iso_packet(&self, id: u32, header: &IsoPacketHeader, data: &[u8]) {
        self.record(Sent::IsoPacket {
            id,
            header: *header,
            data: data.to_vec(),
        });
    }

    fn send_interrupt_packet(&self, id: u32, header: &InterruptPacketHeader, data: &[u8]) {
        self.record(Sent::InterruptPacket {
            id,
            header: *header,
            data: data.to_vec(),
        });
    }
}
