//! Drives the host through a scripted parser, without a device bound.
//! Every data or stream command on an unbound host must answer ioerror,
//! and the control-plane hooks must behave.

use std::io;
use std::ptr;
use std::sync::{Arc, Mutex};

use usbredir_host::{
    AltSettingStatusHeader, BulkPacketHeader, Cap, CommandHandler, ConfigurationStatusHeader,
    ControlPacketHeader, DeviceConnectHeader, EpInfo, FilterRule, Host, InitFlags, InterfaceInfo,
    InterruptPacketHeader, InterruptReceivingStatusHeader, IsoPacketHeader, IsoStreamStatusHeader,
    Parser, ReadStatus, Status,
};

#[derive(Debug, Clone)]
enum Cmd {
    Control(u32, ControlPacketHeader, Vec<u8>),
    Bulk(u32, BulkPacketHeader, Vec<u8>),
    Iso(u32, IsoPacketHeader, Vec<u8>),
    Interrupt(u32, InterruptPacketHeader, Vec<u8>),
    StartIso(u32, u8, u8, u8),
    StopIso(u32, u8),
    StartInterrupt(u32, u8),
    StopInterrupt(u32, u8),
    GetConfiguration(u32),
    SetAltSetting(u32, u8, u8),
    GetAltSetting(u32, u8),
    CancelDataPacket(u32),
    AllocBulkStreams(u32, u32, u32),
    FilterFilter(Vec<FilterRule>),
    FilterReject,
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Reply {
    Control(u32, Status, u16),
    Bulk(u32, Status, u16),
    Interrupt(u32, Status, u16),
    IsoStreamStatus(u32, u8, Status),
    InterruptRecvStatus(u32, u8, Status),
    ConfigurationStatus(u32, Status, u8),
    AltSettingStatus(u32, Status, u8, u8),
    InterfaceInfo,
    EpInfo,
    DeviceConnect,
    DeviceDisconnect,
}

#[derive(Default)]
struct Shared {
    script: Vec<Cmd>,
    replies: Vec<Reply>,
    init: Option<(String, Vec<Cap>, InitFlags)>,
}

struct ScriptedParser {
    shared: Arc<Mutex<Shared>>,
}

impl ScriptedParser {
    fn new() -> (Self, Arc<Mutex<Shared>>) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        (
            ScriptedParser {
                shared: shared.clone(),
            },
            shared,
        )
    }
}

impl Parser for ScriptedParser {
    fn init(&self, version: &str, caps: &[Cap], flags: InitFlags) {
        self.shared.lock().unwrap().init = Some((version.to_owned(), caps.to_vec(), flags));
    }

    fn have_peer_caps(&self) -> bool {
        false
    }

    fn peer_has_cap(&self, _cap: Cap) -> bool {
        false
    }

    fn do_read(&self, handler: &dyn CommandHandler) -> io::Result<()> {
        let script = std::mem::take(&mut self.shared.lock().unwrap().script);
        for cmd in script {
            match cmd {
                Cmd::Control(id, header, data) => handler.control_packet(id, header, data),
                Cmd::Bulk(id, header, data) => handler.bulk_packet(id, header, data),
                Cmd::Iso(id, header, data) => handler.iso_packet(id, header, data),
                Cmd::Interrupt(id, header, data) => handler.interrupt_packet(id, header, data),
                Cmd::StartIso(id, ep, pkts, urbs) => handler.start_iso_stream(id, ep, pkts, urbs),
                Cmd::StopIso(id, ep) => handler.stop_iso_stream(id, ep),
                Cmd::StartInterrupt(id, ep) => handler.start_interrupt_receiving(id, ep),
                Cmd::StopInterrupt(id, ep) => handler.stop_interrupt_receiving(id, ep),
                Cmd::GetConfiguration(id) => handler.get_configuration(id),
                Cmd::SetAltSetting(id, interface, alt) => {
                    handler.set_alt_setting(id, interface, alt)
                }
                Cmd::GetAltSetting(id, interface) => handler.get_alt_setting(id, interface),
                Cmd::CancelDataPacket(id) => handler.cancel_data_packet(id),
                Cmd::AllocBulkStreams(id, eps, streams) => {
                    handler.alloc_bulk_streams(id, eps, streams)
                }
                Cmd::FilterFilter(rules) => handler.filter_filter(rules),
                Cmd::FilterReject => handler.filter_reject(),
                Cmd::Reset => handler.reset(),
            }
        }
        Ok(())
    }

    fn do_write(&self) -> io::Result<()> {
        Ok(())
    }

    fn has_data_to_write(&self) -> bool {
        false
    }

    fn send_device_connect(&self, _connect: &DeviceConnectHeader) {
        self.shared.lock().unwrap().replies.push(Reply::DeviceConnect);
    }

    fn send_device_disconnect(&self) {
        self.shared
            .lock()
            .unwrap()
            .replies
            .push(Reply::DeviceDisconnect);
    }

    fn send_interface_info(&self, _info: &InterfaceInfo) {
        self.shared.lock().unwrap().replies.push(Reply::InterfaceInfo);
    }

    fn send_ep_info(&self, _info: &EpInfo) {
        self.shared.lock().unwrap().replies.push(Reply::EpInfo);
    }

    fn send_configuration_status(&self, id: u32, status: &ConfigurationStatusHeader) {
        self.shared.lock().unwrap().replies.push(Reply::ConfigurationStatus(
            id,
            status.status,
            status.configuration,
        ));
    }

    fn send_alt_setting_status(&self, id: u32, status: &AltSettingStatusHeader) {
        self.shared.lock().unwrap().replies.push(Reply::AltSettingStatus(
            id,
            status.status,
            status.interface,
            status.alt,
        ));
    }

    fn send_iso_stream_status(&self, id: u32, status: &IsoStreamStatusHeader) {
        self.shared.lock().unwrap().replies.push(Reply::IsoStreamStatus(
            id,
            status.endpoint,
            status.status,
        ));
    }

    fn send_interrupt_receiving_status(&self, id: u32, status: &InterruptReceivingStatusHeader) {
        self.shared
            .lock()
            .unwrap()
            .replies
            .push(Reply::InterruptRecvStatus(
                id,
                status.endpoint,
                status.status,
            ));
    }

    fn send_control_packet(&self, id: u32, header: &ControlPacketHeader, data: &[u8]) {
        assert!(data.len() == header.length as usize);
        self.shared
            .lock()
            .unwrap()
            .replies
            .push(Reply::Control(id, header.status, header.length));
    }

    fn send_bulk_packet(&self, id: u32, header: &BulkPacketHeader, _data: &[u8]) {
        self.shared
            .lock()
            .unwrap()
            .replies
            .push(Reply::Bulk(id, header.status, header.length));
    }

    fn send_iso_packet(&self, _id: u32, _header: &IsoPacketHeader, _data: &[u8]) {}

    fn send_interrupt_packet(&self, id: u32, header: &InterruptPacketHeader, _data: &[u8]) {
        self.shared
            .lock()
            .unwrap()
            .replies
            .push(Reply::Interrupt(id, header.status, header.length));
    }
}

fn open_unbound() -> (Host, Arc<Mutex<Shared>>) {
    let (parser, shared) = ScriptedParser::new();
    let host = unsafe {
        Host::open(
            ptr::null_mut(),
            ptr::null_mut(),
            Box::new(parser),
            "usbredir-host test",
        )
    }
    .expect("open without a device must succeed");
    (host, shared)
}

fn run(host: &Host, shared: &Arc<Mutex<Shared>>, script: Vec<Cmd>) -> Vec<Reply> {
    shared.lock().unwrap().script = script;
    assert_eq!(host.read_guest_data().unwrap(), ReadStatus::Ok);
    std::mem::take(&mut shared.lock().unwrap().replies)
}

#[test]
fn open_advertises_the_host_capabilities() {
    let (_host, shared) = open_unbound();
    let shared = shared.lock().unwrap();
    let (version, caps, flags) = shared.init.as_ref().expect("parser must be initialized");
    assert_eq!(version, "usbredir-host test");
    assert!(caps.contains(&Cap::ConnectDeviceVersion));
    assert!(caps.contains(&Cap::Filter));
    assert!(caps.contains(&Cap::DeviceDisconnectAck));
    assert!(flags.usb_host);
    assert!(!flags.write_cb_owns_buffer);
}

#[test]
fn data_packets_without_a_device_answer_ioerror() {
    let (host, shared) = open_unbound();
    let replies = run(
        &host,
        &shared,
        vec![
            Cmd::Control(
                1,
                ControlPacketHeader {
                    endpoint: 0x80,
                    length: 16,
                    ..Default::default()
                },
                Vec::new(),
            ),
            Cmd::Bulk(
                2,
                BulkPacketHeader {
                    endpoint: 0x81,
                    length: 64,
                    ..Default::default()
                },
                Vec::new(),
            ),
            Cmd::Iso(
                3,
                IsoPacketHeader {
                    endpoint: 0x01,
                    length: 8,
                    ..Default::default()
                },
                vec![0u8; 8],
            ),
            Cmd::Interrupt(
                4,
                InterruptPacketHeader {
                    endpoint: 0x02,
                    length: 8,
                    ..Default::default()
                },
                vec![0u8; 8],
            ),
        ],
    );

    assert_eq!(
        replies,
        vec![
            Reply::Control(1, Status::Ioerror, 0),
            Reply::Bulk(2, Status::Ioerror, 0),
            Reply::IsoStreamStatus(3, 0x01, Status::Ioerror),
            Reply::Interrupt(4, Status::Ioerror, 0),
        ]
    );
}

#[test]
fn stream_commands_without_a_device_answer_ioerror() {
    let (host, shared) = open_unbound();
    let replies = run(
        &host,
        &shared,
        vec![
            Cmd::StartIso(5, 0x81, 8, 4),
            Cmd::StopIso(6, 0x81),
            Cmd::StartInterrupt(7, 0x82),
            Cmd::StopInterrupt(8, 0x82),
        ],
    );

    assert_eq!(
        replies,
        vec![
            Reply::IsoStreamStatus(5, 0x81, Status::Ioerror),
            Reply::IsoStreamStatus(6, 0x81, Status::Ioerror),
            Reply::InterruptRecvStatus(7, 0x82, Status::Ioerror),
            Reply::InterruptRecvStatus(8, 0x82, Status::Ioerror),
        ]
    );
}

#[test]
fn config_queries_without_a_device_answer_ioerror() {
    let (host, shared) = open_unbound();
    let replies = run(
        &host,
        &shared,
        vec![
            Cmd::GetConfiguration(9),
            Cmd::SetAltSetting(10, 0, 1),
            Cmd::GetAltSetting(11, 0),
        ],
    );

    assert_eq!(
        replies,
        vec![
            Reply::ConfigurationStatus(9, Status::Ioerror, 0),
            Reply::AltSettingStatus(10, Status::Ioerror, 0, 0xff),
            Reply::AltSettingStatus(11, Status::Ioerror, 0, 0xff),
        ]
    );
}

#[test]
fn silent_commands_stay_silent() {
    let (host, shared) = open_unbound();
    // Reset on an unbound host is a nop, cancels of unknown ids are not
    // errors, bulk streams are accepted but unimplemented
    let replies = run(
        &host,
        &shared,
        vec![
            Cmd::Reset,
            Cmd::CancelDataPacket(1234),
            Cmd::AllocBulkStreams(12, 0x2, 4),
        ],
    );
    assert!(replies.is_empty());
}

#[test]
fn guest_filter_rules_are_stored_and_exposed() {
    let (host, shared) = open_unbound();
    let rules = FilterRule::parse_list("0x03,-1,-1,-1,-1,-1,0|-1,-1,-1,-1,-1,-1,1", "|").unwrap();
    let replies = run(&host, &shared, vec![Cmd::FilterFilter(rules.clone())]);
    assert!(replies.is_empty());
    assert_eq!(host.get_guest_filter(), rules);
}

#[test]
fn filter_reject_is_ignored_while_disconnected() {
    let (host, shared) = open_unbound();
    let replies = run(&host, &shared, vec![Cmd::FilterReject]);
    assert!(replies.is_empty());
    // The sticky read status was not set
    assert_eq!(host.read_guest_data().unwrap(), ReadStatus::Ok);
}
