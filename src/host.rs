//! The redirection host: device lifecycle, the peer command dispatcher
//! and the one-shot control/bulk request path.

use std::fmt::Write as _;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use std::{array, io};

use libc::{c_int, timeval};
use libusb1_sys::constants::*;
use libusb1_sys::*;
use log::{debug, error, info, log_enabled, trace, Level};

use crate::endpoint::{
    ep_to_index, index_to_ep, max_packetsize, Endpoint, MAX_ENDPOINTS, MAX_INTERFACES,
};
use crate::error::Result;
use crate::filter::FilterRule;
use crate::parser::{CommandHandler, InitFlags, Parser, ReadStatus};
use crate::proto::{
    ep_type, AltSettingStatusHeader, BulkPacketHeader, Cap, ConfigurationStatusHeader,
    ControlPacketHeader, DeviceConnectHeader, EpInfo, InterfaceInfo, InterruptPacketHeader,
    IsoPacketHeader, Speed, Status,
};
use crate::transfer::{Registry, SavedHeader, Transfer, BULK_TIMEOUT, CTRL_TIMEOUT};

/// Flags accepted by [`Host::open_full`].
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    /// The transport write callback takes ownership of buffers handed to
    /// it; forwarded to the parser.
    pub write_cb_owns_buffer: bool,
}

/// Hook invoked whenever freshly queued guest data should be pushed out.
pub type FlushWrites = Box<dyn Fn() + Send + Sync>;

/// A host side USB redirection engine bound to (at most) one device.
///
/// Dropping the host cancels and drains all in-flight transfers,
/// releases the claimed interfaces and closes the device handle.
pub struct Host {
    inner: Arc<HostInner>,
}

pub(crate) struct HostInner {
    pub(crate) ctx: *mut libusb_context,
    pub(crate) parser: Box<dyn Parser>,
    flush_writes_hook: Option<FlushWrites>,
    /// The host lock: endpoint table, iso rings, transfer registry and
    /// cancel accounting. Held across native cancel and iso submit
    /// calls; libusb releases its own transfer lock before invoking
    /// completions, so this cannot deadlock.
    pub(crate) state: Mutex<DeviceState>,
    /// Serializes the first observation of device-gone between the two
    /// actors, so only one of them sends the disconnect notice. Never
    /// acquires `state` while held.
    disconnect_lock: Mutex<()>,
    pub(crate) disconnected: AtomicBool,
    wait_disconnect: AtomicBool,
    connect_pending: AtomicBool,
    read_status: AtomicU8,
}

// SAFETY: the raw libusb pointers inside are only dereferenced under the
// state lock or on drained records, and libusb itself is thread-safe for
// the calls made here.
unsafe impl Send for HostInner {}
unsafe impl Sync for HostInner {}

pub(crate) struct DeviceState {
    pub(crate) device: Option<DeviceBinding>,
    pub(crate) endpoints: [Endpoint; MAX_ENDPOINTS],
    pub(crate) alt_setting: [u8; MAX_INTERFACES],
    pub(crate) registry: Registry,
    pub(crate) cancels_pending: u32,
    pub(crate) filter_rules: Vec<FilterRule>,
}

pub(crate) struct DeviceBinding {
    pub(crate) dev: *mut libusb_device,
    pub(crate) handle: *mut libusb_device_handle,
    pub(crate) desc: libusb_device_descriptor,
    /// Owned; freed through `libusb_free_config_descriptor`.
    pub(crate) config: *const libusb_config_descriptor,
    pub(crate) active_config: u8,
    pub(crate) claimed: bool,
}

impl DeviceState {
    fn new() -> Self {
        DeviceState {
            device: None,
            endpoints: array::from_fn(|_| Endpoint::default()),
            alt_setting: [0; MAX_INTERFACES],
            registry: Registry::default(),
            cancels_pending: 0,
            filter_rules: Vec::new(),
        }
    }

    pub(crate) fn handle(&self) -> *mut libusb_device_handle {
        self.device
            .as_ref()
            .map(|d| d.handle)
            .unwrap_or(ptr::null_mut())
    }
}

/// bInterfaceNumber of interface `i`, read from its first alt setting.
fn interface_number(config: *const libusb_config_descriptor, i: usize) -> u8 {
    unsafe { (*(*(*config).interface.add(i)).altsetting).bInterfaceNumber }
}

/// Hex dumps payload bytes at trace level, eight per line.
pub(crate) fn trace_data(desc: &str, data: &[u8]) {
    if !log_enabled!(Level::Trace) {
        return;
    }
    for chunk in data.chunks(8) {
        let mut line = String::with_capacity(desc.len() + chunk.len() * 3);
        line.push_str(desc);
        for b in chunk {
            let _ = write!(line, " {:02X}", b);
        }
        trace!("{}", line);
    }
}

impl Host {
    /// Opens a redirection host over `parser`, bound to `handle`.
    ///
    /// # Safety
    /// `ctx` must be a live libusb context and `handle` either null or an
    /// open device handle on that context. The host takes ownership of
    /// the handle and closes it when the device is cleared.
    pub unsafe fn open(
        ctx: *mut libusb_context,
        handle: *mut libusb_device_handle,
        parser: Box<dyn Parser>,
        version: &str,
    ) -> Result<Host> {
        Self::open_full(ctx, handle, parser, version, OpenFlags::default(), None)
    }

    /// Like [`Host::open`] with explicit flags and an optional hook that
    /// is invoked whenever queued guest data should be flushed out.
    ///
    /// # Safety
    /// See [`Host::open`].
    pub unsafe fn open_full(
        ctx: *mut libusb_context,
        handle: *mut libusb_device_handle,
        parser: Box<dyn Parser>,
        version: &str,
        flags: OpenFlags,
        flush_writes: Option<FlushWrites>,
    ) -> Result<Host> {
        let inner = Arc::new(HostInner {
            ctx,
            parser,
            flush_writes_hook: flush_writes,
            state: Mutex::new(DeviceState::new()),
            disconnect_lock: Mutex::new(()),
            // No device is connected initially
            disconnected: AtomicBool::new(true),
            wait_disconnect: AtomicBool::new(false),
            connect_pending: AtomicBool::new(false),
            read_status: AtomicU8::new(ReadStatus::Ok as u8),
        });

        inner.parser.init(
            version,
            &[Cap::ConnectDeviceVersion, Cap::Filter, Cap::DeviceDisconnectAck],
            InitFlags {
                usb_host: true,
                write_cb_owns_buffer: flags.write_cb_owns_buffer,
            },
        );

        let host = Host { inner };
        host.inner.set_device(handle).into_result()?;
        host.inner.flush_writes();
        Ok(host)
    }

    /// Rebinds the host to a new device handle; null unbinds. The
    /// previous device, if any, is drained and closed first.
    ///
    /// # Safety
    /// `handle` must be either null or an open device handle on the
    /// context the host was opened with; the host takes ownership.
    pub unsafe fn set_device(&self, handle: *mut libusb_device_handle) -> Result<()> {
        self.inner.set_device(handle).into_result()
    }

    /// Reads and processes guest data. Host-level conditions (filter
    /// rejection, device lost during reconfiguration) are reported once
    /// through the returned status.
    pub fn read_guest_data(&self) -> io::Result<ReadStatus> {
        let status = self.inner.take_read_status();
        if status != ReadStatus::Ok {
            return Ok(status);
        }
        self.inner.parser.do_read(&*self.inner)?;
        Ok(ReadStatus::Ok)
    }

    /// Writes buffered data towards the guest.
    pub fn write_guest_data(&self) -> io::Result<()> {
        self.inner.parser.do_write()
    }

    /// Whether buffered data is waiting to be written to the guest.
    pub fn has_data_to_write(&self) -> bool {
        self.inner.parser.has_data_to_write()
    }

    /// Returns the filter rules the guest announced, if any.
    pub fn get_guest_filter(&self) -> Vec<FilterRule> {
        self.inner.state.lock().unwrap().filter_rules.clone()
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.inner.clear_device();
    }
}

impl HostInner {
    pub(crate) fn flush_writes(&self) {
        if let Some(hook) = &self.flush_writes_hook {
            hook();
        }
    }

    pub(crate) fn set_read_status(&self, status: ReadStatus) {
        self.read_status.store(status as u8, Ordering::SeqCst);
    }

    fn take_read_status(&self) -> ReadStatus {
        match self.read_status.swap(ReadStatus::Ok as u8, Ordering::SeqCst) {
            1 => ReadStatus::DeviceRejected,
            2 => ReadStatus::DeviceLost,
            _ => ReadStatus::Ok,
        }
    }

    /// Runs from both the parser read path and the libusb completion
    /// path; `disconnect_lock` keeps the two from both sending the
    /// notice.
    pub(crate) fn handle_disconnect(&self) {
        let _guard = self.disconnect_lock.lock().unwrap();
        if !self.disconnected.load(Ordering::SeqCst) {
            info!("device disconnected");
            self.parser.send_device_disconnect();
            if self.parser.peer_has_cap(Cap::DeviceDisconnectAck) {
                self.wait_disconnect.store(true, Ordering::SeqCst);
            }
            self.disconnected.store(true, Ordering::SeqCst);
        }
    }

    /// Translates a native code to a peer status, turning device-gone
    /// codes into disconnect handling on the way.
    pub(crate) fn status_to_peer(&self, code: c_int) -> Status {
        let (status, device_gone) = Status::from_libusb(code);
        if device_gone {
            self.handle_disconnect();
        }
        status
    }

    fn send_interface_and_ep_info(&self, st: &DeviceState) {
        let config = match st.device.as_ref() {
            Some(dev) => dev.config,
            None => return,
        };

        let mut interface_info = InterfaceInfo::default();
        let num_interfaces = unsafe { (*config).bNumInterfaces } as usize;
        interface_info.interface_count = num_interfaces as u32;
        for i in 0..num_interfaces {
            let intf = unsafe {
                &*(*(*config).interface.add(i))
                    .altsetting
                    .add(st.alt_setting[i] as usize)
            };
            interface_info.interface[i] = intf.bInterfaceNumber;
            interface_info.interface_class[i] = intf.bInterfaceClass;
            interface_info.interface_subclass[i] = intf.bInterfaceSubClass;
            interface_info.interface_protocol[i] = intf.bInterfaceProtocol;
        }
        self.parser.send_interface_info(&interface_info);

        let mut ep_info = EpInfo::default();
        for i in 0..MAX_ENDPOINTS {
            ep_info.kind[i] = st.endpoints[i].kind;
            ep_info.interval[i] = st.endpoints[i].interval;
            ep_info.interface[i] = st.endpoints[i].interface;
        }
        self.parser.send_ep_info(&ep_info);
    }

    fn send_device_connect(&self, st: &DeviceState) {
        if !self.disconnected.load(Ordering::SeqCst) {
            error!("internal error: device-connect while already connected");
            return;
        }

        if !self.parser.have_peer_caps() || self.wait_disconnect.load(Ordering::SeqCst) {
            self.connect_pending.store(true, Ordering::SeqCst);
            return;
        }

        let dev = match st.device.as_ref() {
            Some(dev) => dev,
            None => return,
        };
        let speed = match unsafe { libusb_get_device_speed(dev.dev) } {
            LIBUSB_SPEED_LOW => Speed::Low,
            LIBUSB_SPEED_FULL => Speed::Full,
            LIBUSB_SPEED_HIGH => Speed::High,
            LIBUSB_SPEED_SUPER => Speed::Super,
            _ => Speed::Unknown,
        };
        let connect = DeviceConnectHeader {
            speed,
            device_class: dev.desc.bDeviceClass,
            device_subclass: dev.desc.bDeviceSubClass,
            device_protocol: dev.desc.bDeviceProtocol,
            vendor_id: dev.desc.idVendor,
            product_id: dev.desc.idProduct,
            device_version_bcd: dev.desc.bcdDevice,
        };

        self.send_interface_and_ep_info(st);
        self.parser.send_device_connect(&connect);
        self.connect_pending.store(false, Ordering::SeqCst);
        // The guest may use the device from now on
        self.disconnected.store(false, Ordering::SeqCst);

        self.flush_writes();
    }

    fn parse_interface(&self, st: &mut DeviceState, i: usize) {
        let config = match st.device.as_ref() {
            Some(dev) => dev.config,
            None => return,
        };
        let (num_endpoints, endpoints, interface_nr) = unsafe {
            let intf = &*(*(*config).interface.add(i))
                .altsetting
                .add(st.alt_setting[i] as usize);
            (intf.bNumEndpoints as usize, intf.endpoint, intf.bInterfaceNumber)
        };
        for j in 0..num_endpoints {
            let ep_desc = unsafe { &*endpoints.add(j) };
            let slot = &mut st.endpoints[ep_to_index(ep_desc.bEndpointAddress)];
            slot.max_packetsize = max_packetsize(ep_desc.wMaxPacketSize);
            slot.kind = ep_desc.bmAttributes & LIBUSB_TRANSFER_TYPE_MASK;
            slot.interval = ep_desc.bInterval;
            slot.interface = interface_nr;
        }
    }

    fn parse_config(&self, st: &mut DeviceState) {
        for i in 0..MAX_ENDPOINTS {
            let slot = &mut st.endpoints[i];
            slot.kind = if i & 0x0f == 0 {
                ep_type::CONTROL
            } else {
                ep_type::INVALID
            };
            slot.interval = 0;
            slot.interface = 0;
        }

        let num_interfaces = match st.device.as_ref() {
            Some(dev) => (unsafe { (*dev.config).bNumInterfaces }) as usize,
            None => return,
        };
        for i in 0..num_interfaces {
            self.parse_interface(st, i);
        }
    }

    fn unwind_claim(
        &self,
        handle: *mut libusb_device_handle,
        config: *const libusb_config_descriptor,
        up_to: usize,
    ) {
        for i in (0..=up_to).rev() {
            let n = interface_number(config, i);
            // Release is a nop on interfaces that were never claimed
            unsafe {
                libusb_release_interface(handle, n as c_int);
                libusb_attach_kernel_driver(handle, n as c_int);
            }
        }
    }

    fn claim(&self, st: &mut DeviceState) -> Status {
        let (dev_ptr, handle, active_config) = match st.device.as_mut() {
            Some(dev) => {
                if !dev.config.is_null() {
                    unsafe { libusb_free_config_descriptor(dev.config) };
                    dev.config = ptr::null();
                }
                (dev.dev, dev.handle, dev.active_config)
            }
            None => return Status::Ioerror,
        };

        let mut config = ptr::null();
        let r = unsafe { libusb_get_config_descriptor_by_value(dev_ptr, active_config, &mut config) };
        if r < 0 {
            error!(
                "could not get descriptors for configuration {}: {}",
                active_config, r
            );
            return self.status_to_peer(r);
        }
        if let Some(dev) = st.device.as_mut() {
            dev.config = config;
        }

        let num_interfaces = unsafe { (*config).bNumInterfaces } as usize;
        if num_interfaces > MAX_INTERFACES {
            error!(
                "configuration has too many interfaces ({} > {})",
                num_interfaces, MAX_INTERFACES
            );
            return Status::Ioerror;
        }

        // All interfaces begin at alt setting 0 when (re)claimed
        st.alt_setting = [0; MAX_INTERFACES];

        for i in 0..num_interfaces {
            let n = interface_number(config, i);

            let r = unsafe { libusb_detach_kernel_driver(handle, n as c_int) };
            if r < 0 && r != LIBUSB_ERROR_NOT_FOUND {
                error!(
                    "could not detach driver from interface {} (configuration {}): {}",
                    n, active_config, r
                );
                self.unwind_claim(handle, config, i);
                return self.status_to_peer(r);
            }

            let r = unsafe { libusb_claim_interface(handle, n as c_int) };
            if r < 0 {
                error!(
                    "could not claim interface {} (configuration {}): {}",
                    n, active_config, r
                );
                self.unwind_claim(handle, config, i);
                return self.status_to_peer(r);
            }
        }

        self.parse_config(st);
        if let Some(dev) = st.device.as_mut() {
            dev.claimed = true;
        }
        Status::Success
    }

    fn release(&self, st: &mut DeviceState, attach_drivers: bool) -> Status {
        let dev = match st.device.as_mut() {
            Some(dev) => dev,
            None => return Status::Success,
        };
        if !dev.claimed {
            return Status::Success;
        }

        let config = dev.config;
        let handle = dev.handle;
        let active_config = dev.active_config;
        let num_interfaces = unsafe { (*config).bNumInterfaces } as usize;
        let mut ret = Status::Success;

        for i in 0..num_interfaces {
            let n = interface_number(config, i);
            let r = unsafe { libusb_release_interface(handle, n as c_int) };
            if r < 0 && r != LIBUSB_ERROR_NOT_FOUND && r != LIBUSB_ERROR_NO_DEVICE {
                error!(
                    "could not release interface {} (configuration {}): {}",
                    n, active_config, r
                );
                ret = Status::Ioerror;
            }
        }

        if !attach_drivers {
            return ret;
        }

        for i in 0..num_interfaces {
            let n = interface_number(config, i);
            let r = unsafe { libusb_attach_kernel_driver(handle, n as c_int) };
            // Tolerate no driver, an unplugged device and a driver that
            // rebound on its own
            if r < 0
                && r != LIBUSB_ERROR_NOT_FOUND
                && r != LIBUSB_ERROR_NO_DEVICE
                && r != LIBUSB_ERROR_BUSY
            {
                error!(
                    "could not re-attach driver to interface {} (configuration {}): {}",
                    n, active_config, r
                );
                ret = Status::Ioerror;
            }
        }

        dev.claimed = false;
        ret
    }

    pub(crate) fn set_device(&self, handle: *mut libusb_device_handle) -> Status {
        self.clear_device();

        if handle.is_null() {
            return Status::Success;
        }

        {
            let mut st = self.state.lock().unwrap();
            st.device = Some(DeviceBinding {
                dev: unsafe { libusb_get_device(handle) },
                handle,
                desc: unsafe { std::mem::zeroed() },
                config: ptr::null(),
                active_config: 0,
                claimed: false,
            });
        }

        let mut active_config: c_int = 0;
        let r = unsafe { libusb_get_configuration(handle, &mut active_config) };
        if r < 0 {
            error!("could not get active configuration: {}", r);
            let status = self.status_to_peer(r);
            self.clear_device();
            return status;
        }

        let dev_ptr = {
            let st = self.state.lock().unwrap();
            match st.device.as_ref() {
                Some(dev) => dev.dev,
                None => return Status::Ioerror,
            }
        };
        let mut desc = MaybeUninit::<libusb_device_descriptor>::uninit();
        let r = unsafe { libusb_get_device_descriptor(dev_ptr, desc.as_mut_ptr()) };
        if r < 0 {
            error!("could not get device descriptor: {}", r);
            let status = self.status_to_peer(r);
            self.clear_device();
            return status;
        }

        let status = {
            let mut st = self.state.lock().unwrap();
            if let Some(dev) = st.device.as_mut() {
                dev.active_config = active_config as u8;
                dev.desc = unsafe { desc.assume_init() };
            }
            self.claim(&mut st)
        };
        if status != Status::Success {
            self.clear_device();
            return status;
        }

        {
            let st = self.state.lock().unwrap();
            self.send_device_connect(&st);
        }

        Status::Success
    }

    pub(crate) fn clear_device(&self) {
        let mut wait = {
            let mut st = self.state.lock().unwrap();
            if st.device.is_none() {
                return;
            }
            self.cancel_pending_urbs(&mut st)
        };

        while wait {
            let tv = timeval {
                tv_sec: 0,
                tv_usec: 2500,
            };
            unsafe { libusb_handle_events_timeout_completed(self.ctx, &tv, ptr::null_mut()) };
            let st = self.state.lock().unwrap();
            wait = st.cancels_pending > 0 || !st.registry.is_empty();
        }

        {
            let mut st = self.state.lock().unwrap();
            self.release(&mut st, true);
            if let Some(dev) = st.device.take() {
                if !dev.config.is_null() {
                    unsafe { libusb_free_config_descriptor(dev.config) };
                }
                unsafe { libusb_close(dev.handle) };
            }
        }

        self.connect_pending.store(false, Ordering::SeqCst);
        self.handle_disconnect();
        self.flush_writes();
    }

    /// Cancels every in-flight transfer. Returns whether there is
    /// anything to drain.
    fn cancel_pending_urbs(&self, st: &mut DeviceState) -> bool {
        for i in 0..MAX_ENDPOINTS {
            match st.endpoints[i].kind {
                ep_type::ISO => self.cancel_iso_stream(st, index_to_ep(i)),
                ep_type::INTERRUPT if i & 0x10 != 0 => {
                    self.cancel_interrupt_in_transfer(st, index_to_ep(i))
                }
                _ => {}
            }
        }

        let mut wait = st.cancels_pending > 0;
        for t in st.registry.iter() {
            unsafe { libusb_cancel_transfer((*t).xfer.as_ptr()) };
            wait = true;
        }
        wait
    }

    fn cancel_pending_urbs_on_interface(&self, st: &mut DeviceState, i: usize) {
        let config = match st.device.as_ref() {
            Some(dev) => dev.config,
            None => return,
        };
        let (num_endpoints, endpoints) = unsafe {
            let intf = &*(*(*config).interface.add(i))
                .altsetting
                .add(st.alt_setting[i] as usize);
            (intf.bNumEndpoints as usize, intf.endpoint)
        };

        for j in 0..num_endpoints {
            let ep = unsafe { (*endpoints.add(j)).bEndpointAddress };
            match st.endpoints[ep_to_index(ep)].kind {
                ep_type::ISO => self.cancel_iso_stream(st, ep),
                ep_type::INTERRUPT if ep & LIBUSB_ENDPOINT_IN != 0 => {
                    self.cancel_interrupt_in_transfer(st, ep)
                }
                _ => {}
            }

            for t in st.registry.iter() {
                if unsafe { (*(*t).xfer.as_ptr()).endpoint } == ep {
                    unsafe { libusb_cancel_transfer((*t).xfer.as_ptr()) };
                }
            }
        }
    }

    fn interface_number_to_index(&self, st: &DeviceState, number: u8) -> Option<usize> {
        let config = st.device.as_ref()?.config;
        let num_interfaces = unsafe { (*config).bNumInterfaces } as usize;
        for i in 0..num_interfaces {
            if interface_number(config, i) == number {
                return Some(i);
            }
        }
        error!("invalid interface number: {}", number);
        None
    }

    fn active_config(&self) -> u8 {
        self.state
            .lock()
            .unwrap()
            .device
            .as_ref()
            .map(|d| d.active_config)
            .unwrap_or(0)
    }

    pub(crate) fn remove_and_free_transfer(&self, transfer: *mut Transfer) {
        {
            let mut st = self.state.lock().unwrap();
            st.registry.remove(transfer);
        }
        unsafe { Transfer::free(transfer) };
    }

    fn send_control_status(&self, id: u32, mut header: ControlPacketHeader, status: Status) {
        header.status = status;
        header.length = 0;
        self.parser.send_control_packet(id, &header, &[]);
        self.flush_writes();
    }

    fn send_bulk_status(&self, id: u32, mut header: BulkPacketHeader, status: Status) {
        header.status = status;
        header.length = 0;
        self.parser.send_bulk_packet(id, &header, &[]);
        self.flush_writes();
    }

    pub(crate) fn send_interrupt_status(
        &self,
        id: u32,
        mut header: InterruptPacketHeader,
        status: Status,
    ) {
        header.status = status;
        header.length = 0;
        self.parser.send_interrupt_packet(id, &header, &[]);
        self.flush_writes();
    }

    fn do_set_configuration(&self, configuration: u8) -> Status {
        if self.disconnected.load(Ordering::SeqCst) {
            return Status::Ioerror;
        }

        let mut st = self.state.lock().unwrap();
        let (handle, active) = match st.device.as_ref() {
            Some(dev) => (dev.handle, dev.active_config),
            None => return Status::Ioerror,
        };
        if active == configuration {
            return Status::Success;
        }

        // Cancelled transfers drain on the next event-loop poll
        self.cancel_pending_urbs(&mut st);

        let status = self.release(&mut st, false);
        if status != Status::Success {
            return status;
        }

        let r = unsafe { libusb_set_configuration(handle, configuration as c_int) };
        if r < 0 {
            error!(
                "could not set active configuration to {}: {}",
                configuration, r
            );
            return Status::Ioerror;
        }

        if let Some(dev) = st.device.as_mut() {
            dev.active_config = configuration;
        }
        let status = self.claim(&mut st);
        if status != Status::Success {
            drop(st);
            self.clear_device();
            self.set_read_status(ReadStatus::DeviceLost);
            return status;
        }

        self.send_interface_and_ep_info(&st);
        Status::Success
    }
}

impl CommandHandler for HostInner {
    fn hello(&self, version: &str) {
        debug!("peer hello, version {:?}", version);
        if self.connect_pending.load(Ordering::SeqCst) {
            let st = self.state.lock().unwrap();
            self.send_device_connect(&st);
        }
    }

    fn reset(&self) {
        if self.disconnected.load(Ordering::SeqCst) {
            return;
        }
        let handle = {
            let st = self.state.lock().unwrap();
            match st.device.as_ref() {
                Some(dev) => dev.handle,
                None => return,
            }
        };

        let r = unsafe { libusb_reset_device(handle) };
        if r == 0 {
            // Some devices need time to settle before accepting more commands
            thread::sleep(Duration::from_millis(100));
        } else {
            error!("resetting device: {}", r);
            self.handle_disconnect();
            self.flush_writes();
        }
    }

    fn set_configuration(&self, id: u32, configuration: u8) {
        let status = self.do_set_configuration(configuration);
        self.parser.send_configuration_status(
            id,
            &ConfigurationStatusHeader {
                status,
                configuration: self.active_config(),
            },
        );
        self.flush_writes();
    }

    fn get_configuration(&self, id: u32) {
        let status = if self.disconnected.load(Ordering::SeqCst) {
            Status::Ioerror
        } else {
            Status::Success
        };
        self.parser.send_configuration_status(
            id,
            &ConfigurationStatusHeader {
                status,
                configuration: self.active_config(),
            },
        );
        self.flush_writes();
    }

    fn set_alt_setting(&self, id: u32, interface: u8, alt: u8) {
        let mut status = AltSettingStatusHeader {
            status: Status::Success,
            interface,
            alt: 0xff,
        };

        if self.disconnected.load(Ordering::SeqCst) {
            status.status = Status::Ioerror;
        } else {
            let mut st = self.state.lock().unwrap();
            match self.interface_number_to_index(&st, interface) {
                None => status.status = Status::Inval,
                Some(i) => {
                    self.cancel_pending_urbs_on_interface(&mut st, i);

                    let r = unsafe {
                        libusb_set_interface_alt_setting(
                            st.handle(),
                            interface as c_int,
                            alt as c_int,
                        )
                    };
                    if r < 0 {
                        error!(
                            "could not set alt setting for interface {} to {}: {}",
                            interface, alt, r
                        );
                        status.status = self.status_to_peer(r);
                        status.alt = st.alt_setting[i];
                    } else {
                        // The new alt setting may expose fewer endpoints
                        // than the old one; reset every slot that belonged
                        // to the interface before reparsing. EP0 slots
                        // stay control.
                        for j in 0..MAX_ENDPOINTS {
                            if st.endpoints[j].interface != interface {
                                continue;
                            }
                            st.endpoints[j].kind = if j & 0x0f == 0 {
                                ep_type::CONTROL
                            } else {
                                ep_type::INVALID
                            };
                            st.endpoints[j].interval = 0;
                            st.endpoints[j].interface = 0;
                        }

                        st.alt_setting[i] = alt;
                        self.parse_interface(&mut st, i);
                        self.send_interface_and_ep_info(&st);
                        status.alt = alt;
                    }
                }
            }
        }

        self.parser.send_alt_setting_status(id, &status);
        self.flush_writes();
    }

    fn get_alt_setting(&self, id: u32, interface: u8) {
        let mut status = AltSettingStatusHeader {
            status: Status::Success,
            interface,
            alt: 0xff,
        };

        if self.disconnected.load(Ordering::SeqCst) {
            status.status = Status::Ioerror;
        } else {
            let st = self.state.lock().unwrap();
            match self.interface_number_to_index(&st, interface) {
                Some(i) => status.alt = st.alt_setting[i],
                None => status.status = Status::Inval,
            }
        }

        self.parser.send_alt_setting_status(id, &status);
        self.flush_writes();
    }

    fn start_iso_stream(&self, id: u32, endpoint: u8, pkts_per_urb: u8, no_urbs: u8) {
        self.handle_start_iso_stream(id, endpoint, pkts_per_urb, no_urbs);
    }

    fn stop_iso_stream(&self, id: u32, endpoint: u8) {
        self.handle_stop_iso_stream(id, endpoint);
    }

    fn start_interrupt_receiving(&self, id: u32, endpoint: u8) {
        self.handle_start_interrupt_receiving(id, endpoint);
    }

    fn stop_interrupt_receiving(&self, id: u32, endpoint: u8) {
        self.handle_stop_interrupt_receiving(id, endpoint);
    }

    fn alloc_bulk_streams(&self, _id: u32, _endpoints: u32, _no_streams: u32) {
        // Accepted but not implemented; reserved for bulk stream support
        debug!("ignoring alloc bulk streams");
    }

    fn free_bulk_streams(&self, _id: u32, _endpoints: u32) {
        debug!("ignoring free bulk streams");
    }

    fn cancel_data_packet(&self, id: u32) {
        // The completion handler may be freeing the transfer from the
        // event-loop thread; cancelling with the lock held keeps the
        // record alive. libusb releases its transfer lock before running
        // completions, so there is no deadlock.
        let st = self.state.lock().unwrap();
        if let Some(t) = st.registry.find(id) {
            unsafe { libusb_cancel_transfer((*t).xfer.as_ptr()) };
        }
        // Not finding the id is not an error, the transfer may have
        // completed before the cancel arrived.
    }

    fn filter_reject(&self) {
        if self.disconnected.load(Ordering::SeqCst) {
            return;
        }
        info!("device rejected by guest filter");
        self.set_read_status(ReadStatus::DeviceRejected);
    }

    fn filter_filter(&self, rules: Vec<FilterRule>) {
        self.state.lock().unwrap().filter_rules = rules;
    }

    fn device_disconnect_ack(&self) {
        if !self.wait_disconnect.swap(false, Ordering::SeqCst) {
            error!("received disconnect ack without sending a disconnect");
            return;
        }

        if self.connect_pending.load(Ordering::SeqCst) {
            let st = self.state.lock().unwrap();
            self.send_device_connect(&st);
        }
    }

    fn control_packet(&self, id: u32, header: ControlPacketHeader, data: Vec<u8>) {
        let ep = header.endpoint;

        if self.disconnected.load(Ordering::SeqCst) {
            self.send_control_status(id, header, Status::Ioerror);
            return;
        }

        let mut st = self.state.lock().unwrap();
        if st.endpoints[ep_to_index(ep)].kind != ep_type::CONTROL {
            error!("control packet on non control ep {:02X}", ep);
            drop(st);
            self.send_control_status(id, header, Status::Inval);
            return;
        }

        // A clear stall must go through the library rather than straight
        // to the device so the host usb stack resets its toggle state.
        if header.requesttype == LIBUSB_RECIPIENT_ENDPOINT
            && header.request == LIBUSB_REQUEST_CLEAR_FEATURE
            && header.value == 0
            && data.is_empty()
        {
            let r = unsafe { libusb_clear_halt(st.handle(), header.index as u8) };
            let status = self.status_to_peer(r);
            debug!("clear halt ep {:02X} status {:?}", header.index, status);
            drop(st);
            self.send_control_status(id, header, status);
            return;
        }

        let transfer = match Transfer::alloc(self as *const HostInner, 0) {
            Some(t) => t,
            None => return,
        };

        let setup = LIBUSB_CONTROL_SETUP_SIZE;
        let mut buffer = vec![0u8; setup + header.length as usize];
        unsafe {
            libusb_fill_control_setup(
                buffer.as_mut_ptr(),
                header.requesttype,
                header.request,
                header.value,
                header.index,
                header.length,
            );
        }
        if ep & LIBUSB_ENDPOINT_IN == 0 {
            trace_data("ctrl data out:", &data);
            let n = data.len().min(header.length as usize);
            buffer[setup..setup + n].copy_from_slice(&data[..n]);
        }

        unsafe {
            (*transfer).buffer = buffer;
            libusb_fill_control_transfer(
                (*transfer).xfer.as_ptr(),
                st.handle(),
                (*transfer).buffer.as_mut_ptr(),
                control_packet_complete,
                transfer as *mut libc::c_void,
                CTRL_TIMEOUT,
            );
            (*transfer).id = id;
            (*transfer).header = SavedHeader::Control(header);
        }
        st.registry.insert(transfer);

        let r = unsafe { libusb_submit_transfer((*transfer).xfer.as_ptr()) };
        drop(st);
        if r < 0 {
            error!("submitting control transfer on ep {:02X}: {}", ep, r);
            // Report the submission error through the completion path
            unsafe {
                (*(*transfer).xfer.as_ptr()).actual_length = 0;
                (*(*transfer).xfer.as_ptr()).status = r;
            }
            control_packet_complete(unsafe { (*transfer).xfer.as_ptr() });
        }
    }

    fn bulk_packet(&self, id: u32, header: BulkPacketHeader, data: Vec<u8>) {
        let ep = header.endpoint;
        debug!("bulk submit ep {:02X} len {}", ep, header.length);

        if self.disconnected.load(Ordering::SeqCst) {
            self.send_bulk_status(id, header, Status::Ioerror);
            return;
        }

        let mut st = self.state.lock().unwrap();
        if st.endpoints[ep_to_index(ep)].kind != ep_type::BULK {
            error!("bulk packet on non bulk ep {:02X}", ep);
            drop(st);
            self.send_bulk_status(id, header, Status::Inval);
            return;
        }

        let buffer = if ep & LIBUSB_ENDPOINT_IN != 0 {
            vec![0u8; header.length as usize]
        } else {
            trace_data("bulk data out:", &data);
            // Re-use the buffer the parser handed over
            data
        };

        let transfer = match Transfer::alloc(self as *const HostInner, 0) {
            Some(t) => t,
            None => return,
        };
        unsafe {
            (*transfer).buffer = buffer;
            libusb_fill_bulk_transfer(
                (*transfer).xfer.as_ptr(),
                st.handle(),
                ep,
                (*transfer).buffer.as_mut_ptr(),
                (*transfer).buffer.len() as c_int,
                bulk_packet_complete,
                transfer as *mut libc::c_void,
                BULK_TIMEOUT,
            );
            (*transfer).id = id;
            (*transfer).header = SavedHeader::Bulk(header);
        }
        st.registry.insert(transfer);

        let r = unsafe { libusb_submit_transfer((*transfer).xfer.as_ptr()) };
        drop(st);
        if r < 0 {
            error!("submitting bulk transfer on ep {:02X}: {}", ep, r);
            unsafe {
                (*(*transfer).xfer.as_ptr()).actual_length = 0;
                (*(*transfer).xfer.as_ptr()).status = r;
            }
            bulk_packet_complete(unsafe { (*transfer).xfer.as_ptr() });
        }
    }

    fn iso_packet(&self, id: u32, header: IsoPacketHeader, data: Vec<u8>) {
        self.handle_iso_packet(id, header, data);
    }

    fn interrupt_packet(&self, id: u32, header: InterruptPacketHeader, data: Vec<u8>) {
        self.handle_interrupt_packet(id, header, data);
    }
}

extern "system" fn control_packet_complete(xfer: *mut libusb_transfer) {
    let transfer = unsafe { (*xfer).user_data } as *mut Transfer;
    let host = unsafe { &*(*transfer).host };

    let mut header = match unsafe { &(*transfer).header } {
        SavedHeader::Control(h) => *h,
        _ => return,
    };
    header.status = host.status_to_peer(unsafe { (*xfer).status });
    header.length = unsafe { (*xfer).actual_length } as u16;

    debug!(
        "control complete ep {:02X} status {:?} len {}",
        header.endpoint, header.status, header.length
    );

    let id = unsafe { (*transfer).id };
    if header.endpoint & LIBUSB_ENDPOINT_IN != 0 {
        let setup = LIBUSB_CONTROL_SETUP_SIZE;
        let data = unsafe { &(&(*transfer).buffer)[setup..setup + header.length as usize] };
        trace_data("ctrl data in:", data);
        host.parser.send_control_packet(id, &header, data);
    } else {
        host.parser.send_control_packet(id, &header, &[]);
    }

    host.remove_and_free_transfer(transfer);
    host.flush_writes();
}

extern "system" fn bulk_packet_complete(xfer: *mut libusb_transfer) {
    let transfer = unsafe { (*xfer).user_data } as *mut Transfer;
    let host = unsafe { &*(*transfer).host };

    let mut header = match unsafe { &(*transfer).header } {
        SavedHeader::Bulk(h) => *h,
        _ => return,
    };
    header.status = host.status_to_peer(unsafe { (*xfer).status });
    header.length = unsafe { (*xfer).actual_length } as u16;

    debug!(
        "bulk complete ep {:02X} status {:?} len {}",
        header.endpoint, header.status, header.length
    );

    let id = unsafe { (*transfer).id };
    if header.endpoint & LIBUSB_ENDPOINT_IN != 0 {
        let data = unsafe { &(&(*transfer).buffer)[..header.length as usize] };
        trace_data("bulk data in:", data);
        host.parser.send_bulk_packet(id, &header, data);
    } else {
        host.parser.send_bulk_packet(id, &header, &[]);
    }

    host.remove_and_free_transfer(transfer);
    host.flush_writes();
}

#[cfg(test)]
pub(crate) fn new_test_host(parser: Box<dyn Parser>) -> Arc<HostInner> {
    Arc::new(HostInner {
        ctx: ptr::null_mut(),
        parser,
        flush_writes_hook: None,
        state: Mutex::new(DeviceState::new()),
        disconnect_lock: Mutex::new(()),
        disconnected: AtomicBool::new(true),
        wait_disconnect: AtomicBool::new(false),
        connect_pending: AtomicBool::new(false),
        read_status: AtomicU8::new(ReadStatus::Ok as u8),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingParser;

    #[test]
    fn read_status_is_sticky_until_taken() {
        let host = new_test_host(Box::new(RecordingParser::new()));
        assert_eq!(host.take_read_status(), ReadStatus::Ok);

        host.set_read_status(ReadStatus::DeviceLost);
        assert_eq!(host.take_read_status(), ReadStatus::DeviceLost);
        assert_eq!(host.take_read_status(), ReadStatus::Ok);
    }

    #[test]
    fn filter_reject_is_ignored_while_disconnected() {
        let host = new_test_host(Box::new(RecordingParser::new()));
        host.filter_reject();
        assert_eq!(host.take_read_status(), ReadStatus::Ok);
    }

    #[test]
    fn disconnect_ack_without_disconnect_is_ignored() {
        let parser = RecordingParser::new();
        let sent = parser.sent();
        let host = new_test_host(Box::new(parser));
        host.device_disconnect_ack();
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn commands_on_a_disconnected_host_answer_ioerror() {
        let parser = RecordingParser::new();
        let sent = parser.sent();
        let host = new_test_host(Box::new(parser));

        host.control_packet(
            1,
            ControlPacketHeader {
                endpoint: 0x80,
                ..Default::default()
            },
            Vec::new(),
        );
        host.bulk_packet(
            2,
            BulkPacketHeader {
                endpoint: 0x81,
                length: 8,
                ..Default::default()
            },
            Vec::new(),
        );
        host.get_configuration(3);
        host.get_alt_setting(4, 0);

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 4);
        sent.iter().for_each(|s| {
            assert_eq!(s.status(), Some(Status::Ioerror));
        });
    }
}
