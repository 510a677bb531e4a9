//! Device filtering: rule storage and the matching used to decide
//! whether a device may be redirected.
//!
//! A rule list is an ordered set of allow/deny entries. The device
//! identity and every interface are checked independently; for each of
//! them the first matching rule decides, and a single deny rejects the
//! whole device. An empty list allows everything.

use std::fmt;
use std::mem::MaybeUninit;
use std::ptr;
use std::str::FromStr;

use libusb1_sys::*;

use crate::error::{self, Error, Result};

/// Class/subclass/protocol triple of a device or one of its interfaces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassCodes {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

/// One filter rule. Fields set to `-1` match any value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterRule {
    /// USB class to match: the device class or any interface class.
    pub device_class: i32,
    pub device_subclass: i32,
    pub device_protocol: i32,
    pub vendor_id: i32,
    pub product_id: i32,
    /// BCD device release to match.
    pub device_version_bcd: i32,
    /// Whether a match allows or denies the device.
    pub allow: bool,
}

fn field_matches(field: i32, value: u8) -> bool {
    field == -1 || field == value as i32
}

impl FilterRule {
    fn matches(&self, codes: ClassCodes, vendor: u16, product: u16, bcd: u16) -> bool {
        field_matches(self.device_class, codes.class)
            && field_matches(self.device_subclass, codes.subclass)
            && field_matches(self.device_protocol, codes.protocol)
            && (self.vendor_id == -1 || self.vendor_id == vendor as i32)
            && (self.product_id == -1 || self.product_id == product as i32)
            && (self.device_version_bcd == -1 || self.device_version_bcd == bcd as i32)
    }

    /// Parses a rule list in the
    /// `class,subclass,protocol,vendor,product,version,allow` format,
    /// entries separated by any of `sep`.
    pub fn parse_list(s: &str, sep: &str) -> Result<Vec<FilterRule>> {
        s.split(|c| sep.contains(c))
            .filter(|entry| !entry.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl FromStr for FilterRule {
    type Err = Error;

    fn from_str(s: &str) -> Result<FilterRule> {
        let mut fields = s.split(',').map(|f| {
            let f = f.trim();
            if let Some(hex) = f.strip_prefix("0x") {
                i32::from_str_radix(hex, 16)
            } else {
                f.parse::<i32>()
            }
        });
        let mut next = || {
            fields
                .next()
                .and_then(|f| f.ok())
                .ok_or(Error::InvalidParam)
        };

        let rule = FilterRule {
            device_class: next()?,
            device_subclass: next()?,
            device_protocol: next()?,
            vendor_id: next()?,
            product_id: next()?,
            device_version_bcd: next()?,
            allow: next()? != 0,
        };
        Ok(rule)
    }
}

impl fmt::Display for FilterRule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{},{},{},{},{},{},{}",
            self.device_class,
            self.device_subclass,
            self.device_protocol,
            self.vendor_id,
            self.product_id,
            self.device_version_bcd,
            self.allow as u8
        )
    }
}

/// Checks a device, described by its class triple, identity and
/// per-interface class triples, against a rule list. Returns whether
/// the device may be redirected.
pub fn check_filter(
    rules: &[FilterRule],
    device: ClassCodes,
    vendor_id: u16,
    product_id: u16,
    device_version_bcd: u16,
    interfaces: &[ClassCodes],
) -> bool {
    if rules.is_empty() {
        return true;
    }

    let verdict = |codes: ClassCodes| {
        rules
            .iter()
            .find(|rule| rule.matches(codes, vendor_id, product_id, device_version_bcd))
            .map(|rule| rule.allow)
            // Subjects no rule speaks about are allowed
            .unwrap_or(true)
    };

    if !verdict(device) {
        return false;
    }
    interfaces.iter().all(|&codes| verdict(codes))
}

/// Fetches the descriptors of `dev` and checks them against `rules`.
/// Denial is reported as [`Error::Access`].
///
/// # Safety
/// `dev` must be a valid libusb device.
pub unsafe fn check_device_filter(rules: &[FilterRule], dev: *mut libusb_device) -> Result<()> {
    let mut desc = MaybeUninit::<libusb_device_descriptor>::uninit();
    let r = libusb_get_device_descriptor(dev, desc.as_mut_ptr());
    if r < 0 {
        return Err(error::from_libusb(r));
    }
    let desc = desc.assume_init();

    let mut config = ptr::null();
    let r = libusb_get_active_config_descriptor(dev, &mut config);
    if r < 0 {
        return Err(error::from_libusb(r));
    }

    let num_interfaces = (*config).bNumInterfaces as usize;
    let mut interfaces = Vec::with_capacity(num_interfaces);
    for i in 0..num_interfaces {
        let intf = &*(*(*config).interface.add(i)).altsetting;
        interfaces.push(ClassCodes {
            class: intf.bInterfaceClass,
            subclass: intf.bInterfaceSubClass,
            protocol: intf.bInterfaceProtocol,
        });
    }
    libusb_free_config_descriptor(config);

    let device = ClassCodes {
        class: desc.bDeviceClass,
        subclass: desc.bDeviceSubClass,
        protocol: desc.bDeviceProtocol,
    };
    if check_filter(
        rules,
        device,
        desc.idVendor,
        desc.idProduct,
        desc.bcdDevice,
        &interfaces,
    ) {
        Ok(())
    } else {
        Err(Error::Access)
    }
}
