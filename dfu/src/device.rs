use std::num::NonZeroU8;

use log::{debug, warn};
use nusb::{self, MaybeFuture};

use crate::{
    DEFAULT_TIMEOUT,
    descriptor::{DFU_CLASS, DFU_DESC_TYPE, DFU_SUBCLASS, DfuDescriptor},
    error::Result,
    interface::{InterfaceCandidate, is_dfu_interface},
    session::{DfuSession, ProtocolVariant},
    usb::NusbTransport,
};

/// DFU device representation
pub struct DfuDevice {
    dev: nusb::DeviceInfo,
    interfaces: Vec<InterfaceCandidate>,
}

impl DfuDevice {
    fn from_device_info(device: nusb::DeviceInfo) -> Result<Option<Self>> {
        let open_dev: nusb::Device = device.open().wait()?;
        let dfu_interfaces: Vec<InterfaceCandidate> = open_dev
            .configurations()
            .flat_map(|configuration| {
                let open_dev = open_dev.clone();
                let config = configuration.configuration_value();
                configuration.interface_alt_settings().filter_map(
                    move |alt_setting| {
                        if !is_dfu_interface(
                            alt_setting.class(),
                            alt_setting.subclass(),
                            alt_setting.protocol(),
                        ) {
                            return None;
                        }
                        let name = alt_setting
                            .string_index()
                            .and_then(|idx| get_string_descriptor(&open_dev, idx));
                        Some(InterfaceCandidate::new(
                            config,
                            alt_setting.interface_number(),
                            alt_setting.alternate_setting(),
                            alt_setting.protocol(),
                            name,
                        ))
                    },
                )
            })
            .collect();

        if dfu_interfaces.is_empty() {
            Ok(None)
        } else {
            Ok(Some(DfuDevice {
                dev: device,
                interfaces: dfu_interfaces,
            }))
        }
    }

    pub fn device_info(&self) -> &nusb::DeviceInfo {
        &self.dev
    }

    pub fn id(&self) -> nusb::DeviceId {
        self.dev.id()
    }

    pub fn bus_id(&self) -> &str {
        self.dev.bus_id()
    }

    pub fn device_address(&self) -> u8 {
        self.dev.device_address()
    }

    pub fn vendor_id(&self) -> u16 {
        self.dev.vendor_id()
    }

    pub fn product_id(&self) -> u16 {
        self.dev.product_id()
    }

    pub fn product_string(&self) -> Option<&str> {
        self.dev.product_string()
    }

    /// DFU interfaces and alternate settings combined
    pub fn interfaces(&self) -> &Vec<InterfaceCandidate> {
        &self.interfaces
    }

    /// Query the DFU functional descriptor of the first DFU interface.
    pub fn dfu_descriptor(&self) -> Result<Option<DfuDescriptor>> {
        let open_dev = self.dev.open().wait()?;
        let found = open_dev.configurations().find_map(|config| {
            config
                .interface_alt_settings()
                .filter(|alt| {
                    alt.class() == DFU_CLASS && alt.subclass() == DFU_SUBCLASS
                })
                .find_map(|alt| {
                    alt.descriptors()
                        .find(|desc| desc.descriptor_type() == DFU_DESC_TYPE)
                        .map(|desc| DfuDescriptor::parse(&desc))
                })
        });
        found.transpose()
    }

    pub fn is_dfuse(&self) -> bool {
        matches!(self.dfu_descriptor(), Ok(Some(desc)) if desc.is_dfuse())
    }

    /// Open a session speaking `variant` on `candidate`.
    pub fn open(
        &self,
        candidate: &InterfaceCandidate,
        variant: ProtocolVariant,
    ) -> Result<DfuSession<NusbTransport>> {
        debug!(
            "Opening interface {} alt {} of {:04x}:{:04x}",
            candidate.interface(),
            candidate.alt_setting(),
            self.vendor_id(),
            self.product_id()
        );
        DfuSession::open(
            NusbTransport::new(self.dev.clone()),
            candidate.clone(),
            variant,
        )
    }

    /// Open a session, choosing DfuSe when the device advertises it.
    pub fn open_detect(
        &self,
        candidate: &InterfaceCandidate,
    ) -> Result<DfuSession<NusbTransport>> {
        let functional = self.dfu_descriptor().unwrap_or_else(|err| {
            warn!("Could not read DFU functional descriptor: {err}");
            None
        });
        self.open(
            candidate,
            ProtocolVariant::detect(candidate, functional.as_ref()),
        )
    }
}

fn get_string_descriptor(device: &nusb::Device, desc_index: NonZeroU8) -> Option<String> {
    let language: u16 = device
        .get_string_descriptor_supported_languages(DEFAULT_TIMEOUT)
        .wait()
        .ok()?
        .next()
        .unwrap_or(nusb::descriptors::language_id::US_ENGLISH);

    device
        .get_string_descriptor(desc_index, language, DEFAULT_TIMEOUT)
        .wait()
        .ok()
}

fn is_dfu_device(dev: &nusb::DeviceInfo) -> bool {
    dev.interfaces()
        .any(|i| i.class() == DFU_CLASS && i.subclass() == DFU_SUBCLASS)
}

/// Enumerate DFU devices, optionally filtered by vendor and product id.
pub fn find_dfu_devices(vid: Option<u16>, pid: Option<u16>) -> Result<Vec<DfuDevice>> {
    let devices: Vec<nusb::DeviceInfo> = nusb::list_devices()
        .wait()?
        .filter(|dev| {
            vid.is_none_or(|id| dev.vendor_id() == id)
                && pid.is_none_or(|id| dev.product_id() == id)
        })
        .filter(is_dfu_device)
        .collect();
    let mut dfu_devices = Vec::with_capacity(devices.len());
    for device in devices {
        if let Some(dfu_device) = DfuDevice::from_device_info(device)? {
            dfu_devices.push(dfu_device);
        }
    }
    Ok(dfu_devices)
}
