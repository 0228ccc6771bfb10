use std::time::{Duration, Instant};

use log::debug;
use nusb::{
    MaybeFuture,
    transfer::{ControlIn, ControlOut, ControlType},
};

use crate::DEFAULT_TIMEOUT;
use crate::error::TransportError;
use crate::transport::*;

const USB_REQ_CLEAR_FEATURE: u8 = 0x01;
const USB_FEATURE_ENDPOINT_HALT: u16 = 0x00;
const USB_DIR_IN: u8 = 0x80;

const DISCONNECT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// [`Transport`] backed by [`nusb`]
pub struct NusbTransport {
    info: nusb::DeviceInfo,
    device: Option<nusb::Device>,
    interface: Option<nusb::Interface>,
    alt_setting: Option<u8>,
    timeout: Duration,
}

impl NusbTransport {
    pub fn new(info: nusb::DeviceInfo) -> Self {
        NusbTransport {
            info,
            device: None,
            interface: None,
            alt_setting: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Timeout applied to every control transfer.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn device_info(&self) -> &nusb::DeviceInfo {
        &self.info
    }

    fn interface(&self) -> Result<&nusb::Interface, TransportError> {
        self.interface.as_ref().ok_or(TransportError::NotOpen)
    }
}

fn control_type(request_type: RequestType) -> ControlType {
    match request_type {
        RequestType::Standard => ControlType::Standard,
        RequestType::Class => ControlType::Class,
        RequestType::Vendor => ControlType::Vendor,
    }
}

fn recipient(recipient: Recipient) -> nusb::transfer::Recipient {
    match recipient {
        Recipient::Device => nusb::transfer::Recipient::Device,
        Recipient::Interface => nusb::transfer::Recipient::Interface,
        Recipient::Endpoint => nusb::transfer::Recipient::Endpoint,
        Recipient::Other => nusb::transfer::Recipient::Other,
    }
}

impl Transport for NusbTransport {
    fn open(
        &mut self,
        configuration: u8,
        interface: u8,
        alt_setting: u8,
    ) -> Result<(), TransportError> {
        let device = match &self.device {
            Some(device) => device.clone(),
            None => {
                let device = self.info.open().wait()?;
                self.device = Some(device.clone());
                device
            }
        };

        let active = device
            .active_configuration()
            .ok()
            .map(|config| config.configuration_value());
        if active != Some(configuration) {
            debug!("Selecting configuration {configuration}");
            self.interface = None;
            self.alt_setting = None;
            device.set_configuration(configuration).wait()?;
        }

        let intf = match self.interface.take() {
            Some(intf) if intf.interface_number() == interface => intf,
            _ => {
                debug!("Claiming interface {interface}");
                self.alt_setting = None;
                device.claim_interface(interface).wait()?
            }
        };

        if self.alt_setting != Some(alt_setting) {
            debug!("Selecting alternate setting {alt_setting}");
            intf.set_alt_setting(alt_setting).wait()?;
            self.alt_setting = Some(alt_setting);
        }
        self.interface = Some(intf);
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.interface = None;
        self.alt_setting = None;
        self.device = None;
        Ok(())
    }

    fn control_out(
        &mut self,
        setup: ControlSetup,
        data: &[u8],
    ) -> Result<usize, TransportError> {
        self.interface()?
            .control_out(
                ControlOut {
                    control_type: control_type(setup.request_type),
                    recipient: recipient(setup.recipient),
                    request: setup.request,
                    value: setup.value,
                    index: setup.index,
                    data,
                },
                self.timeout,
            )
            .wait()?;
        Ok(data.len())
    }

    fn control_in(
        &mut self,
        setup: ControlSetup,
        length: u16,
    ) -> Result<Vec<u8>, TransportError> {
        Ok(self
            .interface()?
            .control_in(
                ControlIn {
                    control_type: control_type(setup.request_type),
                    recipient: recipient(setup.recipient),
                    request: setup.request,
                    value: setup.value,
                    index: setup.index,
                    length,
                },
                self.timeout,
            )
            .wait()?)
    }

    fn clear_halt(
        &mut self,
        direction: Direction,
        endpoint: u8,
    ) -> Result<(), TransportError> {
        let address = match direction {
            Direction::Out => endpoint,
            Direction::In => endpoint | USB_DIR_IN,
        };
        debug!("Clearing halt on endpoint {address:#04x}");
        self.control_out(
            ControlSetup {
                request_type: RequestType::Standard,
                recipient: Recipient::Endpoint,
                request: USB_REQ_CLEAR_FEATURE,
                value: USB_FEATURE_ENDPOINT_HALT,
                index: address as u16,
            },
            &[],
        )?;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        let device = self.device.as_ref().ok_or(TransportError::NotOpen)?;
        let res = device.reset().wait();
        self.interface = None;
        self.alt_setting = None;
        self.device = None;
        Ok(res?)
    }

    fn wait_disconnect(
        &mut self,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let id = self.info.id();
        let start = Instant::now();
        loop {
            if !nusb::list_devices().wait()?.any(|dev| dev.id() == id) {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(TransportError::Timeout);
            }
            std::thread::sleep(DISCONNECT_POLL_INTERVAL);
        }
    }
}
