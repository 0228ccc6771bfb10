//! Host side USB Device Firmware Upgrade (DFU) engine based on [`nusb`]
//!
//! Implements the DFU 1.1 class protocol and the STMicroelectronics
//! extension (aka "DfuSe"): descriptor parsing, the status-polled state
//! machine, chunked upload and download, and for DfuSe the memory map,
//! sector erase and address-targeted transfers.
//!
//! The USB access itself sits behind the [`Transport`] trait;
//! [`NusbTransport`] is the implementation for real hardware.
//!
//! Useful references:
//! - DFU: [USB Device Firmware Upgrade Specification, Revision 1.1](https://www.usb.org/sites/default/files/DFU_1.1.pdf)
//! - DfuSe: [STMicroelectronics AN3156](https://www.st.com/resource/en/application_note/an3156-usb-dfu-protocol-used-in-the-stm32-bootloader-stmicroelectronics.pdf)
//!
//! # Example
//!
//! ```no_run
//! use dfu_host::find_dfu_devices;
//!
//! let devices = find_dfu_devices(None, None)?;
//! if let Some(device) = devices.first() {
//!     let candidate = &device.interfaces()[0];
//!     let mut session = device.open_detect(candidate)?;
//!     let firmware = session.upload(2048, Some(64 * 1024))?;
//!     println!("Read {} bytes", firmware.len());
//! }
//! # Ok::<(), dfu_host::DfuError>(())
//! ```
//!
//! [`nusb`]: https://docs.rs/nusb

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000u64);
pub(crate) const DEFAULT_TRANSFER_SIZE: u16 = 1024 * 2;
pub(crate) const DEFAULT_DETACH_TIMEOUT: u16 = 1000;

mod clock;
mod descriptor;
mod device;
mod dfuse;
mod error;
mod interface;
mod memory;
mod session;
mod state;
mod transport;
mod usb;

#[cfg(test)]
mod mock;

use std::time::Duration;

// Re-exports
pub use clock::{Sleeper, ThreadSleeper};
pub use descriptor::{
    ConfigurationDescriptor, DFUSE_VERSION_NUMBER, Descriptor, DeviceDescriptor,
    DfuDescriptor, GenericDescriptor, InterfaceDescriptor, StringDescriptor,
    parse_string_descriptor, parse_sub_descriptors,
};
pub use device::{DfuDevice, find_dfu_devices};
pub use dfuse::DfuseCommand;
pub use error::{DfuError, ErrorKind, Result, TransportError};
pub use interface::{InterfaceCandidate, find_dfu_interfaces, is_dfu_interface};
pub use memory::{DfuMemSegment, EraseStep, MemoryInfo};
pub use session::{DfuSession, Progress, ProtocolVariant};
pub use state::{DfuState, DfuStatus, STATUS_OK};
pub use transport::{ControlSetup, Direction, Recipient, RequestType, Transport};
pub use usb::NusbTransport;
