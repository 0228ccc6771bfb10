//! Boundary between the protocol engine and a USB access library
//!
//! [`NusbTransport`](crate::NusbTransport) is the implementation used with
//! real hardware.

use std::time::Duration;

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Standard,
    Class,
    Vendor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

/// SETUP packet fields except `bmRequestType` direction and `wLength`,
/// which follow from the call used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub request_type: RequestType,
    pub recipient: Recipient,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

/// USB primitives the DFU engine needs from the host stack
///
/// Calls block until the transfer completes or fails. A stalled control
/// transfer must be reported as [`TransportError::Stall`]; a device that
/// went away as [`TransportError::Disconnected`].
pub trait Transport {
    /// Select the configuration, claim the interface and select the
    /// alternate setting. Steps that are already in effect are skipped.
    fn open(
        &mut self,
        configuration: u8,
        interface: u8,
        alt_setting: u8,
    ) -> Result<(), TransportError>;

    /// Release the interface claim. Must succeed on a disconnected device.
    fn close(&mut self) -> Result<(), TransportError>;

    /// Returns the number of bytes written.
    fn control_out(
        &mut self,
        setup: ControlSetup,
        data: &[u8],
    ) -> Result<usize, TransportError>;

    fn control_in(
        &mut self,
        setup: ControlSetup,
        length: u16,
    ) -> Result<Vec<u8>, TransportError>;

    fn clear_halt(
        &mut self,
        direction: Direction,
        endpoint: u8,
    ) -> Result<(), TransportError>;

    fn reset(&mut self) -> Result<(), TransportError>;

    /// Block until this device is reported gone, or fail with
    /// [`TransportError::Timeout`].
    fn wait_disconnect(
        &mut self,
        timeout: Duration,
    ) -> Result<(), TransportError>;
}
