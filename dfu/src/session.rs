use std::{cmp, collections::BTreeMap, fmt, time::Duration};

use log::{debug, info, warn};

use crate::{
    DEFAULT_DETACH_TIMEOUT, DEFAULT_TRANSFER_SIZE,
    clock::{Sleeper, ThreadSleeper},
    descriptor::*,
    error::{DfuError, Result, TransportError},
    interface::InterfaceCandidate,
    memory::MemoryInfo,
    state::{DFU_STATUS_LEN, DfuState, DfuStatus},
    transport::*,
};

pub(crate) const DFU_DETACH: u8 = 0x00;
pub(crate) const DFU_DNLOAD: u8 = 0x01;
pub(crate) const DFU_UPLOAD: u8 = 0x02;
pub(crate) const DFU_GETSTATUS: u8 = 0x03;
pub(crate) const DFU_CLRSTATUS: u8 = 0x04;
pub(crate) const DFU_GETSTATE: u8 = 0x05;
pub(crate) const DFU_ABORT: u8 = 0x06;

const USB_REQ_GET_DESCRIPTOR: u8 = 0x06;
const LANGUAGE_ID_US_ENGLISH: u16 = 0x0409;

/// Bytes transferred so far and, when known, the expected total
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub done: usize,
    pub total: Option<usize>,
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.total {
            Some(total) => write!(f, "{}/{}", self.done, total),
            None => write!(f, "{}", self.done),
        }
    }
}

/// Protocol flavour spoken on the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolVariant {
    /// Plain DFU 1.1
    Generic,
    /// STMicroelectronics extension with an addressable memory map
    DfuSe(MemoryInfo),
}

impl ProtocolVariant {
    /// DfuSe when the functional descriptor announces version 0x011A and
    /// the interface name is a valid memory map.
    pub fn detect(
        candidate: &InterfaceCandidate,
        functional: Option<&DfuDescriptor>,
    ) -> Self {
        if !functional.is_some_and(DfuDescriptor::is_dfuse) {
            return ProtocolVariant::Generic;
        }
        match candidate.memory_info() {
            Ok(memory) => ProtocolVariant::DfuSe(memory),
            Err(err) => {
                warn!("DfuSe device without usable memory map: {err}");
                ProtocolVariant::Generic
            }
        }
    }

    pub fn memory_info(&self) -> Option<&MemoryInfo> {
        match self {
            ProtocolVariant::Generic => None,
            ProtocolVariant::DfuSe(memory) => Some(memory),
        }
    }
}

/// An open DFU interface
///
/// Owns the interface claim from [`DfuSession::open`] until
/// [`DfuSession::close`] or drop. Requests are issued strictly one after
/// the other.
pub struct DfuSession<T: Transport, S: Sleeper = ThreadSleeper> {
    transport: T,
    sleeper: S,
    candidate: InterfaceCandidate,
    interface_number: u8,
    variant: ProtocolVariant,
    pub(crate) start_address: Option<u32>,
    progress: Option<Box<dyn FnMut(Progress)>>,
    open: bool,
}

impl<T: Transport> DfuSession<T> {
    pub fn open(
        transport: T,
        candidate: InterfaceCandidate,
        variant: ProtocolVariant,
    ) -> Result<Self> {
        Self::open_with(transport, ThreadSleeper, candidate, variant)
    }

    /// Open with the memory map taken from the interface name.
    pub fn open_dfuse(
        transport: T,
        candidate: InterfaceCandidate,
    ) -> Result<Self> {
        let memory = candidate.memory_info()?;
        Self::open(transport, candidate, ProtocolVariant::DfuSe(memory))
    }
}

impl<T: Transport, S: Sleeper> DfuSession<T, S> {
    pub fn open_with(
        mut transport: T,
        sleeper: S,
        candidate: InterfaceCandidate,
        variant: ProtocolVariant,
    ) -> Result<Self> {
        transport.open(
            candidate.configuration(),
            candidate.interface(),
            candidate.alt_setting(),
        )?;
        Ok(DfuSession {
            transport,
            sleeper,
            interface_number: candidate.interface(),
            candidate,
            variant,
            start_address: None,
            progress: None,
            open: true,
        })
    }

    /// Release the interface claim.
    pub fn close(mut self) -> Result<()> {
        self.open = false;
        Ok(self.transport.close()?)
    }

    pub fn candidate(&self) -> &InterfaceCandidate {
        &self.candidate
    }

    pub fn interface_number(&self) -> u8 {
        self.interface_number
    }

    pub fn variant(&self) -> &ProtocolVariant {
        &self.variant
    }

    pub fn memory_info(&self) -> Option<&MemoryInfo> {
        self.variant.memory_info()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn sleeper(&self) -> &S {
        &self.sleeper
    }

    pub fn start_address(&self) -> Option<u32> {
        self.start_address
    }

    /// Target address for DfuSe transfers. `None` selects the start of
    /// the first memory segment.
    pub fn set_start_address(&mut self, addr: Option<u32>) {
        self.start_address = addr;
    }

    pub fn set_progress_handler<F>(&mut self, handler: F)
    where
        F: FnMut(Progress) + 'static,
    {
        self.progress = Some(Box::new(handler));
    }

    pub(crate) fn report_progress(&mut self, done: usize, total: Option<usize>) {
        let progress = Progress { done, total };
        debug!("Progress {progress}");
        if let Some(handler) = self.progress.as_mut() {
            handler(progress);
        }
    }

    fn class_setup(&self, request: u8, value: u16) -> ControlSetup {
        ControlSetup {
            request_type: RequestType::Class,
            recipient: Recipient::Interface,
            request,
            value,
            index: self.interface_number as u16,
        }
    }

    fn standard_setup(&self, value: u16, index: u16) -> ControlSetup {
        ControlSetup {
            request_type: RequestType::Standard,
            recipient: Recipient::Device,
            request: USB_REQ_GET_DESCRIPTOR,
            value,
            index,
        }
    }

    fn control_out(&mut self, setup: ControlSetup, data: &[u8]) -> Result<usize> {
        match self.transport.control_out(setup, data) {
            Err(TransportError::Stall) => {
                self.transport
                    .clear_halt(Direction::Out, self.interface_number)?;
                Err(DfuError::Stalled {
                    request: setup.request,
                })
            }
            res => Ok(res?),
        }
    }

    fn control_in(&mut self, setup: ControlSetup, length: u16) -> Result<Vec<u8>> {
        match self.transport.control_in(setup, length) {
            Err(TransportError::Stall) => {
                self.transport
                    .clear_halt(Direction::In, self.interface_number)?;
                Err(DfuError::Stalled {
                    request: setup.request,
                })
            }
            res => Ok(res?),
        }
    }

    fn request_out(&mut self, request: u8, value: u16, data: &[u8]) -> Result<usize> {
        let setup = self.class_setup(request, value);
        self.control_out(setup, data)
    }

    fn request_in(&mut self, request: u8, value: u16, length: u16) -> Result<Vec<u8>> {
        let setup = self.class_setup(request, value);
        self.control_in(setup, length)
    }

    /// `DFU_DETACH` with the default detach timeout.
    pub fn detach(&mut self) -> Result<()> {
        self.detach_with(DEFAULT_DETACH_TIMEOUT)
    }

    /// `DFU_DETACH`; the device may drop off the bus right away, so no
    /// status is read and a disconnect is not an error.
    pub fn detach_with(&mut self, timeout_ms: u16) -> Result<()> {
        match self.request_out(DFU_DETACH, timeout_ms, &[]) {
            Err(err) if err.is_disconnect() => {
                debug!("Device disconnected on detach");
                Ok(())
            }
            res => res.map(|_| ()),
        }
    }

    /// Wait for the device to leave the bus, e.g. after [`Self::detach`].
    pub fn wait_for_disconnect(&mut self, timeout: Duration) -> Result<()> {
        Ok(self.transport.wait_disconnect(timeout)?)
    }

    /// `DFU_DNLOAD` of one block. Returns the number of bytes written.
    pub fn download_block(&mut self, transaction: u16, data: &[u8]) -> Result<usize> {
        self.request_out(DFU_DNLOAD, transaction, data)
    }

    /// `DFU_UPLOAD` of one block of at most `length` bytes.
    pub fn upload_block(&mut self, transaction: u16, length: u16) -> Result<Vec<u8>> {
        self.request_in(DFU_UPLOAD, transaction, length)
    }

    pub fn get_status(&mut self) -> Result<DfuStatus> {
        let data = self.request_in(DFU_GETSTATUS, 0, DFU_STATUS_LEN)?;
        DfuStatus::from_raw(&data)
    }

    pub fn get_state(&mut self) -> Result<DfuState> {
        let data = self.request_in(DFU_GETSTATE, 0, 1)?;
        match data.first() {
            Some(state) => DfuState::try_from(*state),
            None => Err(DfuError::ShortResponse {
                request: DFU_GETSTATE,
                len: 0,
            }),
        }
    }

    pub fn clear_status(&mut self) -> Result<()> {
        self.request_out(DFU_CLRSTATUS, 0, &[]).map(|_| ())
    }

    pub fn abort(&mut self) -> Result<()> {
        self.request_out(DFU_ABORT, 0, &[]).map(|_| ())
    }

    /// `DFU_ABORT`, then clear a `dfuERROR` if needed, and confirm
    /// `dfuIDLE`.
    pub fn abort_to_idle(&mut self) -> Result<()> {
        self.abort()?;
        let mut state = self.get_state()?;
        if state == DfuState::DfuError {
            self.clear_status()?;
            state = self.get_state()?;
        }
        if state != DfuState::DfuIdle {
            return Err(DfuError::NotIdle(state));
        }
        Ok(())
    }

    /// Poll `DFU_GETSTATUS` until `predicate` accepts the state or the
    /// device enters `dfuERROR`. Between polls the session sleeps for the
    /// poll timeout the device reported.
    ///
    /// A `dfuERROR` state is returned, not raised.
    pub fn poll_until<P>(&mut self, predicate: P) -> Result<DfuStatus>
    where
        P: Fn(DfuState) -> bool,
    {
        let mut status = self.get_status()?;
        while !predicate(status.state) && status.state != DfuState::DfuError {
            debug!("Sleeping for {}ms", status.poll_timeout);
            self.sleeper.sleep(status.poll_delay());
            status = self.get_status()?;
        }
        Ok(status)
    }

    pub fn poll_until_idle(&mut self, idle_state: DfuState) -> Result<DfuStatus> {
        self.poll_until(|state| state == idle_state)
    }

    /// Read firmware from the device.
    ///
    /// DfuSe sessions read from the target address, see
    /// [`Self::dfuse_upload`]. `max_size` of `None` reads until the
    /// device sends a short block.
    pub fn upload(&mut self, xfer_size: u16, max_size: Option<usize>) -> Result<Vec<u8>> {
        match self.variant {
            ProtocolVariant::Generic => self.upload_from(xfer_size, max_size, 0),
            ProtocolVariant::DfuSe(_) => self.dfuse_upload(xfer_size, max_size),
        }
    }

    /// Write firmware to the device and run manifestation.
    ///
    /// DfuSe sessions erase and write at the target address, see
    /// [`Self::dfuse_download`].
    pub fn download(
        &mut self,
        xfer_size: u16,
        data: &[u8],
        manifestation_tolerant: bool,
    ) -> Result<()> {
        match self.variant {
            ProtocolVariant::Generic => {
                self.generic_download(xfer_size, data, manifestation_tolerant)
            }
            ProtocolVariant::DfuSe(_) => {
                self.dfuse_download(xfer_size, data, manifestation_tolerant, false)
            }
        }
    }

    /// Upload blocks numbered from `first_block` until `max_size` bytes
    /// are read or the device returns a short block.
    pub fn upload_from(
        &mut self,
        xfer_size: u16,
        max_size: Option<usize>,
        first_block: u16,
    ) -> Result<Vec<u8>> {
        let xfer_size = effective_transfer_size(xfer_size) as usize;
        let mut transaction = first_block;
        let mut data: Vec<u8> = Vec::new();

        info!("Copying data from DFU device");
        self.report_progress(0, max_size);

        loop {
            let bytes_to_read = match max_size {
                Some(max) => cmp::min(xfer_size, max - data.len()),
                None => xfer_size,
            };
            let mut block = self.upload_block(transaction, bytes_to_read as u16)?;
            transaction = transaction.wrapping_add(1);
            debug!("Read {} bytes", block.len());

            let short = block.len() < bytes_to_read;
            block.truncate(bytes_to_read);
            data.extend_from_slice(&block);
            self.report_progress(data.len(), max_size);

            if short || max_size.is_some_and(|max| data.len() >= max) {
                break;
            }
        }

        if max_size == Some(data.len()) {
            self.abort_to_idle()?;
        }

        info!("Read {} bytes", data.len());
        Ok(data)
    }

    fn generic_download(
        &mut self,
        xfer_size: u16,
        data: &[u8],
        manifestation_tolerant: bool,
    ) -> Result<()> {
        let xfer_size = effective_transfer_size(xfer_size) as usize;
        let expected_size = data.len();
        let mut bytes_sent = 0;
        let mut transaction: u16 = 0;

        info!("Copying data to DFU device");
        self.report_progress(bytes_sent, Some(expected_size));

        for chunk in data.chunks(xfer_size) {
            let bytes_written = self.download_block(transaction, chunk)?;
            transaction = transaction.wrapping_add(1);
            debug!("Sent {bytes_written} bytes");

            self.poll_until_idle(DfuState::DfuDnloadIdle)?
                .ok("DOWNLOAD")?;

            bytes_sent += bytes_written;
            self.report_progress(bytes_sent, Some(expected_size));
        }

        debug!("Sending empty block");
        self.download_block(transaction, &[])?;

        info!("Wrote {bytes_sent} bytes");
        info!("Manifesting new firmware");

        if manifestation_tolerant {
            // a device that is not really tolerant ends up in MANIFEST-WAIT-RESET
            match self.poll_until(|state| {
                state == DfuState::DfuIdle
                    || state == DfuState::DfuManifestWaitReset
            }) {
                Ok(status) => {
                    if status.state == DfuState::DfuManifestWaitReset {
                        debug!(
                            "Device transitioned to MANIFEST_WAIT_RESET even though it is manifestation tolerant"
                        );
                    }
                    status.ok("MANIFEST")?;
                }
                Err(err) if err.is_disconnect() => {
                    warn!("Unable to poll final manifestation status");
                }
                Err(err) => return Err(err),
            }
        } else {
            match self.get_status() {
                Ok(status) => debug!(
                    "Final DFU status: state={}, status={}",
                    status.state, status.status
                ),
                Err(err) => debug!("Manifest GET_STATUS poll error: {err}"),
            }
        }

        self.reset_device()
    }

    /// USB reset to leave manifestation; a device that already left the
    /// bus is not an error.
    pub fn reset_device(&mut self) -> Result<()> {
        match self.transport.reset() {
            Err(TransportError::Disconnected) => {
                debug!("Ignored reset error");
                Ok(())
            }
            res => Ok(res?),
        }
    }

    pub fn read_device_descriptor(&mut self) -> Result<DeviceDescriptor> {
        let setup = self.standard_setup((DT_DEVICE as u16) << 8, 0);
        let data = self.control_in(setup, DEVICE_DESC_LEN as u16)?;
        DeviceDescriptor::parse(&data)
    }

    /// Read configuration `index` including all sub-descriptors.
    pub fn read_configuration_descriptor(
        &mut self,
        index: u8,
    ) -> Result<ConfigurationDescriptor> {
        let setup = self.standard_setup((DT_CONFIGURATION as u16) << 8 | index as u16, 0);
        let header = self.control_in(setup, 4)?;
        if header.len() < 4 {
            return Err(DfuError::ShortResponse {
                request: USB_REQ_GET_DESCRIPTOR,
                len: header.len(),
            });
        }
        let total_length = u16::from_le_bytes([header[2], header[3]]);
        let data = self.control_in(setup, total_length)?;
        ConfigurationDescriptor::parse(&data)
    }

    /// Language 0 returns the supported language ids, any other language
    /// the decoded string.
    pub fn read_string_descriptor(
        &mut self,
        index: u8,
        lang_id: u16,
    ) -> Result<StringDescriptor> {
        let setup = self.standard_setup((DT_STRING as u16) << 8 | index as u16, lang_id);
        let head = self.control_in(setup, 1)?;
        let length = *head.first().ok_or(DfuError::ShortResponse {
            request: USB_REQ_GET_DESCRIPTOR,
            len: 0,
        })?;
        let data = self.control_in(setup, length as u16)?;
        parse_string_descriptor(&data, lang_id)
    }

    /// Interface names keyed by (configuration value, interface,
    /// alternate setting). Names that cannot be read map to `None`.
    pub fn read_interface_names(
        &mut self,
    ) -> Result<BTreeMap<(u8, u8, u8), Option<String>>> {
        let device = self.read_device_descriptor()?;
        let mut names = BTreeMap::new();
        let mut strings: BTreeMap<u8, Option<String>> = BTreeMap::new();

        for index in 0..device.num_configurations {
            let config = self.read_configuration_descriptor(index)?;
            for intf in config.interfaces() {
                let name = match intf.interface_index {
                    0 => None,
                    idx => {
                        if !strings.contains_key(&idx) {
                            let name = match self
                                .read_string_descriptor(idx, LANGUAGE_ID_US_ENGLISH)
                            {
                                Ok(StringDescriptor::Text(name)) => Some(name),
                                Ok(StringDescriptor::Languages(_)) => None,
                                Err(err) => {
                                    warn!("Failed to read string descriptor {idx}: {err}");
                                    None
                                }
                            };
                            strings.insert(idx, name);
                        }
                        strings.get(&idx).cloned().flatten()
                    }
                };
                names.insert(
                    (
                        config.configuration_value,
                        intf.interface_number,
                        intf.alternate_setting,
                    ),
                    name,
                );
            }
        }
        Ok(names)
    }

    /// DFU functional descriptor nested under this session's interface.
    pub fn functional_descriptor(&mut self) -> Result<Option<DfuDescriptor>> {
        let device = self.read_device_descriptor()?;
        for index in 0..device.num_configurations {
            let config = self.read_configuration_descriptor(index)?;
            if config.configuration_value != self.candidate.configuration() {
                continue;
            }
            return Ok(config
                .interface(self.candidate.interface(), self.candidate.alt_setting())
                .and_then(InterfaceDescriptor::dfu_descriptor)
                .cloned());
        }
        Ok(None)
    }
}

impl<T: Transport, S: Sleeper> Drop for DfuSession<T, S> {
    fn drop(&mut self) {
        if self.open {
            if let Err(err) = self.transport.close() {
                debug!("Error closing DFU interface: {err}");
            }
        }
    }
}

pub(crate) fn effective_transfer_size(xfer_size: u16) -> u16 {
    if xfer_size > 0 {
        xfer_size
    } else {
        DEFAULT_TRANSFER_SIZE
    }
}
