//! In-memory DFU device used by the engine tests

use std::{cell::Cell, collections::BTreeMap, rc::Rc, time::Duration};

use crate::{
    clock::Sleeper,
    error::TransportError,
    session::*,
    state::DfuState,
    transport::*,
};

const DFU_STATUS_ERR_STALLEDPKT: u8 = 0x0f;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Out { request: u8, value: u16, data: Vec<u8> },
    In { request: u8, value: u16, length: u16 },
}

pub(crate) struct MockDevice {
    pub state: DfuState,
    pub status: u8,
    pub poll_timeout: u32,
    /// GETSTATUS answers spent in dfuDNBUSY after each DNLOAD.
    pub busy_polls: u32,
    pub pending_busy: u32,
    pub dfuse: bool,
    pub manifestation_tolerant: bool,
    /// Fail with this status once the block with the given number was
    /// sent.
    pub fail_block: Option<(u16, u8)>,
    pub last_block: u16,
    pub stall_request: Option<u8>,
    /// Returned by the GETSTATUS that ends manifestation.
    pub manifest_error: Option<TransportError>,
    /// Non-zero puts the device into dfuERROR when leaving
    /// dfuMANIFEST-SYNC.
    pub manifest_status: u8,
    pub reset_error: Option<TransportError>,
    pub disconnects: bool,

    pub upload_data: Vec<u8>,
    pub upload_pos: usize,
    pub address: u32,
    pub erased: Vec<u32>,
    /// (block, target address, payload) of every data block received
    pub blocks: Vec<(u16, u32, Vec<u8>)>,

    pub device_descriptor: Vec<u8>,
    pub configurations: Vec<Vec<u8>>,
    pub strings: BTreeMap<u8, String>,

    pub calls: Vec<Call>,
    pub halts: Vec<(Direction, u8)>,
    pub resets: usize,
    pub opens: Vec<(u8, u8, u8)>,
    pub closes: Rc<Cell<usize>>,
}

impl Default for MockDevice {
    fn default() -> Self {
        MockDevice {
            state: DfuState::DfuIdle,
            status: 0,
            poll_timeout: 10,
            busy_polls: 1,
            pending_busy: 0,
            dfuse: false,
            manifestation_tolerant: true,
            fail_block: None,
            last_block: 0,
            stall_request: None,
            manifest_error: None,
            manifest_status: 0,
            reset_error: None,
            disconnects: true,
            upload_data: Vec::new(),
            upload_pos: 0,
            address: 0,
            erased: Vec::new(),
            blocks: Vec::new(),
            device_descriptor: Vec::new(),
            configurations: Vec::new(),
            strings: BTreeMap::new(),
            calls: Vec::new(),
            halts: Vec::new(),
            resets: 0,
            opens: Vec::new(),
            closes: Rc::new(Cell::new(0)),
        }
    }
}

impl MockDevice {
    pub fn dfuse() -> Self {
        MockDevice {
            dfuse: true,
            ..Default::default()
        }
    }

    /// Requests with the given code, in order.
    pub fn requests(&self, code: u8) -> Vec<&Call> {
        self.calls
            .iter()
            .filter(|call| match call {
                Call::Out { request, .. } | Call::In { request, .. } => *request == code,
            })
            .collect()
    }

    /// (block number, length) of every DNLOAD.
    pub fn dnloads(&self) -> Vec<(u16, usize)> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                Call::Out {
                    request: DFU_DNLOAD,
                    value,
                    data,
                } => Some((*value, data.len())),
                _ => None,
            })
            .collect()
    }

    fn status_bytes(&self) -> Vec<u8> {
        let timeout = self.poll_timeout.to_le_bytes();
        vec![
            self.status,
            timeout[0],
            timeout[1],
            timeout[2],
            self.state as u8,
            0,
        ]
    }

    fn fail(&mut self, status: u8) {
        self.state = DfuState::DfuError;
        self.status = status;
    }

    fn dnload(&mut self, block: u16, data: &[u8]) -> Result<usize, TransportError> {
        if self.state != DfuState::DfuIdle && self.state != DfuState::DfuDnloadIdle {
            self.fail(DFU_STATUS_ERR_STALLEDPKT);
            return Err(TransportError::Stall);
        }
        self.last_block = block;
        if data.is_empty() {
            self.state = DfuState::DfuManifestSync;
            return Ok(0);
        }
        if self.dfuse && block == 0 {
            let param = data
                .get(1..5)
                .map(|p| u32::from_le_bytes([p[0], p[1], p[2], p[3]]));
            match (data[0], param) {
                (0x21, Some(addr)) => self.address = addr,
                (0x41, Some(addr)) => self.erased.push(addr),
                _ => {}
            }
        } else {
            self.blocks.push((block, self.address, data.to_vec()));
        }
        self.state = DfuState::DfuDnloadSync;
        self.pending_busy = self.busy_polls;
        Ok(data.len())
    }

    fn get_status(&mut self) -> Result<Vec<u8>, TransportError> {
        match self.state {
            DfuState::DfuDnloadSync | DfuState::DfuDnBusy => {
                if self.pending_busy > 0 {
                    self.pending_busy -= 1;
                    self.state = DfuState::DfuDnBusy;
                } else if let Some((_, status)) =
                    self.fail_block.filter(|(block, _)| *block == self.last_block)
                {
                    self.fail(status);
                } else {
                    self.state = DfuState::DfuDnloadIdle;
                }
            }
            DfuState::DfuManifestSync => {
                if let Some(err) = self.manifest_error.clone() {
                    return Err(err);
                }
                self.state = if self.manifest_status != 0 {
                    self.status = self.manifest_status;
                    DfuState::DfuError
                } else if self.dfuse {
                    DfuState::DfuManifest
                } else if self.manifestation_tolerant {
                    DfuState::DfuIdle
                } else {
                    DfuState::DfuManifestWaitReset
                };
            }
            _ => {}
        }
        Ok(self.status_bytes())
    }

    fn upload(&mut self, length: u16) -> Result<Vec<u8>, TransportError> {
        if self.state != DfuState::DfuIdle && self.state != DfuState::DfuUploadIdle {
            self.fail(DFU_STATUS_ERR_STALLEDPKT);
            return Err(TransportError::Stall);
        }
        let end = (self.upload_pos + length as usize).min(self.upload_data.len());
        let data = self.upload_data[self.upload_pos..end].to_vec();
        self.upload_pos = end;
        self.state = if data.len() < length as usize {
            DfuState::DfuIdle
        } else {
            DfuState::DfuUploadIdle
        };
        Ok(data)
    }

    fn get_descriptor(
        &self,
        value: u16,
        index: u16,
        length: u16,
    ) -> Result<Vec<u8>, TransportError> {
        let desc_index = (value & 0xff) as u8;
        let data = match value >> 8 {
            0x01 => self.device_descriptor.clone(),
            0x02 => self
                .configurations
                .get(desc_index as usize)
                .cloned()
                .ok_or(TransportError::Stall)?,
            0x03 if desc_index == 0 || index == 0 => vec![4, 3, 0x09, 0x04],
            0x03 => {
                let text = self.strings.get(&desc_index).ok_or(TransportError::Stall)?;
                let mut data = vec![(2 + text.len() * 2) as u8, 3];
                for unit in text.encode_utf16() {
                    data.extend_from_slice(&unit.to_le_bytes());
                }
                data
            }
            _ => return Err(TransportError::Stall),
        };
        Ok(data[..data.len().min(length as usize)].to_vec())
    }
}

impl Transport for MockDevice {
    fn open(
        &mut self,
        configuration: u8,
        interface: u8,
        alt_setting: u8,
    ) -> Result<(), TransportError> {
        self.opens.push((configuration, interface, alt_setting));
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.closes.set(self.closes.get() + 1);
        Ok(())
    }

    fn control_out(&mut self, setup: ControlSetup, data: &[u8]) -> Result<usize, TransportError> {
        self.calls.push(Call::Out {
            request: setup.request,
            value: setup.value,
            data: data.to_vec(),
        });
        if self.stall_request == Some(setup.request) {
            self.stall_request = None;
            return Err(TransportError::Stall);
        }
        match setup.request {
            DFU_DNLOAD => self.dnload(setup.value, data),
            DFU_CLRSTATUS => {
                self.state = DfuState::DfuIdle;
                self.status = 0;
                Ok(0)
            }
            DFU_ABORT => {
                if self.state != DfuState::DfuError {
                    self.state = DfuState::DfuIdle;
                }
                self.upload_pos = 0;
                Ok(0)
            }
            _ => Ok(data.len()),
        }
    }

    fn control_in(&mut self, setup: ControlSetup, length: u16) -> Result<Vec<u8>, TransportError> {
        self.calls.push(Call::In {
            request: setup.request,
            value: setup.value,
            length,
        });
        if setup.request_type == RequestType::Standard {
            return self.get_descriptor(setup.value, setup.index, length);
        }
        if self.stall_request == Some(setup.request) {
            self.stall_request = None;
            return Err(TransportError::Stall);
        }
        match setup.request {
            DFU_GETSTATUS => self.get_status(),
            DFU_GETSTATE => Ok(vec![self.state as u8]),
            DFU_UPLOAD => self.upload(length),
            _ => Err(TransportError::Stall),
        }
    }

    fn clear_halt(&mut self, direction: Direction, endpoint: u8) -> Result<(), TransportError> {
        self.halts.push((direction, endpoint));
        Ok(())
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        self.resets += 1;
        match self.reset_error.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn wait_disconnect(&mut self, _timeout: Duration) -> Result<(), TransportError> {
        if self.disconnects {
            Ok(())
        } else {
            Err(TransportError::Timeout)
        }
    }
}

#[derive(Default)]
pub(crate) struct RecordingSleeper {
    pub sleeps: Vec<Duration>,
}

impl Sleeper for RecordingSleeper {
    fn sleep(&mut self, duration: Duration) {
        self.sleeps.push(duration);
    }
}
