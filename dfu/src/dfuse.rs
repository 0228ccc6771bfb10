//! STMicroelectronics DfuSe extension (AN3156)
//!
//! Vendor commands travel as `DFU_DNLOAD` payloads on block 0. Data
//! blocks use block number 2 and up: the device reads or writes at
//! `address + (block - 2) * transfer_size`.

use log::{debug, error, info, warn};

use crate::{
    clock::Sleeper,
    error::{DfuError, Result},
    memory::{DfuMemSegment, EraseStep, MemoryInfo},
    session::{DfuSession, effective_transfer_size},
    state::DfuState,
    transport::Transport,
};

pub const DFUSE_CMD_GET_COMMANDS: u8 = 0x00;
pub const DFUSE_CMD_SET_ADDRESS: u8 = 0x21;
pub const DFUSE_CMD_ERASE_SECTOR: u8 = 0x41;

const DFUSE_COMMAND_BLOCK: u16 = 0;
pub const DFUSE_DATA_BLOCK: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuseCommand {
    GetCommands,
    SetAddress(u32),
    EraseSector(u32),
}

impl DfuseCommand {
    pub fn code(&self) -> u8 {
        match self {
            DfuseCommand::GetCommands => DFUSE_CMD_GET_COMMANDS,
            DfuseCommand::SetAddress(_) => DFUSE_CMD_SET_ADDRESS,
            DfuseCommand::EraseSector(_) => DFUSE_CMD_ERASE_SECTOR,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DfuseCommand::GetCommands => "GET_COMMANDS",
            DfuseCommand::SetAddress(_) => "SET_ADDRESS",
            DfuseCommand::EraseSector(_) => "ERASE_SECTOR",
        }
    }

    /// Command byte followed by the parameter: one byte for
    /// `GET_COMMANDS`, a little-endian address otherwise.
    pub fn payload(&self) -> Vec<u8> {
        let mut payload = vec![self.code()];
        match self {
            DfuseCommand::GetCommands => payload.push(0x00),
            DfuseCommand::SetAddress(addr) | DfuseCommand::EraseSector(addr) => {
                payload.extend_from_slice(&addr.to_le_bytes())
            }
        }
        payload
    }
}

impl<T: Transport, S: Sleeper> DfuSession<T, S> {
    fn dfuse_memory(&self) -> Result<&MemoryInfo> {
        self.memory_info().ok_or(DfuError::NoMemoryMap)
    }

    /// Send a DfuSe command and wait until the device is no longer busy.
    pub fn dfuse_command(&mut self, command: DfuseCommand) -> Result<()> {
        if let Err(err) = self.download_block(DFUSE_COMMAND_BLOCK, &command.payload()) {
            error!("Error during special DfuSe command {}: {err}", command.name());
            return Err(err);
        }

        let status = self.poll_until(|state| state != DfuState::DfuDnBusy)?;
        if !status.is_ok() {
            return Err(DfuError::CommandFailed(command.name()));
        }
        Ok(())
    }

    pub fn get_segment(&self, addr: u32) -> Result<Option<&DfuMemSegment>> {
        Ok(self.dfuse_memory()?.segment(addr))
    }

    pub fn get_sector_start(
        &self,
        addr: u32,
        segment: Option<&DfuMemSegment>,
    ) -> Result<u32> {
        self.dfuse_memory()?.sector_start(addr, segment)
    }

    pub fn get_sector_end(
        &self,
        addr: u32,
        segment: Option<&DfuMemSegment>,
    ) -> Result<u32> {
        self.dfuse_memory()?.sector_end(addr, segment)
    }

    pub fn get_first_writable_segment(&self) -> Result<Option<&DfuMemSegment>> {
        Ok(self.dfuse_memory()?.first_writable_segment())
    }

    pub fn get_max_read_size(&self, start_addr: u32) -> Result<u32> {
        Ok(self.dfuse_memory()?.max_read_size(start_addr))
    }

    /// Erase every erasable sector overlapping
    /// `[start_addr, start_addr + length)`.
    pub fn erase(&mut self, start_addr: u32, length: u32) -> Result<()> {
        let plan = self.dfuse_memory()?.erase_plan(start_addr, length)?;
        let bytes_to_erase: usize = plan.iter().map(|step| step.size() as usize).sum();
        let mut bytes_erased = 0;
        if bytes_to_erase > 0 {
            self.report_progress(bytes_erased, Some(bytes_to_erase));
        }

        for step in plan {
            match step {
                EraseStep::Skip { addr, size } => {
                    debug!("Skipping {size}B of non-erasable memory at {addr:#x}");
                }
                EraseStep::Erase { addr, size } => {
                    debug!("Erasing {size}B at {addr:#x}");
                    self.dfuse_command(DfuseCommand::EraseSector(addr))?;
                }
            }
            bytes_erased += step.size() as usize;
            self.report_progress(bytes_erased, Some(bytes_to_erase));
        }
        Ok(())
    }

    fn dfuse_start_address(&self, log_outside: fn(u32)) -> Result<u32> {
        let memory = self.dfuse_memory()?;
        Ok(match self.start_address {
            None => {
                let addr = memory.segments.first().start_addr();
                warn!("Using inferred start address {addr:#010x}");
                addr
            }
            Some(addr) => {
                if memory.segment(addr).is_none() {
                    log_outside(addr);
                }
                addr
            }
        })
    }

    /// Erase (unless `skip_erase`), then write `data` at the session's
    /// start address.
    ///
    /// With `manifestation_tolerant` the address pointer is reset to the
    /// start and an empty block asks the device to leave DFU mode.
    pub fn dfuse_download(
        &mut self,
        xfer_size: u16,
        data: &[u8],
        manifestation_tolerant: bool,
        skip_erase: bool,
    ) -> Result<()> {
        let start_address = self.dfuse_start_address(|addr| {
            error!("Start address {addr:#010x} outside of memory map bounds")
        })?;
        let expected_size = data.len();
        let length = u32::try_from(expected_size).map_err(|_| {
            DfuError::Format(format!(
                "{expected_size} bytes do not fit the address space"
            ))
        })?;

        if !skip_erase {
            info!("Erasing DFU device memory");
            self.erase(start_address, length)?;
        }

        info!("Copying data to DFU device");
        let mut address = start_address;
        let mut bytes_sent = 0;
        self.report_progress(bytes_sent, Some(expected_size));

        for chunk in data.chunks(effective_transfer_size(xfer_size) as usize) {
            self.dfuse_command(DfuseCommand::SetAddress(address))?;
            debug!("Set address to {address:#x}");

            let bytes_written = self.download_block(DFUSE_DATA_BLOCK, chunk)?;
            debug!("Sent {bytes_written} bytes");
            let status = self.poll_until_idle(DfuState::DfuDnloadIdle)?;
            address = address.wrapping_add(chunk.len() as u32);
            status.ok("DOWNLOAD")?;

            bytes_sent += bytes_written;
            self.report_progress(bytes_sent, Some(expected_size));
        }
        info!("Wrote {bytes_sent} bytes");

        if manifestation_tolerant {
            info!("Manifesting new firmware");
            self.dfuse_command(DfuseCommand::SetAddress(start_address))?;
            self.download_block(DFUSE_DATA_BLOCK, &[])?;

            match self.poll_until(|state| state == DfuState::DfuManifest) {
                Ok(status) if status.state != DfuState::DfuManifest => {
                    error!(
                        "DfuSe manifestation ended in state={}, status={}",
                        status.state, status.status
                    );
                }
                Ok(_) => {}
                Err(err) => error!("{err}"),
            }
        }
        Ok(())
    }

    /// Read up to `max_size` bytes from the session's start address.
    ///
    /// `None` reads as far as the memory map allows, see
    /// [`MemoryInfo::max_read_size`].
    pub fn dfuse_upload(&mut self, xfer_size: u16, max_size: Option<usize>) -> Result<Vec<u8>> {
        let start_address = self.dfuse_start_address(|addr| {
            warn!("Start address {addr:#010x} outside of memory map bounds")
        })?;
        let max_size = match max_size {
            Some(max_size) => max_size,
            None => self.dfuse_memory()?.max_read_size(start_address) as usize,
        };

        info!("Reading up to {max_size:#x} bytes starting at {start_address:#010x}");
        if self.get_state()? != DfuState::DfuIdle {
            self.abort_to_idle()?;
        }
        self.dfuse_command(DfuseCommand::SetAddress(start_address))?;
        self.abort_to_idle()?;

        self.upload_from(xfer_size, Some(max_size), DFUSE_DATA_BLOCK)
    }
}
