use crate::state::DfuState;

pub type Result<T, E = DfuError> = std::result::Result<T, E>;

/// Failure reported by a [`Transport`](crate::Transport) implementation.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("endpoint stalled")]
    Stall,
    #[error("device disconnected")]
    Disconnected,
    #[error("timed out")]
    Timeout,
    #[error("device is not open")]
    NotOpen,
    #[error("{0}")]
    Other(String),
}

/// Broad classification of a [`DfuError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The USB layer failed (device gone, timeout, stall).
    Transport,
    /// The device answered but reported a DFU level failure.
    Protocol,
    /// Descriptor bytes or a memory map string could not be parsed.
    Format,
    /// An address is not covered by the memory map, or there is no map.
    MemoryMap,
}

#[derive(thiserror::Error, Debug)]
pub enum DfuError {
    #[error("USB error: {0}")]
    Transport(#[from] TransportError),
    #[error("DFU request {request:#04x} stalled")]
    Stalled { request: u8 },
    #[error("DFU {operation} failed: state={state}, status={status}")]
    Status {
        operation: &'static str,
        state: DfuState,
        status: u8,
    },
    #[error("DfuSe command {0} failed")]
    CommandFailed(&'static str),
    #[error("Failed to return to idle state: state {0}")]
    NotIdle(DfuState),
    #[error("Unknown DFU state {0}")]
    UnknownState(u8),
    #[error("Short response to request {request:#04x}: {len} bytes")]
    ShortResponse { request: u8, len: usize },
    #[error("Invalid format: {0}")]
    Format(String),
    #[error("Address {0:#010x} outside of memory map")]
    OutsideMemoryMap(u32),
    #[error("No memory map available")]
    NoMemoryMap,
}

impl DfuError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DfuError::Transport(_) => ErrorKind::Transport,
            DfuError::Stalled { .. }
            | DfuError::Status { .. }
            | DfuError::CommandFailed(_)
            | DfuError::NotIdle(_)
            | DfuError::UnknownState(_)
            | DfuError::ShortResponse { .. } => ErrorKind::Protocol,
            DfuError::Format(_) => ErrorKind::Format,
            DfuError::OutsideMemoryMap(_) | DfuError::NoMemoryMap => {
                ErrorKind::MemoryMap
            }
        }
    }

    /// True when the device went away underneath the request.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, DfuError::Transport(TransportError::Disconnected))
    }
}

impl From<nusb::Error> for TransportError {
    fn from(err: nusb::Error) -> Self {
        match err.kind() {
            nusb::ErrorKind::Disconnected | nusb::ErrorKind::NotFound => {
                TransportError::Disconnected
            }
            _ => TransportError::Other(err.to_string()),
        }
    }
}

impl From<nusb::transfer::TransferError> for TransportError {
    fn from(err: nusb::transfer::TransferError) -> Self {
        use nusb::transfer::TransferError;
        match err {
            TransferError::Stall => TransportError::Stall,
            TransferError::Disconnected => TransportError::Disconnected,
            TransferError::Cancelled => TransportError::Timeout,
            err => TransportError::Other(err.to_string()),
        }
    }
}

impl From<nusb::Error> for DfuError {
    fn from(err: nusb::Error) -> Self {
        DfuError::Transport(err.into())
    }
}
