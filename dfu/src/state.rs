use std::{fmt, time::Duration};

use crate::error::DfuError;

pub(crate) const DFU_STATUS_LEN: u16 = 6;

/// `bStatus` value reported when no error condition is present.
pub const STATUS_OK: u8 = 0x00;

/// DFU device states (DFU 1.1, section 6.1.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DfuState {
    AppIdle = 0,
    AppDetach = 1,
    DfuIdle = 2,
    DfuDnloadSync = 3,
    DfuDnBusy = 4,
    DfuDnloadIdle = 5,
    DfuManifestSync = 6,
    DfuManifest = 7,
    DfuManifestWaitReset = 8,
    DfuUploadIdle = 9,
    DfuError = 10,
}

impl DfuState {
    pub fn name(&self) -> &'static str {
        match self {
            DfuState::AppIdle => "appIDLE",
            DfuState::AppDetach => "appDETACH",
            DfuState::DfuIdle => "dfuIDLE",
            DfuState::DfuDnloadSync => "dfuDNLOAD-SYNC",
            DfuState::DfuDnBusy => "dfuDNBUSY",
            DfuState::DfuDnloadIdle => "dfuDNLOAD-IDLE",
            DfuState::DfuManifestSync => "dfuMANIFEST-SYNC",
            DfuState::DfuManifest => "dfuMANIFEST",
            DfuState::DfuManifestWaitReset => "dfuMANIFEST-WAIT-RESET",
            DfuState::DfuUploadIdle => "dfuUPLOAD-IDLE",
            DfuState::DfuError => "dfuERROR",
        }
    }
}

impl TryFrom<u8> for DfuState {
    type Error = DfuError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => DfuState::AppIdle,
            1 => DfuState::AppDetach,
            2 => DfuState::DfuIdle,
            3 => DfuState::DfuDnloadSync,
            4 => DfuState::DfuDnBusy,
            5 => DfuState::DfuDnloadIdle,
            6 => DfuState::DfuManifestSync,
            7 => DfuState::DfuManifest,
            8 => DfuState::DfuManifestWaitReset,
            9 => DfuState::DfuUploadIdle,
            10 => DfuState::DfuError,
            other => return Err(DfuError::UnknownState(other)),
        })
    }
}

impl From<DfuState> for u8 {
    fn from(state: DfuState) -> u8 {
        state as u8
    }
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), *self as u8)
    }
}

/// Snapshot returned by `DFU_GETSTATUS`
///
/// Never cached: every call to
/// [`DfuSession::get_status`](crate::DfuSession::get_status) queries the
/// device again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DfuStatus {
    pub status: u8,
    pub poll_timeout: u32,
    pub state: DfuState,
}

impl DfuStatus {
    /// Decode the 6 byte `DFU_GETSTATUS` payload. The last byte
    /// (`iString`) is ignored.
    pub fn from_raw(data: &[u8]) -> Result<Self, DfuError> {
        if data.len() < DFU_STATUS_LEN as usize {
            return Err(DfuError::ShortResponse {
                request: crate::session::DFU_GETSTATUS,
                len: data.len(),
            });
        }
        Ok(DfuStatus {
            status: data[0],
            poll_timeout: u32::from_le_bytes([data[1], data[2], data[3], 0]),
            state: DfuState::try_from(data[4])?,
        })
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }

    /// Delay the device asks for before the next `DFU_GETSTATUS`.
    pub fn poll_delay(&self) -> Duration {
        Duration::from_millis(self.poll_timeout as u64)
    }

    /// Map a non-OK status to [`DfuError::Status`].
    pub fn ok(&self, operation: &'static str) -> Result<(), DfuError> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(DfuError::Status {
                operation,
                state: self.state,
                status: self.status,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_decode() {
        let st = DfuStatus::from_raw(&[0x00, 0x64, 0x00, 0x00, 0x05, 0x00])
            .unwrap();
        assert_eq!(
            st,
            DfuStatus {
                status: STATUS_OK,
                poll_timeout: 100,
                state: DfuState::DfuDnloadIdle,
            }
        );
        assert_eq!(st.poll_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_status_poll_timeout_is_24_bit() {
        let st = DfuStatus::from_raw(&[0x00, 0x01, 0x02, 0x03, 0x02, 0xff])
            .unwrap();
        assert_eq!(st.poll_timeout, 0x030201);
        assert_eq!(st.state, DfuState::DfuIdle);
    }

    #[test]
    fn test_status_errors() {
        assert!(matches!(
            DfuStatus::from_raw(&[0, 0, 0]),
            Err(DfuError::ShortResponse { len: 3, .. })
        ));
        assert!(matches!(
            DfuStatus::from_raw(&[0, 0, 0, 0, 11, 0]),
            Err(DfuError::UnknownState(11))
        ));

        let st = DfuStatus::from_raw(&[0x0a, 0, 0, 0, 10, 0]).unwrap();
        assert!(matches!(
            st.ok("DOWNLOAD"),
            Err(DfuError::Status {
                state: DfuState::DfuError,
                status: 0x0a,
                ..
            })
        ));
    }
}
