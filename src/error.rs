use thiserror::Error;

pub type Result<T> = std::result::Result<T, SmaError>;

/// Errors produced by the SMA protocol engine.
///
/// The numeric codes behind [`SmaError::exit_code`] are part of the contract
/// with the host program and with scripts that wrap the binary; they must not
/// be renumbered.
#[derive(Debug, Error)]
pub enum SmaError {
    #[error("receive buffer empty")]
    NoData,

    #[error("invalid argument: {0}")]
    BadArg(String),

    #[error("frame checksum mismatch")]
    ChecksumMismatch,

    #[error("communication buffer overflow")]
    BufferOverflow,

    #[error("no archived data for the requested window")]
    ArchiveNoData,

    #[error("link initialisation failed: {0}")]
    Init(String),

    #[error("invalid password")]
    InvalidPassword,

    #[error("retry the last action")]
    Retry,

    #[error("end of data reached")]
    EndOfData,

    #[error("privilege not held (installer login required)")]
    Privilege,

    #[error("communication error: {0}")]
    Comm(String),

    #[error("incompatible inverter firmware (protocol version {0})")]
    FwVersion(u8),

    #[error("requested LRI not available on this device")]
    LriNotAvailable,

    #[error("device reported error code {0:#06x}")]
    Device(u16),

    #[error("bad frame magic")]
    BadMagic,

    #[error("frame too short: need {needed} bytes, have {len}")]
    ShortFrame { needed: usize, len: usize },

    #[error("invalid byte stuffing in frame")]
    StuffingError,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SmaError {
    /// Numeric status returned to the host program.
    pub fn exit_code(&self) -> i32 {
        match self {
            SmaError::NoData => -1,
            SmaError::BadArg(_) => -2,
            SmaError::ChecksumMismatch => -3,
            SmaError::BufferOverflow => -4,
            SmaError::ArchiveNoData => -5,
            SmaError::Init(_) => -6,
            SmaError::InvalidPassword => -7,
            SmaError::Retry => -8,
            SmaError::EndOfData => -9,
            SmaError::Privilege => -10,
            SmaError::FwVersion(_) => -13,
            SmaError::LriNotAvailable => 21,
            SmaError::Comm(_)
            | SmaError::Device(_)
            | SmaError::BadMagic
            | SmaError::ShortFrame { .. }
            | SmaError::StuffingError
            | SmaError::Io(_) => -12,
        }
    }

    /// Map the status word of an SMAdata2 reply (offset 23) to an error.
    ///
    /// Returns `None` for status 0 (success).
    pub fn from_device_status(status: u16) -> Option<SmaError> {
        match status {
            0 => None,
            0x0100 => Some(SmaError::InvalidPassword),
            21 => Some(SmaError::LriNotAvailable),
            other => Some(SmaError::Device(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(SmaError::NoData.exit_code(), -1);
        assert_eq!(SmaError::ChecksumMismatch.exit_code(), -3);
        assert_eq!(SmaError::BufferOverflow.exit_code(), -4);
        assert_eq!(SmaError::ArchiveNoData.exit_code(), -5);
        assert_eq!(SmaError::InvalidPassword.exit_code(), -7);
        assert_eq!(SmaError::EndOfData.exit_code(), -9);
        assert_eq!(SmaError::FwVersion(3).exit_code(), -13);
        assert_eq!(SmaError::LriNotAvailable.exit_code(), 21);
    }

    #[test]
    fn device_status_mapping() {
        assert!(SmaError::from_device_status(0).is_none());
        assert!(matches!(
            SmaError::from_device_status(0x0100),
            Some(SmaError::InvalidPassword)
        ));
        assert!(matches!(
            SmaError::from_device_status(21),
            Some(SmaError::LriNotAvailable)
        ));
        assert!(matches!(
            SmaError::from_device_status(0x0102),
            Some(SmaError::Device(0x0102))
        ));
    }
}
