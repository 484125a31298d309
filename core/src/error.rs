use crate::calibration::CalibrationError;
use crate::interface::ConfigError;
use crate::prelude::ProcessorError;
use crate::protocol::ProtocolError;
use crate::record::RecordError;
use crate::session::SessionError;

/// Any failure surfaced by the crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    Processor(#[from] ProcessorError),
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Session(SessionError::Timeout(_)))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Session(SessionError::Cancelled))
    }

    /// Errors that spoil one frame but leave the stream usable.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_)
                | Error::Session(SessionError::Protocol(_))
                | Error::Processor(ProcessorError::InvalidInput(_))
                | Error::Processor(ProcessorError::ProcessorMismatch { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
