use std::array::TryFromSliceError;
use std::string::FromUtf8Error;

use crate::device::GattStatus;

/// General categories of failures reported by calls and by the client.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid builder field, malformed identifier or unresolved converter/adapter
    Configuration,
    /// No session has been connected yet
    NotConnected,
    /// The device does not expose the requested service
    ServiceNotFound,
    /// The service does not expose the requested characteristic
    CharacteristicNotFound,
    /// The hardware refused to start an operation
    TriggerRejected,
    /// The hardware reported a non-success status
    Protocol(GattStatus),
    /// The hardware reported success without a value
    InconsistentState,
    /// No hardware event arrived in time
    Timeout,
    /// The call was canceled
    Canceled,
    /// The call instance has already been executed or enqueued
    AlreadyExecuted,
    /// The session was lost while an operation was waiting
    Disconnected,
    /// A converter failed to encode or decode a payload
    Conversion,
    /// Error raised by the bluetooth handler
    Device,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        match self {
            Self::Configuration => f.write_str("configuration error"),
            Self::NotConnected => f.write_str("device not connected"),
            Self::ServiceNotFound => f.write_str("service not found"),
            Self::CharacteristicNotFound => f.write_str("characteristic not found"),
            Self::TriggerRejected => f.write_str("operation rejected by hardware"),
            Self::Protocol(status) => write!(f, "protocol error: {status}"),
            Self::InconsistentState => f.write_str("inconsistent hardware state"),
            Self::Timeout => f.write_str("timed out"),
            Self::Canceled => f.write_str("canceled"),
            Self::AlreadyExecuted => f.write_str("already executed"),
            Self::Disconnected => f.write_str("disconnected"),
            Self::Conversion => f.write_str("conversion error"),
            Self::Device => f.write_str("device error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Error returned by calls, bindings and the client
pub struct Error {
    kind: ErrorKind,
    message: String,
}
impl Error {
    /// An error of `kind` described by `message`
    pub fn new(kind: ErrorKind, message: &str) -> Self {
        Self {kind, message: message.into()}
    }

    pub(crate) fn configuration(message: &str) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub(crate) fn canceled() -> Self {
        Self::new(ErrorKind::Canceled, "Canceled")
    }

    /// The category of the error
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Description of what went wrong
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Cancellation is reported through the error channel but is not a failure of the device
    pub fn is_canceled(&self) -> bool {
        self.kind == ErrorKind::Canceled
    }

    /// Timeouts are the only failures worth retrying as-is
    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }
}
impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}
impl std::error::Error for Error {}
impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self {kind, message: String::new()}
    }
}
impl From<ConvertError> for Error {
    fn from(error: ConvertError) -> Self {
        Self::new(ErrorKind::Conversion, &format!("Unable to convert payload: {error}"))
    }
}

/// Failure raised by a converter while encoding or decoding a payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertError {
    message: String,
}
impl ConvertError {
    /// A converter failure described by `message`
    pub fn new(message: &str) -> Self {
        ConvertError {message: message.into()}
    }
}
impl std::fmt::Display for ConvertError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "{}", self.message)
    }
}
impl std::error::Error for ConvertError {}
impl From<TryFromSliceError> for ConvertError {
    fn from(error: TryFromSliceError) -> Self {
        Self {message: format!("Unable to convert passed bytes: {error}")}
    }
}
impl From<FromUtf8Error> for ConvertError {
    fn from(error: FromUtf8Error) -> Self {
        Self {message: format!("Unable to convert bytes into string: {error}")}
    }
}
impl From<hex::FromHexError> for ConvertError {
    fn from(error: hex::FromHexError) -> Self {
        Self {message: format!("Unable to convert hex string into bytes: {error}")}
    }
}
