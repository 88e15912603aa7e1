use uuid::Uuid;

use crate::errors::Error;
use crate::events::EventSink;

/// ATT status byte attached to every hardware event. `0x00` means success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GattStatus(u8);

impl GattStatus {
    /// The operation completed successfully.
    pub const SUCCESS: GattStatus = GattStatus(0x00);
    /// The attribute cannot be read.
    pub const READ_NOT_PERMITTED: GattStatus = GattStatus(0x02);
    /// The attribute cannot be written.
    pub const WRITE_NOT_PERMITTED: GattStatus = GattStatus(0x03);
    /// Generic failure reported by the platform stack.
    pub const FAILURE: GattStatus = GattStatus(0x85);

    /// Wrap a raw status byte
    pub const fn from_u8(value: u8) -> Self {
        GattStatus(value)
    }

    /// The raw status byte
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    /// Whether the status denotes success
    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }
}

impl std::fmt::Display for GattStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "{:#04x}", self.0)
    }
}

/// Link state reported together with a connection change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// The link is up
    Connected,
    /// The link is down
    Disconnected,
}

/// The finite set of asynchronous events a bluetooth handler delivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    /// The link changed state
    ConnectionStateChanged {
        /// Status of the change
        status: GattStatus,
        /// New link state
        state: LinkState,
    },
    /// Service discovery finished
    ServicesDiscovered {
        /// Status of the discovery
        status: GattStatus,
    },
    /// A characteristic read finished. `value` is `None` when the handler lost track of it.
    CharacteristicRead {
        /// Status of the read
        status: GattStatus,
        /// The characteristic that was read
        characteristic: Uuid,
        /// The value that was read
        value: Option<Vec<u8>>,
    },
    /// A characteristic write finished
    CharacteristicWrite {
        /// Status of the write
        status: GattStatus,
        /// The characteristic that was written
        characteristic: Uuid,
        /// The value now held by the characteristic
        value: Option<Vec<u8>>,
    },
    /// A notification or indication arrived
    CharacteristicChanged {
        /// The characteristic that changed
        characteristic: Uuid,
        /// The new value
        value: Vec<u8>,
    },
}

// The mock is only used in tests: triggers there push their completion events through the sink
// captured during `connect`.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
/// Abstraction for a GATT session with a single BLE device.
///
/// Trigger methods only start an operation. Its outcome is reported later as a [`GattEvent`]
/// through the [`EventSink`] handed over in [`connect`](GattDevice::connect), possibly from
/// another thread.
pub trait GattDevice {
    /// Instantiate a new device by looking it up by name
    async fn find_by_name(name: &str) -> Result<Self, Error> where Self: Sized;

    /// Start connecting. Connection changes are reported to `events` from now on.
    async fn connect(&self, events: EventSink) -> Result<(), Error>;
    /// Start disconnecting
    async fn disconnect(&self) -> Result<(), Error>;
    /// Release the underlying handle
    async fn close(&self) -> Result<(), Error>;
    /// Start service discovery. Fails when discovery cannot be initiated.
    async fn discover_services(&self) -> Result<(), Error>;
    /// Enable or disable notifications for a characteristic
    async fn set_notification(&self, service: Uuid, characteristic: Uuid, enable: bool) -> Result<(), Error>;
    /// Start reading a characteristic
    async fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<(), Error>;
    /// Start writing `value` to a characteristic
    async fn write_characteristic(&self, service: Uuid, characteristic: Uuid, value: &[u8]) -> Result<(), Error>;

    /// Whether discovery found the service
    fn has_service(&self, service: Uuid) -> bool;
    /// Whether discovery found the characteristic within the service
    fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_formatting() {
        assert!(GattStatus::SUCCESS.is_success());
        assert!(!GattStatus::FAILURE.is_success());
        assert_eq!(GattStatus::from_u8(0x85), GattStatus::FAILURE);
        assert_eq!(GattStatus::READ_NOT_PERMITTED.to_string(), "0x02");
        assert_eq!(GattStatus::WRITE_NOT_PERMITTED.as_u8(), 3);
    }
}
