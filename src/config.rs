use std::time::Duration;

/// How long an operation waits for its hardware event unless the call overrides it
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(4);
/// How long an operation waits for service discovery to finish
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(4);

/// Tunables of a [`GattClient`](crate::GattClient)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    /// How long a call waits for its completion event
    pub operation_timeout: Duration,
    /// How long a call waits for service discovery
    pub discovery_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
        }
    }
}
