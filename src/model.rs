use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use uuid::Uuid;

use crate::converter::RequestBody;
use crate::errors::Error;

// 16-bit assigned numbers expand into 0000xxxx-0000-1000-8000-00805f9b34fb
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Parse a canonical 128-bit identifier or a 16-bit short form such as `180d`
pub fn parse_uuid(value: &str) -> Result<Uuid, Error> {
    let value = value.trim();
    if value.len() == 4 {
        // from_str_radix alone would accept a sign
        if !value.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::configuration(&format!("\"{value}\" is not a valid 16-bit identifier")));
        }
        let short = u16::from_str_radix(value, 16)
            .map_err(|_| Error::configuration(&format!("\"{value}\" is not a valid 16-bit identifier")))?;
        return Ok(Uuid::from_u128(BASE_UUID | (u128::from(short) << 96)));
    }
    Uuid::parse_str(value)
        .map_err(|error| Error::configuration(&format!("\"{value}\" is not a valid identifier: {error}")))
}

/// The declared intent of a bound method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Read the characteristic value
    Read,
    /// Write a value to the characteristic
    Write,
    /// Wait for the next notification
    Notify,
    /// Wait for the next indication
    Indicate,
}

impl OperationKind {
    /// Whether a request of this kind carries a body
    pub fn has_body(self) -> bool {
        self == Self::Write
    }

    /// Whether notifications have to be enabled on the characteristic
    pub fn requires_notification(self) -> bool {
        matches!(self, Self::Notify | Self::Indicate)
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        let name = match self {
            Self::Read => "READ",
            Self::Write => "WRITE",
            Self::Notify => "NOTIFY",
            Self::Indicate => "INDICATE",
        };
        f.write_str(name)
    }
}

/// Correlates a request with its log lines and cancellation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestTag {
    /// Identity assigned when no tag is given
    Id(u64),
    /// Caller supplied tag
    Named(String),
}

impl RequestTag {
    fn next() -> Self {
        static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);
        Self::Id(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for RequestTag {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        match self {
            Self::Id(id) => write!(f, "#{id}"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

/// One characteristic operation, created fresh for every execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRequest {
    service: Uuid,
    characteristic: Uuid,
    kind: OperationKind,
    body: Option<RequestBody>,
    timeout: Option<Duration>,
    tag: RequestTag,
}

impl OperationRequest {
    /// Start building a request
    pub fn builder() -> OperationRequestBuilder {
        OperationRequestBuilder::default()
    }

    /// The service identifier
    pub fn service(&self) -> Uuid {
        self.service
    }

    /// The characteristic identifier
    pub fn characteristic(&self) -> Uuid {
        self.characteristic
    }

    /// The operation kind
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// The encoded write payload
    pub fn body(&self) -> Option<&RequestBody> {
        self.body.as_ref()
    }

    /// Per-request timeout overriding the client's operation timeout
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// The tag correlating the request with its log lines
    pub fn tag(&self) -> &RequestTag {
        &self.tag
    }
}

impl std::fmt::Display for OperationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "{} {} on service {} ({})", self.kind, self.characteristic, self.service, self.tag)
    }
}

/// Builder validating that service, characteristic and kind are present
#[derive(Debug, Default)]
pub struct OperationRequestBuilder {
    service: Option<Uuid>,
    characteristic: Option<Uuid>,
    kind: Option<OperationKind>,
    body: Option<RequestBody>,
    timeout: Option<Duration>,
    tag: Option<RequestTag>,
}

impl OperationRequestBuilder {
    /// Target service
    pub fn service(mut self, service: Uuid) -> Self {
        self.service = Some(service);
        self
    }

    /// Target characteristic
    pub fn characteristic(mut self, characteristic: Uuid) -> Self {
        self.characteristic = Some(characteristic);
        self
    }

    /// Operation kind
    pub fn kind(mut self, kind: OperationKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Encoded write payload
    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = Some(body);
        self
    }

    /// Timeout overriding the client's operation timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Name the request in log lines
    pub fn tag(mut self, tag: &str) -> Self {
        self.tag = Some(RequestTag::Named(tag.into()));
        self
    }

    /// Build the request. Fails if service, characteristic or kind is missing.
    pub fn build(self) -> Result<OperationRequest, Error> {
        Ok(OperationRequest {
            service: self.service.ok_or_else(|| Error::configuration("service == None"))?,
            characteristic: self.characteristic.ok_or_else(|| Error::configuration("characteristic == None"))?,
            kind: self.kind.ok_or_else(|| Error::configuration("operation kind == None"))?,
            body: self.body,
            timeout: self.timeout,
            tag: self.tag.unwrap_or_else(RequestTag::next),
        })
    }
}

/// Immutable recipe for the requests of one declared method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFactory {
    service: Uuid,
    characteristic: Uuid,
    kind: OperationKind,
    has_body: bool,
}

impl RequestFactory {
    /// A recipe for `kind` operations on the characteristic. Only writes carry a body.
    pub fn new(service: Uuid, characteristic: Uuid, kind: OperationKind) -> Self {
        Self {
            service,
            characteristic,
            kind,
            has_body: kind.has_body(),
        }
    }

    /// The service identifier
    pub fn service(&self) -> Uuid {
        self.service
    }

    /// The characteristic identifier
    pub fn characteristic(&self) -> Uuid {
        self.characteristic
    }

    /// The operation kind
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Whether requests carry a body
    pub fn has_body(&self) -> bool {
        self.has_body
    }

    /// Produce a new, independent request
    pub fn create(&self, body: Option<RequestBody>, timeout: Option<Duration>) -> Result<OperationRequest, Error> {
        let mut builder = OperationRequest::builder()
            .service(self.service)
            .characteristic(self.characteristic)
            .kind(self.kind);
        if self.has_body {
            builder = builder.body(body.unwrap_or_default());
        }
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        builder.build()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn parse_short_uuid() {
        let uuid = parse_uuid("180d").expect("Unable to parse short uuid");
        assert_eq!(uuid, uuid::uuid!("0000180d-0000-1000-8000-00805f9b34fb"));
        let uuid = parse_uuid("2A38").expect("Unable to parse upper case short uuid");
        assert_eq!(uuid, uuid::uuid!("00002a38-0000-1000-8000-00805f9b34fb"));
    }

    #[test]
    fn parse_canonical_uuid() {
        let uuid = parse_uuid("6e400001-b5a3-f393-e0a9-e50e24dcca9e").expect("Unable to parse uuid");
        assert_eq!(uuid, uuid::uuid!("6e400001-b5a3-f393-e0a9-e50e24dcca9e"));
    }

    #[test]
    fn parse_malformed_uuid() {
        for value in ["", "18g0", "+180", "-180", "180", "not-a-uuid", "0000180d-0000-1000-8000"] {
            let result = parse_uuid(value);
            assert!(result.is_err(), "{value} should not parse");
            assert_eq!(result.unwrap_err().kind(), ErrorKind::Configuration);
        }
    }

    #[test]
    fn builder_requires_all_fields() {
        let result = OperationRequest::builder()
            .characteristic(Uuid::nil())
            .kind(OperationKind::Read)
            .build();
        assert!(result.unwrap_err().to_string().contains("service == None"));
        let result = OperationRequest::builder()
            .service(Uuid::nil())
            .kind(OperationKind::Read)
            .build();
        assert!(result.unwrap_err().to_string().contains("characteristic == None"));
        let result = OperationRequest::builder()
            .service(Uuid::nil())
            .characteristic(Uuid::nil())
            .build();
        assert!(result.unwrap_err().to_string().contains("operation kind == None"));
    }

    #[test]
    fn factory_creates_independent_requests() {
        let service = parse_uuid("180d").expect("Unable to parse service");
        let characteristic = parse_uuid("2a38").expect("Unable to parse characteristic");
        for kind in [OperationKind::Read, OperationKind::Write, OperationKind::Notify, OperationKind::Indicate] {
            let factory = RequestFactory::new(service, characteristic, kind);
            let first = factory.create(None, None).expect("Unable to create request");
            let second = factory.create(None, None).expect("Unable to create request");
            assert_eq!(first.service(), second.service());
            assert_eq!(first.characteristic(), second.characteristic());
            assert_eq!(first.kind(), second.kind());
            assert_eq!(first.body(), second.body());
            assert_ne!(first.tag(), second.tag());
        }
    }

    #[test]
    fn only_writes_carry_a_body() {
        let factory = RequestFactory::new(Uuid::nil(), Uuid::nil(), OperationKind::Read);
        let body = RequestBody::new("application/octet-stream", vec![1]);
        let request = factory.create(Some(body.clone()), None).expect("Unable to create request");
        assert_eq!(request.body(), None);

        let factory = RequestFactory::new(Uuid::nil(), Uuid::nil(), OperationKind::Write);
        assert!(factory.has_body());
        assert!(!factory.kind().requires_notification());
        assert!(OperationKind::Indicate.requires_notification());
        let request = factory.create(Some(body.clone()), Some(Duration::from_millis(10)))
            .expect("Unable to create request");
        assert_eq!(request.body(), Some(&body));
        assert_eq!(request.timeout(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn named_tag() {
        let request = OperationRequest::builder()
            .service(Uuid::nil())
            .characteristic(Uuid::nil())
            .kind(OperationKind::Notify)
            .tag("heart-rate")
            .build()
            .expect("Unable to build request");
        assert_eq!(request.tag().to_string(), "heart-rate");
        assert!(request.to_string().starts_with("NOTIFY"));
    }
}
