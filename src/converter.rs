//! Pluggable conversion between raw characteristic payloads and application types.
//!
//! Converter factories are probed in registration order when a method is bound; the first
//! factory returning a converter for the requested type wins. The [`BuiltInConverterFactory`]
//! is always probed last.

use std::any::{Any, TypeId};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::errors::{ConvertError, Error};

/// Runtime description of a Rust type, used to probe factories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeDescriptor {
    id: TypeId,
    name: &'static str,
}

impl TypeDescriptor {
    /// Describe `T`
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Whether this describes `T`
    pub fn is<T: 'static>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }

    /// The type name
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl std::fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        f.write_str(self.name)
    }
}

/// The characteristic value produced by a completed operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawResult(Vec<u8>);

impl RawResult {
    /// Wrap the bytes of a characteristic value
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// The payload bytes
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    /// Take the payload bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Number of payload bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Encoded payload of a write, tagged with its content type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestBody {
    content_type: String,
    bytes: Vec<u8>,
}

impl RequestBody {
    /// A payload of `content_type`
    pub fn new(content_type: &str, bytes: Vec<u8>) -> Self {
        Self {content_type: content_type.into(), bytes}
    }

    /// The content type the payload was encoded as
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// The encoded bytes
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Decode a raw result into `T`
pub trait ResponseConverter<T>: Send + Sync {
    /// Decode `raw`
    fn convert(&self, raw: RawResult) -> Result<T, ConvertError>;
}

impl<T, F> ResponseConverter<T> for F where F: Fn(RawResult) -> Result<T, ConvertError> + Send + Sync {
    fn convert(&self, raw: RawResult) -> Result<T, ConvertError> {
        self(raw)
    }
}

/// Encode a `T` into a write payload
pub trait RequestConverter<T>: Send + Sync {
    /// Encode `value`
    fn convert(&self, value: &T) -> Result<RequestBody, ConvertError>;
}

impl<T, F> RequestConverter<T> for F where F: Fn(&T) -> Result<RequestBody, ConvertError> + Send + Sync {
    fn convert(&self, value: &T) -> Result<RequestBody, ConvertError> {
        self(value)
    }
}

/// A [`ResponseConverter`] for some type, as returned by a factory
pub struct ErasedResponseConverter {
    ty: TypeDescriptor,
    inner: Box<dyn Any + Send + Sync>,
}

impl ErasedResponseConverter {
    /// Wrap a converter producing `T`
    pub fn new<T: 'static>(converter: Arc<dyn ResponseConverter<T>>) -> Self {
        Self {ty: TypeDescriptor::of::<T>(), inner: Box::new(converter)}
    }

    /// The type the converter produces
    pub fn target(&self) -> TypeDescriptor {
        self.ty
    }

    pub(crate) fn downcast<T: 'static>(self) -> Option<Arc<dyn ResponseConverter<T>>> {
        self.inner.downcast::<Arc<dyn ResponseConverter<T>>>().ok().map(|converter| *converter)
    }
}

/// A [`RequestConverter`] for some type, as returned by a factory
pub struct ErasedRequestConverter {
    ty: TypeDescriptor,
    inner: Box<dyn Any + Send + Sync>,
}

impl ErasedRequestConverter {
    /// Wrap a converter consuming `T`
    pub fn new<T: 'static>(converter: Arc<dyn RequestConverter<T>>) -> Self {
        Self {ty: TypeDescriptor::of::<T>(), inner: Box::new(converter)}
    }

    /// The type the converter consumes
    pub fn source(&self) -> TypeDescriptor {
        self.ty
    }

    pub(crate) fn downcast<T: 'static>(self) -> Option<Arc<dyn RequestConverter<T>>> {
        self.inner.downcast::<Arc<dyn RequestConverter<T>>>().ok().map(|converter| *converter)
    }
}

/// Creates converters for the types it knows, returning `None` for the rest
pub trait ConverterFactory: Send + Sync {
    /// Name used in resolution errors
    fn name(&self) -> &str;

    /// A decoder producing `ty`, if this factory knows the type
    fn response_converter(&self, _ty: &TypeDescriptor) -> Option<ErasedResponseConverter> {
        None
    }

    /// An encoder consuming `ty`, if this factory knows the type
    fn request_converter(&self, _ty: &TypeDescriptor) -> Option<ErasedRequestConverter> {
        None
    }
}

const OCTET_STREAM: &str = "application/octet-stream";
const HEX_STRING: &str = "text/x-hex";

/// Handles `Vec<u8>` and [`RawResult`] as passthrough, `String` as `0x`-prefixed upper case
/// hex and `()` by discarding the payload.
///
/// The `String` pair normalises rather than preserves text: encoding accepts an optional
/// `0x`/`0X` prefix and digits of either case, decoding always yields the canonical form.
/// `"ab"` is sent as `[0xAB]` and read back as `"0xAB"`.
#[derive(Debug, Default)]
pub struct BuiltInConverterFactory;

impl ConverterFactory for BuiltInConverterFactory {
    fn name(&self) -> &str {
        "BuiltInConverterFactory"
    }

    fn response_converter(&self, ty: &TypeDescriptor) -> Option<ErasedResponseConverter> {
        if ty.is::<Vec<u8>>() {
            let converter: Arc<dyn ResponseConverter<Vec<u8>>> = Arc::new(decode_bytes);
            return Some(ErasedResponseConverter::new(converter));
        }
        if ty.is::<RawResult>() {
            let converter: Arc<dyn ResponseConverter<RawResult>> = Arc::new(decode_raw);
            return Some(ErasedResponseConverter::new(converter));
        }
        if ty.is::<String>() {
            let converter: Arc<dyn ResponseConverter<String>> = Arc::new(decode_hex);
            return Some(ErasedResponseConverter::new(converter));
        }
        if ty.is::<()>() {
            let converter: Arc<dyn ResponseConverter<()>> = Arc::new(decode_void);
            return Some(ErasedResponseConverter::new(converter));
        }
        None
    }

    fn request_converter(&self, ty: &TypeDescriptor) -> Option<ErasedRequestConverter> {
        if ty.is::<Vec<u8>>() {
            let converter: Arc<dyn RequestConverter<Vec<u8>>> = Arc::new(encode_bytes);
            return Some(ErasedRequestConverter::new(converter));
        }
        if ty.is::<String>() {
            let converter: Arc<dyn RequestConverter<String>> = Arc::new(encode_hex);
            return Some(ErasedRequestConverter::new(converter));
        }
        if ty.is::<()>() {
            let converter: Arc<dyn RequestConverter<()>> = Arc::new(encode_void);
            return Some(ErasedRequestConverter::new(converter));
        }
        None
    }
}

fn decode_bytes(raw: RawResult) -> Result<Vec<u8>, ConvertError> {
    Ok(raw.into_bytes())
}

fn decode_raw(raw: RawResult) -> Result<RawResult, ConvertError> {
    Ok(raw)
}

fn decode_hex(raw: RawResult) -> Result<String, ConvertError> {
    Ok(bytes_to_hex(raw.bytes()))
}

fn decode_void(_raw: RawResult) -> Result<(), ConvertError> {
    Ok(())
}

fn encode_bytes(value: &Vec<u8>) -> Result<RequestBody, ConvertError> {
    Ok(RequestBody::new(OCTET_STREAM, value.clone()))
}

fn encode_hex(value: &String) -> Result<RequestBody, ConvertError> {
    Ok(RequestBody::new(HEX_STRING, hex_to_bytes(value)?))
}

fn encode_void(_value: &()) -> Result<RequestBody, ConvertError> {
    Ok(RequestBody::new(OCTET_STREAM, vec![]))
}

/// Render bytes the way the built-in `String` converter does, e.g. `0x01FF`
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode_upper(bytes))
}

/// Parse a hex string with or without a `0x`/`0X` prefix, digits of either case.
///
/// An odd number of digits or a non-hex character is an error.
pub fn hex_to_bytes(value: &str) -> Result<Vec<u8>, ConvertError> {
    let digits = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")).unwrap_or(value);
    Ok(hex::decode(digits)?)
}

/// Registers one converter pair for a single type `T`
pub struct TypedConverterFactory<T> {
    name: String,
    response: Option<Arc<dyn ResponseConverter<T>>>,
    request: Option<Arc<dyn RequestConverter<T>>>,
    _type: PhantomData<fn() -> T>,
}

impl<T: 'static> TypedConverterFactory<T> {
    /// A factory without converters, named `name` in resolution errors
    pub fn new(name: &str) -> Self {
        Self {name: name.into(), response: None, request: None, _type: PhantomData}
    }

    /// Decode responses into `T` with `converter`
    pub fn with_response<F>(mut self, converter: F) -> Self
            where F: Fn(RawResult) -> Result<T, ConvertError> + Send + Sync + 'static {
        self.response = Some(Arc::new(converter));
        self
    }

    /// Encode `T` bodies with `converter`
    pub fn with_request<F>(mut self, converter: F) -> Self
            where F: Fn(&T) -> Result<RequestBody, ConvertError> + Send + Sync + 'static {
        self.request = Some(Arc::new(converter));
        self
    }
}

impl<T: 'static> ConverterFactory for TypedConverterFactory<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn response_converter(&self, ty: &TypeDescriptor) -> Option<ErasedResponseConverter> {
        if !ty.is::<T>() {
            return None;
        }
        self.response.clone().map(ErasedResponseConverter::new)
    }

    fn request_converter(&self, ty: &TypeDescriptor) -> Option<ErasedRequestConverter> {
        if !ty.is::<T>() {
            return None;
        }
        self.request.clone().map(ErasedRequestConverter::new)
    }
}

fn tried(factories: &[Arc<dyn ConverterFactory>]) -> String {
    factories.iter().map(|factory| format!("\n * {}", factory.name())).collect()
}

pub(crate) fn resolve_response_converter<T: 'static>(factories: &[Arc<dyn ConverterFactory>])
        -> Result<Arc<dyn ResponseConverter<T>>, Error> {
    let ty = TypeDescriptor::of::<T>();
    for factory in factories {
        if let Some(converter) = factory.response_converter(&ty) {
            let target = converter.target();
            return converter.downcast::<T>().ok_or_else(|| Error::configuration(&format!(
                "{} returned a response converter for {target} when asked for {ty}", factory.name())));
        }
    }
    Err(Error::configuration(&format!("Could not locate response converter for {ty}. Tried:{}", tried(factories))))
}

pub(crate) fn resolve_request_converter<T: 'static>(factories: &[Arc<dyn ConverterFactory>])
        -> Result<Arc<dyn RequestConverter<T>>, Error> {
    let ty = TypeDescriptor::of::<T>();
    for factory in factories {
        if let Some(converter) = factory.request_converter(&ty) {
            let source = converter.source();
            return converter.downcast::<T>().ok_or_else(|| Error::configuration(&format!(
                "{} returned a request converter for {source} when asked for {ty}", factory.name())));
        }
    }
    Err(Error::configuration(&format!("Could not locate request converter for {ty}. Tried:{}", tried(factories))))
}
