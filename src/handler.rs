use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::adapter::{resolve_call_adapter, CallAdapter, CallAdapterFactory};
use crate::binder::MethodDeclaration;
use crate::bridge::lock;
use crate::call::{Call, CallContext};
use crate::converter::{
    resolve_request_converter, resolve_response_converter, ConverterFactory, RequestConverter,
    ResponseConverter, TypeDescriptor,
};
use crate::errors::Error;
use crate::model::{parse_uuid, RequestFactory};

fn method_error(interface: &str, method: &str, message: &str) -> Error {
    Error::configuration(&format!("{message}\n    for method {interface}.{method}"))
}

/// The resolved request recipe, converters and call adapter of one declared method
pub struct MethodHandler<B, T, R> {
    factory: Arc<RequestFactory>,
    encoder: Option<Arc<dyn RequestConverter<B>>>,
    decoder: Arc<dyn ResponseConverter<T>>,
    adapter: Arc<dyn CallAdapter<T, R>>,
    context: CallContext,
}

impl<B, T, R> MethodHandler<B, T, R> where B: 'static, T: Send + 'static, R: 'static {
    fn build(interface: &str, declaration: &MethodDeclaration, dispatcher: &Dispatcher) -> Result<Self, Error> {
        let method = declaration.name();
        let annotation = match declaration.annotations() {
            [] => return Err(method_error(interface, method,
                "Operation attribute is required (e.g. #[read], #[write], etc.).")),
            [annotation] => annotation,
            [first, second, ..] => return Err(method_error(interface, method, &format!(
                "Only one operation attribute is allowed. Found: {} and {}.", first.kind(), second.kind()))),
        };
        if annotation.service().trim().is_empty() {
            return Err(method_error(interface, method,
                &format!("\"{}\" must have a service value defined.", annotation.kind())));
        }
        if annotation.characteristic().trim().is_empty() {
            return Err(method_error(interface, method,
                &format!("\"{}\" must have a characteristic value defined.", annotation.kind())));
        }
        let service = parse_uuid(annotation.service())
            .map_err(|error| method_error(interface, method, error.message()))?;
        let characteristic = parse_uuid(annotation.characteristic())
            .map_err(|error| method_error(interface, method, error.message()))?;
        let factory = RequestFactory::new(service, characteristic, annotation.kind());

        let body_type = TypeDescriptor::of::<B>();
        let encoder = if factory.has_body() {
            let encoder = resolve_request_converter::<B>(&dispatcher.converters).map_err(|error| method_error(
                interface, method, &format!("Unable to create converter for {body_type}\n{}", error.message())))?;
            Some(encoder)
        } else if !body_type.is::<()>() {
            return Err(method_error(interface, method,
                &format!("\"{}\" operations cannot take a body.", annotation.kind())));
        } else {
            None
        };
        let decoder = resolve_response_converter::<T>(&dispatcher.converters).map_err(|error| method_error(
            interface, method, &format!("Unable to create converter for {}\n{}", TypeDescriptor::of::<T>(), error.message())))?;
        let adapter = resolve_call_adapter::<T, R>(&dispatcher.adapters).map_err(|error| method_error(
            interface, method, &format!("Unable to create call adapter for {}\n{}", TypeDescriptor::of::<R>(), error.message())))?;
        debug!("Bound {interface}.{method} to {} {characteristic}", annotation.kind());

        Ok(Self {
            factory: Arc::new(factory),
            encoder,
            decoder,
            adapter,
            context: dispatcher.context.clone(),
        })
    }

    /// The recipe the handler creates requests from
    pub fn request_factory(&self) -> &RequestFactory {
        &self.factory
    }

    /// Create a fresh call for `body` and reshape it into the declared return type.
    /// Encoding failures are reported when the call runs.
    pub fn invoke(&self, body: B) -> R {
        let body = match &self.encoder {
            Some(encoder) => encoder.convert(&body).map(Some).map_err(Error::from),
            None => Ok(None),
        };
        let call = Call::new(self.factory.clone(), body, self.decoder.clone(), self.context.clone());
        self.adapter.adapt(call)
    }
}

type MethodKey = (&'static str, &'static str);

/// Handlers keyed by interface and method name, built once per client
#[derive(Default)]
pub(crate) struct DispatchCache {
    handlers: Mutex<HashMap<MethodKey, Arc<dyn Any + Send + Sync>>>,
}

impl DispatchCache {
    pub(crate) fn get_or_try_insert<H, F>(&self, key: MethodKey, create: F) -> Result<Arc<H>, Error>
            where H: Send + Sync + 'static, F: FnOnce() -> Result<H, Error> {
        let cached = lock(&self.handlers).get(&key).cloned();
        let handler = match cached {
            Some(handler) => handler,
            None => {
                // Resolution runs outside the lock, the first insert wins a race
                let created: Arc<dyn Any + Send + Sync> = Arc::new(create()?);
                lock(&self.handlers).entry(key).or_insert(created).clone()
            }
        };
        handler.downcast::<H>().map_err(|_| Error::configuration(&format!(
            "{}.{} is already bound with different types", key.0, key.1)))
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.handlers).len()
    }
}

/// What a client binds interfaces with
pub(crate) struct Dispatcher {
    pub(crate) converters: Vec<Arc<dyn ConverterFactory>>,
    pub(crate) adapters: Vec<Arc<dyn CallAdapterFactory>>,
    pub(crate) context: CallContext,
    pub(crate) cache: DispatchCache,
}

impl Dispatcher {
    pub(crate) fn handler<B, T, R>(&self, interface: &'static str, declaration: &MethodDeclaration)
            -> Result<Arc<MethodHandler<B, T, R>>, Error>
            where B: 'static, T: Send + 'static, R: 'static {
        self.cache.get_or_try_insert((interface, declaration.name()),
            || MethodHandler::build(interface, declaration, self))
    }
}
