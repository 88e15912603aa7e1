//! Declarative, call-based client for GATT services
//!
//! Describe the characteristics you need as an interface, let a [`GattClient`] bind it and get
//! back [`Call`]s which drive the connection, run the characteristic operation and convert
//! the payload into your own types.
//!
//! This library is designed to enable you to bring your own bluetooth handler by implementing the
//! `gatt_call::GattDevice` trait. Or you can use the implementations in the
//! `gatt_call::providers` module.
//!
//! Example
//! ```rust,ignore
//! use gatt_call::{gatt_interface, Call, GattClient, ResponseFuture};
//! use gatt_call::providers::btleplug_provider::BtleplugDevice;
//!
//! gatt_interface! {
//!     pub trait HeartRateService {
//!         #[read(service = "180d", characteristic = "2a38")]
//!         fn body_sensor_location() -> Call<String>;
//!         #[notify(service = "180d", characteristic = "2a37")]
//!         fn heart_rate_measurement() -> ResponseFuture<Vec<u8>>;
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = GattClient::<BtleplugDevice>::builder()
//!         .device_by_name("heart-rate-sensor")
//!         .await
//!         .unwrap()
//!         .build()
//!         .unwrap();
//!     client.connect().await.unwrap();
//!     let service = client.create::<HeartRateService>().unwrap();
//!     let location = service.body_sensor_location().execute().await.unwrap();
//!     println!("Sensor location: {:?}", location.body());
//!     let measurement = service.heart_rate_measurement().await.unwrap();
//!     println!("Heart rate measurement: {:?}", measurement.body());
//!     client.close().await.unwrap();
//! }
//! ```

#![warn(missing_docs)]
#![deny(missing_docs)]

mod device;
mod errors;
mod executor;
mod handler;

/// Reshaping calls into declared return types
pub mod adapter;
/// Declared interfaces and the `gatt_interface!` macro
pub mod binder;
/// Single-result rendezvous between hardware events and waiting calls
pub mod bridge;
/// Calls, responses and callbacks
pub mod call;
/// Client tunables
pub mod config;
/// Payload converters
pub mod converter;
/// Connection state machine and event routing
pub mod events;
/// Identifiers, operation kinds and requests
pub mod model;
/// Contains implementations of the [`GattDevice`](crate::GattDevice) trait for different bluetooth handlers
pub mod providers;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{info, warn};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

pub use crate::adapter::{CallAdapter, CallAdapterFactory, ErasedCallAdapter};
pub use crate::binder::{
    DeclarationKind, GattInterface, InterfaceBinding, InterfaceDescriptor, MethodDeclaration,
    OperationAnnotation,
};
pub use crate::call::{Call, Callback, CancelHandle, PendingOperation, Response, ResponseFuture};
pub use crate::config::ClientConfig;
pub use crate::converter::{
    BuiltInConverterFactory, ConverterFactory, ErasedRequestConverter, ErasedResponseConverter,
    RawResult, RequestBody, RequestConverter, ResponseConverter, TypeDescriptor, TypedConverterFactory,
};
/// Abstraction for a GATT session with a BLE device
pub use crate::device::{GattDevice, GattEvent, GattStatus, LinkState};
pub use crate::errors::{ConvertError, Error, ErrorKind};
pub use crate::events::{ConnectionState, EventMultiplexer, EventSink};
pub use crate::handler::MethodHandler;
pub use crate::model::{parse_uuid, OperationKind, OperationRequest, RequestFactory, RequestTag};

use crate::adapter::DefaultCallAdapterFactory;
use crate::bridge::lock;
use crate::call::CallContext;
use crate::executor::OperationExecutor;
use crate::handler::{DispatchCache, Dispatcher};

/// Owns the session with one device and creates bound interfaces for it
pub struct GattClient<D> {
    device: Arc<D>,
    events: Arc<EventMultiplexer<D>>,
    dispatcher: Dispatcher,
    runtime: Handle,
    config: ClientConfig,
    session: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl<D> GattClient<D> where D: GattDevice + Send + Sync + 'static {
    /// Start configuring a client
    pub fn builder() -> GattClientBuilder<D> {
        GattClientBuilder {
            device: None,
            runtime: None,
            callback_runtime: None,
            converters: vec![],
            adapters: vec![],
            config: ClientConfig::default(),
        }
    }

    /// Start connecting to the device. Calls executed meanwhile wait until services are discovered.
    pub async fn connect(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::NotConnected, "client has been closed"));
        }
        let (sink, receiver) = EventSink::channel();
        let previous = lock(&self.session).replace(self.runtime.spawn(self.events.clone().run(receiver)));
        if let Some(previous) = previous {
            previous.abort();
        }
        self.events.set_state(ConnectionState::Connecting);
        info!("Connecting");
        if let Err(error) = self.device.connect(sink).await {
            self.events.set_state(ConnectionState::Disconnected);
            return Err(error);
        }
        Ok(())
    }

    /// Start disconnecting. Waiting calls fail once the device reports the link down.
    pub async fn disconnect(&self) -> Result<(), Error> {
        info!("Disconnecting");
        self.device.disconnect().await
    }

    /// Disconnect and release the device. Closing a closed client does nothing.
    pub async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Closing");
        let disconnected = self.device.disconnect().await;
        if let Err(error) = &disconnected {
            warn!("Unable to disconnect while closing: {error}");
        }
        // The handle is released even when the link could not be torn down
        let closed = self.device.close().await;
        let result = disconnected.and(closed);
        self.events.shutdown();
        if let Some(session) = lock(&self.session).take() {
            session.abort();
        }
        result
    }

    /// The current connection state
    pub fn state(&self) -> ConnectionState {
        self.events.state()
    }

    /// Bind a declared interface. Unresolvable converters or adapters fail here, not when calls run.
    pub fn create<I: GattInterface>(&self) -> Result<I, Error> {
        binder::bind::<I>(&self.dispatcher)
    }

    /// Number of methods bound so far
    pub fn cached_methods(&self) -> usize {
        self.dispatcher.cache.len()
    }

    /// Names of the converter factories in the order they are probed
    pub fn converter_factories(&self) -> Vec<&str> {
        self.dispatcher.converters.iter().map(|factory| factory.name()).collect()
    }

    /// Names of the call adapter factories in the order they are probed
    pub fn call_adapter_factories(&self) -> Vec<&str> {
        self.dispatcher.adapters.iter()
            .map(|factory| factory.name())
            .chain(std::iter::once(DefaultCallAdapterFactory::NAME))
            .collect()
    }

    /// The tunables the client was built with
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The device the client talks to
    pub fn device(&self) -> &D {
        &self.device
    }
}

/// Builder for [`GattClient`]
pub struct GattClientBuilder<D> {
    device: Option<D>,
    runtime: Option<Handle>,
    callback_runtime: Option<Handle>,
    converters: Vec<Arc<dyn ConverterFactory>>,
    adapters: Vec<Arc<dyn CallAdapterFactory>>,
    config: ClientConfig,
}

impl<D> GattClientBuilder<D> where D: GattDevice + Send + Sync + 'static {
    /// Use `device` for the session
    pub fn device(mut self, device: D) -> Self {
        self.device = Some(device);
        self
    }

    /// Look the device up by name
    pub async fn device_by_name(mut self, name: &str) -> Result<Self, Error> {
        self.device = Some(D::find_by_name(name).await?);
        Ok(self)
    }

    /// Runtime the session and enqueued calls run on. Defaults to the current runtime.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Runtime callbacks are delivered on. Defaults to the session runtime.
    pub fn callback_runtime(mut self, runtime: Handle) -> Self {
        self.callback_runtime = Some(runtime);
        self
    }

    /// Probed in registration order, before the built-in converters
    pub fn add_converter_factory<F: ConverterFactory + 'static>(mut self, factory: F) -> Self {
        self.converters.push(Arc::new(factory));
        self
    }

    /// Probed in registration order, before the default adapters
    pub fn add_call_adapter_factory<F: CallAdapterFactory + 'static>(mut self, factory: F) -> Self {
        self.adapters.push(Arc::new(factory));
        self
    }

    /// How long a call waits for its completion event
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.config.operation_timeout = timeout;
        self
    }

    /// How long a call waits for service discovery
    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.config.discovery_timeout = timeout;
        self
    }

    /// Replace all tunables at once
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the client. Fails without a device or outside a tokio runtime.
    pub fn build(self) -> Result<GattClient<D>, Error> {
        let device = Arc::new(self.device.ok_or_else(|| Error::configuration("device required"))?);
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| Error::configuration("context required"))?,
        };
        let callbacks = self.callback_runtime.unwrap_or_else(|| runtime.clone());
        let mut converters = self.converters;
        converters.push(Arc::new(BuiltInConverterFactory));

        let events = Arc::new(EventMultiplexer::new(device.clone()));
        let executor = OperationExecutor::new(device.clone(), events.clone(), self.config);
        let context = CallContext {executor: Arc::new(executor), runtime: runtime.clone(), callbacks};
        Ok(GattClient {
            device,
            events,
            dispatcher: Dispatcher {
                converters,
                adapters: self.adapters,
                context,
                cache: DispatchCache::default(),
            },
            runtime,
            config: self.config,
            session: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }
}
