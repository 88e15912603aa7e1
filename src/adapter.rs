//! Reshaping of a [`Call`] into the return type a method declares.

use std::any::Any;
use std::sync::Arc;

use crate::call::{Call, ResponseFuture};
use crate::converter::TypeDescriptor;
use crate::errors::Error;

/// Turns a `Call<T>` into the declared return value `R`
pub trait CallAdapter<T, R>: Send + Sync {
    /// Reshape `call`
    fn adapt(&self, call: Call<T>) -> R;
}

impl<T, R, F> CallAdapter<T, R> for F where F: Fn(Call<T>) -> R + Send + Sync {
    fn adapt(&self, call: Call<T>) -> R {
        self(call)
    }
}

/// A [`CallAdapter`] as returned by a factory
pub struct ErasedCallAdapter {
    response_type: TypeDescriptor,
    return_type: TypeDescriptor,
    inner: Box<dyn Any + Send + Sync>,
}

impl ErasedCallAdapter {
    /// Wrap an adapter from `Call<T>` to `R`
    pub fn new<T: 'static, R: 'static>(adapter: Arc<dyn CallAdapter<T, R>>) -> Self {
        Self {
            response_type: TypeDescriptor::of::<T>(),
            return_type: TypeDescriptor::of::<R>(),
            inner: Box::new(adapter),
        }
    }

    /// The response type the adapter consumes calls of
    pub fn response_type(&self) -> TypeDescriptor {
        self.response_type
    }

    /// The return type the adapter produces
    pub fn return_type(&self) -> TypeDescriptor {
        self.return_type
    }

    pub(crate) fn downcast<T: 'static, R: 'static>(self) -> Option<Arc<dyn CallAdapter<T, R>>> {
        self.inner.downcast::<Arc<dyn CallAdapter<T, R>>>().ok().map(|adapter| *adapter)
    }
}

/// Creates adapters for the return types it knows, returning `None` for the rest
pub trait CallAdapterFactory: Send + Sync {
    /// Name used in resolution errors
    fn name(&self) -> &str;

    /// An adapter from `Call<response_type>` to `return_type`
    fn get(&self, return_type: &TypeDescriptor, response_type: &TypeDescriptor) -> Option<ErasedCallAdapter>;
}

/// Always probed after the registered factories. Serves `Call<T>` as is and `ResponseFuture<T>`.
pub(crate) struct DefaultCallAdapterFactory;

impl DefaultCallAdapterFactory {
    pub(crate) const NAME: &'static str = "DefaultCallAdapterFactory";

    fn get<T: Send + 'static, R: 'static>(&self) -> Option<Arc<dyn CallAdapter<T, R>>> {
        let return_type = TypeDescriptor::of::<R>();
        let adapter = if return_type.is::<Call<T>>() {
            let adapter: Arc<dyn CallAdapter<T, Call<T>>> = Arc::new(identity::<T>);
            ErasedCallAdapter::new(adapter)
        } else if return_type.is::<ResponseFuture<T>>() {
            let adapter: Arc<dyn CallAdapter<T, ResponseFuture<T>>> = Arc::new(ResponseFuture::<T>::new);
            ErasedCallAdapter::new(adapter)
        } else {
            return None;
        };
        adapter.downcast::<T, R>()
    }
}

fn identity<T>(call: Call<T>) -> Call<T> {
    call
}

pub(crate) fn resolve_call_adapter<T: Send + 'static, R: 'static>(factories: &[Arc<dyn CallAdapterFactory>])
        -> Result<Arc<dyn CallAdapter<T, R>>, Error> {
    let return_type = TypeDescriptor::of::<R>();
    let response_type = TypeDescriptor::of::<T>();
    for factory in factories {
        if let Some(adapter) = factory.get(&return_type, &response_type) {
            let (adapted, produced) = (adapter.response_type(), adapter.return_type());
            return adapter.downcast::<T, R>().ok_or_else(|| Error::configuration(&format!(
                "{} returned an adapter from {adapted} to {produced} when asked for {response_type} to {return_type}",
                factory.name())));
        }
    }
    if let Some(adapter) = DefaultCallAdapterFactory.get::<T, R>() {
        return Ok(adapter);
    }
    let tried: String = factories.iter()
        .map(|factory| factory.name())
        .chain(std::iter::once(DefaultCallAdapterFactory::NAME))
        .map(|name| format!("\n * {name}"))
        .collect();
    Err(Error::configuration(&format!("Could not locate call adapter for {return_type}. Tried:{tried}")))
}
