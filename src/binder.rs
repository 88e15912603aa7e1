//! Declared interfaces and their binding to method handlers.
//!
//! An interface is a plain struct implementing [`GattInterface`], usually generated with
//! [`gatt_interface!`](crate::gatt_interface):
//!
//! ```rust,ignore
//! gatt_interface! {
//!     pub trait HeartRateService {
//!         #[read(service = "180d", characteristic = "2a38")]
//!         fn body_sensor_location() -> Call<String>;
//!         #[notify(service = "180d", characteristic = "2a37")]
//!         fn heart_rate_measurement() -> ResponseFuture<Vec<u8>>;
//!         #[write(service = "180d", characteristic = "2a39")]
//!         fn reset_energy_expended(value: Vec<u8>) -> Call<()>;
//!     }
//! }
//! ```

use std::sync::Arc;

use crate::errors::Error;
use crate::handler::{Dispatcher, MethodHandler};
use crate::model::OperationKind;

/// Whether a declaration is a flat capability interface or something else
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclarationKind {
    /// A flat set of declared operations
    Interface,
    /// Anything else, e.g. a struct with behavior of its own
    Concrete,
}

/// The operation attribute of a declared method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationAnnotation {
    kind: OperationKind,
    service: &'static str,
    characteristic: &'static str,
}

impl OperationAnnotation {
    /// Describe an operation on the identified characteristic
    pub const fn new(kind: OperationKind, service: &'static str, characteristic: &'static str) -> Self {
        Self {kind, service, characteristic}
    }

    /// The declared operation kind
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// The declared service identifier
    pub fn service(&self) -> &'static str {
        self.service
    }

    /// The declared characteristic identifier
    pub fn characteristic(&self) -> &'static str {
        self.characteristic
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A method of a declared interface with its operation attributes
pub struct MethodDeclaration {
    name: &'static str,
    annotations: Vec<OperationAnnotation>,
}

impl MethodDeclaration {
    /// A method without attributes
    pub fn new(name: &'static str) -> Self {
        Self {name, annotations: vec![]}
    }

    /// Add an operation attribute
    pub fn annotated(mut self, annotation: OperationAnnotation) -> Self {
        self.annotations.push(annotation);
        self
    }

    /// The method name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The operation attributes in declaration order
    pub fn annotations(&self) -> &[OperationAnnotation] {
        &self.annotations
    }
}

/// Everything known about a declared interface before it is bound
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    name: &'static str,
    kind: DeclarationKind,
    extends: Vec<&'static str>,
    methods: Vec<MethodDeclaration>,
}

impl InterfaceDescriptor {
    /// A flat interface declaration
    pub fn interface(name: &'static str) -> Self {
        Self {name, kind: DeclarationKind::Interface, extends: vec![], methods: vec![]}
    }

    /// A declaration that is not an interface, e.g. a struct
    pub fn concrete(name: &'static str) -> Self {
        Self {kind: DeclarationKind::Concrete, ..Self::interface(name)}
    }

    /// Record a parent interface
    pub fn extending(mut self, parent: &'static str) -> Self {
        self.extends.push(parent);
        self
    }

    /// Add a declared method
    pub fn method(mut self, method: MethodDeclaration) -> Self {
        self.methods.push(method);
        self
    }

    /// The interface name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// What kind of declaration this is
    pub fn kind(&self) -> DeclarationKind {
        self.kind
    }

    /// The declared methods
    pub fn methods(&self) -> &[MethodDeclaration] {
        &self.methods
    }

    /// Look a method up by name
    pub fn find(&self, method: &str) -> Option<&MethodDeclaration> {
        self.methods.iter().find(|declaration| declaration.name == method)
    }

    /// Only flat interfaces can be bound
    pub fn validate(&self) -> Result<(), Error> {
        if self.kind != DeclarationKind::Interface {
            return Err(Error::configuration("Only interface definitions are supported."));
        }
        if !self.extends.is_empty() {
            return Err(Error::configuration("Interface definitions must not extend other interfaces."));
        }
        Ok(())
    }
}

/// A declared interface that can be created by a [`GattClient`](crate::GattClient)
pub trait GattInterface: Sized {
    /// The declaration the interface is validated and bound against
    fn descriptor() -> InterfaceDescriptor;

    /// Build the interface from its method handlers
    fn bind(binding: &InterfaceBinding<'_>) -> Result<Self, Error>;
}

/// Hands out the method handlers of the interface being bound
pub struct InterfaceBinding<'a> {
    descriptor: &'a InterfaceDescriptor,
    dispatcher: &'a Dispatcher,
}

impl InterfaceBinding<'_> {
    /// The handler of a declared method, resolved on first use and cached afterwards
    pub fn method<B, T, R>(&self, name: &'static str) -> Result<Arc<MethodHandler<B, T, R>>, Error>
            where B: 'static, T: Send + 'static, R: 'static {
        let declaration = self.descriptor.find(name).ok_or_else(|| Error::configuration(&format!(
            "Method is not declared.\n    for method {}.{name}", self.descriptor.name())))?;
        self.dispatcher.handler(self.descriptor.name(), declaration)
    }
}

pub(crate) fn bind<I: GattInterface>(dispatcher: &Dispatcher) -> Result<I, Error> {
    let descriptor = I::descriptor();
    descriptor.validate()?;
    I::bind(&InterfaceBinding {descriptor: &descriptor, dispatcher})
}

/// Declare a GATT interface.
///
/// Generates a struct with one method per declared operation plus its [`GattInterface`]
/// implementation. Each method carries exactly one of `#[read]`, `#[write]`, `#[notify]` or
/// `#[indicate]` with the service and characteristic identifiers, takes an optional body
/// argument and returns `Shape<Response>`, e.g. `Call<String>` or `ResponseFuture<Vec<u8>>`.
///
/// `Shape` has to be a single identifier taking the response type as its only parameter.
/// Shapes served by a registered [`CallAdapterFactory`](crate::CallAdapterFactory) are declared
/// through a generic alias:
///
/// ```rust,ignore
/// type BodyFuture<T> = BoxFuture<'static, Result<T, gatt_call::Error>>;
///
/// gatt_interface! {
///     pub trait BodySensor {
///         #[read(service = "180d", characteristic = "2a38")]
///         fn body_sensor_location() -> BodyFuture<String>;
///     }
/// }
/// ```
///
/// Other signatures can implement [`GattInterface`] by hand and bind their handlers through
/// [`InterfaceBinding::method`].
#[macro_export]
macro_rules! gatt_interface {
    (@kind read) => { $crate::OperationKind::Read };
    (@kind write) => { $crate::OperationKind::Write };
    (@kind notify) => { $crate::OperationKind::Notify };
    (@kind indicate) => { $crate::OperationKind::Indicate };
    (@body) => { () };
    (@body $body:ty) => { $body };
    (@arg) => { () };
    (@arg $arg:ident) => { $arg };
    (
        $(#[$meta:meta])*
        $vis:vis trait $name:ident {
            $(
                #[$kind:ident(service = $service:literal, characteristic = $characteristic:literal)]
                fn $method:ident($($arg:ident: $body:ty)?) -> $shape:ident<$response:ty>;
            )*
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            $(
                $method: ::std::sync::Arc<$crate::MethodHandler<
                    $crate::gatt_interface!(@body $($body)?), $response, $shape<$response>>>,
            )*
        }

        impl $name {
            $(
                #[doc = concat!("Create a call for the `", stringify!($kind), "` operation on characteristic `",
                    $characteristic, "` of service `", $service, "`")]
                pub fn $method(&self $(, $arg: $body)?) -> $shape<$response> {
                    self.$method.invoke($crate::gatt_interface!(@arg $($arg)?))
                }
            )*
        }

        impl $crate::GattInterface for $name {
            fn descriptor() -> $crate::InterfaceDescriptor {
                $crate::InterfaceDescriptor::interface(stringify!($name))
                    $(
                        .method($crate::MethodDeclaration::new(stringify!($method)).annotated(
                            $crate::OperationAnnotation::new(
                                $crate::gatt_interface!(@kind $kind), $service, $characteristic)))
                    )*
            }

            fn bind(binding: &$crate::InterfaceBinding<'_>) -> ::std::result::Result<Self, $crate::Error> {
                ::std::result::Result::Ok(Self {
                    $( $method: binding.method(stringify!($method))?, )*
                })
            }
        }
    };
}
