/*
Everything related to the cloud hub backend: connection string handling,
shared-access-signature tokens, the device registry REST surface and
service-side direct method invocation.
*/

mod connection;
mod method;
mod registry;
mod sas;

pub use connection::{ConnectionStringError, EventsEndpoint, HubConnectionString};
pub use method::{MethodClient, MethodError, MethodResult};
pub use registry::{
    AuthenticationMechanism, AuthenticationType, Device, DeviceCapabilities, RegistryClient,
    RegistryError, SymmetricKey, X509Thumbprint,
};
pub use sas::{SasError, SasToken};

/// REST api-version sent with every registry and method request
pub const API_VERSION: &str = "2021-04-12";
