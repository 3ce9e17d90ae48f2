/*
The simulated leaf device: TLS transport settings for the link through the
edge gateway and the MQTT client that sends telemetry and answers remote
method calls.
*/

mod client;
mod transport;

pub use client::{DeviceClient, DeviceError, MethodInvocation};
pub use transport::{
    device_username, events_mqtt_options, gateway_mqtt_options, tls_configuration, TransportError,
};
