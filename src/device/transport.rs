use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{MqttOptions, TlsConfiguration, Transport};
use rustls::ClientConfig;
use thiserror::Error;

use crate::hub::API_VERSION;
use crate::util::certs::{read_pem_certs, read_pem_key, CertsError, TrustBundle};

/// Default MQTT-over-TLS port on gateways and event endpoints
pub const MQTTS_PORT: u16 = 8883;

const KEEP_ALIVE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Certs(#[from] CertsError),

    #[error("client certificate rejected: {0}")]
    ClientAuth(#[from] rustls::Error),
}

/// MQTT username the hub expects from a device connecting through a gateway
pub fn device_username(hub_host: &str, device_id: &str) -> String {
    format!("{hub_host}/{device_id}/?api-version={API_VERSION}")
}

/// TLS settings shared by the device link and the event stream: trust
/// anchors from the bundle, plus an optional client certificate chain for
/// the certificate-based auth modes.
pub fn tls_configuration(
    trust: &TrustBundle,
    client_auth: Option<(&Path, &Path)>,
) -> Result<TlsConfiguration, TransportError> {
    let roots = trust.root_store()?;
    let builder = ClientConfig::builder().with_root_certificates(roots);
    let config = match client_auth {
        Some((cert_path, key_path)) => {
            builder.with_client_auth_cert(read_pem_certs(cert_path)?, read_pem_key(key_path)?)?
        }
        None => builder.with_no_client_auth(),
    };
    Ok(TlsConfiguration::Rustls(Arc::new(config)))
}

/// Options for the device link through the edge gateway. With websockets the
/// broker address carries the full URL, otherwise it is host and TLS port.
pub fn gateway_mqtt_options(
    device_id: &str,
    edge_hostname: &str,
    use_websockets: bool,
    tls: TlsConfiguration,
    username: String,
    password: Option<String>,
) -> MqttOptions {
    let mut options = if use_websockets {
        let url = format!("wss://{edge_hostname}:443/$iothub/websocket");
        let mut options = MqttOptions::new(device_id, url, 443);
        options.set_transport(Transport::wss_with_config(tls));
        options
    } else {
        let mut options = MqttOptions::new(device_id, edge_hostname, MQTTS_PORT);
        options.set_transport(Transport::tls_with_config(tls));
        options
    };
    options.set_keep_alive(KEEP_ALIVE);
    options.set_credentials(username, password.unwrap_or_default());
    options
}

/// Options for the event-stream consumer connection
pub fn events_mqtt_options(
    client_id: &str,
    host: &str,
    port: u16,
    tls: TlsConfiguration,
    username: String,
    password: String,
) -> MqttOptions {
    let mut options = MqttOptions::new(client_id, host, port);
    options.set_transport(Transport::tls_with_config(tls));
    options.set_keep_alive(KEEP_ALIVE);
    options.set_credentials(username, password);
    options
}
