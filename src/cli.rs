use clap::Parser;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;

fn parse_duration(s: &str) -> Result<Duration, ParseIntError> {
    let millis: u64 = s.parse()?;
    Ok(Duration::from_millis(millis))
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)] // read from Cargo.toml
pub struct Cli {
    /// Owner-level hub connection string
    #[arg(
        env = "LEAFCHECK_HUB_CONNECTION_STRING",
        long = "hub-connection-string",
        value_name = "str"
    )]
    pub hub_connection_string: String,

    /// Event-stream endpoint with entity path
    #[arg(
        env = "LEAFCHECK_EVENTS_ENDPOINT",
        long = "events-endpoint",
        value_name = "str"
    )]
    pub events_endpoint: String,

    /// Identifier of the leaf device to register and exercise
    #[arg(env = "LEAFCHECK_DEVICE_ID", long = "device-id", value_name = "id")]
    pub device_id: String,

    /// Hostname of the edge gateway the device connects through
    #[arg(
        env = "LEAFCHECK_EDGE_HOSTNAME",
        long = "edge-hostname",
        value_name = "host"
    )]
    pub edge_hostname: String,

    /// Trusted CA certificate for the gateway chain, PEM
    #[arg(
        env = "LEAFCHECK_TRUSTED_CA_CERT",
        long = "trusted-ca-cert",
        value_name = "path"
    )]
    pub trusted_ca_cert: Option<PathBuf>,

    /// Connect the device over TLS websockets instead of raw TLS
    #[arg(env = "LEAFCHECK_USE_WEBSOCKETS", long = "use-websockets")]
    pub use_websockets: bool,

    /// Client certificate for certificate-based auth, PEM
    #[arg(
        env = "LEAFCHECK_CLIENT_CERT",
        long = "client-cert",
        value_name = "path",
        requires = "client_key"
    )]
    pub client_cert: Option<PathBuf>,

    /// Private key matching the client certificate, PEM
    #[arg(
        env = "LEAFCHECK_CLIENT_KEY",
        long = "client-key",
        value_name = "path",
        requires = "client_cert"
    )]
    pub client_key: Option<PathBuf>,

    /// Thumbprint certificates for self-signed auth, exactly two
    #[arg(
        long = "thumbprint-cert",
        value_name = "path",
        requires = "client_cert"
    )]
    pub thumbprint_certs: Vec<PathBuf>,

    /// Receive window for event-stream verification in milliseconds
    #[arg(
        env = "LEAFCHECK_RECEIVE_TIMEOUT_MS",
        long = "receive-timeout-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "180000"
    )]
    pub receive_timeout: Duration,

    /// Remote method invocation timeout in milliseconds
    #[arg(
        env = "LEAFCHECK_METHOD_TIMEOUT_MS",
        long = "method-timeout-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "300000"
    )]
    pub method_timeout: Duration,
}

pub fn parse() -> Cli {
    Parser::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Vec<&'static str> {
        vec![
            "leafcheck",
            "--hub-connection-string",
            "HostName=hub;SharedAccessKeyName=owner;SharedAccessKey=a2V5",
            "--events-endpoint",
            "Endpoint=mqtts://events;SharedAccessKeyName=listen;SharedAccessKey=a2V5;EntityPath=telemetry",
            "--device-id",
            "leaf-1",
            "--edge-hostname",
            "edge.local",
        ]
    }

    #[test]
    fn parses_minimal_invocation_with_defaults() {
        let cli = Cli::try_parse_from(base_args()).unwrap();
        assert!(!cli.use_websockets);
        assert_eq!(cli.receive_timeout, Duration::from_secs(180));
        assert_eq!(cli.method_timeout, Duration::from_secs(300));
    }

    #[test]
    fn client_cert_requires_key() {
        let mut args = base_args();
        args.extend(["--client-cert", "/certs/device.pem"]);
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn thumbprint_certs_require_client_cert() {
        let mut args = base_args();
        args.extend(["--thumbprint-cert", "/certs/primary.pem"]);
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn collects_repeated_thumbprint_certs() {
        let mut args = base_args();
        args.extend([
            "--client-cert",
            "/certs/device.pem",
            "--client-key",
            "/certs/device.key.pem",
            "--thumbprint-cert",
            "/certs/primary.pem",
            "--thumbprint-cert",
            "/certs/secondary.pem",
        ]);
        let cli = Cli::try_parse_from(args).unwrap();
        assert_eq!(cli.thumbprint_certs.len(), 2);
    }
}
