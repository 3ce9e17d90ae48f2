use std::collections::HashMap;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionStringError {
    #[error("connection string is missing the '{0}' field")]
    MissingField(&'static str),

    #[error("malformed connection string segment: '{0}'")]
    Malformed(String),

    #[error("unsupported events endpoint '{0}', expected mqtts://host[:port]")]
    UnsupportedEndpoint(String),
}

fn split_fields(src: &str) -> Result<HashMap<&str, &str>, ConnectionStringError> {
    src.split(';')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            segment
                .split_once('=')
                .ok_or_else(|| ConnectionStringError::Malformed(segment.to_owned()))
        })
        .collect()
}

fn required<'a>(
    fields: &HashMap<&str, &'a str>,
    name: &'static str,
) -> Result<&'a str, ConnectionStringError> {
    fields
        .get(name)
        .copied()
        .filter(|value| !value.is_empty())
        .ok_or(ConnectionStringError::MissingField(name))
}

/// Owner-level hub connection string:
/// `HostName=<host>;SharedAccessKeyName=<name>;SharedAccessKey=<base64>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConnectionString {
    pub host_name: String,
    pub shared_access_key_name: String,
    pub shared_access_key: String,
}

impl FromStr for HubConnectionString {
    type Err = ConnectionStringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields = split_fields(s)?;
        Ok(Self {
            host_name: required(&fields, "HostName")?.to_owned(),
            shared_access_key_name: required(&fields, "SharedAccessKeyName")?.to_owned(),
            shared_access_key: required(&fields, "SharedAccessKey")?.to_owned(),
        })
    }
}

/// Event-stream endpoint with entity path:
/// `Endpoint=mqtts://<host>[:port];SharedAccessKeyName=<name>;SharedAccessKey=<base64>;EntityPath=<topic-root>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventsEndpoint {
    pub host: String,
    pub port: u16,
    pub shared_access_key_name: String,
    pub shared_access_key: String,
    pub entity_path: String,
}

impl EventsEndpoint {
    /// Resource URI the endpoint SAS token is scoped to
    pub fn resource_uri(&self) -> String {
        format!("{}/{}", self.host, self.entity_path)
    }
}

impl FromStr for EventsEndpoint {
    type Err = ConnectionStringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields = split_fields(s)?;
        let endpoint = required(&fields, "Endpoint")?;

        let authority = endpoint
            .strip_prefix("mqtts://")
            .ok_or_else(|| ConnectionStringError::UnsupportedEndpoint(endpoint.to_owned()))?
            .trim_end_matches('/');
        let (host, port) = match authority.split_once(':') {
            Some((host, port)) => (
                host,
                port.parse().map_err(|_| {
                    ConnectionStringError::UnsupportedEndpoint(endpoint.to_owned())
                })?,
            ),
            None => (authority, 8883),
        };
        if host.is_empty() {
            return Err(ConnectionStringError::UnsupportedEndpoint(endpoint.to_owned()));
        }

        Ok(Self {
            host: host.to_owned(),
            port,
            shared_access_key_name: required(&fields, "SharedAccessKeyName")?.to_owned(),
            shared_access_key: required(&fields, "SharedAccessKey")?.to_owned(),
            entity_path: required(&fields, "EntityPath")?.to_owned(),
        })
    }
}
