use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::ops::Deref;

use crate::util::crypto::{random_key, KEY_LEN};

/// Correlation identifier stamped into the telemetry body so the event
/// stream verifier can match the exact message this run sent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(String);

impl Deref for MessageId {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<MessageId> for String {
    fn from(value: MessageId) -> Self {
        value.0
    }
}

/// Base64-encoded shared access key for a device identity
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceKey(String);

impl Deref for DeviceKey {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Default for DeviceKey {
    fn default() -> Self {
        Self(random_key(KEY_LEN))
    }
}

impl Display for DeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for DeviceKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<DeviceKey> for String {
    fn from(value: DeviceKey) -> Self {
        value.0
    }
}
