use std::fmt::Display;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use thiserror::Error;

use crate::util::crypto::hmac_sha256_base64;

/// Lifetime of generated tokens, comfortably longer than a smoke run
pub const TOKEN_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum SasError {
    #[error("shared access key is not valid base64: {0}")]
    InvalidKey(#[from] base64::DecodeError),
}

/// Shared-access-signature token:
/// `SharedAccessSignature sr=<resource>&sig=<signature>&se=<expiry>[&skn=<key name>]`
///
/// The signature is HMAC-SHA256 over `"<url-encoded resource>\n<expiry>"`
/// keyed with the base64-decoded shared access key. Tokens carrying `skn`
/// authenticate against a named hub-level policy; device tokens omit it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SasToken(String);

impl SasToken {
    pub fn sign(
        resource_uri: &str,
        shared_access_key: &str,
        key_name: Option<&str>,
    ) -> Result<Self, SasError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the unix epoch");
        Self::sign_at(
            resource_uri,
            shared_access_key,
            key_name,
            now.as_secs() + TOKEN_TTL.as_secs(),
        )
    }

    fn sign_at(
        resource_uri: &str,
        shared_access_key: &str,
        key_name: Option<&str>,
        expiry: u64,
    ) -> Result<Self, SasError> {
        let key = STANDARD.decode(shared_access_key)?;
        let sr = utf8_percent_encode(resource_uri, NON_ALPHANUMERIC).to_string();
        let to_sign = format!("{sr}\n{expiry}");
        let signature = hmac_sha256_base64(&key, to_sign.as_bytes());
        let sig = utf8_percent_encode(&signature, NON_ALPHANUMERIC);

        let mut token = format!("SharedAccessSignature sr={sr}&sig={sig}&se={expiry}");
        if let Some(name) = key_name {
            token.push_str(&format!("&skn={name}"));
        }
        Ok(Self(token))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for SasToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
