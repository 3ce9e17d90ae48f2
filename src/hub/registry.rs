use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, field, warn};

use crate::hub::sas::SasError;
use crate::hub::{HubConnectionString, SasToken, API_VERSION};
use crate::types::DeviceKey;
use crate::util::certs::{CertsError, TrustBundle};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to build registry client: {0}")]
    Client(#[from] CertsError),

    #[error("token signing failed: {0}")]
    Token(#[from] SasError),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("registry returned error: ({0}) {1}")]
    Status(StatusCode, String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthenticationType {
    #[serde(rename = "sas")]
    Sas,
    #[serde(rename = "certificateAuthority")]
    CertificateAuthority,
    #[serde(rename = "selfSigned")]
    SelfSigned,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymmetricKey {
    pub primary_key: DeviceKey,
    pub secondary_key: DeviceKey,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct X509Thumbprint {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_thumbprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary_thumbprint: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationMechanism {
    #[serde(rename = "type")]
    pub auth_type: AuthenticationType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symmetric_key: Option<SymmetricKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x509_thumbprint: Option<X509Thumbprint>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCapabilities {
    pub iot_edge: bool,
}

/// Device identity as stored by the hub registry
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    pub authentication: AuthenticationMechanism,
    #[serde(default)]
    pub capabilities: DeviceCapabilities,
}

impl Device {
    /// New identity with a generated symmetric key pair. A leaf device is
    /// never an edge itself.
    pub fn with_sas_auth(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            generation_id: None,
            etag: None,
            authentication: AuthenticationMechanism {
                auth_type: AuthenticationType::Sas,
                symmetric_key: Some(SymmetricKey {
                    primary_key: DeviceKey::default(),
                    secondary_key: DeviceKey::default(),
                }),
                x509_thumbprint: None,
            },
            capabilities: DeviceCapabilities::default(),
        }
    }

    pub fn with_certificate_authority_auth(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            generation_id: None,
            etag: None,
            authentication: AuthenticationMechanism {
                auth_type: AuthenticationType::CertificateAuthority,
                symmetric_key: None,
                x509_thumbprint: None,
            },
            capabilities: DeviceCapabilities::default(),
        }
    }

    pub fn with_self_signed_auth(
        device_id: impl Into<String>,
        primary_thumbprint: String,
        secondary_thumbprint: String,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            generation_id: None,
            etag: None,
            authentication: AuthenticationMechanism {
                auth_type: AuthenticationType::SelfSigned,
                symmetric_key: None,
                x509_thumbprint: Some(X509Thumbprint {
                    primary_thumbprint: Some(primary_thumbprint),
                    secondary_thumbprint: Some(secondary_thumbprint),
                }),
            },
            capabilities: DeviceCapabilities::default(),
        }
    }

    pub fn primary_key(&self) -> Option<&DeviceKey> {
        self.authentication
            .symmetric_key
            .as_ref()
            .map(|keys| &keys.primary_key)
    }
}

/// REST client for the hub device registry
#[derive(Debug, Clone)]
pub struct RegistryClient {
    client: reqwest::Client,
    base: String,
    resource_uri: String,
    key_name: String,
    key: String,
}

impl RegistryClient {
    pub fn new(hub: &HubConnectionString, trust: &TrustBundle) -> Result<Self, RegistryError> {
        let client = trust.install_into(reqwest::Client::builder())?.build()?;
        Ok(Self::with_base(format!("https://{}", hub.host_name), hub, client))
    }

    pub(crate) fn with_base(base: String, hub: &HubConnectionString, client: reqwest::Client) -> Self {
        Self {
            client,
            base,
            resource_uri: hub.host_name.clone(),
            key_name: hub.shared_access_key_name.clone(),
            key: hub.shared_access_key.clone(),
        }
    }

    fn token(&self) -> Result<SasToken, RegistryError> {
        Ok(SasToken::sign(
            &self.resource_uri,
            &self.key,
            Some(&self.key_name),
        )?)
    }

    fn device_url(&self, device_id: &str) -> String {
        format!("{}/devices/{device_id}?api-version={API_VERSION}", self.base)
    }

    /// Look up a device identity, `None` when the registry has no entry
    pub async fn get_device(&self, device_id: &str) -> Result<Option<Device>, RegistryError> {
        let response = self
            .client
            .get(self.device_url(device_id))
            .header("Authorization", self.token()?.as_str())
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = error_for_status(response).await?;
        Ok(Some(response.json().await?))
    }

    pub async fn create_device(&self, device: &Device) -> Result<Device, RegistryError> {
        debug!(device = field::display(&device.device_id), "registering device");
        let response = self
            .client
            .put(self.device_url(&device.device_id))
            .header("Authorization", self.token()?.as_str())
            .json(device)
            .send()
            .await?;

        let response = error_for_status(response).await?;
        Ok(response.json().await?)
    }

    /// Replace an existing identity; the registry rejects stale etags
    pub async fn update_device(&self, device: &Device) -> Result<Device, RegistryError> {
        debug!(device = field::display(&device.device_id), "updating device");
        let etag = device.etag.clone().unwrap_or_else(|| "*".to_owned());
        let response = self
            .client
            .put(self.device_url(&device.device_id))
            .header("Authorization", self.token()?.as_str())
            .header("If-Match", etag)
            .json(device)
            .send()
            .await?;

        let response = error_for_status(response).await?;
        Ok(response.json().await?)
    }

    pub async fn remove_device(&self, device_id: &str) -> Result<(), RegistryError> {
        debug!(device = field::display(device_id), "removing device");
        let response = self
            .client
            .delete(self.device_url(device_id))
            .header("Authorization", self.token()?.as_str())
            .header("If-Match", "*")
            .send()
            .await?;

        error_for_status(response).await?;
        Ok(())
    }
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, RegistryError> {
    if !response.status().is_success() {
        warn!(
            response = field::display(response.status()),
            "received error response"
        );
        let err_code = response.status();
        let err_msg = response.text().await.unwrap_or_default();
        return Err(RegistryError::Status(err_code, err_msg));
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn test_hub() -> HubConnectionString {
        "HostName=hub.example.net;SharedAccessKeyName=owner;SharedAccessKey=bGVhZmNoZWNrLXRlc3Qta2V5"
            .parse()
            .unwrap()
    }

    fn test_client(base: String) -> RegistryClient {
        RegistryClient::with_base(base, &test_hub(), reqwest::Client::new())
    }

    #[test]
    fn device_models_serialize_in_registry_shape() {
        let device = Device::with_self_signed_auth(
            "leaf-1",
            "AA11".to_owned(),
            "BB22".to_owned(),
        );
        let value = serde_json::to_value(&device).unwrap();
        assert_eq!(value["deviceId"], "leaf-1");
        assert_eq!(value["authentication"]["type"], "selfSigned");
        assert_eq!(
            value["authentication"]["x509Thumbprint"]["primaryThumbprint"],
            "AA11"
        );
        assert_eq!(value["capabilities"]["iotEdge"], false);
        // unset fields stay off the wire
        assert!(value.get("etag").is_none());
        assert!(value["authentication"].get("symmetricKey").is_none());
    }

    #[tokio::test]
    async fn get_device_decodes_existing_identity() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/devices/leaf-1?api-version=2021-04-12")
            .match_header(
                "authorization",
                Matcher::Regex("^SharedAccessSignature sr=.*&skn=owner$".to_owned()),
            )
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "deviceId": "leaf-1",
                    "generationId": "gen-1",
                    "etag": "AAAA",
                    "authentication": {
                        "type": "sas",
                        "symmetricKey": {"primaryKey": "cGs=", "secondaryKey": "c2s="}
                    },
                    "capabilities": {"iotEdge": false}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = test_client(server.url());
        let device = client.get_device("leaf-1").await.unwrap().unwrap();

        assert_eq!(device.device_id, "leaf-1");
        assert_eq!(device.etag.as_deref(), Some("AAAA"));
        assert_eq!(device.primary_key().map(|k| k.to_string()), Some("cGs=".to_owned()));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn get_device_maps_not_found_to_none() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/devices/ghost?api-version=2021-04-12")
            .with_status(404)
            .create_async()
            .await;

        let client = test_client(server.url());
        assert!(client.get_device("ghost").await.unwrap().is_none());

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn create_device_puts_identity() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PUT", "/devices/leaf-1?api-version=2021-04-12")
            .match_header(
                "authorization",
                Matcher::Regex("^SharedAccessSignature ".to_owned()),
            )
            .match_body(Matcher::PartialJson(json!({
                "deviceId": "leaf-1",
                "authentication": {"type": "sas"},
                "capabilities": {"iotEdge": false}
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "deviceId": "leaf-1",
                    "generationId": "gen-1",
                    "etag": "AAAA",
                    "authentication": {
                        "type": "sas",
                        "symmetricKey": {"primaryKey": "cGs=", "secondaryKey": "c2s="}
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = test_client(server.url());
        let created = client
            .create_device(&Device::with_sas_auth("leaf-1"))
            .await
            .unwrap();

        assert_eq!(created.generation_id.as_deref(), Some("gen-1"));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn update_device_sends_if_match() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PUT", "/devices/leaf-1?api-version=2021-04-12")
            .match_header("if-match", "AAAA")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "deviceId": "leaf-1",
                    "etag": "BBBB",
                    "authentication": {"type": "selfSigned", "x509Thumbprint": {"primaryThumbprint": "AA", "secondaryThumbprint": "BB"}}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = test_client(server.url());
        let mut device =
            Device::with_self_signed_auth("leaf-1", "AA".to_owned(), "BB".to_owned());
        device.etag = Some("AAAA".to_owned());

        let updated = client.update_device(&device).await.unwrap();
        assert_eq!(updated.etag.as_deref(), Some("BBBB"));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn remove_device_deletes_unconditionally() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("DELETE", "/devices/leaf-1?api-version=2021-04-12")
            .match_header("if-match", "*")
            .with_status(204)
            .create_async()
            .await;

        let client = test_client(server.url());
        client.remove_device("leaf-1").await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn error_statuses_surface_code_and_body() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PUT", "/devices/leaf-1?api-version=2021-04-12")
            .with_status(412)
            .with_body("precondition failed")
            .create_async()
            .await;

        let client = test_client(server.url());
        let err = client
            .create_device(&Device::with_sas_auth("leaf-1"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RegistryError::Status(StatusCode::PRECONDITION_FAILED, ref msg) if msg == "precondition failed"
        ));

        mock.assert_async().await;
    }
}
