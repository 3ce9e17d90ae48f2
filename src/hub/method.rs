use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, field, warn};

use crate::hub::sas::SasError;
use crate::hub::{HubConnectionString, SasToken, API_VERSION};
use crate::util::certs::{CertsError, TrustBundle};

#[derive(Debug, Error)]
pub enum MethodError {
    #[error("failed to build method client: {0}")]
    Client(#[from] CertsError),

    #[error("token signing failed: {0}")]
    Token(#[from] SasError),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("method invocation returned error: ({0}) {1}")]
    Status(StatusCode, String),
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MethodRequest<'a> {
    method_name: &'a str,
    payload: &'a Value,
    response_timeout_in_seconds: u64,
}

/// Outcome reported by the device for a remote method call
#[derive(Clone, Debug, Deserialize)]
pub struct MethodResult {
    pub status: u16,
    pub payload: Value,
}

/// Service-side client that invokes remote methods on a device through the hub
#[derive(Debug, Clone)]
pub struct MethodClient {
    client: reqwest::Client,
    base: String,
    resource_uri: String,
    key_name: String,
    key: String,
}

impl MethodClient {
    pub fn new(hub: &HubConnectionString, trust: &TrustBundle) -> Result<Self, MethodError> {
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

    pub async fn invoke(
        &self,
        device_id: &str,
        method_name: &str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<MethodResult, MethodError> {
        let token = SasToken::sign(&self.resource_uri, &self.key, Some(&self.key_name))?;
        let url = format!(
            "{}/twins/{device_id}/methods?api-version={API_VERSION}",
            self.base
        );
        let request = MethodRequest {
            method_name,
            payload,
            response_timeout_in_seconds: timeout.as_secs(),
        };

        debug!(method = method_name, device = device_id, "invoking remote method");
        let response = self
            .client
            .post(url)
            .header("Authorization", token.as_str())
            .timeout(timeout)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            warn!(
                response = field::display(response.status()),
                "received error response"
            );
            let err_code = response.status();
            let err_msg = response.text().await.unwrap_or_default();
            return Err(MethodError::Status(err_code, err_msg));
        }

        Ok(response.json().await?)
    }
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

    fn test_client(base: String) -> MethodClient {
        MethodClient::with_base(base, &test_hub(), reqwest::Client::new())
    }

    #[tokio::test]
    async fn invoke_posts_method_request() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/twins/leaf-1/methods?api-version=2021-04-12")
            .match_header(
                "authorization",
                Matcher::Regex("^SharedAccessSignature .*&skn=owner$".to_owned()),
            )
            .match_body(Matcher::Json(json!({
                "methodName": "DirectMethod",
                "payload": {"TestKey": "TestValue"},
                "responseTimeoutInSeconds": 300
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({"status": 200, "payload": {"TestKey": "TestValue"}}).to_string())
            .create_async()
            .await;

        let client = test_client(server.url());
        let result = client
            .invoke(
                "leaf-1",
                "DirectMethod",
                &json!({"TestKey": "TestValue"}),
                Duration::from_secs(300),
            )
            .await
            .unwrap();

        assert_eq!(result.status, 200);
        assert_eq!(result.payload, json!({"TestKey": "TestValue"}));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn device_reported_status_is_passed_through() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/twins/leaf-1/methods?api-version=2021-04-12")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({"status": 500, "payload": null}).to_string())
            .create_async()
            .await;

        let client = test_client(server.url());
        let result = client
            .invoke("leaf-1", "DirectMethod", &json!({}), Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(result.status, 500);
    }

    #[tokio::test]
    async fn hub_error_statuses_surface_code_and_body() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/twins/ghost/methods?api-version=2021-04-12")
            .with_status(404)
            .with_body("device not found")
            .create_async()
            .await;

        let client = test_client(server.url());
        let err = client
            .invoke("ghost", "DirectMethod", &json!({}), Duration::from_secs(30))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            MethodError::Status(StatusCode::NOT_FOUND, ref msg) if msg == "device not found"
        ));
    }
}
