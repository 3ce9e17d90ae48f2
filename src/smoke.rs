//! The smoke sequence itself: a fixed series of steps against the hub and
//! the edge gateway, sharing one mutable context for the lifetime of the
//! run. Any step failing aborts the run; teardown decides what to do with
//! the device identity based on how the run went.

use anyhow::{bail, Context as _, Result};
use serde_json::json;
use tracing::info;

use crate::config::{AuthMode, Settings};
use crate::device::{device_username, gateway_mqtt_options, tls_configuration, DeviceClient};
use crate::events::EventListener;
use crate::hub::{
    AuthenticationMechanism, AuthenticationType, Device, HubConnectionString, MethodClient,
    RegistryClient, SasToken, X509Thumbprint,
};
use crate::types::MessageId;

const METHOD_NAME: &str = "DirectMethod";

/// Per-run state threaded through the steps
pub struct DeviceContext {
    pub device: Device,
    pub device_client: Option<DeviceClient>,
    pub hub: HubConnectionString,
    pub registry: RegistryClient,
    pub remove_device: bool,
    pub message_id: MessageId,
}

pub struct Smoke {
    settings: Settings,
    registry: RegistryClient,
    methods: MethodClient,
    context: Option<DeviceContext>,
    listener: Option<EventListener>,
}

impl Smoke {
    pub fn new(settings: Settings) -> Result<Self> {
        let registry = RegistryClient::new(&settings.hub, &settings.trust)
            .context("failed to create registry client")?;
        let methods = MethodClient::new(&settings.hub, &settings.trust)
            .context("failed to create method client")?;
        Ok(Self {
            settings,
            registry,
            methods,
            context: None,
            listener: None,
        })
    }

    /// Reuse the identity when the registry already has one, refreshing the
    /// registered thumbprints in self-signed mode so the run always tests
    /// the certificates it was given. Identities created here are marked
    /// for removal at teardown.
    pub async fn get_or_create_device_identity(&mut self) -> Result<()> {
        let settings = &self.settings;
        let device_id = settings.device_id.as_str();

        let (device, remove_device) = match self.registry.get_device(device_id).await? {
            Some(mut device) => {
                info!(
                    "device '{device_id}' already registered on hub '{}'",
                    settings.hub.host_name
                );
                if let AuthMode::SelfSigned {
                    primary_thumbprint,
                    secondary_thumbprint,
                    ..
                } = &settings.auth
                {
                    device.authentication = AuthenticationMechanism {
                        auth_type: AuthenticationType::SelfSigned,
                        symmetric_key: None,
                        x509_thumbprint: Some(X509Thumbprint {
                            primary_thumbprint: Some(primary_thumbprint.clone()),
                            secondary_thumbprint: Some(secondary_thumbprint.clone()),
                        }),
                    };
                    device = self.registry.update_device(&device).await?;
                }
                (device, false)
            }
            None => {
                info!(
                    "registering device '{device_id}' on hub '{}'",
                    settings.hub.host_name
                );
                let device = match &settings.auth {
                    AuthMode::Sas => Device::with_sas_auth(device_id),
                    AuthMode::CertificateAuthority { .. } => {
                        Device::with_certificate_authority_auth(device_id)
                    }
                    AuthMode::SelfSigned {
                        primary_thumbprint,
                        secondary_thumbprint,
                        ..
                    } => Device::with_self_signed_auth(
                        device_id,
                        primary_thumbprint.clone(),
                        secondary_thumbprint.clone(),
                    ),
                };
                (self.registry.create_device(&device).await?, true)
            }
        };

        self.context = Some(DeviceContext {
            device,
            device_client: None,
            hub: settings.hub.clone(),
            registry: self.registry.clone(),
            remove_device,
            message_id: MessageId::default(),
        });
        Ok(())
    }

    /// The event stream is live-only, so the subscription has to be up
    /// before the device sends anything.
    pub async fn start_event_listener(&mut self) -> Result<()> {
        let context = self
            .context
            .as_mut()
            .context("device identity has not been registered")?;
        let listener = EventListener::start(
            &self.settings.events,
            &self.settings.trust,
            &context.device.device_id,
            &context.message_id,
        )
        .await?;
        self.listener = Some(listener);
        Ok(())
    }

    /// Connect through the gateway, send the correlated telemetry message
    /// and arm the method subscription.
    pub async fn connect_and_send(&mut self) -> Result<()> {
        let settings = self.settings.clone();
        let context = self
            .context
            .as_mut()
            .context("device identity has not been registered")?;
        let device_id = context.device.device_id.clone();

        let password = match &settings.auth {
            AuthMode::Sas => {
                let key = context
                    .device
                    .primary_key()
                    .context("registered device has no symmetric key")?;
                let resource = format!("{}/devices/{device_id}", context.hub.host_name);
                Some(SasToken::sign(&resource, key, None)?.to_string())
            }
            _ => None,
        };

        let tls = tls_configuration(&settings.trust, settings.auth.client_cert_paths())?;
        let options = gateway_mqtt_options(
            &device_id,
            &settings.edge_hostname,
            settings.use_websockets,
            tls,
            device_username(&context.hub.host_name, &device_id),
            password,
        );

        let mut client = DeviceClient::connect(options, device_id).await?;
        info!("leaf device client created");

        let body = format!("Message from Leaf Device. Msg GUID: {}", context.message_id);
        info!("sending message to '{}'", settings.edge_hostname);
        client.send_telemetry(body.into_bytes()).await?;
        info!("message sent");

        client.subscribe_methods().await?;
        info!("direct method subscription is set");

        context.device_client = Some(client);
        Ok(())
    }

    /// Wait for the correlated telemetry message to surface on the event
    /// stream within the receive window. The device connection is kept
    /// polled in the meantime so the gateway session does not time out.
    pub async fn verify_telemetry(&mut self) -> Result<()> {
        let window = self.settings.receive_timeout;
        let listener = self
            .listener
            .take()
            .context("event listener was not started")?;
        let context = self
            .context
            .as_mut()
            .context("device identity has not been registered")?;
        let client = context
            .device_client
            .as_mut()
            .context("device is not connected")?;

        let body = tokio::select! {
            matched = listener.await_match(window) => matched?,
            err = client.pump() => {
                return Err(err).context("device connection dropped while waiting for the event");
            }
        };
        info!("verified telemetry on the event stream: {body}");
        Ok(())
    }

    /// Invoke the remote method through the hub while the device answers it,
    /// then check for status 200 and an exact payload echo.
    pub async fn verify_direct_method(&mut self) -> Result<()> {
        let methods = self.methods.clone();
        let timeout = self.settings.method_timeout;
        let context = self
            .context
            .as_mut()
            .context("device identity has not been registered")?;
        let device_id = context.device.device_id.clone();
        let client = context
            .device_client
            .as_mut()
            .context("device is not connected")?;

        let payload = json!({"TestKey": "TestValue"});
        let (served, result) = tokio::join!(
            client.serve_method_once(timeout),
            methods.invoke(&device_id, METHOD_NAME, &payload, timeout),
        );

        let invocation = served?;
        info!(
            "leaf device answered direct method '{}' (rid {})",
            invocation.name, invocation.rid
        );
        let received: serde_json::Value = serde_json::from_slice(&invocation.payload)
            .context("device received an unparseable method payload")?;
        if received != payload {
            bail!("device received unexpected method payload: {received}");
        }

        let result = result?;
        if result.status != 200 {
            bail!(
                "could not invoke direct method on device, status: {}",
                result.status
            );
        }
        if result.payload != payload {
            bail!(
                "payload doesn't match with sent payload. received: {}, expected: {payload}",
                result.payload
            );
        }
        Ok(())
    }

    /// Leave the identity behind, regardless of who created it
    pub fn keep_device_identity(&mut self) {
        if let Some(context) = &mut self.context {
            context.remove_device = false;
        }
    }

    /// Delete the identity at teardown if this run created it
    pub async fn maybe_delete_device_identity(&mut self) -> Result<()> {
        if let Some(context) = self.context.take() {
            if let Some(client) = context.device_client {
                client.disconnect().await?;
            }
            if context.remove_device {
                info!("removing device '{}'", context.device.device_id);
                context
                    .registry
                    .remove_device(&context.device.device_id)
                    .await?;
            }
        }
        Ok(())
    }
}
