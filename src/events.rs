//! Event-stream verification. Subscribes to the hub's event endpoint for the
//! device under test and resolves once the telemetry message carrying this
//! run's correlation identifier shows up. The stream is live-only, so the
//! subscription must be in place before the message is sent.

use std::time::Duration;

use rumqttc::{AsyncClient, ConnectReturnCode, Event, Incoming, QoS};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::device::{events_mqtt_options, tls_configuration, TransportError};
use crate::hub::{EventsEndpoint, SasError, SasToken};
use crate::types::MessageId;
use crate::util::certs::TrustBundle;

/// How long to wait for the subscription handshake
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum EventsError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("token signing failed: {0}")]
    Token(#[from] SasError),

    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("mqtt connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("event endpoint refused the connection: {0:?}")]
    ConnectionRefused(ConnectReturnCode),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("no matching event received within {0:?}")]
    ReceiveWindowElapsed(Duration),

    #[error("event stream closed before a matching event arrived")]
    StreamClosed,
}

/// True for the event this run is waiting for: published on the device's
/// event topic and carrying the correlation identifier in the body.
fn event_matches(topic: &str, payload: &[u8], expected_topic: &str, needle: &str) -> bool {
    topic == expected_topic && String::from_utf8_lossy(payload).contains(needle)
}

/// Background consumer of the hub event stream
pub struct EventListener {
    matched_rx: oneshot::Receiver<String>,
    task: JoinHandle<()>,
}

impl EventListener {
    /// Connect, subscribe to the device's event topic and start watching in
    /// the background.
    pub async fn start(
        endpoint: &EventsEndpoint,
        trust: &TrustBundle,
        device_id: &str,
        message_id: &MessageId,
    ) -> Result<Self, EventsError> {
        let client_id = format!("leafcheck-events-{}", uuid::Uuid::new_v4().simple());
        let password = SasToken::sign(
            &endpoint.resource_uri(),
            &endpoint.shared_access_key,
            None,
        )?
        .to_string();
        let options = events_mqtt_options(
            &client_id,
            &endpoint.host,
            endpoint.port,
            tls_configuration(trust, None)?,
            endpoint.shared_access_key_name.clone(),
            password,
        );

        let (client, mut eventloop) = AsyncClient::new(options, 10);
        let topic = format!("{}/{}", endpoint.entity_path, device_id);

        let handshake = async {
            loop {
                match eventloop.poll().await? {
                    Event::Incoming(Incoming::ConnAck(ack)) => {
                        if ack.code != ConnectReturnCode::Success {
                            return Err(EventsError::ConnectionRefused(ack.code));
                        }
                        client.subscribe(topic.clone(), QoS::AtLeastOnce).await?;
                    }
                    Event::Incoming(Incoming::SubAck(_)) => return Ok(()),
                    _ => {}
                }
            }
        };
        tokio::time::timeout(SUBSCRIBE_TIMEOUT, handshake)
            .await
            .map_err(|_| EventsError::Timeout("event stream subscription"))??;

        info!(
            "receiving events for device '{device_id}' on entity '{}'",
            endpoint.entity_path
        );

        let (matched_tx, matched_rx) = oneshot::channel();
        let needle = message_id.to_string();
        let task = tokio::spawn(async move {
            // keep the client alive for the lifetime of the subscription
            let _client = client;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        if event_matches(&publish.topic, &publish.payload, &topic, &needle) {
                            debug!(topic = publish.topic.as_str(), "matched event");
                            let _ = matched_tx
                                .send(String::from_utf8_lossy(&publish.payload).into_owned());
                            return;
                        }
                        debug!(topic = publish.topic.as_str(), "event did not match");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("event stream poll failed: {e}");
                        return;
                    }
                }
            }
        });

        Ok(Self { matched_rx, task })
    }

    /// Wait for the matching event, bounded by the receive window.
    pub async fn await_match(self, window: Duration) -> Result<String, EventsError> {
        let result = tokio::time::timeout(window, self.matched_rx).await;
        self.task.abort();
        match result {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(_)) => Err(EventsError::StreamClosed),
            Err(_) => Err(EventsError::ReceiveWindowElapsed(window)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_device_topic_with_correlation_id() {
        assert!(event_matches(
            "telemetry/leaf-1",
            b"Message from Leaf Device. Msg GUID: abc123",
            "telemetry/leaf-1",
            "abc123",
        ));
    }

    #[test]
    fn rejects_other_devices_and_other_messages() {
        assert!(!event_matches(
            "telemetry/leaf-2",
            b"Message from Leaf Device. Msg GUID: abc123",
            "telemetry/leaf-1",
            "abc123",
        ));
        assert!(!event_matches(
            "telemetry/leaf-1",
            b"Message from Leaf Device. Msg GUID: zzz999",
            "telemetry/leaf-1",
            "abc123",
        ));
    }

    #[test]
    fn binary_payloads_do_not_panic_the_matcher() {
        assert!(!event_matches(
            "telemetry/leaf-1",
            &[0xff, 0xfe, 0x00],
            "telemetry/leaf-1",
            "abc123",
        ));
    }
}
