use std::time::Duration;

use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, QoS};
use thiserror::Error;
use tracing::{debug, warn};

/// How long to wait for an individual broker acknowledgement
const ACK_TIMEOUT: Duration = Duration::from_secs(30);

const METHOD_POST_PREFIX: &str = "$iothub/methods/POST/";

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("gateway refused the connection: {0:?}")]
    ConnectionRefused(ConnectReturnCode),

    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("mqtt connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("gateway closed the connection")]
    Disconnected,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("malformed method request topic: '{0}'")]
    MalformedMethodTopic(String),
}

/// A remote method call answered by the device
#[derive(Debug, Clone)]
pub struct MethodInvocation {
    pub name: String,
    pub rid: String,
    pub payload: Vec<u8>,
}

/// Leaf device connection through the edge gateway.
///
/// The event loop is driven inline by each operation, so the client stays
/// single-flight: one publish or one method exchange in progress at a time,
/// which is all the smoke sequence needs.
pub struct DeviceClient {
    client: AsyncClient,
    eventloop: EventLoop,
    device_id: String,
}

impl DeviceClient {
    /// Open the connection and wait for the broker to accept it
    pub async fn connect(options: MqttOptions, device_id: String) -> Result<Self, DeviceError> {
        let (client, eventloop) = AsyncClient::new(options, 10);
        let mut device = Self {
            client,
            eventloop,
            device_id,
        };

        device
            .drive_until("connack", |event| match event {
                Incoming::ConnAck(ack) if ack.code == ConnectReturnCode::Success => {
                    Some(Ok(()))
                }
                Incoming::ConnAck(ack) => Some(Err(DeviceError::ConnectionRefused(ack.code))),
                _ => None,
            })
            .await?;

        Ok(device)
    }

    fn telemetry_topic(&self) -> String {
        format!("devices/{}/messages/events/", self.device_id)
    }

    /// Publish one telemetry message and wait for the broker acknowledgement
    pub async fn send_telemetry(&mut self, body: Vec<u8>) -> Result<(), DeviceError> {
        let topic = self.telemetry_topic();
        self.client
            .publish(topic, QoS::AtLeastOnce, false, body)
            .await?;

        self.drive_until("puback", |event| match event {
            Incoming::PubAck(_) => Some(Ok(())),
            _ => None,
        })
        .await
    }

    /// Subscribe to remote method requests and wait for the subscription to
    /// be confirmed
    pub async fn subscribe_methods(&mut self) -> Result<(), DeviceError> {
        self.client
            .subscribe(format!("{METHOD_POST_PREFIX}#"), QoS::AtLeastOnce)
            .await?;

        self.drive_until("suback", |event| match event {
            Incoming::SubAck(_) => Some(Ok(())),
            _ => None,
        })
        .await
    }

    /// Answer the next remote method call by echoing its payload back with
    /// status 200, then return the observed invocation.
    pub async fn serve_method_once(
        &mut self,
        timeout: Duration,
    ) -> Result<MethodInvocation, DeviceError> {
        let request = tokio::time::timeout(timeout, self.next_method_request())
            .await
            .map_err(|_| DeviceError::Timeout("method request"))??;

        debug!(
            method = request.name.as_str(),
            "received direct method call"
        );

        self.client
            .publish(
                method_response_topic(200, &request.rid),
                QoS::AtLeastOnce,
                false,
                request.payload.clone(),
            )
            .await?;
        self.drive_until("method response puback", |event| match event {
            Incoming::PubAck(_) => Some(Ok(())),
            _ => None,
        })
        .await?;

        Ok(request)
    }

    async fn next_method_request(&mut self) -> Result<MethodInvocation, DeviceError> {
        loop {
            match self.eventloop.poll().await? {
                Event::Incoming(Incoming::Publish(publish)) => {
                    if !publish.topic.starts_with(METHOD_POST_PREFIX) {
                        debug!(topic = publish.topic.as_str(), "ignoring unexpected publish");
                        continue;
                    }
                    let (name, rid) = parse_method_topic(&publish.topic)
                        .ok_or_else(|| DeviceError::MalformedMethodTopic(publish.topic.clone()))?;
                    return Ok(MethodInvocation {
                        name,
                        rid,
                        payload: publish.payload.to_vec(),
                    });
                }
                Event::Incoming(Incoming::Disconnect) => return Err(DeviceError::Disconnected),
                _ => {}
            }
        }
    }

    /// Drive the connection (keepalive pings and pending acks) until it
    /// fails. Used while the run is waiting on something other than the
    /// device, which would otherwise let the broker time the session out.
    pub async fn pump(&mut self) -> DeviceError {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Disconnect)) => return DeviceError::Disconnected,
                Ok(_) => {}
                Err(e) => return e.into(),
            }
        }
    }

    pub async fn disconnect(self) -> Result<(), DeviceError> {
        if let Err(e) = self.client.disconnect().await {
            warn!("disconnect failed: {e}");
        }
        Ok(())
    }

    /// Poll the event loop until `check` yields an outcome for an incoming
    /// packet, bounded by the ack timeout.
    async fn drive_until<F>(&mut self, what: &'static str, mut check: F) -> Result<(), DeviceError>
    where
        F: FnMut(&Incoming) -> Option<Result<(), DeviceError>>,
    {
        let wait = async {
            loop {
                match self.eventloop.poll().await? {
                    Event::Incoming(Incoming::Disconnect) => return Err(DeviceError::Disconnected),
                    Event::Incoming(incoming) => {
                        if let Some(outcome) = check(&incoming) {
                            return outcome;
                        }
                    }
                    Event::Outgoing(_) => {}
                }
            }
        };

        tokio::time::timeout(ACK_TIMEOUT, wait)
            .await
            .map_err(|_| DeviceError::Timeout(what))?
    }
}

/// Split `$iothub/methods/POST/<name>/?$rid=<rid>` into name and rid
fn parse_method_topic(topic: &str) -> Option<(String, String)> {
    let rest = topic.strip_prefix(METHOD_POST_PREFIX)?;
    let (name, rid) = rest.split_once("/?$rid=")?;
    if name.is_empty() || rid.is_empty() {
        return None;
    }
    Some((name.to_owned(), rid.to_owned()))
}

fn method_response_topic(status: u16, rid: &str) -> String {
    format!("$iothub/methods/res/{status}/?$rid={rid}")
}
