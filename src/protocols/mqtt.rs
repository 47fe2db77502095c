use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use log::{debug, warn};
use rand::Rng;
use rumqttc::{AsyncClient, ClientError, ConnectionError, MqttOptions, QoS};
use tokio::{sync::mpsc, task};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::settings::BrokerOptions;

const DEFAULT_MQTT_PORT: u16 = 1883;
const KEEP_ALIVE: Duration = Duration::from_secs(5);
const POLL_ERROR_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("not connected to the broker")]
    NotConnected,

    #[error("MQTT client error: {0}")]
    Client(#[from] ClientError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionLoss {
    /// The broker answered the handshake with a refusal (bad credentials etc).
    Refused(String),
    /// Network level failure.
    Io(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Message { topic: String, payload: Vec<u8> },
    ConnectionLost(ConnectionLoss),
}

/// The small surface the connection manager needs from a broker session.
///
/// Both calls only enqueue work and must never wait on the broker.
pub trait Transport: Send + Sync + 'static {
    fn subscribe(&self, topic: &str) -> Result<(), TransportError>;
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;
}

/// rumqttc backed transport.
///
/// The event loop is polled on a background task which keeps polling after
/// errors, so rumqttc re-establishes the TCP session by itself.
pub struct MqttTransport {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    _poll_guard: DropGuard,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid broker URI {0:?}")]
pub struct InvalidUri(pub String);

/// Splits `tcp://host:port` (or `mqtt://`, or a bare `host[:port]`).
pub fn parse_server_uri(uri: &str) -> Result<(String, u16), InvalidUri> {
    let rest = uri
        .split_once("://")
        .map(|(_scheme, rest)| rest)
        .unwrap_or(uri)
        .trim_end_matches('/');

    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().map_err(|_| InvalidUri(uri.to_string()))?;
            (host, port)
        }
        None => (rest, DEFAULT_MQTT_PORT),
    };

    if host.is_empty() {
        return Err(InvalidUri(uri.to_string()));
    }

    Ok((host.to_string(), port))
}

pub fn mk_mqtt_transport(
    options: &BrokerOptions,
) -> Result<(MqttTransport, mpsc::Receiver<TransportEvent>), InvalidUri> {
    let (host, port) = parse_server_uri(&options.server_uri)?;

    // One client id per local instance
    let client_id = format!("glowworm-{:08x}", rand::thread_rng().gen::<u32>());

    let mut mqtt_options = MqttOptions::new(client_id, host, port);
    mqtt_options
        .set_keep_alive(KEEP_ALIVE)
        .set_clean_session(true);
    if !options.username.is_empty() {
        mqtt_options.set_credentials(options.username.clone(), options.password.clone());
    }

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10);
    let (tx, rx) = mpsc::channel(64);
    let connected = Arc::new(AtomicBool::new(false));
    let cancel = CancellationToken::new();

    {
        let connected = connected.clone();
        let cancel = cancel.clone();

        task::spawn(async move {
            loop {
                let notification = tokio::select! {
                    _ = cancel.cancelled() => break,
                    notification = eventloop.poll() => notification,
                };

                let event = match notification {
                    Ok(rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_))) => {
                        connected.store(true, Ordering::SeqCst);
                        Some(TransportEvent::Connected)
                    }
                    Ok(rumqttc::Event::Incoming(rumqttc::Packet::Publish(msg))) => {
                        Some(TransportEvent::Message {
                            topic: msg.topic,
                            payload: msg.payload.to_vec(),
                        })
                    }
                    Ok(_) => None,
                    Err(e) => {
                        connected.store(false, Ordering::SeqCst);
                        warn!("MQTT event loop error: {}", e);

                        let loss = match e {
                            ConnectionError::ConnectionRefused(code) => {
                                ConnectionLoss::Refused(format!("{:?}", code))
                            }
                            e => ConnectionLoss::Io(e.to_string()),
                        };

                        Some(TransportEvent::ConnectionLost(loss))
                    }
                };

                if let Some(event) = event {
                    let is_error = matches!(event, TransportEvent::ConnectionLost(_));

                    if tx.send(event).await.is_err() {
                        debug!("Transport event receiver dropped, stopping MQTT poll loop");
                        break;
                    }

                    if is_error {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(POLL_ERROR_DELAY) => {}
                        }
                    }
                }
            }
        });
    }

    Ok((
        MqttTransport {
            client,
            connected,
            _poll_guard: cancel.drop_guard(),
        },
        rx,
    ))
}

impl Transport for MqttTransport {
    fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }

        self.client.try_subscribe(topic, QoS::AtMostOnce)?;

        Ok(())
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }

        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)?;

        Ok(())
    }
}
