use std::{sync::Arc, time::Duration};

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    mqtt::dto::SerializationError,
    protocols::mqtt::{
        mk_mqtt_transport, ConnectionLoss, InvalidUri, MqttTransport, Transport, TransportError,
        TransportEvent,
    },
    settings::BrokerOptions,
};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error(transparent)]
    InvalidUri(#[from] InvalidUri),

    #[error("no answer from the broker within {0:?}")]
    Timeout(Duration),

    #[error("broker rejected the connection: {0}")]
    Rejected(String),

    #[error("broker unreachable: {0}")]
    Unreachable(String),

    #[error("subscription failed: {0}")]
    Subscribe(TransportError),
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("not connected to the broker")]
    NotConnected,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Serialization(#[from] SerializationError),
}

/// A message received on one of the subscribed topics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Anything able to push a payload to the broker without waiting for it.
pub trait Publisher: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError>;
}

struct Shared<T> {
    transport: T,
    topics: Vec<String>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

impl<T: Transport> Shared<T> {
    fn subscribe_all(&self) -> Result<(), TransportError> {
        for topic in &self.topics {
            self.transport.subscribe(topic)?;
        }

        Ok(())
    }

    fn on_connection_lost(self: &Arc<Self>, loss: ConnectionLoss) {
        error!("Connection to MQTT server lost: {:?}", loss);

        // Only the Connected -> Reconnecting transition starts a retry loop,
        // so repeated loss events while reconnecting are absorbed here.
        let began = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Reconnecting;
                true
            } else {
                false
            }
        });

        if began {
            self.clone().spawn_reconnect_loop();
        }
    }

    /// A clean session comes back without subscriptions, so every new
    /// session is subscribed again.
    fn on_session_restored(&self) {
        match self.subscribe_all() {
            Ok(()) => {
                let restored = self.state.send_if_modified(|state| {
                    if *state == ConnectionState::Reconnecting {
                        *state = ConnectionState::Connected;
                        true
                    } else {
                        false
                    }
                });

                if restored {
                    info!("Reconnected to MQTT server");
                } else {
                    debug!("MQTT session re-established, subscriptions renewed");
                }
            }
            Err(e) => error!("Can't renew MQTT subscriptions: {}", e),
        }
    }

    fn spawn_reconnect_loop(self: Arc<Self>) {
        let cancel = self.cancel.child_token();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RECONNECT_INTERVAL);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Reconnect loop cancelled");
                        return;
                    }
                    _ = interval.tick() => {}
                }

                if *self.state.borrow() != ConnectionState::Reconnecting {
                    debug!("Connection restored elsewhere, stopping reconnect loop");
                    return;
                }

                match self.subscribe_all() {
                    Ok(()) => {
                        self.state.send_if_modified(|state| {
                            if *state == ConnectionState::Reconnecting {
                                *state = ConnectionState::Connected;
                                true
                            } else {
                                false
                            }
                        });
                        info!("Reconnected to MQTT server");
                        return;
                    }
                    Err(e) => {
                        error!("Still disconnected from MQTT server: {}", e);
                    }
                }
            }
        });
    }
}

/// Owns the broker session and keeps it subscribed.
pub struct ConnectionManager<T: Transport> {
    shared: Arc<Shared<T>>,
}

async fn wait_for_handshake(
    events: &mut mpsc::Receiver<TransportEvent>,
) -> Result<(), ConnectError> {
    loop {
        match events.recv().await {
            Some(TransportEvent::Connected) => return Ok(()),
            Some(TransportEvent::ConnectionLost(ConnectionLoss::Refused(reason))) => {
                return Err(ConnectError::Rejected(reason))
            }
            Some(TransportEvent::ConnectionLost(ConnectionLoss::Io(reason))) => {
                return Err(ConnectError::Unreachable(reason))
            }
            Some(TransportEvent::Message { .. }) => continue,
            None => return Err(ConnectError::Unreachable("transport closed".to_string())),
        }
    }
}

impl<T: Transport> ConnectionManager<T> {
    /// Waits for the broker handshake, subscribes to `topics` and starts
    /// forwarding inbound messages to `inbound`.
    pub async fn start(
        transport: T,
        mut events: mpsc::Receiver<TransportEvent>,
        topics: Vec<String>,
        inbound: mpsc::Sender<InboundMessage>,
    ) -> Result<Self, ConnectError> {
        let (state, _) = watch::channel(ConnectionState::Connecting);

        tokio::time::timeout(CONNECT_TIMEOUT, wait_for_handshake(&mut events))
            .await
            .map_err(|_| ConnectError::Timeout(CONNECT_TIMEOUT))??;

        let shared = Arc::new(Shared {
            transport,
            topics,
            state,
            cancel: CancellationToken::new(),
        });

        shared.subscribe_all().map_err(ConnectError::Subscribe)?;
        shared.state.send_replace(ConnectionState::Connected);
        info!("Connected to MQTT server");

        {
            let shared = shared.clone();

            tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        _ = shared.cancel.cancelled() => break,
                        event = events.recv() => event,
                    };

                    match event {
                        Some(TransportEvent::Message { topic, payload }) => {
                            debug!("MQTT message on {}", topic);

                            if inbound.send(InboundMessage { topic, payload }).await.is_err() {
                                warn!("Inbound message queue closed, dropping message");
                            }
                        }
                        Some(TransportEvent::ConnectionLost(loss)) => shared.on_connection_lost(loss),
                        Some(TransportEvent::Connected) => shared.on_session_restored(),
                        None => {
                            error!("MQTT transport stopped");
                            break;
                        }
                    }
                }
            });
        }

        Ok(ConnectionManager { shared })
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Stops the inbound task and any running reconnect loop.
    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
        self.shared.state.send_replace(ConnectionState::Disconnected);
    }
}

impl<T: Transport> Drop for ConnectionManager<T> {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl<T: Transport> Publisher for ConnectionManager<T> {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        let result = if self.state() == ConnectionState::Connected {
            self.shared
                .transport
                .publish(topic, payload)
                .map_err(PublishError::from)
        } else {
            Err(PublishError::NotConnected)
        };

        if let Err(e) = &result {
            warn!("Can't send MQTT message to {}: {}", topic, e);
        }

        result
    }
}

pub async fn connect(
    options: &BrokerOptions,
    inbound: mpsc::Sender<InboundMessage>,
) -> Result<ConnectionManager<MqttTransport>, ConnectError> {
    let (transport, events) = mk_mqtt_transport(options)?;

    ConnectionManager::start(transport, events, options.subscriptions(), inbound).await
}

/// Keeps trying [`connect`] every [`RECONNECT_INTERVAL`] until it succeeds.
/// Returns `None` if cancelled first.
pub async fn connect_with_retry(
    options: &BrokerOptions,
    inbound: mpsc::Sender<InboundMessage>,
    cancel: &CancellationToken,
) -> Option<ConnectionManager<MqttTransport>> {
    loop {
        match connect(options, inbound.clone()).await {
            Ok(manager) => return Some(manager),
            Err(e) => error!(
                "Can't connect to MQTT server {}: {}. Retrying in {:?}",
                options.server_uri, e, RECONNECT_INTERVAL
            ),
        }

        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(RECONNECT_INTERVAL) => {}
        }
    }
}
