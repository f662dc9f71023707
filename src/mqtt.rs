use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, error, info, warn};
use rumqttc::{ConnectReturnCode, Event, MqttOptions, Outgoing, Packet, QoS, SubscribeFilter};
use tokio::sync::mpsc;

use crate::config;
use crate::error::TransportError;
use crate::shutdown::Shutdown;

/// Messages buffered per subscription before the dispatcher starts dropping.
pub const ROUTE_CAPACITY: usize = 64;

const REQUEST_CAPACITY: usize = 10;
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Anything that can put a payload on a topic.
pub trait Publisher: Send + Sync {
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

#[derive(Debug)]
struct Route {
    topic: String,
    tx: mpsc::Sender<BusMessage>,
}

/// Subscriptions of one connection. Kept for the lifetime of the connection
/// so they can be replayed after every reconnect.
#[derive(Debug, Default)]
struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    fn add(&mut self, topic: &str, tx: mpsc::Sender<BusMessage>) {
        self.routes.push(Route {
            topic: topic.to_string(),
            tx,
        });
    }

    fn filters(&self) -> Vec<SubscribeFilter> {
        let mut topics: Vec<&str> = self.routes.iter().map(|r| r.topic.as_str()).collect();
        topics.sort_unstable();
        topics.dedup();
        topics
            .into_iter()
            .map(|t| SubscribeFilter::new(t.to_string(), QoS::AtMostOnce))
            .collect()
    }

    /// Hands the message to every route on its topic without waiting.
    fn dispatch(&self, message: &BusMessage) -> usize {
        let mut delivered = 0;
        for route in self.routes.iter().filter(|r| r.topic == message.topic) {
            match route.tx.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Handler for {} is behind, dropping message", route.topic);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Handler for {} is gone, dropping message", route.topic);
                }
            }
        }
        delivered
    }
}

pub(crate) trait SubscriptionSink {
    fn resubscribe(&self, filters: Vec<SubscribeFilter>) -> Result<(), rumqttc::ClientError>;
}

impl SubscriptionSink for rumqttc::AsyncClient {
    fn resubscribe(&self, filters: Vec<SubscribeFilter>) -> Result<(), rumqttc::ClientError> {
        // Called from inside the event loop, so it must not wait on the
        // request queue that the same loop drains.
        self.try_subscribe_many(filters)
    }
}

/// Turns event loop notifications into route deliveries and replays the
/// subscription table on every accepted CONNACK.
pub(crate) struct Dispatcher<S> {
    client_id: String,
    routes: Arc<Mutex<RouteTable>>,
    sink: S,
}

impl<S: SubscriptionSink> Dispatcher<S> {
    pub(crate) fn handle_event(&self, event: &Event) -> Result<(), TransportError> {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code == ConnectReturnCode::Success {
                    info!("{}: connected to broker", self.client_id);
                    self.resubscribe()?;
                } else {
                    error!("{}: connection refused: {:?}", self.client_id, ack.code);
                }
            }
            Event::Incoming(Packet::Publish(p)) => {
                debug!(
                    "{}: received {} bytes on {}",
                    self.client_id,
                    p.payload.len(),
                    p.topic
                );
                let message = BusMessage {
                    topic: p.topic.clone(),
                    payload: p.payload.to_vec(),
                };
                if lock(&self.routes).dispatch(&message) == 0 {
                    debug!("{}: no handler took message on {}", self.client_id, p.topic);
                }
            }
            Event::Incoming(Packet::SubAck(_)) => {
                debug!("{}: subscription acknowledged", self.client_id);
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("{}: broker closed the session", self.client_id);
            }
            _ => {}
        }
        Ok(())
    }

    fn resubscribe(&self) -> Result<(), TransportError> {
        let filters = lock(&self.routes).filters();
        if filters.is_empty() {
            return Ok(());
        }
        let topics: Vec<String> = filters.iter().map(|f| f.path.clone()).collect();
        self.sink
            .resubscribe(filters)
            .map_err(TransportError::Subscribe)?;
        info!("{}: subscribed to {:?}", self.client_id, topics);
        Ok(())
    }
}

fn lock(routes: &Mutex<RouteTable>) -> MutexGuard<'_, RouteTable> {
    routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to one broker connection. Cloning shares the connection.
#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    client_id: String,
    routes: Arc<Mutex<RouteTable>>,
}

/// Supervised network loop owning the connection of one [`MqttClient`].
pub struct BusWorker {
    eventloop: rumqttc::EventLoop,
    dispatcher: Dispatcher<rumqttc::AsyncClient>,
    reconnect_delay: Duration,
}

impl MqttClient {
    /// Builds the client for `client_id`. The session itself is opened by
    /// [`BusWorker::run`], which keeps retrying while the broker is away.
    pub fn connect(
        config: &config::MqttConfig,
        client_id: &str,
    ) -> Result<(Self, BusWorker), TransportError> {
        if config.host.trim().is_empty() {
            return Err(TransportError::InvalidOptions("empty broker host".to_string()));
        }
        if client_id.is_empty() || client_id.trim() != client_id {
            return Err(TransportError::InvalidOptions(format!(
                "invalid client id {client_id:?}"
            )));
        }

        let mut mqttoptions =
            MqttOptions::new(client_id, config.host.clone(), config.port.unwrap_or(1883));

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, REQUEST_CAPACITY);
        let routes = Arc::new(Mutex::new(RouteTable::default()));

        let worker = BusWorker {
            eventloop,
            dispatcher: Dispatcher {
                client_id: client_id.to_string(),
                routes: routes.clone(),
                sink: client.clone(),
            },
            reconnect_delay: Duration::from_secs(config.reconnect_delay_seconds.unwrap_or(1)),
        };

        Ok((
            MqttClient {
                client,
                client_id: client_id.to_string(),
                routes,
            },
            worker,
        ))
    }

    /// Registers `topic` on this connection and returns the queue its
    /// messages are delivered to. Survives reconnects.
    pub async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<BusMessage>, TransportError> {
        let (tx, rx) = mpsc::channel(ROUTE_CAPACITY);
        self.subscribe_with(topic, tx).await?;
        Ok(rx)
    }

    /// Like [`MqttClient::subscribe`], delivering into an existing queue so
    /// several topics or connections can feed one consumer.
    pub async fn subscribe_with(
        &self,
        topic: &str,
        tx: mpsc::Sender<BusMessage>,
    ) -> Result<(), TransportError> {
        lock(&self.routes).add(topic, tx);

        self.client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(TransportError::Subscribe)?;
        debug!("{}: requested subscription to {}", self.client_id, topic);
        Ok(())
    }
}

impl Publisher for MqttClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|source| TransportError::Publish {
                topic: topic.to_string(),
                source,
            })
    }
}

impl BusWorker {
    pub async fn run(mut self, mut shutdown: Shutdown) {
        let client_id = self.dispatcher.client_id.clone();
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                polled = self.eventloop.poll() => match polled {
                    Ok(event) => {
                        if let Err(err) = self.dispatcher.handle_event(&event) {
                            error!("{client_id}: {err}");
                        }
                    }
                    Err(err) => {
                        warn!(
                            "{client_id}: connection error: {err}; retrying in {:?}",
                            self.reconnect_delay
                        );
                        tokio::select! {
                            _ = shutdown.wait() => break,
                            _ = tokio::time::sleep(self.reconnect_delay) => {}
                        }
                    }
                }
            }
        }

        self.close().await;
        info!("{client_id}: connection worker stopped");
    }

    /// Sends DISCONNECT if the session is up, without waiting on a dead broker.
    async fn close(&mut self) {
        let requested = self.dispatcher.sink.try_disconnect();
        if let Err(err) = requested.map_err(TransportError::Disconnect) {
            debug!("{}: {err}", self.dispatcher.client_id);
            return;
        }

        let flushed = tokio::time::timeout(DISCONNECT_TIMEOUT, async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;

        if flushed.is_err() {
            debug!("{}: broker did not see DISCONNECT in time", self.dispatcher.client_id);
        }
    }
}
