//! Alarm decision core.
//!
//! [`AlarmCoordinator`] is the only owner of the alarm state. It consumes one
//! inbound message at a time from queues fed by the bus dispatchers, so the
//! network threads never touch the state directly. Deactivation commands have
//! their own queue and are always taken before pending tag reads.
//!
//! ```text
//!   Idle --tag, not borrowed--> Armed   (relay on, publish ALARM)
//!   Idle --tag, borrowed------> Idle
//!   Armed --tag---------------> Armed   (republish with RepeatPolicy::Republish,
//!                                        or when the last announcement failed)
//!   Armed --deactivate--------> Idle    (relay off)
//!   Idle --deactivate---------> Idle
//! ```

use log::{debug, error, info, warn};
use serde_derive::Deserialize;
use tokio::sync::mpsc;

use crate::hardware::Relay;
use crate::messages::{
    self, AlarmStatusKind, AlarmStatusMessage, DeactivateMessage, TOPIC_ALARM_STATUS,
    TOPIC_DEACTIVATE_ALARM, TOPIC_RFID_TAGS, TagEvent,
};
use crate::mqtt::{BusMessage, Publisher};
use crate::shutdown::Shutdown;
use crate::storage::BorrowRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmState {
    Idle,
    Armed,
}

/// What to do with a tag the repository cannot vouch for, either because no
/// device carries it or because the lookup failed.
#[derive(Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnknownTagPolicy {
    /// Ignore it. Avoids nuisance alarms from foreign tags.
    #[default]
    FailOpen,
    /// Treat it like a device leaving without being borrowed.
    FailClosed,
}

/// Behavior for further unborrowed reads while already armed.
#[derive(Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RepeatPolicy {
    /// One announcement per arming.
    #[default]
    Suppress,
    /// Drive the relay and announce again on every read.
    Republish,
}

enum Verdict {
    Borrowed,
    NotBorrowed,
    Unknown,
}

pub struct AlarmCoordinator<R, A, P> {
    repository: R,
    relay: A,
    publisher: P,
    state: AlarmState,
    unknown_tag_policy: UnknownTagPolicy,
    repeat_policy: RepeatPolicy,
    unannounced: bool,
}

impl<R, A, P> AlarmCoordinator<R, A, P>
where
    R: BorrowRepository,
    A: Relay,
    P: Publisher,
{
    pub fn new(repository: R, relay: A, publisher: P) -> Self {
        AlarmCoordinator {
            repository,
            relay,
            publisher,
            state: AlarmState::Idle,
            unknown_tag_policy: UnknownTagPolicy::default(),
            repeat_policy: RepeatPolicy::default(),
            unannounced: false,
        }
    }

    pub fn with_unknown_tag_policy(mut self, policy: UnknownTagPolicy) -> Self {
        self.unknown_tag_policy = policy;
        self
    }

    pub fn with_repeat_policy(mut self, policy: RepeatPolicy) -> Self {
        self.repeat_policy = policy;
        self
    }

    /// Processes both queues until they close or shutdown is triggered, and
    /// returns the state it stopped in. A burst of tag reads never delays or
    /// crowds out a deactivation command.
    pub async fn run(
        mut self,
        mut tags: mpsc::Receiver<BusMessage>,
        mut commands: mpsc::Receiver<BusMessage>,
        mut shutdown: Shutdown,
    ) -> AlarmState {
        info!("Alarm coordinator started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                Some(message) = commands.recv() => {
                    self.handle(message).await;
                }
                Some(message) = tags.recv() => {
                    self.handle(message).await;
                }
                else => {
                    debug!("Alarm inboxes closed");
                    break;
                }
            }
        }

        if self.state == AlarmState::Armed {
            warn!("Alarm coordinator stopping while armed; relay left engaged");
        }
        info!("Alarm coordinator stopped");
        self.state
    }

    /// Applies one inbound message and returns the resulting state.
    pub async fn handle(&mut self, message: BusMessage) -> AlarmState {
        debug!(
            "Alarm coordinator received {:?} on {}",
            String::from_utf8_lossy(&message.payload),
            message.topic
        );

        match message.topic.as_str() {
            TOPIC_RFID_TAGS => match TagEvent::decode(&message.payload) {
                Ok(event) => self.on_tag(event).await,
                Err(err) => error!("Dropping tag event: {err}"),
            },
            TOPIC_DEACTIVATE_ALARM => {
                match messages::decode::<DeactivateMessage>(&message.topic, &message.payload) {
                    Ok(_) => self.on_deactivate().await,
                    Err(err) => error!("Dropping deactivation command: {err}"),
                }
            }
            other => warn!("Alarm coordinator ignoring message on {other}"),
        }

        self.state
    }

    async fn on_tag(&mut self, event: TagEvent) {
        if self.state == AlarmState::Armed
            && self.repeat_policy == RepeatPolicy::Suppress
            && !self.unannounced
        {
            debug!("Already armed, not announcing tag {} again", event.epc);
            return;
        }

        match verdict(&self.repository, &event.epc).await {
            Verdict::Borrowed => {
                info!("Device with tag {} is borrowed and may leave", event.epc);
            }
            Verdict::NotBorrowed => {
                info!(
                    "Device with tag {} is not borrowed (read at {}, rssi {:?})",
                    event.epc,
                    event.received_at.format("%H:%M:%S%.3f"),
                    event.rssi
                );
                self.arm(AlarmStatusMessage::unborrowed(&event.epc)).await;
            }
            Verdict::Unknown => match self.unknown_tag_policy {
                UnknownTagPolicy::FailOpen => {
                    debug!("Ignoring unknown tag {}", event.epc);
                }
                UnknownTagPolicy::FailClosed => {
                    let message = AlarmStatusMessage {
                        status: AlarmStatusKind::Alarm,
                        message: format!("Unknown tag number {} at the exit", event.epc),
                        tag: Some(event.epc.clone()),
                    };
                    self.arm(message).await;
                }
            },
        }
    }

    async fn arm(&mut self, status: AlarmStatusMessage) {
        if let Err(err) = self.relay.turn_on().await {
            error!("Could not engage relay: {err}");
            return;
        }

        if self.state == AlarmState::Idle {
            info!("Alarm armed");
            self.state = AlarmState::Armed;
        }

        let published = match messages::encode(TOPIC_ALARM_STATUS, &status) {
            Ok(payload) => self.publisher.publish(TOPIC_ALARM_STATUS, payload).await,
            Err(err) => Err(err),
        };
        match published {
            Ok(()) => {
                info!("Published alarm status: {}", status.message);
                self.unannounced = false;
            }
            Err(err) => {
                error!("Could not announce alarm, retrying on next read: {err}");
                self.unannounced = true;
            }
        }
    }

    async fn on_deactivate(&mut self) {
        if self.state == AlarmState::Idle {
            debug!("Deactivation received while idle, nothing to do");
            return;
        }

        match self.relay.turn_off().await {
            Ok(()) => {
                info!("Alarm deactivated");
                self.state = AlarmState::Idle;
                self.unannounced = false;
            }
            Err(err) => error!("Could not release relay, staying armed: {err}"),
        }
    }
}

async fn verdict<R: BorrowRepository>(repository: &R, epc: &str) -> Verdict {
    match repository.is_borrowed(epc).await {
        Ok(Some(true)) => Verdict::Borrowed,
        Ok(Some(false)) => Verdict::NotBorrowed,
        Ok(None) => {
            error!("Tag {epc} does not belong to any known device");
            Verdict::Unknown
        }
        Err(err) => {
            error!("Borrow state lookup for tag {epc} failed: {err}");
            Verdict::Unknown
        }
    }
}
