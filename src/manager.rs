use std::future::Future;
use std::io;
use std::sync::Arc;

use anyhow::Context as _;
use futures::future::join_all;
use log::{error, info, warn};
use tokio::io::BufReader;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::alarm::AlarmCoordinator;
use crate::config::AppConfig;
use crate::hardware::{DEFAULT_GPIO_ROOT, DEFAULT_RELAY_PIN, GpioRelay, LineTagReader};
use crate::kiosk::{self, BorrowDesk, Console, KioskCoordinator, PasswordChecker};
use crate::messages::{TOPIC_ALARM_STATUS, TOPIC_DEACTIVATE_ALARM, TOPIC_RFID_TAGS};
use crate::mqtt::{BusWorker, MqttClient};
use crate::scanner::Scanner;
use crate::shutdown::{self, ShutdownTrigger};
use crate::storage::{Database, SqliteRepository};

/// Runs one node of the system until Ctrl-C or SIGTERM (or, for the kiosk,
/// the end of operator input).
pub struct Manager {
    config: AppConfig,
    trigger: Arc<ShutdownTrigger>,
}

impl Manager {
    pub fn new(config: AppConfig) -> Self {
        let (trigger, _) = shutdown::channel();
        Manager {
            config,
            trigger: Arc::new(trigger),
        }
    }

    /// Triggers shutdown on the first Ctrl-C or SIGTERM.
    fn watch_stop_signals(&self) -> anyhow::Result<JoinHandle<()>> {
        let terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        Ok(spawn_stop_watcher(self.trigger.clone(), stop_requested(terminate)))
    }

    fn connect(&self, client_id: &str) -> anyhow::Result<(MqttClient, JoinHandle<()>)> {
        let (client, worker) = MqttClient::connect(&self.config.mqtt, client_id)
            .with_context(|| format!("MQTT client {client_id}"))?;
        Ok((client, self.spawn_worker(worker)))
    }

    fn spawn_worker(&self, worker: BusWorker) -> JoinHandle<()> {
        tokio::spawn(worker.run(self.trigger.subscribe()))
    }

    async fn open_repository(&self) -> anyhow::Result<(Arc<Database>, SqliteRepository)> {
        let config = self
            .config
            .database
            .as_ref()
            .context("missing [database] section")?;
        let db = Arc::new(
            Database::open(config)
                .await
                .with_context(|| format!("opening database {}", config.path))?,
        );
        Ok((db.clone(), SqliteRepository::new(db)))
    }

    pub async fn run_rfid(self) -> anyhow::Result<()> {
        let rfid = self.config.rfid.clone().unwrap_or_default();
        let device = rfid.device.as_deref().context("rfid.device is not set")?;
        let reader = LineTagReader::open(device).await?;

        let ids = self.config.mqtt.client_ids();
        let (publisher, worker) = self.connect(&ids.rfid_publisher)?;
        let signals = self.watch_stop_signals()?;

        let scanner = Scanner::new(reader, publisher, &rfid)
            .spawn(self.trigger.subscribe())
            .context("starting scanner thread")?;

        self.trigger.subscribe().wait().await;

        let joined = tokio::task::spawn_blocking(move || scanner.join()).await?;
        if joined.is_err() {
            error!("Scanner thread panicked");
        }
        finish(vec![worker, signals]).await;
        Ok(())
    }

    pub async fn run_alarm(self) -> anyhow::Result<()> {
        let (db, repository) = self.open_repository().await?;
        let alarm = self.config.alarm.clone().unwrap_or_default();
        let relay = GpioRelay::open(
            alarm.gpio_root.as_deref().unwrap_or(DEFAULT_GPIO_ROOT),
            alarm.relay_pin.unwrap_or(DEFAULT_RELAY_PIN),
        )
        .await
        .context("opening relay")?;

        // Deactivations get their own queue so a burst of reads can never
        // fill it and get the operator's command dropped.
        let ids = self.config.mqtt.client_ids();
        let (rfid_subscriber, rfid_worker) = self.connect(&ids.alarm_rfid_subscriber)?;
        let tags = rfid_subscriber.subscribe(TOPIC_RFID_TAGS).await?;
        let (gui_connection, gui_worker) = self.connect(&ids.alarm_gui_subscriber)?;
        let commands = gui_connection.subscribe(TOPIC_DEACTIVATE_ALARM).await?;

        let signals = self.watch_stop_signals()?;

        let coordinator = AlarmCoordinator::new(repository, relay, gui_connection)
            .with_unknown_tag_policy(alarm.unknown_tag_policy.unwrap_or_default())
            .with_repeat_policy(alarm.repeat_policy.unwrap_or_default());
        coordinator
            .run(tags, commands, self.trigger.subscribe())
            .await;

        finish(vec![rfid_worker, gui_worker, signals]).await;
        db.close().await;
        Ok(())
    }

    pub async fn run_kiosk(self) -> anyhow::Result<()> {
        let password = self
            .config
            .kiosk
            .as_ref()
            .map(|k| k.admin_password.clone())
            .context("missing [kiosk] section")?;
        let (db, repository) = self.open_repository().await?;

        let ids = self.config.mqtt.client_ids();
        let (subscriber, subscriber_worker) = self.connect(&ids.gui_subscriber)?;
        let inbox = subscriber.subscribe(TOPIC_ALARM_STATUS).await?;
        let (publisher, publisher_worker) = self.connect(&ids.gui_publisher)?;

        let signals = self.watch_stop_signals()?;

        let (alerts_tx, alerts) = mpsc::unbounded_channel();
        let relay = tokio::spawn(kiosk::relay_alerts(
            inbox,
            alerts_tx,
            self.trigger.subscribe(),
        ));

        let console = Console::new(
            KioskCoordinator::new(publisher, PasswordChecker::new(password)),
            BorrowDesk::new(repository),
        );
        console
            .run(
                BufReader::new(tokio::io::stdin()),
                alerts,
                self.trigger.subscribe(),
            )
            .await;
        self.trigger.trigger();

        finish(vec![subscriber_worker, publisher_worker, relay, signals]).await;
        db.close().await;
        Ok(())
    }
}

async fn stop_requested(mut terminate: Signal) -> io::Result<&'static str> {
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|()| "Ctrl-C"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

fn spawn_stop_watcher<F>(trigger: Arc<ShutdownTrigger>, stop: F) -> JoinHandle<()>
where
    F: Future<Output = io::Result<&'static str>> + Send + 'static,
{
    let mut shutdown = trigger.subscribe();
    tokio::spawn(async move {
        tokio::select! {
            stopped = stop => match stopped {
                Ok(name) => {
                    info!("{name} received, shutting down");
                    trigger.trigger();
                }
                Err(err) => error!("Unable to listen for stop signals: {err}"),
            },
            _ = shutdown.wait() => {}
        }
    })
}

async fn finish(handles: Vec<JoinHandle<()>>) {
    for result in join_all(handles).await {
        if let Err(err) = result {
            warn!("Task ended abnormally: {err}");
        }
    }
    info!("Exiting manager event loop");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use rumqttc::ConnectReturnCode;

    use crate::alarm::AlarmState;
    use crate::alarm::tests::{FakeRelay, FakeRepository, RecordingPublisher};
    use crate::mqtt::tests::{connack, dispatcher, publish};

    #[tokio::test]
    async fn test_alarm_still_raised_after_reconnect() {
        let (dispatcher, sink) = dispatcher();
        let (tx, mut inbox) = mpsc::channel(8);
        dispatcher.add_route(TOPIC_RFID_TAGS, tx);

        dispatcher
            .handle_event(&connack(ConnectReturnCode::Success))
            .unwrap();
        // Broker restarts; the session comes back without our subscription.
        dispatcher
            .handle_event(&connack(ConnectReturnCode::Success))
            .unwrap();
        assert_eq!(sink.calls.lock().unwrap().len(), 2);
        assert_eq!(sink.calls.lock().unwrap()[1], vec![TOPIC_RFID_TAGS.to_string()]);

        dispatcher
            .handle_event(&publish(TOPIC_RFID_TAGS, br#"{"tag": {"epc": "E2F1"}}"#))
            .unwrap();

        let publisher = RecordingPublisher::default();
        let mut coordinator = AlarmCoordinator::new(
            FakeRepository::with(&[("E2F1", false)]),
            FakeRelay::default(),
            publisher.clone(),
        );
        let message = inbox.recv().await.unwrap();
        assert_eq!(coordinator.handle(message).await, AlarmState::Armed);
        assert_eq!(publisher.sent_on(TOPIC_ALARM_STATUS).len(), 1);
    }

    #[tokio::test]
    async fn test_manager_requires_database_for_alarm() {
        let config = AppConfig::from_toml(
            r#"
            [mqtt]
            host = "localhost"
            "#,
        )
        .unwrap();

        let err = Manager::new(config).run_alarm().await.unwrap_err();
        assert!(err.to_string().contains("[database]"));
    }

    #[tokio::test]
    async fn test_stop_signal_triggers_shutdown() {
        let (trigger, mut stopped) = shutdown::channel();
        let watcher =
            spawn_stop_watcher(Arc::new(trigger), async { Ok::<_, io::Error>("SIGTERM") });

        tokio::time::timeout(Duration::from_secs(5), stopped.wait())
            .await
            .unwrap();
        watcher.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_watcher_exits_with_node() {
        let (trigger, _) = shutdown::channel();
        let trigger = Arc::new(trigger);
        let never = std::future::pending::<io::Result<&str>>();
        let watcher = spawn_stop_watcher(trigger.clone(), never);

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(5), watcher)
            .await
            .unwrap()
            .unwrap();
    }
}
