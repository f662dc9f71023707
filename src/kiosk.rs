//! Kiosk side of the protocol: operator alerts, authorized deactivation and
//! the borrow/return desk.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use subtle::ConstantTimeEq as _;
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _};
use tokio::sync::mpsc;

use crate::error::{KioskError, RepositoryError};
use crate::messages::{self, AlarmStatusMessage, DeactivateMessage, TOPIC_DEACTIVATE_ALARM};
use crate::mqtt::{BusMessage, Publisher};
use crate::shutdown::Shutdown;
use crate::storage::{BorrowRepository, Device, SqliteRepository};

#[derive(Debug, Clone, PartialEq)]
pub struct OperatorAlert {
    pub message: String,
    pub tag: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl OperatorAlert {
    /// Every alarm message becomes an alert, even one that fails to decode.
    pub fn from_message(message: &BusMessage) -> Self {
        match messages::decode::<AlarmStatusMessage>(&message.topic, &message.payload) {
            Ok(status) => OperatorAlert {
                message: status.message,
                tag: status.tag,
                received_at: Utc::now(),
            },
            Err(err) => {
                warn!("Alarm message did not match schema: {err}");
                OperatorAlert {
                    message: String::from_utf8_lossy(&message.payload).into_owned(),
                    tag: None,
                    received_at: Utc::now(),
                }
            }
        }
    }
}

/// Forwards one alert per alarm-status message until shutdown. Repeats are
/// deliberately kept: each message is a separate event at the door.
pub async fn relay_alerts(
    mut inbox: mpsc::Receiver<BusMessage>,
    alerts: mpsc::UnboundedSender<OperatorAlert>,
    mut shutdown: Shutdown,
) {
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            message = inbox.recv() => match message {
                Some(message) => {
                    debug!(
                        "Received alarm status {:?}",
                        String::from_utf8_lossy(&message.payload)
                    );
                    if alerts.send(OperatorAlert::from_message(&message)).is_err() {
                        debug!("Alert consumer gone");
                        break;
                    }
                }
                None => break,
            }
        }
    }
}

pub struct PasswordChecker {
    admin_password: String,
}

impl PasswordChecker {
    pub fn new(admin_password: impl Into<String>) -> Self {
        PasswordChecker {
            admin_password: admin_password.into(),
        }
    }

    pub fn verify(&self, entered: &str) -> bool {
        self.admin_password.as_bytes().ct_eq(entered.as_bytes()).into()
    }
}

pub struct KioskCoordinator<P> {
    publisher: P,
    checker: PasswordChecker,
}

impl<P: Publisher> KioskCoordinator<P> {
    pub fn new(publisher: P, checker: PasswordChecker) -> Self {
        KioskCoordinator { publisher, checker }
    }

    pub fn authorize(&self, password: &str) -> Result<(), KioskError> {
        if self.checker.verify(password) {
            Ok(())
        } else {
            warn!("Wrong admin password entered");
            Err(KioskError::Unauthorized)
        }
    }

    /// Publishes a deactivation command, but only once the password checks out.
    pub async fn request_deactivation(&self, password: &str) -> Result<(), KioskError> {
        self.authorize(password)?;

        let payload = messages::encode(TOPIC_DEACTIVATE_ALARM, &DeactivateMessage::new())?;
        self.publisher.publish(TOPIC_DEACTIVATE_ALARM, payload).await?;
        info!("Deactivation command sent");
        Ok(())
    }
}

/// Borrow and return at the counter. The only writer of borrow state.
pub struct BorrowDesk {
    repository: SqliteRepository,
}

impl BorrowDesk {
    pub fn new(repository: SqliteRepository) -> Self {
        BorrowDesk { repository }
    }

    pub async fn borrow(&self, card_uid: &str, qr_code: &str) -> Result<Device, KioskError> {
        let borrower = self
            .repository
            .borrower_by_card_uid(card_uid)
            .await?
            .ok_or_else(|| KioskError::UnknownCard(card_uid.to_string()))?;
        let device = self.device(qr_code).await?;

        let result = self.repository.borrow_device(device.id, borrower.id).await;
        self.refresh().await;
        result?;

        info!("{} borrowed {}", borrower.name, device.name);
        self.checked(qr_code).await
    }

    pub async fn return_device(&self, qr_code: &str) -> Result<Device, KioskError> {
        let device = self.device(qr_code).await?;

        let result = self.repository.return_device(device.id).await;
        self.refresh().await;
        result?;

        info!("{} returned", device.name);
        self.checked(qr_code).await
    }

    pub async fn devices(&self) -> Result<Vec<Device>, KioskError> {
        Ok(self.repository.all_devices().await?)
    }

    pub async fn name_for_qr_code(&self, qr_code: &str) -> Result<String, KioskError> {
        self.repository
            .name_for_qr_code(qr_code)
            .await?
            .ok_or_else(|| KioskError::UnknownDevice(qr_code.to_string()))
    }

    pub async fn add_device(
        &self,
        name: &str,
        qr_code: &str,
        tag_nr: Option<&str>,
    ) -> Result<Device, KioskError> {
        self.repository.add_device(name, qr_code, tag_nr).await?;
        self.device(qr_code).await
    }

    pub async fn assign_tag(&self, qr_code: &str, tag_nr: &str) -> Result<Device, KioskError> {
        let device = self.device(qr_code).await?;
        self.repository.assign_tag(device.id, tag_nr).await?;
        self.device(qr_code).await
    }

    pub async fn delete_device(&self, name: &str) -> Result<(), KioskError> {
        let id = self
            .repository
            .id_for_device_name(name)
            .await?
            .ok_or_else(|| KioskError::UnknownDevice(name.to_string()))?;
        Ok(self.repository.delete_device(id).await?)
    }

    pub async fn add_borrower(
        &self,
        card_uid: &str,
        matriculation_number: &str,
        name: &str,
    ) -> Result<(), KioskError> {
        self.repository
            .add_borrower(name, matriculation_number, None, Some(card_uid))
            .await?;
        Ok(())
    }

    async fn device(&self, qr_code: &str) -> Result<Device, KioskError> {
        self.repository
            .find_by_qr_code(qr_code)
            .await?
            .ok_or_else(|| KioskError::UnknownDevice(qr_code.to_string()))
    }

    /// Re-reads a device after a write and flags a broken borrow record.
    async fn checked(&self, qr_code: &str) -> Result<Device, KioskError> {
        let device = self.device(qr_code).await?;
        if !device.is_consistent() {
            error!(
                "Device {} has borrower details but is not borrowed",
                device.name
            );
        }
        Ok(device)
    }

    // Long-lived connections go stale; reopen after every write.
    async fn refresh(&self) {
        if let Err(err) = self.repository.refresh_connection().await {
            warn!("Could not refresh database connection: {err}");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Borrow { card_uid: String, qr_code: String },
    Return { qr_code: String },
    Deactivate { password: String },
    Show { qr_code: String },
    Devices,
    Admin { password: String, action: AdminAction },
    Help,
}

/// Inventory changes, only accepted with the admin password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminAction {
    AddDevice {
        qr_code: String,
        tag_nr: Option<String>,
        name: String,
    },
    AssignTag { qr_code: String, tag_nr: String },
    DeleteDevice { name: String },
    AddBorrower {
        card_uid: String,
        matriculation_number: String,
        name: String,
    },
}

impl AdminAction {
    // Names come last so they may contain spaces.
    fn parse(action: &str, args: &[&str]) -> Option<Self> {
        match (action, args) {
            ("add-device", [qr_code, tag_nr, name @ ..]) if !name.is_empty() => {
                Some(AdminAction::AddDevice {
                    qr_code: qr_code.to_string(),
                    tag_nr: (*tag_nr != "-").then(|| tag_nr.to_string()),
                    name: name.join(" "),
                })
            }
            ("assign-tag", [qr_code, tag_nr]) => Some(AdminAction::AssignTag {
                qr_code: qr_code.to_string(),
                tag_nr: tag_nr.to_string(),
            }),
            ("delete-device", name) if !name.is_empty() => Some(AdminAction::DeleteDevice {
                name: name.join(" "),
            }),
            ("add-borrower", [card_uid, matriculation_number, name @ ..]) if !name.is_empty() => {
                Some(AdminAction::AddBorrower {
                    card_uid: card_uid.to_string(),
                    matriculation_number: matriculation_number.to_string(),
                    name: name.join(" "),
                })
            }
            _ => None,
        }
    }
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut words = line.split_whitespace();
        let command = words.next().unwrap_or_default();
        let args: Vec<&str> = words.collect();

        match (command, args.as_slice()) {
            ("borrow", [card_uid, qr_code]) => Ok(Command::Borrow {
                card_uid: card_uid.to_string(),
                qr_code: qr_code.to_string(),
            }),
            ("return", [qr_code]) => Ok(Command::Return {
                qr_code: qr_code.to_string(),
            }),
            ("deactivate", [password]) => Ok(Command::Deactivate {
                password: password.to_string(),
            }),
            ("show", [qr_code]) => Ok(Command::Show {
                qr_code: qr_code.to_string(),
            }),
            ("devices", []) => Ok(Command::Devices),
            ("admin", [password, action, rest @ ..]) => AdminAction::parse(action, rest)
                .map(|action| Command::Admin {
                    password: password.to_string(),
                    action,
                })
                .ok_or_else(|| format!("unrecognized admin command {action:?}")),
            ("help", []) | ("", []) => Ok(Command::Help),
            _ => Err(format!("unrecognized command {line:?}, try `help`")),
        }
    }
}

const HELP: &str = "\
commands:
  borrow <card_uid> <qr_code>
  return <qr_code>
  show <qr_code>
  devices
  deactivate <password>
  admin <password> add-device <qr_code> <tag_nr|-> <name>
  admin <password> assign-tag <qr_code> <tag_nr>
  admin <password> delete-device <name>
  admin <password> add-borrower <card_uid> <matriculation_number> <name>";

/// Line-oriented front end for the kiosk, standing in for the touch screen.
pub struct Console<P> {
    coordinator: KioskCoordinator<P>,
    desk: BorrowDesk,
}

impl<P: Publisher> Console<P> {
    pub fn new(coordinator: KioskCoordinator<P>, desk: BorrowDesk) -> Self {
        Console { coordinator, desk }
    }

    pub async fn run<I: AsyncBufRead + Unpin>(
        &self,
        input: I,
        mut alerts: mpsc::UnboundedReceiver<OperatorAlert>,
        mut shutdown: Shutdown,
    ) {
        let mut lines = input.lines();
        println!("{HELP}");
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                Some(alert) = alerts.recv() => {
                    warn!(
                        "ALARM at {} (tag {}): {}",
                        alert.received_at.format("%H:%M:%S"),
                        alert.tag.as_deref().unwrap_or("?"),
                        alert.message
                    );
                    println!("!!! {} -- enter `deactivate <password>` to silence", alert.message);
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => println!("{}", self.execute(&line).await),
                    Ok(None) => {
                        debug!("Console input closed");
                        break;
                    }
                    Err(err) => {
                        warn!("Console input error: {err}");
                        break;
                    }
                }
            }
        }
    }

    /// Runs one operator command and returns the text to show.
    pub async fn execute(&self, line: &str) -> String {
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(err) => return err,
        };

        let result = match command {
            Command::Borrow { card_uid, qr_code } => self
                .desk
                .borrow(&card_uid, &qr_code)
                .await
                .map(|d| format!("{} borrowed", d.name)),
            Command::Return { qr_code } => self
                .desk
                .return_device(&qr_code)
                .await
                .map(|d| format!("{} returned", d.name)),
            Command::Deactivate { password } => self
                .coordinator
                .request_deactivation(&password)
                .await
                .map(|()| "alarm deactivation sent".to_string()),
            Command::Devices => self.desk.devices().await.map(|devices| {
                devices
                    .iter()
                    .map(|d| {
                        let state = if d.is_borrowed { "borrowed" } else { "available" };
                        format!("{:<24} {:<12} {}", d.name, d.qr_code, state)
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            }),
            Command::Show { qr_code } => self.desk.name_for_qr_code(&qr_code).await,
            Command::Admin { password, action } => match self.coordinator.authorize(&password) {
                Ok(()) => self.administer(action).await,
                Err(err) => Err(err),
            },
            Command::Help => Ok(HELP.to_string()),
        };

        match result {
            Ok(text) => text,
            Err(KioskError::Repository(RepositoryError::AlreadyBorrowed(name))) => {
                format!("{name} is already borrowed")
            }
            Err(err) => format!("error: {err}"),
        }
    }

    async fn administer(&self, action: AdminAction) -> Result<String, KioskError> {
        match action {
            AdminAction::AddDevice {
                qr_code,
                tag_nr,
                name,
            } => {
                let device = self
                    .desk
                    .add_device(&name, &qr_code, tag_nr.as_deref())
                    .await?;
                Ok(format!("added {}", device.name))
            }
            AdminAction::AssignTag { qr_code, tag_nr } => {
                let device = self.desk.assign_tag(&qr_code, &tag_nr).await?;
                Ok(format!("{} now carries tag {tag_nr}", device.name))
            }
            AdminAction::DeleteDevice { name } => {
                self.desk.delete_device(&name).await?;
                Ok(format!("deleted {name}"))
            }
            AdminAction::AddBorrower {
                card_uid,
                matriculation_number,
                name,
            } => {
                self.desk
                    .add_borrower(&card_uid, &matriculation_number, &name)
                    .await?;
                Ok(format!("added borrower {name}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::alarm::tests::RecordingPublisher;
    use crate::messages::TOPIC_ALARM_STATUS;
    use crate::storage::Database;

    fn alarm_message(payload: &[u8]) -> BusMessage {
        BusMessage {
            topic: TOPIC_ALARM_STATUS.to_string(),
            payload: payload.to_vec(),
        }
    }

    async fn desk() -> (BorrowDesk, SqliteRepository) {
        let repository = SqliteRepository::new(Arc::new(Database::in_memory().await.unwrap()));
        repository
            .add_device("Laptop 7", "QR-L7", Some("E2L7"))
            .await
            .unwrap();
        repository
            .add_borrower("Ada", "100200", None, Some("04AD"))
            .await
            .unwrap();
        (BorrowDesk::new(repository.clone()), repository)
    }

    #[test]
    fn test_password_checker() {
        let checker = PasswordChecker::new("hunter2");
        assert!(checker.verify("hunter2"));
        assert!(!checker.verify("hunter"));
        assert!(!checker.verify(""));
    }

    #[tokio::test]
    async fn test_wrong_password_publishes_nothing() {
        let publisher = RecordingPublisher::default();
        let kiosk = KioskCoordinator::new(publisher.clone(), PasswordChecker::new("hunter2"));

        assert!(matches!(
            kiosk.request_deactivation("letmein").await,
            Err(KioskError::Unauthorized)
        ));
        assert!(publisher.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_authorized_deactivation_publishes_command() {
        let publisher = RecordingPublisher::default();
        let kiosk = KioskCoordinator::new(publisher.clone(), PasswordChecker::new("hunter2"));

        kiosk.request_deactivation("hunter2").await.unwrap();

        let sent = publisher.sent_on(TOPIC_DEACTIVATE_ALARM);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, br#"{"alarm_status":"DEACTIVATE"}"#.to_vec());
    }

    #[tokio::test]
    async fn test_every_alarm_message_raises_an_alert() {
        let (tx, rx) = mpsc::channel(8);
        let (alerts_tx, mut alerts) = mpsc::unbounded_channel();
        let (_trigger, shutdown) = crate::shutdown::channel();

        let status = br#"{"status": "ALARM", "message": "Device with tag number E2 is not borrowed", "tag": "E2"}"#;
        tx.send(alarm_message(status)).await.unwrap();
        tx.send(alarm_message(status)).await.unwrap();
        tx.send(alarm_message(b"{'status': 'ALARM'}")).await.unwrap();
        drop(tx);

        relay_alerts(rx, alerts_tx, shutdown).await;

        let first = alerts.recv().await.unwrap();
        assert_eq!(first.tag.as_deref(), Some("E2"));
        assert_eq!(alerts.recv().await.unwrap().message, first.message);
        assert_eq!(alerts.recv().await.unwrap().message, "{'status': 'ALARM'}");
        assert!(alerts.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_borrow_then_return() {
        let (desk, repository) = desk().await;

        let device = desk.borrow("04AD", "QR-L7").await.unwrap();
        assert!(device.is_borrowed);
        assert_eq!(repository.is_borrowed("E2L7").await.unwrap(), Some(true));

        let device = desk.return_device("QR-L7").await.unwrap();
        assert!(!device.is_borrowed);
        assert!(device.is_consistent());
        assert_eq!(repository.is_borrowed("E2L7").await.unwrap(), Some(false));
    }

    #[tokio::test]
    async fn test_borrow_rejects_unknown_card_and_device() {
        let (desk, _) = desk().await;

        assert!(matches!(
            desk.borrow("04FF", "QR-L7").await,
            Err(KioskError::UnknownCard(_))
        ));
        assert!(matches!(
            desk.borrow("04AD", "QR-XX").await,
            Err(KioskError::UnknownDevice(_))
        ));
        assert!(matches!(
            desk.return_device("QR-L7").await,
            Err(KioskError::Repository(RepositoryError::NotBorrowed(_)))
        ));
    }

    #[test]
    fn test_command_parse() {
        assert_eq!(
            Command::parse("borrow 04AD QR-L7"),
            Ok(Command::Borrow {
                card_uid: "04AD".to_string(),
                qr_code: "QR-L7".to_string()
            })
        );
        assert_eq!(
            Command::parse("  return QR-L7 "),
            Ok(Command::Return {
                qr_code: "QR-L7".to_string()
            })
        );
        assert_eq!(Command::parse("devices"), Ok(Command::Devices));
        assert_eq!(
            Command::parse("admin pw add-device QR-9 - Lab Scope 2"),
            Ok(Command::Admin {
                password: "pw".to_string(),
                action: AdminAction::AddDevice {
                    qr_code: "QR-9".to_string(),
                    tag_nr: None,
                    name: "Lab Scope 2".to_string(),
                },
            })
        );
        assert!(Command::parse("admin pw delete-device").is_err());
        assert_eq!(Command::parse(""), Ok(Command::Help));
        assert!(Command::parse("borrow 04AD").is_err());
        assert!(Command::parse("reboot").is_err());
    }

    #[tokio::test]
    async fn test_console_session() {
        let (desk, _) = desk().await;
        let publisher = RecordingPublisher::default();
        let console = Console::new(
            KioskCoordinator::new(publisher.clone(), PasswordChecker::new("hunter2")),
            desk,
        );

        assert_eq!(console.execute("borrow 04AD QR-L7").await, "Laptop 7 borrowed");
        assert_eq!(
            console.execute("borrow 04AD QR-L7").await,
            "Laptop 7 is already borrowed"
        );
        assert!(console.execute("devices").await.contains("borrowed"));
        assert_eq!(console.execute("deactivate nope").await, "error: password rejected");
        assert_eq!(
            console.execute("deactivate hunter2").await,
            "alarm deactivation sent"
        );
        assert_eq!(publisher.sent_on(TOPIC_DEACTIVATE_ALARM).len(), 1);
    }

    #[tokio::test]
    async fn test_console_admin_commands() {
        let (desk, repository) = desk().await;
        let console = Console::new(
            KioskCoordinator::new(RecordingPublisher::default(), PasswordChecker::new("pw")),
            desk,
        );

        assert_eq!(
            console.execute("admin nope add-device QR-S2 - Scope 2").await,
            "error: password rejected"
        );
        assert_eq!(
            console.execute("admin pw add-device QR-S2 - Scope 2").await,
            "added Scope 2"
        );
        assert_eq!(repository.is_borrowed("E2S2").await.unwrap(), None);
        assert_eq!(
            console.execute("admin pw assign-tag QR-S2 E2S2").await,
            "Scope 2 now carries tag E2S2"
        );
        assert_eq!(repository.is_borrowed("E2S2").await.unwrap(), Some(false));
        assert_eq!(console.execute("show QR-S2").await, "Scope 2");

        assert_eq!(
            console.execute("admin pw add-borrower 04BB 100300 Grace Hopper").await,
            "added borrower Grace Hopper"
        );
        assert_eq!(console.execute("borrow 04BB QR-S2").await, "Scope 2 borrowed");

        assert_eq!(
            console.execute("admin pw delete-device Laptop 7").await,
            "deleted Laptop 7"
        );
        assert!(console.execute("show QR-L7").await.starts_with("error: unknown device"));
    }

    #[tokio::test]
    async fn test_console_stops_on_shutdown_while_input_is_idle() {
        let (desk, _) = desk().await;
        let console = Console::new(
            KioskCoordinator::new(RecordingPublisher::default(), PasswordChecker::new("pw")),
            desk,
        );
        let (_alerts_tx, alerts) = mpsc::unbounded_channel();
        let (trigger, shutdown) = crate::shutdown::channel();
        // Writer stays open and silent, like a terminal nobody types into.
        let (_terminal, input) = tokio::io::duplex(64);

        let stop = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.trigger();
        };
        let running = tokio::time::timeout(
            Duration::from_secs(5),
            console.run(tokio::io::BufReader::new(input), alerts, shutdown),
        );
        let ((), finished) = tokio::join!(stop, running);
        assert!(finished.is_ok());
    }

    #[tokio::test]
    async fn test_console_stops_at_end_of_input() {
        let (desk, _) = desk().await;
        let console = Console::new(
            KioskCoordinator::new(RecordingPublisher::default(), PasswordChecker::new("pw")),
            desk,
        );
        let (_alerts_tx, alerts) = mpsc::unbounded_channel();
        let (_trigger, shutdown) = crate::shutdown::channel();

        let input: &[u8] = b"return QR-L7\nhelp\n";
        console.run(input, alerts, shutdown).await;
    }
}
