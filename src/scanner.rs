use std::thread;
use std::time::Duration;

use log::{debug, error, info};

use crate::config::RfidConfig;
use crate::hardware::{Tag, TagReader};
use crate::messages::{self, TOPIC_RFID_TAGS, TagMessage, TagPayload};
use crate::mqtt::Publisher;
use crate::shutdown::Shutdown;

const DEFAULT_READ_TIMEOUT_MS: u64 = 500;
const DEFAULT_IDLE_DELAY_MS: u64 = 200;

/// Sensing loop at the exit: every tag the reader reports becomes one
/// event on the tag topic. Repeated reads are not filtered here.
pub struct Scanner<T, P> {
    reader: T,
    publisher: P,
    read_timeout: Duration,
    idle_delay: Duration,
}

impl<T, P> Scanner<T, P>
where
    T: TagReader + 'static,
    P: Publisher + 'static,
{
    pub fn new(reader: T, publisher: P, config: &RfidConfig) -> Self {
        Scanner {
            reader,
            publisher,
            read_timeout: Duration::from_millis(
                config.timeout_ms.unwrap_or(DEFAULT_READ_TIMEOUT_MS),
            ),
            idle_delay: Duration::from_millis(
                config.idle_delay_ms.unwrap_or(DEFAULT_IDLE_DELAY_MS),
            ),
        }
    }

    /// Runs the loop on its own OS thread so a slow reader never holds up
    /// the runtime that delivers bus messages.
    pub fn spawn(self, shutdown: Shutdown) -> std::io::Result<thread::JoinHandle<()>> {
        let runtime = tokio::runtime::Handle::current();
        thread::Builder::new()
            .name("rfid-scanner".to_string())
            .spawn(move || runtime.block_on(self.run(shutdown)))
    }

    pub async fn run(mut self, shutdown: Shutdown) {
        info!("RFID scanner started");
        while !shutdown.is_triggered() {
            if self.scan_once().await == 0 {
                tokio::time::sleep(self.idle_delay).await;
            }
        }
        info!("RFID scanner stopped");
    }

    /// One reader cycle. Returns how many tag events were published.
    pub async fn scan_once(&mut self) -> usize {
        let tags = match self.reader.read_tags(self.read_timeout).await {
            Ok(tags) => tags,
            Err(err) => {
                error!("Error reading tags: {err}");
                return 0;
            }
        };

        if tags.is_empty() {
            debug!("No tags found");
            return 0;
        }

        let mut published = 0;
        for tag in tags {
            match self.publish_tag(&tag).await {
                Ok(()) => {
                    info!("Published tag {} (rssi {:?})", tag.epc, tag.rssi);
                    published += 1;
                }
                Err(err) => error!("Could not publish tag {}: {err}", tag.epc),
            }
        }
        published
    }

    async fn publish_tag(&self, tag: &Tag) -> Result<(), crate::error::TransportError> {
        let message = TagMessage {
            tag: TagPayload {
                epc: tag.epc.clone(),
                rssi: tag.rssi,
            },
        };
        let payload = messages::encode(TOPIC_RFID_TAGS, &message)?;
        self.publisher.publish(TOPIC_RFID_TAGS, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use crate::alarm::tests::RecordingPublisher;
    use crate::error::HardwareError;
    use crate::messages::TagEvent;
    use crate::shutdown::{self, ShutdownTrigger};

    struct ScriptedReader {
        script: VecDeque<Result<Vec<Tag>, HardwareError>>,
        done: Option<ShutdownTrigger>,
    }

    impl TagReader for ScriptedReader {
        async fn read_tags(&mut self, _timeout: Duration) -> Result<Vec<Tag>, HardwareError> {
            match self.script.pop_front() {
                Some(result) => result,
                None => {
                    if let Some(done) = &self.done {
                        done.trigger();
                    }
                    Ok(Vec::new())
                }
            }
        }
    }

    fn tag(epc: &str) -> Tag {
        Tag {
            epc: epc.to_string(),
            rssi: Some(-50.0),
        }
    }

    fn config() -> RfidConfig {
        RfidConfig {
            device: None,
            timeout_ms: Some(1),
            idle_delay_ms: Some(1),
        }
    }

    #[tokio::test]
    async fn test_every_read_is_published() {
        let reader = ScriptedReader {
            script: VecDeque::from([Ok(vec![tag("AA01"), tag("AA01"), tag("BB02")])]),
            done: None,
        };
        let publisher = RecordingPublisher::default();
        let mut scanner = Scanner::new(reader, publisher.clone(), &config());

        assert_eq!(scanner.scan_once().await, 3);

        let sent = publisher.sent_on(TOPIC_RFID_TAGS);
        let epcs: Vec<String> = sent
            .iter()
            .map(|m| TagEvent::decode(&m.payload).unwrap().epc)
            .collect();
        assert_eq!(epcs, vec!["AA01", "AA01", "BB02"]);
    }

    #[tokio::test]
    async fn test_reader_error_is_not_fatal() {
        let (trigger, shutdown) = shutdown::channel();
        let reader = ScriptedReader {
            script: VecDeque::from([
                Err(HardwareError::Unavailable("antenna".to_string())),
                Ok(vec![]),
                Ok(vec![tag("CC03")]),
            ]),
            done: Some(trigger),
        };
        let publisher = RecordingPublisher::default();

        Scanner::new(reader, publisher.clone(), &config())
            .run(shutdown)
            .await;

        assert_eq!(publisher.sent_on(TOPIC_RFID_TAGS).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_spawned_scanner_stops_on_shutdown() {
        let (trigger, shutdown) = shutdown::channel();
        let reader = ScriptedReader {
            script: VecDeque::from([Ok(vec![tag("DD04")])]),
            done: None,
        };
        let publisher = RecordingPublisher::default();

        let handle = Scanner::new(reader, publisher.clone(), &config())
            .spawn(shutdown)
            .unwrap();
        while publisher.sent_on(TOPIC_RFID_TAGS).is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        trigger.trigger();

        tokio::task::spawn_blocking(move || handle.join().unwrap())
            .await
            .unwrap();
    }
}
