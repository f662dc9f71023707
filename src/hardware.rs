//! Adapters for the relay at the door and the UHF reader.
//!
//! The coordinators only see the [`Relay`] and [`TagReader`] traits. The
//! concrete types here cover a sysfs GPIO line and a reader that emits one
//! ASCII record per tag on a serial port.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::fs;
use tokio::io::{AsyncBufReadExt as _, BufReader, Lines};

use crate::error::HardwareError;

pub const DEFAULT_RELAY_PIN: u32 = 17;
pub const DEFAULT_GPIO_ROOT: &str = "/sys/class/gpio";

/// Alarm output. Both calls must be safe to repeat.
pub trait Relay: Send {
    fn turn_on(&mut self) -> impl Future<Output = Result<(), HardwareError>> + Send;
    fn turn_off(&mut self) -> impl Future<Output = Result<(), HardwareError>> + Send;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    pub epc: String,
    pub rssi: Option<f64>,
}

pub trait TagReader: Send {
    /// Everything seen within `timeout`. An empty list is a normal quiet cycle.
    fn read_tags(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<Tag>, HardwareError>> + Send;
}

/// Relay wired to a GPIO line exposed through sysfs.
#[derive(Debug)]
pub struct GpioRelay {
    value_path: PathBuf,
    engaged: Option<bool>,
}

impl GpioRelay {
    /// Exports `pin` if needed, configures it as an output and switches it off.
    pub async fn open(gpio_root: impl AsRef<Path>, pin: u32) -> Result<Self, HardwareError> {
        let root = gpio_root.as_ref();
        let line = root.join(format!("gpio{pin}"));
        let value_path = line.join("value");

        if fs::metadata(&value_path).await.is_err() {
            debug!("Exporting GPIO {pin}");
            fs::write(root.join("export"), pin.to_string()).await?;
            fs::write(line.join("direction"), "out").await?;
        }

        let mut relay = GpioRelay {
            value_path,
            engaged: None,
        };
        relay.turn_off().await?;
        info!("Relay ready on GPIO {pin}");
        Ok(relay)
    }

    async fn set(&mut self, on: bool) -> Result<(), HardwareError> {
        if self.engaged == Some(on) {
            debug!("Relay already {}", if on { "on" } else { "off" });
            return Ok(());
        }
        fs::write(&self.value_path, if on { "1" } else { "0" }).await?;
        self.engaged = Some(on);
        Ok(())
    }
}

impl Relay for GpioRelay {
    async fn turn_on(&mut self) -> Result<(), HardwareError> {
        info!("Relay on");
        self.set(true).await
    }

    async fn turn_off(&mut self) -> Result<(), HardwareError> {
        info!("Relay off");
        self.set(false).await
    }
}

/// Reader in ASCII output mode: one `EPC[,RSSI]` line per observation.
pub struct LineTagReader {
    source: String,
    lines: Lines<BufReader<fs::File>>,
}

impl LineTagReader {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, HardwareError> {
        let path = path.as_ref();
        let file = fs::File::open(path)
            .await
            .map_err(|e| HardwareError::Unavailable(format!("{}: {e}", path.display())))?;

        Ok(LineTagReader {
            source: path.display().to_string(),
            lines: BufReader::new(file).lines(),
        })
    }
}

impl TagReader for LineTagReader {
    async fn read_tags(&mut self, timeout: Duration) -> Result<Vec<Tag>, HardwareError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut tags = Vec::new();

        loop {
            match tokio::time::timeout_at(deadline, self.lines.next_line()).await {
                Err(_) => break,
                Ok(Ok(Some(line))) => match parse_record(&line) {
                    Ok(Some(tag)) => tags.push(tag),
                    Ok(None) => {}
                    Err(err) => warn!("{}: skipping record {line:?}: {err}", self.source),
                },
                Ok(Ok(None)) => {
                    // Nothing buffered right now; wait out the cycle.
                    tokio::time::sleep_until(deadline).await;
                    break;
                }
                Ok(Err(err)) => return Err(err.into()),
            }
        }

        Ok(tags)
    }
}

fn parse_record(line: &str) -> Result<Option<Tag>, HardwareError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let mut fields = line.splitn(2, ',');
    let epc = fields.next().unwrap_or_default().trim();
    if epc.is_empty() || !epc.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(HardwareError::InvalidData(format!("bad EPC {epc:?}")));
    }

    let rssi = match fields.next().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(
            raw.parse::<f64>()
                .map_err(|_| HardwareError::InvalidData(format!("bad RSSI {raw:?}")))?,
        ),
    };

    Ok(Some(Tag {
        epc: epc.to_ascii_uppercase(),
        rssi,
    }))
}
