//! Output channel adapters
//!
//! An [`EventSink`] is the writable side of one client stream. Records use
//! the Server-Sent-Events framing:
//!
//! ```text
//! event: signal
//! data: {"family":"signal","type":"progress",...}
//!
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Writable output channel for one stream
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Write one serialized event, tagged with its family
    async fn write(&self, payload: &str, tag: Option<&str>) -> Result<(), TransportError>;

    /// Signal end of stream; later writes fail
    async fn end(&self);

    fn is_closed(&self) -> bool;

    /// Resolves once the receiving side has gone away
    async fn closed(&self) {
        std::future::pending::<()>().await
    }
}

/// A decoded SSE record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseRecord {
    pub event: Option<String>,
    pub data: String,
}

/// Frame a payload as an SSE record
pub fn format_record(payload: &str, tag: Option<&str>) -> String {
    let mut record = String::with_capacity(payload.len() + 32);
    if let Some(tag) = tag {
        record.push_str("event: ");
        record.push_str(tag);
        record.push('\n');
    }
    for line in payload.split('\n') {
        record.push_str("data: ");
        record.push_str(line);
        record.push('\n');
    }
    record.push('\n');
    record
}

/// Decode a stream of SSE records
///
/// Comment lines and unknown fields are ignored; a trailing record without
/// its blank-line terminator is dropped.
pub fn parse_records(text: &str) -> Vec<SseRecord> {
    let mut records = Vec::new();
    let mut current = SseRecord::default();
    let mut data_lines: Vec<&str> = Vec::new();
    let mut has_fields = false;

    for line in text.lines() {
        if line.is_empty() {
            if has_fields {
                current.data = data_lines.join("\n");
                records.push(std::mem::take(&mut current));
                data_lines.clear();
                has_fields = false;
            }
            continue;
        }
        if line.starts_with(':') {
            continue;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => {
                current.event = Some(value.to_string());
                has_fields = true;
            }
            "data" => {
                data_lines.push(value);
                has_fields = true;
            }
            _ => {}
        }
    }

    records
}

/// Sink backed by a bounded in-process channel
///
/// The receiver typically feeds an HTTP response body. Dropping the
/// receiver closes the sink.
pub struct ChannelSink {
    tx: Mutex<Option<mpsc::Sender<String>>>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    fn sender(&self) -> Option<mpsc::Sender<String>> {
        self.tx.lock().clone()
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn write(&self, payload: &str, tag: Option<&str>) -> Result<(), TransportError> {
        let tx = self.sender().ok_or(TransportError::ChannelClosed)?;
        tx.send(format_record(payload, tag))
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }

    async fn end(&self) {
        self.tx.lock().take();
    }

    fn is_closed(&self) -> bool {
        self.tx.lock().as_ref().map_or(true, |tx| tx.is_closed())
    }

    async fn closed(&self) {
        match self.sender() {
            Some(tx) => tx.closed().await,
            None => std::future::pending::<()>().await,
        }
    }
}
