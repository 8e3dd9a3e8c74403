//! The line protocol spoken between steps, and the terminal sink that drains it.
//!
//! A stream is one JSON package descriptor line, then per resource a blank
//! line followed by one JSON row per line, then a final blank line and a
//! single JSON statistics object.

use serde::de::IgnoredAny;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::oneshot;

/// Message fed to the first step of every chain: an empty package.
pub const INITIAL_PACKAGE: &[u8] = b"{\"name\":\"_\",\"resources\":[]}\n\n{}\n";

/// Ways a stream can violate the protocol.
#[derive(Debug, Error)]
pub enum WireError {
    /// The stream closed before the descriptor line.
    #[error("stream ended before the package descriptor")]
    MissingDescriptor,

    /// The first line was not a JSON object.
    #[error("invalid package descriptor: {0}")]
    Descriptor(String),

    /// A row appeared before the first resource separator.
    #[error("row before the first resource separator: {0}")]
    UnexpectedRow(String),

    /// A row was not valid JSON.
    #[error("invalid row in resource {resource}: {reason}")]
    Row {
        /// Zero based resource index.
        resource: usize,
        /// Parser message.
        reason: String,
    },

    /// The trailing line was not a JSON object.
    #[error("invalid statistics object: {0}")]
    Stats(String),

    /// Data followed the statistics object.
    #[error("unexpected data after the statistics object")]
    TrailingData,

    /// The stream closed before the statistics object.
    #[error("stream ended before the statistics object")]
    MissingStats,

    /// Reading the stream failed.
    #[error("read error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    Descriptor,
    Resources { blanks: usize },
    Stats,
    Done,
}

/// What a fed line turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line {
    /// A data row of the given resource.
    Row(usize),
    /// Descriptor, separator or statistics.
    Frame,
}

/// Everything the sink learned from a complete stream.
#[derive(Debug, Clone, PartialEq)]
pub struct WireSummary {
    /// The package descriptor.
    pub descriptor: Value,
    /// Row count per resource, in descriptor order.
    pub resource_rows: Vec<u64>,
    /// The trailing statistics object.
    pub stats: Map<String, Value>,
}

impl WireSummary {
    /// Total rows across resources.
    pub fn total_rows(&self) -> u64 {
        self.resource_rows.iter().sum()
    }
}

/// Incremental protocol parser, one line at a time.
#[derive(Debug)]
pub struct WireParser {
    position: Position,
    descriptor: Value,
    resource_rows: Vec<u64>,
    stats: Option<Map<String, Value>>,
}

impl Default for WireParser {
    fn default() -> Self {
        Self::new()
    }
}

impl WireParser {
    /// Parser waiting for a descriptor.
    pub fn new() -> Self {
        Self {
            position: Position::Descriptor,
            descriptor: Value::Null,
            resource_rows: Vec::new(),
            stats: None,
        }
    }

    /// Feeds one line without its terminator.
    pub fn feed(&mut self, line: &str) -> Result<Line, WireError> {
        match self.position {
            Position::Descriptor => {
                let descriptor: Value = serde_json::from_str(line)
                    .map_err(|e| WireError::Descriptor(e.to_string()))?;
                if !descriptor.is_object() {
                    return Err(WireError::Descriptor("not a JSON object".to_string()));
                }
                let resources = descriptor
                    .get("resources")
                    .and_then(Value::as_array)
                    .map_or(0, Vec::len);
                self.resource_rows = vec![0; resources];
                self.descriptor = descriptor;
                self.position = Position::Resources { blanks: 0 };
                Ok(Line::Frame)
            }
            Position::Resources { blanks } if line.is_empty() => {
                let blanks = blanks + 1;
                self.position = if blanks == self.resource_rows.len() + 1 {
                    Position::Stats
                } else {
                    Position::Resources { blanks }
                };
                Ok(Line::Frame)
            }
            Position::Resources { blanks: 0 } => Err(WireError::UnexpectedRow(truncate(line))),
            Position::Resources { blanks } => {
                let resource = blanks - 1;
                serde_json::from_str::<IgnoredAny>(line).map_err(|e| WireError::Row {
                    resource,
                    reason: e.to_string(),
                })?;
                self.resource_rows[resource] += 1;
                Ok(Line::Row(resource))
            }
            Position::Stats | Position::Done if line.is_empty() => Ok(Line::Frame),
            Position::Stats => {
                let stats: Map<String, Value> =
                    serde_json::from_str(line).map_err(|e| WireError::Stats(e.to_string()))?;
                self.stats = Some(stats);
                self.position = Position::Done;
                Ok(Line::Frame)
            }
            Position::Done => Err(WireError::TrailingData),
        }
    }

    /// Closes the stream.
    pub fn finish(self) -> Result<WireSummary, WireError> {
        match (self.position, self.stats) {
            (Position::Descriptor, _) => Err(WireError::MissingDescriptor),
            (Position::Done, Some(stats)) => Ok(WireSummary {
                descriptor: self.descriptor,
                resource_rows: self.resource_rows,
                stats,
            }),
            _ => Err(WireError::MissingStats),
        }
    }
}

fn truncate(line: &str) -> String {
    line.chars().take(80).collect()
}

/// Drains `input` to the end, counting rows into `rows`.
///
/// After the first protocol error the rest of the stream is still read and
/// discarded so the producing process never blocks on a full pipe. The
/// statistics object is handed back on `stats`; the full result is the
/// return value.
pub async fn drain<R>(
    input: R,
    rows: Arc<AtomicU64>,
    stats: oneshot::Sender<Map<String, Value>>,
) -> Result<WireSummary, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(input);
    let mut parser = WireParser::new();
    let mut failure: Option<WireError> = None;
    let mut buf = Vec::with_capacity(4096);

    loop {
        buf.clear();
        let read = match reader.read_until(b'\n', &mut buf).await {
            Ok(read) => read,
            Err(e) => {
                failure.get_or_insert(WireError::Io(e));
                break;
            }
        };
        if read == 0 {
            break;
        }
        if failure.is_some() {
            continue;
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
        }
        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line,
            Err(e) => {
                failure = Some(WireError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    e,
                )));
                continue;
            }
        };
        match parser.feed(line) {
            Ok(Line::Row(_)) => {
                rows.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Line::Frame) => {}
            Err(e) => failure = Some(e),
        }
    }

    if let Some(e) = failure {
        return Err(e);
    }
    let summary = parser.finish()?;
    // The receiver may already be gone when the run was torn down.
    let _ = stats.send(summary.stats.clone());
    Ok(summary)
}
