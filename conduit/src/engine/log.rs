//! Stderr capture for a running chain.

use parking_lot::Mutex;
use regex::Regex;
use std::collections::VecDeque;
use std::sync::{Arc, LazyLock};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Lines kept per step for failures that printed no error marker.
pub const TAIL_LINES: usize = 20;

static ERROR_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(ERROR|Traceback|FATAL|thread '.+' panicked)").expect("valid error marker regex")
});

/// True if `line` opens an error report.
pub fn is_error_marker(line: &str) -> bool {
    ERROR_MARKER.is_match(line)
}

/// Shared, bounded log of every step's stderr, as `<step>: <line>`.
///
/// When the limit is exceeded the oldest half is dropped.
#[derive(Debug)]
pub struct RollingLog {
    lines: Mutex<VecDeque<String>>,
    limit: usize,
}

impl RollingLog {
    /// Creates a log holding at most `limit` lines.
    pub fn new(limit: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::new()),
            limit: limit.max(2),
        }
    }

    /// Appends a line.
    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock();
        lines.push_back(line);
        if lines.len() > self.limit {
            let half = lines.len() / 2;
            lines.drain(..half);
        }
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }

    /// Number of lines held.
    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    /// True if nothing was logged.
    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }
}

/// Remembers the first step, in chain order of detection, that printed an
/// error marker.
#[derive(Debug, Default, Clone)]
pub struct FirstError(Arc<Mutex<Option<usize>>>);

impl FirstError {
    /// Records `position` unless another step got there first.
    pub fn record(&self, position: usize) {
        self.0.lock().get_or_insert(position);
    }

    /// The recorded position.
    pub fn get(&self) -> Option<usize> {
        *self.0.lock()
    }
}

/// What one step wrote to stderr.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepLog {
    /// Chain position.
    pub position: usize,
    /// Step name.
    pub name: String,
    /// Lines from the first error marker on.
    pub errors: Vec<String>,
    /// The last lines, marker or not.
    pub tail: Vec<String>,
}

impl StepLog {
    /// `[name, errors...]`, or `[name, tail...]` when no marker was seen.
    pub fn report(&self) -> Vec<String> {
        let body = if self.errors.is_empty() {
            &self.tail
        } else {
            &self.errors
        };
        std::iter::once(self.name.clone())
            .chain(body.iter().cloned())
            .collect()
    }
}

/// Reads one step's stderr to the end.
pub async fn collect_stderr<R>(
    position: usize,
    name: String,
    stderr: R,
    log: Arc<RollingLog>,
    first_error: FirstError,
    error_limit: usize,
) -> StepLog
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    let mut errors: Vec<String> = Vec::new();
    let mut tail: VecDeque<String> = VecDeque::with_capacity(TAIL_LINES);
    let mut buf = Vec::new();
    let error_limit = error_limit.max(2);

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(step = %name, error = %e, "Stderr read failed");
                break;
            }
        }
        let line = String::from_utf8_lossy(&buf)
            .trim_end_matches(['\n', '\r'])
            .to_string();
        tracing::debug!(step = %name, "{line}");
        log.push(format!("{name}: {line}"));

        if !errors.is_empty() || is_error_marker(&line) {
            if errors.is_empty() {
                first_error.record(position);
            }
            errors.push(line.clone());
            if errors.len() > error_limit {
                errors.remove(1);
            }
        }

        tail.push_back(line);
        if tail.len() > TAIL_LINES {
            tail.pop_front();
        }
    }

    StepLog {
        position,
        name,
        errors,
        tail: tail.into(),
    }
}
