//! Wiring a pipeline's steps into a chain of processes.
//!
//! Adjacent steps are joined by OS pipes so bytes flow between them without
//! passing through this process. Two cases need a task in the middle: the
//! chain head (fed the initial package or a cache replay) and any cacheable
//! step, whose output is copied both downstream and into a [`CacheWriter`].

use super::cache::{self, CacheWriter, PendingCache};
use super::log::{collect_stderr, FirstError, RollingLog, StepLog};
use super::runners::{Invocation, RunnerRegistry};
use super::wire::INITIAL_PACKAGE;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStdout};

/// Name used for a chain head that replays a cache artifact.
pub const CACHE_LOADER: &str = "(cache_loader)";

const PIPE_BUFFER: usize = 64 * 1024;

/// One step to spawn.
#[derive(Debug, Clone)]
pub struct ChainStep {
    /// Position in the pipeline, passed to the step.
    pub index: usize,
    /// Display name.
    pub name: String,
    /// Resolved executable.
    pub executable: PathBuf,
    /// Parameters as JSON.
    pub parameters: String,
    /// Runner name; `None` for the default.
    pub runner: Option<String>,
    /// Set when the step's output should be cached under this hash.
    pub cache_to: Option<String>,
}

/// What the first step reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feed {
    /// The empty package.
    Initial,
    /// A cache artifact replayed in place of the steps it covers.
    Cache(PathBuf),
}

/// Result of a copying task.
#[derive(Debug)]
pub enum Transfer {
    /// The chain head was fed.
    Fed,
    /// A cacheable step's output was copied; the artifact is ready to
    /// commit if the step exits cleanly.
    Teed {
        /// Chain position of the step that produced the output.
        position: usize,
        /// The artifact, unless writing it failed.
        pending: Option<PendingCache>,
    },
}

/// A spawned process.
#[derive(Debug)]
pub struct Spawned {
    /// Chain position.
    pub position: usize,
    /// Step name.
    pub name: String,
    /// Process handle.
    pub child: Child,
}

/// A spawned chain, ready to be driven.
pub struct Chain {
    /// Step processes, in order.
    pub processes: Vec<Spawned>,
    /// Copying tasks for the head and cacheable steps.
    pub transfers: Vec<BoxFuture<'static, Transfer>>,
    /// One stderr reader per process.
    pub collectors: Vec<BoxFuture<'static, StepLog>>,
    /// The chain's final output.
    pub output: Box<dyn AsyncRead + Send + Unpin>,
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("processes", &self.processes)
            .field("transfers", &self.transfers.len())
            .field("collectors", &self.collectors.len())
            .finish_non_exhaustive()
    }
}

/// A step that could not be started.
#[derive(Debug)]
pub struct SpawnError {
    /// Step name.
    pub step: String,
    /// What went wrong.
    pub message: String,
}

/// Shared inputs for [`spawn`].
#[derive(Debug)]
pub struct ChainContext<'a> {
    /// Pipeline directory.
    pub cwd: &'a Path,
    /// Available runners.
    pub runners: &'a RunnerRegistry,
    /// Rolling stderr log.
    pub log: Arc<RollingLog>,
    /// First error marker tracker.
    pub first_error: FirstError,
    /// Cap on per-step error lines.
    pub error_limit: usize,
}

enum Upstream {
    Feed(Feed),
    Pipe(ChildStdout),
    Tee {
        stdout: ChildStdout,
        writer: CacheWriter,
        position: usize,
    },
}

impl Upstream {
    /// Starts whatever task must push this upstream into `downstream`.
    fn forward<W>(self, downstream: W, transfers: &mut Vec<BoxFuture<'static, Transfer>>)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        match self {
            Self::Feed(feed) => transfers.push(pump(feed, downstream).boxed()),
            Self::Tee {
                stdout,
                writer,
                position,
            } => transfers.push(tee(stdout, downstream, writer, position).boxed()),
            // Pipes are handed to the next process directly.
            Self::Pipe(_) => {}
        }
    }
}

/// Spawns every step of the chain.
///
/// On error, processes started so far are killed when the partial chain is
/// dropped.
pub fn spawn(steps: &[ChainStep], feed: Feed, ctx: &ChainContext<'_>) -> Result<Chain, SpawnError> {
    let mut processes = Vec::with_capacity(steps.len());
    let mut transfers = Vec::new();
    let mut collectors = Vec::with_capacity(steps.len());
    let mut upstream = Upstream::Feed(feed);

    for (position, step) in steps.iter().enumerate() {
        let fail = |message: String| SpawnError {
            step: step.name.clone(),
            message,
        };
        let runner = ctx
            .runners
            .get(step.runner.as_deref())
            .map_err(|e| fail(e.to_string()))?;
        let mut command = runner.command(&Invocation {
            executable: &step.executable,
            index: step.index,
            parameters: &step.parameters,
            cwd: ctx.cwd,
        });
        command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let pending_upstream = match upstream {
            Upstream::Pipe(stdout) => {
                let stdin: Stdio = stdout
                    .try_into()
                    .map_err(|e: std::io::Error| fail(format!("failed to connect pipe: {e}")))?;
                command.stdin(stdin);
                None
            }
            other => {
                command.stdin(Stdio::piped());
                Some(other)
            }
        };

        let mut child = command
            .spawn()
            .map_err(|e| fail(format!("failed to start {}: {e}", step.executable.display())))?;
        tracing::debug!(step = %step.name, position, pid = ?child.id(), "Spawned step");

        if let Some(prev) = pending_upstream {
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| fail("stdin was not captured".to_string()))?;
            prev.forward(stdin, &mut transfers);
        }
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| fail("stderr was not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| fail("stdout was not captured".to_string()))?;

        collectors.push(
            collect_stderr(
                position,
                step.name.clone(),
                stderr,
                Arc::clone(&ctx.log),
                ctx.first_error.clone(),
                ctx.error_limit,
            )
            .boxed(),
        );

        upstream = match &step.cache_to {
            Some(hash) => match CacheWriter::create(ctx.cwd, hash) {
                Ok(writer) => Upstream::Tee {
                    stdout,
                    writer,
                    position,
                },
                Err(e) => {
                    tracing::warn!(step = %step.name, error = %e, "Cannot open cache file, not caching");
                    Upstream::Pipe(stdout)
                }
            },
            None => Upstream::Pipe(stdout),
        };

        processes.push(Spawned {
            position,
            name: step.name.clone(),
            child,
        });
    }

    let output: Box<dyn AsyncRead + Send + Unpin> = match upstream {
        Upstream::Pipe(stdout) => Box::new(stdout),
        other => {
            let (writer, reader) = tokio::io::duplex(PIPE_BUFFER);
            other.forward(writer, &mut transfers);
            Box::new(reader)
        }
    };

    Ok(Chain {
        processes,
        transfers,
        collectors,
        output,
    })
}

/// Writes the chain head's input, then closes it.
async fn pump<W>(feed: Feed, mut out: W) -> Transfer
where
    W: AsyncWrite + Unpin,
{
    let result = match feed {
        Feed::Initial => out.write_all(INITIAL_PACKAGE).await,
        Feed::Cache(path) => cache::replay(path, &mut out).await.map(|bytes| {
            tracing::debug!(step = CACHE_LOADER, bytes, "Replayed cache");
        }),
    };
    if let Err(e) = result {
        tracing::debug!(step = CACHE_LOADER, error = %e, "Feeding chain head stopped");
    }
    let _ = out.shutdown().await;
    Transfer::Fed
}

/// Copies a cacheable step's output downstream and into its artifact.
///
/// A closed downstream does not stop the copy: the step keeps being
/// drained so it can exit and its artifact stays complete.
async fn tee<W>(mut stdout: ChildStdout, out: W, writer: CacheWriter, position: usize) -> Transfer
where
    W: AsyncWrite + Unpin,
{
    let mut downstream = Some(out);
    let mut sink = Some(writer.spawn());
    let mut buf = vec![0u8; PIPE_BUFFER];

    loop {
        let n = match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(position, error = %e, "Reading step output failed");
                sink = None;
                break;
            }
        };
        if let Some(out) = downstream.as_mut() {
            if out.write_all(&buf[..n]).await.is_err() {
                downstream = None;
            }
        }
        if let Some(cache) = sink.as_mut() {
            if let Err(e) = cache.write(&buf[..n]).await {
                tracing::warn!(position, error = %e, "Writing cache failed, dropping it");
                sink = None;
            }
        }
    }

    if let Some(mut out) = downstream {
        let _ = out.shutdown().await;
    }
    let pending = match sink {
        None => None,
        Some(cache) => match cache.finish().await {
            Ok(pending) => Some(pending),
            Err(e) => {
                tracing::warn!(position, error = %e, "Finishing cache failed");
                None
            }
        },
    };
    Transfer::Teed { position, pending }
}
