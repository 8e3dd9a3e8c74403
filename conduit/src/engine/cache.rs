//! Step output caches.
//!
//! A cache artifact is a zstd-compressed copy of a step's output stream,
//! stored as `.cache/<cache-hash>` under the pipeline directory. Writes go to
//! a temporary file in the same directory and only become visible through
//! [`PendingCache::commit`].

use crate::specs::Step;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Directory under the pipeline directory that holds artifacts.
pub const CACHE_DIR: &str = ".cache";

const CHUNK: usize = 64 * 1024;
const LEVEL: i32 = 3;

/// Location of the artifact for `cache_hash`.
pub fn cache_path(pipeline_dir: &Path, cache_hash: &str) -> PathBuf {
    pipeline_dir.join(CACHE_DIR).join(cache_hash)
}

/// True if `path` holds a decodable artifact.
pub fn is_readable(path: &Path) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };
    let Ok(mut decoder) = zstd::stream::read::Decoder::new(file) else {
        return false;
    };
    let mut first = [0u8; 1];
    matches!(decoder.read(&mut first), Ok(1))
}

/// The last step with a readable artifact, with the artifact path.
pub fn find_cache(steps: &[Step], pipeline_dir: &Path) -> Option<(usize, PathBuf)> {
    steps.iter().enumerate().rev().find_map(|(index, step)| {
        let path = cache_path(pipeline_dir, &step.cache_hash);
        is_readable(&path).then_some((index, path))
    })
}

/// Streams a step's output into a temporary artifact.
pub struct CacheWriter {
    encoder: zstd::stream::write::Encoder<'static, NamedTempFile>,
    target: PathBuf,
}

impl std::fmt::Debug for CacheWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheWriter")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl CacheWriter {
    /// Opens a temporary file next to the final artifact location.
    pub fn create(pipeline_dir: &Path, cache_hash: &str) -> io::Result<Self> {
        let target = cache_path(pipeline_dir, cache_hash);
        let dir = pipeline_dir.join(CACHE_DIR);
        fs::create_dir_all(&dir)?;
        let file = tempfile::Builder::new()
            .prefix(&format!(".{cache_hash}."))
            .suffix(".tmp")
            .tempfile_in(&dir)?;
        let encoder = zstd::stream::write::Encoder::new(file, LEVEL)?;
        Ok(Self { encoder, target })
    }

    /// Appends output bytes.
    pub fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.encoder.write_all(bytes)
    }

    /// Ends the compressed stream. The artifact is still hidden.
    pub fn finish(self) -> io::Result<PendingCache> {
        let mut file = self.encoder.finish()?;
        file.flush()?;
        Ok(PendingCache {
            file,
            target: self.target,
        })
    }
}

impl CacheWriter {
    /// Moves compression onto the blocking pool, fed over a bounded channel.
    pub fn spawn(self) -> CacheSink {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(8);
        let task = tokio::task::spawn_blocking(move || {
            let mut writer = self;
            while let Some(chunk) = rx.blocking_recv() {
                writer.write(&chunk)?;
            }
            writer.finish()
        });
        CacheSink { tx, task }
    }
}

/// Async handle to a [`CacheWriter`] running on the blocking pool.
///
/// Dropping it without [`CacheSink::finish`] discards the artifact.
#[derive(Debug)]
pub struct CacheSink {
    tx: mpsc::Sender<Vec<u8>>,
    task: JoinHandle<io::Result<PendingCache>>,
}

impl CacheSink {
    /// Hands output bytes to the writer; `Err` once the writer has failed.
    pub async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.tx.send(bytes.to_vec()).await.is_ok() {
            return Ok(());
        }
        match (&mut self.task).await {
            Ok(Err(e)) => Err(e),
            Ok(Ok(_)) => Err(io::Error::other("cache writer stopped")),
            Err(e) => Err(io::Error::other(e)),
        }
    }

    /// Ends the stream and waits for the compressed artifact.
    pub async fn finish(self) -> io::Result<PendingCache> {
        let Self { tx, task } = self;
        drop(tx);
        task.await.map_err(io::Error::other)?
    }
}

/// A complete artifact waiting for its step to exit cleanly.
///
/// Dropping it deletes the temporary file.
#[derive(Debug)]
pub struct PendingCache {
    file: NamedTempFile,
    target: PathBuf,
}

impl PendingCache {
    /// Final location.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Atomically moves the artifact into place.
    pub fn commit(self) -> io::Result<PathBuf> {
        self.file.as_file().sync_all()?;
        self.file.persist(&self.target).map_err(|e| e.error)?;
        Ok(self.target)
    }
}

/// Decompresses the artifact at `path` into `out`, returning the byte count.
///
/// Decoding runs on the blocking pool and hands chunks over a bounded
/// channel. A closed `out` stops the decoder.
pub async fn replay<W>(path: PathBuf, out: &mut W) -> io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let (tx, mut rx) = mpsc::channel::<io::Result<Vec<u8>>>(8);
    let decoder = tokio::task::spawn_blocking(move || {
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                return;
            }
        };
        let mut decoder = match zstd::stream::read::Decoder::new(file) {
            Ok(decoder) => decoder,
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                return;
            }
        };
        loop {
            let mut chunk = vec![0u8; CHUNK];
            match decoder.read(&mut chunk) {
                Ok(0) => return,
                Ok(n) => {
                    chunk.truncate(n);
                    if tx.blocking_send(Ok(chunk)).is_err() {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    return;
                }
            }
        }
    });

    let result = async {
        let mut written = 0u64;
        while let Some(chunk) = rx.recv().await {
            let chunk = chunk?;
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        Ok::<_, io::Error>(written)
    }
    .await;
    drop(rx);
    if let Err(e) = decoder.await {
        tracing::warn!(error = %e, "Cache decoder task failed");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use tempfile::TempDir;

    fn step(hash: &str) -> Step {
        Step {
            run: "load".to_string(),
            executable: PathBuf::from("/bin/true"),
            parameters: Map::new(),
            cache: true,
            runner: None,
            cache_hash: hash.to_string(),
        }
    }

    fn write_artifact(dir: &Path, hash: &str, bytes: &[u8]) -> PathBuf {
        let mut writer = CacheWriter::create(dir, hash).unwrap();
        writer.write(bytes).unwrap();
        writer.finish().unwrap().commit().unwrap()
    }

    #[test]
    fn test_artifact_is_hidden_until_commit() {
        let dir = TempDir::new().unwrap();
        let mut writer = CacheWriter::create(dir.path(), "abc").unwrap();
        writer.write(b"data\n").unwrap();
        let pending = writer.finish().unwrap();

        assert!(!pending.target().exists());
        let path = pending.commit().unwrap();
        assert_eq!(path, cache_path(dir.path(), "abc"));
        assert!(is_readable(&path));
    }

    #[test]
    fn test_dropped_pending_cache_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let mut writer = CacheWriter::create(dir.path(), "abc").unwrap();
        writer.write(b"data\n").unwrap();
        drop(writer.finish().unwrap());

        let leftovers = fs::read_dir(dir.path().join(CACHE_DIR)).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_unreadable_artifacts_are_skipped() {
        let dir = TempDir::new().unwrap();
        write_artifact(dir.path(), "h0", b"first\n");
        fs::write(cache_path(dir.path(), "h2"), b"not zstd").unwrap();

        let steps = [step("h0"), step("h1"), step("h2")];
        let (index, path) = find_cache(&steps, dir.path()).unwrap();
        assert_eq!(index, 0);
        assert_eq!(path, cache_path(dir.path(), "h0"));

        assert!(find_cache(&steps[1..], dir.path()).is_none());
    }

    #[tokio::test]
    async fn test_sink_compresses_off_the_runtime() {
        let dir = TempDir::new().unwrap();
        let mut sink = CacheWriter::create(dir.path(), "abc").unwrap().spawn();
        sink.write(b"{\"v\":1}\n").await.unwrap();
        sink.write(b"{\"v\":2}\n").await.unwrap();
        let path = sink.finish().await.unwrap().commit().unwrap();

        let mut out = Vec::new();
        replay(path, &mut out).await.unwrap();
        assert_eq!(out, b"{\"v\":1}\n{\"v\":2}\n");
    }

    #[tokio::test]
    async fn test_dropped_sink_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let mut sink = CacheWriter::create(dir.path(), "abc").unwrap().spawn();
        sink.write(b"partial\n").await.unwrap();
        drop(sink);

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while fs::read_dir(dir.path().join(CACHE_DIR)).unwrap().count() > 0 {
            assert!(std::time::Instant::now() < deadline, "temporary artifact left behind");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!cache_path(dir.path(), "abc").exists());
    }

    #[tokio::test]
    async fn test_replay_round_trips_large_streams() {
        let dir = TempDir::new().unwrap();
        let payload: Vec<u8> = (0..200_000u32)
            .flat_map(|i| format!("{{\"v\":{i}}}\n").into_bytes())
            .collect();
        let path = write_artifact(dir.path(), "big", &payload);

        let mut out = Vec::new();
        let written = replay(path, &mut out).await.unwrap();

        assert_eq!(written, payload.len() as u64);
        assert!(out == payload);
    }
}
