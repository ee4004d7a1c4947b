use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use core_types::{BusMessage, MessageSink};
use parking_lot::Mutex;
use serde::Serialize;

/// Spools messages to `<dir>/<topic>.jsonl`, one JSON object per line.
#[derive(Clone)]
pub struct JsonlSink {
    dir: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

#[derive(Serialize)]
struct SpoolLine<'a> {
    topic: &'a str,
    key: &'a str,
    timestamp_ms: i64,
    value: serde_json::Value,
}

impl JsonlSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn topic_path(&self, topic: &str) -> PathBuf {
        self.dir.join(format!("{topic}.jsonl"))
    }
}

fn encode_line(message: &BusMessage) -> Result<String> {
    // JSON payloads are embedded as-is, anything else as a string.
    let value = serde_json::from_slice(&message.value).unwrap_or_else(|_| {
        serde_json::Value::String(String::from_utf8_lossy(&message.value).into_owned())
    });
    let line = SpoolLine {
        topic: &message.topic,
        key: &message.key,
        timestamp_ms: message.timestamp_ms,
        value,
    };
    Ok(serde_json::to_string(&line)?)
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create spool dir for {}", path.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    writeln!(file, "{line}")?;
    Ok(())
}

#[async_trait]
impl MessageSink for JsonlSink {
    async fn send(&self, message: BusMessage) -> Result<()> {
        let line = encode_line(&message)?;
        let path = self.topic_path(&message.topic);
        let lock = self.write_lock.clone();
        let written = tokio::task::spawn_blocking(move || {
            let _guard = lock.lock();
            append_line(&path, &line)
        })
        .await?;
        if let Err(err) = written {
            metrics::counter!("bus.spool_error").increment(1);
            tracing::warn!(
                ?err,
                topic = %message.topic,
                key = %message.key,
                "spool append failed"
            );
            return Err(err);
        }
        metrics::counter!("bus.spooled").increment(1);
        Ok(())
    }
}
