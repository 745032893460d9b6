//! Log streaming
//!
//! Each target container contributes one reader task per log source. In
//! non-follow mode a reader drains its file to EOF and exits; in follow mode
//! it keeps polling for appended lines until the receiver goes away. The
//! channel closes once every reader has finished, which is how non-follow
//! consumers know they have seen everything.

use crate::error::Result;
use crate::runtime::{ContainerClient, LogStream};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::warn;

const FOLLOW_POLL_INTERVAL: Duration = Duration::from_millis(200);
const CHANNEL_CAPACITY: usize = 256;

/// One log line from one container.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Service the container belongs to
    pub service: String,
    /// Container ID
    pub container: String,
    /// The line, without its trailing newline
    pub message: String,
    /// Source stream
    pub stream: LogStream,
    /// When the line was read
    pub timestamp: DateTime<Utc>,
}

/// Log streaming options
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Keep following after EOF
    pub follow: bool,
    /// Only emit the last N lines of each source
    pub tail: Option<usize>,
    /// Render timestamps (a presentation concern; carried for the CLI)
    pub timestamps: bool,
    /// Include boot output (folded into the stderr source by the runtime)
    pub include_boot: bool,
}

/// Spawn reader tasks for `targets` and return the entry stream.
pub(crate) async fn stream_logs(
    containers: &Arc<dyn ContainerClient>,
    targets: Vec<(String, String)>,
    options: &LogOptions,
) -> Result<mpsc::Receiver<LogEntry>> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    for (service, container_id) in targets {
        let sources = match containers.logs(&container_id).await {
            Ok(sources) => sources,
            Err(err) => {
                warn!("cannot open logs for {}: {}", container_id, err);
                continue;
            }
        };
        for source in sources {
            tokio::spawn(read_source(
                source.path,
                source.stream,
                service.clone(),
                container_id.clone(),
                options.clone(),
                tx.clone(),
            ));
        }
    }

    Ok(rx)
}

async fn read_source(
    path: PathBuf,
    stream: LogStream,
    service: String,
    container: String,
    options: LogOptions,
    tx: mpsc::Sender<LogEntry>,
) {
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(err) => {
            warn!("cannot open {}: {}", path.display(), err);
            return;
        }
    };
    let mut reader = BufReader::new(file);

    // initial drain to EOF, honoring tail
    let mut initial = Vec::new();
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => initial.push(line.trim_end_matches('\n').to_string()),
        }
    }
    if let Some(tail) = options.tail {
        if initial.len() > tail {
            initial.drain(..initial.len() - tail);
        }
    }
    for message in initial {
        if send_entry(&tx, &service, &container, message, stream).await.is_err() {
            return;
        }
    }

    if !options.follow {
        return;
    }

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => tokio::time::sleep(FOLLOW_POLL_INTERVAL).await,
            Ok(_) => {
                let message = line.trim_end_matches('\n').to_string();
                if send_entry(&tx, &service, &container, message, stream).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                warn!("log read error on {}: {}", path.display(), err);
                return;
            }
        }
    }
}

async fn send_entry(
    tx: &mpsc::Sender<LogEntry>,
    service: &str,
    container: &str,
    message: String,
    stream: LogStream,
) -> std::result::Result<(), mpsc::error::SendError<LogEntry>> {
    tx.send(LogEntry {
        service: service.to_string(),
        container: container.to_string(),
        message,
        stream,
        timestamp: Utc::now(),
    })
    .await
}
