//! Session state for one script run.
//!
//! A [`Session`] records every action, `log` line and assertion the
//! interpreter produces:
//!
//! - entries are kept in a ring buffer of the most recent 1000
//! - when a log directory is given, each entry is also appended as one JSON
//!   line to `{dir}/{script}_{timestamp}.jsonl` (with a `_N` suffix when
//!   that file already exists)
//!
//! The JSONL files are what `trellis convert` turns back into a script.
//!
//! # Example
//!
//! ```no_run
//! use trellis_core::session::Session;
//! use trellis_core::action::{ActionType, ActionResult};
//!
//! #[tokio::main]
//! async fn main() {
//!     let session = Session::new("smoke", None);
//!
//!     session.log_action(
//!         ActionType::Click { selector: "#go".to_string() },
//!         ActionResult::Success,
//!         Some(12),
//!     ).await;
//! }
//! ```

use std::collections::VecDeque;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::action::{ActionLog, ActionResult, ActionType};

/// Maximum number of action log entries to retain in the ring buffer.
const MAX_ACTION_LOG_SIZE: usize = 1000;

pub struct Session {
    /// The unique identifier for this session.
    pub id: Uuid,

    /// When this session was created.
    pub created_at: DateTime<Utc>,

    /// Name of the script being run.
    pub name: String,

    action_log: RwLock<VecDeque<ActionLog>>,

    log_dir: Option<PathBuf>,

    log_path: Option<PathBuf>,

    log_writer: Mutex<Option<BufWriter<std::fs::File>>>,
}

impl Session {
    /// Creates a new session. With `log_dir`, entries are also persisted to
    /// a JSON Lines file in that directory.
    pub fn new(name: &str, log_dir: Option<&Path>) -> Arc<Self> {
        let created_at = Utc::now();

        let (log_path, log_writer) = match log_dir {
            Some(dir) => {
                let stem = format!("{}_{}", sanitize(name), created_at.format("%Y%m%d_%H%M%S"));
                match create_log_file(dir, &stem) {
                    Ok((path, file)) => (Some(path), Some(BufWriter::new(file))),
                    Err(e) => {
                        tracing::warn!(dir = %dir.display(), error = %e, "cannot create session log");
                        (None, None)
                    }
                }
            }
            None => (None, None),
        };

        Arc::new(Self {
            id: Uuid::new_v4(),
            created_at,
            name: name.to_string(),
            action_log: RwLock::new(VecDeque::with_capacity(MAX_ACTION_LOG_SIZE)),
            log_dir: log_dir.map(Path::to_path_buf),
            log_path,
            log_writer: Mutex::new(log_writer),
        })
    }

    /// A fresh session with the same name and log directory.
    pub fn renew(&self) -> Arc<Self> {
        Self::new(&self.name, self.log_dir.as_deref())
    }

    /// Where the JSONL log is being written, if anywhere.
    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    /// Records an action.
    ///
    /// The ring buffer drops its oldest entry once it holds
    /// `MAX_ACTION_LOG_SIZE` entries. The persistent file keeps everything.
    pub async fn log_action(&self, action: ActionType, result: ActionResult, duration_ms: Option<u64>) -> ActionLog {
        let log = ActionLog::new(action, result, duration_ms);

        {
            let mut action_log = self.action_log.write().await;
            if action_log.len() >= MAX_ACTION_LOG_SIZE {
                action_log.pop_front();
            }
            action_log.push_back(log.clone());
        }

        {
            let mut writer_guard = self.log_writer.lock().await;
            if let Some(ref mut writer) = *writer_guard {
                match serde_json::to_string(&log) {
                    Ok(json) => {
                        if let Err(e) = writeln!(writer, "{}", json).and_then(|_| writer.flush()) {
                            tracing::warn!(path = ?self.log_path, error = %e, "cannot write session log entry");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "cannot serialize session log entry"),
                }
            }
        }

        log
    }

    /// Returns all retained entries in chronological order.
    pub async fn get_action_log(&self) -> Vec<ActionLog> {
        self.action_log.read().await.iter().cloned().collect()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("name", &self.name)
            .field("log_path", &self.log_path)
            .field("action_log", &"<RwLock<VecDeque<ActionLog>>>")
            .finish()
    }
}

/// Opens `{stem}.jsonl` in `dir`, or `{stem}_N.jsonl` if it already exists.
fn create_log_file(dir: &Path, stem: &str) -> std::io::Result<(PathBuf, std::fs::File)> {
    let mut attempt = 0;
    loop {
        let path = match attempt {
            0 => dir.join(format!("{}.jsonl", stem)),
            n => dir.join(format!("{}_{}.jsonl", stem, n)),
        };
        match std::fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && attempt < 100 => attempt += 1,
            Err(e) => return Err(e),
        }
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
