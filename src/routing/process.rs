//! Scheduler worker process management
//!
//! The reconciler launches one worker process per scheduler shard and tears
//! it down on deletion. Both operations must tolerate retries: a re-launch of
//! a running tag and a close of an already-gone tag are successes.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

/// Errors from launching or closing worker processes
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to launch scheduler worker '{tag}': {source}")]
    Launch {
        tag: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to close scheduler worker '{tag}': {source}")]
    Close {
        tag: String,
        #[source]
        source: std::io::Error,
    },

    #[error("scheduler worker command for '{tag}' exited with status {status}")]
    Exited { tag: String, status: i32 },
}

/// Launches and terminates scheduler worker processes by tag
#[async_trait]
pub trait ProcessManager: Send + Sync {
    async fn launch(&self, tag: &str) -> Result<(), ProcessError>;
    async fn close(&self, tag: &str) -> Result<(), ProcessError>;
}

/// Shells out to start/close scripts, one invocation per lifecycle event
pub struct ShellProcessManager {
    start_script: PathBuf,
    close_script: PathBuf,
}

impl ShellProcessManager {
    pub fn new(start_script: impl Into<PathBuf>, close_script: impl Into<PathBuf>) -> Self {
        Self {
            start_script: start_script.into(),
            close_script: close_script.into(),
        }
    }

    async fn run(script: &PathBuf, tag: &str, launch: bool) -> Result<(), ProcessError> {
        let output = Command::new(script)
            .arg(tag)
            .output()
            .await
            .map_err(|source| {
                if launch {
                    ProcessError::Launch {
                        tag: tag.to_string(),
                        source,
                    }
                } else {
                    ProcessError::Close {
                        tag: tag.to_string(),
                        source,
                    }
                }
            })?;

        if !output.status.success() {
            warn!(
                tag = %tag,
                status = output.status.code().unwrap_or(-1),
                stderr = %String::from_utf8_lossy(&output.stderr),
                "scheduler worker script failed"
            );
            return Err(ProcessError::Exited {
                tag: tag.to_string(),
                status: output.status.code().unwrap_or(-1),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessManager for ShellProcessManager {
    async fn launch(&self, tag: &str) -> Result<(), ProcessError> {
        info!(tag = %tag, "launching scheduler worker");
        Self::run(&self.start_script, tag, true).await
    }

    async fn close(&self, tag: &str) -> Result<(), ProcessError> {
        info!(tag = %tag, "closing scheduler worker");
        Self::run(&self.close_script, tag, false).await
    }
}

/// In-memory manager that only tracks which tags are running. Used by tests
/// and the demo binary; launch/close are idempotent like the shell variant.
#[derive(Default)]
pub struct RecordingProcessManager {
    running: Mutex<HashSet<String>>,
    launches: Mutex<Vec<String>>,
    closes: Mutex<Vec<String>>,
}

impl RecordingProcessManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self, tag: &str) -> bool {
        self.running.lock().expect("lock poisoned").contains(tag)
    }

    /// Every launch call observed, including idempotent repeats
    pub fn launches(&self) -> Vec<String> {
        self.launches.lock().expect("lock poisoned").clone()
    }

    pub fn closes(&self) -> Vec<String> {
        self.closes.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl ProcessManager for RecordingProcessManager {
    async fn launch(&self, tag: &str) -> Result<(), ProcessError> {
        let mut running = self.running.lock().expect("lock poisoned");
        if running.insert(tag.to_string()) {
            self.launches
                .lock()
                .expect("lock poisoned")
                .push(tag.to_string());
        }
        Ok(())
    }

    async fn close(&self, tag: &str) -> Result<(), ProcessError> {
        let mut running = self.running.lock().expect("lock poisoned");
        if running.remove(tag) {
            self.closes
                .lock()
                .expect("lock poisoned")
                .push(tag.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_manager_idempotent() {
        let manager = RecordingProcessManager::new();

        manager.launch("tag-a").await.unwrap();
        manager.launch("tag-a").await.unwrap();
        assert!(manager.is_running("tag-a"));
        assert_eq!(manager.launches(), vec!["tag-a"]);

        manager.close("tag-a").await.unwrap();
        manager.close("tag-a").await.unwrap();
        assert!(!manager.is_running("tag-a"));
        assert_eq!(manager.closes(), vec!["tag-a"]);
    }
}
