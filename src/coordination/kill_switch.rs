//! Kill switch
//!
//! Two implementations of the same gate: an in-process switch engaged by
//! an operator or another component, and a flag-file switch that is
//! engaged while a file exists, so it can be thrown from outside the
//! process.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{error, info};

use super::safety::KillSwitch;
use crate::error::{Result, TallyError};

/// Kill switch state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KillSwitchState {
    pub engaged: bool,
    pub reason: Option<String>,
    pub engaged_at: Option<DateTime<Utc>>,
}

/// In-process kill switch
#[derive(Default)]
pub struct InProcessKillSwitch {
    state: RwLock<KillSwitchState>,
    engaged: AtomicBool,
}

impl InProcessKillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn engage(&self, reason: &str) {
        if self.engaged.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.write().await = KillSwitchState {
            engaged: true,
            reason: Some(reason.to_string()),
            engaged_at: Some(Utc::now()),
        };
        error!("KILL SWITCH ENGAGED: {}", reason);
    }

    pub async fn release(&self) {
        self.engaged.store(false, Ordering::SeqCst);
        *self.state.write().await = KillSwitchState::default();
        info!("Kill switch released");
    }

    pub async fn state(&self) -> KillSwitchState {
        self.state.read().await.clone()
    }
}

#[async_trait]
impl KillSwitch for InProcessKillSwitch {
    async fn is_engaged(&self) -> Result<bool> {
        Ok(self.engaged.load(Ordering::SeqCst))
    }
}

/// Engaged while `path` exists
pub struct FileKillSwitch {
    path: PathBuf,
}

impl FileKillSwitch {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl KillSwitch for FileKillSwitch {
    async fn is_engaged(&self) -> Result<bool> {
        tokio::fs::try_exists(&self.path).await.map_err(|e| {
            TallyError::Infrastructure(format!(
                "cannot read kill switch flag {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}

/// Engaged if any member is engaged
pub struct AnyKillSwitch {
    switches: Vec<std::sync::Arc<dyn KillSwitch>>,
}

impl AnyKillSwitch {
    pub fn new(switches: Vec<std::sync::Arc<dyn KillSwitch>>) -> Self {
        Self { switches }
    }
}

#[async_trait]
impl KillSwitch for AnyKillSwitch {
    async fn is_engaged(&self) -> Result<bool> {
        for switch in &self.switches {
            if switch.is_engaged().await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_engage_and_release() {
        let switch = InProcessKillSwitch::new();
        assert!(!switch.is_engaged().await.unwrap());

        switch.engage("drill").await;
        assert!(switch.is_engaged().await.unwrap());
        assert_eq!(switch.state().await.reason.as_deref(), Some("drill"));

        // Second engage keeps the original reason
        switch.engage("other").await;
        assert_eq!(switch.state().await.reason.as_deref(), Some("drill"));

        switch.release().await;
        assert!(!switch.is_engaged().await.unwrap());
    }

    #[tokio::test]
    async fn test_flag_file_switch() {
        let path = std::env::temp_dir().join(format!("tally-kill-{}", uuid::Uuid::new_v4()));
        let switch = FileKillSwitch::new(&path);
        assert!(!switch.is_engaged().await.unwrap());

        tokio::fs::write(&path, b"halt").await.unwrap();
        assert!(switch.is_engaged().await.unwrap());
        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_any_switch() {
        let a = Arc::new(InProcessKillSwitch::new());
        let b = Arc::new(InProcessKillSwitch::new());
        let any = AnyKillSwitch::new(vec![a.clone(), b.clone()]);
        assert!(!any.is_engaged().await.unwrap());
        b.engage("b").await;
        assert!(any.is_engaged().await.unwrap());
    }
}
