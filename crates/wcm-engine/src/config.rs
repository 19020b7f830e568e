use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wcm_core::CollectorProfile;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: Option<String>,
    pub web_port: u16,
    pub notify_webhook_url: Option<String>,
    pub notify_timeout_secs: u64,
    pub utc_offset_hours: i32,
    pub roster_path: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            web_port: 8000,
            notify_webhook_url: None,
            notify_timeout_secs: 10,
            utc_offset_hours: 8,
            roster_path: PathBuf::from("collectors.yaml"),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            web_port: std::env::var("WCM_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.web_port),
            notify_webhook_url: std::env::var("WCM_NOTIFY_WEBHOOK_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            notify_timeout_secs: std::env::var("WCM_NOTIFY_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.notify_timeout_secs),
            utc_offset_hours: std::env::var("WCM_UTC_OFFSET_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.utc_offset_hours),
            roster_path: std::env::var("WCM_ROSTER_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.roster_path),
        }
    }

    pub fn utc_offset(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_hours * 3600)
            .with_context(|| format!("WCM_UTC_OFFSET_HOURS={} is out of range", self.utc_offset_hours))
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.notify_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub contact_number: Option<String>,
    /// Initial duty flag for the built-in attendance source.
    #[serde(default)]
    pub on_duty: bool,
}

impl RosterEntry {
    pub fn profile(&self) -> CollectorProfile {
        CollectorProfile {
            id: self.id,
            name: self.name.clone(),
            contact_number: self.contact_number.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roster {
    #[serde(default)]
    pub collectors: Vec<RosterEntry>,
}

/// Reads a YAML roster. A missing file is an empty roster.
pub fn load_roster(path: &Path) -> Result<Roster> {
    if !path.exists() {
        return Ok(Roster::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading roster {}", path.display()))?;
    let roster: Roster = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing roster {}", path.display()))?;
    Ok(roster)
}
