//! Command/Settings (C8): in-channel commands and typed, org-scoped
//! settings.
//!
//! `parse_command` is a pure function over the already-normalized event
//! text (command interception happens in [`crate::platform`] before a
//! [`crate::dispatch::Scheduler`] call is ever made, per spec §4.6).

use std::sync::Arc;

use crate::db::Datastore;
use crate::error::{BrokerError, Result};
use crate::ids::OrgId;
use crate::models::SettingValue;

/// The verb set named in spec §4.8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    SetRepo(String),
    Status,
}

/// Setting keys the broker recognizes; anything else is rejected.
const KNOWN_SETTING_KEYS: &[&str] = &["idle_job_threshold_minutes", "agent_inactive_threshold_minutes"];

/// Parses in-channel command text against `prefix` (default `/cc`).
/// Returns `None` if `text` does not start with the prefix — the caller
/// then falls through to normal dispatch.
pub fn parse_command(text: &str, prefix: &str) -> Option<Command> {
    let rest = text.trim().strip_prefix(prefix)?;
    let rest = rest.trim();
    let mut parts = rest.splitn(2, char::is_whitespace);
    let verb = parts.next().unwrap_or("").to_lowercase();
    let arg = parts.next().unwrap_or("").trim();

    match verb.as_str() {
        "help" | "" => Some(Command::Help),
        "status" => Some(Command::Status),
        "set-repo" if !arg.is_empty() => Some(Command::SetRepo(arg.to_string())),
        _ => None,
    }
}

/// Org-scoped typed settings, backing both C8's settings verbs and the
/// idle/inactive threshold overrides referenced by [`crate::jobstore`] and
/// [`crate::tasks::stale_agent_sweep`].
pub struct Settings {
    db: Arc<dyn Datastore>,
}

impl Settings {
    pub fn new(db: Arc<dyn Datastore>) -> Self {
        Self { db }
    }

    pub async fn get(&self, org_id: &OrgId, key: &str) -> Result<Option<SettingValue>> {
        if !KNOWN_SETTING_KEYS.contains(&key) {
            return Err(BrokerError::Validation(format!("unknown setting key {key:?}")));
        }
        self.db.get_setting(org_id, key).await
    }

    pub async fn upsert(&self, org_id: &OrgId, key: &str, value: SettingValue) -> Result<()> {
        if !KNOWN_SETTING_KEYS.contains(&key) {
            return Err(BrokerError::Validation(format!("unknown setting key {key:?}")));
        }
        self.db.upsert_setting(org_id, key, value).await
    }

    /// Per-org idle threshold override, falling back to `default_minutes`
    /// (the instance-wide config default) when unset or malformed.
    pub async fn idle_threshold_minutes(&self, org_id: &OrgId, default_minutes: i64) -> i64 {
        match self.db.get_setting(org_id, "idle_job_threshold_minutes").await {
            Ok(Some(SettingValue::Str(s))) => s.parse().unwrap_or(default_minutes),
            _ => default_minutes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_verbs() {
        assert_eq!(parse_command("/cc help", "/cc"), Some(Command::Help));
        assert_eq!(parse_command("/cc status", "/cc"), Some(Command::Status));
        assert_eq!(
            parse_command("/cc set-repo https://example.com/org/repo", "/cc"),
            Some(Command::SetRepo("https://example.com/org/repo".to_string()))
        );
    }

    #[test]
    fn ignores_non_command_text() {
        assert_eq!(parse_command("hello there", "/cc"), None);
    }

    #[test]
    fn rejects_set_repo_without_argument() {
        assert_eq!(parse_command("/cc set-repo", "/cc"), None);
    }

    #[test]
    fn bare_prefix_is_help() {
        assert_eq!(parse_command("/cc", "/cc"), Some(Command::Help));
    }

    #[tokio::test]
    async fn rejects_unknown_setting_keys() {
        let db = Arc::new(crate::testutil::FakeDatastore::new());
        let org = db.seed_org().await;
        let settings = Settings::new(db);
        let err = settings.get(&org, "not_a_real_key").await.unwrap_err();
        assert!(matches!(err, BrokerError::Validation(_)));
    }
}
