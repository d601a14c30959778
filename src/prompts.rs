//! Canned system-message text posted into chat threads by the dispatch and
//! lifecycle engine (first-message refusal, reclaim notices, manual/agent
//! completion notices). Centralized here, in the teacher's convention of
//! keeping user-facing text out of the control-flow modules, so wording
//! changes do not touch `dispatch`/`lifecycle`/`tasks`.

/// Posted when a thread reply targets a job that does not exist.
pub const NEW_JOB_REQUIRES_TOP_LEVEL: &str = "new jobs can only be started from top-level messages";

/// Posted to the thread when an agent disconnects mid-job and the job is
/// reclaimed rather than re-queued.
pub const AGENT_DISCONNECTED: &str = "agent disconnected, job unassigned";

/// Posted when a user manually marks a job's thread root complete.
pub const MANUALLY_COMPLETED: &str = "Job manually marked as complete";

/// Posted by the idle-job reaper when it closes a job for inactivity.
pub fn idle_closed(minutes: i64) -> String {
    format!("closing this job after {minutes} minutes of inactivity")
}

/// Posted when an agent reports a protocol-level failure for a job.
pub fn job_failed(reason: &str) -> String {
    format!("job failed: {reason}")
}

/// Rendered for the `/cc status` command (§10 supplemented feature).
pub fn status_summary(live_agents: usize, in_progress: usize, queued: usize) -> String {
    format!("agents online: {live_agents} · in progress: {in_progress} · queued: {queued}")
}

/// Rendered for the `/cc help` command.
pub fn help_text(prefix: &str) -> String {
    format!("commands: `{prefix} help`, `{prefix} set-repo <url>`, `{prefix} status`")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_closed_mentions_minutes() {
        assert!(idle_closed(60).contains("60"));
    }
}
