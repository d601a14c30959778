use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ActiveAgentId, AssignmentId, JobId, OrgId};

/// The unique link between one agent and one job. A partial unique index on
/// `job_id` enforces the at-most-one-agent-per-job invariant at the
/// database layer; the scheduler also checks it before inserting so the
/// failure surfaces as a typed conflict rather than a raw constraint error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentJobAssignment {
    pub id: AssignmentId,
    pub org_id: OrgId,
    pub agent_id: ActiveAgentId,
    pub job_id: JobId,
    pub created_at: DateTime<Utc>,
}
