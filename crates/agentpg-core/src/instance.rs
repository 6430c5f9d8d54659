// Instance and leader entities
//
// An instance is one worker process. Liveness is judged solely from
// last_heartbeat_at against the database clock; active-run and active-tool
// counts are derived from claim rows, never stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: Uuid,
    pub name: Option<String>,
    pub hostname: Option<String>,
    pub pid: Option<i32>,
    pub version: Option<String>,

    pub max_concurrent_runs: i32,
    pub max_concurrent_tools: i32,

    pub metadata: HashMap<String, String>,

    pub created_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

/// Input for registering an instance
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub id: Uuid,
    pub name: Option<String>,
    pub hostname: Option<String>,
    pub pid: Option<i32>,
    pub version: Option<String>,
    pub max_concurrent_runs: i32,
    pub max_concurrent_tools: i32,
    pub metadata: HashMap<String, String>,
}

impl NewInstance {
    pub fn new(id: Uuid, max_concurrent_runs: i32, max_concurrent_tools: i32) -> Self {
        Self {
            id,
            name: None,
            hostname: hostname_best_effort(),
            pid: Some(std::process::id() as i32),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            max_concurrent_runs,
            max_concurrent_tools,
            metadata: HashMap::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

fn hostname_best_effort() -> Option<String> {
    std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty())
}

/// The singleton leader lease. Absent or expired row means no leader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leader {
    /// Always "default"; the table holds at most one row per name
    pub name: String,
    pub leader_instance_id: Uuid,
    pub elected_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Lease name used by the single cleanup leader.
pub const LEADER_NAME: &str = "default";
