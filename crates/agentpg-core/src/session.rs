// Session entity
//
// A session is a conversation thread, addressable by (tenant, identifier).
// Agent-as-tool creates child sessions that reference their parent; depth
// mirrors the run nesting depth.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,

    /// Tenant scope for multi-tenant deployments
    pub tenant: String,

    /// Caller-chosen identifier, unique per tenant
    pub identifier: String,

    pub parent_session_id: Option<Uuid>,
    pub depth: i32,

    pub metadata: HashMap<String, String>,

    /// Times this session's history has been compacted
    pub compaction_count: i32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a session
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub tenant: String,
    pub identifier: String,
    pub parent_session_id: Option<Uuid>,
    pub depth: i32,
    pub metadata: HashMap<String, String>,
}

impl NewSession {
    pub fn new(tenant: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            identifier: identifier.into(),
            ..Default::default()
        }
    }

    pub fn with_parent(mut self, parent: &Session) -> Self {
        self.parent_session_id = Some(parent.id);
        self.depth = parent.depth + 1;
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A compaction event recorded after the compactor runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionEvent {
    pub id: Uuid,
    pub session_id: Uuid,
    pub preserved_message_ids: Vec<Uuid>,
    pub summary_message_id: Option<Uuid>,
    pub strategy: String,
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_session_depth() {
        let parent = Session {
            id: Uuid::now_v7(),
            tenant: "acme".into(),
            identifier: "support-1".into(),
            parent_session_id: None,
            depth: 0,
            metadata: HashMap::new(),
            compaction_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let child = NewSession::new("acme", "support-1/inner").with_parent(&parent);
        assert_eq!(child.depth, 1);
        assert_eq!(child.parent_session_id, Some(parent.id));
    }
}
