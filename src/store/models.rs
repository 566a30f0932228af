/*!
Persistence shapes for the flow aggregate (used by the SQLite store and
any future durable backends).

Design Goals:
- Explicit serde-friendly structs decoupled from the in-memory records.
- Conversion logic localized (From / TryFrom impls) so backend code stays
  lean and declarative.
- Forward compatibility: unknown status encodings decode as `Failed`, so a
  corrupt row can never look active.

This module intentionally does NOT perform I/O. It is pure data
transformation and (de)serialization glue.
*/

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::{ChildRecord, ErrorDetail, FlowState, MasterRecord, PhaseRecord};
use crate::types::{FlowId, FlowStatus};

/// Persisted shape of one `phase_state` entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedPhaseRecord {
    pub status: String,
    pub attempts: u32,
    #[serde(default)]
    pub requires_user_input: bool,
    #[serde(default)]
    pub delta: Value,
    #[serde(default)]
    pub user_input: Option<Value>,
    #[serde(default)]
    pub error: Option<ErrorDetail>,
    pub sequence: u32,
    /// RFC3339 string forms keep chrono out of the serialized shape.
    pub started_at: String,
    #[serde(default)]
    pub finished_at: Option<String>,
}

/// Persisted shape of the master record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedMaster {
    pub id: String,
    pub flow_type: String,
    pub status: String,
    #[serde(default)]
    pub current_phase: Option<String>,
    pub tenant_id: String,
    pub engagement_id: String,
    #[serde(default)]
    pub phase_state: FxHashMap<String, PersistedPhaseRecord>,
    #[serde(default)]
    pub error: Option<ErrorDetail>,
    #[serde(default)]
    pub cancel_requested: bool,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// Persisted shape of the child record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedChild {
    pub id: String,
    pub flow_type: String,
    #[serde(default)]
    pub fields: FxHashMap<String, Value>,
    #[serde(default)]
    pub phase_complete: FxHashMap<String, bool>,
    pub updated_at: String,
}

fn parse_rfc3339(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/* ---------- PhaseRecord <-> PersistedPhaseRecord ---------- */

impl From<&PhaseRecord> for PersistedPhaseRecord {
    fn from(r: &PhaseRecord) -> Self {
        PersistedPhaseRecord {
            status: r.status.encode().to_string(),
            attempts: r.attempts,
            requires_user_input: r.requires_user_input,
            delta: r.delta.clone(),
            user_input: r.user_input.clone(),
            error: r.error.clone(),
            sequence: r.sequence,
            started_at: r.started_at.to_rfc3339(),
            finished_at: r.finished_at.map(|t| t.to_rfc3339()),
        }
    }
}

impl From<PersistedPhaseRecord> for PhaseRecord {
    fn from(p: PersistedPhaseRecord) -> Self {
        PhaseRecord {
            status: crate::types::PhaseStatus::decode(&p.status),
            attempts: p.attempts,
            requires_user_input: p.requires_user_input,
            delta: p.delta,
            user_input: p.user_input,
            error: p.error,
            sequence: p.sequence,
            started_at: parse_rfc3339(&p.started_at),
            finished_at: p.finished_at.as_deref().map(parse_rfc3339),
        }
    }
}

/* ---------- MasterRecord <-> PersistedMaster ---------- */

impl From<&MasterRecord> for PersistedMaster {
    fn from(m: &MasterRecord) -> Self {
        PersistedMaster {
            id: m.id.as_str().to_string(),
            flow_type: m.flow_type.clone(),
            status: m.status.encode().to_string(),
            current_phase: m.current_phase.clone(),
            tenant_id: m.tenant_id.clone(),
            engagement_id: m.engagement_id.clone(),
            phase_state: m
                .phase_state
                .iter()
                .map(|(k, v)| (k.clone(), PersistedPhaseRecord::from(v)))
                .collect(),
            error: m.error.clone(),
            cancel_requested: m.cancel_requested,
            version: m.version as i64,
            created_at: m.created_at.to_rfc3339(),
            updated_at: m.updated_at.to_rfc3339(),
        }
    }
}

impl From<PersistedMaster> for MasterRecord {
    fn from(p: PersistedMaster) -> Self {
        MasterRecord {
            id: FlowId::from(p.id),
            flow_type: p.flow_type,
            status: FlowStatus::decode(&p.status),
            current_phase: p.current_phase,
            tenant_id: p.tenant_id,
            engagement_id: p.engagement_id,
            phase_state: p
                .phase_state
                .into_iter()
                .map(|(k, v)| (k, PhaseRecord::from(v)))
                .collect(),
            error: p.error,
            cancel_requested: p.cancel_requested,
            version: p.version.max(0) as u64,
            created_at: parse_rfc3339(&p.created_at),
            updated_at: parse_rfc3339(&p.updated_at),
        }
    }
}

/* ---------- ChildRecord <-> PersistedChild ---------- */

impl From<&ChildRecord> for PersistedChild {
    fn from(c: &ChildRecord) -> Self {
        PersistedChild {
            id: c.id.as_str().to_string(),
            flow_type: c.flow_type.clone(),
            fields: c.fields.clone(),
            phase_complete: c.phase_complete.clone(),
            updated_at: c.updated_at.to_rfc3339(),
        }
    }
}

impl From<PersistedChild> for ChildRecord {
    fn from(p: PersistedChild) -> Self {
        ChildRecord {
            id: FlowId::from(p.id),
            flow_type: p.flow_type,
            fields: p.fields,
            phase_complete: p.phase_complete,
            updated_at: parse_rfc3339(&p.updated_at),
        }
    }
}

/* ---------- Aggregate assembly ---------- */

/// Reassemble the aggregate from its two persisted halves.
#[must_use]
pub fn assemble(master: PersistedMaster, child: PersistedChild) -> FlowState {
    FlowState {
        master: MasterRecord::from(master),
        child: ChildRecord::from(child),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestContext;
    use crate::types::PhaseStatus;
    use serde_json::json;

    #[test]
    fn aggregate_round_trips_through_persisted_shapes() {
        let ctx = RequestContext::new("tenant-a", "eng-1", "user-1");
        let mut state = FlowState::new("discovery", &ctx, &json!({"data_ref": "abc"}));
        state.begin_phase("validate").unwrap();
        state.record_phase("validate", PhaseStatus::Succeeded, json!({"rows": 10}));
        state.record_phase("map_fields", PhaseStatus::Paused, json!({"proposal": []}));
        state.mark_paused("map_fields").unwrap();

        let master = PersistedMaster::from(&state.master);
        let child = PersistedChild::from(&state.child);
        let master_json = serde_json::to_string(&master).unwrap();
        let child_json = serde_json::to_string(&child).unwrap();

        let restored = assemble(
            serde_json::from_str(&master_json).unwrap(),
            serde_json::from_str(&child_json).unwrap(),
        );
        assert_eq!(restored, state);
    }

    #[test]
    fn unknown_status_decodes_as_failed() {
        let raw = PersistedMaster {
            id: "f-1".into(),
            flow_type: "discovery".into(),
            status: "something_new".into(),
            current_phase: None,
            tenant_id: "t".into(),
            engagement_id: "e".into(),
            phase_state: FxHashMap::default(),
            error: None,
            cancel_requested: false,
            version: 3,
            created_at: Utc::now().to_rfc3339(),
            updated_at: Utc::now().to_rfc3339(),
        };
        let master = MasterRecord::from(raw);
        assert_eq!(master.status, FlowStatus::Failed);
        assert!(master.status.is_terminal());
    }
}
