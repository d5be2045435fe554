//! The emitted event record.
//!
//! Every event the streamer hands downstream carries a stable UUID, the
//! job/run identity, a best-effort wall-clock stamp, and the opaque facet
//! payload. The only facet field this subsystem touches is `about.uuid`,
//! which must equal `event_id`.

use serde::Serialize;
use serde_json::{Value, json};
use uuid::Uuid;

/// One fully resolved harness event, ready for a downstream reporter.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HarnessEvent {
    pub event_id: String,
    pub job_id: String,
    pub run_id: String,
    /// Seconds since the epoch; inherited from the previous stamped
    /// record when the event carries none of its own.
    pub stamp: Option<f64>,
    pub facet_data: Value,
}

/// Source of event ids. Injectable so tests can make ids deterministic;
/// the default draws fresh v4 UUIDs.
pub type IdSource = Box<dyn FnMut() -> String + Send>;

pub fn default_id_source() -> IdSource {
    Box::new(|| Uuid::new_v4().to_string())
}

/// Adopt `facet_data.about.uuid` as the event id, generating and
/// installing one when the facet has none.
pub fn ensure_event_id(facet: &mut Value, ids: &mut IdSource) -> String {
    if let Some(existing) = facet.pointer("/about/uuid").and_then(Value::as_str) {
        return existing.to_string();
    }
    let id = ids();
    match facet {
        Value::Object(map) => {
            let about = map.entry("about").or_insert_with(|| json!({}));
            match about {
                Value::Object(about) => {
                    about.insert("uuid".to_string(), Value::String(id.clone()));
                }
                other => *other = json!({ "uuid": id }),
            }
        }
        // A facet that is not an object cannot carry the uuid; give it a
        // shape that can.
        other => *other = json!({ "about": { "uuid": id } }),
    }
    id
}
