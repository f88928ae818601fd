//! Provenance record types
//!
//! A provenance record is the immutable audit artifact written once for every
//! successfully completed run.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::consortium::Consortium;
use crate::domain::run::Run;

/// Run fields that never make it into a provenance record
pub const EXCLUDED_RUN_FIELDS: [&str; 5] = [
    "clients",
    "consortiumId",
    "localPipelineState",
    "remotePipelineState",
    "runState",
];

/// Immutable audit record of a completed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    #[serde(flatten)]
    pub run: Map<String, Value>,
    pub consortium: ConsortiumSummary,
    pub clients: Vec<ClientSummary>,
}

/// Minimal consortium identity kept in provenance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsortiumSummary {
    pub id: String,
    pub name: String,
}

/// A run participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSummary {
    pub id: String,
    pub username: String,
}

impl ProvenanceRecord {
    /// Derives the record from a run and the consortium it ran in
    pub fn from_run(run: &Run, consortium: &Consortium) -> Result<Self, serde_json::Error> {
        let mut fields = match serde_json::to_value(run)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        for field in EXCLUDED_RUN_FIELDS {
            fields.remove(field);
        }

        let clients = run
            .clients
            .iter()
            .map(|(id, username)| ClientSummary {
                id: id.clone(),
                username: username.clone(),
            })
            .collect();

        Ok(Self {
            run: fields,
            consortium: ConsortiumSummary {
                id: consortium.id.clone(),
                name: consortium.name.clone(),
            },
            clients,
        })
    }

    /// Id of the run this record describes
    pub fn run_id(&self) -> Option<&str> {
        self.run.get("id").and_then(Value::as_str)
    }
}
