/// Routing of committed field updates to valuation engines
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::{DocumentId, FieldPath, Operation, OperationKind, Result};

/// A committed structured update, as seen by a valuation engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValuationUpdate {
    pub document_id: DocumentId,

    /// Version that committed the update; engines may see the same version
    /// more than once after a resync and must treat it idempotently
    pub version: u64,

    pub path: FieldPath,
    pub value: Option<Value>,
    pub data_type: String,
}

impl ValuationUpdate {
    /// Extracts the routable part of a committed operation
    pub fn from_operation(op: &Operation, version: u64) -> Option<Self> {
        match &op.kind {
            OperationKind::Update {
                path,
                value,
                data_type: Some(data_type),
            } => Some(Self {
                document_id: op.document_id,
                version,
                path: path.clone(),
                value: value.clone(),
                data_type: data_type.clone(),
            }),
            _ => None,
        }
    }
}

/// Financial model recomputed from document fields (DCF, LBO, M&A, ...)
pub trait ValuationEngine: Send + Sync {
    /// The `data_type` tag this engine handles, e.g. `"dcf"`
    fn domain(&self) -> &str;

    fn apply_update(&self, update: &ValuationUpdate) -> Result<()>;
}

/// Dispatches updates to the engine registered for their `data_type`
#[derive(Clone, Default)]
pub struct ValuationRouter {
    engines: Vec<Arc<dyn ValuationEngine>>,
}

impl ValuationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_engine(mut self, engine: Arc<dyn ValuationEngine>) -> Self {
        self.register(engine);
        self
    }

    /// Register an engine; a later engine for the same domain replaces the earlier one
    pub fn register(&mut self, engine: Arc<dyn ValuationEngine>) {
        self.engines.retain(|e| e.domain() != engine.domain());
        self.engines.push(engine);
    }

    pub fn domains(&self) -> Vec<&str> {
        self.engines.iter().map(|e| e.domain()).collect()
    }

    /// Forward a committed operation. Engine failures never affect the
    /// document; they are logged and reported as `false`.
    pub fn dispatch(&self, op: &Operation, version: u64) -> bool {
        let Some(update) = ValuationUpdate::from_operation(op, version) else {
            return false;
        };
        let Some(engine) = self.engines.iter().find(|e| e.domain() == update.data_type) else {
            tracing::debug!(data_type = %update.data_type, "no valuation engine registered");
            return false;
        };
        match engine.apply_update(&update) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(
                    data_type = %update.data_type,
                    path = %update.path,
                    error = %err,
                    "valuation engine rejected update"
                );
                false
            }
        }
    }
}
