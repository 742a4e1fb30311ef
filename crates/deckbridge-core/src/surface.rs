//! Trait seams toward the control surface.
//!
//! The reconciler reads controls, entity definitions and the variable
//! parser through these traits; production wires them to the live object
//! store while tests substitute in-memory fakes. All three seams are
//! synchronous: the engine's public API must complete without suspension,
//! and every lookup here happens inside one of those calls or inside a
//! drain pass.

use std::collections::HashSet;
use std::sync::Arc;

use crate::model::{
    BitmapSize, ControlId, EntityDefinition, EntityKind, EntityReplacement, VariableId,
};

/// Error returned when a control rejects a replacement model.
///
/// The reconciler logs and swallows this; the record keeps the state the
/// transition table assigned before delivery.
#[derive(Debug, thiserror::Error)]
#[error("control rejected entity replacement: {reason}")]
pub struct ReplaceError {
    /// Control-provided rejection reason.
    pub reason: String,
}

impl ReplaceError {
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// One user-facing control (a button or similar) that owns entities.
pub trait SurfaceControl: Send + Sync {
    /// Whether this control type hosts entities at all.
    fn supports_entities(&self) -> bool;

    /// Persist an upgraded entity model and re-track the resulting
    /// entity. May synchronously call back into the reconciler's `track`.
    fn replace_entity(&self, replacement: EntityReplacement) -> Result<(), ReplaceError>;

    /// Pixel size of the control's rendered bitmap, if it renders one.
    fn bitmap_size(&self) -> Option<BitmapSize>;
}

/// Read access to the live control store.
pub trait ControlStore: Send + Sync {
    /// Look up a control by id. `None` means the control no longer
    /// exists.
    fn control(&self, control_id: &str) -> Option<Arc<dyn SurfaceControl>>;
}

/// Read access to the module's entity definitions.
///
/// Actions and feedbacks live in separate definition namespaces, so
/// lookups are keyed by kind as well as id.
pub trait DefinitionStore: Send + Sync {
    fn definition(&self, kind: EntityKind, definition_id: &str) -> Option<Arc<EntityDefinition>>;
}

/// Result of substituting variable references in one piece of text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedExpression {
    /// Text with variable references substituted.
    pub text: String,
    /// Ids of every variable the substitution touched.
    pub variable_ids: HashSet<VariableId>,
}

/// Variable/expression substitution over option text.
///
/// The control id scopes local variables; the parser resolves them the
/// same way the rest of the surface does.
pub trait VariablesParser: Send + Sync {
    fn parse_variables(&self, text: &str, control_id: &ControlId) -> ParsedExpression;
}
