//! Data model shared between the reconciler, the transport layer and the
//! control-surface collaborators.
//!
//! The engine never owns an entity: `EntityModel` values are owned by their
//! control (behind an `Arc`) and observed here through weak handles. Raw
//! option maps are kept as JSON values because that is how they arrive from
//! the surface and how they leave on the wire.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Stable entity identifier, unique across the connection.
pub type EntityId = String;

/// Identifier of the control that owns an entity.
pub type ControlId = String;

/// Identifier of a variable referenced from entity options.
pub type VariableId = String;

/// Module-side schema version an entity was last saved against.
pub type UpgradeIndex = i64;

/// Raw or parsed entity option map.
pub type OptionsMap = Map<String, Value>;

/// The two entity kinds a control can host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Fire-on-press behavior attached to a control.
    Action,
    /// Continuously evaluated state that may drive control rendering.
    Feedback,
}

/// A user-configured entity as observed on the control surface.
///
/// Instances are owned by their control; the reconciler only holds a
/// `Weak` handle to them and must tolerate the control reclaiming the
/// value at any point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityModel {
    /// Stable entity id.
    pub id: EntityId,
    /// Action or feedback.
    pub kind: EntityKind,
    /// Module-side type id this entity instantiates.
    pub definition_id: String,
    /// Raw option values as configured by the user.
    pub options: OptionsMap,
    /// Schema version the entity was last saved against.
    /// `None` means the entity was created against the current schema.
    pub upgrade_index: Option<UpgradeIndex>,
    /// Disabled entities are still tracked and upgraded but the module
    /// treats them as inert.
    pub disabled: bool,
    /// Feedback-only: whether the produced value is inverted.
    #[serde(default)]
    pub is_inverted: bool,
}

/// Kind of an option field within an entity definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionFieldKind {
    /// Free-form text; the only kind that can carry variable references.
    TextInput,
    Number,
    Checkbox,
    Dropdown,
    MultiDropdown,
    Colorpicker,
    /// Display-only field; never carries a value.
    StaticText,
}

/// One option field declared by an entity definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionField {
    /// Field id, the key under which values appear in the option map.
    pub id: String,
    /// Field kind.
    pub kind: OptionFieldKind,
    /// Whether textual values of this field should have variable
    /// references substituted.
    #[serde(default)]
    pub use_variables: bool,
}

/// Module-provided description of an entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDefinition {
    /// Module-side type id.
    pub id: String,
    /// Entity kind this definition describes.
    pub kind: EntityKind,
    /// Declared option fields. Values for undeclared fields are dropped
    /// at the parsing boundary.
    pub option_fields: Vec<OptionField>,
    /// Field ids whose variable references must not cause re-runs when
    /// the variable changes.
    #[serde(default)]
    pub ignored_for_subscribe: HashSet<String>,
    /// When false the module has no subscribe/unsubscribe/callback work
    /// for this entity type and never needs to hear about instances.
    pub has_lifecycle_functions: bool,
}

impl EntityDefinition {
    /// Look up a declared field by id.
    #[must_use]
    pub fn field(&self, id: &str) -> Option<&OptionField> {
        self.option_fields.iter().find(|field| field.id == id)
    }
}

/// Replacement model produced by a module upgrade, handed back to the
/// owning control for persistence and re-tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityReplacement {
    /// Entity id the replacement applies to.
    pub id: EntityId,
    /// Action or feedback.
    pub kind: EntityKind,
    /// Possibly rewritten module-side type id.
    pub definition_id: String,
    /// Migrated option values.
    pub options: OptionsMap,
    /// Feedback-only: migrated style overrides, opaque to the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<Value>,
    /// Feedback-only: migrated inversion flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_inverted: Option<bool>,
    /// Schema version the replacement is saved against. Monotonically
    /// non-decreasing across successive upgrades of the same entity.
    pub upgrade_index: UpgradeIndex,
}

/// Pixel dimensions of a control's rendered bitmap, resolved per control
/// and attached to feedback updates as a rendering hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitmapSize {
    pub width: u32,
    pub height: u32,
}
