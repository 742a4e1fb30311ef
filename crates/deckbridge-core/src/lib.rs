//! deckbridge-core: entity reconciliation between a control surface and
//! external modules.
//!
//! A control surface hosts controls (buttons) whose user-configured
//! entities — actions and feedbacks — are executed by an external module
//! process. This crate keeps the module's view of those entities in sync:
//! it tracks every entity the module should know about, runs stale ones
//! through the module's versioned migration pipeline, substitutes
//! variable references inside entity options, reacts to variable and
//! definition changes, and batches the resulting update/delete/upgrade
//! RPCs behind a debounce window.
//!
//! # Architecture
//!
//! ```text
//! surface mutations ──► record table ──► debounced drain
//!  (track / forget /        │                 │
//!   variable & definition   │        classify into batches
//!   changes / start)        │                 │
//!                           ▼                 ▼
//!                     per-entity       update / upgrade RPCs
//!                    state machine ◄── reply reconciliation
//! ```
//!
//! # Modules
//!
//! - `config`: debounce tunables
//! - `logging`: tracing subscriber setup
//! - `model`: entities, definitions, replacements
//! - `options`: option sanitization and variable substitution
//! - `reconciler`: record table, public API, batch scheduler
//! - `record`: per-entity tracking cells
//! - `state`: per-entity state machine
//! - `surface`: control-surface collaborator traits
//! - `transport`: module RPC payloads and the transport adapter
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod config;
pub mod logging;
pub mod model;
pub mod options;
pub mod reconciler;
pub mod record;
pub mod state;
pub mod surface;
pub mod transport;

pub use config::ReconcilerConfig;
pub use model::{
    BitmapSize, ControlId, EntityDefinition, EntityId, EntityKind, EntityModel,
    EntityReplacement, OptionField, OptionFieldKind, OptionsMap, UpgradeIndex, VariableId,
};
pub use options::{parse_entity_options, ParsedOptions};
pub use reconciler::{EntityReconciler, ReconcilerDeps, ReconcilerMetrics};
pub use record::WrapperId;
pub use state::EntityState;
pub use surface::{
    ControlStore, DefinitionStore, ParsedExpression, ReplaceError, SurfaceControl,
    VariablesParser,
};
pub use transport::{
    ActionInstance, EntityTransport, EntityUpdate, EntityUpgradeItem, EntityUpsert,
    FeedbackInstance, ModuleLink, ModuleTransportAdapter, TransportError,
    UpdateActionsRequest, UpdateFeedbacksRequest, UpgradeEntitiesReply, UpgradeEntitiesRequest,
    UpgradedActionEntry, UpgradedFeedbackEntry,
};
