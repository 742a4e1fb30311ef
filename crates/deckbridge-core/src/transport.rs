//! Module transport: wire payloads, the RPC seam and the adapter that
//! maps the reconciler's kind-agnostic batches onto the module's
//! per-kind RPCs.
//!
//! The reconciler speaks [`EntityTransport`]: one call to push the
//! current shape of a batch of entities (upserts and tombstones mixed)
//! and one call to run a batch through the module's migration pipeline.
//! [`ModuleTransportAdapter`] implements it over a [`ModuleLink`],
//! splitting by entity kind and resolving per-control bitmap sizes for
//! feedback updates, cached within a single batch.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{
    BitmapSize, ControlId, EntityId, EntityKind, EntityReplacement, OptionsMap, UpgradeIndex,
};
use crate::surface::ControlStore;

/// Error surfaced by the module RPC layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The module rejected or failed the request.
    #[error("module rpc failed: {0}")]
    Rpc(String),
    /// The module connection is gone.
    #[error("module connection closed")]
    Disconnected,
}

/// Action instance as the module sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionInstance {
    pub id: EntityId,
    pub control_id: ControlId,
    /// Module-side action type id.
    pub action_id: String,
    pub options: OptionsMap,
    pub upgrade_index: Option<UpgradeIndex>,
    pub disabled: bool,
}

/// Feedback instance as the module sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackInstance {
    pub id: EntityId,
    pub control_id: ControlId,
    /// Module-side feedback type id.
    pub feedback_id: String,
    pub options: OptionsMap,
    pub upgrade_index: Option<UpgradeIndex>,
    pub disabled: bool,
    /// Rendering hint: bitmap size of the owning control, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<BitmapSize>,
    pub is_inverted: bool,
}

/// `update_actions` payload. A `None` value is a tombstone: the module
/// must drop everything it holds for that id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateActionsRequest {
    pub actions: HashMap<EntityId, Option<ActionInstance>>,
}

/// `update_feedbacks` payload, same tombstone convention.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateFeedbacksRequest {
    pub feedbacks: HashMap<EntityId, Option<FeedbackInstance>>,
}

/// `upgrade_actions_and_feedbacks` payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpgradeEntitiesRequest {
    pub actions: Vec<ActionInstance>,
    pub feedbacks: Vec<FeedbackInstance>,
    /// Index migrations start from for entities that never recorded one.
    pub default_upgrade_index: UpgradeIndex,
}

/// Migrated action returned from an upgrade. Entries absent from the
/// reply are unchanged on the module side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradedActionEntry {
    pub id: EntityId,
    pub action_id: String,
    pub options: OptionsMap,
}

/// Migrated feedback returned from an upgrade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradedFeedbackEntry {
    pub id: EntityId,
    pub feedback_id: String,
    pub options: OptionsMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_inverted: Option<bool>,
}

/// `upgrade_actions_and_feedbacks` reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpgradeEntitiesReply {
    pub updated_actions: Vec<UpgradedActionEntry>,
    pub updated_feedbacks: Vec<UpgradedFeedbackEntry>,
}

/// The module-side RPC surface the engine drives.
#[async_trait]
pub trait ModuleLink: Send + Sync {
    async fn update_actions(&self, request: UpdateActionsRequest) -> Result<(), TransportError>;

    async fn update_feedbacks(&self, request: UpdateFeedbacksRequest)
        -> Result<(), TransportError>;

    async fn upgrade_actions_and_feedbacks(
        &self,
        request: UpgradeEntitiesRequest,
    ) -> Result<UpgradeEntitiesReply, TransportError>;
}

/// One entity snapshot the module should adopt.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityUpsert {
    pub id: EntityId,
    pub kind: EntityKind,
    pub control_id: ControlId,
    pub definition_id: String,
    /// Parsed options, post-sanitization.
    pub options: OptionsMap,
    pub upgrade_index: Option<UpgradeIndex>,
    pub disabled: bool,
    pub is_inverted: bool,
}

/// One work item in an update batch.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityUpdate {
    /// Adopt this snapshot.
    Upsert(EntityUpsert),
    /// Drop everything held for this id.
    Delete { id: EntityId, kind: EntityKind },
}

/// One entity in an upgrade batch. Options are raw: migration scripts
/// operate on what the user saved, not on parsed text.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityUpgradeItem {
    pub id: EntityId,
    pub kind: EntityKind,
    pub control_id: ControlId,
    pub definition_id: String,
    pub options: OptionsMap,
    pub upgrade_index: Option<UpgradeIndex>,
    pub disabled: bool,
    pub is_inverted: bool,
}

/// Abstract transport the batch scheduler dispatches to.
#[async_trait]
pub trait EntityTransport: Send + Sync {
    /// Push updates and tombstones. Fire-and-forget: the result is only
    /// used for logging, records are already in their target state.
    async fn update_entities(&self, items: Vec<EntityUpdate>) -> Result<(), TransportError>;

    /// Run a batch through the module's migration pipeline. Returns the
    /// replacement model per entity id; ids absent from the map came
    /// back unchanged.
    async fn upgrade_entities(
        &self,
        items: Vec<EntityUpgradeItem>,
        current_upgrade_index: UpgradeIndex,
    ) -> Result<HashMap<EntityId, EntityReplacement>, TransportError>;
}

/// [`EntityTransport`] over a live [`ModuleLink`].
pub struct ModuleTransportAdapter {
    link: Arc<dyn ModuleLink>,
    controls: Arc<dyn ControlStore>,
}

impl ModuleTransportAdapter {
    #[must_use]
    pub fn new(link: Arc<dyn ModuleLink>, controls: Arc<dyn ControlStore>) -> Self {
        Self { link, controls }
    }

    /// Bitmap size for a control, memoized in `cache` for the duration
    /// of one batch.
    fn bitmap_size_cached(
        &self,
        cache: &mut HashMap<ControlId, Option<BitmapSize>>,
        control_id: &ControlId,
    ) -> Option<BitmapSize> {
        *cache.entry(control_id.clone()).or_insert_with(|| {
            self.controls
                .control(control_id)
                .and_then(|control| control.bitmap_size())
        })
    }
}

#[async_trait]
impl EntityTransport for ModuleTransportAdapter {
    async fn update_entities(&self, items: Vec<EntityUpdate>) -> Result<(), TransportError> {
        let mut actions: HashMap<EntityId, Option<ActionInstance>> = HashMap::new();
        let mut feedbacks: HashMap<EntityId, Option<FeedbackInstance>> = HashMap::new();
        let mut bitmap_cache: HashMap<ControlId, Option<BitmapSize>> = HashMap::new();

        for item in items {
            match item {
                EntityUpdate::Upsert(upsert) => match upsert.kind {
                    EntityKind::Action => {
                        actions.insert(
                            upsert.id.clone(),
                            Some(ActionInstance {
                                id: upsert.id,
                                control_id: upsert.control_id,
                                action_id: upsert.definition_id,
                                options: upsert.options,
                                upgrade_index: upsert.upgrade_index,
                                disabled: upsert.disabled,
                            }),
                        );
                    }
                    EntityKind::Feedback => {
                        let image = self.bitmap_size_cached(&mut bitmap_cache, &upsert.control_id);
                        feedbacks.insert(
                            upsert.id.clone(),
                            Some(FeedbackInstance {
                                id: upsert.id,
                                control_id: upsert.control_id,
                                feedback_id: upsert.definition_id,
                                options: upsert.options,
                                upgrade_index: upsert.upgrade_index,
                                disabled: upsert.disabled,
                                image,
                                is_inverted: upsert.is_inverted,
                            }),
                        );
                    }
                },
                EntityUpdate::Delete { id, kind } => match kind {
                    EntityKind::Action => {
                        actions.insert(id, None);
                    }
                    EntityKind::Feedback => {
                        feedbacks.insert(id, None);
                    }
                },
            }
        }

        let mut first_error = None;
        if !actions.is_empty() {
            if let Err(err) = self.link.update_actions(UpdateActionsRequest { actions }).await {
                tracing::warn!(error = %err, "update_actions dispatch failed");
                first_error.get_or_insert(err);
            }
        }
        if !feedbacks.is_empty() {
            if let Err(err) = self
                .link
                .update_feedbacks(UpdateFeedbacksRequest { feedbacks })
                .await
            {
                tracing::warn!(error = %err, "update_feedbacks dispatch failed");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn upgrade_entities(
        &self,
        items: Vec<EntityUpgradeItem>,
        current_upgrade_index: UpgradeIndex,
    ) -> Result<HashMap<EntityId, EntityReplacement>, TransportError> {
        let mut request = UpgradeEntitiesRequest {
            actions: Vec::new(),
            feedbacks: Vec::new(),
            default_upgrade_index: 0,
        };
        for item in items {
            match item.kind {
                EntityKind::Action => request.actions.push(ActionInstance {
                    id: item.id,
                    control_id: item.control_id,
                    action_id: item.definition_id,
                    options: item.options,
                    upgrade_index: item.upgrade_index,
                    disabled: item.disabled,
                }),
                EntityKind::Feedback => request.feedbacks.push(FeedbackInstance {
                    id: item.id,
                    control_id: item.control_id,
                    feedback_id: item.definition_id,
                    options: item.options,
                    upgrade_index: item.upgrade_index,
                    disabled: item.disabled,
                    image: None,
                    is_inverted: item.is_inverted,
                }),
            }
        }

        let reply = self.link.upgrade_actions_and_feedbacks(request).await?;

        let mut replacements = HashMap::new();
        for entry in reply.updated_actions {
            replacements.insert(
                entry.id.clone(),
                EntityReplacement {
                    id: entry.id,
                    kind: EntityKind::Action,
                    definition_id: entry.action_id,
                    options: entry.options,
                    style: None,
                    is_inverted: None,
                    upgrade_index: current_upgrade_index,
                },
            );
        }
        for entry in reply.updated_feedbacks {
            replacements.insert(
                entry.id.clone(),
                EntityReplacement {
                    id: entry.id,
                    kind: EntityKind::Feedback,
                    definition_id: entry.feedback_id,
                    options: entry.options,
                    style: entry.style,
                    is_inverted: entry.is_inverted,
                    upgrade_index: current_upgrade_index,
                },
            );
        }
        Ok(replacements)
    }
}
