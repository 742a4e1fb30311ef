//! The entity reconciler: record table, public API and the debounced
//! batch scheduler that drives all module I/O.
//!
//! Every public method edits the record table under a mutex and pokes
//! the scheduler; none of them suspends. The scheduler task debounces
//! pokes (sliding 10 ms window, 50 ms forced flush), then runs a drain
//! pass: classify every record into the update batch, the upgrade batch
//! or a removal, dispatch both batches, and reconcile the upgrade reply
//! against records that may have been replaced, forgotten or invalidated
//! while the RPC was in flight. Wrapper ids snapshotted at dispatch time
//! detect slot replacement across that suspension.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::config::ReconcilerConfig;
use crate::model::{
    ControlId, EntityId, EntityKind, EntityModel, EntityReplacement, UpgradeIndex, VariableId,
};
use crate::options::parse_entity_options;
use crate::record::{EntityRecord, WrapperId};
use crate::state::EntityState;
use crate::surface::{ControlStore, DefinitionStore, VariablesParser};
use crate::transport::{EntityTransport, EntityUpdate, EntityUpgradeItem, EntityUpsert};

/// Collaborators the reconciler reads and dispatches through.
#[derive(Clone)]
pub struct ReconcilerDeps {
    pub controls: Arc<dyn ControlStore>,
    pub definitions: Arc<dyn DefinitionStore>,
    pub parser: Arc<dyn VariablesParser>,
    pub transport: Arc<dyn EntityTransport>,
}

/// Saturating counters for observability and triage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilerMetrics {
    /// Drain passes executed with the gate open.
    pub drains: u64,
    /// Upserts handed to the transport.
    pub updates_emitted: u64,
    /// Tombstones handed to the transport.
    pub deletes_emitted: u64,
    /// Entities handed to the upgrade pipeline.
    pub upgrades_emitted: u64,
    /// Update batches whose dispatch failed (logged, not retried).
    pub update_dispatch_failures: u64,
    /// Upgrade batches whose dispatch failed.
    pub upgrade_dispatch_failures: u64,
    /// Replacement models delivered to their owning control.
    pub replacements_applied: u64,
    /// Replacement models discarded because the record was invalidated
    /// while the upgrade was in flight.
    pub replacements_discarded: u64,
    /// Upgrade reply slots ignored because the record was replaced or
    /// forgotten mid-flight.
    pub stale_reply_slots: u64,
    /// Records dropped after observing a reclaimed weak handle.
    pub reclaimed_records: u64,
    /// Replacements the owning control rejected.
    pub replace_failures: u64,
}

#[derive(Default)]
struct Table {
    records: HashMap<EntityId, EntityRecord>,
    /// Emission gate: closed until `start`, closed again by `destroy`.
    gate_open: bool,
    current_upgrade_index: UpgradeIndex,
    destroyed: bool,
    metrics: ReconcilerMetrics,
}

struct Shared {
    config: ReconcilerConfig,
    deps: ReconcilerDeps,
    table: Mutex<Table>,
    poke: Notify,
}

impl Shared {
    fn lock_table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Entity reconciliation engine for one module connection.
///
/// Cheap to clone; all clones share one record table and one scheduler
/// task. Construct with [`EntityReconciler::spawn`] from within a tokio
/// runtime, call [`start`](Self::start) once the module has declared
/// readiness, and [`destroy`](Self::destroy) when the connection goes
/// away.
#[derive(Clone)]
pub struct EntityReconciler {
    shared: Arc<Shared>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl EntityReconciler {
    /// Create the engine and spawn its scheduler task.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn spawn(deps: ReconcilerDeps, config: ReconcilerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            config,
            deps,
            table: Mutex::new(Table::default()),
            poke: Notify::new(),
        });
        tokio::spawn(scheduler_loop(Arc::clone(&shared), shutdown_rx));
        Self {
            shared,
            shutdown: Arc::new(shutdown_tx),
        }
    }

    /// Insert or replace the record for `entity`.
    ///
    /// Always resets the slot to `Unloaded` under a fresh wrapper id, so
    /// an upgrade reply racing with this call is detected and dropped.
    pub fn track(&self, entity: &Arc<EntityModel>, control_id: impl Into<ControlId>) {
        let control_id = control_id.into();
        {
            let mut table = self.shared.lock_table();
            if table.destroyed {
                return;
            }
            debug!(entity_id = %entity.id, control_id = %control_id, kind = ?entity.kind, "tracking entity");
            table
                .records
                .insert(entity.id.clone(), EntityRecord::new(entity, control_id));
        }
        self.shared.poke.notify_one();
    }

    /// Mark an entity for deletion. Unknown ids are a no-op; repeated
    /// calls are idempotent.
    pub fn forget(&self, entity_id: &str) {
        let known = {
            let mut table = self.shared.lock_table();
            if table.destroyed {
                return;
            }
            match table.records.get_mut(entity_id) {
                Some(record) => {
                    record.state = EntityState::PendingDelete;
                    true
                }
                None => false,
            }
        };
        if known {
            self.shared.poke.notify_one();
        }
    }

    /// Invalidate every tracked feedback so the module re-receives it.
    pub fn resend_feedbacks(&self) {
        let moved = {
            let mut table = self.shared.lock_table();
            if table.destroyed {
                return;
            }
            let mut moved = false;
            for record in table.records.values_mut() {
                if record.kind == EntityKind::Feedback {
                    moved |= record.invalidate();
                }
            }
            moved
        };
        if moved {
            self.shared.poke.notify_one();
        }
    }

    /// React to a set of changed variables: every `Ready` record whose
    /// last parse referenced one of them re-enters the pipeline.
    /// Records mid-pass re-parse on their own and are left alone.
    pub fn on_variables_changed(&self, changed: &HashSet<VariableId>) {
        if changed.is_empty() {
            return;
        }
        let moved = {
            let mut table = self.shared.lock_table();
            if table.destroyed {
                return;
            }
            let mut moved = false;
            for record in table.records.values_mut() {
                if record.watches_any(changed) {
                    record.state = EntityState::Unloaded;
                    moved = true;
                }
            }
            moved
        };
        if moved {
            self.shared.poke.notify_one();
        }
    }

    /// React to the module replacing its definitions for `kind`: every
    /// matching record is invalidated, including ones with an upgrade in
    /// flight.
    pub fn on_definitions_changed(&self, kind: EntityKind) {
        let moved = {
            let mut table = self.shared.lock_table();
            if table.destroyed {
                return;
            }
            let mut moved = false;
            for record in table.records.values_mut() {
                if record.kind == kind {
                    moved |= record.invalidate();
                }
            }
            moved
        };
        if moved {
            self.shared.poke.notify_one();
        }
    }

    /// Open the emission gate. Records tracked before this call are
    /// drained on the first post-start tick.
    pub fn start(&self, current_upgrade_index: UpgradeIndex) {
        {
            let mut table = self.shared.lock_table();
            if table.destroyed {
                return;
            }
            table.current_upgrade_index = current_upgrade_index;
            table.gate_open = true;
            debug!(current_upgrade_index, "reconciler started");
        }
        self.shared.poke.notify_one();
    }

    /// Tear down: close the gate, clear all records, stop the scheduler.
    /// No flush; an in-flight upgrade reply is discarded on arrival.
    pub fn destroy(&self) {
        {
            let mut table = self.shared.lock_table();
            table.destroyed = true;
            table.gate_open = false;
            table.records.clear();
        }
        let _ = self.shutdown.send(true);
    }

    /// Snapshot of the engine counters.
    #[must_use]
    pub fn metrics(&self) -> ReconcilerMetrics {
        self.shared.lock_table().metrics.clone()
    }

    /// Number of records currently tracked.
    #[must_use]
    pub fn tracked_total(&self) -> usize {
        self.shared.lock_table().records.len()
    }
}

/// Upgrade batch held across the RPC suspension: the work items plus the
/// wrapper-id snapshot the reply is reconciled against.
struct UpgradeBatch {
    items: Vec<EntityUpgradeItem>,
    batch_ids: HashMap<EntityId, WrapperId>,
    current_upgrade_index: UpgradeIndex,
}

async fn scheduler_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let wait = shared.config.wait();
    let max_wait = shared.config.max_wait();
    loop {
        tokio::select! {
            () = shared.poke.notified() => {}
            _ = shutdown.changed() => return,
        }

        // Debounce: each poke slides the deadline, a continuous burst is
        // force-flushed at max_wait after its first poke.
        let burst_start = Instant::now();
        let hard_deadline = burst_start + max_wait;
        let mut deadline = burst_start + wait;
        loop {
            let target = deadline.min(hard_deadline);
            tokio::select! {
                () = time::sleep_until(target) => break,
                () = shared.poke.notified() => {
                    deadline = Instant::now() + wait;
                }
                _ = shutdown.changed() => return,
            }
        }

        drain_once(&shared).await;
    }
}

/// One drain pass: classify, dispatch, reconcile.
async fn drain_once(shared: &Arc<Shared>) {
    let (updates, upgrade) = classify_records(shared);

    if !updates.is_empty() {
        let count = updates.len();
        if let Err(err) = shared.deps.transport.update_entities(updates).await {
            warn!(error = %err, count, "update batch dispatch failed");
            let mut table = shared.lock_table();
            table.metrics.update_dispatch_failures =
                table.metrics.update_dispatch_failures.saturating_add(1);
        }
    }

    if let Some(batch) = upgrade {
        let outcome = shared
            .deps
            .transport
            .upgrade_entities(batch.items, batch.current_upgrade_index)
            .await;
        match outcome {
            Ok(replacements) => {
                reconcile_upgrade_success(shared, &batch.batch_ids, replacements);
            }
            Err(err) => {
                warn!(error = %err, count = batch.batch_ids.len(), "upgrade batch dispatch failed");
                reconcile_upgrade_failure(shared, &batch.batch_ids);
            }
        }
        // Records sent back to Unloaded, and entities re-tracked by
        // replacement delivery, need another pass.
        shared.poke.notify_one();
    }
}

/// Walk the record table, advancing `Unloaded` records and removing
/// `PendingDelete` and reclaimed ones. Returns the update batch and the
/// upgrade batch for this pass.
fn classify_records(shared: &Arc<Shared>) -> (Vec<EntityUpdate>, Option<UpgradeBatch>) {
    let mut guard = shared.lock_table();
    let table = &mut *guard;
    if !table.gate_open {
        return (Vec::new(), None);
    }
    let current = table.current_upgrade_index;

    let mut updates = Vec::new();
    let mut upgrade_items = Vec::new();
    let mut batch_ids = HashMap::new();
    let mut upserts = 0u64;
    let mut deletes = 0u64;
    let mut reclaimed = 0u64;

    let ids: Vec<EntityId> = table.records.keys().cloned().collect();
    for id in ids {
        let Some(record) = table.records.get_mut(&id) else {
            continue;
        };
        match record.state {
            EntityState::PendingDelete => {
                let live = record.entity().is_some();
                let kind = record.kind;
                table.records.remove(&id);
                if live {
                    updates.push(EntityUpdate::Delete {
                        id: id.clone(),
                        kind,
                    });
                    deletes += 1;
                }
            }
            EntityState::Unloaded => {
                let Some(entity) = record.entity() else {
                    warn!(entity_id = %id, "tracked entity reclaimed by its control; dropping record");
                    table.records.remove(&id);
                    reclaimed += 1;
                    continue;
                };
                let stale = entity.upgrade_index.is_some_and(|index| index != current);
                if stale {
                    record.state = EntityState::Upgrading;
                    batch_ids.insert(id.clone(), record.wrapper_id);
                    upgrade_items.push(EntityUpgradeItem {
                        id: entity.id.clone(),
                        kind: entity.kind,
                        control_id: record.control_id.clone(),
                        definition_id: entity.definition_id.clone(),
                        options: entity.options.clone(),
                        upgrade_index: entity.upgrade_index,
                        disabled: entity.disabled,
                        is_inverted: entity.is_inverted,
                    });
                } else {
                    record.state = EntityState::Ready;
                    let definition = shared
                        .deps
                        .definitions
                        .definition(entity.kind, &entity.definition_id);
                    let needs_module = definition
                        .as_ref()
                        .is_some_and(|definition| definition.has_lifecycle_functions);
                    if needs_module {
                        let parsed = parse_entity_options(
                            definition.as_deref(),
                            &entity.options,
                            &record.control_id,
                            shared.deps.parser.as_ref(),
                        );
                        record.last_referenced_variables = parsed.referenced_variables;
                        updates.push(EntityUpdate::Upsert(EntityUpsert {
                            id: entity.id.clone(),
                            kind: entity.kind,
                            control_id: record.control_id.clone(),
                            definition_id: entity.definition_id.clone(),
                            options: parsed.options,
                            upgrade_index: entity.upgrade_index,
                            disabled: entity.disabled,
                            is_inverted: entity.is_inverted,
                        }));
                        upserts += 1;
                    }
                }
            }
            // Ready holds the module's current snapshot; Upgrading and
            // UpgradingInvalidated have a reply coming that will move
            // them.
            EntityState::Ready
            | EntityState::Upgrading
            | EntityState::UpgradingInvalidated => {}
        }
    }

    table.metrics.drains = table.metrics.drains.saturating_add(1);
    table.metrics.updates_emitted = table.metrics.updates_emitted.saturating_add(upserts);
    table.metrics.deletes_emitted = table.metrics.deletes_emitted.saturating_add(deletes);
    table.metrics.upgrades_emitted = table
        .metrics
        .upgrades_emitted
        .saturating_add(upgrade_items.len() as u64);
    table.metrics.reclaimed_records = table.metrics.reclaimed_records.saturating_add(reclaimed);

    if !updates.is_empty() || !upgrade_items.is_empty() {
        debug!(
            updates = upserts,
            deletes,
            upgrades = upgrade_items.len(),
            "drain classified records"
        );
    }

    let upgrade = if upgrade_items.is_empty() {
        None
    } else {
        Some(UpgradeBatch {
            items: upgrade_items,
            batch_ids,
            current_upgrade_index: current,
        })
    };
    (updates, upgrade)
}

/// Reconcile a successful upgrade reply against the (possibly mutated)
/// record table, then deliver surviving replacements to their controls.
///
/// Delivery happens outside the table lock: `replace_entity` is allowed
/// to synchronously re-`track` the persisted entity.
fn reconcile_upgrade_success(
    shared: &Arc<Shared>,
    batch_ids: &HashMap<EntityId, WrapperId>,
    mut replacements: HashMap<EntityId, EntityReplacement>,
) {
    let mut deliveries: Vec<(ControlId, EntityReplacement)> = Vec::new();
    {
        let mut guard = shared.lock_table();
        let table = &mut *guard;
        if !table.gate_open {
            debug!("gate closed before upgrade reply; discarding");
            return;
        }
        let mut stale = 0u64;
        let mut discarded = 0u64;
        let mut reclaimed = 0u64;
        for (id, wrapper_id) in batch_ids {
            let Some(record) = table.records.get_mut(id) else {
                stale += 1;
                continue;
            };
            if record.wrapper_id != *wrapper_id {
                stale += 1;
                continue;
            }
            if record.entity().is_none() {
                warn!(entity_id = %id, "entity reclaimed while upgrade was in flight; dropping record");
                table.records.remove(id);
                reclaimed += 1;
                continue;
            }
            match record.state {
                EntityState::UpgradingInvalidated => {
                    record.state = EntityState::Unloaded;
                    discarded += 1;
                }
                EntityState::Upgrading => {
                    record.state = EntityState::Ready;
                    if let Some(replacement) = replacements.remove(id) {
                        deliveries.push((record.control_id.clone(), replacement));
                    }
                }
                // The record will be removed on the next drain.
                EntityState::PendingDelete => {}
                // Unreachable while the wrapper id matches; tolerate.
                EntityState::Ready | EntityState::Unloaded => {}
            }
        }
        table.metrics.stale_reply_slots = table.metrics.stale_reply_slots.saturating_add(stale);
        table.metrics.replacements_discarded = table
            .metrics
            .replacements_discarded
            .saturating_add(discarded);
        table.metrics.reclaimed_records =
            table.metrics.reclaimed_records.saturating_add(reclaimed);
    }

    let mut applied = 0u64;
    let mut failures = 0u64;
    for (control_id, replacement) in deliveries {
        let entity_id = replacement.id.clone();
        match shared.deps.controls.control(&control_id) {
            None => {
                warn!(
                    entity_id = %entity_id,
                    control_id = %control_id,
                    "control vanished before upgrade replacement could be applied"
                );
            }
            Some(control) if !control.supports_entities() => {
                warn!(
                    entity_id = %entity_id,
                    control_id = %control_id,
                    "control does not host entities; upgrade replacement dropped"
                );
                failures += 1;
            }
            Some(control) => match control.replace_entity(replacement) {
                Ok(()) => applied += 1,
                Err(err) => {
                    warn!(
                        entity_id = %entity_id,
                        control_id = %control_id,
                        error = %err,
                        "control rejected upgraded entity"
                    );
                    failures += 1;
                }
            },
        }
    }
    if applied > 0 || failures > 0 {
        let mut table = shared.lock_table();
        table.metrics.replacements_applied =
            table.metrics.replacements_applied.saturating_add(applied);
        table.metrics.replace_failures =
            table.metrics.replace_failures.saturating_add(failures);
    }
}

/// Advance records after a failed upgrade dispatch: in-flight entries
/// pretend success, invalidated ones retry from scratch.
fn reconcile_upgrade_failure(shared: &Arc<Shared>, batch_ids: &HashMap<EntityId, WrapperId>) {
    let mut guard = shared.lock_table();
    let table = &mut *guard;
    table.metrics.upgrade_dispatch_failures =
        table.metrics.upgrade_dispatch_failures.saturating_add(1);
    for (id, wrapper_id) in batch_ids {
        let Some(record) = table.records.get_mut(id) else {
            continue;
        };
        if record.wrapper_id != *wrapper_id {
            continue;
        }
        record.state = record.state.after_upgrade_failure();
    }
}
