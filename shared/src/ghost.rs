//! Ghost lifecycle management
//!
//! A ghost is a networked simulation entity identified by a [`GhostId`] that
//! is stable across roles. The [`GhostLifecycleManager`] pairs each ghost
//! with a visual object and walks it through
//!
//! ```text
//! AwaitingPrefab -> Instantiated -> DeferredActivation -> Active -> PendingDestroy -> Destroyed
//! ```
//!
//! The GUID index is the single source of truth. Update lists are derived
//! from it, hold arena slot ids rather than references, and are only ever
//! compacted between iterations.

use crate::context::Role;
use crate::error::GhostError;
use crate::visual::{Resolution, TemplateId, TemplateResolver, VisualBridge, VisualHandle};
use log::{debug, error, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Globally unique ghost identifier, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GhostId(pub u128);

impl GhostId {
    pub fn generate(rng: &mut impl Rng) -> Self {
        GhostId(rng.gen())
    }

    pub fn random() -> Self {
        Self::generate(&mut rand::thread_rng())
    }
}

impl fmt::Display for GhostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// What a ghost is, which decides its activation priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GhostKind {
    /// Singleton/manager objects other objects depend on
    Manager,
    /// The player owned by this client
    LocalPlayer,
    RemotePlayer,
    Projectile,
    Prop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GhostState {
    AwaitingPrefab,
    Instantiated,
    DeferredActivation,
    Active,
    PendingDestroy,
    Destroyed,
}

/// Per-tick update stages an active ghost may register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateStage {
    Tick,
    LateTick,
}

const STAGES: [UpdateStage; 2] = [UpdateStage::Tick, UpdateStage::LateTick];

fn stage_slot(stage: UpdateStage) -> usize {
    match stage {
        UpdateStage::Tick => 0,
        UpdateStage::LateTick => 1,
    }
}

/// Set of update stages, declared at spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub struct UpdateStages(pub u8);

impl UpdateStages {
    pub const NONE: UpdateStages = UpdateStages(0);
    pub const TICK: UpdateStages = UpdateStages(1 << 0);
    pub const LATE_TICK: UpdateStages = UpdateStages(1 << 1);
    pub const ALL: UpdateStages = UpdateStages(0b11);

    pub fn includes(self, stage: UpdateStage) -> bool {
        self.0 & (1 << stage_slot(stage)) != 0
    }
}

/// Everything needed to start tracking a ghost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GhostSpawn {
    pub id: GhostId,
    pub kind: GhostKind,
    pub template: TemplateId,
    /// Owning connection, if any
    pub owner: Option<u32>,
    pub stages: UpdateStages,
}

/// Read-only view of a tracked ghost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GhostView {
    pub id: GhostId,
    pub kind: GhostKind,
    pub state: GhostState,
    pub owner: Option<u32>,
    pub visual: Option<VisualHandle>,
    pub parent: Option<GhostId>,
    pub children: Vec<GhostId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone)]
struct GhostEntry {
    spawn: GhostSpawn,
    state: GhostState,
    visual: Option<VisualHandle>,
    /// Links are slots, not ids, so a recycled id never inherits them
    parent: Option<SlotId>,
    children: Vec<SlotId>,
    resolve_error_logged: bool,
}

#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    entry: Option<GhostEntry>,
}

/// Counts of what one lifecycle pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LifecycleReport {
    pub instantiated: usize,
    pub linked: usize,
    pub activated: usize,
    pub destroyed: usize,
    pub link_failures: usize,
    pub awaiting: usize,
}

pub struct GhostLifecycleManager {
    role: Role,
    slots: Vec<Slot>,
    free: Vec<u32>,
    index: HashMap<GhostId, SlotId>,
    pending_destroy: Vec<SlotId>,
    update_lists: [Vec<SlotId>; 2],
}

impl GhostLifecycleManager {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            pending_destroy: Vec::new(),
            update_lists: [Vec::new(), Vec::new()],
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    fn entry(&self, slot: SlotId) -> Option<&GhostEntry> {
        self.slots
            .get(slot.index as usize)
            .filter(|s| s.generation == slot.generation)
            .and_then(|s| s.entry.as_ref())
    }

    fn entry_mut(&mut self, slot: SlotId) -> Option<&mut GhostEntry> {
        self.slots
            .get_mut(slot.index as usize)
            .filter(|s| s.generation == slot.generation)
            .and_then(|s| s.entry.as_mut())
    }

    fn entry_by_id_mut(&mut self, id: GhostId) -> Option<&mut GhostEntry> {
        let slot = *self.index.get(&id)?;
        self.entry_mut(slot)
    }

    fn allocate(&mut self, entry: GhostEntry) -> SlotId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            SlotId {
                index,
                generation: slot.generation,
            }
        } else {
            self.slots.push(Slot {
                generation: 0,
                entry: Some(entry),
            });
            SlotId {
                index: (self.slots.len() - 1) as u32,
                generation: 0,
            }
        }
    }

    fn release(&mut self, slot: SlotId) -> Option<GhostEntry> {
        let s = self.slots.get_mut(slot.index as usize)?;
        if s.generation != slot.generation {
            return None;
        }
        let entry = s.entry.take()?;
        s.generation = s.generation.wrapping_add(1);
        self.free.push(slot.index);
        Some(entry)
    }

    /// Starts tracking a ghost whose visual template still has to be resolved.
    pub fn spawn(&mut self, spawn: GhostSpawn) -> Result<(), GhostError> {
        if self.index.contains_key(&spawn.id) {
            return Err(GhostError::Duplicate(spawn.id));
        }
        let slot = self.allocate(GhostEntry {
            spawn,
            state: GhostState::AwaitingPrefab,
            visual: None,
            parent: None,
            children: Vec::new(),
            resolve_error_logged: false,
        });
        self.index.insert(spawn.id, slot);
        debug!("Ghost {} ({:?}) spawned, awaiting template {}", spawn.id, spawn.kind, spawn.template);
        Ok(())
    }

    /// Tracks a ghost using an already existing visual object instead of
    /// instantiating a new one. Used when a predicted object is confirmed.
    pub fn adopt(
        &mut self,
        spawn: GhostSpawn,
        visual: VisualHandle,
        bridge: &mut impl VisualBridge,
    ) -> Result<(), GhostError> {
        if self.index.contains_key(&spawn.id) {
            return Err(GhostError::Duplicate(spawn.id));
        }
        if let Err(reason) = bridge.link(visual, spawn.id) {
            error!("Adopting visual {:?} for ghost {} failed: {}", visual, spawn.id, reason);
            bridge.destroy(visual);
            return Err(GhostError::Link {
                ghost: spawn.id,
                reason,
            });
        }
        let slot = self.allocate(GhostEntry {
            spawn,
            state: GhostState::DeferredActivation,
            visual: Some(visual),
            parent: None,
            children: Vec::new(),
            resolve_error_logged: false,
        });
        self.index.insert(spawn.id, slot);
        debug!("Ghost {} adopted existing visual {:?}", spawn.id, visual);
        Ok(())
    }

    /// Whether `id` currently resolves. False from the moment destruction is requested.
    pub fn contains(&self, id: GhostId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn try_get(&self, id: GhostId) -> Option<GhostView> {
        let slot = *self.index.get(&id)?;
        let entry = self.entry(slot)?;
        Some(GhostView {
            id,
            kind: entry.spawn.kind,
            state: entry.state,
            owner: entry.spawn.owner,
            visual: entry.visual,
            parent: entry.parent.and_then(|parent| self.entry(parent)).map(|e| e.spawn.id),
            children: entry
                .children
                .iter()
                .filter_map(|child| self.entry(*child))
                .map(|e| e.spawn.id)
                .collect(),
        })
    }

    pub fn state(&self, id: GhostId) -> Option<GhostState> {
        self.try_get(id).map(|view| view.state)
    }

    pub fn visual(&self, id: GhostId) -> Option<VisualHandle> {
        let slot = *self.index.get(&id)?;
        self.entry(slot)?.visual
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Ids of every resolvable ghost, in arena order.
    pub fn ids(&self) -> Vec<GhostId> {
        let mut slots: Vec<(SlotId, GhostId)> = self.index.iter().map(|(id, slot)| (*slot, *id)).collect();
        slots.sort_by_key(|(slot, _)| slot.index);
        slots.into_iter().map(|(_, id)| id).collect()
    }

    /// Parents `child` under `parent`, or detaches it when `parent` is `None`.
    pub fn set_parent(
        &mut self,
        child: GhostId,
        parent: Option<GhostId>,
        bridge: &mut impl VisualBridge,
    ) -> Result<(), GhostError> {
        let child_slot = *self.index.get(&child).ok_or(GhostError::NotFound(child))?;
        let parent_slot = match parent {
            Some(parent) => Some(*self.index.get(&parent).ok_or(GhostError::NotFound(parent))?),
            None => None,
        };

        let previous = self.entry_mut(child_slot).and_then(|entry| entry.parent.take());
        if let Some(previous) = previous {
            if let Some(entry) = self.entry_mut(previous) {
                entry.children.retain(|c| *c != child_slot);
            }
        }

        let parent_visual = match (parent, parent_slot) {
            (Some(parent), Some(slot)) => {
                let entry = self.entry_mut(slot).ok_or(GhostError::NotFound(parent))?;
                entry.children.push(child_slot);
                entry.visual
            }
            _ => None,
        };

        let entry = self.entry_mut(child_slot).ok_or(GhostError::NotFound(child))?;
        entry.parent = parent_slot;
        if let Some(visual) = entry.visual {
            bridge.set_parent(visual, parent_visual);
        }
        Ok(())
    }

    /// Authority-requested destruction. The ghost stops resolving immediately
    /// and its visual is torn down on the next lifecycle pass.
    pub fn request_destroy(&mut self, id: GhostId) -> Result<(), GhostError> {
        let slot = self.index.remove(&id).ok_or(GhostError::NotFound(id))?;
        if let Some(entry) = self.entry_mut(slot) {
            entry.state = GhostState::PendingDestroy;
        }
        self.pending_destroy.push(slot);
        debug!("Ghost {} pending destroy", id);
        Ok(())
    }

    /// Immediate destruction, used when the simulation entity has gone away.
    pub fn on_ghost_destroyed(&mut self, id: GhostId, bridge: &mut impl VisualBridge) -> Result<(), GhostError> {
        let slot = self.index.remove(&id).ok_or(GhostError::NotFound(id))?;
        self.teardown(slot, bridge);
        Ok(())
    }

    /// Destroys every tracked ghost for which `is_live` returns false.
    pub fn retain_live(&mut self, is_live: impl Fn(GhostId) -> bool, bridge: &mut impl VisualBridge) -> usize {
        let gone: Vec<GhostId> = self.ids().into_iter().filter(|id| !is_live(*id)).collect();
        for id in &gone {
            if let Some(slot) = self.index.remove(id) {
                self.teardown(slot, bridge);
            }
        }
        gone.len()
    }

    /// Tears a ghost down whose index entry has already been removed.
    fn teardown(&mut self, slot: SlotId, bridge: &mut impl VisualBridge) {
        let Some(entry) = self.entry(slot).cloned() else {
            return;
        };
        let id = entry.spawn.id;

        // Children are detached first so they survive their parent.
        for child in &entry.children {
            if let Some(child_entry) = self.entry_mut(*child) {
                if child_entry.parent != Some(slot) {
                    continue;
                }
                child_entry.parent = None;
                if let Some(visual) = child_entry.visual {
                    bridge.set_parent(visual, None);
                }
            }
        }
        if let Some(parent) = entry.parent {
            if let Some(parent_entry) = self.entry_mut(parent) {
                parent_entry.children.retain(|c| *c != slot);
            }
        }
        if let Some(visual) = entry.visual {
            bridge.set_active(visual, false);
            bridge.destroy(visual);
        }

        self.release(slot);
        debug!("Ghost {} destroyed", id);
    }

    /// Runs one lifecycle pass: reaps pending destroys, resolves templates,
    /// links instantiated objects, then activates in dependency order.
    pub fn update(
        &mut self,
        resolver: &mut impl TemplateResolver,
        bridge: &mut impl VisualBridge,
    ) -> LifecycleReport {
        let mut report = LifecycleReport::default();

        for slot in std::mem::take(&mut self.pending_destroy) {
            self.teardown(slot, bridge);
            report.destroyed += 1;
        }

        for id in self.ids() {
            self.advance_resolution(id, resolver, bridge, &mut report);
        }

        self.activate_in_order(bridge, &mut report);
        self.compact_update_lists();

        report.awaiting = self
            .ids()
            .into_iter()
            .filter(|id| self.state(*id) == Some(GhostState::AwaitingPrefab))
            .count();
        report
    }

    fn advance_resolution(
        &mut self,
        id: GhostId,
        resolver: &mut impl TemplateResolver,
        bridge: &mut impl VisualBridge,
        report: &mut LifecycleReport,
    ) {
        let role = self.role;
        let Some(entry) = self.entry_by_id_mut(id) else {
            return;
        };

        if entry.state == GhostState::AwaitingPrefab {
            match resolver.resolve(entry.spawn.template) {
                Resolution::Ready(template) => {
                    let visual = bridge.instantiate(&template, id);
                    bridge.strip_for_role(visual, role);
                    entry.visual = Some(visual);
                    entry.state = GhostState::Instantiated;
                    report.instantiated += 1;
                }
                Resolution::Pending => return,
                Resolution::Failed(reason) => {
                    if !entry.resolve_error_logged {
                        error!(
                            "Template {} for ghost {} failed to resolve: {}",
                            entry.spawn.template, id, reason
                        );
                        entry.resolve_error_logged = true;
                    }
                    return;
                }
            }
        }

        if entry.state == GhostState::Instantiated {
            let Some(visual) = entry.visual else {
                return;
            };
            if let Err(reason) = bridge.link(visual, id) {
                error!("Linking ghost {} failed, destroying it: {}", id, reason);
                report.link_failures += 1;
                if let Some(slot) = self.index.remove(&id) {
                    self.teardown(slot, bridge);
                    report.destroyed += 1;
                }
                return;
            }
            entry.state = GhostState::DeferredActivation;
            report.linked += 1;
            self.attach_visual_hierarchy(id, bridge);
        }
    }

    /// Reconnects a freshly linked visual to its parent and children.
    fn attach_visual_hierarchy(&mut self, id: GhostId, bridge: &mut impl VisualBridge) {
        let Some(entry) = self.index.get(&id).and_then(|slot| self.entry(*slot)) else {
            return;
        };
        let Some(visual) = entry.visual else {
            return;
        };
        if let Some(parent_visual) = entry.parent.and_then(|parent| self.entry(parent)).and_then(|p| p.visual) {
            bridge.set_parent(visual, Some(parent_visual));
        }
        for child in &entry.children {
            if let Some(child_visual) = self.entry(*child).and_then(|c| c.visual) {
                bridge.set_parent(child_visual, Some(visual));
            }
        }
    }

    fn activation_rank(&self, kind: GhostKind) -> u8 {
        match (kind, self.role) {
            (GhostKind::Manager, _) => 0,
            (GhostKind::LocalPlayer, Role::Client) => 1,
            _ => 2,
        }
    }

    /// Activates deferred ghosts rank by rank. A rank only starts once every
    /// ghost of the lower ranks is active.
    fn activate_in_order(&mut self, bridge: &mut impl VisualBridge, report: &mut LifecycleReport) {
        let ids = self.ids();
        for rank in 0..=2u8 {
            for id in &ids {
                let Some(view) = self.try_get(*id) else {
                    continue;
                };
                if self.activation_rank(view.kind) != rank || view.state != GhostState::DeferredActivation {
                    continue;
                }
                self.activate(*id, bridge);
                report.activated += 1;
            }

            let blocked = ids.iter().filter_map(|id| self.try_get(*id)).find(|view| {
                self.activation_rank(view.kind) == rank && view.state != GhostState::Active
            });
            if let Some(blocker) = blocked {
                debug!(
                    "Activation held at rank {}: ghost {} is {:?}",
                    rank, blocker.id, blocker.state
                );
                return;
            }
        }
    }

    fn activate(&mut self, id: GhostId, bridge: &mut impl VisualBridge) {
        let Some(slot) = self.index.get(&id).copied() else {
            return;
        };
        let Some(entry) = self.entry_mut(slot) else {
            return;
        };
        if let Some(visual) = entry.visual {
            bridge.set_active(visual, true);
        }
        entry.state = GhostState::Active;
        let stages = entry.spawn.stages;
        let kind = entry.spawn.kind;
        for stage in STAGES {
            if stages.includes(stage) {
                self.update_lists[stage_slot(stage)].push(slot);
            }
        }
        if kind == GhostKind::Manager || kind == GhostKind::LocalPlayer {
            info!("Ghost {} ({:?}) active", id, kind);
        } else {
            debug!("Ghost {} ({:?}) active", id, kind);
        }
    }

    /// Active ghosts registered for `stage`, skipping tombstoned slots.
    pub fn stage_members(&self, stage: UpdateStage) -> Vec<GhostId> {
        self.update_lists[stage_slot(stage)]
            .iter()
            .filter_map(|slot| self.entry(*slot))
            .filter(|entry| entry.state == GhostState::Active)
            .map(|entry| entry.spawn.id)
            .collect()
    }

    /// Calls `f` for every live member of `stage`. The manager cannot be
    /// mutated while the iteration runs.
    pub fn for_each_in_stage(&self, stage: UpdateStage, mut f: impl FnMut(&GhostView)) {
        for id in self.stage_members(stage) {
            if let Some(view) = self.try_get(id) {
                f(&view);
            }
        }
    }

    /// Raw length of a stage list, tombstones included.
    pub fn stage_list_len(&self, stage: UpdateStage) -> usize {
        self.update_lists[stage_slot(stage)].len()
    }

    /// Drops tombstoned slots from every update list.
    pub fn compact_update_lists(&mut self) {
        let mut lists = std::mem::take(&mut self.update_lists);
        for list in lists.iter_mut() {
            list.retain(|slot| {
                self.entry(*slot)
                    .map(|entry| entry.state == GhostState::Active)
                    .unwrap_or(false)
            });
        }
        self.update_lists = lists;
    }

    /// Rebuilds every derived list from the GUID index.
    pub fn rebuild_derived(&mut self) {
        let mut lists: [Vec<SlotId>; 2] = [Vec::new(), Vec::new()];
        let mut slots: Vec<SlotId> = self.index.values().copied().collect();
        slots.sort_by_key(|slot| slot.index);
        for slot in slots {
            let Some(entry) = self.entry(slot) else {
                warn!("Index points at empty slot {:?}", slot);
                continue;
            };
            if entry.state != GhostState::Active {
                continue;
            }
            for stage in STAGES {
                if entry.spawn.stages.includes(stage) {
                    lists[stage_slot(stage)].push(slot);
                }
            }
        }
        self.update_lists = lists;
    }
}
