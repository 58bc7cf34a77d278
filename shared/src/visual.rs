//! Visual-object boundary of the ghost bridge
//!
//! Rendering itself is outside this workspace. What the simulation needs is a
//! narrow contract: resolve a template, instantiate an inactive object from
//! it, strip the components the current role must not run, link it to a
//! ghost, parent it, toggle it and destroy it. [`VisualWorld`] and
//! [`TemplateCatalog`] are the in-memory implementations used by the
//! binaries and the tests.

use crate::context::Role;
use crate::ghost::GhostId;
use crate::math::{Quat, Vec3};
use log::{debug, warn};
use rayon::prelude::*;
use std::collections::HashMap;

pub type TemplateId = u32;

/// Component categories carried by a visual template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ComponentSet(pub u8);

impl ComponentSet {
    pub const RENDERER: ComponentSet = ComponentSet(1 << 0);
    pub const AUDIO: ComponentSet = ComponentSet(1 << 1);
    pub const CLIENT_ONLY: ComponentSet = ComponentSet(1 << 2);
    pub const SERVER_ONLY: ComponentSet = ComponentSet(1 << 3);

    pub fn contains(self, other: ComponentSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: ComponentSet) -> ComponentSet {
        ComponentSet(self.0 | other.0)
    }

    pub fn without(self, other: ComponentSet) -> ComponentSet {
        ComponentSet(self.0 & !other.0)
    }
}

/// A resolved template ready to instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateHandle {
    pub template: TemplateId,
    pub components: ComponentSet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Ready(TemplateHandle),
    Pending,
    Failed(String),
}

/// Asynchronous template lookup, polled by the lifecycle manager.
pub trait TemplateResolver {
    fn resolve(&mut self, template: TemplateId) -> Resolution;
}

/// Stable handle to a visual object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VisualHandle {
    pub index: u32,
    pub generation: u32,
}

/// Operations the lifecycle manager performs on visual objects.
pub trait VisualBridge {
    /// Creates a disabled object from `template`.
    fn instantiate(&mut self, template: &TemplateHandle, ghost: GhostId) -> VisualHandle;
    fn strip_for_role(&mut self, visual: VisualHandle, role: Role);
    fn link(&mut self, visual: VisualHandle, ghost: GhostId) -> Result<(), String>;
    fn set_active(&mut self, visual: VisualHandle, active: bool);
    fn set_parent(&mut self, child: VisualHandle, parent: Option<VisualHandle>);
    fn destroy(&mut self, visual: VisualHandle);
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VisualObject {
    pub template: TemplateId,
    pub ghost: Option<GhostId>,
    pub components: ComponentSet,
    pub renderer_enabled: bool,
    pub active: bool,
    pub parent: Option<VisualHandle>,
    pub transform: Transform,
}

#[derive(Debug, Clone)]
struct VisualSlot {
    generation: u32,
    object: Option<VisualObject>,
}

/// In-memory visual object store.
#[derive(Debug, Clone, Default)]
pub struct VisualWorld {
    slots: Vec<VisualSlot>,
    free: Vec<u32>,
    /// Templates whose link step fails, for exercising failure paths
    failing_links: Vec<TemplateId>,
}

impl VisualWorld {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every future link of `template` fail.
    pub fn fail_links_for(&mut self, template: TemplateId) {
        self.failing_links.push(template);
    }

    pub fn get(&self, handle: VisualHandle) -> Option<&VisualObject> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.object.as_ref())
    }

    fn get_mut(&mut self, handle: VisualHandle) -> Option<&mut VisualObject> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.object.as_mut())
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.object.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_count(&self) -> usize {
        self.slots
            .iter()
            .filter_map(|slot| slot.object.as_ref())
            .filter(|object| object.active)
            .count()
    }

    /// Creates an active, unlinked object, e.g. for a speculative projectile.
    pub fn spawn_unlinked(&mut self, template: &TemplateHandle, transform: Transform) -> VisualHandle {
        self.insert(VisualObject {
            template: template.template,
            ghost: None,
            components: template.components,
            renderer_enabled: template.components.contains(ComponentSet::RENDERER),
            active: true,
            parent: None,
            transform,
        })
    }

    fn insert(&mut self, object: VisualObject) -> VisualHandle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.object = Some(object);
            VisualHandle {
                index,
                generation: slot.generation,
            }
        } else {
            self.slots.push(VisualSlot {
                generation: 0,
                object: Some(object),
            });
            VisualHandle {
                index: (self.slots.len() - 1) as u32,
                generation: 0,
            }
        }
    }

    /// Writes already-computed transforms onto their objects in parallel.
    ///
    /// The pass is joined before returning, so no destroy or reparent can
    /// observe an object mid-write. Stale handles are skipped.
    pub fn apply_transforms(&mut self, updates: &[(VisualHandle, Transform)]) -> usize {
        let by_index: HashMap<u32, (u32, Transform)> = updates
            .iter()
            .map(|(handle, transform)| (handle.index, (handle.generation, *transform)))
            .collect();

        self.slots
            .par_iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| {
                let (generation, transform) = by_index.get(&(index as u32))?;
                if *generation != slot.generation {
                    return None;
                }
                let object = slot.object.as_mut()?;
                object.transform = *transform;
                Some(())
            })
            .count()
    }
}

impl VisualBridge for VisualWorld {
    fn instantiate(&mut self, template: &TemplateHandle, ghost: GhostId) -> VisualHandle {
        self.insert(VisualObject {
            template: template.template,
            ghost: Some(ghost),
            components: template.components,
            renderer_enabled: template.components.contains(ComponentSet::RENDERER),
            active: false,
            parent: None,
            transform: Transform::default(),
        })
    }

    fn strip_for_role(&mut self, visual: VisualHandle, role: Role) {
        if let Some(object) = self.get_mut(visual) {
            match role {
                Role::Server => {
                    object.components = object
                        .components
                        .without(ComponentSet::CLIENT_ONLY)
                        .without(ComponentSet::AUDIO);
                    object.renderer_enabled = false;
                }
                Role::Client => {
                    object.components = object.components.without(ComponentSet::SERVER_ONLY);
                }
            }
        }
    }

    fn link(&mut self, visual: VisualHandle, ghost: GhostId) -> Result<(), String> {
        let template = self
            .get(visual)
            .map(|object| object.template)
            .ok_or_else(|| format!("visual {:?} no longer exists", visual))?;
        if self.failing_links.contains(&template) {
            return Err(format!("template {} rejected the link", template));
        }
        if let Some(object) = self.get_mut(visual) {
            object.ghost = Some(ghost);
        }
        Ok(())
    }

    fn set_active(&mut self, visual: VisualHandle, active: bool) {
        match self.get_mut(visual) {
            Some(object) => object.active = active,
            None => warn!("set_active on stale visual {:?}", visual),
        }
    }

    fn set_parent(&mut self, child: VisualHandle, parent: Option<VisualHandle>) {
        if let Some(object) = self.get_mut(child) {
            object.parent = parent;
        }
    }

    fn destroy(&mut self, visual: VisualHandle) {
        let Some(slot) = self.slots.get_mut(visual.index as usize) else {
            return;
        };
        if slot.generation != visual.generation || slot.object.is_none() {
            return;
        }
        slot.object = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(visual.index);

        // Orphan anything still pointing at the destroyed object.
        for other in self.slots.iter_mut().filter_map(|slot| slot.object.as_mut()) {
            if other.parent == Some(visual) {
                other.parent = None;
            }
        }
        debug!("Destroyed visual {:?}", visual);
    }
}

#[derive(Debug, Clone)]
enum CatalogEntry {
    /// Ready after this many more polls
    Loading(u32, TemplateHandle),
    Ready(TemplateHandle),
    Broken(String),
}

/// In-memory template resolver simulating asynchronous loading.
#[derive(Debug, Clone, Default)]
pub struct TemplateCatalog {
    entries: HashMap<TemplateId, CatalogEntry>,
}

pub const TEMPLATE_GAME_MANAGER: TemplateId = 1;
pub const TEMPLATE_PLAYER: TemplateId = 2;
pub const TEMPLATE_PROJECTILE: TemplateId = 3;

impl TemplateCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog holding the templates the game spawns, all loaded.
    pub fn standard() -> Self {
        let mut catalog = Self::new();
        catalog.insert_ready(TEMPLATE_GAME_MANAGER, ComponentSet::SERVER_ONLY.with(ComponentSet::AUDIO));
        catalog.insert_ready(
            TEMPLATE_PLAYER,
            ComponentSet::RENDERER
                .with(ComponentSet::AUDIO)
                .with(ComponentSet::CLIENT_ONLY)
                .with(ComponentSet::SERVER_ONLY),
        );
        catalog.insert_ready(TEMPLATE_PROJECTILE, ComponentSet::RENDERER.with(ComponentSet::CLIENT_ONLY));
        catalog
    }

    pub fn insert_ready(&mut self, template: TemplateId, components: ComponentSet) {
        self.entries.insert(
            template,
            CatalogEntry::Ready(TemplateHandle {
                template,
                components,
            }),
        );
    }

    /// Template that reports `Pending` for `polls` resolutions before loading.
    pub fn insert_loading(&mut self, template: TemplateId, components: ComponentSet, polls: u32) {
        self.entries.insert(
            template,
            CatalogEntry::Loading(
                polls,
                TemplateHandle {
                    template,
                    components,
                },
            ),
        );
    }

    pub fn insert_broken(&mut self, template: TemplateId, reason: &str) {
        self.entries.insert(template, CatalogEntry::Broken(reason.to_string()));
    }

    /// Resolves without advancing any loading countdown.
    pub fn peek(&self, template: TemplateId) -> Option<TemplateHandle> {
        match self.entries.get(&template) {
            Some(CatalogEntry::Ready(handle)) => Some(*handle),
            _ => None,
        }
    }
}

impl TemplateResolver for TemplateCatalog {
    fn resolve(&mut self, template: TemplateId) -> Resolution {
        let Some(entry) = self.entries.get_mut(&template) else {
            return Resolution::Failed(format!("unknown template {}", template));
        };
        let loaded = match &mut *entry {
            CatalogEntry::Ready(handle) => return Resolution::Ready(*handle),
            CatalogEntry::Broken(reason) => return Resolution::Failed(reason.clone()),
            CatalogEntry::Loading(0, handle) => *handle,
            CatalogEntry::Loading(remaining, _) => {
                *remaining -= 1;
                return Resolution::Pending;
            }
        };
        *entry = CatalogEntry::Ready(loaded);
        Resolution::Ready(loaded)
    }
}
