//! Weapon data, per-player combat record and hit resolution
//!
//! Weapon resolution runs once per simulated tick on both roles, right after
//! movement. It is deterministic in the same way as the movement code so the
//! client's predicted ammo and cooldowns agree with the server's.

use crate::command::CommandInput;
use crate::events::EffectKind;
use crate::ghost::GhostId;
use crate::math::{ray_sphere, Vec3};
use crate::tick::Tick;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type WeaponId = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeaponKind {
    Hitscan,
    Projectile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeaponBehavior {
    DirectDamage,
    AreaOfEffect,
}

/// Static stats of one weapon.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeaponData {
    pub damage: f32,
    pub magazine_size: u32,
    pub cooldown_ms: u32,
    /// Seconds
    pub reload_time: f32,
    pub kind: WeaponKind,
    pub behavior: WeaponBehavior,
    pub hitscan_range: f32,
    pub aoe_radius: f32,
    pub projectile_speed: f32,
}

/// Read-only lookup of weapon stats by id.
pub trait WeaponProvider: Send + Sync {
    fn weapon(&self, id: WeaponId) -> Option<WeaponData>;
}

/// Baked weapon table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeaponTable {
    weapons: HashMap<WeaponId, WeaponData>,
}

pub const RIFLE: WeaponId = 0;
pub const LAUNCHER: WeaponId = 1;
pub const CROSSBOW: WeaponId = 2;

impl WeaponTable {
    pub fn new(weapons: HashMap<WeaponId, WeaponData>) -> Self {
        Self { weapons }
    }

    pub fn insert(&mut self, id: WeaponId, data: WeaponData) {
        self.weapons.insert(id, data);
    }
}

impl Default for WeaponTable {
    fn default() -> Self {
        let mut weapons = HashMap::new();
        weapons.insert(
            RIFLE,
            WeaponData {
                damage: 20.0,
                magazine_size: 30,
                cooldown_ms: 100,
                reload_time: 1.5,
                kind: WeaponKind::Hitscan,
                behavior: WeaponBehavior::DirectDamage,
                hitscan_range: 100.0,
                aoe_radius: 0.0,
                projectile_speed: 0.0,
            },
        );
        weapons.insert(
            LAUNCHER,
            WeaponData {
                damage: 60.0,
                magazine_size: 4,
                cooldown_ms: 800,
                reload_time: 2.5,
                kind: WeaponKind::Projectile,
                behavior: WeaponBehavior::AreaOfEffect,
                hitscan_range: 0.0,
                aoe_radius: 3.0,
                projectile_speed: 25.0,
            },
        );
        weapons.insert(
            CROSSBOW,
            WeaponData {
                damage: 45.0,
                magazine_size: 1,
                cooldown_ms: 500,
                reload_time: 1.0,
                kind: WeaponKind::Projectile,
                behavior: WeaponBehavior::DirectDamage,
                hitscan_range: 0.0,
                aoe_radius: 0.0,
                projectile_speed: 40.0,
            },
        );
        Self { weapons }
    }
}

impl WeaponProvider for WeaponTable {
    fn weapon(&self, id: WeaponId) -> Option<WeaponData> {
        self.weapons.get(&id).copied()
    }
}

/// Per-player combat state that is predicted on the client.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PredictedEntityRecord {
    pub weapon_id: WeaponId,
    pub current_ammo: u32,
    pub health: f32,
    /// Seconds until the next shot is allowed
    pub cooldown_timer: f32,
    /// Seconds until the running reload completes
    pub reload_timer: f32,
    pub is_reloading: bool,
    pub last_shot_tick: Option<Tick>,
    pub last_jump_tick: Option<Tick>,
    pub last_land_tick: Option<Tick>,
    pub last_reload_tick: Option<Tick>,
    pub last_hit_tick: Option<Tick>,
}

impl PredictedEntityRecord {
    pub fn new(weapon_id: WeaponId, ammo: u32, health: f32) -> Self {
        Self {
            weapon_id,
            current_ammo: ammo,
            health,
            cooldown_timer: 0.0,
            reload_timer: 0.0,
            is_reloading: false,
            last_shot_tick: None,
            last_jump_tick: None,
            last_land_tick: None,
            last_reload_tick: None,
            last_hit_tick: None,
        }
    }

    /// Fresh record holding a full magazine of `weapon`.
    pub fn armed(weapon_id: WeaponId, weapon: &WeaponData, health: f32) -> Self {
        Self::new(weapon_id, weapon.magazine_size, health)
    }

    pub fn is_alive(&self) -> bool {
        self.health > 0.0
    }

    pub fn last_event_tick(&self, kind: EffectKind) -> Option<Tick> {
        match kind {
            EffectKind::Shot => self.last_shot_tick,
            EffectKind::Jump => self.last_jump_tick,
            EffectKind::Land => self.last_land_tick,
            EffectKind::Reload => self.last_reload_tick,
            EffectKind::Hit => self.last_hit_tick,
        }
    }

    /// Applies damage and reports whether this hit was the killing blow.
    pub fn apply_damage(&mut self, amount: f32, tick: Tick) -> bool {
        if !self.is_alive() {
            return false;
        }
        self.health -= amount;
        self.last_hit_tick = Some(tick);
        !self.is_alive()
    }
}

/// What the weapon did on a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeaponAction {
    Idle,
    Fired,
    ReloadStarted,
    Reloaded,
}

/// Advances timers and applies this tick's shoot/reload intent.
///
/// Reload supersedes shoot when the magazine is empty. A shot needs the
/// weapon not reloading, ammo left and the cooldown elapsed.
pub fn resolve_weapon(
    record: &mut PredictedEntityRecord,
    input: &CommandInput,
    weapon: &WeaponData,
    tick: Tick,
    dt: f32,
) -> WeaponAction {
    record.cooldown_timer = (record.cooldown_timer - dt).max(0.0);

    if record.is_reloading {
        record.reload_timer -= dt;
        if record.reload_timer <= 0.0 {
            record.reload_timer = 0.0;
            record.current_ammo = weapon.magazine_size;
            record.is_reloading = false;
            return WeaponAction::Reloaded;
        }
        return WeaponAction::Idle;
    }

    let wants_reload = input.reload() && record.current_ammo < weapon.magazine_size;
    let dry_fire = input.shoot() && record.current_ammo == 0;
    if wants_reload || dry_fire {
        record.is_reloading = true;
        record.reload_timer = weapon.reload_time;
        record.last_reload_tick = Some(tick);
        return WeaponAction::ReloadStarted;
    }

    if input.shoot() && record.cooldown_timer <= 0.0 {
        record.current_ammo -= 1;
        record.cooldown_timer = weapon.cooldown_ms as f32 / 1000.0;
        record.last_shot_tick = Some(tick);
        return WeaponAction::Fired;
    }

    WeaponAction::Idle
}

/// A damageable entity as seen by hit resolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HitTarget {
    pub id: GhostId,
    pub center: Vec3,
    pub radius: f32,
    /// Collision layer bits, used only as a candidate pre-filter
    pub layer: u32,
}

pub const LAYER_PLAYER: u32 = 1 << 0;
pub const LAYER_PROP: u32 = 1 << 1;

/// First target struck by a ray, excluding the shooter by identity.
pub fn resolve_hitscan(
    shooter: GhostId,
    origin: Vec3,
    direction: Vec3,
    range: f32,
    layer_mask: u32,
    targets: &[HitTarget],
) -> Option<(GhostId, f32)> {
    let direction = direction.normalize();
    targets
        .iter()
        .filter(|target| target.layer & layer_mask != 0)
        .filter(|target| target.id != shooter)
        .filter_map(|target| {
            ray_sphere(origin, direction, target.center, target.radius)
                .filter(|distance| *distance <= range)
                .map(|distance| (target.id, distance))
        })
        .reduce(|nearest, hit| if hit.1 < nearest.1 { hit } else { nearest })
}

/// Every target within `radius` of `center`, except the shooter.
pub fn resolve_area(
    shooter: GhostId,
    center: Vec3,
    radius: f32,
    layer_mask: u32,
    targets: &[HitTarget],
) -> Vec<GhostId> {
    targets
        .iter()
        .filter(|target| target.layer & layer_mask != 0)
        .filter(|target| target.id != shooter)
        .filter(|target| {
            let reach = radius + target.radius;
            target.center.distance_squared(center) <= reach * reach
        })
        .map(|target| target.id)
        .collect()
}

/// Target of a direct hit, or `None` when the struck entity is the shooter.
pub fn resolve_direct(shooter: GhostId, struck: GhostId) -> Option<GhostId> {
    (struck != shooter).then_some(struck)
}
