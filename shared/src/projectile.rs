//! Client-side speculative projectiles
//!
//! When the local player fires a projectile weapon the client spawns a
//! speculative projectile immediately. Once the server announces its
//! authoritative projectile, the closest outstanding speculation within the
//! match window is adopted instead of spawning a duplicate.

use crate::math::Vec3;
use crate::tick::Tick;
use crate::visual::VisualHandle;
use crate::weapon::WeaponId;
use log::{debug, trace};

#[derive(Debug, Clone, PartialEq)]
pub struct SpeculativeProjectile {
    /// Local, client-only identifier
    pub local_id: u32,
    /// Tick of the command that fired it
    pub tick: Tick,
    pub weapon_id: WeaponId,
    pub position: Vec3,
    pub velocity: Vec3,
    pub visual: Option<VisualHandle>,
}

#[derive(Debug, Clone)]
pub struct SpeculativeProjectiles {
    window: u32,
    horizon: u32,
    next_id: u32,
    outstanding: Vec<SpeculativeProjectile>,
}

impl SpeculativeProjectiles {
    pub fn new(window: u32, horizon: u32) -> Self {
        Self {
            window,
            horizon,
            next_id: 1,
            outstanding: Vec::new(),
        }
    }

    /// Tracks a newly fired projectile and returns its local id.
    pub fn add(
        &mut self,
        tick: Tick,
        weapon_id: WeaponId,
        position: Vec3,
        velocity: Vec3,
        visual: Option<VisualHandle>,
    ) -> u32 {
        let local_id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.outstanding.push(SpeculativeProjectile {
            local_id,
            tick,
            weapon_id,
            position,
            velocity,
            visual,
        });
        trace!("Speculative projectile {} fired at tick {}", local_id, tick);
        local_id
    }

    /// Removes and returns the speculation closest to `server_tick`, if any
    /// lies within the match window (inclusive). Ties go to the older one.
    pub fn reconcile(&mut self, server_tick: Tick) -> Option<SpeculativeProjectile> {
        let index = self
            .outstanding
            .iter()
            .enumerate()
            .map(|(index, p)| (index, server_tick.ticks_since(p.tick).unsigned_abs()))
            .filter(|(_, distance)| *distance <= self.window)
            .min_by_key(|(index, distance)| (*distance, *index))
            .map(|(index, _)| index)?;
        let adopted = self.outstanding.remove(index);
        debug!(
            "Adopted speculative projectile {} (tick {}) for server tick {}",
            adopted.local_id, adopted.tick, server_tick
        );
        Some(adopted)
    }

    /// Drops speculations older than the horizon and returns them so their
    /// visuals can be torn down.
    pub fn age_out(&mut self, current: Tick) -> Vec<SpeculativeProjectile> {
        let horizon = self.horizon as i32;
        let (expired, kept): (Vec<_>, Vec<_>) = self
            .outstanding
            .drain(..)
            .partition(|p| current.ticks_since(p.tick) > horizon);
        self.outstanding = kept;
        for p in &expired {
            trace!("Speculative projectile {} aged out at tick {}", p.local_id, current);
        }
        expired
    }

    /// Drops every speculation, e.g. on disconnect or death.
    pub fn invalidate(&mut self) -> Vec<SpeculativeProjectile> {
        std::mem::take(&mut self.outstanding)
    }

    /// Integrates every speculation forward by `dt`.
    pub fn advance(&mut self, dt: f32) {
        for p in &mut self.outstanding {
            p.position = p.position.add(p.velocity.scale(dt));
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &SpeculativeProjectile> {
        self.outstanding.iter()
    }

    pub fn len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }
}
