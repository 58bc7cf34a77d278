//! Authoritative world simulation
//!
//! Each server tick ingests buffered commands per connection, runs movement
//! and weapons for every command tick in order, advances projectiles,
//! handles deaths and respawns and finally runs the ghost lifecycle pass.

use crate::client_manager::{ClientManager, ScheduledCommand};
use crate::scoreboard::{Scoreboard, Scores};
use log::{debug, error, info};
use shared::ghost::{GhostKind, GhostLifecycleManager, GhostSpawn, LifecycleReport, UpdateStages};
use shared::history::MovementHistoryBuffer;
use shared::level::Level;
use shared::math::{ray_sphere, Quat, Vec3};
use shared::movement::{teleport, ControllerState, GroundQuery};
use shared::player::{simulate_tick, PlayerState, Shot};
use shared::visual::{
    TemplateCatalog, TemplateId, Transform, VisualWorld, TEMPLATE_GAME_MANAGER, TEMPLATE_PLAYER,
    TEMPLATE_PROJECTILE,
};
use shared::weapon::{
    resolve_area, resolve_direct, resolve_hitscan, HitTarget, PredictedEntityRecord, WeaponBehavior, WeaponData,
    WeaponId, WeaponKind, LAYER_PLAYER, RIFLE,
};
use shared::{
    DirectedRpc, GhostId, GhostSnapshot, GhostSpawnInfo, HitConfirmRpc, Packet, SimContext, Snapshot, Tick,
};
use std::collections::{BTreeMap, HashMap};

pub const MAX_HEALTH: f32 = 100.0;

/// A packet produced by the simulation, waiting to be sent.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Broadcast(Packet),
    To(u32, Packet),
}

impl Outbound {
    fn rpc(rpc: HitConfirmRpc) -> Self {
        Outbound::To(rpc.target(), Packet::HitConfirm(rpc))
    }
}

#[derive(Debug, Clone)]
pub struct ServerPlayer {
    pub client_id: u32,
    pub ghost: GhostId,
    pub state: PlayerState,
    pub history: MovementHistoryBuffer,
    /// Server tick at which a dead player comes back
    pub respawn_at: Option<Tick>,
    /// Client tick of the last simulated command
    pub last_tick: Tick,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerProjectile {
    pub ghost: GhostId,
    pub owner: u32,
    pub shooter: GhostId,
    pub weapon: WeaponData,
    pub position: Vec3,
    pub velocity: Vec3,
    /// Command tick of the shot, in the owner's numbering
    pub spawn_tick: Tick,
    pub expires_at: Tick,
}

/// What one server tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickReport {
    pub simulated: usize,
    pub synthesized: usize,
    pub hits: usize,
    pub kills: usize,
    pub lifecycle: LifecycleReport,
}

pub struct ServerWorld {
    ctx: SimContext,
    level: Level,
    tick: Tick,
    players: BTreeMap<u32, ServerPlayer>,
    projectiles: Vec<ServerProjectile>,
    ghosts: GhostLifecycleManager,
    templates: TemplateCatalog,
    visuals: VisualWorld,
    scoreboard: Box<dyn Scoreboard>,
    manager: GhostId,
    spawns: usize,
    default_weapon: WeaponId,
    outbox: Vec<Outbound>,
}

impl ServerWorld {
    pub fn new(ctx: SimContext) -> Self {
        Self::with_parts(ctx, Level::arena(), Box::new(Scores::new()))
    }

    pub fn with_parts(ctx: SimContext, level: Level, scoreboard: Box<dyn Scoreboard>) -> Self {
        let mut ghosts = GhostLifecycleManager::new(ctx.role);
        let manager = GhostId::random();
        let spawn = GhostSpawn {
            id: manager,
            kind: GhostKind::Manager,
            template: TEMPLATE_GAME_MANAGER,
            owner: None,
            stages: UpdateStages::TICK,
        };
        if let Err(e) = ghosts.spawn(spawn) {
            error!("Failed to spawn game manager: {}", e);
        }

        Self {
            ctx,
            level,
            tick: Tick::ZERO,
            players: BTreeMap::new(),
            projectiles: Vec::new(),
            ghosts,
            templates: TemplateCatalog::standard(),
            visuals: VisualWorld::new(),
            scoreboard,
            manager,
            spawns: 0,
            default_weapon: RIFLE,
            outbox: Vec::new(),
        }
    }

    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn context(&self) -> &SimContext {
        &self.ctx
    }

    pub fn manager(&self) -> GhostId {
        self.manager
    }

    pub fn player(&self, client_id: u32) -> Option<&ServerPlayer> {
        self.players.get(&client_id)
    }

    pub fn players(&self) -> impl Iterator<Item = &ServerPlayer> {
        self.players.values()
    }

    pub fn projectiles(&self) -> &[ServerProjectile] {
        &self.projectiles
    }

    pub fn ghosts(&self) -> &GhostLifecycleManager {
        &self.ghosts
    }

    pub fn visuals(&self) -> &VisualWorld {
        &self.visuals
    }

    pub fn scoreboard(&self) -> &dyn Scoreboard {
        self.scoreboard.as_ref()
    }

    /// Weapon given to players that join from now on.
    pub fn set_default_weapon(&mut self, weapon_id: WeaponId) {
        self.default_weapon = weapon_id;
    }

    fn armed_record(&self, weapon_id: WeaponId) -> PredictedEntityRecord {
        match self.ctx.weapons.weapon(weapon_id) {
            Some(weapon) => PredictedEntityRecord::armed(weapon_id, &weapon, MAX_HEALTH),
            None => {
                error!("Weapon {} missing from the weapon table", weapon_id);
                PredictedEntityRecord::new(weapon_id, 0, MAX_HEALTH)
            }
        }
    }

    fn next_spawn_point(&mut self) -> Vec3 {
        let point = self.level.spawn_point(self.spawns);
        self.spawns += 1;
        point
    }

    fn spawn_ghost(&mut self, id: GhostId, kind: GhostKind, template: TemplateId, owner: Option<u32>) {
        let stages = match kind {
            GhostKind::Projectile => UpdateStages::TICK,
            _ => UpdateStages::ALL,
        };
        let spawn = GhostSpawn {
            id,
            kind,
            template,
            owner,
            stages,
        };
        if let Err(e) = self.ghosts.spawn(spawn) {
            error!("Failed to register ghost {}: {}", id, e);
        }
    }

    fn destroy_ghost(&mut self, id: GhostId) {
        if let Err(e) = self.ghosts.on_ghost_destroyed(id, &mut self.visuals) {
            error!("Destroying ghost {} failed: {}", id, e);
        }
        self.outbox.push(Outbound::Broadcast(Packet::GhostDestroyed { id }));
    }

    /// Creates the player controlled by `client_id` and announces it.
    pub fn add_player(&mut self, client_id: u32) -> GhostId {
        let ghost = GhostId::random();
        let position = self.next_spawn_point();
        let state = PlayerState {
            controller: ControllerState::spawned_at(position, 0.0),
            record: self.armed_record(self.default_weapon),
        };

        self.spawn_ghost(ghost, GhostKind::RemotePlayer, TEMPLATE_PLAYER, Some(client_id));
        self.players.insert(
            client_id,
            ServerPlayer {
                client_id,
                ghost,
                state,
                history: MovementHistoryBuffer::new(self.ctx.config.history_capacity),
                respawn_at: None,
                last_tick: Tick::ZERO,
            },
        );
        info!("Added player {} (ghost {}) at {:?}", client_id, ghost, position);

        if let Some(info) = self.spawn_info(ghost) {
            self.outbox.push(Outbound::Broadcast(Packet::GhostSpawned(info)));
        }
        ghost
    }

    /// Removes a player along with its respawn timer and projectiles.
    pub fn remove_player(&mut self, client_id: u32) {
        let Some(player) = self.players.remove(&client_id) else {
            return;
        };
        let owned: Vec<GhostId> = self
            .projectiles
            .iter()
            .filter(|p| p.owner == client_id)
            .map(|p| p.ghost)
            .collect();
        self.projectiles.retain(|p| p.owner != client_id);
        for ghost in owned {
            self.destroy_ghost(ghost);
        }

        self.scoreboard.remove_player(client_id);
        self.destroy_ghost(player.ghost);
        info!("Removed player {}", client_id);
    }

    /// Changes a player's weapon, refilling the magazine.
    pub fn equip(&mut self, client_id: u32, weapon_id: WeaponId) -> bool {
        let record = self.armed_record(weapon_id);
        match self.players.get_mut(&client_id) {
            Some(player) => {
                player.state.record = PredictedEntityRecord {
                    health: player.state.record.health,
                    ..record
                };
                true
            }
            None => false,
        }
    }

    fn spawn_info(&self, id: GhostId) -> Option<GhostSpawnInfo> {
        if id == self.manager {
            return Some(GhostSpawnInfo {
                id,
                kind: GhostKind::Manager,
                template: TEMPLATE_GAME_MANAGER,
                owner: None,
                spawn_tick: Tick::ZERO,
                position: Vec3::ZERO,
                velocity: Vec3::ZERO,
            });
        }
        if let Some(player) = self.players.values().find(|p| p.ghost == id) {
            return Some(GhostSpawnInfo {
                id,
                kind: GhostKind::RemotePlayer,
                template: TEMPLATE_PLAYER,
                owner: Some(player.client_id),
                spawn_tick: player.last_tick,
                position: player.state.controller.position,
                velocity: Vec3::ZERO,
            });
        }
        self.projectiles.iter().find(|p| p.ghost == id).map(|p| GhostSpawnInfo {
            id,
            kind: GhostKind::Projectile,
            template: TEMPLATE_PROJECTILE,
            owner: Some(p.owner),
            spawn_tick: p.spawn_tick,
            position: p.position,
            velocity: p.velocity,
        })
    }

    /// Spawn announcements for every live ghost, managers first.
    pub fn spawn_infos(&self) -> Vec<GhostSpawnInfo> {
        std::iter::once(self.manager)
            .chain(self.players.values().map(|p| p.ghost))
            .chain(self.projectiles.iter().map(|p| p.ghost))
            .filter_map(|id| self.spawn_info(id))
            .collect()
    }

    fn hit_targets(&self) -> Vec<HitTarget> {
        self.players
            .values()
            .filter(|p| p.state.record.is_alive())
            .map(|p| p.state.hit_target(p.ghost))
            .collect()
    }

    /// Advances the world by one server tick.
    pub fn update(&mut self, clients: &mut ClientManager) -> TickReport {
        self.tick = self.tick.next();
        let mut report = TickReport::default();

        for client in clients.iter_mut() {
            let scheduled = client.schedule_available();
            for command in scheduled {
                self.simulate_command(client.id, command, &mut report);
            }
        }

        self.update_respawns();
        self.update_projectiles(&mut report);

        report.lifecycle = self.ghosts.update(&mut self.templates, &mut self.visuals);
        self.apply_visual_transforms();

        if report.synthesized > 0 {
            debug!("Tick {}: {} commands synthesized", self.tick, report.synthesized);
        }
        report
    }

    fn simulate_command(&mut self, client_id: u32, command: ScheduledCommand, report: &mut TickReport) {
        let Some(player) = self.players.get_mut(&client_id) else {
            return;
        };
        let outcome = simulate_tick(&mut player.state, &command.input, &self.ctx, command.tick, &self.level);
        player
            .history
            .record(command.tick, player.state.controller.position, player.state.controller.rotation);
        player.last_tick = command.tick;
        let shooter = player.ghost;

        report.simulated += 1;
        if command.synthesized {
            report.synthesized += 1;
        }
        if let Some(shot) = outcome.shot {
            self.resolve_shot(client_id, shooter, command.tick, shot, report);
        }
    }

    fn resolve_shot(&mut self, client_id: u32, shooter: GhostId, tick: Tick, shot: Shot, report: &mut TickReport) {
        match shot.weapon.kind {
            WeaponKind::Hitscan => {
                let targets = self.hit_targets();
                let hit = resolve_hitscan(
                    shooter,
                    shot.origin,
                    shot.direction,
                    shot.weapon.hitscan_range,
                    LAYER_PLAYER,
                    &targets,
                );
                if let Some((victim, distance)) = hit {
                    debug!("Hitscan from {} struck {} at {:.2}m", shooter, victim, distance);
                    self.apply_hit(client_id, victim, shot.weapon.damage, report);
                }
            }
            WeaponKind::Projectile => {
                let ghost = GhostId::random();
                let projectile = ServerProjectile {
                    ghost,
                    owner: client_id,
                    shooter,
                    weapon: shot.weapon,
                    position: shot.origin,
                    velocity: shot.direction.scale(shot.weapon.projectile_speed),
                    spawn_tick: tick,
                    expires_at: self.tick.add(self.ctx.config.projectile_lifetime_ticks),
                };
                self.projectiles.push(projectile);
                self.spawn_ghost(ghost, GhostKind::Projectile, TEMPLATE_PROJECTILE, Some(client_id));
                if let Some(info) = self.spawn_info(ghost) {
                    self.outbox.push(Outbound::Broadcast(Packet::GhostSpawned(info)));
                }
            }
        }
    }

    fn apply_hit(&mut self, shooter_client: u32, victim: GhostId, damage: f32, report: &mut TickReport) {
        let Some(player) = self.players.values_mut().find(|p| p.ghost == victim) else {
            return;
        };
        if !player.state.record.is_alive() {
            return;
        }
        let killed = player.state.record.apply_damage(damage, player.last_tick);
        let victim_client = player.client_id;
        report.hits += 1;

        if killed {
            player.respawn_at = Some(self.tick.add(self.ctx.config.respawn_delay_ticks));
            report.kills += 1;
            self.scoreboard.add_kill(shooter_client, victim_client);
            self.scoreboard.add_death(victim_client);
            info!("Player {} killed by player {}", victim_client, shooter_client);
        }

        let rpc = HitConfirmRpc::new(self.tick, victim, damage, killed).to(shooter_client);
        self.outbox.push(Outbound::rpc(rpc));
    }

    fn update_respawns(&mut self) {
        let due: Vec<u32> = self
            .players
            .values()
            .filter(|p| matches!(p.respawn_at, Some(at) if !at.is_newer_than(self.tick)))
            .map(|p| p.client_id)
            .collect();

        for client_id in due {
            let position = self.next_spawn_point();
            let Some(weapon_id) = self.players.get(&client_id).map(|p| p.state.record.weapon_id) else {
                continue;
            };
            let record = self.armed_record(weapon_id);
            if let Some(player) = self.players.get_mut(&client_id) {
                teleport(&mut player.state.controller, position, 0.0, &self.ctx.consts);
                player.state.record = record;
                player.respawn_at = None;
                info!("Player {} respawned at {:?}", client_id, position);
            }
        }
    }

    fn update_projectiles(&mut self, report: &mut TickReport) {
        let dt = self.ctx.dt();
        let targets = self.hit_targets();
        let mut impacts: Vec<(usize, Vec3, Option<GhostId>)> = Vec::new();
        let mut expired: Vec<usize> = Vec::new();

        for (index, projectile) in self.projectiles.iter_mut().enumerate() {
            let start = projectile.position;
            let step = projectile.velocity.scale(dt);
            let end = start.add(step);
            let length = step.length();
            let direction = step.normalize();

            let struck = targets
                .iter()
                .filter(|target| target.id != projectile.shooter)
                .filter_map(|target| {
                    ray_sphere(start, direction, target.center, target.radius)
                        .filter(|distance| *distance <= length)
                        .map(|distance| (target.id, distance))
                })
                .reduce(|nearest, hit| if hit.1 < nearest.1 { hit } else { nearest });

            if let Some((victim, distance)) = struck {
                impacts.push((index, start.add(direction.scale(distance)), Some(victim)));
            } else if end.y <= start.y && hits_ground(&self.level, start, end) {
                impacts.push((index, end, None));
            } else if !projectile.expires_at.is_newer_than(self.tick) {
                expired.push(index);
            } else {
                projectile.position = end;
            }
        }

        for (index, point, struck) in &impacts {
            let projectile = self.projectiles[*index].clone();
            let victims = match projectile.weapon.behavior {
                WeaponBehavior::DirectDamage => struck
                    .and_then(|victim| resolve_direct(projectile.shooter, victim))
                    .into_iter()
                    .collect(),
                WeaponBehavior::AreaOfEffect => resolve_area(
                    projectile.shooter,
                    *point,
                    projectile.weapon.aoe_radius,
                    LAYER_PLAYER,
                    &targets,
                ),
            };
            for victim in victims {
                self.apply_hit(projectile.owner, victim, projectile.weapon.damage, report);
            }
        }

        let mut finished: Vec<usize> = impacts.iter().map(|(index, _, _)| *index).chain(expired).collect();
        finished.sort_unstable();
        for index in finished.into_iter().rev() {
            let projectile = self.projectiles.remove(index);
            self.destroy_ghost(projectile.ghost);
        }
    }

    fn apply_visual_transforms(&mut self) {
        let mut updates = Vec::with_capacity(self.players.len() + self.projectiles.len());
        for player in self.players.values() {
            if let Some(visual) = self.ghosts.visual(player.ghost) {
                updates.push((
                    visual,
                    Transform {
                        position: player.state.controller.position,
                        rotation: player.state.controller.rotation,
                    },
                ));
            }
        }
        for projectile in &self.projectiles {
            if let Some(visual) = self.ghosts.visual(projectile.ghost) {
                updates.push((
                    visual,
                    Transform {
                        position: projectile.position,
                        rotation: Quat::IDENTITY,
                    },
                ));
            }
        }
        self.visuals.apply_transforms(&updates);
    }

    /// Authoritative state of every player and projectile.
    pub fn snapshot(&self, acks: HashMap<u32, Tick>) -> Snapshot {
        let players = self.players.values().map(|p| GhostSnapshot {
            id: p.ghost,
            kind: GhostKind::RemotePlayer,
            owner: Some(p.client_id),
            tick: p.last_tick,
            position: p.state.controller.position,
            rotation: p.state.controller.rotation,
            player: Some(p.state),
        });
        let projectiles = self.projectiles.iter().map(|p| GhostSnapshot {
            id: p.ghost,
            kind: GhostKind::Projectile,
            owner: Some(p.owner),
            tick: self.tick,
            position: p.position,
            rotation: Quat::IDENTITY,
            player: None,
        });

        Snapshot {
            server_tick: self.tick,
            acks,
            ghosts: players.chain(projectiles).collect(),
        }
    }

    /// Hands every queued outbound packet to the caller.
    pub fn drain_outbound(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }
}

/// Whether a descending segment passes through a walkable surface.
fn hits_ground(level: &Level, start: Vec3, end: Vec3) -> bool {
    let origin = Vec3::new(end.x, start.y, end.z);
    !level.cast_down(origin, 0.0, start.y - end.y).is_empty()
}
