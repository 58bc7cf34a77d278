//! Client-side prediction, rollback and ghost bookkeeping
//!
//! The local player is predicted with the same `simulate_tick` the server
//! runs. When a snapshot arrives, the next prediction step first rolls the
//! player back to the authoritative state for the acknowledged tick and
//! replays every unacknowledged command on top of it. Predicted and
//! authoritative transforms are recorded per tick so drift is detected and
//! reported, while the rollback itself does the correcting.

use log::{debug, info, warn};
use shared::events::{EffectKind, EffectLatch, EventQueue};
use shared::ghost::{GhostKind, GhostLifecycleManager, GhostSpawn, LifecycleReport, UpdateStages};
use shared::history::{MispredictionMonitor, MovementHistoryBuffer};
use shared::level::Level;
use shared::player::{simulate_span, simulate_tick, PlayerState, Shot};
use shared::projectile::SpeculativeProjectiles;
use shared::visual::{TemplateCatalog, Transform, VisualBridge, VisualWorld, TEMPLATE_PROJECTILE};
use shared::weapon::WeaponKind;
use shared::{
    CommandBuffer, CommandInput, Divergence, GhostId, GhostSnapshot, GhostSpawnInfo, HitConfirmRpc, Packet, Quat,
    SimContext, Snapshot, Tick,
};
use std::collections::HashMap;

/// Something the presentation layer should react to exactly once.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClientEvent {
    Effect(EffectKind),
    HitConfirmed { victim: GhostId, damage: f32, killed: bool },
    Mispredicted(Divergence),
}

/// Authoritative local-player state waiting to be rolled back to.
#[derive(Debug, Clone, Copy)]
struct Rollback {
    /// Tick the state was produced by, `None` if the server has not
    /// simulated any of our commands yet
    base: Option<Tick>,
    state: PlayerState,
}

pub struct ClientGameState {
    ctx: SimContext,
    level: Level,
    client_id: Option<u32>,
    player_ghost: Option<GhostId>,

    /// Next tick to predict
    tick: Tick,
    commands: CommandBuffer,
    player: Option<PlayerState>,
    pending: Option<Rollback>,
    last_ack: Option<Tick>,
    last_server_tick: Option<Tick>,
    resimulated: u64,
    /// Rollbacks whose base had already left the command window
    truncated_rollbacks: u64,

    predicted_history: MovementHistoryBuffer,
    authoritative_history: MovementHistoryBuffer,
    monitor: MispredictionMonitor,

    projectiles: SpeculativeProjectiles,
    latch: EffectLatch,
    events: EventQueue<ClientEvent>,
    confirmations: Vec<HitConfirmRpc>,

    ghosts: GhostLifecycleManager,
    templates: TemplateCatalog,
    visuals: VisualWorld,
    remote: HashMap<GhostId, GhostSnapshot>,
    lifecycle: LifecycleReport,
}

impl ClientGameState {
    pub fn new(ctx: SimContext) -> Self {
        Self::with_parts(ctx, Level::arena(), TemplateCatalog::standard())
    }

    pub fn with_parts(ctx: SimContext, level: Level, templates: TemplateCatalog) -> Self {
        let config = &ctx.config;
        Self {
            level,
            client_id: None,
            player_ghost: None,
            tick: Tick(1),
            commands: CommandBuffer::new(config.command_buffer_capacity),
            player: None,
            pending: None,
            last_ack: None,
            last_server_tick: None,
            resimulated: 0,
            truncated_rollbacks: 0,
            predicted_history: MovementHistoryBuffer::new(config.history_capacity),
            authoritative_history: MovementHistoryBuffer::new(config.history_capacity),
            monitor: MispredictionMonitor::new(config.position_tolerance_sq, config.rotation_tolerance),
            projectiles: SpeculativeProjectiles::new(config.projectile_match_window, config.projectile_horizon),
            latch: EffectLatch::new(),
            events: EventQueue::new(),
            confirmations: Vec::new(),
            ghosts: GhostLifecycleManager::new(ctx.role),
            templates,
            visuals: VisualWorld::new(),
            remote: HashMap::new(),
            lifecycle: LifecycleReport::default(),
            ctx,
        }
    }

    pub fn on_connected(&mut self, client_id: u32, player: GhostId) {
        info!("Controlling ghost {} as client {}", player, client_id);
        self.client_id = Some(client_id);
        self.player_ghost = Some(player);
    }

    pub fn client_id(&self) -> Option<u32> {
        self.client_id
    }

    pub fn is_connected(&self) -> bool {
        self.client_id.is_some()
    }

    /// Routes a packet from the server to its handler.
    pub fn handle_packet(&mut self, packet: Packet) {
        match packet {
            Packet::Connected {
                client_id,
                player,
                tick_rate,
            } => {
                if tick_rate != self.ctx.config.tick_rate {
                    warn!("Server ticks at {} Hz, predicting at {} Hz", tick_rate, self.ctx.config.tick_rate);
                }
                self.on_connected(client_id, player);
            }
            Packet::Snapshot(snapshot) => self.apply_snapshot(snapshot),
            Packet::GhostSpawned(info) => self.on_ghost_spawned(info),
            Packet::GhostDestroyed { id } => self.on_ghost_destroyed(id),
            Packet::HitConfirm(rpc) => self.on_hit_confirmed(rpc),
            Packet::Disconnected { reason } => {
                warn!("Disconnected: {}", reason);
                self.reset();
            }
            Packet::Connect { .. } | Packet::Commands { .. } | Packet::Disconnect => {
                warn!("Unexpected client packet received from server");
            }
        }
    }

    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn player(&self) -> Option<&PlayerState> {
        self.player.as_ref()
    }

    pub fn player_ghost(&self) -> Option<GhostId> {
        self.player_ghost
    }

    pub fn last_ack(&self) -> Option<Tick> {
        self.last_ack
    }

    /// Ticks replayed by rollbacks so far.
    pub fn resimulated_ticks(&self) -> u64 {
        self.resimulated
    }

    pub fn truncated_rollbacks(&self) -> u64 {
        self.truncated_rollbacks
    }

    pub fn commands(&self) -> &CommandBuffer {
        &self.commands
    }

    pub fn predicted_history(&self) -> &MovementHistoryBuffer {
        &self.predicted_history
    }

    pub fn authoritative_history(&self) -> &MovementHistoryBuffer {
        &self.authoritative_history
    }

    pub fn monitor(&self) -> &MispredictionMonitor {
        &self.monitor
    }

    pub fn projectiles(&self) -> &SpeculativeProjectiles {
        &self.projectiles
    }

    pub fn ghosts(&self) -> &GhostLifecycleManager {
        &self.ghosts
    }

    pub fn visuals(&self) -> &VisualWorld {
        &self.visuals
    }

    pub fn remote_ghosts(&self) -> impl Iterator<Item = &GhostSnapshot> {
        self.remote.values()
    }

    pub fn last_lifecycle(&self) -> LifecycleReport {
        self.lifecycle
    }

    /// Events produced by the last [`advance`](Self::advance).
    pub fn drain_events(&mut self) -> Vec<(Tick, ClientEvent)> {
        self.events.drain().collect()
    }

    fn owns(&self, owner: Option<u32>) -> bool {
        owner.is_some() && owner == self.client_id
    }

    /// Predicts a single tick and returns the commands to send.
    pub fn predict(&mut self, input: CommandInput) -> Vec<(Tick, CommandInput)> {
        self.advance(&[input])
    }

    /// Predicts every tick queued this frame, in order, and returns the
    /// commands to send. Ticks are grouped by the configured batch size; a
    /// group of several ticks is applied as one step and is not recorded
    /// for misprediction checks.
    pub fn advance(&mut self, inputs: &[CommandInput]) -> Vec<(Tick, CommandInput)> {
        if inputs.is_empty() {
            return Vec::new();
        }
        self.events.begin_tick(self.tick);
        for rpc in std::mem::take(&mut self.confirmations) {
            self.events.push_at(
                rpc.tick,
                ClientEvent::HitConfirmed {
                    victim: rpc.victim,
                    damage: rpc.damage,
                    killed: rpc.killed,
                },
            );
        }

        let window = self.ctx.config.redundant_commands.max(1) as u32;
        let mut send_from = self.tick.add(inputs.len() as u32).sub(window);

        let batch = self.ctx.config.resim_batch.max(1) as usize;
        for group in inputs.chunks(batch) {
            if let Some(unacked) = self.step_group(group) {
                if send_from.is_newer_than(unacked) {
                    send_from = unacked;
                }
            }
        }

        self.update_visuals();
        self.outgoing(send_from)
    }

    fn step_group(&mut self, group: &[CommandInput]) -> Option<Tick> {
        let first_tick = self.tick;
        let span = group.len() as u32;
        let last_tick = first_tick.add(span - 1);
        for (offset, input) in group.iter().enumerate() {
            self.commands.add(first_tick.add(offset as u32), *input);
        }

        let unacked = self.pending.take().and_then(|rollback| self.rollback(rollback));

        if let (Some(mut player), Some(input)) = (self.player, group.last()) {
            let outcome = simulate_span(&mut player, input, &self.ctx, last_tick, span, &self.level);
            self.player = Some(player);
            if span == 1 {
                self.predicted_history
                    .record(last_tick, player.controller.position, player.controller.rotation);
            }
            if let Some(shot) = outcome.shot {
                self.spawn_speculative(last_tick, shot);
            }
            for (kind, tick) in self.latch.poll(&player.record) {
                self.events.push_at(tick, ClientEvent::Effect(kind));
            }
        }

        self.projectiles.advance(self.ctx.dt() * span as f32);
        for aged in self.projectiles.age_out(last_tick) {
            debug!("Speculative projectile {} from tick {} never confirmed", aged.local_id, aged.tick);
            if let Some(visual) = aged.visual {
                self.visuals.destroy(visual);
            }
        }

        self.tick = last_tick.next();
        unacked
    }

    /// Restores the authoritative state and replays every unacknowledged
    /// tick before the current one. Returns the oldest replayed tick.
    fn rollback(&mut self, rollback: Rollback) -> Option<Tick> {
        let mut state = rollback.state;
        if let Some(base) = rollback.base {
            let controller = &state.controller;
            self.authoritative_history
                .record(base, controller.position, controller.rotation);
            if let Some(Err(divergence)) = self.monitor.check(base, &self.predicted_history, &self.authoritative_history)
            {
                self.events.push_at(base, ClientEvent::Mispredicted(divergence));
            }
        }

        // Scan back from the tick before the current one to the first
        // unacknowledged tick, then replay forward.
        let mut replay = Vec::new();
        let mut tick = self.tick.prev();
        loop {
            let acknowledged = match rollback.base {
                Some(base) => !tick.is_newer_than(base),
                None => self.commands.oldest_tick().map_or(true, |oldest| oldest.is_newer_than(tick)),
            };
            if acknowledged {
                break;
            }
            if replay.len() >= self.commands.capacity() {
                warn!(
                    "Rollback base {:?} is more than {} ticks behind tick {}, replaying only the buffered window",
                    rollback.base,
                    self.commands.capacity(),
                    self.tick
                );
                self.truncated_rollbacks += 1;
                break;
            }
            replay.push(tick);
            tick = tick.prev();
        }
        replay.reverse();

        for tick in &replay {
            let Some((_, input)) = self.commands.latest_at_or_before(*tick) else {
                continue;
            };
            simulate_tick(&mut state, &input, &self.ctx, *tick, &self.level);
        }
        self.resimulated += replay.len() as u64;
        if !replay.is_empty() {
            debug!("Rolled back to {:?} and replayed {} ticks", rollback.base, replay.len());
        }

        self.player = Some(state);
        replay.first().copied()
    }

    fn spawn_speculative(&mut self, tick: Tick, shot: Shot) {
        if shot.weapon.kind != WeaponKind::Projectile {
            return;
        }
        let transform = Transform {
            position: shot.origin,
            rotation: Quat::IDENTITY,
        };
        let visual = self
            .templates
            .peek(TEMPLATE_PROJECTILE)
            .map(|template| self.visuals.spawn_unlinked(&template, transform));
        let velocity = shot.direction.scale(shot.weapon.projectile_speed);
        self.projectiles.add(tick, shot.weapon_id, shot.origin, velocity, visual);
    }

    fn outgoing(&self, from: Tick) -> Vec<(Tick, CommandInput)> {
        let newest = self.tick.prev();
        let capacity = self.commands.capacity().max(1) as u32;
        let oldest_allowed = newest.sub(capacity - 1);
        let from = if oldest_allowed.is_newer_than(from) { oldest_allowed } else { from };
        self.commands.range(from, newest)
    }

    /// Takes in an authoritative snapshot. The rollback happens on the next
    /// prediction step.
    pub fn apply_snapshot(&mut self, snapshot: Snapshot) {
        if let Some(last) = self.last_server_tick {
            if !snapshot.server_tick.is_newer_than(last) {
                debug!("Ignoring stale snapshot for tick {}", snapshot.server_tick);
                return;
            }
        }
        self.last_server_tick = Some(snapshot.server_tick);

        let ack = self.client_id.and_then(|id| snapshot.acks.get(&id).copied());
        if let Some(ack) = ack {
            self.last_ack = Some(ack);
            self.commands.discard_before(ack);
        }

        self.remote.clear();
        for ghost in snapshot.ghosts {
            let ours = Some(ghost.id) == self.player_ghost;
            match (ours, ghost.player) {
                (true, Some(state)) => {
                    self.pending = Some(Rollback {
                        base: ack.map(|_| ghost.tick),
                        state,
                    });
                }
                (true, None) => warn!("Snapshot entry for ghost {} has no player state", ghost.id),
                (false, _) => {
                    self.remote.insert(ghost.id, ghost);
                }
            }
        }
    }

    pub fn on_ghost_spawned(&mut self, info: GhostSpawnInfo) {
        if self.ghosts.contains(info.id) {
            debug!("Ghost {} already known", info.id);
            return;
        }
        let kind = match info.kind {
            GhostKind::RemotePlayer if self.owns(info.owner) => GhostKind::LocalPlayer,
            kind => kind,
        };
        let stages = match kind {
            GhostKind::Projectile => UpdateStages::TICK,
            _ => UpdateStages::ALL,
        };
        let spawn = GhostSpawn {
            id: info.id,
            kind,
            template: info.template,
            owner: info.owner,
            stages,
        };

        if kind == GhostKind::Projectile && self.owns(info.owner) {
            if let Some(visual) = self.projectiles.reconcile(info.spawn_tick).and_then(|p| p.visual) {
                match self.ghosts.adopt(spawn, visual, &mut self.visuals) {
                    Ok(()) => return,
                    Err(e) => warn!("Falling back to a fresh visual for {}: {}", info.id, e),
                }
            }
        }

        if let Err(e) = self.ghosts.spawn(spawn) {
            warn!("Ghost {} not spawned: {}", info.id, e);
        }
    }

    pub fn on_ghost_destroyed(&mut self, id: GhostId) {
        self.remote.remove(&id);
        if let Err(e) = self.ghosts.request_destroy(id) {
            debug!("Destroy for unknown ghost: {}", e);
        }
    }

    /// Queues a hit confirmation for the next batch of events.
    pub fn on_hit_confirmed(&mut self, rpc: HitConfirmRpc) {
        if Some(rpc.target) != self.client_id {
            warn!("Hit confirmation addressed to client {} received", rpc.target);
            return;
        }
        self.confirmations.push(rpc);
    }

    /// Drops all predicted and replicated state, e.g. after a disconnect.
    pub fn reset(&mut self) {
        for projectile in self.projectiles.invalidate() {
            if let Some(visual) = projectile.visual {
                self.visuals.destroy(visual);
            }
        }
        let removed = self.ghosts.retain_live(|_| false, &mut self.visuals);
        debug!("Reset dropped {} ghosts", removed);

        self.client_id = None;
        self.player_ghost = None;
        self.player = None;
        self.pending = None;
        self.last_ack = None;
        self.last_server_tick = None;
        self.commands = CommandBuffer::new(self.ctx.config.command_buffer_capacity);
        self.predicted_history.clear();
        self.authoritative_history.clear();
        self.remote.clear();
        self.confirmations.clear();
    }

    /// Runs the lifecycle pass, then writes the frame's transforms.
    fn update_visuals(&mut self) {
        self.lifecycle = self.ghosts.update(&mut self.templates, &mut self.visuals);

        let mut updates = Vec::with_capacity(self.remote.len() + self.projectiles.len() + 1);
        if let (Some(ghost), Some(player)) = (self.player_ghost, self.player) {
            if let Some(visual) = self.ghosts.visual(ghost) {
                updates.push((
                    visual,
                    Transform {
                        position: player.controller.position,
                        rotation: player.controller.rotation,
                    },
                ));
            }
        }
        for ghost in self.remote.values() {
            if let Some(visual) = self.ghosts.visual(ghost.id) {
                updates.push((
                    visual,
                    Transform {
                        position: ghost.position,
                        rotation: ghost.rotation,
                    },
                ));
            }
        }
        for projectile in self.projectiles.iter() {
            if let Some(visual) = projectile.visual {
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::ghost::GhostState;
    use shared::movement::ControllerState;
    use shared::visual::{TEMPLATE_GAME_MANAGER, TEMPLATE_PLAYER};
    use shared::weapon::{PredictedEntityRecord, WeaponProvider, CROSSBOW, RIFLE};
    use shared::{ActionFlags, Role, SimConfig, Vec3};
    use std::sync::Arc;

    const ME: u32 = 1;

    fn client() -> ClientGameState {
        client_with(SimConfig::default())
    }

    fn client_with(config: SimConfig) -> ClientGameState {
        let defaults = SimContext::with_defaults(Role::Client);
        let ctx = SimContext::new(Role::Client, config, defaults.consts, Arc::clone(&defaults.weapons));
        let mut client = ClientGameState::new(ctx);
        client.on_connected(ME, GhostId(100));
        client
    }

    fn spawned(client: &ClientGameState, weapon: u16) -> PlayerState {
        let data = client.ctx.weapons.weapon(weapon).unwrap();
        PlayerState {
            controller: ControllerState::spawned_at(Vec3::ZERO, 0.0),
            record: PredictedEntityRecord::armed(weapon, &data, 100.0),
        }
    }

    fn snapshot(server_tick: u32, ack: Option<u32>, tick: u32, state: PlayerState) -> Snapshot {
        let mut acks = HashMap::new();
        if let Some(ack) = ack {
            acks.insert(ME, Tick(ack));
        }
        Snapshot {
            server_tick: Tick(server_tick),
            acks,
            ghosts: vec![GhostSnapshot {
                id: GhostId(100),
                kind: GhostKind::RemotePlayer,
                owner: Some(ME),
                tick: Tick(tick),
                position: state.controller.position,
                rotation: state.controller.rotation,
                player: Some(state),
            }],
        }
    }

    fn forward() -> CommandInput {
        CommandInput {
            movement: (0.0, 1.0),
            ..Default::default()
        }
    }

    #[test]
    fn test_no_prediction_before_first_snapshot() {
        let mut client = client();
        let sent = client.predict(forward());
        assert_eq!(sent, vec![(Tick(1), forward())]);
        assert!(client.player().is_none());
        assert_eq!(client.tick(), Tick(2));
    }

    #[test]
    fn test_redundant_window_sent() {
        let mut client = client();
        for _ in 0..10 {
            client.predict(forward());
        }
        let sent = client.predict(forward());
        let ticks: Vec<u32> = sent.iter().map(|(tick, _)| tick.0).collect();
        assert_eq!(ticks, vec![8, 9, 10, 11]);
    }

    #[test]
    fn test_first_snapshot_replays_buffered_commands() {
        let mut client = client();
        for _ in 0..3 {
            client.predict(forward());
        }
        let start = spawned(&client, RIFLE);
        client.apply_snapshot(snapshot(1, None, 0, start));
        client.predict(forward());

        // Ticks 1..=3 replayed from the spawn state, then tick 4 predicted.
        assert_eq!(client.resimulated_ticks(), 3);
        let mut expected = start;
        for tick in 1..=4 {
            simulate_tick(&mut expected, &forward(), &client.ctx, Tick(tick), &client.level);
        }
        assert_eq!(client.player().unwrap(), &expected);
    }

    #[test]
    fn test_rollback_from_ack_matches_server() {
        let mut client = client();
        let start = spawned(&client, RIFLE);
        client.apply_snapshot(snapshot(1, None, 0, start));

        let mut server = start;
        for tick in 1..=10 {
            client.predict(forward());
            simulate_tick(&mut server, &forward(), &client.ctx, Tick(tick), &client.level);
            if tick == 6 {
                client.apply_snapshot(snapshot(20, Some(6), 6, server));
            }
        }

        assert_eq!(client.monitor().mispredictions(), 0);
        assert_eq!(client.monitor().checked(), 1);
        assert_eq!(client.last_ack(), Some(Tick(6)));
        assert_eq!(client.player().unwrap(), &server);
    }

    #[test]
    fn test_divergence_detected_and_corrected() {
        let mut client = client();
        let start = spawned(&client, RIFLE);
        client.apply_snapshot(snapshot(1, None, 0, start));
        for _ in 1..=5 {
            client.predict(forward());
        }

        // The server saw the player somewhere else at tick 3.
        let mut server = start;
        server.controller.position = Vec3::new(4.0, 0.0, 4.0);
        client.apply_snapshot(snapshot(10, Some(3), 3, server));
        client.predict(forward());
        let events = client.drain_events();

        assert_eq!(client.monitor().mispredictions(), 1);
        assert!(events
            .iter()
            .any(|(tick, event)| *tick == Tick(3) && matches!(event, ClientEvent::Mispredicted(_))));
        assert!(client.player().unwrap().controller.position.x > 3.9);
        // Ticks 4 and 5 are replayed on top of the corrected state.
        assert_eq!(client.resimulated_ticks(), 2);
    }

    #[test]
    fn test_unacked_commands_resent_after_snapshot() {
        let mut client = client();
        let start = spawned(&client, RIFLE);
        client.apply_snapshot(snapshot(1, None, 0, start));
        for _ in 1..=12 {
            client.predict(forward());
        }
        client.apply_snapshot(snapshot(30, Some(2), 2, start));
        let sent = client.predict(forward());
        let ticks: Vec<u32> = sent.iter().map(|(tick, _)| tick.0).collect();
        assert_eq!(ticks, (3..=13).collect::<Vec<u32>>());
    }

    #[test]
    fn test_stale_snapshot_ignored() {
        let mut client = client();
        let start = spawned(&client, RIFLE);
        client.predict(forward());
        client.apply_snapshot(snapshot(10, Some(1), 1, start));
        client.apply_snapshot(snapshot(9, Some(5), 5, start));
        assert_eq!(client.last_ack(), Some(Tick(1)));
        client.apply_snapshot(snapshot(10, Some(5), 5, start));
        assert_eq!(client.last_ack(), Some(Tick(1)));
    }

    #[test]
    fn test_batched_ticks_not_recorded() {
        let mut client = client_with(SimConfig {
            resim_batch: 3,
            ..SimConfig::default()
        });
        let start = spawned(&client, RIFLE);
        client.apply_snapshot(snapshot(1, None, 0, start));

        client.advance(&[forward(), forward(), forward(), forward()]);

        // 1..=3 applied as one step, 4 on its own.
        assert_eq!(client.tick(), Tick(5));
        for tick in 1..=3 {
            assert!(!client.predicted_history().contains(Tick(tick)));
        }
        assert!(client.predicted_history().contains(Tick(4)));
        assert!(client.commands().contains(Tick(2)));
    }

    #[test]
    fn test_effects_fire_once_across_rollback() {
        let mut client = client();
        let start = spawned(&client, RIFLE);
        client.apply_snapshot(snapshot(1, None, 0, start));

        let shoot = CommandInput {
            actions: ActionFlags::SHOOT,
            ..Default::default()
        };
        client.predict(shoot);
        let first = client.drain_events();
        assert_eq!(first, vec![(Tick(1), ClientEvent::Effect(EffectKind::Shot))]);

        // Replaying tick 1 reproduces the same shot tick, which must not replay.
        client.apply_snapshot(snapshot(2, None, 0, start));
        client.predict(CommandInput::default());
        assert!(client.drain_events().is_empty());
    }

    #[test]
    fn test_speculative_projectile_adopted() {
        let mut client = client();
        let start = spawned(&client, CROSSBOW);
        client.apply_snapshot(snapshot(1, None, 0, start));
        client.predict(CommandInput {
            actions: ActionFlags::SHOOT,
            ..Default::default()
        });
        assert_eq!(client.projectiles().len(), 1);
        let visual = client.projectiles().iter().next().unwrap().visual.unwrap();
        let visuals_before = client.visuals().len();

        client.on_ghost_spawned(GhostSpawnInfo {
            id: GhostId(555),
            kind: GhostKind::Projectile,
            template: TEMPLATE_PROJECTILE,
            owner: Some(ME),
            spawn_tick: Tick(4),
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
        });

        assert!(client.projectiles().is_empty());
        assert_eq!(client.ghosts().visual(GhostId(555)), Some(visual));
        assert_eq!(client.ghosts().state(GhostId(555)), Some(GhostState::DeferredActivation));
        client.predict(CommandInput::default());
        assert_eq!(client.visuals().len(), visuals_before);
    }

    #[test]
    fn test_unmatched_projectile_spawns_fresh() {
        let mut client = client();
        let start = spawned(&client, CROSSBOW);
        client.apply_snapshot(snapshot(1, None, 0, start));
        client.predict(CommandInput {
            actions: ActionFlags::SHOOT,
            ..Default::default()
        });

        client.on_ghost_spawned(GhostSpawnInfo {
            id: GhostId(556),
            kind: GhostKind::Projectile,
            template: TEMPLATE_PROJECTILE,
            owner: Some(ME),
            spawn_tick: Tick(7),
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
        });

        assert_eq!(client.projectiles().len(), 1);
        assert_eq!(client.ghosts().state(GhostId(556)), Some(GhostState::AwaitingPrefab));
    }

    #[test]
    fn test_speculative_projectile_ages_out() {
        let mut client = client();
        let start = spawned(&client, CROSSBOW);
        client.apply_snapshot(snapshot(1, None, 0, start));
        client.predict(CommandInput {
            actions: ActionFlags::SHOOT,
            ..Default::default()
        });
        for _ in 0..40 {
            client.predict(CommandInput::default());
        }
        assert_eq!(client.projectiles().len(), 1);
        client.predict(CommandInput::default());
        assert!(client.projectiles().is_empty());
        assert!(client.visuals().is_empty());
    }

    #[test]
    fn test_local_player_activates_after_manager() {
        let mut client = client();
        let manager = GhostSpawnInfo {
            id: GhostId(1),
            kind: GhostKind::Manager,
            template: TEMPLATE_GAME_MANAGER,
            owner: None,
            spawn_tick: Tick::ZERO,
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
        };
        let me = GhostSpawnInfo {
            id: GhostId(100),
            kind: GhostKind::RemotePlayer,
            template: TEMPLATE_PLAYER,
            owner: Some(ME),
            ..manager
        };
        let other = GhostSpawnInfo {
            id: GhostId(200),
            owner: Some(2),
            ..me
        };
        client.on_ghost_spawned(other);
        client.on_ghost_spawned(me);
        client.on_ghost_spawned(manager);

        client.predict(CommandInput::default());

        assert_eq!(client.ghosts().try_get(GhostId(100)).unwrap().kind, GhostKind::LocalPlayer);
        assert_eq!(client.ghosts().try_get(GhostId(200)).unwrap().kind, GhostKind::RemotePlayer);
        for id in [1, 100, 200] {
            assert_eq!(client.ghosts().state(GhostId(id)), Some(GhostState::Active));
        }
        let visual = client.ghosts().visual(GhostId(100)).unwrap();
        assert!(client.visuals().get(visual).unwrap().renderer_enabled);
    }

    #[test]
    fn test_destroy_and_reset() {
        let mut client = client();
        client.on_ghost_spawned(GhostSpawnInfo {
            id: GhostId(200),
            kind: GhostKind::RemotePlayer,
            template: TEMPLATE_PLAYER,
            owner: Some(2),
            spawn_tick: Tick::ZERO,
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
        });
        client.predict(CommandInput::default());
        client.on_ghost_destroyed(GhostId(200));
        assert!(!client.ghosts().contains(GhostId(200)));

        client.predict(CommandInput::default());
        assert!(client.visuals().is_empty());

        client.reset();
        assert!(client.client_id().is_none());
        assert!(client.ghosts().is_empty());
    }

    #[test]
    fn test_hit_confirmation_delivered_once() {
        let mut client = client();
        client.on_hit_confirmed(HitConfirmRpc {
            target: ME,
            tick: Tick(3),
            victim: GhostId(200),
            damage: 20.0,
            killed: false,
        });
        client.on_hit_confirmed(HitConfirmRpc {
            target: ME + 1,
            tick: Tick(3),
            victim: GhostId(200),
            damage: 20.0,
            killed: false,
        });
        client.predict(CommandInput::default());
        let events = client.drain_events();
        assert_eq!(events.len(), 1);
        client.predict(CommandInput::default());
        assert!(client.drain_events().is_empty());
    }

    #[test]
    fn test_packets_routed_to_handlers() {
        let defaults = SimContext::with_defaults(Role::Client);
        let mut client = ClientGameState::new(defaults);
        assert!(!client.is_connected());

        client.handle_packet(Packet::Connected {
            client_id: ME,
            player: GhostId(100),
            tick_rate: 60,
        });
        assert!(client.is_connected());
        assert_eq!(client.player_ghost(), Some(GhostId(100)));

        let start = spawned(&client, RIFLE);
        client.handle_packet(Packet::Snapshot(snapshot(4, None, 0, start)));
        client.predict(CommandInput::default());
        assert!(client.player().is_some());

        client.handle_packet(Packet::Disconnected {
            reason: "Server full".to_string(),
        });
        assert!(!client.is_connected());
        assert!(client.player().is_none());
    }

    #[test]
    fn test_rollback_base_older_than_command_window() {
        let mut client = client();
        for _ in 0..100 {
            client.predict(forward());
        }
        let capacity = client.commands().capacity() as u64;

        let start = spawned(&client, RIFLE);
        client.apply_snapshot(snapshot(20, Some(10), 10, start));
        client.predict(forward());

        assert_eq!(client.truncated_rollbacks(), 1);
        assert_eq!(client.resimulated_ticks(), capacity);
        assert!(client.player().is_some());
        assert_eq!(client.tick(), Tick(102));

        // A recent base replays normally.
        client.apply_snapshot(snapshot(21, Some(99), 99, start));
        client.predict(forward());
        assert_eq!(client.truncated_rollbacks(), 1);
    }
}
