//! Integration tests for the prediction pipeline
//!
//! Most tests run a server world and several client worlds in one process
//! and move encoded packets between them over simulated links with latency
//! and loss. The last group talks over real UDP sockets.

use client::game::{ClientEvent, ClientGameState};
use client::input::{InputSource, ScriptedInput};
use client::network::Client;
use server::client_manager::ClientManager;
use server::game::{Outbound, ServerWorld};
use server::network::Server;
use shared::ghost::GhostState;
use shared::visual::TEMPLATE_PROJECTILE;
use shared::weapon::{resolve_weapon, PredictedEntityRecord, WeaponAction, WeaponProvider, CROSSBOW};
use shared::{
    ActionFlags, CommandInput, GhostId, GhostKind, Packet, ProtocolError, Role, SimConfig, SimContext, Tick, Vec3,
    MAX_PACKET_SIZE, PROTOCOL_VERSION,
};
use std::collections::VecDeque;
use std::net::{SocketAddr, UdpSocket};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

/// NETWORK PROTOCOL TESTS
mod protocol_tests {
    use super::*;

    /// Every packet kind survives the wire format unchanged
    #[test]
    fn packet_roundtrip() {
        let commands = vec![
            (Tick(41), CommandInput::default()),
            (
                Tick(42),
                CommandInput {
                    movement: (1.0, -0.5),
                    yaw: 0.3,
                    pitch: 0.1,
                    actions: ActionFlags::SHOOT,
                },
            ),
        ];
        let packets = vec![
            Packet::Connect {
                client_version: PROTOCOL_VERSION,
            },
            Packet::Commands { commands },
            Packet::Disconnect,
            Packet::Connected {
                client_id: 3,
                player: GhostId(99),
                tick_rate: 60,
            },
            Packet::GhostDestroyed { id: GhostId(5) },
            Packet::Disconnected {
                reason: "Test".to_string(),
            },
        ];

        for packet in packets {
            let decoded = Packet::decode(&packet.encode().unwrap()).unwrap();
            assert_eq!(decoded, packet);
        }
    }

    /// Tests basic UDP socket communication with encoded packets
    #[tokio::test]
    async fn udp_socket_communication() {
        let server_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let server_addr = server_socket.local_addr().unwrap();
        server_socket.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        let client_socket = UdpSocket::bind("127.0.0.1:0").unwrap();

        let packet = Packet::Commands {
            commands: vec![(Tick(7), CommandInput::default())],
        };
        client_socket.send_to(&packet.encode().unwrap(), server_addr).unwrap();

        let mut buffer = [0u8; MAX_PACKET_SIZE];
        let (len, from) = server_socket.recv_from(&mut buffer).unwrap();
        assert_eq!(from, client_socket.local_addr().unwrap());
        assert_eq!(Packet::decode(&buffer[..len]).unwrap(), packet);
    }

    /// Garbage and oversized datagrams are rejected instead of panicking
    #[test]
    fn malformed_packet_handling() {
        let malformed = vec![
            vec![],
            vec![0xFF],
            vec![0xFF; 16],
            vec![0x01, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F],
        ];
        for data in malformed {
            assert!(Packet::decode(&data).is_err(), "decoded garbage {:?}", data);
        }

        let oversized = vec![0u8; MAX_PACKET_SIZE + 1];
        assert!(matches!(Packet::decode(&oversized), Err(ProtocolError::TooLarge(_))));

        let huge = Packet::Disconnected {
            reason: "x".repeat(MAX_PACKET_SIZE),
        };
        assert!(matches!(huge.encode(), Err(ProtocolError::TooLarge(_))));
    }
}

/// SHARED SIMULATION TESTS
mod simulation_tests {
    use super::*;

    /// Fire, dry fire, reload and fire again with a one-round weapon
    #[test]
    fn single_round_weapon_cycle() {
        let ctx = SimContext::with_defaults(Role::Client);
        let crossbow = ctx.weapons.weapon(CROSSBOW).unwrap();
        let mut record = PredictedEntityRecord::armed(CROSSBOW, &crossbow, 100.0);
        let dt = ctx.dt();
        let shoot = CommandInput {
            actions: ActionFlags::SHOOT,
            ..Default::default()
        };

        assert_eq!(resolve_weapon(&mut record, &shoot, &crossbow, Tick(1000), dt), WeaponAction::Fired);
        assert_eq!(record.current_ammo, 0);
        assert_eq!(record.last_shot_tick, Some(Tick(1000)));

        assert_eq!(
            resolve_weapon(&mut record, &shoot, &crossbow, Tick(1001), dt),
            WeaponAction::ReloadStarted
        );
        assert_eq!(record.last_reload_tick, Some(Tick(1001)));

        let mut reloaded_at = None;
        for tick in 1002..1200 {
            let action = resolve_weapon(&mut record, &CommandInput::default(), &crossbow, Tick(tick), dt);
            if action == WeaponAction::Reloaded {
                reloaded_at = Some(tick);
                break;
            }
        }
        let reloaded_at = reloaded_at.expect("weapon never reloaded");
        assert!((1059..=1062).contains(&reloaded_at), "reloaded at {}", reloaded_at);
        assert_eq!(record.current_ammo, 1);

        assert_eq!(
            resolve_weapon(&mut record, &shoot, &crossbow, Tick(reloaded_at + 1), dt),
            WeaponAction::Fired
        );
    }
}

/// IN-PROCESS CLIENT/SERVER TESTS
mod client_server_tests {
    use super::*;

    #[test]
    fn clients_converge_without_mispredictions() {
        let mut sim = Simulation::new(SimConfig::default(), 2);
        let a = sim.join(Box::new(Zigzag::new(5)));
        let b = sim.join(Box::new(Zigzag::new(7)));
        sim.run(240);

        for peer in [a, b] {
            let game = &sim.peers[peer].game;
            assert!(game.last_ack().is_some());
            assert!(game.monitor().checked() > 100, "only {} checks", game.monitor().checked());
            assert_eq!(game.monitor().mispredictions(), 0);
            sim.assert_matches_server(peer);
        }
    }

    #[test]
    fn redundant_commands_cover_packet_loss() {
        let mut sim = Simulation::new(SimConfig::default(), 2);
        sim.loss = Loss {
            drop_every: 3,
            blackout: 60..150,
        };
        let peer = sim.join(Box::new(Zigzag::new(5)));
        sim.run(240);

        let id = sim.peers[peer].game.client_id().unwrap();
        let connection = sim.clients.get(id).unwrap();
        assert_eq!(connection.synthesized, 0);
        assert!(sim.peers[peer].dropped > 20);
        assert_eq!(sim.peers[peer].game.monitor().mispredictions(), 0);
        sim.assert_matches_server(peer);
    }

    #[test]
    fn lost_commands_are_filled_and_corrected() {
        let config = SimConfig {
            redundant_commands: 1,
            ..Default::default()
        };
        let mut sim = Simulation::new(config, 2);
        sim.loss = Loss {
            drop_every: 3,
            blackout: 60..150,
        };
        let peer = sim.join(Box::new(Zigzag::new(5)));
        sim.run(260);

        let id = sim.peers[peer].game.client_id().unwrap();
        assert!(sim.clients.get(id).unwrap().synthesized > 0);

        let game = &sim.peers[peer].game;
        assert!(game.monitor().mispredictions() > 0);
        assert!(sim.peers[peer]
            .events
            .iter()
            .any(|event| matches!(event, ClientEvent::Mispredicted(_))));
        assert!(game.resimulated_ticks() > 0);

        // Long after the loss stopped, predictions agree again.
        sim.assert_matches_server(peer);
    }

    #[test]
    fn ghosts_activate_with_local_player() {
        let mut sim = Simulation::new(SimConfig::default(), 1);
        let a = sim.join(Box::new(Idle));
        let b = sim.join(Box::new(Idle));
        sim.run(20);

        let game = &sim.peers[a].game;
        let own = game.player_ghost().unwrap();
        let own_view = game.ghosts().try_get(own).unwrap();
        assert_eq!(own_view.kind, GhostKind::LocalPlayer);
        assert_eq!(own_view.state, GhostState::Active);

        let manager = sim.world.manager();
        assert_eq!(game.ghosts().state(manager), Some(GhostState::Active));

        let other = sim.peers[b].game.player_ghost().unwrap();
        let other_view = game.ghosts().try_get(other).unwrap();
        assert_eq!(other_view.kind, GhostKind::RemotePlayer);
        assert_eq!(other_view.state, GhostState::Active);
        assert!(game.remote_ghosts().any(|ghost| ghost.id == other));
    }

    #[test]
    fn hit_is_confirmed_to_shooter_only() {
        let mut sim = Simulation::new(SimConfig::default(), 1);
        let shooter = sim.join(Box::new(Idle));
        let victim = sim.join(Box::new(Idle));
        sim.run(10);

        let shooter_id = sim.peers[shooter].game.client_id().unwrap();
        let victim_id = sim.peers[victim].game.client_id().unwrap();
        let from = sim.world.player(shooter_id).unwrap().state.controller.position;
        let to = sim.world.player(victim_id).unwrap().state.controller.position;
        let mut script = vec![aim_at(from, to, ActionFlags::SHOOT); 3];
        script.push(aim_at(from, to, ActionFlags::NONE));
        sim.peers[shooter].input = Box::new(ScriptedInput::new(script));
        sim.run(20);

        let victim_ghost = sim.world.player(victim_id).unwrap().ghost;
        let confirmations: Vec<_> = sim.peers[shooter]
            .events
            .iter()
            .filter_map(|event| match event {
                ClientEvent::HitConfirmed { victim, damage, killed } => Some((*victim, *damage, *killed)),
                _ => None,
            })
            .collect();
        assert_eq!(confirmations, vec![(victim_ghost, 20.0, false)]);
        assert!(!sim.peers[victim]
            .events
            .iter()
            .any(|event| matches!(event, ClientEvent::HitConfirmed { .. })));

        let health = sim.world.player(victim_id).unwrap().state.record.health;
        assert_eq!(health, 80.0);
    }

    #[test]
    fn speculative_projectile_adopted_by_server_ghost() {
        let mut sim = Simulation::new(SimConfig::default(), 2);
        sim.world.set_default_weapon(CROSSBOW);
        let peer = sim.join(Box::new(Idle));
        sim.run(30);

        let visuals_before = sim.peers[peer].game.visuals().len();
        let shoot = CommandInput {
            actions: ActionFlags::SHOOT,
            ..Default::default()
        };
        sim.peers[peer].input = Box::new(ScriptedInput::new(vec![shoot, CommandInput::default()]));
        sim.run(1);

        let game = &sim.peers[peer].game;
        assert_eq!(game.projectiles().len(), 1);
        assert_eq!(game.visuals().len(), visuals_before + 1);

        sim.run(10);
        assert_eq!(sim.world.projectiles().len(), 1);
        let server_projectile = sim.world.projectiles()[0].ghost;

        let game = &sim.peers[peer].game;
        assert!(game.projectiles().is_empty());
        let visual = game.ghosts().visual(server_projectile).unwrap();
        assert_eq!(game.visuals().get(visual).unwrap().template, TEMPLATE_PROJECTILE);
        assert_eq!(game.visuals().len(), visuals_before + 1);
    }

    #[test]
    fn departed_player_destroyed_on_other_clients() {
        let mut sim = Simulation::new(SimConfig::default(), 1);
        let stays = sim.join(Box::new(Idle));
        let leaves = sim.join(Box::new(Idle));
        sim.run(10);

        let leaving_id = sim.peers[leaves].game.client_id().unwrap();
        let leaving_ghost = sim.peers[leaves].game.player_ghost().unwrap();
        assert!(sim.peers[stays].game.ghosts().contains(leaving_ghost));

        sim.disconnect(leaves);
        sim.run(6);

        assert!(sim.world.player(leaving_id).is_none());
        assert!(!sim.peers[stays].game.ghosts().contains(leaving_ghost));
        assert!(!sim.peers[stays].game.remote_ghosts().any(|ghost| ghost.id == leaving_ghost));
    }
}

/// REAL NETWORK TESTS
mod network_tests {
    use super::*;

    /// Runs a real server and a bot client over loopback
    #[tokio::test]
    async fn client_connects_and_predicts_over_udp() {
        let mut server = Server::new("127.0.0.1:0", SimContext::with_defaults(Role::Server))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap().to_string();

        let mut client = Client::new(&addr, 0, SimContext::with_defaults(Role::Client), Zigzag::new(6))
            .await
            .unwrap();

        tokio::select! {
            result = server.run() => panic!("server stopped early: {:?}", result.err()),
            result = client.run(Some(Duration::from_millis(1500))) => result.unwrap(),
        }

        let game = client.game_state();
        assert!(game.client_id().is_some());
        assert!(game.last_ack().is_some());
        assert!(game.player().is_some());
        assert!(game.tick().0 > 30);
        assert!(game.ghosts().len() >= 2);
        assert!(game.monitor().checked() > 0);
    }
}

/// Alternates strafing direction every `period` ticks.
struct Zigzag {
    period: u32,
}

impl Zigzag {
    fn new(period: u32) -> Self {
        Self { period }
    }
}

impl InputSource for Zigzag {
    fn sample(&mut self, tick: Tick) -> CommandInput {
        let side = if (tick.0 / self.period) % 2 == 0 { 1.0 } else { -1.0 };
        CommandInput {
            movement: (side, 0.5),
            yaw: 0.0,
            pitch: 0.0,
            actions: ActionFlags::NONE,
        }
    }
}

struct Idle;

impl InputSource for Idle {
    fn sample(&mut self, _tick: Tick) -> CommandInput {
        CommandInput::default()
    }
}

/// Command aiming from the shooter's eye at the target's hit sphere.
fn aim_at(shooter_feet: Vec3, target_feet: Vec3, actions: ActionFlags) -> CommandInput {
    let eye = shooter_feet.add(Vec3::new(0.0, 1.6, 0.0));
    let center = target_feet.add(Vec3::new(0.0, 0.9, 0.0));
    let delta = center.sub(eye);
    let horizontal = (delta.x * delta.x + delta.z * delta.z).sqrt();
    CommandInput {
        movement: (0.0, 0.0),
        yaw: delta.x.atan2(delta.z),
        pitch: delta.y.atan2(horizontal),
        actions,
    }
}

/// Drops every `drop_every`-th command packet, and every snapshot, while
/// the frame is inside `blackout`.
struct Loss {
    drop_every: u32,
    blackout: Range<u32>,
}

impl Default for Loss {
    fn default() -> Self {
        Self {
            drop_every: 0,
            blackout: 0..0,
        }
    }
}

struct Peer {
    addr: SocketAddr,
    game: ClientGameState,
    input: Box<dyn InputSource>,
    up: VecDeque<(u32, Vec<u8>)>,
    down: VecDeque<(u32, Vec<u8>)>,
    events: Vec<ClientEvent>,
    sent: u32,
    dropped: u32,
}

/// One server and its clients stepped in lockstep frames, one tick each,
/// with `latency` frames of delay in each direction.
struct Simulation {
    config: SimConfig,
    world: ServerWorld,
    clients: ClientManager,
    peers: Vec<Peer>,
    latency: u32,
    loss: Loss,
    frame: u32,
}

impl Simulation {
    fn new(config: SimConfig, latency: u32) -> Self {
        let server_ctx = context(Role::Server, &config);
        let clients = ClientManager::new(config.max_clients, config.command_buffer_capacity, config.client_timeout);
        Self {
            world: ServerWorld::new(server_ctx),
            config,
            clients,
            peers: Vec::new(),
            latency,
            loss: Loss::default(),
            frame: 0,
        }
    }

    fn join(&mut self, input: Box<dyn InputSource>) -> usize {
        let index = self.peers.len();
        let addr: SocketAddr = format!("127.0.0.1:{}", 20000 + index).parse().unwrap();
        let connect = Packet::Connect {
            client_version: PROTOCOL_VERSION,
        };
        let mut up = VecDeque::new();
        up.push_back((self.frame + self.latency, connect.encode().unwrap()));
        self.peers.push(Peer {
            addr,
            game: ClientGameState::new(context(Role::Client, &self.config)),
            input,
            up,
            down: VecDeque::new(),
            events: Vec::new(),
            sent: 0,
            dropped: 0,
        });
        index
    }

    fn disconnect(&mut self, peer: usize) {
        let at = self.frame + self.latency;
        self.peers[peer].up.push_back((at, Packet::Disconnect.encode().unwrap()));
    }

    fn in_blackout(&self) -> bool {
        self.loss.blackout.contains(&self.frame)
    }

    fn run(&mut self, frames: u32) {
        for _ in 0..frames {
            self.server_receive();
            self.server_step();
            self.clients_step();
            self.frame += 1;
        }
    }

    fn server_receive(&mut self) {
        for index in 0..self.peers.len() {
            while let Some((at, data)) = self.peers[index].up.front() {
                if *at > self.frame {
                    break;
                }
                let packet = Packet::decode(data).unwrap();
                self.peers[index].up.pop_front();
                let addr = self.peers[index].addr;
                self.server_handle(packet, addr);
            }
        }
    }

    fn server_handle(&mut self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::Connect { .. } => {
                let id = self.clients.next_id().unwrap();
                let ghost = self.world.add_player(id);
                self.clients.add_client(addr, ghost);
                let tick_rate = self.config.tick_rate;
                self.send_to(
                    addr,
                    Packet::Connected {
                        client_id: id,
                        player: ghost,
                        tick_rate,
                    },
                );
                for info in self.world.spawn_infos() {
                    if info.id != ghost {
                        self.send_to(addr, Packet::GhostSpawned(info));
                    }
                }
            }
            Packet::Commands { commands } => {
                if let Some(id) = self.clients.find_client_by_addr(addr) {
                    self.clients.add_commands(id, &commands);
                }
            }
            Packet::Disconnect => {
                if let Some(id) = self.clients.find_client_by_addr(addr) {
                    self.clients.remove_client(&id);
                    self.world.remove_player(id);
                }
            }
            other => panic!("server received {:?}", other),
        }
    }

    fn server_step(&mut self) {
        self.world.update(&mut self.clients);
        let snapshot = self.world.snapshot(self.clients.acks());

        for message in self.world.drain_outbound() {
            match message {
                Outbound::Broadcast(packet) => self.broadcast(packet),
                Outbound::To(client_id, packet) => {
                    if let Some(client) = self.clients.get(client_id) {
                        let addr = client.addr;
                        self.send_to(addr, packet);
                    }
                }
            }
        }

        if !self.in_blackout() {
            self.broadcast(Packet::Snapshot(snapshot));
        }
    }

    fn broadcast(&mut self, packet: Packet) {
        for (_, addr) in self.clients.get_client_addrs() {
            self.send_to(addr, packet.clone());
        }
    }

    fn send_to(&mut self, addr: SocketAddr, packet: Packet) {
        let at = self.frame + self.latency;
        let data = packet.encode().unwrap();
        if let Some(peer) = self.peers.iter_mut().find(|peer| peer.addr == addr) {
            peer.down.push_back((at, data));
        }
    }

    fn clients_step(&mut self) {
        let frame = self.frame;
        let blackout = self.in_blackout();
        let latency = self.latency;
        let drop_every = self.loss.drop_every;

        for peer in &mut self.peers {
            while let Some((at, data)) = peer.down.front() {
                if *at > frame {
                    break;
                }
                let packet = Packet::decode(data).unwrap();
                peer.down.pop_front();
                peer.game.handle_packet(packet);
            }

            if !peer.game.is_connected() {
                continue;
            }
            let input = peer.input.sample(peer.game.tick());
            let commands = peer.game.advance(&[input]);
            peer.events
                .extend(peer.game.drain_events().into_iter().map(|(_, event)| event));

            peer.sent += 1;
            if blackout && drop_every > 0 && peer.sent % drop_every == 0 {
                peer.dropped += 1;
                continue;
            }
            let packet = Packet::Commands { commands };
            peer.up.push_back((frame + latency, packet.encode().unwrap()));
        }
    }

    /// The client's prediction for the server's newest simulated tick
    /// matches the server's result.
    fn assert_matches_server(&self, peer: usize) {
        let game = &self.peers[peer].game;
        let id = game.client_id().unwrap();
        let player = self.world.player(id).unwrap();
        let tick = player.last_tick;

        let server_entry = player.history.get(tick).unwrap();
        let client_entry = game
            .predicted_history()
            .get(tick)
            .unwrap_or_else(|| panic!("no prediction for tick {}", tick));
        assert!(
            game.monitor().compare(tick, client_entry, server_entry).is_ok(),
            "client {:?} server {:?}",
            client_entry,
            server_entry
        );
    }
}

fn context(role: Role, config: &SimConfig) -> SimContext {
    let defaults = SimContext::with_defaults(role);
    SimContext::new(role, config.clone(), defaults.consts, Arc::clone(&defaults.weapons))
}
