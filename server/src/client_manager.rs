//! Client connection management and command buffering for the server
//!
//! This module handles the server-side management of connected clients, including:
//! - Client connection lifecycle (connect, disconnect, timeout)
//! - Per-connection command buffers keyed by the client's own tick numbering
//! - Gap filling when commands for a tick never arrived
//! - Client capacity management and address tracking

use log::{debug, info, warn};
use shared::{CommandBuffer, CommandInput, GhostId, Tick};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A command ready to be simulated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledCommand {
    pub tick: Tick,
    pub input: CommandInput,
    /// True when the client never delivered a command for this tick
    pub synthesized: bool,
}

/// Represents a connected client and its command stream
#[derive(Debug)]
pub struct Client {
    /// Unique client identifier assigned by the server
    pub id: u32,
    /// Network address for sending responses
    pub addr: SocketAddr,
    /// Last time we received any packet from this client
    pub last_seen: Instant,
    /// Ghost of the player this client controls
    pub ghost: GhostId,
    pub commands: CommandBuffer,
    /// Last tick whose command actually arrived and was simulated
    pub last_processed_tick: Option<Tick>,
    /// Last tick simulated, filler or not
    pub last_simulated_tick: Option<Tick>,
    /// Most recent command consumed, used when the buffer no longer holds one
    last_command: Option<CommandInput>,
    pub synthesized: u64,
    pub late_commands: u64,
}

impl Client {
    pub fn new(id: u32, addr: SocketAddr, ghost: GhostId, capacity: usize) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
            ghost,
            commands: CommandBuffer::new(capacity),
            last_processed_tick: None,
            last_simulated_tick: None,
            last_command: None,
            synthesized: 0,
            late_commands: 0,
        }
    }

    /// Buffers a redundant command window. Commands for ticks that were
    /// already simulated are ignored. Returns how many were new.
    pub fn receive_commands(&mut self, commands: &[(Tick, CommandInput)]) -> usize {
        self.last_seen = Instant::now();
        let mut accepted = 0;
        for (tick, input) in commands {
            if let Some(simulated) = self.last_simulated_tick {
                if !tick.is_newer_than(simulated) {
                    if self.last_processed_tick.map_or(true, |processed| tick.is_newer_than(processed)) {
                        self.late_commands += 1;
                        debug!("Client {}: command for tick {} arrived after it was simulated", self.id, tick);
                    }
                    continue;
                }
            }
            if !self.commands.contains(*tick) {
                accepted += 1;
            }
            self.commands.add(*tick, *input);
        }
        accepted
    }

    /// Takes every tick from one past the last simulated tick through
    /// `through`, synthesizing missing ticks from the last known command.
    pub fn schedule_through(&mut self, through: Tick) -> Vec<ScheduledCommand> {
        let from = match self.last_simulated_tick {
            Some(simulated) => simulated.next(),
            None => match self.commands.oldest_tick() {
                Some(oldest) => oldest,
                None => return Vec::new(),
            },
        };
        if from.is_newer_than(through) {
            return Vec::new();
        }

        let mut from = from;
        let capacity = self.commands.capacity() as u32;
        if through.ticks_since(from) as u32 >= capacity {
            let skipped_to = through.sub(capacity - 1);
            warn!(
                "Client {} fell {} ticks behind, skipping to tick {}",
                self.id,
                through.ticks_since(from),
                skipped_to
            );
            from = skipped_to;
        }

        let mut scheduled = Vec::new();
        for tick in Tick::range_inclusive(from, through) {
            if let Some(input) = self.commands.get_at(tick).copied() {
                self.last_command = Some(input);
                self.last_processed_tick = Some(tick);
                scheduled.push(ScheduledCommand {
                    tick,
                    input,
                    synthesized: false,
                });
            } else {
                let filler = self
                    .commands
                    .latest_at_or_before(tick)
                    .map(|(_, input)| input)
                    .or(self.last_command);
                let Some(input) = filler else {
                    continue;
                };
                self.synthesized += 1;
                debug!("Client {}: synthesized command for tick {}", self.id, tick);
                scheduled.push(ScheduledCommand {
                    tick,
                    input,
                    synthesized: true,
                });
            }
            self.last_simulated_tick = Some(tick);
        }

        if let Some(simulated) = self.last_simulated_tick {
            self.commands.discard_before(simulated);
        }
        scheduled
    }

    /// Schedules every tick up to the newest buffered command.
    pub fn schedule_available(&mut self) -> Vec<ScheduledCommand> {
        match self.commands.newest_tick() {
            Some(newest) => self.schedule_through(newest),
            None => Vec::new(),
        }
    }

    /// Checks if the client has exceeded the connection timeout
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Manages all connected clients and their command streams
pub struct ClientManager {
    /// Connected clients indexed by their unique ID, iterated in id order
    clients: BTreeMap<u32, Client>,
    /// Next available client ID for new connections
    next_client_id: u32,
    /// Maximum number of concurrent clients allowed
    max_clients: usize,
    command_capacity: usize,
    timeout: Duration,
}

impl ClientManager {
    pub fn new(max_clients: usize, command_capacity: usize, timeout: Duration) -> Self {
        Self {
            clients: BTreeMap::new(),
            next_client_id: 1,
            max_clients,
            command_capacity,
            timeout,
        }
    }

    /// Reserves the next client id, or `None` when the server is full.
    pub fn next_id(&self) -> Option<u32> {
        (self.clients.len() < self.max_clients).then_some(self.next_client_id)
    }

    /// Attempts to add a new client connection controlling `ghost`.
    pub fn add_client(&mut self, addr: SocketAddr, ghost: GhostId) -> Option<u32> {
        let client_id = self.next_id()?;
        self.next_client_id += 1;

        let client = Client::new(client_id, addr, ghost, self.command_capacity);
        info!("Client {} connected from {}", client_id, addr);
        self.clients.insert(client_id, client);

        Some(client_id)
    }

    pub fn remove_client(&mut self, client_id: &u32) -> Option<Client> {
        let client = self.clients.remove(client_id)?;
        info!(
            "Client {} disconnected ({} synthesized, {} late commands)",
            client.id, client.synthesized, client.late_commands
        );
        Some(client)
    }

    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<u32> {
        self.clients
            .iter()
            .find(|(_, client)| client.addr == addr)
            .map(|(id, _)| *id)
    }

    pub fn get(&self, client_id: u32) -> Option<&Client> {
        self.clients.get(&client_id)
    }

    pub fn get_mut(&mut self, client_id: u32) -> Option<&mut Client> {
        self.clients.get_mut(&client_id)
    }

    /// Buffers commands for a client. Returns false if the client ID is invalid.
    pub fn add_commands(&mut self, client_id: u32, commands: &[(Tick, CommandInput)]) -> bool {
        match self.clients.get_mut(&client_id) {
            Some(client) => {
                client.receive_commands(commands);
                true
            }
            None => false,
        }
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Client> {
        self.clients.values_mut()
    }

    /// Last real command tick per client, sent to clients as acknowledgements.
    pub fn acks(&self) -> std::collections::HashMap<u32, Tick> {
        self.clients
            .iter()
            .filter_map(|(id, client)| client.last_processed_tick.map(|tick| (*id, tick)))
            .collect()
    }

    /// Removes timed-out clients and returns them for cleanup elsewhere.
    pub fn check_timeouts(&mut self) -> Vec<Client> {
        let timed_out: Vec<u32> = self
            .clients
            .iter()
            .filter(|(_, client)| client.is_timed_out(self.timeout))
            .map(|(id, _)| *id)
            .collect();

        timed_out
            .iter()
            .filter_map(|client_id| self.remove_client(client_id))
            .collect()
    }

    pub fn get_client_addrs(&self) -> Vec<(u32, SocketAddr)> {
        self.clients
            .iter()
            .map(|(id, client)| (*id, client.addr))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::ActionFlags;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn test_addr2() -> SocketAddr {
        "127.0.0.1:8081".parse().unwrap()
    }

    fn command(forward: f32) -> CommandInput {
        CommandInput {
            movement: (0.0, forward),
            ..Default::default()
        }
    }

    fn client() -> Client {
        Client::new(1, test_addr(), GhostId(1), 64)
    }

    #[test]
    fn test_gap_filled_from_last_known_command() {
        let mut client = client();
        let at_ten = CommandInput {
            movement: (0.3, 0.7),
            yaw: 1.0,
            pitch: 0.2,
            actions: ActionFlags::JUMP,
        };
        client.receive_commands(&[(Tick(10), at_ten), (Tick(13), command(1.0))]);

        let scheduled = client.schedule_available();

        let ticks: Vec<u32> = scheduled.iter().map(|c| c.tick.0).collect();
        assert_eq!(ticks, vec![10, 11, 12, 13]);
        assert_eq!(scheduled[1].input, at_ten);
        assert_eq!(scheduled[2].input, at_ten);
        assert!(scheduled[1].synthesized && scheduled[2].synthesized);
        assert!(!scheduled[3].synthesized);
        assert_eq!(client.synthesized, 2);
        assert_eq!(client.last_processed_tick, Some(Tick(13)));
    }

    #[test]
    fn test_last_processed_excludes_fillers() {
        let mut client = client();
        client.receive_commands(&[(Tick(5), command(1.0))]);
        client.schedule_available();

        let scheduled = client.schedule_through(Tick(7));
        assert_eq!(scheduled.len(), 2);
        assert_eq!(client.last_processed_tick, Some(Tick(5)));
        assert_eq!(client.last_simulated_tick, Some(Tick(7)));
    }

    #[test]
    fn test_late_commands_ignored() {
        let mut client = client();
        client.receive_commands(&[(Tick(1), command(1.0))]);
        client.schedule_through(Tick(3));

        let accepted = client.receive_commands(&[(Tick(2), command(0.5)), (Tick(3), command(0.5)), (Tick(4), command(0.5))]);
        assert_eq!(accepted, 1);
        assert_eq!(client.late_commands, 2);
        assert_eq!(client.schedule_available().len(), 1);
    }

    #[test]
    fn test_redundant_window_is_idempotent() {
        let mut client = client();
        assert_eq!(client.receive_commands(&[(Tick(1), command(1.0)), (Tick(2), command(1.0))]), 2);
        assert_eq!(client.receive_commands(&[(Tick(1), command(1.0)), (Tick(2), command(1.0))]), 0);
        assert_eq!(client.schedule_available().len(), 2);
    }

    #[test]
    fn test_ticks_strictly_increase_across_wrap() {
        let mut client = client();
        client.receive_commands(&[(Tick(u32::MAX - 1), command(1.0)), (Tick(1), command(1.0))]);
        let ticks: Vec<Tick> = client.schedule_available().iter().map(|c| c.tick).collect();
        assert_eq!(ticks, vec![Tick(u32::MAX - 1), Tick(u32::MAX), Tick(0), Tick(1)]);
    }

    #[test]
    fn test_client_timeout() {
        let mut client = client();
        assert!(!client.is_timed_out(Duration::from_secs(1)));
        client.last_seen = Instant::now() - Duration::from_secs(2);
        assert!(client.is_timed_out(Duration::from_secs(1)));
    }

    #[test]
    fn test_add_client_max_capacity() {
        let mut manager = ClientManager::new(1, 64, Duration::from_secs(5));

        assert_eq!(manager.add_client(test_addr(), GhostId(1)), Some(1));
        assert!(manager.add_client(test_addr2(), GhostId(2)).is_none());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_find_and_remove_client() {
        let mut manager = ClientManager::new(3, 64, Duration::from_secs(5));
        let id1 = manager.add_client(test_addr(), GhostId(1)).unwrap();
        let id2 = manager.add_client(test_addr2(), GhostId(2)).unwrap();

        assert_eq!(manager.find_client_by_addr(test_addr2()), Some(id2));
        assert!(manager.remove_client(&id1).is_some());
        assert!(manager.remove_client(&id1).is_none());
        assert_eq!(manager.find_client_by_addr(test_addr()), None);
        assert!(!manager.is_empty());
    }

    #[test]
    fn test_add_commands_to_nonexistent_client() {
        let mut manager = ClientManager::new(2, 64, Duration::from_secs(5));
        assert!(!manager.add_commands(999, &[(Tick(1), command(1.0))]));
    }

    #[test]
    fn test_acks_only_report_real_commands() {
        let mut manager = ClientManager::new(2, 64, Duration::from_secs(5));
        let id = manager.add_client(test_addr(), GhostId(1)).unwrap();
        assert!(manager.acks().is_empty());

        manager.add_commands(id, &[(Tick(4), command(1.0))]);
        manager.get_mut(id).unwrap().schedule_through(Tick(6));
        assert_eq!(manager.acks().get(&id), Some(&Tick(4)));
    }

    #[test]
    fn test_check_timeouts_removes_clients() {
        let mut manager = ClientManager::new(2, 64, Duration::from_secs(1));
        let id = manager.add_client(test_addr(), GhostId(1)).unwrap();
        manager.get_mut(id).unwrap().last_seen = Instant::now() - Duration::from_secs(2);

        let removed = manager.check_timeouts();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].ghost, GhostId(1));
        assert!(manager.is_empty());
    }
}
