use crate::game::{ClientEvent, ClientGameState};
use crate::input::InputSource;
use log::{debug, error, info, warn};
use shared::{Packet, SimContext, MAX_PACKET_SIZE, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::{interval, sleep, MissedTickBehavior};

/// Headless UDP client driving the prediction loop from an input source.
pub struct Client<I: InputSource> {
    socket: UdpSocket,
    server_addr: SocketAddr,

    game_state: ClientGameState,
    input: I,
    tick_duration: Duration,

    fake_ping_ms: u64,
}

impl<I: InputSource> Client<I> {
    pub async fn new(
        server_addr: &str,
        fake_ping_ms: u64,
        ctx: SimContext,
        input: I,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        ctx.config.validate()?;
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let server_addr = server_addr.parse()?;
        let tick_duration = ctx.config.tick_duration();

        Ok(Client {
            socket,
            server_addr,
            game_state: ClientGameState::new(ctx),
            input,
            tick_duration,
            fake_ping_ms,
        })
    }

    pub fn game_state(&self) -> &ClientGameState {
        &self.game_state
    }

    async fn connect(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        info!("Connecting to server...");

        let packet = Packet::Connect {
            client_version: PROTOCOL_VERSION,
        };
        self.send_packet(&packet).await?;

        Ok(())
    }

    async fn send_packet(&self, packet: &Packet) -> Result<(), Box<dyn std::error::Error>> {
        if self.fake_ping_ms > 0 {
            sleep(Duration::from_millis(self.fake_ping_ms / 2)).await;
        }

        let data = packet.encode()?;
        self.socket.send_to(&data, self.server_addr).await?;
        Ok(())
    }

    /// Predicts every tick that has come due and sends the command window.
    /// Nothing is predicted before the server has accepted us.
    async fn tick(&mut self, due: u32) -> Result<(), Box<dyn std::error::Error>> {
        if !self.game_state.is_connected() {
            return Ok(());
        }
        let start = self.game_state.tick();
        let inputs: Vec<_> = (0..due).map(|offset| self.input.sample(start.add(offset))).collect();
        let commands = self.game_state.advance(&inputs);

        for (tick, event) in self.game_state.drain_events() {
            match event {
                ClientEvent::Mispredicted(divergence) => debug!("Corrected after {}", divergence),
                ClientEvent::HitConfirmed { victim, killed, .. } => {
                    info!("Hit {} at tick {}{}", victim, tick, if killed { " (kill)" } else { "" })
                }
                ClientEvent::Effect(kind) => debug!("{:?} effect at tick {}", kind, tick),
            }
        }

        if !commands.is_empty() {
            self.send_packet(&Packet::Commands { commands }).await?;
        }
        Ok(())
    }

    /// Runs until `duration` has elapsed, or forever when `None`.
    pub async fn run(&mut self, duration: Option<Duration>) -> Result<(), Box<dyn std::error::Error>> {
        self.connect().await?;

        let mut tick_interval = interval(self.tick_duration);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let started = Instant::now();
        let mut last_tick = Instant::now();

        let mut buffer = [0u8; MAX_PACKET_SIZE];

        loop {
            if duration.is_some_and(|limit| started.elapsed() >= limit) {
                break;
            }

            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, _)) => {
                            if self.fake_ping_ms > 0 {
                                sleep(Duration::from_millis(self.fake_ping_ms / 2)).await;
                            }

                            match Packet::decode(&buffer[0..len]) {
                                Ok(packet) => self.game_state.handle_packet(packet),
                                Err(e) => warn!("Dropping undecodable packet: {}", e),
                            }
                        },
                        Err(e) => error!("Error receiving packet: {}", e),
                    }
                },

                _ = tick_interval.tick() => {
                    // Late frames predict every tick they missed, in order.
                    let elapsed = last_tick.elapsed();
                    let due = (elapsed.as_secs_f64() / self.tick_duration.as_secs_f64()).round().max(1.0) as u32;
                    last_tick += self.tick_duration * due;
                    if let Err(e) = self.tick(due.min(8)).await {
                        error!("Error sending commands: {}", e);
                    }
                },
            }
        }

        if self.game_state.is_connected() {
            let _ = self.send_packet(&Packet::Disconnect).await;
        }
        info!(
            "Stopped at tick {} ({} mispredictions, {} ticks replayed)",
            self.game_state.tick(),
            self.game_state.monitor().mispredictions(),
            self.game_state.resimulated_ticks()
        );

        Ok(())
    }
}
