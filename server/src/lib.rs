//! # Game Server Library
//!
//! The authoritative half of the ghost netcode. The server owns the canonical
//! simulation: it buffers each connection's command stream, runs the shared
//! movement and weapon code once per command tick, resolves hits, spawns and
//! retires projectile ghosts, and broadcasts snapshots that clients roll back
//! to.
//!
//! ## Command Pipeline
//!
//! Clients send every command several times in consecutive packets. The
//! [`client_manager`] keeps them in a fixed-capacity ring indexed by tick and
//! hands the simulation a gap-free run each server tick. A tick that never
//! arrived is synthesized from the newest known command at or before it, and
//! commands for ticks that were already simulated are dropped.
//!
//! ## Simulation
//!
//! [`game::ServerWorld`] applies scheduled commands through
//! `shared::player::simulate_tick`, the same function the client predicts
//! with. Hits are resolved against player hit spheres, damage is applied
//! with the victim's tick, and the shooter receives a directed hit
//! confirmation. Deaths are reported to a pluggable [`scoreboard::Scoreboard`].
//!
//! ## Ghost Lifecycle
//!
//! Every simulated entity is a ghost tracked by a
//! `shared::ghost::GhostLifecycleManager`. On the server, visuals are stripped
//! of client-only components and never render; managers still activate
//! before players so ordering matches what clients see.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::Server;
//! use shared::{Role, SimContext};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = Server::new("127.0.0.1:8080", SimContext::with_defaults(Role::Server)).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! The server runs internal async tasks for receiving packets, sending
//! queued packets and checking client timeouts, while the main loop ticks
//! the world at the configured rate.

pub mod client_manager;
pub mod game;
pub mod network;
pub mod scoreboard;
