//! # Game Client Library
//!
//! The predicting half of the ghost netcode. The client never waits for the
//! server before moving its own player: every tick it samples an input,
//! stores it in a tick-indexed command buffer, predicts the result with the
//! shared simulation and sends a redundant window of recent commands.
//!
//! ## Client-Side Prediction
//!
//! Prediction runs `shared::player::simulate_tick`, the exact function the
//! server uses, with the same controller constants and weapon table. Given
//! identical inputs both sides produce identical state.
//!
//! ## Rollback
//!
//! Snapshots carry the authoritative player state for the last tick the
//! server simulated plus the last acknowledged command. On the next
//! prediction step the client restores that state, replays every
//! unacknowledged command and re-sends those commands. Predicted and
//! authoritative transforms are recorded per tick and compared within tight
//! tolerances; divergences are logged and counted.
//!
//! ## Ghosts
//!
//! Server spawn announcements become ghosts in a
//! `shared::ghost::GhostLifecycleManager`. The client's own player activates
//! right after the managers and before other players. Projectiles the
//! client fired speculatively are adopted by their confirmed ghost when the
//! spawn tick matches closely enough, so no duplicate is shown.
//!
//! ## Module Organization
//!
//! - `game`: prediction, rollback, speculative projectiles and ghost state
//! - `input`: scripted input sources (random-walk bot, fixed scripts)
//! - `network`: headless UDP client with optional simulated latency
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::input::BotInput;
//! use client::network::Client;
//! use shared::{Role, SimContext};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ctx = SimContext::with_defaults(Role::Client);
//!     let mut client = Client::new("127.0.0.1:8080", 0, ctx, BotInput::new(1)).await?;
//!     client.run(Some(Duration::from_secs(30))).await?;
//!     Ok(())
//! }
//! ```

pub mod game;
pub mod input;
pub mod network;
