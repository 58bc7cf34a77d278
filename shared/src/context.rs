//! Per-world simulation context
//!
//! Every system receives the context it runs in at construction time. There
//! is no process-wide registry, so a server world and any number of client
//! worlds can live side by side in one process.

use crate::config::SimConfig;
use crate::movement::ControllerConsts;
use crate::weapon::{WeaponProvider, WeaponTable};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which side of the simulation a world plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Server,
    Client,
}

#[derive(Clone)]
pub struct SimContext {
    pub role: Role,
    pub config: SimConfig,
    pub consts: ControllerConsts,
    pub weapons: Arc<dyn WeaponProvider>,
}

impl SimContext {
    pub fn new(role: Role, config: SimConfig, consts: ControllerConsts, weapons: Arc<dyn WeaponProvider>) -> Self {
        Self {
            role,
            config,
            consts,
            weapons,
        }
    }

    /// Context with baked defaults for `role`.
    pub fn with_defaults(role: Role) -> Self {
        Self::new(
            role,
            SimConfig::default(),
            ControllerConsts::default(),
            Arc::new(WeaponTable::default()),
        )
    }

    pub fn dt(&self) -> f32 {
        self.config.dt()
    }
}

impl std::fmt::Debug for SimContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimContext")
            .field("role", &self.role)
            .field("config", &self.config)
            .field("consts", &self.consts)
            .finish_non_exhaustive()
    }
}
