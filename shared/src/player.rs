//! One simulated player tick, shared by both roles
//!
//! Server and client call the same [`simulate_tick`] so predicted and
//! authoritative results can only differ through their inputs.

use crate::command::CommandInput;
use crate::context::SimContext;
use crate::ghost::GhostId;
use crate::math::{look_direction, Vec3};
use crate::movement::{accumulate, ControllerState, GroundQuery, StepEvents};
use crate::tick::Tick;
use crate::weapon::{resolve_weapon, HitTarget, PredictedEntityRecord, WeaponAction, WeaponData, WeaponId, LAYER_PLAYER};
use log::warn;
use serde::{Deserialize, Serialize};

/// Movement and combat state of one player.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    pub controller: ControllerState,
    pub record: PredictedEntityRecord,
}

pub const PLAYER_RADIUS: f32 = 0.5;
/// Height of the hit sphere's center above the feet
pub const PLAYER_CENTER_HEIGHT: f32 = 0.9;

impl PlayerState {
    /// Hit sphere of this player as seen by weapon resolution.
    pub fn hit_target(&self, id: GhostId) -> HitTarget {
        HitTarget {
            id,
            center: self.controller.position.add(Vec3::new(0.0, PLAYER_CENTER_HEIGHT, 0.0)),
            radius: PLAYER_RADIUS,
            layer: LAYER_PLAYER,
        }
    }
}

/// A shot fired on this tick, before hit resolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Shot {
    pub weapon_id: WeaponId,
    pub weapon: WeaponData,
    pub origin: Vec3,
    pub direction: Vec3,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickOutcome {
    pub events: StepEvents,
    pub action: WeaponAction,
    pub shot: Option<Shot>,
}

impl TickOutcome {
    const NOTHING: TickOutcome = TickOutcome {
        events: StepEvents {
            jumped: false,
            landed: false,
        },
        action: WeaponAction::Idle,
        shot: None,
    };
}

/// Advances `player` by one tick of `input`: movement first, then weapons.
/// Dead players do not move or shoot.
pub fn simulate_tick(
    player: &mut PlayerState,
    input: &CommandInput,
    ctx: &SimContext,
    tick: Tick,
    ground: &impl GroundQuery,
) -> TickOutcome {
    simulate_span(player, input, ctx, tick, 1, ground)
}

/// Applies `input` once for `span` ticks ending at `tick`, stepping with
/// `span` times the tick length. A span of one is exactly [`simulate_tick`].
pub fn simulate_span(
    player: &mut PlayerState,
    input: &CommandInput,
    ctx: &SimContext,
    tick: Tick,
    span: u32,
    ground: &impl GroundQuery,
) -> TickOutcome {
    if !player.record.is_alive() {
        return TickOutcome::NOTHING;
    }
    let dt = ctx.dt() * span.max(1) as f32;

    let step = accumulate(&player.controller, input, &ctx.consts, dt, ground);
    player.controller = step.state;
    if step.events.jumped {
        player.record.last_jump_tick = Some(tick);
    }
    if step.events.landed {
        player.record.last_land_tick = Some(tick);
    }

    let Some(weapon) = ctx.weapons.weapon(player.record.weapon_id) else {
        warn!("Unknown weapon {} equipped at tick {}", player.record.weapon_id, tick);
        return TickOutcome {
            events: step.events,
            ..TickOutcome::NOTHING
        };
    };
    let action = resolve_weapon(&mut player.record, input, &weapon, tick, dt);
    let shot = (action == WeaponAction::Fired).then(|| Shot {
        weapon_id: player.record.weapon_id,
        weapon,
        origin: player.controller.eye_position(),
        direction: look_direction(player.controller.yaw, player.controller.pitch),
    });

    TickOutcome {
        events: step.events,
        action,
        shot,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ActionFlags;
    use crate::context::Role;
    use crate::level::Level;
    use crate::weapon::{WeaponProvider, CROSSBOW};

    fn player(ctx: &SimContext, level: &Level) -> PlayerState {
        let weapon = ctx.weapons.weapon(CROSSBOW).unwrap();
        PlayerState {
            controller: ControllerState::spawned_at(level.spawn_point(0), 0.0),
            record: PredictedEntityRecord::armed(CROSSBOW, &weapon, 100.0),
        }
    }

    #[test]
    fn test_identical_inputs_identical_results() {
        let ctx = SimContext::with_defaults(Role::Server);
        let level = Level::arena();
        let mut a = player(&ctx, &level);
        let mut b = a;

        for tick in 0..240u32 {
            let input = CommandInput {
                movement: ((tick as f32 * 0.1).sin(), 1.0),
                yaw: tick as f32 * 0.01,
                pitch: 0.0,
                actions: if tick % 50 == 0 { ActionFlags::JUMP } else { ActionFlags::NONE },
            };
            simulate_tick(&mut a, &input, &ctx, Tick(tick), &level);
            simulate_tick(&mut b, &input, &ctx, Tick(tick), &level);
        }
        assert_eq!(a.controller.position.x.to_bits(), b.controller.position.x.to_bits());
        assert_eq!(a.controller.position.z.to_bits(), b.controller.position.z.to_bits());
        assert_eq!(a, b);
    }

    #[test]
    fn test_shot_reported_from_eye() {
        let ctx = SimContext::with_defaults(Role::Client);
        let level = Level::arena();
        let mut state = player(&ctx, &level);
        let input = CommandInput {
            actions: ActionFlags::SHOOT,
            ..Default::default()
        };

        let outcome = simulate_tick(&mut state, &input, &ctx, Tick(1), &level);

        let shot = outcome.shot.unwrap();
        assert_eq!(outcome.action, WeaponAction::Fired);
        assert_eq!(shot.origin, state.controller.eye_position());
        assert_eq!(state.record.last_shot_tick, Some(Tick(1)));
    }

    #[test]
    fn test_span_of_one_matches_single_tick() {
        let ctx = SimContext::with_defaults(Role::Client);
        let level = Level::arena();
        let mut a = player(&ctx, &level);
        let mut b = a;
        let input = CommandInput {
            movement: (0.3, 1.0),
            yaw: 0.4,
            ..Default::default()
        };

        simulate_tick(&mut a, &input, &ctx, Tick(9), &level);
        simulate_span(&mut b, &input, &ctx, Tick(9), 1, &level);
        assert_eq!(a, b);

        let mut c = player(&ctx, &level);
        simulate_span(&mut c, &input, &ctx, Tick(9), 3, &level);
        assert!(c.controller.position.z > a.controller.position.z);
    }

    #[test]
    fn test_dead_player_is_frozen() {
        let ctx = SimContext::with_defaults(Role::Server);
        let level = Level::arena();
        let mut state = player(&ctx, &level);
        state.record.health = 0.0;
        let before = state;
        let input = CommandInput {
            movement: (0.0, 1.0),
            actions: ActionFlags::SHOOT,
            ..Default::default()
        };

        let outcome = simulate_tick(&mut state, &input, &ctx, Tick(1), &level);
        assert_eq!(outcome.action, WeaponAction::Idle);
        assert_eq!(state, before);
    }
}
