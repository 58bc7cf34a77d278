//! Deterministic character movement state machine
//!
//! [`accumulate`] is the single entry point used by both the authoritative
//! server and the predicting client. It is a pure function of its arguments:
//! no wall clock, no randomness and no shared mutable state. Calling it with
//! the same inputs in the same order yields bit-identical results on both
//! sides, which is what makes rollback and misprediction checks meaningful.

use crate::command::CommandInput;
use crate::level::{SurfaceMaterial, MATERIAL_CONCRETE};
use crate::math::{Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Movement phase of a character controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MovementPhase {
    #[default]
    Standing,
    Jumping,
    Falling,
}

/// Read-only tuning for one controller archetype.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControllerConsts {
    /// Ground movement speed in m/s
    pub move_speed: f32,
    /// Horizontal speed while airborne in m/s
    pub air_speed: f32,
    /// Multiplier on `move_speed` while the landing timeout runs
    pub landing_speed_scale: f32,
    /// Gravity acceleration, negative is down
    pub gravity: f32,
    pub jump_height: f32,
    /// Lowest vertical velocity reachable while falling, negative
    pub terminal_velocity: f32,
    /// Constant downward velocity applied while grounded
    pub grounded_bias: f32,
    pub jump_timeout: f32,
    pub fall_timeout: f32,
    pub landing_timeout: f32,
    pub ground_probe_radius: f32,
    /// How far below the feet a surface still counts as ground
    pub ground_probe_distance: f32,
    /// How far above the feet the probe starts, so shallow penetration is recovered
    pub ground_probe_skin: f32,
    /// Minimum dot(normal, up) for a surface to be walkable
    pub min_ground_dot: f32,
    pub teleport_freeze: f32,
}

impl Default for ControllerConsts {
    fn default() -> Self {
        Self {
            move_speed: 5.0,
            air_speed: 3.5,
            landing_speed_scale: 0.5,
            gravity: -15.0,
            jump_height: 1.2,
            terminal_velocity: -53.0,
            grounded_bias: -2.0,
            jump_timeout: 0.5,
            fall_timeout: 0.15,
            landing_timeout: 0.2,
            ground_probe_radius: 0.28,
            ground_probe_distance: 0.08,
            ground_probe_skin: 0.5,
            min_ground_dot: 0.7,
            teleport_freeze: 0.25,
        }
    }
}

/// Full simulated movement state of one character.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControllerState {
    pub position: Vec3,
    pub rotation: Quat,
    pub yaw: f32,
    pub pitch: f32,
    /// Horizontal velocity (x, z)
    pub planar_velocity: (f32, f32),
    pub vertical_velocity: f32,
    pub phase: MovementPhase,
    pub jump_timeout: f32,
    pub fall_timeout: f32,
    pub landing_timeout: f32,
    /// Remaining seconds during which movement constants are not applied
    pub teleport_freeze: f32,
    pub ground_material: SurfaceMaterial,
}

impl ControllerState {
    pub fn spawned_at(position: Vec3, yaw: f32) -> Self {
        Self {
            position,
            rotation: Quat::from_yaw(yaw),
            yaw,
            pitch: 0.0,
            planar_velocity: (0.0, 0.0),
            vertical_velocity: 0.0,
            phase: MovementPhase::Standing,
            jump_timeout: 0.0,
            fall_timeout: 0.0,
            landing_timeout: 0.0,
            teleport_freeze: 0.0,
            ground_material: MATERIAL_CONCRETE,
        }
    }

    /// Eye position used as the origin of hitscan and projectile shots.
    pub fn eye_position(&self) -> Vec3 {
        self.position.add(Vec3::new(0.0, EYE_HEIGHT, 0.0))
    }

    pub fn is_grounded(&self) -> bool {
        self.phase == MovementPhase::Standing
    }
}

impl Default for ControllerState {
    fn default() -> Self {
        Self::spawned_at(Vec3::ZERO, 0.0)
    }
}

pub const EYE_HEIGHT: f32 = 1.6;

/// One-shot triggers produced by a single step.
///
/// These live on the step result instead of the persistent state, so they
/// are false on every tick except the one that fired them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepEvents {
    pub jumped: bool,
    pub landed: bool,
}

impl StepEvents {
    pub fn iter(self) -> impl Iterator<Item = ControllerEvent> {
        let jumped = self.jumped.then_some(ControllerEvent::Jumped);
        let landed = self.landed.then_some(ControllerEvent::Landed);
        jumped.into_iter().chain(landed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControllerEvent {
    Jumped,
    Landed,
}

/// Result of advancing a controller by one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Step {
    pub state: ControllerState,
    pub events: StepEvents,
}

/// A contact reported by a downward ground cast.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroundHit {
    pub point: Vec3,
    pub normal: Vec3,
    pub distance: f32,
    pub material: SurfaceMaterial,
}

/// Read-only world query used for ground detection.
pub trait GroundQuery {
    /// Casts a vertical cylinder of `radius` downward from `origin` and
    /// returns every surface hit within `max_distance`.
    fn cast_down(&self, origin: Vec3, radius: f32, max_distance: f32) -> Vec<GroundHit>;
}

/// Chosen ground contact after filtering a multi-hit cast.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroundContact {
    pub normal: Vec3,
    pub height: f32,
    pub material: SurfaceMaterial,
}

/// Picks the ground contact out of a multi-hit cast.
///
/// The most upward-facing normal decides walkability so that glancing corner
/// contacts do not register as ground. Distance only breaks ties between
/// equally upward normals and selects the surface material.
pub fn select_ground(hits: &[GroundHit]) -> Option<GroundContact> {
    let best_normal = hits.iter().reduce(|best, hit| {
        let best_up = best.normal.dot(Vec3::UP);
        let hit_up = hit.normal.dot(Vec3::UP);
        if hit_up > best_up || (hit_up == best_up && hit.distance < best.distance) {
            hit
        } else {
            best
        }
    })?;
    let closest = hits.iter().reduce(|closest, hit| {
        if hit.distance < closest.distance {
            hit
        } else {
            closest
        }
    })?;

    Some(GroundContact {
        normal: best_normal.normal,
        height: best_normal.point.y,
        material: closest.material,
    })
}

fn probe_ground(
    position: Vec3,
    depth: f32,
    consts: &ControllerConsts,
    ground: &impl GroundQuery,
) -> Option<GroundContact> {
    let origin = position.add(Vec3::new(0.0, consts.ground_probe_skin, 0.0));
    let hits = ground.cast_down(
        origin,
        consts.ground_probe_radius,
        consts.ground_probe_skin + depth,
    );
    select_ground(&hits).filter(|contact| contact.normal.dot(Vec3::UP) >= consts.min_ground_dot)
}

/// Advances `state` by one step of `dt` seconds under `input`.
pub fn accumulate(
    state: &ControllerState,
    input: &CommandInput,
    consts: &ControllerConsts,
    dt: f32,
    ground: &impl GroundQuery,
) -> Step {
    let mut next = *state;
    let mut events = StepEvents::default();

    next.yaw = input.yaw;
    next.pitch = input.pitch;
    next.rotation = Quat::from_yaw(input.yaw);

    if next.teleport_freeze > 0.0 {
        next.teleport_freeze = (next.teleport_freeze - dt).max(0.0);
        next.planar_velocity = (0.0, 0.0);
        next.vertical_velocity = 0.0;
        return Step {
            state: next,
            events,
        };
    }

    let contact = probe_ground(next.position, consts.ground_probe_distance, consts, ground);
    if let Some(contact) = contact {
        next.ground_material = contact.material;
    }

    match next.phase {
        MovementPhase::Standing => match contact {
            None => {
                next.phase = MovementPhase::Falling;
                next.jump_timeout = consts.jump_timeout;
                next.fall_timeout = consts.fall_timeout;
            }
            Some(_) => {
                next.fall_timeout = consts.fall_timeout;
                if next.vertical_velocity < 0.0 {
                    next.vertical_velocity = consts.grounded_bias;
                }
                if input.jump() && next.jump_timeout <= 0.0 {
                    next.vertical_velocity = (consts.jump_height * -2.0 * consts.gravity).sqrt();
                    next.phase = MovementPhase::Jumping;
                    events.jumped = true;
                }
                next.jump_timeout = (next.jump_timeout - dt).max(0.0);
            }
        },
        MovementPhase::Jumping | MovementPhase::Falling => {
            if contact.is_some() && next.vertical_velocity <= 0.0 {
                next.phase = MovementPhase::Standing;
                next.vertical_velocity = consts.grounded_bias;
                next.jump_timeout = consts.jump_timeout;
                next.fall_timeout = consts.fall_timeout;
                next.landing_timeout = consts.landing_timeout;
                events.landed = true;
            } else {
                next.fall_timeout = (next.fall_timeout - dt).max(0.0);
            }
        }
    }

    if next.phase != MovementPhase::Standing {
        next.vertical_velocity = (next.vertical_velocity + consts.gravity * dt).max(consts.terminal_velocity);
    }

    let speed = match next.phase {
        MovementPhase::Standing if next.landing_timeout > 0.0 => {
            consts.move_speed * consts.landing_speed_scale
        }
        MovementPhase::Standing => consts.move_speed,
        MovementPhase::Jumping | MovementPhase::Falling => consts.air_speed,
    };
    next.landing_timeout = (next.landing_timeout - dt).max(0.0);

    let (strafe, forward) = clamp_unit(input.movement);
    let direction = next.rotation.rotate(Vec3::new(strafe, 0.0, forward));
    next.planar_velocity = (direction.x * speed, direction.z * speed);

    let previous = next.position;
    next.position = next.position.add(Vec3::new(
        next.planar_velocity.0 * dt,
        next.vertical_velocity * dt,
        next.planar_velocity.1 * dt,
    ));

    // Keep the feet on top of whatever the step moved through or rests on.
    if next.vertical_velocity <= 0.0 {
        let swept = previous.y - next.position.y;
        let probe_from = Vec3::new(next.position.x, previous.y, next.position.z);
        if let Some(contact) = probe_ground(probe_from, swept.max(0.0), consts, ground) {
            if next.position.y < contact.height {
                next.position.y = contact.height;
            }
        }
    }

    Step {
        state: next,
        events,
    }
}

/// Teleports a controller and freezes it for the archetype's freeze time.
pub fn teleport(state: &mut ControllerState, position: Vec3, yaw: f32, consts: &ControllerConsts) {
    *state = ControllerState::spawned_at(position, yaw);
    state.teleport_freeze = consts.teleport_freeze;
}

fn clamp_unit((x, y): (f32, f32)) -> (f32, f32) {
    let length_sq = x * x + y * y;
    if length_sq > 1.0 {
        let length = length_sq.sqrt();
        (x / length, y / length)
    } else {
        (x, y)
    }
}
