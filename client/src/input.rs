//! Scripted input sources for the headless client

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{ActionFlags, CommandInput, Tick};
use std::f32::consts::PI;

/// Produces one command per predicted tick.
pub trait InputSource {
    fn sample(&mut self, tick: Tick) -> CommandInput;
}

/// Random-walk bot: holds a heading for a while, strafes, jumps now and
/// then and fires in bursts.
pub struct BotInput {
    rng: StdRng,
    current: CommandInput,
    hold_ticks: u32,
    burst_ticks: u32,
}

impl BotInput {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            current: CommandInput::default(),
            hold_ticks: 0,
            burst_ticks: 0,
        }
    }

    fn pick_heading(&mut self) {
        self.current.movement = (self.rng.gen_range(-1.0..=1.0), self.rng.gen_range(-0.2..=1.0));
        self.current.yaw = self.rng.gen_range(-PI..PI);
        self.current.pitch = self.rng.gen_range(-0.2..0.2);
        self.hold_ticks = self.rng.gen_range(20..120);
    }
}

impl InputSource for BotInput {
    fn sample(&mut self, _tick: Tick) -> CommandInput {
        if self.hold_ticks == 0 {
            self.pick_heading();
        }
        self.hold_ticks -= 1;

        if self.burst_ticks == 0 && self.rng.gen_bool(0.02) {
            self.burst_ticks = self.rng.gen_range(5..30);
        }

        let mut actions = ActionFlags::NONE;
        if self.rng.gen_bool(0.01) {
            actions = actions.with(ActionFlags::JUMP);
        }
        if self.burst_ticks > 0 {
            self.burst_ticks -= 1;
            actions = actions.with(ActionFlags::SHOOT);
        } else if self.rng.gen_bool(0.005) {
            actions = actions.with(ActionFlags::RELOAD);
        }

        CommandInput {
            actions,
            ..self.current
        }
    }
}

/// Replays a fixed list of commands, then repeats the last one.
pub struct ScriptedInput {
    commands: Vec<CommandInput>,
    position: usize,
}

impl ScriptedInput {
    pub fn new(commands: Vec<CommandInput>) -> Self {
        Self { commands, position: 0 }
    }
}

impl InputSource for ScriptedInput {
    fn sample(&mut self, _tick: Tick) -> CommandInput {
        let input = self
            .commands
            .get(self.position)
            .or_else(|| self.commands.last())
            .copied()
            .unwrap_or_default();
        self.position += 1;
        input
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bot_is_reproducible() {
        let mut a = BotInput::new(7);
        let mut b = BotInput::new(7);
        for tick in 0..500 {
            assert_eq!(a.sample(Tick(tick)), b.sample(Tick(tick)));
        }
    }

    #[test]
    fn test_bot_input_in_range() {
        let mut bot = BotInput::new(42);
        let mut shots = 0;
        for tick in 0..2000 {
            let input = bot.sample(Tick(tick));
            assert!(input.movement.0.abs() <= 1.0);
            assert!(input.movement.1.abs() <= 1.0);
            if input.shoot() {
                shots += 1;
            }
        }
        assert!(shots > 0);
    }

    #[test]
    fn test_scripted_repeats_last() {
        let jump = CommandInput {
            actions: ActionFlags::JUMP,
            ..Default::default()
        };
        let mut script = ScriptedInput::new(vec![CommandInput::default(), jump]);
        assert_eq!(script.sample(Tick(0)), CommandInput::default());
        assert_eq!(script.sample(Tick(1)), jump);
        assert_eq!(script.sample(Tick(2)), jump);

        let mut empty = ScriptedInput::new(Vec::new());
        assert_eq!(empty.sample(Tick(0)), CommandInput::default());
    }
}
