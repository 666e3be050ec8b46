//! Replicated entity components and the deterministic movement step.

use serde::{Deserialize, Serialize};

use crate::map;

/// Units per second an entity moves while an input is held.
pub const MOVE_VELOCITY: f32 = 300.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Movement {
    pub vel_x: f32,
    pub vel_y: f32,
    pub max_vel_x: f32,
    pub max_vel_y: f32,
}

impl Default for Movement {
    fn default() -> Self {
        Self {
            vel_x: 0.0,
            vel_y: 0.0,
            max_vel_x: MOVE_VELOCITY,
            max_vel_y: MOVE_VELOCITY,
        }
    }
}

/// Held directional inputs. These are sampled states, not edges; an entity
/// keeps moving as long as the flag stays set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InputState {
    pub up: bool,
    pub down: bool,
    pub left: bool,
    pub right: bool,
}

impl InputState {
    pub fn is_idle(&self) -> bool {
        !(self.up || self.down || self.left || self.right)
    }
}

/// Advances one entity by one fixed timestep.
///
/// This must be bit-identical between server authority and client
/// prediction, which is why it lives here and why `dt` is always the fixed
/// tick timestep. Up/down and left/right conflicts favor up and right.
pub fn move_entity(position: &mut Position, movement: &mut Movement, input: &InputState, dt: f32) {
    if input.up {
        movement.vel_y = -movement.max_vel_y;
    } else if input.down {
        movement.vel_y = movement.max_vel_y;
    } else {
        movement.vel_y = 0.0;
    }

    if input.right {
        movement.vel_x = movement.max_vel_x;
    } else if input.left {
        movement.vel_x = -movement.max_vel_x;
    } else {
        movement.vel_x = 0.0;
    }

    position.x += movement.vel_x * dt;
    position.y += movement.vel_y * dt;

    position.x = position.x.clamp(0.0, map::WORLD_WIDTH_UNITS);
    position.y = position.y.clamp(0.0, map::WORLD_HEIGHT_UNITS);
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    const DT: f32 = 1.0 / 30.0;

    #[test]
    fn test_idle_input_stops_entity() {
        let mut position = Position { x: 100.0, y: 100.0 };
        let mut movement = Movement {
            vel_x: 50.0,
            vel_y: -50.0,
            ..Default::default()
        };

        move_entity(&mut position, &mut movement, &InputState::default(), DT);

        assert_eq!(movement.vel_x, 0.0);
        assert_eq!(movement.vel_y, 0.0);
        assert_approx_eq!(position.x, 100.0);
        assert_approx_eq!(position.y, 100.0);
    }

    #[test]
    fn test_held_input_moves_entity() {
        let mut position = Position { x: 100.0, y: 100.0 };
        let mut movement = Movement::default();
        let input = InputState {
            right: true,
            down: true,
            ..Default::default()
        };

        move_entity(&mut position, &mut movement, &input, DT);

        assert_approx_eq!(position.x, 100.0 + MOVE_VELOCITY * DT);
        assert_approx_eq!(position.y, 100.0 + MOVE_VELOCITY * DT);
    }

    #[test]
    fn test_conflicting_inputs_favor_up_and_right() {
        let mut position = Position { x: 100.0, y: 100.0 };
        let mut movement = Movement::default();
        let input = InputState {
            up: true,
            down: true,
            left: true,
            right: true,
        };

        move_entity(&mut position, &mut movement, &input, DT);

        assert!(movement.vel_y < 0.0);
        assert!(movement.vel_x > 0.0);
    }

    #[test]
    fn test_movement_clamps_to_world_bounds() {
        let mut position = Position { x: 0.5, y: 0.5 };
        let mut movement = Movement::default();
        let input = InputState {
            up: true,
            left: true,
            ..Default::default()
        };

        for _ in 0..10 {
            move_entity(&mut position, &mut movement, &input, DT);
        }

        assert_eq!(position.x, 0.0);
        assert_eq!(position.y, 0.0);
    }

    #[test]
    fn test_movement_is_deterministic() {
        let inputs = [
            InputState {
                right: true,
                ..Default::default()
            },
            InputState {
                right: true,
                up: true,
                ..Default::default()
            },
            InputState::default(),
            InputState {
                left: true,
                ..Default::default()
            },
        ];

        let run = || {
            let mut position = Position { x: 64.0, y: 64.0 };
            let mut movement = Movement::default();
            for input in &inputs {
                move_entity(&mut position, &mut movement, input, DT);
            }
            (position, movement)
        };

        let (pos_a, mov_a) = run();
        let (pos_b, mov_b) = run();

        assert_eq!(pos_a, pos_b);
        assert_eq!(mov_a, mov_b);
    }
}
