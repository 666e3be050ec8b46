//! Local input sampling.
//!
//! Whatever drives the client (keyboard polling, a scripted walk, a bot)
//! sets the held directions; the simulation samples one snapshot per tick
//! so a key flicker between ticks can't produce half-applied movement.

use shared::InputState;

#[derive(Debug, Default)]
pub struct InputManager {
    held: InputState,
}

impl InputManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_held(&mut self, held: InputState) {
        self.held = held;
    }

    pub fn set_up(&mut self, pressed: bool) {
        self.held.up = pressed;
    }

    pub fn set_down(&mut self, pressed: bool) {
        self.held.down = pressed;
    }

    pub fn set_left(&mut self, pressed: bool) {
        self.held.left = pressed;
    }

    pub fn set_right(&mut self, pressed: bool) {
        self.held.right = pressed;
    }

    /// The snapshot applied to the current tick.
    pub fn sample(&self) -> InputState {
        self.held
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_reflects_held_keys() {
        let mut input = InputManager::new();
        assert!(input.sample().is_idle());

        input.set_right(true);
        input.set_up(true);
        let snapshot = input.sample();
        assert!(snapshot.right && snapshot.up);
        assert!(!snapshot.left && !snapshot.down);

        input.set_right(false);
        assert!(!input.sample().right);
        // The earlier snapshot is a copy, unaffected by later changes.
        assert!(snapshot.right);
    }
}
