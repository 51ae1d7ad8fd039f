//! Quadrature mouse.
//!
//! Motion reaches the CPU as quadrature transitions: the interrupt lines
//! (SCC DCD pins) flip on each step, and the VIA reads the matching
//! level lines to learn the direction. The machine drains one step per
//! axis at a time and drives the lines.

use cortland_core::chkpt::{CheckpointReader, CheckpointWriter};

/// One quadrature step on one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    /// Interrupt-line level after the step.
    pub irq_level: bool,
    /// Quadrature level the VIA should read for this direction.
    pub quad_level: bool,
}

/// Accumulated host mouse state.
pub struct Mouse {
    dx: i32,
    dy: i32,
    button: bool,
    x_irq: bool,
    y_irq: bool,
}

impl Mouse {
    /// Cold state, or restored from a checkpoint component.
    #[must_use]
    pub fn new(chk: Option<&mut CheckpointReader>) -> Self {
        let mut m = Self { dx: 0, dy: 0, button: false, x_irq: false, y_irq: false };
        if let Some(r) = chk {
            r.enter_component();
            m.dx = r.get_u32() as i32;
            m.dy = r.get_u32() as i32;
            m.button = r.get_u8() != 0;
            m.x_irq = r.get_u8() != 0;
            m.y_irq = r.get_u8() != 0;
            r.exit_component();
        }
        m
    }

    /// Host-side motion event.
    pub fn add_motion(&mut self, dx: i32, dy: i32) {
        self.dx += dx;
        self.dy += dy;
    }

    /// Host-side button event.
    pub fn set_button(&mut self, down: bool) {
        self.button = down;
    }

    /// Button line level (VIA PB3, active low).
    #[must_use]
    pub fn button_line(&self) -> bool {
        !self.button
    }

    /// Drains one X-axis step, if motion is pending.
    pub fn take_x_step(&mut self) -> Option<Step> {
        if self.dx == 0 {
            return None;
        }
        let dir = self.dx > 0;
        self.dx -= if dir { 1 } else { -1 };
        self.x_irq = !self.x_irq;
        // Direction is encoded by whether the quadrature line matches the
        // interrupt line after the transition.
        Some(Step { irq_level: self.x_irq, quad_level: self.x_irq == dir })
    }

    /// Drains one Y-axis step, if motion is pending.
    pub fn take_y_step(&mut self) -> Option<Step> {
        if self.dy == 0 {
            return None;
        }
        let dir = self.dy > 0;
        self.dy -= if dir { 1 } else { -1 };
        self.y_irq = !self.y_irq;
        Some(Step { irq_level: self.y_irq, quad_level: self.y_irq == dir })
    }

    /// Serializes pending motion as one component blob.
    pub fn checkpoint(&self, w: &mut CheckpointWriter) {
        w.component(|w| {
            w.put_u32(self.dx as u32);
            w.put_u32(self.dy as u32);
            w.put_u8(self.button.into());
            w.put_u8(self.x_irq.into());
            w.put_u8(self.y_irq.into());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn motion_drains_one_step_at_a_time() {
        let mut m = Mouse::new(None);
        m.add_motion(2, -1);
        assert!(m.take_x_step().is_some());
        assert!(m.take_x_step().is_some());
        assert!(m.take_x_step().is_none());
        assert!(m.take_y_step().is_some());
        assert!(m.take_y_step().is_none());
    }

    #[test]
    fn direction_encoded_in_quadrature() {
        let mut m = Mouse::new(None);
        m.add_motion(1, 0);
        let right = m.take_x_step().unwrap();
        m.add_motion(-1, 0);
        let left = m.take_x_step().unwrap();
        assert_ne!(
            right.quad_level == right.irq_level,
            left.quad_level == left.irq_level,
            "opposite directions read opposite quadrature"
        );
    }

    #[test]
    fn button_is_active_low() {
        let mut m = Mouse::new(None);
        assert!(m.button_line());
        m.set_button(true);
        assert!(!m.button_line());
    }
}
