//! Push-button input.
//!
//! Buttons are wired active-low against a pull-up: idle reads high, a press
//! pulls the pin low. [`ButtonEdge`] reports each press once, on the
//! high-to-low transition, when polled from a module's tick.

use embedded_hal::digital::InputPin;

/// Falling-edge detector over one input pin.
pub struct ButtonEdge<P> {
    pin: P,
    was_high: bool,
}

impl<P: InputPin> ButtonEdge<P> {
    /// Starts out idle, so a button already held at startup does not count as
    /// a press.
    pub fn new(pin: P) -> Self {
        Self {
            pin,
            was_high: true,
        }
    }

    /// Samples the pin. `Ok(true)` exactly once per press.
    pub fn pressed(&mut self) -> Result<bool, P::Error> {
        let high = self.pin.is_high()?;
        let edge = self.was_high && !high;
        self.was_high = high;
        Ok(edge)
    }

    pub fn release(self) -> P {
        self.pin
    }
}
