use std::sync::{Mutex, PoisonError};

use log::info;

use crate::error::ActuatorError;

/// Binary output driven by the actuator, e.g. a GPIO in push-pull mode.
pub trait OutputPin {
    fn set_output(&mut self, level: bool) -> Result<(), ActuatorError>;
}

impl<P: OutputPin + ?Sized> OutputPin for Box<P> {
    fn set_output(&mut self, level: bool) -> Result<(), ActuatorError> {
        (**self).set_output(level)
    }
}

struct Output<P> {
    pin: P,
    level: bool,
}

/// LED control shared across request handlers. Holds only the current level.
pub struct Actuator<P> {
    output: Mutex<Output<P>>,
}

impl<P: OutputPin> Actuator<P> {
    /// Drives the pin low so the stored level matches the hardware.
    pub fn new(mut pin: P) -> Result<Self, ActuatorError> {
        pin.set_output(false)?;
        Ok(Self {
            output: Mutex::new(Output { pin, level: false }),
        })
    }

    /// Applies `level`. Re-applying the current level is a no-op.
    pub fn apply(&self, level: bool) -> Result<(), ActuatorError> {
        let mut output = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        if output.level == level {
            return Ok(());
        }

        output.pin.set_output(level)?;
        output.level = level;
        info!("led {}", if level { "on" } else { "off" });
        Ok(())
    }

    pub fn level(&self) -> bool {
        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .level
    }
}
