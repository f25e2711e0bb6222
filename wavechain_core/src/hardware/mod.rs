//! # Actuation ports
//!
//! The state machine talks to sensors and actuators only through
//! [`HardwareActuationPort`]. Adapters in this module cover the wavemaker
//! motor controller, the servo cube display, CSV replay and a scripted
//! simulation used by tests and dry runs.
//!
//! Every call is synchronous: a drive blocks the node loop until it returns.

pub mod file_sensor;
pub mod servo;
pub mod sim;
pub mod wavemaker;

pub use file_sensor::FileSensorPort;
pub use servo::{ServoArrayConfig, ServoArrayPort};
pub use sim::{SimulatedPort, SimulatedPortProbe};
pub use wavemaker::{WavemakerConfig, WavemakerPort};

use crate::error::{WaveError, WaveResult};
use crate::message::{SensorVector, TimeEncoding, SENSOR_MAX, SENSOR_MIN};

/// Boundary between the node state machine and physical devices
pub trait HardwareActuationPort: Send {
    /// Short label for log lines
    fn name(&self) -> &str;

    /// Take one measurement; `Ok(None)` asks the node loop to stop
    fn collect(&mut self) -> WaveResult<Option<SensorVector>>;

    /// Play a vector on the actuator; returns once the run has finished
    fn drive(&mut self, vector: &SensorVector) -> WaveResult<()>;

    /// Display the time of day carried with a vector, if the device can
    fn show_time(&mut self, _time: &TimeEncoding) -> WaveResult<()> {
        Ok(())
    }

    /// Put the device in a safe state and close it
    fn release(&mut self) -> WaveResult<()> {
        Ok(())
    }
}

impl<P: HardwareActuationPort + ?Sized> HardwareActuationPort for Box<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn collect(&mut self) -> WaveResult<Option<SensorVector>> {
        (**self).collect()
    }

    fn drive(&mut self, vector: &SensorVector) -> WaveResult<()> {
        (**self).drive(vector)
    }

    fn show_time(&mut self, time: &TimeEncoding) -> WaveResult<()> {
        (**self).show_time(time)
    }

    fn release(&mut self) -> WaveResult<()> {
        (**self).release()
    }
}

/// Sensor and actuator living on separate devices, seen as one port
pub struct PairedPort<S, A> {
    pub sensor: S,
    pub actuator: A,
    name: String,
}

impl<S: HardwareActuationPort, A: HardwareActuationPort> PairedPort<S, A> {
    pub fn new(sensor: S, actuator: A) -> Self {
        let name = format!("{}+{}", sensor.name(), actuator.name());
        Self {
            sensor,
            actuator,
            name,
        }
    }
}

impl<S: HardwareActuationPort, A: HardwareActuationPort> HardwareActuationPort for PairedPort<S, A> {
    fn name(&self) -> &str {
        &self.name
    }

    fn collect(&mut self) -> WaveResult<Option<SensorVector>> {
        self.sensor.collect()
    }

    fn drive(&mut self, vector: &SensorVector) -> WaveResult<()> {
        self.actuator.drive(vector)
    }

    fn show_time(&mut self, time: &TimeEncoding) -> WaveResult<()> {
        self.actuator.show_time(time)
    }

    fn release(&mut self) -> WaveResult<()> {
        let sensor = self.sensor.release();
        self.actuator.release()?;
        sensor
    }
}

/// Scale a raw movement series into the motor range.
///
/// Each value becomes `trunc(m * 127 / max)` clamped into `[20, 127]`, where
/// `max` is the largest value of the series. A series whose maximum is not
/// positive maps entirely to the dead-zone floor.
pub fn scale_movements(movements: &[f64]) -> WaveResult<SensorVector> {
    if let Some(bad) = movements.iter().find(|m| !m.is_finite()) {
        return Err(WaveError::validation(format!(
            "movement value {} is not finite",
            bad
        )));
    }

    let max = movements.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let scaled = movements
        .iter()
        .map(|&m| {
            if max > 0.0 {
                (m * SENSOR_MAX / max).trunc().clamp(SENSOR_MIN, SENSOR_MAX)
            } else {
                SENSOR_MIN
            }
        })
        .collect();

    SensorVector::new(scaled)
}
