/// Scripted port for dry runs and tests
///
/// Collects replay a fixed script, drives are recorded. A cloneable probe
/// gives access to the recordings after the port has been moved into a
/// state machine.
use super::HardwareActuationPort;
use crate::error::{WaveError, WaveResult};
use crate::message::{SensorVector, TimeEncoding};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Default)]
struct SimState {
    script: VecDeque<SensorVector>,
    drives: Vec<SensorVector>,
    times: Vec<TimeEncoding>,
    fail_drives: bool,
    drive_delay: Duration,
    released: bool,
}

#[derive(Debug, Default)]
pub struct SimulatedPort {
    state: Arc<Mutex<SimState>>,
}

/// Shared view into a [`SimulatedPort`]
#[derive(Debug, Clone)]
pub struct SimulatedPortProbe {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Port whose collects return `script` in order, then `None`
    pub fn with_script(script: Vec<SensorVector>) -> Self {
        let port = Self::default();
        port.state.lock().script = script.into();
        port
    }

    /// Block every drive for `delay`, like a real actuator run
    pub fn with_drive_delay(self, delay: Duration) -> Self {
        self.state.lock().drive_delay = delay;
        self
    }

    pub fn probe(&self) -> SimulatedPortProbe {
        SimulatedPortProbe {
            state: self.state.clone(),
        }
    }
}

impl SimulatedPortProbe {
    pub fn drives(&self) -> Vec<SensorVector> {
        self.state.lock().drives.clone()
    }

    pub fn times(&self) -> Vec<TimeEncoding> {
        self.state.lock().times.clone()
    }

    pub fn fail_drives(&self, fail: bool) {
        self.state.lock().fail_drives = fail;
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }
}

impl HardwareActuationPort for SimulatedPort {
    fn name(&self) -> &str {
        "simulated"
    }

    fn collect(&mut self) -> WaveResult<Option<SensorVector>> {
        Ok(self.state.lock().script.pop_front())
    }

    fn drive(&mut self, vector: &SensorVector) -> WaveResult<()> {
        let delay = {
            let mut state = self.state.lock();
            state.drives.push(vector.clone());
            if state.fail_drives {
                return Err(WaveError::hardware("simulated drive failure"));
            }
            state.drive_delay
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        info!("Simulated drive: {}", vector.log_summary());
        Ok(())
    }

    fn show_time(&mut self, time: &TimeEncoding) -> WaveResult<()> {
        self.state.lock().times.push(*time);
        Ok(())
    }

    fn release(&mut self) -> WaveResult<()> {
        self.state.lock().released = true;
        Ok(())
    }
}
