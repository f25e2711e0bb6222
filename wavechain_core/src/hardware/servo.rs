/// Servo cube display driven by a serial servo board
///
/// The 30 values are sorted into five equal-width bins over [20, 127]; each
/// non-empty bin moves one cube servo to a pulse proportional to its mean.
/// An optional clock servo shows the time of day.
use super::HardwareActuationPort;
use crate::error::{WaveError, WaveResult};
use crate::message::{SensorVector, TimeEncoding, SENSOR_MAX, SENSOR_MIN};
use std::io::Write;
use tracing::{debug, info};

/// Number of histogram bins, one cube servo each
pub const BIN_COUNT: usize = 5;

pub const PULSE_MIN: u32 = 500;
pub const PULSE_MAX: u32 = 2500;
pub const PULSE_CENTER: u32 = 1500;

#[derive(Debug, Clone)]
pub struct ServoArrayConfig {
    /// Servo id driven by each bin, lowest bin first
    pub bin_servos: [u8; BIN_COUNT],
    /// Servo showing the time of day, if fitted
    pub clock_servo: Option<u8>,
    /// Travel time sent with every command
    pub move_time_ms: u32,
}

impl Default for ServoArrayConfig {
    fn default() -> Self {
        Self {
            bin_servos: [1, 2, 3, 4, 5],
            clock_servo: Some(6),
            move_time_ms: 1000,
        }
    }
}

/// Bin index for a value; the top edge belongs to the last bin
pub fn bin_index(value: f64) -> usize {
    let width = (SENSOR_MAX - SENSOR_MIN) / BIN_COUNT as f64;
    let idx = ((value - SENSOR_MIN) / width).floor();
    (idx.max(0.0) as usize).min(BIN_COUNT - 1)
}

/// Mean of the values in each bin, `None` for empty bins
pub fn bin_means(vector: &SensorVector) -> [Option<f64>; BIN_COUNT] {
    let mut sums = [0.0; BIN_COUNT];
    let mut counts = [0usize; BIN_COUNT];
    for value in vector.iter() {
        let idx = bin_index(value);
        sums[idx] += value;
        counts[idx] += 1;
    }

    let mut means = [None; BIN_COUNT];
    for idx in 0..BIN_COUNT {
        if counts[idx] > 0 {
            means[idx] = Some(sums[idx] / counts[idx] as f64);
        }
    }
    means
}

/// Map a bin mean in [20, 127] onto the pulse range [500, 2500]
pub fn pulse_for_mean(mean: f64) -> u32 {
    let span = (PULSE_MAX - PULSE_MIN) as f64;
    let pulse = (mean - SENSOR_MIN) / (SENSOR_MAX - SENSOR_MIN) * span + PULSE_MIN as f64;
    (pulse as u32).clamp(PULSE_MIN, PULSE_MAX)
}

/// Map a clock angle in [-150, 150] degrees onto the pulse range
pub fn pulse_for_angle(angle: f64) -> u32 {
    let half_span = ((PULSE_MAX - PULSE_MIN) / 2) as f64;
    let pulse = PULSE_CENTER as f64 + angle / 150.0 * half_span;
    (pulse.round() as u32).clamp(PULSE_MIN, PULSE_MAX)
}

pub struct ServoArrayPort<T: Write + Send> {
    link: T,
    config: ServoArrayConfig,
    positions: [u32; BIN_COUNT],
}

impl<T: Write + Send> ServoArrayPort<T> {
    pub fn new(link: T, config: ServoArrayConfig) -> Self {
        Self {
            link,
            config,
            positions: [PULSE_CENTER; BIN_COUNT],
        }
    }

    /// Last commanded pulse of each cube servo
    pub fn positions(&self) -> [u32; BIN_COUNT] {
        self.positions
    }

    pub fn into_inner(self) -> T {
        self.link
    }

    fn command(&mut self, servo: u8, pulse: u32) -> WaveResult<()> {
        let line = format!("#{}P{}T{}\r\n", servo, pulse, self.config.move_time_ms);
        debug!("Servo command {}", line.trim_end());
        self.link
            .write_all(line.as_bytes())
            .and_then(|_| self.link.flush())
            .map_err(|e| WaveError::hardware(format!("servo {} write failed: {}", servo, e)))
    }

    fn center_all(&mut self) -> WaveResult<()> {
        for idx in 0..BIN_COUNT {
            self.command(self.config.bin_servos[idx], PULSE_CENTER)?;
            self.positions[idx] = PULSE_CENTER;
        }
        if let Some(clock) = self.config.clock_servo {
            self.command(clock, PULSE_CENTER)?;
        }
        Ok(())
    }
}

#[cfg(feature = "serial-hardware")]
impl ServoArrayPort<Box<dyn serialport::SerialPort>> {
    pub fn open_serial(path: &str, baud_rate: u32, config: ServoArrayConfig) -> WaveResult<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(std::time::Duration::from_secs(1))
            .open()
            .map_err(|e| WaveError::hardware(format!("cannot open {}: {}", path, e)))?;
        info!("Servo board connected on {} at {} baud", path, baud_rate);
        Ok(Self::new(port, config))
    }
}

impl<T: Write + Send> HardwareActuationPort for ServoArrayPort<T> {
    fn name(&self) -> &str {
        "servo-array"
    }

    fn collect(&mut self) -> WaveResult<Option<SensorVector>> {
        Err(WaveError::hardware("servo array has no sensor input"))
    }

    fn drive(&mut self, vector: &SensorVector) -> WaveResult<()> {
        let means = bin_means(vector);
        for (idx, mean) in means.iter().enumerate() {
            let Some(mean) = mean else { continue };
            let pulse = pulse_for_mean(*mean);
            self.command(self.config.bin_servos[idx], pulse)?;
            self.positions[idx] = pulse;
        }
        info!("Servo cubes at {:?}", self.positions);
        Ok(())
    }

    fn show_time(&mut self, time: &TimeEncoding) -> WaveResult<()> {
        match self.config.clock_servo {
            Some(clock) => self.command(clock, pulse_for_angle(time.clock_angle())),
            None => Ok(()),
        }
    }

    fn release(&mut self) -> WaveResult<()> {
        self.center_all()
    }
}
