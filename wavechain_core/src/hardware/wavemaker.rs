/// Wavemaker motor controller over a line-oriented serial link
///
/// The controller firmware takes one motor value per line and may echo a
/// status line back. After a run the motor is parked at the reset value.
use super::HardwareActuationPort;
use crate::error::{WaveError, WaveResult};
use crate::message::SensorVector;
use std::io::{BufRead, BufReader, Read, Write};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct WavemakerConfig {
    /// Delay between consecutive motor values
    pub pacing: Duration,
    /// Value written after every run to park the motor
    pub reset_value: u8,
    /// Read one echo line after each value
    pub read_echo: bool,
}

impl Default for WavemakerConfig {
    fn default() -> Self {
        Self {
            pacing: Duration::from_millis(200),
            reset_value: 127,
            read_echo: true,
        }
    }
}

pub struct WavemakerPort<T: Read + Write + Send> {
    link: BufReader<T>,
    config: WavemakerConfig,
    values_written: u64,
}

impl<T: Read + Write + Send> WavemakerPort<T> {
    pub fn new(link: T, config: WavemakerConfig) -> Self {
        Self {
            link: BufReader::new(link),
            config,
            values_written: 0,
        }
    }

    pub fn values_written(&self) -> u64 {
        self.values_written
    }

    pub fn into_inner(self) -> T {
        self.link.into_inner()
    }

    fn write_value(&mut self, value: u8) -> WaveResult<()> {
        let line = format!("{}\n", value);
        let writer = self.link.get_mut();
        writer
            .write_all(line.as_bytes())
            .and_then(|_| writer.flush())
            .map_err(|e| WaveError::hardware(format!("wavemaker write failed: {}", e)))?;
        self.values_written += 1;
        Ok(())
    }

    fn read_echo(&mut self) {
        let mut echo = String::new();
        match self.link.read_line(&mut echo) {
            Ok(0) => {}
            Ok(_) => debug!("Wavemaker echo: {}", echo.trim()),
            // Echo is informational; a silent controller is fine
            Err(e) => debug!("No wavemaker echo: {}", e),
        }
    }
}

#[cfg(feature = "serial-hardware")]
impl WavemakerPort<Box<dyn serialport::SerialPort>> {
    /// Open the controller on a serial device, e.g. `/dev/ttyACM0`
    pub fn open_serial(path: &str, baud_rate: u32, config: WavemakerConfig) -> WaveResult<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(Duration::from_secs(1))
            .open()
            .map_err(|e| WaveError::hardware(format!("cannot open {}: {}", path, e)))?;
        info!("Wavemaker connected on {} at {} baud", path, baud_rate);
        Ok(Self::new(port, config))
    }
}

impl<T: Read + Write + Send> HardwareActuationPort for WavemakerPort<T> {
    fn name(&self) -> &str {
        "wavemaker"
    }

    fn collect(&mut self) -> WaveResult<Option<SensorVector>> {
        Err(WaveError::hardware("wavemaker has no sensor input"))
    }

    fn drive(&mut self, vector: &SensorVector) -> WaveResult<()> {
        info!("Driving wavemaker with {}", vector.log_summary());

        let mut result = Ok(());
        for value in vector.iter() {
            // Values are validated to [20, 127], so this never truncates
            if let Err(e) = self.write_value(value.round() as u8) {
                result = Err(e);
                break;
            }
            if self.config.read_echo {
                self.read_echo();
            }
            if !self.config.pacing.is_zero() {
                std::thread::sleep(self.config.pacing);
            }
        }

        if let Err(e) = self.write_value(self.config.reset_value) {
            warn!("Failed to park wavemaker motor: {}", e);
        }

        result
    }

    fn release(&mut self) -> WaveResult<()> {
        self.write_value(self.config.reset_value)
    }
}
