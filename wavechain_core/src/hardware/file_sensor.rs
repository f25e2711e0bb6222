/// Sensor port that replays a movement-vector CSV
use super::HardwareActuationPort;
use crate::batch::{read_batch_file, BatchRow};
use crate::error::{WaveError, WaveResult};
use crate::message::SensorVector;
use std::collections::VecDeque;
use std::path::Path;
use tracing::info;

pub struct FileSensorPort {
    rows: VecDeque<BatchRow>,
    scale: bool,
}

impl FileSensorPort {
    /// `scale` maps raw values into the motor range before replay
    pub fn open<P: AsRef<Path>>(path: P, scale: bool) -> WaveResult<Self> {
        Ok(Self::from_rows(read_batch_file(path)?, scale))
    }

    pub fn from_rows(rows: Vec<BatchRow>, scale: bool) -> Self {
        Self {
            rows: rows.into(),
            scale,
        }
    }

    pub fn remaining(&self) -> usize {
        self.rows.len()
    }
}

impl HardwareActuationPort for FileSensorPort {
    fn name(&self) -> &str {
        "file-sensor"
    }

    fn collect(&mut self) -> WaveResult<Option<SensorVector>> {
        let Some(row) = self.rows.pop_front() else {
            return Ok(None);
        };
        info!("Replaying row {} ({} left)", row.index, self.rows.len());
        let vector = if self.scale {
            super::scale_movements(&row.movements)?
        } else {
            SensorVector::new(row.movements)?
        };
        Ok(Some(vector))
    }

    fn drive(&mut self, _vector: &SensorVector) -> WaveResult<()> {
        Err(WaveError::hardware("file sensor has no actuator"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(index: usize, value: f64) -> BatchRow {
        BatchRow {
            index,
            timestamp: None,
            movements: vec![value; 30],
            t_sin: 0.0,
            t_cos: 1.0,
        }
    }

    #[test]
    fn test_replays_in_order_then_ends() {
        let mut port = FileSensorPort::from_rows(vec![row(0, 30.0), row(1, 40.0)], false);
        assert_eq!(port.collect().unwrap().unwrap().values()[0], 30.0);
        assert_eq!(port.collect().unwrap().unwrap().values()[0], 40.0);
        assert!(port.collect().unwrap().is_none());
    }

    #[test]
    fn test_out_of_range_row_is_an_error_without_scaling() {
        let mut port = FileSensorPort::from_rows(vec![row(0, 500.0)], false);
        assert!(port.collect().is_err());

        let mut port = FileSensorPort::from_rows(vec![row(0, 500.0)], true);
        assert_eq!(port.collect().unwrap().unwrap().values()[0], 127.0);
    }

    #[test]
    fn test_drive_unsupported() {
        let mut port = FileSensorPort::from_rows(Vec::new(), false);
        let vector = SensorVector::filled(50.0).unwrap();
        assert!(port.drive(&vector).is_err());
    }
}
