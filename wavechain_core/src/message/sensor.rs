use crate::error::{WaveError, WaveResult};
use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;

/// Number of readings carried by every sensor vector
pub const SENSOR_VECTOR_LEN: usize = 30;

/// Lowest value accepted in a sensor vector (motor dead zone)
pub const SENSOR_MIN: f64 = 20.0;

/// Highest value accepted in a sensor vector (full motor stroke)
pub const SENSOR_MAX: f64 = 127.0;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Fixed-length measurement vector forwarded along the chain.
///
/// The core only validates: values outside `[SENSOR_MIN, SENSOR_MAX]` are
/// rejected, never clamped. Scaling raw measurements into range is the job
/// of the actuation adapters (see `hardware::scale_movements`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct SensorVector([f64; SENSOR_VECTOR_LEN]);

impl SensorVector {
    /// Build a vector from exactly 30 in-range values
    pub fn new(values: Vec<f64>) -> WaveResult<Self> {
        if values.len() != SENSOR_VECTOR_LEN {
            return Err(WaveError::validation(format!(
                "sensor vector must hold {} values, got {}",
                SENSOR_VECTOR_LEN,
                values.len()
            )));
        }

        let mut readings = [0.0; SENSOR_VECTOR_LEN];
        for (idx, value) in values.into_iter().enumerate() {
            if !value.is_finite() || !(SENSOR_MIN..=SENSOR_MAX).contains(&value) {
                return Err(WaveError::validation(format!(
                    "value {} at index {} outside [{}, {}]",
                    value, idx, SENSOR_MIN, SENSOR_MAX
                )));
            }
            readings[idx] = value;
        }

        Ok(Self(readings))
    }

    /// Vector with every slot set to `value`
    pub fn filled(value: f64) -> WaveResult<Self> {
        Self::new(vec![value; SENSOR_VECTOR_LEN])
    }

    pub fn values(&self) -> &[f64] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        SENSOR_VECTOR_LEN
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn mean(&self) -> f64 {
        self.0.iter().sum::<f64>() / SENSOR_VECTOR_LEN as f64
    }

    /// Compact form for log lines: first few values plus the mean
    pub fn log_summary(&self) -> String {
        format!(
            "[{:.0}, {:.0}, {:.0}, .. {:.0}] mean={:.1}",
            self.0[0],
            self.0[1],
            self.0[2],
            self.0[SENSOR_VECTOR_LEN - 1],
            self.mean()
        )
    }
}

impl TryFrom<Vec<f64>> for SensorVector {
    type Error = WaveError;

    fn try_from(values: Vec<f64>) -> WaveResult<Self> {
        Self::new(values)
    }
}

impl From<SensorVector> for Vec<f64> {
    fn from(vector: SensorVector) -> Self {
        vector.0.to_vec()
    }
}

/// Cyclic time-of-day encoding carried next to every measurement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeEncoding {
    sin: f64,
    cos: f64,
}

impl TimeEncoding {
    pub fn new(sin: f64, cos: f64) -> WaveResult<Self> {
        for (label, value) in [("sin", sin), ("cos", cos)] {
            if !value.is_finite() || !(-1.0..=1.0).contains(&value) {
                return Err(WaveError::validation(format!(
                    "time encoding {} component {} outside [-1, 1]",
                    label, value
                )));
            }
        }
        if sin == 0.0 && cos == 0.0 {
            return Err(WaveError::validation(
                "time encoding cannot have both components at zero",
            ));
        }
        Ok(Self { sin, cos })
    }

    /// Encode a wall-clock time as a point on the unit circle (midnight = (0, 1))
    pub fn from_time(time: NaiveTime) -> Self {
        let seconds = time.num_seconds_from_midnight() as f64
            + time.nanosecond() as f64 / 1_000_000_000.0;
        let phase = 2.0 * PI * seconds / SECONDS_PER_DAY;
        Self {
            sin: phase.sin(),
            cos: phase.cos(),
        }
    }

    /// Encoding of the current local time of day
    pub fn now() -> Self {
        Self::from_time(chrono::Local::now().time())
    }

    pub fn sin(&self) -> f64 {
        self.sin
    }

    pub fn cos(&self) -> f64 {
        self.cos
    }

    /// Angle for the clock servo, scaled from ±180° to ±150°
    pub fn clock_angle(&self) -> f64 {
        self.sin.atan2(self.cos).to_degrees() / 180.0 * 150.0
    }
}

impl fmt::Display for TimeEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(sin={:.4}, cos={:.4})", self.sin, self.cos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_requires_exact_length() {
        assert!(SensorVector::new(vec![100.0; 29]).is_err());
        assert!(SensorVector::new(vec![100.0; 31]).is_err());
        assert!(SensorVector::new(vec![100.0; 30]).is_ok());
    }

    #[test]
    fn test_vector_rejects_out_of_range_without_clamping() {
        let mut values = vec![50.0; 30];
        values[7] = 128.0;
        let err = SensorVector::new(values).unwrap_err();
        assert!(err.to_string().contains("index 7"));

        let mut values = vec![50.0; 30];
        values[0] = 19.5;
        assert!(SensorVector::new(values).is_err());

        let mut values = vec![50.0; 30];
        values[3] = f64::NAN;
        assert!(SensorVector::new(values).is_err());
    }

    #[test]
    fn test_vector_bounds_are_inclusive() {
        let mut values = vec![SENSOR_MIN; 15];
        values.extend(vec![SENSOR_MAX; 15]);
        let vector = SensorVector::new(values).unwrap();
        assert_eq!(vector.values()[0], 20.0);
        assert_eq!(vector.values()[29], 127.0);
    }

    #[test]
    fn test_vector_deserialize_validates() {
        let bad: Result<SensorVector, _> = serde_json::from_str("[100, 100]");
        assert!(bad.is_err());

        let good: SensorVector = serde_json::from_str(&format!("[{}]", vec!["100"; 30].join(","))).unwrap();
        assert_eq!(good.mean(), 100.0);
    }

    #[test]
    fn test_time_encoding_validation() {
        assert!(TimeEncoding::new(0.0, 0.0).is_err());
        assert!(TimeEncoding::new(1.2, 0.0).is_err());
        assert!(TimeEncoding::new(0.0, 1.0).is_ok());
    }

    #[test]
    fn test_time_encoding_is_cyclic() {
        let midnight = TimeEncoding::from_time(NaiveTime::from_hms_opt(0, 0, 0).unwrap());
        assert!(midnight.sin().abs() < 1e-9);
        assert!((midnight.cos() - 1.0).abs() < 1e-9);

        let six_am = TimeEncoding::from_time(NaiveTime::from_hms_opt(6, 0, 0).unwrap());
        assert!((six_am.sin() - 1.0).abs() < 1e-9);
        assert!(six_am.cos().abs() < 1e-9);
    }

    #[test]
    fn test_clock_angle() {
        let midnight = TimeEncoding::new(0.0, 1.0).unwrap();
        assert_eq!(midnight.clock_angle(), 0.0);

        let six_am = TimeEncoding::new(1.0, 0.0).unwrap();
        assert!((six_am.clock_angle() - 75.0).abs() < 1e-9);
    }
}
