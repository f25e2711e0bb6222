/// Movement-vector CSV files
///
/// Reading: one row per vector, 30 ROI columns in either the `roi_1_m{i}`
/// or the `ROI_1_{i+1}` naming, plus `t_sin`, `t_cos` and an optional
/// `timestamp`. Writing: the consumer's training file layout,
/// `timestamp,pot_value_0..pot_value_29,t_sin,t_cos`.
use crate::error::{WaveError, WaveResult};
use crate::hardware::scale_movements;
use crate::message::{Envelope, MovementData, SensorVector, TimeEncoding, Timestamp, SENSOR_VECTOR_LEN};
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One movement row read from a batch file
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRow {
    /// Zero-based data row number
    pub index: usize,
    pub timestamp: Option<String>,
    pub movements: Vec<f64>,
    pub t_sin: f64,
    pub t_cos: f64,
}

impl BatchRow {
    /// Build the `movement_data` envelope for this row.
    ///
    /// With `scale` the raw values are mapped into the motor range first;
    /// without it they must already be in range.
    pub fn to_envelope(&self, scale: bool) -> WaveResult<Envelope> {
        let vector = if scale {
            scale_movements(&self.movements)?
        } else {
            SensorVector::new(self.movements.clone())?
        };
        let time = TimeEncoding::new(self.t_sin, self.t_cos)?;

        let envelope = Envelope::movement(vector, time);
        Ok(match &self.timestamp {
            Some(ts) => envelope.with_timestamp(Timestamp::Text(ts.clone())),
            None => envelope,
        })
    }
}

fn roi_columns(headers: &csv::StringRecord) -> Vec<String> {
    if headers.iter().any(|h| h == "roi_1_m0") {
        (0..SENSOR_VECTOR_LEN).map(|i| format!("roi_1_m{}", i)).collect()
    } else {
        (0..SENSOR_VECTOR_LEN).map(|i| format!("ROI_1_{}", i + 1)).collect()
    }
}

fn column(headers: &csv::StringRecord, name: &str) -> Option<usize> {
    headers.iter().position(|h| h == name)
}

fn parse_field(record: &csv::StringRecord, idx: usize, name: &str, row: usize) -> WaveResult<f64> {
    let raw = record.get(idx).unwrap_or("").trim();
    raw.parse::<f64>().map_err(|_| {
        WaveError::validation(format!("row {}: column {} is not a number: '{}'", row, name, raw))
    })
}

/// Parse every row of a movement-vector CSV
pub fn read_rows<R: Read>(reader: R) -> WaveResult<Vec<BatchRow>> {
    let mut reader = csv::Reader::from_reader(reader);
    let headers = reader.headers()?.clone();

    let names = roi_columns(&headers);
    let mut missing = Vec::new();
    let mut roi_idx = Vec::with_capacity(SENSOR_VECTOR_LEN);
    for name in &names {
        match column(&headers, name) {
            Some(idx) => roi_idx.push(idx),
            None => missing.push(name.clone()),
        }
    }
    let sin_idx = column(&headers, "t_sin");
    let cos_idx = column(&headers, "t_cos");
    if sin_idx.is_none() {
        missing.push("t_sin".to_string());
    }
    if cos_idx.is_none() {
        missing.push("t_cos".to_string());
    }
    let (sin_idx, cos_idx) = match (sin_idx, cos_idx) {
        (Some(sin_idx), Some(cos_idx)) if missing.is_empty() => (sin_idx, cos_idx),
        _ => {
            return Err(WaveError::validation(format!(
                "CSV file missing required columns: {}",
                missing.join(", ")
            )))
        }
    };
    let ts_idx = column(&headers, "timestamp");

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record?;
        let movements = roi_idx
            .iter()
            .zip(&names)
            .map(|(&idx, name)| parse_field(&record, idx, name, index))
            .collect::<WaveResult<Vec<f64>>>()?;

        rows.push(BatchRow {
            index,
            timestamp: ts_idx
                .and_then(|idx| record.get(idx))
                .map(str::trim)
                .filter(|ts| !ts.is_empty())
                .map(str::to_string),
            movements,
            t_sin: parse_field(&record, sin_idx, "t_sin", index)?,
            t_cos: parse_field(&record, cos_idx, "t_cos", index)?,
        });
    }

    debug!("Parsed {} movement rows", rows.len());
    Ok(rows)
}

pub fn read_batch_file<P: AsRef<Path>>(path: P) -> WaveResult<Vec<BatchRow>> {
    let path = path.as_ref();
    let file = File::open(path)
        .map_err(|e| WaveError::config(format!("Failed to open {}: {}", path.display(), e)))?;
    let rows = read_rows(file)?;
    info!("Found {} movement vectors in {}", rows.len(), path.display());
    Ok(rows)
}

/// Destination for rows accepted by a batch consumer
pub trait RowSink: Send {
    fn append(&mut self, timestamp: &Timestamp, movement: &MovementData) -> WaveResult<()>;
}

/// Header of the consumer's training file
pub fn training_header() -> Vec<String> {
    let mut header = Vec::with_capacity(SENSOR_VECTOR_LEN + 3);
    header.push("timestamp".to_string());
    header.extend((0..SENSOR_VECTOR_LEN).map(|i| format!("pot_value_{}", i)));
    header.push("t_sin".to_string());
    header.push("t_cos".to_string());
    header
}

/// Appends accepted rows to a CSV file, writing the header on first use
pub struct CsvRowSink {
    path: PathBuf,
    writer: csv::Writer<File>,
    rows: usize,
}

impl CsvRowSink {
    pub fn open<P: AsRef<Path>>(path: P) -> WaveResult<Self> {
        let path = path.as_ref().to_path_buf();
        let fresh = std::fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if fresh {
            writer.write_record(training_header())?;
            writer.flush()?;
        }

        info!("Writing accepted rows to {}", path.display());
        Ok(Self {
            path,
            writer,
            rows: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows appended through this sink
    pub fn rows(&self) -> usize {
        self.rows
    }
}

impl RowSink for CsvRowSink {
    fn append(&mut self, timestamp: &Timestamp, movement: &MovementData) -> WaveResult<()> {
        let mut record = Vec::with_capacity(SENSOR_VECTOR_LEN + 3);
        record.push(timestamp.to_string());
        record.extend(movement.vector.iter().map(|v| v.to_string()));
        record.push(movement.time.sin().to_string());
        record.push(movement.time.cos().to_string());

        self.writer.write_record(&record)?;
        self.writer.flush()?;
        self.rows += 1;
        Ok(())
    }
}
