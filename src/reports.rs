use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use log::info;
use serde::Serialize;

use crate::config::RunConfig;
use crate::train::TrainingHistory;

/// One output row: `seqID <tab> barcodeID <tab> prediction`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PredictionRow {
    pub seq_id: String,
    pub barcode_id: String,
    pub prediction: String,
}

/// Prediction counts per barcode.
pub type BarcodeCounts = BTreeMap<String, BTreeMap<String, usize>>;

pub fn write_predictions<W: Write>(writer: W, rows: &[PredictionRow]) -> Result<()> {
    let mut tsv = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .quote_style(csv::QuoteStyle::Never)
        .from_writer(writer);
    for row in rows {
        tsv.serialize(row)?;
    }
    tsv.flush()?;
    Ok(())
}

pub fn save_predictions<P: AsRef<Path>>(path: P, rows: &[PredictionRow]) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("unable to create {}", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("unable to create {}", path.display()))?;
    write_predictions(BufWriter::new(file), rows)?;
    info!("Wrote {} predictions to {}", rows.len(), path.display());
    Ok(())
}

/// Tallies `(barcode, value)` pairs.
pub fn count_by_barcode<'a, I, V>(pairs: I) -> BarcodeCounts
where
    I: IntoIterator<Item = (&'a str, V)>,
    V: ToString,
{
    let mut counts = BarcodeCounts::new();
    for (barcode, value) in pairs {
        *counts
            .entry(barcode.to_string())
            .or_default()
            .entry(value.to_string())
            .or_default() += 1;
    }
    counts
}

pub fn log_counts(title: &str, counts: &BarcodeCounts) {
    for (barcode, values) in counts {
        for (value, count) in values {
            info!("{} {}\t{}\t{}", title, barcode, value, count);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub simulated_reads: usize,
    pub real_reads: usize,
    pub training_reads: usize,
    pub held_out_reads: usize,
    pub held_out_accuracy: Option<f32>,
    pub classes: Vec<String>,
    pub abnormal_reads: usize,
    pub novelty: BarcodeCounts,
    pub predictions: BarcodeCounts,
    pub history: TrainingHistory,
    pub seed: u64,
    pub config: RunConfig,
}

pub fn save_summary<P: AsRef<Path>>(path: P, summary: &RunSummary) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).with_context(|| format!("unable to create {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), summary)?;
    info!("Wrote run summary to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows() -> Vec<PredictionRow> {
        vec![
            PredictionRow {
                seq_id: "read1".into(),
                barcode_id: "barcode01".into(),
                prediction: "target".into(),
            },
            PredictionRow {
                seq_id: "read2".into(),
                barcode_id: "barcode01".into(),
                prediction: "abnormal".into(),
            },
            PredictionRow {
                seq_id: "read3".into(),
                barcode_id: "barcode02".into(),
                prediction: "target".into(),
            },
        ]
    }

    #[test]
    fn test_write_predictions_without_header() {
        let mut out = Vec::new();
        write_predictions(&mut out, &rows()).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "read1\tbarcode01\ttarget\nread2\tbarcode01\tabnormal\nread3\tbarcode02\ttarget\n"
        );
    }

    #[test]
    fn test_save_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("prediction.txt");
        save_predictions(&path, &rows()).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written.lines().count(), 3);
    }

    #[test]
    fn test_count_by_barcode() {
        let rows = rows();
        let counts = count_by_barcode(
            rows.iter()
                .map(|r| (r.barcode_id.as_str(), r.prediction.as_str())),
        );
        assert_eq!(counts["barcode01"]["target"], 1);
        assert_eq!(counts["barcode01"]["abnormal"], 1);
        assert_eq!(counts["barcode02"]["target"], 1);
    }
}
