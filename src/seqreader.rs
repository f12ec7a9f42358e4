use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;
use log::info;
use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;

/// Barcode substring that marks a read as simulated training data.
pub const SIMULATED_MARKER: &str = "simulated";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// One row of the MIDS table: `seqID <tab> sequence <tab> barcodeID`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRecord {
    pub seq_id: String,
    pub seq: String,
    pub barcode_id: String,
}

impl ReadRecord {
    pub fn new(seq_id: &str, seq: &str, barcode_id: &str) -> Self {
        Self {
            seq_id: seq_id.to_string(),
            seq: seq.to_string(),
            barcode_id: barcode_id.to_string(),
        }
    }

    pub fn is_simulated(&self) -> bool {
        self.barcode_id.contains(SIMULATED_MARKER)
    }

    /// Splits off the sequence so it can be released independently of the ids.
    pub fn into_parts(self) -> (ReadMeta, String) {
        (
            ReadMeta {
                seq_id: self.seq_id,
                barcode_id: self.barcode_id,
            },
            self.seq,
        )
    }
}

/// Identifiers of a read once its sequence has been consumed by the encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadMeta {
    pub seq_id: String,
    pub barcode_id: String,
}

/// Opens a table, transparently decompressing gzip input.
pub fn open_table<P: AsRef<Path>>(path: P) -> Result<Box<dyn BufRead>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("unable to open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let is_gzip = reader.fill_buf()?.starts_with(&GZIP_MAGIC);
    if is_gzip {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(reader))))
    } else {
        Ok(Box::new(reader))
    }
}

/// Parses a headerless, tab-separated MIDS table.
pub fn read_table<R: Read>(reader: R) -> Result<Vec<ReadRecord>> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .quoting(false)
        .from_reader(reader);

    let mut records = Vec::new();
    for (index, row) in csv_reader.deserialize::<ReadRecord>().enumerate() {
        let record = row.map_err(|e| PipelineError::MalformedInput {
            record: e.position().map_or(index as u64, |p| p.record()) as usize,
            reason: e.to_string(),
        })?;
        records.push(record);
    }
    Ok(records)
}

pub fn load_table<P: AsRef<Path>>(path: P) -> Result<Vec<ReadRecord>> {
    let path = path.as_ref();
    let records = read_table(open_table(path)?)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    info!("Loaded {} reads from {}", records.len(), path.display());
    Ok(records)
}

/// Simulated and real reads, each in input order.
#[derive(Debug, Default, Clone)]
pub struct ReadPartition {
    pub simulated: Vec<ReadRecord>,
    pub real: Vec<ReadRecord>,
}

impl ReadPartition {
    pub fn split(records: Vec<ReadRecord>) -> Self {
        let (simulated, real) = records.into_iter().partition(ReadRecord::is_simulated);
        Self { simulated, real }
    }

    /// Fails when either side has nothing to train on or nothing to classify.
    pub fn ensure_non_empty(&self) -> Result<()> {
        if self.simulated.is_empty() {
            return Err(PipelineError::EmptyPartition("simulated").into());
        }
        if self.real.is_empty() {
            return Err(PipelineError::EmptyPartition("real").into());
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.simulated.len() + self.real.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::{Cursor, Write};

    const TABLE: &str = "r1\tMMMD\tbc1_simulated\n\
                         r2\tMMIM\tbarcode01\n\
                         r3\tMSMM\tbc2_simulated\n\
                         r4\tMMMM\tbarcode02\n";

    #[test]
    fn test_read_table() {
        let records = read_table(Cursor::new(TABLE)).unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[1], ReadRecord::new("r2", "MMIM", "barcode01"));
    }

    #[test]
    fn test_read_table_rejects_missing_column() {
        let err = read_table(Cursor::new("r1\tMMMD\n")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MalformedInput { .. })
        ));
    }

    #[test]
    fn test_partition_keeps_order() {
        let records = read_table(Cursor::new(TABLE)).unwrap();
        let partition = ReadPartition::split(records);
        let sim: Vec<_> = partition.simulated.iter().map(|r| r.seq_id.as_str()).collect();
        let real: Vec<_> = partition.real.iter().map(|r| r.seq_id.as_str()).collect();
        assert_eq!(sim, vec!["r1", "r3"]);
        assert_eq!(real, vec!["r2", "r4"]);
        assert!(partition.ensure_non_empty().is_ok());
    }

    #[test]
    fn test_empty_partitions() {
        let partition = ReadPartition::split(vec![ReadRecord::new("r1", "MM", "barcode01")]);
        let err = partition.ensure_non_empty().unwrap_err();
        assert_eq!(
            err.downcast_ref::<PipelineError>(),
            Some(&PipelineError::EmptyPartition("simulated"))
        );

        let partition = ReadPartition::split(vec![ReadRecord::new("r1", "MM", "wt_simulated")]);
        let err = partition.ensure_non_empty().unwrap_err();
        assert_eq!(
            err.downcast_ref::<PipelineError>(),
            Some(&PipelineError::EmptyPartition("real"))
        );
    }

    #[test]
    fn test_load_gzipped_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mids.txt.gz");
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        encoder.write_all(TABLE.as_bytes()).unwrap();
        encoder.finish().unwrap();

        let records = load_table(&path).unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[3].barcode_id, "barcode02");
    }
}
