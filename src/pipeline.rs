//! The classification run, stage by stage.
//!
//! `AllelePipeline` owns every large tensor of a run and releases each one as
//! soon as the next stage no longer needs it.

use anyhow::Result;
use candle_core::Device;
use log::info;
use rand::Rng;

use crate::config::RunConfig;
use crate::dataset::{split_simulated, Dataset};
use crate::encoding::{common_length, ensure_same_read_length, ensure_same_width, SequenceEncoder};
use crate::labels::{LabelResolver, ABNORMAL_LABEL};
use crate::model::min_input_length;
use crate::novelty::LocalOutlierFactor;
use crate::reports::{
    count_by_barcode, log_counts, save_predictions, save_summary, PredictionRow, RunSummary,
};
use crate::seqreader::{load_table, ReadMeta, ReadPartition, ReadRecord};
use crate::train::train_classifier;

fn sequences(records: &[ReadRecord]) -> Vec<&str> {
    records.iter().map(|r| r.seq.as_str()).collect()
}

pub struct AllelePipeline {
    config: RunConfig,
    device: Device,
}

impl AllelePipeline {
    pub fn new(config: RunConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            device: Device::Cpu,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Loads the input table, classifies its real reads and writes the results.
    pub fn run(&self) -> Result<RunSummary> {
        info!("Loading reads from {}", self.config.input_path.display());
        let records = load_table(&self.config.input_path)?;
        let (rows, summary) = self.classify_records(records)?;
        save_predictions(&self.config.output_path, &rows)?;
        if let Some(path) = &self.config.summary_path {
            save_summary(path, &summary)?;
        }
        Ok(summary)
    }

    /// Runs every stage on in-memory records; rows follow the input order of the real reads.
    pub fn classify_records(&self, records: Vec<ReadRecord>) -> Result<(Vec<PredictionRow>, RunSummary)> {
        let config = &self.config;
        let partition = ReadPartition::split(records);
        partition.ensure_non_empty()?;
        info!(
            "Partitioned {} reads into {} simulated and {} real",
            partition.len(),
            partition.simulated.len(),
            partition.real.len()
        );
        ensure_same_read_length(
            common_length(&sequences(&partition.simulated))?,
            common_length(&sequences(&partition.real))?,
        )?;

        let alphabet = config.alphabet.resolve(
            partition
                .simulated
                .iter()
                .chain(&partition.real)
                .map(|r| r.seq.as_str()),
        )?;
        info!(
            "Encoding with alphabet {:?}",
            String::from_utf8_lossy(alphabet.symbols())
        );
        let encoder = SequenceEncoder::new(alphabet)?.with_min_length(min_input_length());

        let seed = config.seed.unwrap_or_else(|| rand::rng().random());
        info!("Using seed {}", seed);

        let ReadPartition { simulated, real } = partition;
        let simulated_reads = simulated.len();
        let mut dataset = split_simulated(&simulated, &encoder, config.test_fraction, seed)?;
        drop(simulated);

        let held_out_reads = dataset.test_classes.len();
        if !config.evaluate_holdout {
            dataset.release_holdout();
        }

        let model = train_classifier(
            &dataset.train_features,
            &dataset.train_classes,
            dataset.label_index.len(),
            &config.training,
            seed,
            &self.device,
        )?;

        let held_out_accuracy = if config.evaluate_holdout {
            let accuracy =
                model.accuracy(&dataset.test_features, &dataset.test_classes, &config.inference)?;
            info!("Held-out accuracy {:.4} on {} reads", accuracy, held_out_reads);
            dataset.release_holdout();
            Some(accuracy)
        } else {
            None
        };

        if let Some(path) = &config.model_path {
            model.save(path)?;
            info!("Saved model weights to {}", path.display());
        }

        let (metas, real_seqs): (Vec<ReadMeta>, Vec<String>) =
            real.into_iter().map(ReadRecord::into_parts).unzip();
        let real_features = encoder.encode(&real_seqs)?;
        drop(real_seqs);
        ensure_same_width(dataset.train_features.view(), real_features.view())?;

        let Dataset {
            train_features,
            train_classes,
            label_index,
            ..
        } = dataset;
        let training_reads = train_classes.len();

        let embedder = model.embedder();
        let batch_size = config.inference.embed_batch_size;
        let train_embedding = embedder.embed(&train_features, batch_size)?;
        drop(train_features);
        let real_embedding = embedder.embed(&real_features, batch_size)?;

        let detector = LocalOutlierFactor::new(config.novelty.clone()).fit(train_embedding)?;
        let flags = detector.predict(&real_embedding)?;
        drop(real_embedding);

        let novelty = count_by_barcode(
            metas
                .iter()
                .zip(&flags)
                .map(|(meta, flag)| (meta.barcode_id.as_str(), flag)),
        );
        log_counts("novelty", &novelty);

        let classes = model.predict_classes(&real_features, &config.inference)?;
        drop(real_features);

        let resolver = LabelResolver::new(&label_index, &config.mutation_type);
        let labels = resolver.resolve_all(&classes.to_vec(), &flags)?;

        let rows: Vec<PredictionRow> = metas
            .into_iter()
            .zip(labels)
            .map(|(meta, prediction)| PredictionRow {
                seq_id: meta.seq_id,
                barcode_id: meta.barcode_id,
                prediction,
            })
            .collect();
        let predictions = count_by_barcode(
            rows.iter()
                .map(|row| (row.barcode_id.as_str(), row.prediction.as_str())),
        );
        log_counts("prediction", &predictions);

        let abnormal_reads = rows
            .iter()
            .filter(|row| row.prediction == ABNORMAL_LABEL)
            .count();
        info!("{} of {} real reads are abnormal", abnormal_reads, rows.len());

        let summary = RunSummary {
            simulated_reads,
            real_reads: rows.len(),
            training_reads,
            held_out_reads,
            held_out_accuracy,
            classes: (0..label_index.len())
                .filter_map(|class| label_index.class_name(class).map(str::to_string))
                .collect(),
            abnormal_reads,
            novelty,
            predictions,
            history: model.history.clone(),
            seed,
            config: config.clone(),
        };
        Ok((rows, summary))
    }
}
