pub mod config;
pub mod dataset;
pub mod encoding;
pub mod errors;
pub mod labels;
pub mod model;
pub mod novelty;
pub mod pipeline;
pub mod reports;
pub mod seqreader;
pub mod train;
