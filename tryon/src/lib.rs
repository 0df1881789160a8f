pub mod cli;
pub mod dataset;
pub mod output;
pub mod pipeline;
pub mod profile;

pub use cli::Cli;
pub use pipeline::{RunSummary, TryOn, run, run_dataset};
