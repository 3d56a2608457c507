//! 程序运行函数.

use crate::result::ExperimentResult;
use crate::Cli;
use rad_berry::pipeline::{Orchestrator, PipelineError};
use utils::loader;

/// 实际运行.
pub fn run(cli: &Cli) -> Result<ExperimentResult, String> {
    let paths = loader::run_paths(cli.input.clone(), cli.results.clone())
        .ok_or_else(|| "cannot determine input/results directories".to_string())?;
    if !paths.input_dir.is_dir() {
        return Err(format!("input directory {} does not exist", paths.input_dir.display()));
    }

    let mut config = loader::load_config(&cli.config, &paths.input_dir).map_err(|e| e.to_string())?;
    if let Some(seed) = cli.seed {
        config.seed = seed;
    }
    if cli.sequential {
        config.parallel_folds = false;
    }

    log::info!(
        "Running nested CV on {} core(s): input {}, results {}",
        utils::cpus(),
        paths.input_dir.display(),
        paths.results_dir.display()
    );
    let orchestrator = Orchestrator::new(config, paths).map_err(|e| e.to_string())?;
    match orchestrator.run() {
        Ok(report) => Ok(ExperimentResult::new(report)),
        Err(PipelineError::Cancelled { completed }) => Err(format!("run cancelled after fold(s) {completed:?}")),
        Err(e) => Err(e.to_string()),
    }
}
