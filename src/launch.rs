use crate::collective::{Collective, LocalGroup, SingleProcess};
use crate::config::{loader_workers, Config, RunPaths};
use crate::dataset::{CoordinateDatasetBuilder, DatasetBuilder};
use crate::manifest::{Ledger, LedgerMode, RunSummary};
use crate::model::{FeatureExtractor, ModelFactory};
use crate::orchestrator::{Orchestrator, RunSettings};
use crate::EmbedError;
use std::path::Path;
use std::thread;
use tracing::info;

/// Run a configured job with `world_size` ranks in this process.
pub fn launch(config: &Config, paths: &RunPaths, world_size: usize) -> Result<RunSummary, EmbedError> {
    let datasets = CoordinateDatasetBuilder::new(paths.coordinates_dir(), &config.tiling.backend)?;
    // Surface configuration mistakes before any rank starts.
    ModelFactory::build(&config.model)?;
    let settings = RunSettings {
        batch_size: config.model.batch_size,
        num_workers: loader_workers(config.speed.num_workers_embedding),
        features_dir: paths.features_dir(),
    };
    info!(
        output_dir = %paths.output_dir.display(),
        loader_threads = settings.num_workers,
        world_size,
        "launching"
    );
    run_ranks(world_size, &datasets, |_| ModelFactory::build(&config.model), &paths.manifest_path(), &settings)
}

/// Drive `world_size` ranks over one manifest, one thread per rank.
///
/// Every rank loads the manifest before any rank starts, so all of them see the same
/// pending list; only rank 0 may write it. `make_model` is called once per rank, on
/// that rank's thread; a failure there aborts the group. Returns rank 0's summary, or
/// the first error in rank order.
pub fn run_ranks<F>(
    world_size: usize,
    datasets: &dyn DatasetBuilder,
    make_model: F,
    manifest_path: &Path,
    settings: &RunSettings,
) -> Result<RunSummary, EmbedError>
where
    F: Fn(usize) -> Result<Box<dyn FeatureExtractor>, EmbedError> + Sync,
{
    if settings.batch_size == 0 {
        return Err(EmbedError::Config("batch size must be at least 1".to_string()));
    }
    if world_size == 1 {
        let mut ledger = Ledger::load(manifest_path, LedgerMode::Writer)?;
        let mut orchestrator = Orchestrator::new(SingleProcess, datasets, make_model(0)?, settings.clone())?;
        return orchestrator.run(&mut ledger);
    }

    let ranks = LocalGroup::new(world_size)?;
    let mut ledgers = (0..world_size)
        .map(|r| Ledger::load(manifest_path, if r == 0 { LedgerMode::Writer } else { LedgerMode::ReadOnly }))
        .collect::<Result<Vec<_>, _>>()?;

    let results: Vec<Result<RunSummary, EmbedError>> = thread::scope(|s| {
        let make_model = &make_model;
        let handles: Vec<_> = ranks
            .into_iter()
            .zip(ledgers.iter_mut())
            .map(|(rank, ledger)| {
                s.spawn(move || {
                    let model = match make_model(rank.rank()) {
                        Ok(model) => model,
                        Err(e) => {
                            rank.abort(&format!("model construction failed: {}", e));
                            return Err(e);
                        }
                    };
                    let mut orchestrator = Orchestrator::new(rank, datasets, model, settings.clone())?;
                    orchestrator.run(ledger)
                })
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(r, handle)| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(EmbedError::Other(format!("rank {} panicked", r))))
            })
            .collect()
    });

    let summaries = results.into_iter().collect::<Result<Vec<_>, _>>()?;
    summaries
        .into_iter()
        .next()
        .ok_or_else(|| EmbedError::Other("no ranks ran".to_string()))
}
