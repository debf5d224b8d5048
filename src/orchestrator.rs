use crate::artifact::{write_artifact, SlideArtifact};
use crate::chunk_store::{ChunkBuffer, TempLayout};
use crate::collective::{Collective, Contribution, RankStatus};
use crate::dataset::{slide_stem, DatasetBuilder, Partition, TileSource};
use crate::error::cause_chain;
use crate::loader::for_each_batch;
use crate::manifest::{Ledger, RunSummary, Status};
use crate::merge::{merge_dedup, missing_tiles};
use crate::model::{FeatureExtractor, ModelLevel};
use crate::tensor::{format_shape, FeatureBlock, Shape, Tensor};
use crate::EmbedError;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Why a slide failed, as written to its manifest row.
#[derive(Debug, Clone, PartialEq)]
pub struct SlideFailure {
    pub error: String,
    pub traceback: String,
}

impl SlideFailure {
    pub fn from_error(err: &EmbedError) -> Self {
        Self { error: err.to_string(), traceback: cause_chain(err) }
    }

    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self { error: format!("panicked: {}", message), traceback: message }
    }
}

fn guarded<T>(f: impl FnOnce() -> Result<T, EmbedError>) -> Result<T, SlideFailure> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(SlideFailure::from_error(&e)),
        Err(payload) => Err(SlideFailure::from_panic(payload)),
    }
}

/// Per-rank knobs for one run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Tiles per model forward pass.
    pub batch_size: usize,
    /// Loader threads per rank; 0 loads tiles inline.
    pub num_workers: usize,
    /// Where slide artifacts land; chunk buffers live under its `tmp/`.
    pub features_dir: PathBuf,
}

/// Drives one rank through every pending slide.
///
/// All ranks run the same sequence of collective calls per slide: a status exchange,
/// then (only when every rank built the dataset and agrees on its length) a barrier and
/// a gather, then a closing barrier. Only the primary merges, writes artifacts and
/// touches the ledger.
pub struct Orchestrator<'a, C: Collective> {
    collective: C,
    datasets: &'a dyn DatasetBuilder,
    model: Box<dyn FeatureExtractor>,
    settings: RunSettings,
    temp: TempLayout,
}

impl<'a, C: Collective> Orchestrator<'a, C> {
    pub fn new(
        collective: C,
        datasets: &'a dyn DatasetBuilder,
        model: Box<dyn FeatureExtractor>,
        settings: RunSettings,
    ) -> Result<Self, EmbedError> {
        if settings.batch_size == 0 {
            return Err(EmbedError::Config("batch size must be at least 1".to_string()));
        }
        let temp = TempLayout::new(&settings.features_dir);
        Ok(Self { collective, datasets, model, settings, temp })
    }

    /// Process every pending slide. Slide failures are recorded and skipped; ledger and
    /// collective errors end the run. On non-primary ranks the returned summary reflects
    /// the ledger as it was loaded.
    pub fn run(&mut self, ledger: &mut Ledger) -> Result<RunSummary, EmbedError> {
        let _temp_root = self.collective.is_primary().then(|| self.temp.root_guard());

        if ledger.all_features_done() {
            info!(rank = self.collective.rank(), "feature extraction already completed");
            return Ok(ledger.summary());
        }

        let pending = ledger.select_pending();
        info!(
            rank = self.collective.rank(),
            world_size = self.collective.world_size(),
            pending = pending.len(),
            total = ledger.rows().len(),
            model = self.model.name(),
            "starting feature extraction"
        );
        let result = pending.iter().enumerate().try_for_each(|(i, row)| {
            debug!(slide = i + 1, of = pending.len(), "next slide");
            self.process_slide(&row.slide_path, ledger)
        });
        if let Err(e) = result.and_then(|()| self.collective.barrier()) {
            // Peers must not wait on a rank that has stopped.
            self.collective.abort(&e.to_string());
            return Err(e);
        }
        Ok(ledger.summary())
    }

    #[instrument(skip_all, fields(rank = self.collective.rank(), slide = %slide_path))]
    fn process_slide(&mut self, slide_path: &str, ledger: &mut Ledger) -> Result<(), EmbedError> {
        let stem = slide_stem(Path::new(slide_path));
        info!("processing slide");

        let built = guarded(|| self.datasets.build(Path::new(slide_path)));
        let status = match &built {
            Ok(dataset) => RankStatus::Ready { tiles: dataset.len() },
            Err(failure) => {
                warn!(error = %failure.error, "dataset build failed");
                RankStatus::Failed { reason: failure.error.clone() }
            }
        };
        let statuses = self.collective.all_gather(status)?;

        // Every rank sees the same statuses, so every rank takes the same branch.
        let outcome = match (agreed_tile_count(&statuses), built) {
            (Ok(tiles), Ok(dataset)) => self.extract_and_gather(&stem, tiles, dataset)?,
            (_, Err(failure)) | (Err(failure), Ok(_)) => self.collective.is_primary().then_some(Err(failure)),
        };

        self.collective.barrier()?;

        if let Some(outcome) = outcome {
            self.temp.remove_slide_dir(&stem);
            match outcome {
                Ok(path) => {
                    info!(artifact = %path.display(), "slide completed");
                    ledger.record_result(slide_path, Status::Success, None, None)?;
                }
                Err(failure) => {
                    warn!(error = %failure.error, "slide failed");
                    ledger.record_result(slide_path, Status::Failed, Some(failure.error), Some(failure.traceback))?;
                }
            }
        }
        Ok(())
    }

    /// Local extraction, then the feature gather. Returns the slide outcome on the primary.
    fn extract_and_gather(
        &mut self,
        stem: &str,
        tiles: usize,
        dataset: Arc<dyn TileSource>,
    ) -> Result<Option<Result<PathBuf, SlideFailure>>, EmbedError> {
        let (contribution, local_failure) = match guarded(|| self.extract_local(stem, dataset.as_ref())) {
            Ok(block) => (Contribution::Real(block), None),
            Err(failure) => {
                warn!(error = %failure.error, "local extraction failed");
                let shape = self.placeholder_shape(tiles);
                (Contribution::placeholder(shape, failure.error.clone()), Some(failure))
            }
        };

        self.collective.barrier()?;
        let gathered = self.collective.gather_to_main(contribution)?;

        Ok(gathered.map(|contributions| match local_failure {
            Some(failure) => Err(failure),
            None => guarded(|| self.finish_slide(contributions, dataset.as_ref(), stem)),
        }))
    }

    /// Shape this rank's real contribution would have had.
    fn placeholder_shape(&self, tiles: usize) -> Shape {
        let mut shape: Shape = Shape::new();
        shape.push(tiles.div_ceil(self.collective.world_size()));
        shape.extend_from_slice(&self.model.feature_shape());
        shape
    }

    /// Partition, infer into this rank's chunk, read it back.
    fn extract_local(&mut self, stem: &str, dataset: &dyn TileSource) -> Result<FeatureBlock, EmbedError> {
        let rank = self.collective.rank();
        let partition = Partition::new(dataset.len(), rank, self.collective.world_size())?;

        let chunk_path = self.temp.chunk_path(stem, rank);
        ChunkBuffer::discard_stale(&chunk_path)?;
        let feature_shape = self.model.feature_shape();
        let mut chunk = ChunkBuffer::open(&chunk_path, partition.capacity_estimate(), &feature_shape)?;

        let model = &mut self.model;
        let mut offset = chunk.committed();
        for_each_batch(
            dataset,
            partition.local_indices(),
            self.settings.batch_size,
            self.settings.num_workers,
            |batch| {
                let features = model.forward(&batch.tiles)?;
                check_output_shape(&features, batch.indices.len(), &feature_shape)?;
                offset = chunk.write_batch(&batch.indices, &features, offset)?;
                debug!(written = offset, of = partition.local_len(), "batch written");
                Ok(())
            },
        )?;

        let block = chunk.read_all()?;
        chunk.close_and_discard()?;
        Ok(block)
    }

    /// Primary only: merge what every rank sent and persist the artifact.
    fn finish_slide(
        &mut self,
        contributions: Vec<Contribution>,
        dataset: &dyn TileSource,
        stem: &str,
    ) -> Result<PathBuf, EmbedError> {
        let mut blocks = Vec::with_capacity(contributions.len());
        for (rank, contribution) in contributions.into_iter().enumerate() {
            match contribution {
                Contribution::Real(block) => blocks.push(block),
                Contribution::Placeholder { reason, .. } => {
                    return Err(EmbedError::Other(format!(
                        "rank {} has no features for this slide: {}",
                        rank,
                        reason.unwrap_or_else(|| "no reason given".to_string())
                    )));
                }
            }
        }

        let merged = merge_dedup(&blocks)?;
        let missing = missing_tiles(&merged.indices, dataset.len())?;
        if missing > 0 {
            warn!(missing, tiles = dataset.len(), "merged features do not cover every tile");
        }

        let artifact = if self.model.level() == ModelLevel::Slide {
            let table = if self.model.uses_scaled_coordinates() {
                dataset.scaled_coordinates()
            } else {
                dataset.coordinates()
            };
            let coordinates: Vec<[i64; 2]> = merged.indices.iter().map(|&i| table[i as usize]).collect();
            let embedding = self
                .model
                .forward_slide(&merged.features, &coordinates, dataset.tile_size_lv0())?;
            SlideArtifact::SlideEmbedding(embedding)
        } else {
            SlideArtifact::from_feature_set(merged)
        };
        write_artifact(&self.settings.features_dir, stem, &artifact)
    }
}

/// Tile count every rank agrees on, or why the slide cannot proceed.
fn agreed_tile_count(statuses: &[RankStatus]) -> Result<usize, SlideFailure> {
    let mut agreed = None;
    for (rank, status) in statuses.iter().enumerate() {
        match (status, agreed) {
            (RankStatus::Failed { reason }, _) => {
                return Err(SlideFailure {
                    error: format!("rank {} could not build the dataset: {}", rank, reason),
                    traceback: reason.clone(),
                });
            }
            (RankStatus::Ready { tiles }, None) => agreed = Some(*tiles),
            (RankStatus::Ready { tiles }, Some(first)) if *tiles != first => {
                let error = format!("ranks disagree on the tile count: rank 0 has {}, rank {} has {}", first, rank, tiles);
                return Err(SlideFailure { traceback: error.clone(), error });
            }
            (RankStatus::Ready { .. }, Some(_)) => {}
        }
    }
    agreed.ok_or_else(|| SlideFailure {
        error: "no rank reported a status".to_string(),
        traceback: String::new(),
    })
}

fn check_output_shape(output: &Tensor, batch_len: usize, feature_shape: &[usize]) -> Result<(), EmbedError> {
    match output.shape().split_first() {
        Some((&rows, rest)) if rows == batch_len && rest == feature_shape => Ok(()),
        _ => {
            let mut expected = vec![batch_len];
            expected.extend_from_slice(feature_shape);
            Err(EmbedError::Shape(format!(
                "model returned {}, expected {}",
                format_shape(output.shape()),
                format_shape(&expected)
            )))
        }
    }
}
