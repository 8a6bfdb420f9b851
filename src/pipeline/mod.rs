//! Daily pipeline orchestration.
//!
//! A run walks through `Init -> Resuming -> Processing -> Flushing ->
//! Loading` and ends in `Done` or `DoneNothingLoaded`:
//!
//! - **Init**: check credentials, load the catalog, plan batches, prime the
//!   API and resolve currency rates
//! - **Resuming**: skip the batches recorded in the checkpoint and pick up
//!   the segments an earlier attempt already uploaded
//! - **Processing**: fetch, transform and write each batch in order, saving
//!   the segment manifest and then the checkpoint after every one
//! - **Flushing**: upload the last partial segment
//! - **Loading**: append all segments to the warehouse, clearing the
//!   checkpoint and manifest only when rows were loaded
//!
//! Batches are processed strictly one after another.

mod report;

pub use report::{RunOutcome, RunPhase, RunReport};

use chrono::Utc;
use indexmap::IndexMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::catalog::{CatalogSource, StoredCatalog};
use crate::checkpoint::{CheckpointState, CheckpointStore, ObjectStoreCheckpoint, SegmentManifest};
use crate::config::{Config, MarketplaceConfig, ParquetCompression};
use crate::emit;
use crate::error::PipelineError;
use crate::fetch::{FetchOutcome, KeepaClient, PriceSource};
use crate::fx::{ExchangeRateApi, FxRates, RateProvider};
use crate::loader::{BulkLoader, DeltaLoader};
use crate::metrics::events::{
    BatchProcessed, BatchStatus, ItemsSkipped, RecordsTransformed, RunCompleted,
};
use crate::planner::{Batch, plan};
use crate::sink::UploadedSegment;
use crate::sink::segment::{SegmentWriter, SegmentWriterConfig};
use crate::storage::{StorageProvider, StorageProviderRef};
use crate::transform::transform;

/// Tunables of a run that do not belong to any single component.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub batch_size: usize,
    pub flush_rows: usize,
    pub segment_prefix: String,
    pub local_dir: PathBuf,
    pub compression: ParquetCompression,
    pub marketplaces: IndexMap<String, MarketplaceConfig>,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.pipeline.batch_size,
            flush_rows: config.pipeline.flush_rows,
            segment_prefix: config.staging.prefix.clone(),
            local_dir: config.staging.local_dir(),
            compression: config.staging.compression,
            marketplaces: config.marketplaces.clone(),
        }
    }
}

/// Counters accumulated while processing batches.
#[derive(Debug, Default)]
struct Progress {
    batches_processed: usize,
    batches_failed: usize,
    api_calls: usize,
    rows_written: usize,
    items_skipped: usize,
}

/// The daily pipeline with its collaborators.
pub struct Pipeline {
    settings: PipelineSettings,
    staging: StorageProviderRef,
    source: Arc<dyn PriceSource>,
    rates: Arc<dyn RateProvider>,
    checkpoint: Arc<dyn CheckpointStore>,
    loader: Arc<dyn BulkLoader>,
}

impl Pipeline {
    pub fn new(
        settings: PipelineSettings,
        staging: StorageProviderRef,
        source: Arc<dyn PriceSource>,
        rates: Arc<dyn RateProvider>,
        checkpoint: Arc<dyn CheckpointStore>,
        loader: Arc<dyn BulkLoader>,
    ) -> Self {
        Self {
            settings,
            staging,
            source,
            rates,
            checkpoint,
            loader,
        }
    }

    /// Build the production pipeline: Keepa, exchangerate-api, object
    /// storage checkpoint and the Delta Lake loader.
    pub async fn from_config(config: &Config) -> Result<Self, PipelineError> {
        let staging: StorageProviderRef = Arc::new(
            StorageProvider::for_url_with_options(
                &config.staging.url,
                config.staging.storage_options.clone(),
            )
            .await?,
        );
        let warehouse: StorageProviderRef = Arc::new(
            StorageProvider::for_url_with_options(
                &config.warehouse.url,
                config.warehouse.storage_options.clone(),
            )
            .await?,
        );

        let source = KeepaClient::new(&config.api)?;
        let rates = ExchangeRateApi::new(&config.fx)?;
        let checkpoint = ObjectStoreCheckpoint::new(Arc::clone(&staging), &config.checkpoint.path)
            .with_manifest_path(&config.checkpoint.manifest_path);
        let loader = DeltaLoader::new(
            Arc::clone(&staging),
            warehouse,
            config.warehouse.table_name.clone(),
            config.warehouse.max_concurrent_copies,
        );

        Ok(Self::new(
            PipelineSettings::from_config(config),
            staging,
            Arc::new(source),
            Arc::new(rates),
            Arc::new(checkpoint),
            Arc::new(loader),
        ))
    }

    /// Execute one run over the catalog produced by `catalog`.
    pub async fn run(&self, catalog: &dyn CatalogSource) -> Result<RunReport, PipelineError> {
        let started = Instant::now();
        let result = self.execute(catalog).await;
        emit!(RunCompleted {
            result: match &result {
                Ok(report) => report.outcome.as_str(),
                Err(_) => "error",
            },
            duration: started.elapsed(),
        });
        result
    }

    async fn execute(&self, catalog: &dyn CatalogSource) -> Result<RunReport, PipelineError> {
        let mut phases = Vec::new();

        // Init
        enter(&mut phases, RunPhase::Init);
        self.source.validate().await?;
        let catalog = catalog.load().await?;
        let batches = plan(&catalog, self.settings.batch_size, &self.settings.marketplaces);
        info!(
            batches = batches.len(),
            identifiers = catalog.identifier_count(),
            batch_size = self.settings.batch_size,
            "Planned run"
        );
        self.source.prime().await;
        let rates = self.rates.rates().await;

        // Resuming
        enter(&mut phases, RunPhase::Resuming);
        let resumed_from = self.checkpoint.load().await?;
        let mut skip = resumed_from.offset();
        let mut carried = Vec::new();
        let mut saved_manifest = None;
        // Without a checkpoint any manifest is left over from a finished run.
        if skip > 0 {
            match self.checkpoint.load_manifest().await? {
                Some(manifest) => {
                    if manifest.covered() < skip {
                        warn!(
                            batch_offset = skip,
                            covered_offset = manifest.covered_offset,
                            "Records of the last checkpointed batches never reached staging, fetching them again"
                        );
                    }
                    skip = manifest.covered();
                    carried = manifest.segments.clone();
                    saved_manifest = Some(manifest);
                }
                None => debug!("No segment manifest, trusting the checkpoint"),
            }
        }
        if skip > batches.len() {
            warn!(
                batch_offset = skip,
                batches = batches.len(),
                "Checkpoint is beyond the plan, skipping every batch"
            );
        } else if skip > 0 {
            info!(
                batch_offset = skip,
                segments = carried.len(),
                "Resuming from checkpoint"
            );
        }

        // Processing
        enter(&mut phases, RunPhase::Processing);
        let mut writer = SegmentWriter::new(
            Arc::clone(&self.staging),
            SegmentWriterConfig {
                prefix: self.settings.segment_prefix.clone(),
                run_date: Utc::now().date_naive(),
                flush_rows: self.settings.flush_rows,
                local_dir: self.settings.local_dir.clone(),
                compression: self.settings.compression,
            },
        );
        let mut progress = Progress::default();
        let mut covered = skip as u64;
        for batch in batches.iter().skip(skip) {
            let uploaded_before = writer.uploaded().len();
            self.process_batch(batch, &rates, &mut writer, &mut progress)
                .await?;

            let next = batch.index as u64 + 1;
            if writer.open_records() == 0 {
                covered = next;
            } else if writer.uploaded().len() > uploaded_before {
                // The open segment only holds records of this batch.
                covered = batch.index as u64;
            }
            let manifest = build_manifest(covered, &carried, writer.uploaded());
            self.save_manifest(manifest, &mut saved_manifest).await?;
            self.checkpoint.save(CheckpointState::at(next)).await?;
        }

        // Flushing
        enter(&mut phases, RunPhase::Flushing);
        let uploaded = writer.close().await?;
        let resumed_segments = carried.len();
        let segments: Vec<UploadedSegment> = carried.into_iter().chain(uploaded).collect();
        let manifest = SegmentManifest {
            covered_offset: skip.max(batches.len()) as u64,
            segments: segments.clone(),
        };
        self.save_manifest(manifest, &mut saved_manifest).await?;

        // Loading
        enter(&mut phases, RunPhase::Loading);
        let load = self.loader.load(&segments).await;
        let rows_loaded = load.rows_loaded();

        let outcome = if rows_loaded > 0 {
            self.checkpoint.clear().await?;
            enter(&mut phases, RunPhase::Done);
            info!(
                api_calls = progress.api_calls,
                rows = progress.rows_written,
                rows_loaded,
                segments = segments.len(),
                "Run complete"
            );
            RunOutcome::Done
        } else {
            enter(&mut phases, RunPhase::DoneNothingLoaded);
            warn!(
                api_calls = progress.api_calls,
                rows = progress.rows_written,
                load = ?load,
                segments = segments.len(),
                "Nothing loaded, keeping checkpoint and manifest"
            );
            RunOutcome::NothingLoaded
        };

        Ok(RunReport {
            outcome,
            resumed_from: resumed_from.batch_offset,
            resumed_segments,
            batches_planned: batches.len(),
            batches_processed: progress.batches_processed,
            batches_failed: progress.batches_failed,
            api_calls: progress.api_calls,
            rows_written: progress.rows_written,
            items_skipped: progress.items_skipped,
            segments,
            load,
            rows_loaded,
            phases,
        })
    }

    /// Persist `manifest` unless it matches the one last written.
    async fn save_manifest(
        &self,
        manifest: SegmentManifest,
        saved: &mut Option<SegmentManifest>,
    ) -> Result<(), PipelineError> {
        if saved.as_ref() == Some(&manifest) {
            return Ok(());
        }
        self.checkpoint.save_manifest(&manifest).await?;
        *saved = Some(manifest);
        Ok(())
    }

    async fn process_batch(
        &self,
        batch: &Batch,
        rates: &FxRates,
        writer: &mut SegmentWriter,
        progress: &mut Progress,
    ) -> Result<(), PipelineError> {
        progress.batches_processed += 1;

        let Some(market) = self.settings.marketplaces.get(&batch.marketplace) else {
            warn!(batch = batch.index, marketplace = %batch.marketplace, "Unknown marketplace");
            record_failed(progress);
            return Ok(());
        };
        let Some(fx_rate) = rates.get(&market.currency) else {
            warn!(batch = batch.index, currency = %market.currency, "No FX rate for currency");
            record_failed(progress);
            return Ok(());
        };

        progress.api_calls += 1;
        let items = match self.source.fetch(batch, market.domain_id).await {
            FetchOutcome::Fetched(items) => items,
            FetchOutcome::Failed { attempts, reason } => {
                warn!(
                    batch = batch.index,
                    marketplace = %batch.marketplace,
                    category = %batch.category,
                    attempts,
                    reason = %reason,
                    "Batch failed, continuing"
                );
                record_failed(progress);
                return Ok(());
            }
        };

        let output = transform(
            &items,
            &batch.marketplace,
            &batch.category,
            fx_rate,
            Utc::now(),
        );
        let rows = output.records.len();
        emit!(RecordsTransformed { count: rows as u64 });
        if output.skipped > 0 {
            emit!(ItemsSkipped {
                count: output.skipped as u64
            });
        }

        writer.write_batch(output.records).await?;
        progress.rows_written += rows;
        progress.items_skipped += output.skipped;
        emit!(BatchProcessed {
            status: BatchStatus::Fetched
        });
        debug!(
            batch = batch.index,
            rows,
            skipped = output.skipped,
            total_rows = progress.rows_written,
            "Processed batch"
        );
        Ok(())
    }
}

fn enter(phases: &mut Vec<RunPhase>, phase: RunPhase) {
    info!(phase = %phase, "Entering phase");
    phases.push(phase);
}

fn build_manifest(
    covered_offset: u64,
    carried: &[UploadedSegment],
    uploaded: &[UploadedSegment],
) -> SegmentManifest {
    SegmentManifest {
        covered_offset,
        segments: carried.iter().chain(uploaded).cloned().collect(),
    }
}

fn record_failed(progress: &mut Progress) {
    progress.batches_failed += 1;
    emit!(BatchProcessed {
        status: BatchStatus::Failed
    });
}

/// Build the production pipeline from `config` and run it once.
pub async fn run_pipeline(config: &Config) -> Result<RunReport, PipelineError> {
    let pipeline = Pipeline::from_config(config).await?;
    let catalog = StoredCatalog::new(&config.catalog);
    pipeline.run(&catalog).await
}
