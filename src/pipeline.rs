use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::cache::ResultCache;
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::journal::{AttemptJournal, RecordLine, RunJournal};
use crate::normalize::{normalize, NormalizedAddress};
use crate::overrides::ManualOverrides;
use crate::providers::build_providers;
use crate::registry::{RegistryLoad, RegistryRecord};
use crate::resolver::{GeocodeResult, ResolutionSource, Resolver};
use crate::scoring::{score, QualityScore, QualityTier};

/// A registry row with everything the run learned about it.
#[derive(Debug, Clone, Serialize)]
pub struct AnnotatedRecord {
    pub record: RegistryRecord,
    pub address: NormalizedAddress,
    pub result: Option<GeocodeResult>,
    pub score: Option<QualityScore>,
    pub source: ResolutionSource,
}

impl AnnotatedRecord {
    pub fn tier(&self) -> QualityTier {
        QualityTier::of(self.score)
    }

    pub fn needs_review(&self) -> bool {
        self.score.map_or(true, |s| s.value() < 60)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunProgress {
    pub total: usize,
    pub processed: usize,
    pub resolved: usize,
}

pub type ProgressObserver = Arc<dyn Fn(RunProgress) + Send + Sync>;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub total_records: usize,
    pub processed: usize,
    pub skipped_rows: usize,
    pub by_tier: BTreeMap<QualityTier, usize>,
    pub by_source: BTreeMap<ResolutionSource, usize>,
    pub network_calls: usize,
    pub transport_failures: usize,
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

impl RunSummary {
    fn with_total(total_records: usize, skipped_rows: usize) -> Self {
        Self {
            total_records,
            skipped_rows,
            ..Self::default()
        }
    }

    pub fn tier_count(&self, tier: QualityTier) -> usize {
        self.by_tier.get(&tier).copied().unwrap_or(0)
    }

    pub fn source_count(&self, source: ResolutionSource) -> usize {
        self.by_source.get(&source).copied().unwrap_or(0)
    }

    pub fn resolved(&self) -> usize {
        self.processed - self.tier_count(QualityTier::Missing)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Processed {} of {} records ({} malformed rows skipped){}",
            self.processed,
            self.total_records,
            self.skipped_rows,
            if self.cancelled { ", cancelled" } else { "" }
        )?;
        for tier in QualityTier::ALL {
            let count = self.tier_count(tier);
            let share = if self.processed == 0 {
                0.0
            } else {
                count as f64 * 100.0 / self.processed as f64
            };
            writeln!(
                f,
                "  {:<10} {:>7}  {:>5}  ({share:.1}%)",
                tier.as_str(),
                tier.range_label(),
                count
            )?;
        }
        writeln!(
            f,
            "Sources: manual {}, cache {}, network {}, unresolved {}",
            self.source_count(ResolutionSource::Manual),
            self.source_count(ResolutionSource::Cache),
            self.source_count(ResolutionSource::Network),
            self.source_count(ResolutionSource::Unresolved)
        )?;
        writeln!(
            f,
            "Network calls: {} ({} transport failures)",
            self.network_calls, self.transport_failures
        )?;
        write!(f, "Elapsed: {:.1}s", self.elapsed_ms as f64 / 1000.0)
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub records: Vec<AnnotatedRecord>,
    pub summary: RunSummary,
}

#[derive(Debug, Clone, Default)]
pub struct RunSettings {
    pub cache_file: PathBuf,
    pub overrides_file: Option<PathBuf>,
    pub journal_dir: Option<PathBuf>,
}

/// Owns the run context and drives registry records through normalize, resolve and score.
pub struct BatchRunner {
    resolver: Resolver,
    journal: Option<AttemptJournal>,
    guard: AsyncMutex<()>,
}

impl BatchRunner {
    pub fn new(resolver: Resolver, journal: Option<AttemptJournal>) -> Self {
        Self {
            resolver,
            journal,
            guard: AsyncMutex::new(()),
        }
    }

    pub fn from_config(config: &AppConfig, settings: &RunSettings) -> AppResult<Self> {
        let providers = build_providers(config)?;
        if providers.is_empty() {
            return Err(AppError::Config(
                "no geocoding providers configured".to_string(),
            ));
        }
        let cache = Arc::new(ResultCache::open(
            settings.cache_file.clone(),
            config.cache_flush_every,
        ));
        let overrides = match &settings.overrides_file {
            Some(path) => ManualOverrides::load(path)?,
            None => ManualOverrides::default(),
        };
        let journal = match &settings.journal_dir {
            Some(dir) if config.journal_enabled => {
                Some(AttemptJournal::open(dir, config.journal_keep_runs)?)
            }
            _ => None,
        };
        Ok(Self::new(
            Resolver::new(providers, cache, overrides, config),
            journal,
        ))
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        self.resolver.cache()
    }

    /// Processes records in input order. Stops early when the cancel flag is raised;
    /// the cache and journal are flushed either way.
    pub async fn run(
        &self,
        load: RegistryLoad,
        limit: Option<usize>,
        observer: Option<ProgressObserver>,
        cancel_flag: Option<Arc<AtomicBool>>,
    ) -> AppResult<RunOutcome> {
        let _lock = self.guard.lock().await;
        let started = Instant::now();
        let RegistryLoad { mut records, skipped } = load;
        if let Some(limit) = limit {
            records.truncate(limit);
        }

        let total = records.len();
        let mut summary = RunSummary::with_total(total, skipped.len());
        info!(records = total, skipped = skipped.len(), "geocoding run started");
        let run_journal = self.journal.as_ref().and_then(|journal| {
            journal
                .start_run(total, &skipped)
                .map_err(|err| {
                    warn!(
                        ?err,
                        dir = %journal.dir().display(),
                        "attempt journal disabled for this run"
                    )
                })
                .ok()
        });

        let mut annotated = Vec::with_capacity(total);
        for record in records {
            if let Some(flag) = &cancel_flag {
                if flag.load(Ordering::SeqCst) {
                    warn!(processed = annotated.len(), total, "run cancelled");
                    summary.cancelled = true;
                    break;
                }
            }

            let (entry, network_calls, transport_failures) = self.annotate(record, run_journal.as_ref()).await;
            summary.network_calls += network_calls;
            summary.transport_failures += transport_failures;
            *summary.by_tier.entry(entry.tier()).or_default() += 1;
            *summary.by_source.entry(entry.source).or_default() += 1;
            annotated.push(entry);
            summary.processed += 1;

            if let Some(callback) = &observer {
                callback(RunProgress {
                    total,
                    processed: summary.processed,
                    resolved: summary.resolved(),
                });
            }
        }

        if let Err(err) = self.cache().flush() {
            warn!(?err, "failed to flush result cache");
        }
        summary.elapsed_ms = duration_ms(started.elapsed());
        if let Some(run_journal) = run_journal {
            match run_journal.finish(&summary) {
                Ok(path) => debug!(path = %path.display(), "attempt journal closed"),
                Err(err) => warn!(?err, "failed to close attempt journal"),
            }
        }
        info!(
            processed = summary.processed,
            resolved = summary.resolved(),
            network_calls = summary.network_calls,
            "geocoding run finished"
        );

        Ok(RunOutcome {
            records: annotated,
            summary,
        })
    }

    async fn annotate(
        &self,
        record: RegistryRecord,
        run_journal: Option<&RunJournal>,
    ) -> (AnnotatedRecord, usize, usize) {
        let address = normalize(&record.address, &record.settlement);
        let resolution = self.resolver.resolve(&record, &address).await;
        let quality = resolution
            .result
            .as_ref()
            .map(|result| score(result.strategy, &address, &result.display_name));

        match &resolution.result {
            Some(result) => debug!(
                row = record.row,
                strategy = %result.strategy,
                provider = %result.provider,
                score = quality.map(|s| s.value()),
                "record resolved"
            ),
            None => debug!(row = record.row, query = %address.search_query, "record unresolved"),
        }
        if let Some(run_journal) = run_journal {
            let line = RecordLine {
                row: record.row,
                fingerprint: record.fingerprint(),
                search_query: &address.search_query,
                source: resolution.source,
                result: resolution.result.as_ref(),
                score: quality,
                attempts: &resolution.attempts,
            };
            if let Err(err) = run_journal.record(line) {
                warn!(?err, row = record.row, "failed to journal record");
            }
        }

        let entry = AnnotatedRecord {
            record,
            address,
            result: resolution.result,
            score: quality,
            source: resolution.source,
        };
        (
            entry,
            resolution.network_calls,
            resolution.transport_failures,
        )
    }

}

fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis().min(u128::from(u64::MAX)) as u64
}
