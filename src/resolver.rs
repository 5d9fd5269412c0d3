use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::cache::{CacheEntry, CachedResponse, ResultCache};
use crate::config::AppConfig;
use crate::normalize::NormalizedAddress;
use crate::overrides::ManualOverrides;
use crate::providers::{Candidate, GeocodeProvider, LookupOutcome, StructuredQuery};
use crate::registry::RegistryRecord;
use crate::scoring::Strategy;

const BASE_BACKOFF_MS: u64 = 250;
pub const MANUAL_PROVIDER: &str = "manual";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl BoundingBox {
    pub fn contains(&self, lat: f64, lng: f64) -> bool {
        (self.min_lat..=self.max_lat).contains(&lat) && (self.min_lng..=self.max_lng).contains(&lng)
    }
}

pub const BULGARIA: BoundingBox = BoundingBox {
    min_lat: 41.0,
    max_lat: 44.5,
    min_lng: 22.0,
    max_lng: 29.0,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeocodeResult {
    pub lat: f64,
    pub lng: f64,
    pub display_name: String,
    pub provider: String,
    pub strategy: Strategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Manual,
    Cache,
    Network,
    Unresolved,
}

impl ResolutionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionSource::Manual => "manual",
            ResolutionSource::Cache => "cache",
            ResolutionSource::Network => "network",
            ResolutionSource::Unresolved => "unresolved",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    CacheHit { accepted: bool },
    Accepted,
    Empty,
    OutOfBounds { candidates: usize },
    Failed { cause: String, tries: u32 },
}

/// One strategy step against the cache or one provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attempt {
    pub strategy: Strategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub key: String,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub result: Option<GeocodeResult>,
    pub source: ResolutionSource,
    pub attempts: Vec<Attempt>,
    pub network_calls: usize,
    pub transport_failures: usize,
}

impl Resolution {
    fn new() -> Self {
        Self {
            result: None,
            source: ResolutionSource::Unresolved,
            attempts: Vec::new(),
            network_calls: 0,
            transport_failures: 0,
        }
    }

    fn accept(mut self, result: GeocodeResult, source: ResolutionSource) -> Self {
        self.result = Some(result);
        self.source = source;
        self
    }
}

enum Query<'a> {
    Text(&'a str),
    Structured(&'a StructuredQuery),
}

/// Walks the strategy ladder for one record: manual override, cached search string,
/// structured query, free-text query, city-only query. The first in-bounds candidate wins.
pub struct Resolver {
    providers: Vec<Arc<dyn GeocodeProvider>>,
    cache: Arc<ResultCache>,
    overrides: ManualOverrides,
    max_attempts: u32,
    jitter_rng: Arc<Mutex<StdRng>>,
}

impl Resolver {
    pub fn new(
        providers: Vec<Arc<dyn GeocodeProvider>>,
        cache: Arc<ResultCache>,
        overrides: ManualOverrides,
        config: &AppConfig,
    ) -> Self {
        Self::with_rng(
            providers,
            cache,
            overrides,
            config.max_attempts,
            StdRng::from_entropy(),
        )
    }

    pub fn with_rng(
        providers: Vec<Arc<dyn GeocodeProvider>>,
        cache: Arc<ResultCache>,
        overrides: ManualOverrides,
        max_attempts: u32,
        rng: StdRng,
    ) -> Self {
        Self {
            providers,
            cache,
            overrides,
            max_attempts: max_attempts.max(1),
            jitter_rng: Arc::new(Mutex::new(rng)),
        }
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub async fn resolve(&self, record: &RegistryRecord, address: &NormalizedAddress) -> Resolution {
        let mut resolution = Resolution::new();

        if let Some(manual) = self
            .overrides
            .find(&record.address, &record.settlement, &record.region)
        {
            debug!(row = record.row, "manual override applied");
            let result = GeocodeResult {
                lat: manual.lat,
                lng: manual.lng,
                display_name: manual.display_name.clone(),
                provider: MANUAL_PROVIDER.to_string(),
                strategy: Strategy::Manual,
            };
            return resolution.accept(result, ResolutionSource::Manual);
        }

        if !address.search_query.is_empty() {
            if let Some(entry) = self.cache.lookup(&address.search_query) {
                let accepted = first_in_bounds(entry.response.candidates())
                    .map(|c| to_result(c, &entry.provider, entry.strategy));
                resolution.attempts.push(Attempt {
                    strategy: entry.strategy,
                    provider: Some(entry.provider.clone()),
                    key: address.search_query.clone(),
                    outcome: AttemptOutcome::CacheHit {
                        accepted: accepted.is_some(),
                    },
                });
                if let Some(result) = accepted {
                    return resolution.accept(result, ResolutionSource::Cache);
                }
            }
        }

        if address.has_street() {
            let structured = StructuredQuery::new(address.street_line(), address.city.clone());
            let key = structured.cache_key();
            if let Some((result, source)) = self
                .run_strategy(
                    Strategy::Structured,
                    &key,
                    Query::Structured(&structured),
                    &mut resolution,
                )
                .await
            {
                return resolution.accept(result, source);
            }

            let query = address.search_query.clone();
            if let Some((result, source)) = self
                .run_strategy(
                    Strategy::FreeText,
                    &query,
                    Query::Text(&query),
                    &mut resolution,
                )
                .await
            {
                return resolution.accept(result, source);
            }
        }

        if let Some(city_query) = address.city_query() {
            if let Some((result, source)) = self
                .run_strategy(
                    Strategy::CityFallback,
                    &city_query,
                    Query::Text(&city_query),
                    &mut resolution,
                )
                .await
            {
                return resolution.accept(result, source);
            }
        }

        resolution
    }

    async fn run_strategy(
        &self,
        strategy: Strategy,
        key: &str,
        query: Query<'_>,
        resolution: &mut Resolution,
    ) -> Option<(GeocodeResult, ResolutionSource)> {
        if let Some(entry) = self.cache.lookup(key) {
            let accepted = first_in_bounds(entry.response.candidates())
                .map(|c| to_result(c, &entry.provider, strategy));
            resolution.attempts.push(Attempt {
                strategy,
                provider: Some(entry.provider.clone()),
                key: key.to_string(),
                outcome: AttemptOutcome::CacheHit {
                    accepted: accepted.is_some(),
                },
            });
            return accepted.map(|result| (result, ResolutionSource::Cache));
        }

        let mut answered: Option<(String, Vec<Candidate>)> = None;
        let mut any_failed = false;
        for provider in &self.providers {
            let (outcome, tries) = self.lookup_with_retry(provider.as_ref(), &query, resolution).await;
            let name = provider.name().to_string();
            match outcome {
                LookupOutcome::Candidates(candidates) => {
                    if let Some(result) =
                        first_in_bounds(&candidates).map(|c| to_result(c, &name, strategy))
                    {
                        resolution.attempts.push(Attempt {
                            strategy,
                            provider: Some(name.clone()),
                            key: key.to_string(),
                            outcome: AttemptOutcome::Accepted,
                        });
                        self.remember(key, &name, strategy, candidates);
                        return Some((result, ResolutionSource::Network));
                    }
                    let outcome = if candidates.is_empty() {
                        AttemptOutcome::Empty
                    } else {
                        AttemptOutcome::OutOfBounds {
                            candidates: candidates.len(),
                        }
                    };
                    resolution.attempts.push(Attempt {
                        strategy,
                        provider: Some(name.clone()),
                        key: key.to_string(),
                        outcome,
                    });
                    if answered.as_ref().map_or(true, |(_, prev)| prev.is_empty()) {
                        answered = Some((name, candidates));
                    }
                }
                LookupOutcome::Unresolved { cause } => {
                    debug!(%key, provider = %name, %cause, "strategy unresolved");
                    any_failed = true;
                    resolution.attempts.push(Attempt {
                        strategy,
                        provider: Some(name),
                        key: key.to_string(),
                        outcome: AttemptOutcome::Failed { cause, tries },
                    });
                }
            }
        }

        // an unanswered provider might still hold a match
        if !any_failed {
            if let Some((provider, candidates)) = answered {
                self.remember(key, &provider, strategy, candidates);
            }
        }
        None
    }

    fn remember(&self, key: &str, provider: &str, strategy: Strategy, candidates: Vec<Candidate>) {
        let entry = CacheEntry::new(provider, strategy, CachedResponse::from_candidates(candidates));
        if let Err(err) = self.cache.store(key, entry) {
            warn!(?err, %key, "failed to persist cache entry");
        }
    }

    async fn lookup_with_retry(
        &self,
        provider: &dyn GeocodeProvider,
        query: &Query<'_>,
        resolution: &mut Resolution,
    ) -> (LookupOutcome, u32) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            resolution.network_calls += 1;
            let outcome = match query {
                Query::Text(text) => provider.search(text).await,
                Query::Structured(structured) => provider.search_structured(structured).await,
            };
            match outcome {
                LookupOutcome::Unresolved { cause } if attempt < self.max_attempts => {
                    resolution.transport_failures += 1;
                    let delay = self.backoff_delay(attempt);
                    debug!(
                        provider = provider.name(),
                        %cause,
                        attempt, "lookup failed; retrying after {:?}", delay
                    );
                    sleep(delay).await;
                }
                LookupOutcome::Unresolved { cause } => {
                    resolution.transport_failures += 1;
                    return (LookupOutcome::Unresolved { cause }, attempt);
                }
                answered => return (answered, attempt),
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = (attempt - 1).min(6);
        let base = Duration::from_millis(BASE_BACKOFF_MS * (1 << exponent));
        let jitter = {
            let mut rng = self.jitter_rng.lock();
            Duration::from_millis(rng.gen_range(0..BASE_BACKOFF_MS))
        };
        base + jitter
    }
}

fn first_in_bounds(candidates: &[Candidate]) -> Option<&Candidate> {
    candidates.iter().find(|c| BULGARIA.contains(c.lat, c.lng))
}

fn to_result(candidate: &Candidate, provider: &str, strategy: Strategy) -> GeocodeResult {
    GeocodeResult {
        lat: candidate.lat,
        lng: candidate.lng,
        display_name: candidate.display_name.clone(),
        provider: provider.to_string(),
        strategy,
    }
}
