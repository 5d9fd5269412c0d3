pub mod cache;
pub mod config;
pub mod errors;
pub mod export;
pub mod journal;
pub mod normalize;
pub mod overrides;
pub mod pipeline;
pub mod providers;
pub mod registry;
pub mod resolver;
pub mod scoring;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::cache::{CacheEntry, CachedResponse, ResultCache};
pub use crate::config::AppConfig;
pub use crate::errors::{AppError, AppResult};
pub use crate::normalize::{normalize, NormalizedAddress};
pub use crate::pipeline::{AnnotatedRecord, BatchRunner, RunOutcome, RunSettings, RunSummary};
pub use crate::providers::{GeocodeProvider, LookupOutcome};
pub use crate::registry::{load_registry, RegistryRecord};
pub use crate::resolver::{GeocodeResult, Resolver};
pub use crate::scoring::{QualityScore, QualityTier, Strategy};

/// Installs the global subscriber once. `RUST_LOG` wins over `verbose`.
pub fn init_tracing(verbose: bool) {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let default_filter = if verbose {
            "info,hospital_geocoder=debug"
        } else {
            "info,hospital_geocoder=info"
        };
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    });
}
