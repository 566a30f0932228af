//! Engine configuration: store backend selection and stall thresholds.
//!
//! Configuration resolves in two layers: explicit `with_*` builders win,
//! then environment variables (loaded through `dotenvy`, so a local `.env`
//! file works in development):
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `FLOWLINE_STORE` | `memory` or `sqlite` | `memory` |
//! | `FLOWLINE_SQLITE_URL` | database URL for the sqlite backend | `sqlite://flowline.db` |
//! | `FLOWLINE_STALL_MIN_PROGRESS_PCT` | zombie signal threshold | `60` |
//! | `FLOWLINE_STALL_EMPTY_TAIL` | flagged phases without artifacts | `2` |
//! | `FLOWLINE_STALL_STALE_AFTER_SECS` | running-flow silence window | `600` |

use std::sync::Arc;
use std::time::Duration;

use crate::recovery::StallThresholds;
use crate::store::memory::InMemoryFlowStore;
use crate::store::{FlowStore, StoreError};

/// Which store backend to build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    /// Process-memory store; state is lost on restart.
    Memory,
    /// Durable SQLite store (requires the `sqlite` feature).
    Sqlite { url: String },
}

/// Top-level engine configuration.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub backend: StoreBackend,
    pub thresholds: StallThresholds,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            thresholds: StallThresholds::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

impl EngineConfig {
    /// Resolve configuration from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let backend = match std::env::var("FLOWLINE_STORE").as_deref() {
            Ok("sqlite") => StoreBackend::Sqlite {
                url: std::env::var("FLOWLINE_SQLITE_URL")
                    .unwrap_or_else(|_| "sqlite://flowline.db".to_string()),
            },
            _ => StoreBackend::Memory,
        };
        let defaults = StallThresholds::default();
        let thresholds = StallThresholds {
            min_progress_pct: env_parse("FLOWLINE_STALL_MIN_PROGRESS_PCT")
                .unwrap_or(defaults.min_progress_pct),
            empty_tail: env_parse("FLOWLINE_STALL_EMPTY_TAIL").unwrap_or(defaults.empty_tail),
            stale_after: env_parse("FLOWLINE_STALL_STALE_AFTER_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.stale_after),
        };
        Self {
            backend,
            thresholds,
        }
    }

    #[must_use]
    pub fn with_backend(mut self, backend: StoreBackend) -> Self {
        self.backend = backend;
        self
    }

    #[must_use]
    pub fn with_thresholds(mut self, thresholds: StallThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Construct the configured store backend.
    pub async fn build_store(&self) -> Result<Arc<dyn FlowStore>, StoreError> {
        match &self.backend {
            StoreBackend::Memory => Ok(Arc::new(InMemoryFlowStore::new())),
            #[cfg(feature = "sqlite")]
            StoreBackend::Sqlite { url } => {
                let store = crate::store::sqlite::SqliteFlowStore::connect(url).await?;
                Ok(Arc::new(store))
            }
            #[cfg(not(feature = "sqlite"))]
            StoreBackend::Sqlite { .. } => Err(StoreError::Backend {
                message: "sqlite backend requested but the 'sqlite' feature is disabled".into(),
            }),
        }
    }
}
