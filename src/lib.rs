pub mod commands;
pub mod config;
pub mod cuisine;
pub mod db;
pub mod errors;
pub mod identity;
pub mod journal;
pub mod locality;
pub mod models;
pub mod oracle;
pub mod page;
pub mod place_refresh;
pub mod places;
pub mod ranking;
pub mod refresh;
pub mod retry;
pub mod sources;
pub mod store;

use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::AppConfig;
use crate::cuisine::CuisineEnricher;
use crate::identity::IdentityResolver;
use crate::journal::{events, RunJournal};
use crate::locality::LocalityResolver;
use crate::oracle::OracleService;
use crate::page::{fetcher_from_config, PageFetcher};
use crate::place_refresh::PlaceIdRefresher;
use crate::places::PlacesService;
use crate::store::Store;

pub use crate::commands::HarvestStatus;
pub use crate::errors::{AppError, AppResult};
pub use crate::refresh::{RefreshFilter, RefreshReport, RefreshScheduler};

/// Everything a run needs, wired from configuration. External clients are
/// built on demand so that commands which never call out need no keys.
pub struct Harvester {
    config: AppConfig,
    store: Store,
    journal: RunJournal,
    fetcher: Arc<dyn PageFetcher>,
}

impl Harvester {
    pub fn initialize(config: AppConfig) -> AppResult<Self> {
        init_tracing();
        let store = Store::open(&config.database_path)?;
        let journal = RunJournal::from_config(&config)?;
        let fetcher = fetcher_from_config(&config)?;

        info!(config = ?config.public_profile(), "harvester initialised");
        journal.note(
            events::RUN_STARTED,
            json!({ "version": env!("CARGO_PKG_VERSION") }),
        );
        Ok(Self {
            config,
            store,
            journal,
            fetcher,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn journal(&self) -> &RunJournal {
        &self.journal
    }

    /// The oracle is optional for locality matching and required for
    /// cuisine enrichment.
    fn oracle(&self) -> AppResult<Option<OracleService>> {
        if self.config.openai_api_key.is_none() {
            warn!("OPENAI_API_KEY not set; oracle-backed matching disabled");
            return Ok(None);
        }
        OracleService::new(&self.config).map(Some)
    }

    pub fn refresh_scheduler(&self) -> AppResult<RefreshScheduler> {
        let places = PlacesService::new(&self.config)?;
        let localities =
            LocalityResolver::new(self.store.clone(), self.oracle()?, &self.config.oracle_countries);
        Ok(RefreshScheduler::new(
            self.store.clone(),
            self.fetcher.clone(),
            localities,
            IdentityResolver::new(self.store.clone(), places),
            self.journal.clone(),
        )
        .configured(&self.config))
    }

    pub fn place_id_refresher(&self) -> AppResult<PlaceIdRefresher> {
        Ok(PlaceIdRefresher::new(
            self.store.clone(),
            PlacesService::new(&self.config)?,
            self.journal.clone(),
            self.config.staleness_window(),
        ))
    }

    pub fn cuisine_enricher(&self) -> AppResult<CuisineEnricher> {
        let oracle = self.oracle()?.ok_or_else(|| {
            AppError::Config("OPENAI_API_KEY must be set to enrich cuisines".into())
        })?;
        Ok(CuisineEnricher::new(self.store.clone(), oracle, self.journal.clone()))
    }

    pub fn status(&self) -> AppResult<HarvestStatus> {
        Ok(HarvestStatus::new(
            self.store.summary()?,
            self.journal.path().display().to_string(),
            self.config.public_profile(),
        ))
    }
}

impl Drop for Harvester {
    fn drop(&mut self) {
        if let Err(err) = self.journal.flush() {
            warn!(?err, "failed to flush run journal");
        }
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,fuego_harvester=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    });
}
