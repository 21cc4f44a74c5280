use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use url::Url;

use crate::config::PublicAppConfig;
use crate::cuisine::CuisineReport;
use crate::errors::{AppError, AppResult};
use crate::models::{CanonicalRestaurant, DocumentKind, Locality, SourceDocument};
use crate::place_refresh::PlaceRefreshReport;
use crate::ranking::{rank as rank_evidence, RankedRestaurant};
use crate::refresh::{RefreshFilter, RefreshReport};
use crate::sources::dispatch;
use crate::store::StoreSummary;
use crate::Harvester;

#[derive(Debug, Serialize)]
pub struct HarvestStatus {
    pub store: StoreSummary,
    pub journal_path: String,
    pub config: PublicAppConfig,
}

impl HarvestStatus {
    pub fn new(store: StoreSummary, journal_path: String, config: PublicAppConfig) -> Self {
        Self {
            store,
            journal_path,
            config,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RankedListing {
    pub locality: Locality,
    pub restaurants: Vec<RankedRestaurant>,
}

pub async fn refresh(harvester: &Harvester, source: Option<String>) -> AppResult<RefreshReport> {
    let filter = match source {
        // stored urls are in normalised form
        Some(url) => RefreshFilter::Only(
            Url::parse(url.trim())
                .map(|parsed| parsed.to_string())
                .unwrap_or(url),
        ),
        None => RefreshFilter::Stale,
    };
    harvester.refresh_scheduler()?.run(filter).await
}

pub async fn refresh_place_ids(harvester: &Harvester) -> AppResult<PlaceRefreshReport> {
    harvester.place_id_refresher()?.run().await
}

pub async fn enrich_cuisine(harvester: &Harvester) -> AppResult<CuisineReport> {
    harvester.cuisine_enricher()?.run().await
}

pub fn add_locality(
    harvester: &Harvester,
    name: &str,
    country: &str,
    state: Option<&str>,
) -> AppResult<Locality> {
    let locality = harvester.store().create_locality(name, country, state)?;
    info!(locality_id = locality.id, name = %locality.display_name, "locality registered");
    Ok(locality)
}

/// Registers a source document. The url must belong to a known source.
pub fn add_source(
    harvester: &Harvester,
    url: &str,
    locality_id: Option<i64>,
) -> AppResult<SourceDocument> {
    let parsed = Url::parse(url.trim())
        .map_err(|err| AppError::Config(format!("invalid source url {url}: {err}")))?;
    let source = dispatch(&parsed)?;
    if let Some(id) = locality_id {
        harvester
            .store()
            .locality(id)?
            .ok_or_else(|| AppError::Config(format!("locality {id} does not exist")))?;
    }
    let kind = source.document_kind();
    if kind == DocumentKind::Article && locality_id.is_none() {
        warn!(url, "article registered without a locality; entries will need their own");
    }
    let document = harvester
        .store()
        .create_document(parsed.as_str(), kind, locality_id)?;
    info!(document_id = document.id, source = source.name(), "source registered");
    Ok(document)
}

/// Curation: a deleted restaurant keeps its history but is no longer
/// associated with anything a refresh finds.
pub fn delete_restaurant(harvester: &Harvester, restaurant_id: i64) -> AppResult<CanonicalRestaurant> {
    let store = harvester.store();
    store.soft_delete_restaurant(restaurant_id, Utc::now())?;
    let restaurant = store
        .restaurant(restaurant_id)?
        .ok_or_else(|| AppError::Config(format!("restaurant {restaurant_id} does not exist")))?;
    info!(restaurant_id, name = %restaurant.name, "restaurant deleted");
    Ok(restaurant)
}

pub fn rank(harvester: &Harvester, locality_id: i64) -> AppResult<RankedListing> {
    let locality = harvester
        .store()
        .locality(locality_id)?
        .ok_or_else(|| AppError::Config(format!("locality {locality_id} does not exist")))?;
    let evidence = harvester.store().ranking_evidence(locality_id)?;
    Ok(RankedListing {
        locality,
        restaurants: rank_evidence(evidence),
    })
}

pub fn status(harvester: &Harvester) -> AppResult<HarvestStatus> {
    harvester.status()
}
