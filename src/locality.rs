use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};
use crate::models::Locality;
use crate::oracle::OracleService;
use crate::store::Store;

/// Maps freeform place strings ("Evanston, Illinois") onto canonical
/// localities: cache first, then an exact name match, then yes/no questions
/// to the oracle about each locality of an approved country.
#[derive(Clone)]
pub struct LocalityResolver {
    store: Store,
    oracle: Option<OracleService>,
    approved_countries: Vec<String>,
}

impl LocalityResolver {
    pub fn new(store: Store, oracle: Option<OracleService>, approved_countries: &[String]) -> Self {
        Self {
            store,
            oracle,
            approved_countries: approved_countries
                .iter()
                .map(|country| country.trim().to_lowercase())
                .filter(|country| !country.is_empty())
                .collect(),
        }
    }

    pub fn is_approved(&self, country: &str) -> bool {
        let country = country.trim().to_lowercase();
        self.approved_countries.iter().any(|approved| *approved == country)
    }

    pub async fn resolve(&self, search: &str, country: Option<&str>) -> AppResult<Option<Locality>> {
        let search = search.trim();
        if search.is_empty() {
            return Ok(None);
        }

        if let Some(entry) = self.store.locality_cache_entry(search, country)? {
            debug!(search, ?country, locality_id = ?entry.locality_id, "locality cache hit");
            return match entry.locality_id {
                Some(id) => self.store.locality(id)?.map(Some).ok_or_else(|| {
                    AppError::CacheInvariant(format!(
                        "locality cache for {search:?} points at missing locality {id}"
                    ))
                }),
                None => Ok(None),
            };
        }

        let head = search.split(',').next().unwrap_or(search).trim();
        if let Some(locality) = self.store.find_locality_by_name(head, country)? {
            debug!(search, locality_id = locality.id, "exact locality match");
            self.store
                .record_locality_resolution(search, country, Some(&locality))?;
            return Ok(Some(locality));
        }

        let Some(country) = country.filter(|country| self.is_approved(country)) else {
            debug!(search, ?country, "country not approved for oracle matching");
            self.store.record_locality_resolution(search, country, None)?;
            return Ok(None);
        };

        let Some(oracle) = &self.oracle else {
            // Without an oracle the search is not exhaustive, so nothing is cached.
            warn!(search, country, "no oracle configured; leaving locality unresolved");
            return Ok(None);
        };

        for locality in self.store.localities_in_country(country)? {
            let question = format!(
                "Is {search} in {}? Just return yes or no.",
                disambiguate(&locality.display_name)
            );
            if oracle.confirms(&question).await? {
                info!(search, locality_id = locality.id, "oracle matched locality");
                self.store
                    .record_locality_resolution(search, Some(country), Some(&locality))?;
                return Ok(Some(locality));
            }
        }

        info!(search, country, "no locality matched");
        self.store
            .record_locality_resolution(search, Some(country), None)?;
        Ok(None)
    }
}

/// Names the oracle reads as a state unless told otherwise.
fn disambiguate(display_name: &str) -> String {
    match display_name.trim().to_lowercase().as_str() {
        "new york" => "New York City".to_string(),
        "washington" => "Washington DC".to_string(),
        _ => display_name.trim().to_string(),
    }
}
