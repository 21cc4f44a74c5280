use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::errors::AppResult;
use crate::journal::{events, RunJournal};
use crate::models::CanonicalRestaurant;
use crate::oracle::OracleService;
use crate::store::Store;

static TRAILING_CUISINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s*\bcuisine\s*$").expect("trailing cuisine pattern"));

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CuisineReport {
    pub candidates: usize,
    pub filled: usize,
    pub blank: usize,
    pub failed: usize,
}

/// Fills the cuisine of restaurants that no source described, by asking the
/// oracle for a short label.
pub struct CuisineEnricher {
    store: Store,
    oracle: OracleService,
    journal: RunJournal,
}

impl CuisineEnricher {
    pub fn new(store: Store, oracle: OracleService, journal: RunJournal) -> Self {
        Self {
            store,
            oracle,
            journal,
        }
    }

    pub async fn run(&self) -> AppResult<CuisineReport> {
        self.run_at(Utc::now()).await
    }

    pub async fn run_at(&self, now: DateTime<Utc>) -> AppResult<CuisineReport> {
        let candidates = self.store.restaurants_missing_cuisine()?;
        let mut report = CuisineReport {
            candidates: candidates.len(),
            ..CuisineReport::default()
        };

        for restaurant in candidates {
            let prompt = cuisine_prompt(&restaurant.name, &self.city(&restaurant)?);
            let answer = match self.oracle.ask(&prompt).await {
                Ok(answer) => answer,
                Err(err) => {
                    report.failed += 1;
                    warn!(restaurant_id = restaurant.id, error = %err, "cuisine lookup failed");
                    continue;
                }
            };
            let Some(cuisine) = normalize_cuisine(&answer) else {
                report.blank += 1;
                debug!(restaurant_id = restaurant.id, answer, "oracle gave no usable cuisine");
                continue;
            };
            if self.store.set_cuisine_if_missing(restaurant.id, &cuisine, now)? {
                report.filled += 1;
                self.journal.note(
                    events::CUISINE_ADDED,
                    json!({ "restaurant_id": restaurant.id, "cuisine": cuisine }),
                );
            }
        }
        self.journal.flush()?;
        info!(?report, "cuisine enrichment finished");
        Ok(report)
    }

    fn city(&self, restaurant: &CanonicalRestaurant) -> AppResult<String> {
        if let Some(id) = restaurant.locality_id {
            if let Some(locality) = self.store.locality(id)? {
                return Ok(locality.display_name);
            }
        }
        Ok(restaurant.locality_text.clone().unwrap_or_default())
    }
}

pub fn cuisine_prompt(name: &str, city: &str) -> String {
    format!(
        "Describe the primary cuisine type for the restaurant {name} in {city} in 4 words or less. \
         Examples: French seafood, gourmet donuts, Greek fast-casual street food. \
         Don't use the word cuisine."
    )
}

/// Single line, no trailing period, no trailing "cuisine".
pub fn normalize_cuisine(answer: &str) -> Option<String> {
    let flat = answer
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let trimmed = flat.trim().trim_end_matches('.').trim_end();
    let cleaned = TRAILING_CUISINE.replace(trimmed, "");
    let cleaned = cleaned.trim().trim_end_matches('.').trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use tempfile::tempdir;

    use super::*;
    use crate::errors::AppError;
    use crate::models::{Enrichment, LocalityRef};
    use crate::oracle::Oracle;
    use crate::retry::RetryPolicy;

    #[test]
    fn answers_are_normalized() {
        assert_eq!(normalize_cuisine("Filipino tasting menu."), Some("Filipino tasting menu".into()));
        assert_eq!(normalize_cuisine("Sichuan Cuisine"), Some("Sichuan".into()));
        assert_eq!(normalize_cuisine("Modern\nAmerican cuisine."), Some("Modern American".into()));
        assert_eq!(normalize_cuisine("Cuisine"), None);
        assert_eq!(normalize_cuisine("  \n "), None);
    }

    struct CannedOracle;

    #[async_trait]
    impl Oracle for CannedOracle {
        async fn ask(&self, prompt: &str) -> AppResult<String> {
            if prompt.contains("Alinea") {
                Ok("Molecular gastronomy cuisine.".into())
            } else if prompt.contains("Smyth") {
                Err(AppError::Parse("no reply".into()))
            } else {
                Ok(String::new())
            }
        }
    }

    #[tokio::test]
    async fn fills_only_missing_cuisines() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("cuisine.db")).unwrap();
        let chicago = LocalityRef::Canonical(store.create_locality("Chicago", "us", None).unwrap());
        let now = Utc::now();
        let alinea = store
            .record_lookup_and_bind("Alinea", &chicago, Some("a"), now)
            .unwrap()
            .restaurant;
        store.record_lookup_and_bind("Smyth", &chicago, Some("s"), now).unwrap();
        store.record_lookup_and_bind("Oriole", &chicago, Some("o"), now).unwrap();
        let known = store
            .record_lookup_and_bind("Kasama", &chicago, Some("k"), now)
            .unwrap()
            .restaurant;
        store
            .merge_enrichment(
                known.id,
                &Enrichment {
                    cuisine: Some("Filipino".into()),
                    ..Enrichment::default()
                },
                now,
            )
            .unwrap();

        let oracle = OracleService::with_oracle(Arc::new(CannedOracle), RetryPolicy::immediate(1));
        let journal = RunJournal::open(dir.path(), 1 << 20, 2).unwrap();
        let report = CuisineEnricher::new(store.clone(), oracle, journal)
            .run_at(now)
            .await
            .unwrap();
        assert_eq!(
            report,
            CuisineReport {
                candidates: 3,
                filled: 1,
                blank: 1,
                failed: 1,
            }
        );
        let alinea = store.restaurant(alinea.id).unwrap().unwrap();
        assert_eq!(alinea.enrichment.cuisine.as_deref(), Some("Molecular gastronomy"));
        let kasama = store.restaurant(known.id).unwrap().unwrap();
        assert_eq!(kasama.enrichment.cuisine.as_deref(), Some("Filipino"));
    }

    #[test]
    fn prompt_names_restaurant_and_city() {
        let prompt = cuisine_prompt("Kasama", "Chicago");
        assert!(prompt.starts_with("Describe the primary cuisine type for the restaurant Kasama in Chicago"));
        assert!(prompt.ends_with("Don't use the word cuisine."));
    }
}
