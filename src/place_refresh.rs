//! Periodic re-validation of stored place ids.
//!
//! Upstream ids drift: a listing is re-created, two listings are folded into
//! one. Each stale id is re-checked and the restaurant is rebound, or merged
//! into whichever restaurant already owns the new id.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::errors::AppResult;
use crate::journal::{events, RunJournal};
use crate::models::CanonicalRestaurant;
use crate::places::{PlaceRefresh, PlacesService};
use crate::store::{PlaceRetarget, Store};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlaceRefreshReport {
    pub checked: usize,
    pub unchanged: usize,
    pub rebound: usize,
    pub merged: usize,
    /// Invalid upstream and no replacement found; the old id is kept.
    pub unresolved: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Checked {
    Unchanged,
    Rebound,
    Merged,
    Unresolved,
}

pub struct PlaceIdRefresher {
    store: Store,
    places: PlacesService,
    journal: RunJournal,
    staleness: chrono::Duration,
}

impl PlaceIdRefresher {
    pub fn new(
        store: Store,
        places: PlacesService,
        journal: RunJournal,
        staleness: chrono::Duration,
    ) -> Self {
        Self {
            store,
            places,
            journal,
            staleness,
        }
    }

    pub async fn run(&self) -> AppResult<PlaceRefreshReport> {
        self.run_at(Utc::now()).await
    }

    pub async fn run_at(&self, now: DateTime<Utc>) -> AppResult<PlaceRefreshReport> {
        let due = self
            .store
            .restaurants_due_for_place_check(now - self.staleness)?;
        info!(due = due.len(), "place id refresh starting");

        let mut report = PlaceRefreshReport::default();
        for candidate in due {
            // an earlier merge in this pass may have removed it
            let Some(restaurant) = self.store.restaurant(candidate.id)? else {
                continue;
            };
            report.checked += 1;
            match self.check(&restaurant, now).await {
                Ok(Checked::Unchanged) => report.unchanged += 1,
                Ok(Checked::Rebound) => report.rebound += 1,
                Ok(Checked::Merged) => report.merged += 1,
                Ok(Checked::Unresolved) => report.unresolved += 1,
                Err(err) if err.halts_run() => {
                    self.journal.flush()?;
                    return Err(err);
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(restaurant_id = restaurant.id, error = %err, "place id check failed");
                }
            }
        }
        self.journal.flush()?;
        info!(?report, "place id refresh finished");
        Ok(report)
    }

    #[instrument(skip_all, fields(restaurant_id = restaurant.id))]
    async fn check(&self, restaurant: &CanonicalRestaurant, now: DateTime<Utc>) -> AppResult<Checked> {
        let Some(current) = restaurant.place_id.as_deref() else {
            return Ok(Checked::Unchanged);
        };

        let replacement = match self.places.refresh_place(current).await? {
            PlaceRefresh::Same => None,
            PlaceRefresh::Changed(new_id) => Some(new_id),
            PlaceRefresh::Invalid => {
                let query = format!("{} {}", restaurant.name, self.locality_label(restaurant)?);
                match self.places.find_place(&query).await? {
                    Some(found) => Some(found),
                    None => {
                        warn!(place_id = current, query, "stored place id is invalid and has no replacement");
                        self.store.stamp_place_check(restaurant.id, now)?;
                        return Ok(Checked::Unresolved);
                    }
                }
            }
        };

        let new_id = match replacement {
            Some(new_id) if new_id != current => new_id,
            _ => {
                self.store.stamp_place_check(restaurant.id, now)?;
                return Ok(Checked::Unchanged);
            }
        };

        let outcome = self
            .store
            .retarget_place_id(restaurant.id, current, &new_id, now)?;
        self.journal.note(
            events::PLACE_ID_CHANGED,
            json!({ "restaurant_id": restaurant.id, "old": current, "new": new_id }),
        );
        match outcome {
            PlaceRetarget::Updated => {
                info!(old = current, new = %new_id, "place id rebound");
                Ok(Checked::Rebound)
            }
            PlaceRetarget::Merged { kept_id } => {
                self.journal.note(
                    events::RESTAURANTS_MERGED,
                    json!({ "kept_id": kept_id, "redundant_id": restaurant.id, "place_id": new_id }),
                );
                info!(kept_id, place_id = %new_id, "restaurant merged into existing owner");
                Ok(Checked::Merged)
            }
        }
    }

    fn locality_label(&self, restaurant: &CanonicalRestaurant) -> AppResult<String> {
        if let Some(id) = restaurant.locality_id {
            if let Some(locality) = self.store.locality(id)? {
                return Ok(locality.display_name);
            }
        }
        Ok(restaurant.locality_text.clone().unwrap_or_default())
    }
}
