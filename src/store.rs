use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, info};

use crate::db::{self, format_timestamp};
use crate::errors::{AppError, AppResult};
use crate::models::{
    normalize_key, Award, AwardObservation, AwardSource, CanonicalRestaurant, DocumentKind,
    Enrichment, Locality, LocalityCacheEntry, LocalityRef, OgMetadata, PlaceIdCacheEntry,
    PriceTier, SourceAssociation, SourceDocument,
};
use crate::ranking::{AwardEvidence, RestaurantEvidence};

const RESTAURANT_COLUMNS: &str = "id, name, locality_id, locality_text, locality_key, place_id, \
     cuisine, chef, price_tier, latitude, longitude, website, phone, address, reservation_url, \
     social_url, place_checked_at, deleted_at";
const DOCUMENT_COLUMNS: &str =
    "id, url, kind, locality_id, title, description, image_url, site_name, refreshed_at";
const ASSOCIATION_COLUMNS: &str =
    "id, restaurant_id, document_id, description, url, observed_at, retracted_at";
const AWARD_COLUMNS: &str = "id, restaurant_id, document_id, source, award_type, year, chef, url, \
     observed_at, retracted_at";
const MAX_ALIAS_HOPS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BindOutcome {
    Created,
    ExistingByPlace,
    ExistingByName,
}

#[derive(Debug, Clone)]
pub struct Binding {
    pub restaurant: CanonicalRestaurant,
    pub outcome: BindOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AssociationChange {
    Created,
    Refreshed,
    Revived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlaceRetarget {
    Updated,
    Merged { kept_id: i64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    pub moved_associations: usize,
    pub collapsed_associations: usize,
    pub moved_awards: usize,
    pub collapsed_awards: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TombstoneCounts {
    pub associations: usize,
    pub awards: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreSummary {
    pub localities: i64,
    pub restaurants: i64,
    pub documents: i64,
    pub live_associations: i64,
    pub retracted_associations: i64,
    pub live_awards: i64,
}

/// SQLite-backed record store shared by every resolver and scheduler.
#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    pub fn open<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let context = db::bootstrap(path)?;
        Ok(Self::new(Arc::new(Mutex::new(context.connection))))
    }

    pub fn handle(&self) -> Arc<Mutex<Connection>> {
        self.db.clone()
    }

    pub fn create_locality(
        &self,
        display_name: &str,
        country: &str,
        state: Option<&str>,
    ) -> AppResult<Locality> {
        let display_name = display_name.trim();
        let country = country.trim().to_lowercase();
        if display_name.is_empty() || country.is_empty() {
            return Err(AppError::Config(
                "a locality needs a display name and a country".into(),
            ));
        }
        let state = state.map(str::trim).filter(|value| !value.is_empty());

        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO localities (display_name, name_key, country, state, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                display_name,
                normalize_key(display_name),
                country,
                state,
                db::now_timestamp()
            ],
        )?;
        let id = conn.last_insert_rowid();
        info!(locality_id = id, display_name, country, "locality created");
        locality_by_id(&conn, id)?
            .ok_or_else(|| AppError::Config(format!("locality {id} missing after insert")))
    }

    pub fn locality(&self, id: i64) -> AppResult<Option<Locality>> {
        let conn = self.db.lock();
        locality_by_id(&conn, id)
    }

    pub fn find_locality_by_name(
        &self,
        name: &str,
        country: Option<&str>,
    ) -> AppResult<Option<Locality>> {
        let country = country.map(|value| value.trim().to_lowercase());
        let conn = self.db.lock();
        conn.query_row(
            "SELECT id, display_name, country, state FROM localities
            WHERE name_key = ?1 AND (?2 IS NULL OR country = ?2)
            ORDER BY id ASC LIMIT 1",
            params![normalize_key(name), country],
            locality_from_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn localities_in_country(&self, country: &str) -> AppResult<Vec<Locality>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, display_name, country, state FROM localities
            WHERE country = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([country.trim().to_lowercase()], locality_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn locality_cache_entry(
        &self,
        search: &str,
        country: Option<&str>,
    ) -> AppResult<Option<LocalityCacheEntry>> {
        let conn = self.db.lock();
        locality_cache_entry_in(&conn, search, country)
    }

    /// First write wins; a later call for the same key returns the stored entry
    /// untouched.
    pub fn record_locality_resolution(
        &self,
        search: &str,
        country: Option<&str>,
        resolved: Option<&Locality>,
    ) -> AppResult<LocalityCacheEntry> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO locality_cache
                (search_key, country_key, search_string, country, locality_id, display_name, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(search_key, country_key) DO NOTHING",
            params![
                normalize_key(search),
                country_key(country),
                search.trim(),
                country.map(|value| value.trim().to_lowercase()),
                resolved.map(|locality| locality.id),
                resolved.map(|locality| locality.display_name.as_str()),
                db::now_timestamp()
            ],
        )?;
        locality_cache_entry_in(&conn, search, country)?.ok_or_else(|| {
            AppError::CacheInvariant(format!("locality cache entry for {search:?} not readable"))
        })
    }

    pub fn place_cache_entry(
        &self,
        name: &str,
        locality: &LocalityRef,
    ) -> AppResult<Option<PlaceIdCacheEntry>> {
        let conn = self.db.lock();
        conn.query_row(
            "SELECT restaurant_name, locality_key, place_id FROM place_id_cache
            WHERE name_key = ?1 AND locality_key = ?2",
            params![normalize_key(name), locality.key()],
            |row| {
                Ok(PlaceIdCacheEntry {
                    restaurant_name: row.get(0)?,
                    locality_key: row.get(1)?,
                    place_id: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn resolve_place_alias(&self, place_id: &str) -> AppResult<String> {
        let conn = self.db.lock();
        resolve_alias_in(&conn, place_id)
    }

    pub fn restaurant(&self, id: i64) -> AppResult<Option<CanonicalRestaurant>> {
        let conn = self.db.lock();
        restaurant_by_id(&conn, id)
    }

    pub fn restaurant_by_place_id(&self, place_id: &str) -> AppResult<Option<CanonicalRestaurant>> {
        let conn = self.db.lock();
        restaurant_by_place_id_in(&conn, place_id)
    }

    /// Lookup by (name, locality), following recorded merges when the
    /// original record was folded into another one.
    pub fn restaurant_by_identity(
        &self,
        name: &str,
        locality: &LocalityRef,
    ) -> AppResult<Option<CanonicalRestaurant>> {
        let conn = self.db.lock();
        restaurant_by_identity_in(&conn, &normalize_key(name), &locality.key())
    }

    /// Writes the cache entry for a completed external lookup and binds the
    /// key to a canonical restaurant in the same transaction.
    pub fn record_lookup_and_bind(
        &self,
        name: &str,
        locality: &LocalityRef,
        place_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> AppResult<Binding> {
        let name = name.trim();
        let name_key = normalize_key(name);
        let locality_key = locality.key();
        let at = format_timestamp(now);

        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO place_id_cache
                (name_key, locality_key, restaurant_name, locality_id, place_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(name_key, locality_key) DO NOTHING",
            params![
                name_key,
                locality_key,
                name,
                locality.locality_id(),
                place_id,
                at
            ],
        )?;

        let binding = match place_id {
            Some(place_id) => {
                let current = resolve_alias_in(&tx, place_id)?;
                match restaurant_by_place_id_in(&tx, &current)? {
                    Some(restaurant) => Binding {
                        restaurant,
                        outcome: BindOutcome::ExistingByPlace,
                    },
                    None => match restaurant_by_identity_in(&tx, &name_key, &locality_key)? {
                        Some(existing) if existing.place_id.is_none() => {
                            tx.execute(
                                "UPDATE restaurants SET place_id = ?2, place_checked_at = ?3, updated_at = ?3
                                WHERE id = ?1",
                                params![existing.id, current, at],
                            )?;
                            Binding {
                                restaurant: require_restaurant(&tx, existing.id)?,
                                outcome: BindOutcome::ExistingByName,
                            }
                        }
                        _ => Binding {
                            restaurant: create_restaurant_in(
                                &tx,
                                name,
                                locality,
                                Some(&current),
                                &at,
                            )?,
                            outcome: BindOutcome::Created,
                        },
                    },
                }
            }
            None => match restaurant_by_identity_in(&tx, &name_key, &locality_key)? {
                Some(restaurant) => Binding {
                    restaurant,
                    outcome: BindOutcome::ExistingByName,
                },
                None => Binding {
                    restaurant: create_restaurant_in(&tx, name, locality, None, &at)?,
                    outcome: BindOutcome::Created,
                },
            },
        };
        tx.commit()?;
        Ok(binding)
    }

    /// Fills gaps with the newly observed values; known values are only
    /// replaced by other known values.
    pub fn merge_enrichment(
        &self,
        restaurant_id: i64,
        enrichment: &Enrichment,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        if enrichment.is_empty() {
            return Ok(());
        }
        let conn = self.db.lock();
        apply_enrichment_in(&conn, restaurant_id, enrichment, &format_timestamp(now))
    }

    pub fn set_cuisine_if_missing(
        &self,
        restaurant_id: i64,
        cuisine: &str,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let conn = self.db.lock();
        let changed = conn.execute(
            "UPDATE restaurants SET cuisine = ?2, updated_at = ?3
            WHERE id = ?1 AND cuisine IS NULL",
            params![restaurant_id, cuisine, format_timestamp(now)],
        )?;
        Ok(changed > 0)
    }

    pub fn restaurants_missing_cuisine(&self) -> AppResult<Vec<CanonicalRestaurant>> {
        let conn = self.db.lock();
        let sql = format!(
            "SELECT {RESTAURANT_COLUMNS} FROM restaurants
            WHERE deleted_at IS NULL AND cuisine IS NULL ORDER BY id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], restaurant_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn soft_delete_restaurant(&self, restaurant_id: i64, now: DateTime<Utc>) -> AppResult<()> {
        let conn = self.db.lock();
        let changed = conn.execute(
            "UPDATE restaurants SET deleted_at = ?2, updated_at = ?2
            WHERE id = ?1 AND deleted_at IS NULL",
            params![restaurant_id, format_timestamp(now)],
        )?;
        if changed == 0 {
            return Err(AppError::Config(format!(
                "restaurant {restaurant_id} not found or already deleted"
            )));
        }
        Ok(())
    }

    pub fn restaurants_due_for_place_check(
        &self,
        cutoff: DateTime<Utc>,
    ) -> AppResult<Vec<CanonicalRestaurant>> {
        let conn = self.db.lock();
        let sql = format!(
            "SELECT {RESTAURANT_COLUMNS} FROM restaurants
            WHERE deleted_at IS NULL AND place_id IS NOT NULL
                AND (place_checked_at IS NULL OR place_checked_at < ?1)
            ORDER BY id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([format_timestamp(cutoff)], restaurant_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn stamp_place_check(&self, restaurant_id: i64, now: DateTime<Utc>) -> AppResult<()> {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE restaurants SET place_checked_at = ?2 WHERE id = ?1",
            params![restaurant_id, format_timestamp(now)],
        )?;
        Ok(())
    }

    /// Moves a restaurant from `old` to `new` upstream id. When `new` already
    /// belongs to another restaurant, that one is kept and this one is merged
    /// into it.
    pub fn retarget_place_id(
        &self,
        restaurant_id: i64,
        old_place_id: &str,
        new_place_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<PlaceRetarget> {
        let at = format_timestamp(now);
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        let outcome = match restaurant_by_place_id_in(&tx, new_place_id)? {
            Some(owner) if owner.id != restaurant_id => {
                merge_in_tx(&tx, owner.id, restaurant_id, &at)?;
                PlaceRetarget::Merged { kept_id: owner.id }
            }
            _ => {
                tx.execute(
                    "UPDATE restaurants SET place_id = ?2, place_checked_at = ?3, updated_at = ?3
                    WHERE id = ?1",
                    params![restaurant_id, new_place_id, at],
                )?;
                record_alias_in(&tx, old_place_id, new_place_id, &at)?;
                PlaceRetarget::Updated
            }
        };
        tx.commit()?;
        Ok(outcome)
    }

    /// Folds `redundant_id` into `kept_id`: every association and award moves
    /// over (duplicates collapse), enrichment gaps are filled, the merge is
    /// recorded and the redundant record is removed. All or nothing.
    pub fn merge_restaurants(
        &self,
        kept_id: i64,
        redundant_id: i64,
        now: DateTime<Utc>,
    ) -> AppResult<MergeSummary> {
        if kept_id == redundant_id {
            return Err(AppError::Config(format!(
                "cannot merge restaurant {kept_id} into itself"
            )));
        }
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let summary = merge_in_tx(&tx, kept_id, redundant_id, &format_timestamp(now))?;
        tx.commit()?;
        Ok(summary)
    }

    pub fn merged_into(&self, redundant_id: i64) -> AppResult<Option<i64>> {
        let conn = self.db.lock();
        conn.query_row(
            "SELECT kept_id FROM restaurant_merges WHERE redundant_id = ?1",
            [redundant_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(AppError::from)
    }

    /// Registers a document; registering a known url returns the stored one.
    pub fn create_document(
        &self,
        url: &str,
        kind: DocumentKind,
        locality_id: Option<i64>,
    ) -> AppResult<SourceDocument> {
        let url = url.trim();
        if url.is_empty() {
            return Err(AppError::Config("document url cannot be empty".into()));
        }
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO source_documents (url, kind, locality_id, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(url) DO NOTHING",
            params![url, kind.as_tag(), locality_id, db::now_timestamp()],
        )?;
        document_by_url_in(&conn, url)?
            .ok_or_else(|| AppError::Config(format!("document {url} missing after insert")))
    }

    pub fn document(&self, id: i64) -> AppResult<Option<SourceDocument>> {
        let conn = self.db.lock();
        let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM source_documents WHERE id = ?1");
        conn.query_row(&sql, [id], document_from_row)
            .optional()
            .map_err(AppError::from)
    }

    pub fn document_by_url(&self, url: &str) -> AppResult<Option<SourceDocument>> {
        let conn = self.db.lock();
        document_by_url_in(&conn, url.trim())
    }

    /// Documents never refreshed or last refreshed before `cutoff`.
    pub fn stale_documents(&self, cutoff: DateTime<Utc>) -> AppResult<Vec<SourceDocument>> {
        let conn = self.db.lock();
        let sql = format!(
            "SELECT {DOCUMENT_COLUMNS} FROM source_documents
            WHERE refreshed_at IS NULL OR refreshed_at < ?1
            ORDER BY id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([format_timestamp(cutoff)], document_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn mark_document_refreshed(&self, document_id: i64, at: DateTime<Utc>) -> AppResult<()> {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE source_documents SET refreshed_at = ?2 WHERE id = ?1",
            params![document_id, format_timestamp(at)],
        )?;
        Ok(())
    }

    /// Stores metadata fields the document does not have yet.
    pub fn fill_document_metadata(&self, document_id: i64, metadata: &OgMetadata) -> AppResult<()> {
        if metadata.is_empty() {
            return Ok(());
        }
        let conn = self.db.lock();
        conn.execute(
            "UPDATE source_documents SET
                title = COALESCE(title, ?2),
                description = COALESCE(description, ?3),
                image_url = COALESCE(image_url, ?4),
                site_name = COALESCE(site_name, ?5)
            WHERE id = ?1",
            params![
                document_id,
                metadata.title,
                metadata.description,
                metadata.image,
                metadata.site_name
            ],
        )?;
        Ok(())
    }

    pub fn upsert_association(
        &self,
        restaurant_id: i64,
        document_id: i64,
        description: Option<&str>,
        url: Option<&str>,
        now: DateTime<Utc>,
    ) -> AppResult<AssociationChange> {
        let at = format_timestamp(now);
        let conn = self.db.lock();
        let existing: Option<(i64, Option<String>)> = conn
            .query_row(
                "SELECT id, retracted_at FROM source_associations
                WHERE restaurant_id = ?1 AND document_id = ?2",
                params![restaurant_id, document_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match existing {
            None => {
                conn.execute(
                    "INSERT INTO source_associations
                        (restaurant_id, document_id, description, url, observed_at)
                    VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![restaurant_id, document_id, description, url, at],
                )?;
                Ok(AssociationChange::Created)
            }
            Some((id, retracted_at)) => {
                conn.execute(
                    "UPDATE source_associations SET
                        description = COALESCE(?2, description),
                        url = COALESCE(?3, url),
                        observed_at = ?4,
                        retracted_at = NULL
                    WHERE id = ?1",
                    params![id, description, url, at],
                )?;
                if retracted_at.is_some() {
                    Ok(AssociationChange::Revived)
                } else {
                    Ok(AssociationChange::Refreshed)
                }
            }
        }
    }

    pub fn upsert_award(
        &self,
        restaurant_id: i64,
        document_id: i64,
        award: &AwardObservation,
        now: DateTime<Utc>,
    ) -> AppResult<AssociationChange> {
        let at = format_timestamp(now);
        let conn = self.db.lock();
        let existing: Option<(i64, Option<String>)> = conn
            .query_row(
                "SELECT id, retracted_at FROM awards
                WHERE restaurant_id = ?1 AND document_id = ?2 AND award_type = ?3 AND year IS ?4",
                params![restaurant_id, document_id, award.award_type, award.year],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match existing {
            None => {
                conn.execute(
                    "INSERT INTO awards
                        (restaurant_id, document_id, source, award_type, year, chef, url, observed_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        restaurant_id,
                        document_id,
                        award.source.as_str(),
                        award.award_type,
                        award.year,
                        award.chef,
                        award.url,
                        at
                    ],
                )?;
                Ok(AssociationChange::Created)
            }
            Some((id, retracted_at)) => {
                conn.execute(
                    "UPDATE awards SET
                        chef = COALESCE(?2, chef),
                        url = COALESCE(?3, url),
                        observed_at = ?4,
                        retracted_at = NULL
                    WHERE id = ?1",
                    params![id, award.chef, award.url, at],
                )?;
                if retracted_at.is_some() {
                    Ok(AssociationChange::Revived)
                } else {
                    Ok(AssociationChange::Refreshed)
                }
            }
        }
    }

    /// Retracts every live association and award of the document that was
    /// not re-observed at or after `now`.
    pub fn tombstone_unconfirmed(
        &self,
        document_id: i64,
        now: DateTime<Utc>,
    ) -> AppResult<TombstoneCounts> {
        let at = format_timestamp(now);
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let associations = tx.execute(
            "UPDATE source_associations SET retracted_at = ?2
            WHERE document_id = ?1 AND retracted_at IS NULL AND observed_at < ?2",
            params![document_id, at],
        )?;
        let awards = tx.execute(
            "UPDATE awards SET retracted_at = ?2
            WHERE document_id = ?1 AND retracted_at IS NULL AND observed_at < ?2",
            params![document_id, at],
        )?;
        tx.commit()?;
        Ok(TombstoneCounts {
            associations,
            awards,
        })
    }

    pub fn associations_for_document(&self, document_id: i64) -> AppResult<Vec<SourceAssociation>> {
        let conn = self.db.lock();
        associations_where(&conn, "document_id", document_id)
    }

    pub fn associations_for_restaurant(
        &self,
        restaurant_id: i64,
    ) -> AppResult<Vec<SourceAssociation>> {
        let conn = self.db.lock();
        associations_where(&conn, "restaurant_id", restaurant_id)
    }

    pub fn awards_for_restaurant(&self, restaurant_id: i64) -> AppResult<Vec<Award>> {
        let conn = self.db.lock();
        awards_where(&conn, "restaurant_id", restaurant_id)
    }

    /// Live restaurants of a locality with at least one live piece of
    /// evidence, in id order.
    pub fn ranking_evidence(&self, locality_id: i64) -> AppResult<Vec<RestaurantEvidence>> {
        let conn = self.db.lock();
        let sql = format!(
            "SELECT {RESTAURANT_COLUMNS} FROM restaurants r
            WHERE r.locality_id = ?1 AND r.deleted_at IS NULL
                AND (EXISTS (SELECT 1 FROM source_associations a
                        WHERE a.restaurant_id = r.id AND a.retracted_at IS NULL)
                    OR EXISTS (SELECT 1 FROM awards w
                        WHERE w.restaurant_id = r.id AND w.retracted_at IS NULL))
            ORDER BY r.id ASC"
        );
        let restaurants = {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([locality_id], restaurant_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut article_stmt = conn.prepare(
            "SELECT COUNT(DISTINCT a.document_id) FROM source_associations a
            JOIN source_documents d ON d.id = a.document_id
            WHERE a.restaurant_id = ?1 AND a.retracted_at IS NULL AND d.kind = 'article'",
        )?;
        let mut award_stmt = conn.prepare(
            "SELECT source, award_type FROM awards
            WHERE restaurant_id = ?1 AND retracted_at IS NULL ORDER BY id ASC",
        )?;

        let mut evidence = Vec::with_capacity(restaurants.len());
        for restaurant in restaurants {
            let live_articles: i64 =
                article_stmt.query_row([restaurant.id], |row| row.get(0))?;
            let awards = award_stmt
                .query_map([restaurant.id], |row| {
                    let source: String = row.get(0)?;
                    let award_type: String = row.get(1)?;
                    Ok((source, award_type))
                })?
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .map(|(source, award_type)| {
                    Ok(AwardEvidence {
                        source: AwardSource::parse(&source)?,
                        award_type,
                    })
                })
                .collect::<AppResult<Vec<_>>>()?;
            evidence.push(RestaurantEvidence {
                restaurant,
                live_articles: live_articles.max(0) as usize,
                awards,
            });
        }
        Ok(evidence)
    }

    pub fn summary(&self) -> AppResult<StoreSummary> {
        let conn = self.db.lock();
        let count = |sql: &str| -> AppResult<i64> {
            conn.query_row(sql, [], |row| row.get(0))
                .map_err(AppError::from)
        };
        Ok(StoreSummary {
            localities: count("SELECT COUNT(*) FROM localities")?,
            restaurants: count("SELECT COUNT(*) FROM restaurants WHERE deleted_at IS NULL")?,
            documents: count("SELECT COUNT(*) FROM source_documents")?,
            live_associations: count(
                "SELECT COUNT(*) FROM source_associations WHERE retracted_at IS NULL",
            )?,
            retracted_associations: count(
                "SELECT COUNT(*) FROM source_associations WHERE retracted_at IS NOT NULL",
            )?,
            live_awards: count("SELECT COUNT(*) FROM awards WHERE retracted_at IS NULL")?,
        })
    }
}

fn country_key(country: Option<&str>) -> String {
    country
        .map(|value| value.trim().to_lowercase())
        .unwrap_or_default()
}

fn locality_by_id(conn: &Connection, id: i64) -> AppResult<Option<Locality>> {
    conn.query_row(
        "SELECT id, display_name, country, state FROM localities WHERE id = ?1",
        [id],
        locality_from_row,
    )
    .optional()
    .map_err(AppError::from)
}

fn locality_cache_entry_in(
    conn: &Connection,
    search: &str,
    country: Option<&str>,
) -> AppResult<Option<LocalityCacheEntry>> {
    conn.query_row(
        "SELECT search_string, country, locality_id, display_name FROM locality_cache
        WHERE search_key = ?1 AND country_key = ?2",
        params![normalize_key(search), country_key(country)],
        |row| {
            Ok(LocalityCacheEntry {
                search_string: row.get(0)?,
                country: row.get(1)?,
                locality_id: row.get(2)?,
                display_name: row.get(3)?,
            })
        },
    )
    .optional()
    .map_err(AppError::from)
}

fn resolve_alias_in(conn: &Connection, place_id: &str) -> AppResult<String> {
    let mut current = place_id.to_string();
    for _ in 0..MAX_ALIAS_HOPS {
        let next: Option<String> = conn
            .query_row(
                "SELECT new_place_id FROM place_id_aliases WHERE old_place_id = ?1",
                [&current],
                |row| row.get(0),
            )
            .optional()?;
        match next {
            Some(next) if next != current => current = next,
            _ => break,
        }
    }
    Ok(current)
}

fn record_alias_in(conn: &Connection, old: &str, new: &str, at: &str) -> AppResult<()> {
    if old == new {
        return Ok(());
    }
    // `new` is current again, so any alias pointing away from it is stale.
    conn.execute("DELETE FROM place_id_aliases WHERE old_place_id = ?1", [new])?;
    conn.execute(
        "INSERT INTO place_id_aliases (old_place_id, new_place_id, created_at)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(old_place_id) DO UPDATE SET new_place_id = excluded.new_place_id",
        params![old, new, at],
    )?;
    debug!(old_place_id = old, new_place_id = new, "place id alias recorded");
    Ok(())
}

fn restaurant_by_id(conn: &Connection, id: i64) -> AppResult<Option<CanonicalRestaurant>> {
    let sql = format!("SELECT {RESTAURANT_COLUMNS} FROM restaurants WHERE id = ?1");
    conn.query_row(&sql, [id], restaurant_from_row)
        .optional()
        .map_err(AppError::from)
}

fn require_restaurant(conn: &Connection, id: i64) -> AppResult<CanonicalRestaurant> {
    restaurant_by_id(conn, id)?
        .ok_or_else(|| AppError::CacheInvariant(format!("restaurant {id} disappeared")))
}

fn restaurant_by_place_id_in(
    conn: &Connection,
    place_id: &str,
) -> AppResult<Option<CanonicalRestaurant>> {
    let sql = format!("SELECT {RESTAURANT_COLUMNS} FROM restaurants WHERE place_id = ?1");
    conn.query_row(&sql, [place_id], restaurant_from_row)
        .optional()
        .map_err(AppError::from)
}

fn restaurant_by_identity_in(
    conn: &Connection,
    name_key: &str,
    locality_key: &str,
) -> AppResult<Option<CanonicalRestaurant>> {
    let sql = format!(
        "SELECT {RESTAURANT_COLUMNS} FROM restaurants
        WHERE name_key = ?1 AND locality_key = ?2
        ORDER BY id ASC LIMIT 1"
    );
    if let Some(found) = conn
        .query_row(&sql, params![name_key, locality_key], restaurant_from_row)
        .optional()?
    {
        return Ok(Some(found));
    }

    let kept: Option<i64> = conn
        .query_row(
            "SELECT kept_id FROM restaurant_merges
            WHERE name_key = ?1 AND locality_key = ?2
            ORDER BY merged_at DESC LIMIT 1",
            params![name_key, locality_key],
            |row| row.get(0),
        )
        .optional()?;
    match kept {
        Some(id) => restaurant_by_id(conn, id),
        None => Ok(None),
    }
}

fn create_restaurant_in(
    conn: &Connection,
    name: &str,
    locality: &LocalityRef,
    place_id: Option<&str>,
    at: &str,
) -> AppResult<CanonicalRestaurant> {
    let locality_text = match locality {
        LocalityRef::Canonical(_) => None,
        LocalityRef::Freeform(text) => Some(text.trim()),
    };
    conn.execute(
        "INSERT INTO restaurants
            (name, name_key, locality_id, locality_text, locality_key, place_id,
             place_checked_at, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
        params![
            name,
            normalize_key(name),
            locality.locality_id(),
            locality_text,
            locality.key(),
            place_id,
            place_id.map(|_| at),
            at
        ],
    )?;
    let id = conn.last_insert_rowid();
    info!(restaurant_id = id, name, place_id, "canonical restaurant created");
    require_restaurant(conn, id)
}

fn apply_enrichment_in(
    conn: &Connection,
    restaurant_id: i64,
    enrichment: &Enrichment,
    at: &str,
) -> AppResult<()> {
    conn.execute(
        "UPDATE restaurants SET
            cuisine = COALESCE(?2, cuisine),
            chef = COALESCE(?3, chef),
            price_tier = COALESCE(?4, price_tier),
            latitude = COALESCE(?5, latitude),
            longitude = COALESCE(?6, longitude),
            website = COALESCE(?7, website),
            phone = COALESCE(?8, phone),
            address = COALESCE(?9, address),
            reservation_url = COALESCE(?10, reservation_url),
            social_url = COALESCE(?11, social_url),
            updated_at = ?12
        WHERE id = ?1",
        params![
            restaurant_id,
            enrichment.cuisine,
            enrichment.chef,
            enrichment.price_tier.map(|tier| tier.get() as i64),
            enrichment.latitude,
            enrichment.longitude,
            enrichment.website,
            enrichment.phone,
            enrichment.address,
            enrichment.reservation_url,
            enrichment.social_url,
            at
        ],
    )?;
    Ok(())
}

fn merge_in_tx(
    conn: &Connection,
    kept_id: i64,
    redundant_id: i64,
    at: &str,
) -> AppResult<MergeSummary> {
    let kept = require_restaurant(conn, kept_id)?;
    let redundant = require_restaurant(conn, redundant_id)?;
    let mut summary = MergeSummary::default();

    for association in associations_where(conn, "restaurant_id", redundant_id)? {
        let twin: Option<(i64, Option<String>)> = conn
            .query_row(
                "SELECT id, retracted_at FROM source_associations
                WHERE restaurant_id = ?1 AND document_id = ?2",
                params![kept_id, association.document_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match twin {
            None => {
                conn.execute(
                    "UPDATE source_associations SET restaurant_id = ?2 WHERE id = ?1",
                    params![association.id, kept_id],
                )?;
                summary.moved_associations += 1;
            }
            Some((twin_id, twin_retracted)) => {
                let retracted_at = if association.is_live() || twin_retracted.is_none() {
                    None
                } else {
                    twin_retracted
                };
                conn.execute(
                    "UPDATE source_associations SET
                        description = COALESCE(description, ?2),
                        url = COALESCE(url, ?3),
                        observed_at = MAX(observed_at, ?4),
                        retracted_at = ?5
                    WHERE id = ?1",
                    params![
                        twin_id,
                        association.description,
                        association.url,
                        format_timestamp(association.observed_at),
                        retracted_at
                    ],
                )?;
                conn.execute(
                    "DELETE FROM source_associations WHERE id = ?1",
                    [association.id],
                )?;
                summary.collapsed_associations += 1;
            }
        }
    }

    for award in awards_where(conn, "restaurant_id", redundant_id)? {
        let twin: Option<(i64, Option<String>)> = conn
            .query_row(
                "SELECT id, retracted_at FROM awards
                WHERE restaurant_id = ?1 AND document_id = ?2 AND award_type = ?3 AND year IS ?4",
                params![kept_id, award.document_id, award.award_type, award.year],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match twin {
            None => {
                conn.execute(
                    "UPDATE awards SET restaurant_id = ?2 WHERE id = ?1",
                    params![award.id, kept_id],
                )?;
                summary.moved_awards += 1;
            }
            Some((twin_id, twin_retracted)) => {
                let retracted_at = if award.retracted_at.is_none() || twin_retracted.is_none() {
                    None
                } else {
                    twin_retracted
                };
                conn.execute(
                    "UPDATE awards SET
                        chef = COALESCE(chef, ?2),
                        url = COALESCE(url, ?3),
                        observed_at = MAX(observed_at, ?4),
                        retracted_at = ?5
                    WHERE id = ?1",
                    params![
                        twin_id,
                        award.chef,
                        award.url,
                        format_timestamp(award.observed_at),
                        retracted_at
                    ],
                )?;
                conn.execute("DELETE FROM awards WHERE id = ?1", [award.id])?;
                summary.collapsed_awards += 1;
            }
        }
    }

    let merged = redundant.enrichment.overlay(&kept.enrichment);
    apply_enrichment_in(conn, kept_id, &merged, at)?;

    if let Some(redundant_place) = redundant.place_id.as_deref() {
        conn.execute(
            "UPDATE restaurants SET place_id = NULL WHERE id = ?1",
            [redundant_id],
        )?;
        match kept.place_id.as_deref() {
            Some(kept_place) => record_alias_in(conn, redundant_place, kept_place, at)?,
            None => {
                conn.execute(
                    "UPDATE restaurants SET place_id = ?2, place_checked_at = ?3 WHERE id = ?1",
                    params![kept_id, redundant_place, at],
                )?;
            }
        }
    }

    conn.execute(
        "INSERT INTO restaurant_merges
            (redundant_id, kept_id, name_key, locality_key, place_id, merged_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            redundant_id,
            kept_id,
            normalize_key(&redundant.name),
            redundant.locality_key,
            redundant.place_id,
            at
        ],
    )?;
    conn.execute(
        "UPDATE restaurant_merges SET kept_id = ?2 WHERE kept_id = ?1",
        params![redundant_id, kept_id],
    )?;
    conn.execute("DELETE FROM restaurants WHERE id = ?1", [redundant_id])?;

    info!(
        kept_id,
        redundant_id,
        moved_associations = summary.moved_associations,
        moved_awards = summary.moved_awards,
        "restaurants merged"
    );
    Ok(summary)
}

fn document_by_url_in(conn: &Connection, url: &str) -> AppResult<Option<SourceDocument>> {
    let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM source_documents WHERE url = ?1");
    conn.query_row(&sql, [url], document_from_row)
        .optional()
        .map_err(AppError::from)
}

fn associations_where(
    conn: &Connection,
    column: &str,
    id: i64,
) -> AppResult<Vec<SourceAssociation>> {
    let sql = format!(
        "SELECT {ASSOCIATION_COLUMNS} FROM source_associations WHERE {column} = ?1 ORDER BY id ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([id], association_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn awards_where(conn: &Connection, column: &str, id: i64) -> AppResult<Vec<Award>> {
    let sql = format!("SELECT {AWARD_COLUMNS} FROM awards WHERE {column} = ?1 ORDER BY id ASC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([id], award_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let value: Option<String> = row.get(idx)?;
    value
        .map(|text| {
            DateTime::parse_from_rfc3339(&text)
                .map(|at| at.with_timezone(&Utc))
                .map_err(|err| conversion_error(idx, err))
        })
        .transpose()
}

fn required_timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    timestamp_at(row, idx)?
        .ok_or_else(|| rusqlite::Error::InvalidColumnType(idx, "timestamp".into(), Type::Null))
}

fn locality_from_row(row: &Row<'_>) -> rusqlite::Result<Locality> {
    Ok(Locality {
        id: row.get(0)?,
        display_name: row.get(1)?,
        country: row.get(2)?,
        state: row.get(3)?,
    })
}

fn restaurant_from_row(row: &Row<'_>) -> rusqlite::Result<CanonicalRestaurant> {
    let price_tier: Option<i64> = row.get(8)?;
    Ok(CanonicalRestaurant {
        id: row.get(0)?,
        name: row.get(1)?,
        locality_id: row.get(2)?,
        locality_text: row.get(3)?,
        locality_key: row.get(4)?,
        place_id: row.get(5)?,
        enrichment: Enrichment {
            cuisine: row.get(6)?,
            chef: row.get(7)?,
            price_tier: price_tier
                .and_then(|tier| usize::try_from(tier).ok())
                .and_then(|tier| PriceTier::from_count(tier).ok().flatten()),
            latitude: row.get(9)?,
            longitude: row.get(10)?,
            website: row.get(11)?,
            phone: row.get(12)?,
            address: row.get(13)?,
            reservation_url: row.get(14)?,
            social_url: row.get(15)?,
        },
        place_checked_at: timestamp_at(row, 16)?,
        deleted_at: timestamp_at(row, 17)?,
    })
}

fn document_from_row(row: &Row<'_>) -> rusqlite::Result<SourceDocument> {
    let kind: String = row.get(2)?;
    Ok(SourceDocument {
        id: row.get(0)?,
        url: row.get(1)?,
        kind: DocumentKind::parse(&kind).map_err(|err| conversion_error(2, err))?,
        locality_id: row.get(3)?,
        metadata: OgMetadata {
            title: row.get(4)?,
            description: row.get(5)?,
            image: row.get(6)?,
            site_name: row.get(7)?,
        },
        refreshed_at: timestamp_at(row, 8)?,
    })
}

fn association_from_row(row: &Row<'_>) -> rusqlite::Result<SourceAssociation> {
    Ok(SourceAssociation {
        id: row.get(0)?,
        restaurant_id: row.get(1)?,
        document_id: row.get(2)?,
        description: row.get(3)?,
        url: row.get(4)?,
        observed_at: required_timestamp_at(row, 5)?,
        retracted_at: timestamp_at(row, 6)?,
    })
}

fn award_from_row(row: &Row<'_>) -> rusqlite::Result<Award> {
    let source: String = row.get(3)?;
    Ok(Award {
        id: row.get(0)?,
        restaurant_id: row.get(1)?,
        document_id: row.get(2)?,
        source: AwardSource::parse(&source).map_err(|err| conversion_error(3, err))?,
        award_type: row.get(4)?,
        year: row.get(5)?,
        chef: row.get(6)?,
        url: row.get(7)?,
        observed_at: required_timestamp_at(row, 8)?,
        retracted_at: timestamp_at(row, 9)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use tempfile::tempdir;

    use super::*;

    fn store() -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("store.db")).unwrap();
        (dir, store)
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap()
    }

    #[test]
    fn locality_cache_keeps_first_resolution() {
        let (_dir, store) = store();
        let la = store.create_locality("Los Angeles", "US", Some("CA")).unwrap();
        let first = store
            .record_locality_resolution("Silver Lake", Some("us"), Some(&la))
            .unwrap();
        let second = store
            .record_locality_resolution("silver lake", Some("US"), None)
            .unwrap();
        assert_eq!(first.locality_id, Some(la.id));
        assert_eq!(second, first);
        assert!(store
            .locality_cache_entry("Silver Lake", None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn binds_second_name_to_existing_place_owner() {
        let (_dir, store) = store();
        let la = store.create_locality("Los Angeles", "us", None).unwrap();
        let locality = LocalityRef::Canonical(la);
        let first = store
            .record_lookup_and_bind("Bub & Grandma's", &locality, Some("place-1"), at(1))
            .unwrap();
        let second = store
            .record_lookup_and_bind("Bub and Grandma's Bread", &locality, Some("place-1"), at(2))
            .unwrap();
        assert_eq!(first.outcome, BindOutcome::Created);
        assert_eq!(second.outcome, BindOutcome::ExistingByPlace);
        assert_eq!(first.restaurant.id, second.restaurant.id);
        assert_eq!(
            store
                .place_cache_entry("BUB AND GRANDMA'S BREAD", &locality)
                .unwrap()
                .unwrap()
                .place_id
                .as_deref(),
            Some("place-1")
        );
    }

    #[test]
    fn association_upsert_revives_tombstones_and_keeps_description() {
        let (_dir, store) = store();
        let doc = store
            .create_document("https://la.eater.com/maps/best", DocumentKind::Article, None)
            .unwrap();
        let place = LocalityRef::Freeform("Los Angeles".into());
        let restaurant = store
            .record_lookup_and_bind("Bavel", &place, None, at(1))
            .unwrap()
            .restaurant;

        let created = store
            .upsert_association(restaurant.id, doc.id, Some("Middle Eastern"), None, at(1))
            .unwrap();
        let swept = store.tombstone_unconfirmed(doc.id, at(2)).unwrap();
        let revived = store
            .upsert_association(restaurant.id, doc.id, None, Some("https://bavel.la"), at(3))
            .unwrap();

        assert_eq!(created, AssociationChange::Created);
        assert_eq!(swept.associations, 1);
        assert_eq!(revived, AssociationChange::Revived);
        let associations = store.associations_for_document(doc.id).unwrap();
        assert_eq!(associations.len(), 1);
        assert!(associations[0].is_live());
        assert_eq!(associations[0].description.as_deref(), Some("Middle Eastern"));
        assert_eq!(associations[0].url.as_deref(), Some("https://bavel.la"));
    }

    #[test]
    fn merge_moves_edges_and_records_alias() {
        let (_dir, store) = store();
        let place = LocalityRef::Freeform("Chicago".into());
        let kept = store
            .record_lookup_and_bind("Alinea", &place, Some("kept-place"), at(1))
            .unwrap()
            .restaurant;
        let redundant = store
            .record_lookup_and_bind("Alinea Restaurant", &place, Some("old-place"), at(1))
            .unwrap()
            .restaurant;
        let shared = store
            .create_document("https://www.eater.com/a", DocumentKind::Article, None)
            .unwrap();
        let only_redundant = store
            .create_document("https://www.eater.com/b", DocumentKind::Article, None)
            .unwrap();
        store
            .upsert_association(kept.id, shared.id, None, None, at(2))
            .unwrap();
        store
            .upsert_association(redundant.id, shared.id, Some("tasting menu"), None, at(2))
            .unwrap();
        store
            .upsert_association(redundant.id, only_redundant.id, None, None, at(2))
            .unwrap();
        store
            .merge_enrichment(
                redundant.id,
                &Enrichment {
                    chef: Some("Grant Achatz".into()),
                    ..Enrichment::default()
                },
                at(2),
            )
            .unwrap();

        let summary = store.merge_restaurants(kept.id, redundant.id, at(3)).unwrap();

        assert_eq!(summary.moved_associations, 1);
        assert_eq!(summary.collapsed_associations, 1);
        assert!(store.restaurant(redundant.id).unwrap().is_none());
        assert_eq!(store.merged_into(redundant.id).unwrap(), Some(kept.id));
        assert_eq!(store.resolve_place_alias("old-place").unwrap(), "kept-place");
        let associations = store.associations_for_restaurant(kept.id).unwrap();
        assert_eq!(associations.len(), 2);
        assert_eq!(associations[0].description.as_deref(), Some("tasting menu"));
        let merged = store.restaurant(kept.id).unwrap().unwrap();
        assert_eq!(merged.enrichment.chef.as_deref(), Some("Grant Achatz"));
        let by_old_name = store
            .restaurant_by_identity("Alinea Restaurant", &place)
            .unwrap()
            .unwrap();
        assert_eq!(by_old_name.id, kept.id);
    }

    #[test]
    fn retarget_rebinds_unowned_place_ids() {
        let (_dir, store) = store();
        let place = LocalityRef::Freeform("Austin".into());
        let restaurant = store
            .record_lookup_and_bind("Franklin Barbecue", &place, Some("v1"), at(1))
            .unwrap()
            .restaurant;
        let outcome = store
            .retarget_place_id(restaurant.id, "v1", "v2", at(2))
            .unwrap();
        assert_eq!(outcome, PlaceRetarget::Updated);
        assert_eq!(
            store.restaurant_by_place_id("v2").unwrap().unwrap().id,
            restaurant.id
        );
        assert_eq!(store.resolve_place_alias("v1").unwrap(), "v2");
        assert!(store
            .restaurants_due_for_place_check(at(2))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn summary_counts_live_rows() {
        let (_dir, store) = store();
        let place = LocalityRef::Freeform("Austin".into());
        let restaurant = store
            .record_lookup_and_bind("Suerte", &place, None, at(1))
            .unwrap()
            .restaurant;
        store.soft_delete_restaurant(restaurant.id, at(2)).unwrap();
        assert!(store.soft_delete_restaurant(restaurant.id, at(3)).is_err());
        let summary = store.summary().unwrap();
        assert_eq!(summary.restaurants, 0);
        assert_eq!(summary.localities, 0);
    }
}
