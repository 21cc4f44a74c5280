use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::errors::{AppError, AppResult};
use crate::models::{CanonicalRestaurant, LocalityRef};
use crate::places::PlacesService;
use crate::store::{BindOutcome, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResolutionSource {
    /// Answered from the placeId cache, no external call.
    Cache,
    Lookup(BindOutcome),
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub restaurant: CanonicalRestaurant,
    pub source: ResolutionSource,
}

/// Turns a (name, locality) pair into the canonical restaurant it names.
#[derive(Clone)]
pub struct IdentityResolver {
    store: Store,
    places: PlacesService,
}

impl IdentityResolver {
    pub fn new(store: Store, places: PlacesService) -> Self {
        Self { store, places }
    }

    pub async fn resolve(
        &self,
        name: &str,
        locality: &LocalityRef,
        now: DateTime<Utc>,
    ) -> AppResult<Resolution> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::Parse("restaurant name cannot be empty".into()));
        }

        if let Some(entry) = self.store.place_cache_entry(name, locality)? {
            let restaurant = match entry.place_id.as_deref() {
                Some(place_id) => self.cached_place(name, locality, place_id)?,
                None => self.store.restaurant_by_identity(name, locality)?.ok_or_else(|| {
                    AppError::CacheInvariant(format!(
                        "{name:?} in {} is cached as unresolvable but has no restaurant",
                        locality.key()
                    ))
                })?,
            };
            debug!(name, locality = %locality.key(), restaurant_id = restaurant.id, "identity cache hit");
            return Ok(Resolution {
                restaurant,
                source: ResolutionSource::Cache,
            });
        }

        let query = format!("{name} {}", locality.display_name());
        let place_id = self.places.find_place(&query).await?;
        let binding = self
            .store
            .record_lookup_and_bind(name, locality, place_id.as_deref(), now)?;
        info!(
            name,
            locality = %locality.key(),
            place_id = ?place_id,
            restaurant_id = binding.restaurant.id,
            outcome = ?binding.outcome,
            "identity resolved"
        );
        Ok(Resolution {
            restaurant: binding.restaurant,
            source: ResolutionSource::Lookup(binding.outcome),
        })
    }

    fn cached_place(
        &self,
        name: &str,
        locality: &LocalityRef,
        place_id: &str,
    ) -> AppResult<CanonicalRestaurant> {
        let current = self.store.resolve_place_alias(place_id)?;
        self.store.restaurant_by_place_id(&current)?.ok_or_else(|| {
            AppError::CacheInvariant(format!(
                "{name:?} in {} is cached as {place_id} but no restaurant holds {current}",
                locality.key()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use tempfile::tempdir;

    use super::*;
    use crate::models::Locality;
    use crate::places::{PlaceLookup, PlaceRefresh};
    use crate::retry::RetryPolicy;

    struct FakePlaces {
        ids: HashMap<&'static str, &'static str>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl PlaceLookup for FakePlaces {
        async fn find_place(&self, query: &str) -> AppResult<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.ids.get(query).map(|id| id.to_string()))
        }

        async fn refresh_place(&self, _place_id: &str) -> AppResult<PlaceRefresh> {
            Ok(PlaceRefresh::Same)
        }
    }

    fn setup(dir: &std::path::Path) -> (Store, IdentityResolver, Arc<FakePlaces>, LocalityRef) {
        let store = Store::open(dir.join("identity.db")).unwrap();
        let chicago: Locality = store.create_locality("Chicago", "us", None).unwrap();
        let places = Arc::new(FakePlaces {
            ids: HashMap::from([
                ("Kasama Chicago", "ChIJkasama"),
                ("Bub & Grandma's Chicago", "ChIJbub"),
                ("Bub and Grandma's Bread Chicago", "ChIJbub"),
            ]),
            calls: AtomicU32::new(0),
        });
        let service = PlacesService::with_lookup(places.clone(), 1000, RetryPolicy::immediate(1));
        let resolver = IdentityResolver::new(store.clone(), service);
        (store, resolver, places, LocalityRef::Canonical(chicago))
    }

    #[tokio::test]
    async fn second_call_is_served_from_cache() {
        let dir = tempdir().unwrap();
        let (_, resolver, places, chicago) = setup(dir.path());
        let now = Utc::now();

        let first = resolver.resolve("Kasama", &chicago, now).await.unwrap();
        assert_eq!(first.source, ResolutionSource::Lookup(BindOutcome::Created));
        let second = resolver.resolve("  KASAMA ", &chicago, now).await.unwrap();
        assert_eq!(second.source, ResolutionSource::Cache);
        assert_eq!(first.restaurant.id, second.restaurant.id);
        assert_eq!(places.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_names_for_one_place_share_a_record() {
        let dir = tempdir().unwrap();
        let (store, resolver, _, chicago) = setup(dir.path());
        let now = Utc::now();

        let a = resolver.resolve("Bub & Grandma's", &chicago, now).await.unwrap();
        let b = resolver
            .resolve("Bub and Grandma's Bread", &chicago, now)
            .await
            .unwrap();
        assert_eq!(a.restaurant.id, b.restaurant.id);
        assert_eq!(b.source, ResolutionSource::Lookup(BindOutcome::ExistingByPlace));
        assert_eq!(store.summary().unwrap().restaurants, 1);
    }

    #[tokio::test]
    async fn unresolvable_names_are_cached_as_null() {
        let dir = tempdir().unwrap();
        let (store, resolver, places, chicago) = setup(dir.path());
        let now = Utc::now();

        let first = resolver.resolve("Pop-up Nobody Knows", &chicago, now).await.unwrap();
        assert_eq!(first.restaurant.place_id, None);
        let entry = store
            .place_cache_entry("pop-up nobody knows", &chicago)
            .unwrap()
            .unwrap();
        assert_eq!(entry.place_id, None);

        let again = resolver.resolve("Pop-up Nobody Knows", &chicago, now).await.unwrap();
        assert_eq!(again.restaurant.id, first.restaurant.id);
        assert_eq!(places.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cached_id_without_restaurant_halts() {
        let dir = tempdir().unwrap();
        let (store, resolver, _, chicago) = setup(dir.path());
        let now = Utc::now();
        let resolved = resolver.resolve("Kasama", &chicago, now).await.unwrap();
        {
            let handle = store.handle();
            let conn = handle.lock();
            conn.execute("DELETE FROM restaurants WHERE id = ?1", [resolved.restaurant.id])
                .unwrap();
        }
        let err = resolver.resolve("Kasama", &chicago, now).await.unwrap_err();
        assert!(matches!(err, AppError::CacheInvariant(_)));
        assert!(err.halts_run());
    }
}
