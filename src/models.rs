use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{AppError, AppResult};

/// Lowercased, trimmed, single-spaced form used for every case-insensitive key.
pub fn normalize_key(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Locality {
    pub id: i64,
    pub display_name: String,
    pub country: String,
    pub state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalityCacheEntry {
    pub search_string: String,
    pub country: Option<String>,
    pub locality_id: Option<i64>,
    pub display_name: Option<String>,
}

/// The locality half of a restaurant identity key: either a canonical
/// locality or the freeform place string when none could be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalityRef {
    Canonical(Locality),
    Freeform(String),
}

impl LocalityRef {
    pub fn key(&self) -> String {
        match self {
            LocalityRef::Canonical(locality) => format!("id:{}", locality.id),
            LocalityRef::Freeform(text) => format!("text:{}", normalize_key(text)),
        }
    }

    pub fn display_name(&self) -> &str {
        match self {
            LocalityRef::Canonical(locality) => &locality.display_name,
            LocalityRef::Freeform(text) => text.trim(),
        }
    }

    pub fn locality_id(&self) -> Option<i64> {
        match self {
            LocalityRef::Canonical(locality) => Some(locality.id),
            LocalityRef::Freeform(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceIdCacheEntry {
    pub restaurant_name: String,
    pub locality_key: String,
    pub place_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTier(u8);

impl PriceTier {
    pub const MAX: u8 = 4;

    /// `Ok(None)` for an absent indicator, `Err(count)` for a count no real
    /// price scale produces.
    pub fn from_count(count: usize) -> Result<Option<Self>, usize> {
        match count {
            0 => Ok(None),
            n if n <= Self::MAX as usize => Ok(Some(PriceTier(n as u8))),
            n => Err(n),
        }
    }

    pub fn get(&self) -> u8 {
        self.0
    }
}

/// Accumulative restaurant facts; a `None` never replaces a stored value.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Enrichment {
    pub cuisine: Option<String>,
    pub chef: Option<String>,
    pub price_tier: Option<PriceTier>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub website: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub reservation_url: Option<String>,
    pub social_url: Option<String>,
}

impl Enrichment {
    pub fn is_empty(&self) -> bool {
        self == &Enrichment::default()
    }

    /// Values from `newer` win where present, otherwise ours are kept.
    pub fn overlay(&self, newer: &Enrichment) -> Enrichment {
        Enrichment {
            cuisine: newer.cuisine.clone().or_else(|| self.cuisine.clone()),
            chef: newer.chef.clone().or_else(|| self.chef.clone()),
            price_tier: newer.price_tier.or(self.price_tier),
            latitude: newer.latitude.or(self.latitude),
            longitude: newer.longitude.or(self.longitude),
            website: newer.website.clone().or_else(|| self.website.clone()),
            phone: newer.phone.clone().or_else(|| self.phone.clone()),
            address: newer.address.clone().or_else(|| self.address.clone()),
            reservation_url: newer
                .reservation_url
                .clone()
                .or_else(|| self.reservation_url.clone()),
            social_url: newer.social_url.clone().or_else(|| self.social_url.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalRestaurant {
    pub id: i64,
    pub name: String,
    pub locality_id: Option<i64>,
    pub locality_text: Option<String>,
    pub locality_key: String,
    pub place_id: Option<String>,
    pub enrichment: Enrichment,
    pub place_checked_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AwardSource {
    JamesBeard,
    FiftyBest,
    Michelin,
}

impl AwardSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AwardSource::JamesBeard => "james_beard",
            AwardSource::FiftyBest => "fifty_best",
            AwardSource::Michelin => "michelin",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        match value.trim() {
            "james_beard" => Ok(AwardSource::JamesBeard),
            "fifty_best" => Ok(AwardSource::FiftyBest),
            "michelin" => Ok(AwardSource::Michelin),
            other => Err(AppError::Parse(format!("unknown award source: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MichelinDistinction {
    Guide,
    BibGourmand,
    OneStar,
    TwoStars,
    ThreeStars,
}

impl MichelinDistinction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MichelinDistinction::Guide => "GUIDE",
            MichelinDistinction::BibGourmand => "BIB_GOURMAND",
            MichelinDistinction::OneStar => "ONE_STAR",
            MichelinDistinction::TwoStars => "TWO_STARS",
            MichelinDistinction::ThreeStars => "THREE_STARS",
        }
    }

    pub fn from_stars(stars: usize) -> Option<Self> {
        match stars {
            1 => Some(MichelinDistinction::OneStar),
            2 => Some(MichelinDistinction::TwoStars),
            3 => Some(MichelinDistinction::ThreeStars),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DocumentKind {
    Article,
    AwardListing(AwardSource),
}

impl DocumentKind {
    pub fn as_tag(&self) -> &'static str {
        match self {
            DocumentKind::Article => "article",
            DocumentKind::AwardListing(source) => source.as_str(),
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        match value.trim() {
            "article" => Ok(DocumentKind::Article),
            other => AwardSource::parse(other).map(DocumentKind::AwardListing),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OgMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
    pub site_name: Option<String>,
}

impl OgMetadata {
    pub fn is_empty(&self) -> bool {
        self == &OgMetadata::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceDocument {
    pub id: i64,
    pub url: String,
    pub kind: DocumentKind,
    pub locality_id: Option<i64>,
    pub metadata: OgMetadata,
    pub refreshed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceAssociation {
    pub id: i64,
    pub restaurant_id: i64,
    pub document_id: i64,
    pub description: Option<String>,
    pub url: Option<String>,
    pub observed_at: DateTime<Utc>,
    pub retracted_at: Option<DateTime<Utc>>,
}

impl SourceAssociation {
    pub fn is_live(&self) -> bool {
        self.retracted_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AwardObservation {
    pub source: AwardSource,
    pub award_type: String,
    pub year: Option<i32>,
    pub chef: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Award {
    pub id: i64,
    pub restaurant_id: i64,
    pub document_id: i64,
    pub source: AwardSource,
    pub award_type: String,
    pub year: Option<i32>,
    pub chef: Option<String>,
    pub url: Option<String>,
    pub observed_at: DateTime<Utc>,
    pub retracted_at: Option<DateTime<Utc>>,
}

/// One restaurant as read off a page. Never persisted directly.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RawScrapedRecord {
    pub name: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub website: Option<String>,
    pub phone: Option<String>,
    pub price_tier: Option<PriceTier>,
    pub short_address: Option<String>,
    pub long_address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub reservation_url: Option<String>,
    pub social_url: Option<String>,
    pub cuisine: Option<String>,
    pub chef: Option<String>,
    pub locality: Option<String>,
    pub country: Option<String>,
    pub award: Option<AwardObservation>,
}

impl RawScrapedRecord {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn enrichment(&self) -> Enrichment {
        Enrichment {
            cuisine: self.cuisine.clone(),
            chef: self
                .chef
                .clone()
                .or_else(|| self.award.as_ref().and_then(|award| award.chef.clone())),
            price_tier: self.price_tier,
            latitude: self.latitude,
            longitude: self.longitude,
            website: self.website.clone(),
            phone: self.phone.clone(),
            address: self.long_address.clone().or_else(|| self.short_address.clone()),
            reservation_url: self.reservation_url.clone(),
            social_url: self.social_url.clone(),
        }
    }

    /// Stable digest of the record, used to refer to rejected records in the
    /// run journal without storing them.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        match serde_json::to_vec(self) {
            Ok(bytes) => hasher.update(&bytes),
            Err(_) => hasher.update(format!("{self:?}").as_bytes()),
        }
        STANDARD_NO_PAD.encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_keys_for_case_insensitive_matching() {
        assert_eq!(normalize_key("  Bub &  Grandma's "), "bub & grandma's");
        assert_eq!(normalize_key("LOS ANGELES"), "los angeles");
    }

    #[test]
    fn locality_refs_produce_distinct_keys() {
        let canonical = LocalityRef::Canonical(Locality {
            id: 7,
            display_name: "Los Angeles".into(),
            country: "us".into(),
            state: Some("CA".into()),
        });
        let freeform = LocalityRef::Freeform(" Santa  Monica, CA ".into());
        assert_eq!(canonical.key(), "id:7");
        assert_eq!(freeform.key(), "text:santa monica, ca");
        assert_eq!(freeform.display_name(), "Santa  Monica, CA");
        assert_eq!(canonical.locality_id(), Some(7));
        assert_eq!(freeform.locality_id(), None);
    }

    #[test]
    fn price_tier_rejects_impossible_counts() {
        assert_eq!(PriceTier::from_count(0), Ok(None));
        assert_eq!(PriceTier::from_count(4).unwrap().unwrap().get(), 4);
        assert_eq!(PriceTier::from_count(5), Err(5));
    }

    #[test]
    fn overlay_keeps_known_values() {
        let known = Enrichment {
            cuisine: Some("Sichuan".into()),
            phone: Some("555-0100".into()),
            ..Enrichment::default()
        };
        let newer = Enrichment {
            phone: Some("555-0199".into()),
            website: Some("https://example.com".into()),
            ..Enrichment::default()
        };
        let merged = known.overlay(&newer);
        assert_eq!(merged.cuisine.as_deref(), Some("Sichuan"));
        assert_eq!(merged.phone.as_deref(), Some("555-0199"));
        assert_eq!(merged.website.as_deref(), Some("https://example.com"));
    }

    #[test]
    fn fingerprint_is_stable_per_record() {
        let a = RawScrapedRecord::named("Bavel");
        let b = RawScrapedRecord::named("Bavel");
        let c = RawScrapedRecord::named("Bestia");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn document_kinds_round_trip_through_tags() {
        for kind in [
            DocumentKind::Article,
            DocumentKind::AwardListing(AwardSource::Michelin),
            DocumentKind::AwardListing(AwardSource::JamesBeard),
        ] {
            assert_eq!(DocumentKind::parse(kind.as_tag()).unwrap(), kind);
        }
        assert!(DocumentKind::parse("yelp").is_err());
    }
}
