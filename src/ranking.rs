use std::cmp::Ordering;
use std::collections::HashMap;

use serde::Serialize;

use crate::models::{AwardSource, CanonicalRestaurant, MichelinDistinction};

/// Everything the ranking looks at for one restaurant.
#[derive(Debug, Clone, Serialize)]
pub struct RestaurantEvidence {
    pub restaurant: CanonicalRestaurant,
    /// Distinct article documents with a live association.
    pub live_articles: usize,
    pub awards: Vec<AwardEvidence>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AwardEvidence {
    pub source: AwardSource,
    pub award_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RankedRestaurant {
    pub restaurant: CanonicalRestaurant,
    pub score: f64,
    pub live_articles: usize,
}

const JAMES_BEARD_WEIGHT: f64 = 1.2;
const FIFTY_BEST_WEIGHT: f64 = 1.6;

fn michelin_weight(award_type: &str) -> f64 {
    match award_type {
        t if t == MichelinDistinction::ThreeStars.as_str() => 1.5,
        t if t == MichelinDistinction::TwoStars.as_str() => 1.4,
        t if t == MichelinDistinction::OneStar.as_str() => 1.3,
        t if t == MichelinDistinction::BibGourmand.as_str() => 1.1,
        _ => 1.0,
    }
}

pub fn award_weight(award: &AwardEvidence) -> f64 {
    match award.source {
        AwardSource::JamesBeard => JAMES_BEARD_WEIGHT,
        AwardSource::FiftyBest => FIFTY_BEST_WEIGHT,
        AwardSource::Michelin => michelin_weight(&award.award_type),
    }
}

/// Live article count plus one weight per award source; a source that
/// recognised the restaurant several times counts once, at its best award.
pub fn score(evidence: &RestaurantEvidence) -> f64 {
    let mut best: HashMap<AwardSource, f64> = HashMap::new();
    for award in &evidence.awards {
        let weight = award_weight(award);
        best.entry(award.source)
            .and_modify(|current| *current = current.max(weight))
            .or_insert(weight);
    }
    evidence.live_articles as f64 + best.values().sum::<f64>()
}

/// Highest score first; equal scores keep their input order.
pub fn rank(evidence: Vec<RestaurantEvidence>) -> Vec<RankedRestaurant> {
    let mut ranked: Vec<RankedRestaurant> = evidence
        .into_iter()
        .map(|item| RankedRestaurant {
            score: score(&item),
            live_articles: item.live_articles,
            restaurant: item.restaurant,
        })
        .collect();
    ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    ranked
}
