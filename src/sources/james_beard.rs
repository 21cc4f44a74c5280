use scraper::ElementRef;
use tracing::debug;
use url::Url;

use crate::errors::{AppError, AppResult};
use crate::models::{AwardObservation, AwardSource, RawScrapedRecord};
use crate::page::{attr, element_text, has_class, selector, Page};
use crate::sources::{clean_name, has_match, text_in, ParsedPage};

const SOURCE_NAME: &str = "jamesbeard";
const CARD: &str = "div.c-award-recipient";
const CARD_LINE: &str = ".c-award-recipient__text";
const CARD_NAME: &str = ".c-award-recipient__name";
const PERSON_TEMPLATE: &str = "components.search-results.award.rnc.person";

/// Categories that recognise people or non-restaurant work.
const IGNORED_AWARDS: &[&str] = &[
    "Humanitarian of the Year",
    "Lifetime Achievement",
    "Other Eating and Drinking Places",
    "Outstanding Restaurant Design (75 Seats and Under)",
    "Outstanding Restaurant Design (76 Seats and Over)",
    "Outstanding Restaurant Design",
    "Outstanding Restaurant Graphics",
    "Outstanding Restaurateur",
    "Outstanding Wine & Spirits Professional",
    "Who's Who of Food & Beverage in America",
];

const DESIGN_ICON: &str = "Design Icon";
const DESIGN_ICON_PEOPLE: &[&str] = &["Debbie Gold", "Alex Von Bidder"];

/// First results page of the winners search for the restaurant and chef awards.
#[cfg(test)]
const WINNERS_URL: &str = "https://www.jamesbeard.org/awards/search?ranks%5BWinner%5D=1&categories%5BRestaurant+%26+Chef%5D=1&page=1";

/// Recipient cards come in two templates. The variant is chosen per card
/// because one results page mixes both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CardVariant {
    /// Chef name is the heading; restaurant and city follow as text lines.
    Person,
    /// Restaurant name is the heading; city is the second text line.
    Restaurant,
}

impl CardVariant {
    fn of(card: ElementRef<'_>) -> Self {
        match card.value().attr("data-award-template") {
            Some(PERSON_TEMPLATE) => CardVariant::Person,
            _ => CardVariant::Restaurant,
        }
    }
}

pub fn parse(page: &Page) -> AppResult<ParsedPage> {
    let mut records = Vec::new();
    for card in page.select(CARD)? {
        if !has_match(card, CARD_LINE)? {
            continue;
        }
        match card_record(page, card) {
            Ok(Some(record)) => records.push(Ok(record)),
            Ok(None) => {}
            Err(err) => records.push(Err(err)),
        }
    }
    Ok(ParsedPage::new("award-recipients", records).with_next_page(next_page(page)?))
}

/// `Ok(None)` for cards in a category that is not about a restaurant.
fn card_record(page: &Page, card: ElementRef<'_>) -> AppResult<Option<RawScrapedRecord>> {
    let lines = card_lines(card)?;
    let Some(award) = lines.first().and_then(|line| line.clone()) else {
        return Err(AppError::integrity(
            SOURCE_NAME,
            page.url().as_str(),
            "award recipient card without an award line",
        ));
    };
    if IGNORED_AWARDS.contains(&award.as_str()) {
        return Ok(None);
    }

    let heading = text_in(card, CARD_NAME)?;
    let line = |index: usize| lines.get(index).cloned().flatten();
    let (restaurant, city, chef) = match CardVariant::of(card) {
        CardVariant::Person => (line(1), line(2), heading),
        CardVariant::Restaurant => (heading, line(1), None),
    };

    if award == DESIGN_ICON
        && restaurant
            .as_deref()
            .is_some_and(|name| DESIGN_ICON_PEOPLE.contains(&name))
    {
        debug!(restaurant = ?restaurant, "skipping design icon person");
        return Ok(None);
    }

    let year = attr(card, "data-award-recipient-year").and_then(|year| year.parse().ok());
    Ok(Some(RawScrapedRecord {
        name: restaurant.as_deref().and_then(clean_name),
        chef: chef.clone(),
        locality: city,
        country: Some("us".into()),
        award: Some(AwardObservation {
            source: AwardSource::JamesBeard,
            award_type: award,
            year,
            chef,
            url: Some(page.url().to_string()),
        }),
        ..RawScrapedRecord::default()
    }))
}

/// Text of every `__text` line, keeping empty lines in place so positions
/// stay meaningful.
fn card_lines(card: ElementRef<'_>) -> AppResult<Vec<Option<String>>> {
    let line = selector(CARD_LINE)?;
    Ok(card.select(&line).map(element_text).collect())
}

fn next_page(page: &Page) -> AppResult<Option<Url>> {
    let items = page.select("ul.pagination .page-item")?;
    let Some(last) = items.last() else {
        return Ok(None);
    };
    if has_class(*last, "disabled") {
        return Ok(None);
    }
    Ok(next_page_url(page.url()))
}

/// The results pages are addressed by a `page` query parameter.
fn next_page_url(current: &Url) -> Option<Url> {
    let page_number = current
        .query_pairs()
        .find(|(key, _)| key == "page")
        .and_then(|(_, value)| value.parse::<u32>().ok())
        .unwrap_or(1);

    let retained: Vec<(String, String)> = current
        .query_pairs()
        .filter(|(key, _)| key != "page")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    let mut next = current.clone();
    next.query_pairs_mut()
        .clear()
        .extend_pairs(retained)
        .append_pair("page", &(page_number + 1).to_string());
    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::page_at;

    fn person(award: &str, chef: &str, restaurant: &str, city: &str) -> String {
        format!(
            r#"<div class="c-award-recipient" data-award-template="{PERSON_TEMPLATE}" data-award-recipient-year="2023">
                <p class="c-award-recipient__name">{chef}</p>
                <p class="c-award-recipient__text">{award}</p>
                <p class="c-award-recipient__text">{restaurant}</p>
                <p class="c-award-recipient__text">{city}</p>
            </div>"#
        )
    }

    fn restaurant(award: &str, name: &str, city: &str) -> String {
        format!(
            r#"<div class="c-award-recipient" data-award-template="components.search-results.award.rnc.restaurant" data-award-recipient-year="2019">
                <p class="c-award-recipient__name">{name}</p>
                <p class="c-award-recipient__text">{award}</p>
                <p class="c-award-recipient__text">{city}</p>
            </div>"#
        )
    }

    #[test]
    fn picks_card_variant_from_template() {
        let html = format!(
            r#"{}{}<div class="c-award-recipient"><p>advert</p></div>
            <ul class="pagination"><li class="page-item">1</li><li class="page-item"><a>Next</a></li></ul>"#,
            person("Best Chef: Great Lakes", "Iliana Regan", "Elizabeth", "Chicago, Illinois"),
            restaurant("Outstanding Restaurant", "Frasca Food and Wine", "Boulder, Colorado"),
        );
        let page = page_at(WINNERS_URL, &html);
        let parsed = parse(&page).unwrap();
        let records: Vec<_> = parsed.records.into_iter().map(Result::unwrap).collect();
        assert_eq!(records.len(), 2);

        assert_eq!(records[0].name.as_deref(), Some("Elizabeth"));
        assert_eq!(records[0].chef.as_deref(), Some("Iliana Regan"));
        assert_eq!(records[0].locality.as_deref(), Some("Chicago, Illinois"));
        let award = records[0].award.as_ref().unwrap();
        assert_eq!(award.award_type, "Best Chef: Great Lakes");
        assert_eq!(award.year, Some(2023));

        assert_eq!(records[1].name.as_deref(), Some("Frasca Food and Wine"));
        assert_eq!(records[1].chef, None);
        assert_eq!(records[1].locality.as_deref(), Some("Boulder, Colorado"));

        let next = parsed.next_page.unwrap();
        assert!(next
            .query_pairs()
            .any(|(key, value)| key == "page" && value == "2"));
        assert!(next.query_pairs().any(|(key, _)| key == "ranks[Winner]"));
    }

    #[test]
    fn ignored_categories_and_design_icon_people_are_dropped() {
        let html = format!(
            r#"{}{}{}<ul class="pagination"><li class="page-item disabled">Next</li></ul>"#,
            restaurant("Outstanding Restaurateur", "Danny Meyer", "New York, New York"),
            restaurant("Design Icon", "Debbie Gold", "Kansas City, Missouri"),
            restaurant("Design Icon", "Chez Panisse", "Berkeley, California"),
        );
        let parsed = parse(&page_at(WINNERS_URL, &html)).unwrap();
        assert_eq!(parsed.records.len(), 1);
        let kept = parsed.records[0].as_ref().unwrap();
        assert_eq!(kept.name.as_deref(), Some("Chez Panisse"));
        assert!(parsed.next_page.is_none());
    }

    #[test]
    fn blank_award_line_fails_only_that_card() {
        let html = format!(
            r#"<div class="c-award-recipient"><p class="c-award-recipient__text">  </p></div>{}"#,
            restaurant("Outstanding Restaurant", "Zahav", "Philadelphia, Pennsylvania"),
        );
        let parsed = parse(&page_at(WINNERS_URL, &html)).unwrap();
        assert!(matches!(
            parsed.records[0],
            Err(AppError::ExtractionIntegrity { .. })
        ));
        assert!(parsed.records[1].is_ok());
    }
}
