use scraper::ElementRef;

use crate::errors::{AppError, AppResult};
use crate::models::{AwardObservation, AwardSource, RawScrapedRecord};
use crate::page::{element_text, selector, Page};
use crate::sources::{clean_name, select_layout, text_in, ParsedPage, Probe};

const SOURCE_NAME: &str = "theworlds50best";
const TOP_FIFTY_URL: &str = "https://www.theworlds50best.com/list/1-50";
const FIFTY_TO_HUNDRED_URL: &str = "https://www.theworlds50best.com/list/51-100";
const BEST_OF_BEST_URL: &str = "https://www.theworlds50best.com/Best-of-the-best";

/// Former number ones carry no position on the Best of the Best page.
const PREVIOUSLY_FIRST: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    /// `/list/1-50` also embeds the 51-100 block, so one page covers the list.
    RankedList,
    BestOfBest,
}

impl Layout {
    fn as_str(&self) -> &'static str {
        match self {
            Layout::RankedList => "ranked-list",
            Layout::BestOfBest => "best-of-best",
        }
    }
}

pub fn parse(page: &Page) -> AppResult<ParsedPage> {
    let layout = select_layout(
        page,
        &[(Probe::any("div[data-list=\"1-50\"] .item"), Layout::RankedList)],
        Layout::BestOfBest,
    )?;
    let items = match layout {
        Layout::RankedList => {
            let mut items = page.select("div[data-list=\"1-50\"] .item")?;
            items.extend(page.select("div[data-list=\"51-100\"] .item")?);
            items
        }
        Layout::BestOfBest => page.select(".item")?,
    };
    let records = items.into_iter().map(|item| item_record(page, item)).collect();
    Ok(ParsedPage::new(layout.as_str(), records))
}

fn item_record(page: &Page, item: ElementRef<'_>) -> AppResult<RawScrapedRecord> {
    let name = text_in(item, "h2")?.and_then(|name| clean_name(&name));
    let rank = rank(page, item, name.as_deref())?;
    let paragraph = selector("p")?;
    let city = item.select(&paragraph).last().and_then(element_text);

    Ok(RawScrapedRecord {
        name,
        locality: city,
        award: Some(AwardObservation {
            source: AwardSource::FiftyBest,
            award_type: award_type(rank),
            year: None,
            chef: None,
            url: Some(url_for(rank).to_string()),
        }),
        ..RawScrapedRecord::default()
    })
}

fn rank(page: &Page, item: ElementRef<'_>, name: Option<&str>) -> AppResult<i32> {
    let Some(position) = text_in(item, "p.position")? else {
        return Ok(PREVIOUSLY_FIRST);
    };
    match position.trim_start_matches('#').parse::<i32>() {
        Ok(rank) if (1..=100).contains(&rank) => Ok(rank),
        _ => Err(AppError::integrity(
            SOURCE_NAME,
            page.url().as_str(),
            format!(
                "position `{position}` for {} is not a rank",
                name.unwrap_or("unnamed item")
            ),
        )),
    }
}

fn award_type(rank: i32) -> String {
    if rank == PREVIOUSLY_FIRST {
        "BEST_OF_BEST".into()
    } else {
        format!("RANK_{rank}")
    }
}

fn url_for(rank: i32) -> &'static str {
    match rank {
        PREVIOUSLY_FIRST => BEST_OF_BEST_URL,
        ..=50 => TOP_FIFTY_URL,
        _ => FIFTY_TO_HUNDRED_URL,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::page_at;

    fn item(position: Option<&str>, name: &str, city: &str) -> String {
        let position = position
            .map(|p| format!(r#"<p class="position">{p}</p>"#))
            .unwrap_or_default();
        format!(r#"<div class="item">{position}<h2>{name}</h2><p>{city}</p></div>"#)
    }

    #[test]
    fn ranked_list_reads_both_blocks() {
        let html = format!(
            r#"<div data-list="1-50">{}{}</div><div data-list="51-100">{}</div>"#,
            item(Some("1"), "Disfrutar", "Barcelona"),
            item(Some("2"), "Asador Etxebarri", "Atxondo"),
            item(Some("73"), "Le Calandre", "Rubano"),
        );
        let parsed = parse(&page_at(TOP_FIFTY_URL, &html)).unwrap();
        assert_eq!(parsed.layout, "ranked-list");
        let records: Vec<_> = parsed.records.into_iter().map(Result::unwrap).collect();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].name.as_deref(), Some("Asador Etxebarri"));
        assert_eq!(records[1].locality.as_deref(), Some("Atxondo"));
        let last = records[2].award.as_ref().unwrap();
        assert_eq!(last.award_type, "RANK_73");
        assert_eq!(last.url.as_deref(), Some(FIFTY_TO_HUNDRED_URL));
    }

    #[test]
    fn best_of_best_items_have_no_position() {
        let html = item(None, "Osteria Francescana", "Modena");
        let parsed = parse(&page_at(BEST_OF_BEST_URL, &html)).unwrap();
        assert_eq!(parsed.layout, "best-of-best");
        let record = parsed.records.into_iter().next().unwrap().unwrap();
        let award = record.award.unwrap();
        assert_eq!(award.award_type, "BEST_OF_BEST");
        assert_eq!(award.url.as_deref(), Some(BEST_OF_BEST_URL));
        assert_eq!(record.country, None);
    }

    #[test]
    fn garbled_position_is_an_integrity_error() {
        let html = format!(
            r#"<div data-list="1-50">{}{}</div>"#,
            item(Some("N/A"), "Broken", "Nowhere"),
            item(Some("4"), "Maido", "Lima"),
        );
        let parsed = parse(&page_at(TOP_FIFTY_URL, &html)).unwrap();
        assert!(matches!(
            parsed.records[0],
            Err(AppError::ExtractionIntegrity { .. })
        ));
        assert!(parsed.records[1].is_ok());
    }
}
