use scraper::ElementRef;

use crate::errors::AppResult;
use crate::models::RawScrapedRecord;
use crate::page::{attr, Page};
use crate::sources::{
    attr_in, clean_name, heading_records, select_layout, text_in, ParsedPage, Probe,
};

const MAPSTACK_CARD: &str = "section.c-mapstack__card[data-slug]";
const MAP_POINT: &str = "section[data-testid=\"map-point\"]";
const SKIPPED_SLUGS: &[&str] = &["intro", "newsletter", "related-links", "comments"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    MapStack,
    MapPoints,
    Headings,
}

impl Layout {
    fn as_str(&self) -> &'static str {
        match self {
            Layout::MapStack => "mapstack",
            Layout::MapPoints => "map-points",
            Layout::Headings => "headings",
        }
    }
}

pub fn parse(page: &Page) -> AppResult<ParsedPage> {
    let layout = select_layout(
        page,
        &[
            (Probe::any(MAPSTACK_CARD), Layout::MapStack),
            (Probe::any(MAP_POINT), Layout::MapPoints),
        ],
        Layout::Headings,
    )?;

    let records = match layout {
        Layout::MapStack => page
            .select(MAPSTACK_CARD)?
            .into_iter()
            .filter(|card| {
                attr(*card, "data-slug").is_some_and(|slug| !SKIPPED_SLUGS.contains(&slug.as_str()))
            })
            .map(mapstack_card)
            .collect(),
        Layout::MapPoints => page
            .select(MAP_POINT)?
            .into_iter()
            .map(map_point)
            .collect(),
        Layout::Headings => heading_records(page, "main h2, article h2")?,
    };
    Ok(ParsedPage::new(layout.as_str(), records))
}

fn mapstack_card(card: ElementRef<'_>) -> AppResult<RawScrapedRecord> {
    Ok(RawScrapedRecord {
        name: text_in(card, "h1, h2, h3")?.and_then(|name| clean_name(&name)),
        description: text_in(card, "p")?,
        short_address: text_in(card, ".c-mapstack__address")?,
        phone: text_in(card, ".c-mapstack__phone")?,
        website: attr_in(card, "a[data-analytics-link=\"link-icon\"]", "href")?,
        reservation_url: attr_in(card, "a[data-analytics-link=\"reservation\"]", "href")?,
        ..RawScrapedRecord::default()
    })
}

fn map_point(point: ElementRef<'_>) -> AppResult<RawScrapedRecord> {
    Ok(RawScrapedRecord {
        name: text_in(point, "h2, h3")?.and_then(|name| clean_name(&name)),
        description: text_in(point, "p")?,
        short_address: text_in(point, "[data-testid=\"map-point-address\"]")?,
        phone: text_in(point, "[data-testid=\"map-point-phone\"]")?,
        website: attr_in(point, "a[data-testid=\"map-point-website\"]", "href")?,
        latitude: attr(point, "data-lat").and_then(|v| v.parse().ok()),
        longitude: attr(point, "data-lng").and_then(|v| v.parse().ok()),
        ..RawScrapedRecord::default()
    })
}
