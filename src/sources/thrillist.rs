use scraper::ElementRef;

use crate::errors::AppResult;
use crate::models::RawScrapedRecord;
use crate::page::Page;
use crate::sources::{attr_in, clean_name, heading_records, select_layout, text_in, ParsedPage, Probe};

const VENUE_CARD: &str = "div.saved-venue-card";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    VenueCards,
    Headings,
}

impl Layout {
    fn as_str(&self) -> &'static str {
        match self {
            Layout::VenueCards => "venue-cards",
            Layout::Headings => "headings",
        }
    }
}

pub fn parse(page: &Page) -> AppResult<ParsedPage> {
    let layout = select_layout(page, &[(Probe::any(VENUE_CARD), Layout::VenueCards)], Layout::Headings)?;
    let records = match layout {
        Layout::VenueCards => page
            .select(VENUE_CARD)?
            .into_iter()
            .map(venue_card)
            .collect(),
        Layout::Headings => heading_records(page, "article h2, main h2")?,
    };
    Ok(ParsedPage::new(layout.as_str(), records))
}

fn venue_card(card: ElementRef<'_>) -> AppResult<RawScrapedRecord> {
    Ok(RawScrapedRecord {
        name: text_in(card, ".saved-venue-card__name")?.and_then(|name| clean_name(&name)),
        description: text_in(card, ".saved-venue-card__description")?,
        short_address: text_in(card, ".saved-venue-card__address")?,
        website: attr_in(card, "a.saved-venue-card__website", "href")?,
        reservation_url: attr_in(card, "a.saved-venue-card__reserve", "href")?,
        ..RawScrapedRecord::default()
    })
}
