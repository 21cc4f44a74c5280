use scraper::ElementRef;

use crate::errors::AppResult;
use crate::models::RawScrapedRecord;
use crate::page::Page;
use crate::sources::{attr_in, clean_name, heading_records, select_layout, text_in, ParsedPage, Probe};

const PLACE_CARD: &str = "[data-testid=\"place-card\"]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    PlaceCards,
    Headings,
}

impl Layout {
    fn as_str(&self) -> &'static str {
        match self {
            Layout::PlaceCards => "place-cards",
            Layout::Headings => "headings",
        }
    }
}

pub fn parse(page: &Page) -> AppResult<ParsedPage> {
    let layout = select_layout(page, &[(Probe::any(PLACE_CARD), Layout::PlaceCards)], Layout::Headings)?;
    let records = match layout {
        Layout::PlaceCards => page
            .select(PLACE_CARD)?
            .into_iter()
            .map(|card| place_card(page, card))
            .collect(),
        Layout::Headings => heading_records(page, "article h2, article h3")?,
    };
    Ok(ParsedPage::new(layout.as_str(), records))
}

fn place_card(page: &Page, card: ElementRef<'_>) -> AppResult<RawScrapedRecord> {
    Ok(RawScrapedRecord {
        name: text_in(card, "h3, h2")?.and_then(|name| clean_name(&name)),
        description: text_in(card, "p")?,
        long_address: text_in(card, "[data-testid=\"place-card-address\"]")?,
        url: attr_in(card, "a", "href")?.and_then(|href| page.resolve(&href)),
        ..RawScrapedRecord::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::page_at;

    #[test]
    fn place_cards_read_long_address() {
        let page = page_at(
            "https://theculturetrip.com/north-america/usa/texas/articles/best-restaurants-austin",
            r#"<div data-testid="place-card">
                <a href="/north-america/usa/texas/restaurants/uchi"><h3>Uchi</h3></a>
                <span data-testid="place-card-address">801 S Lamar Blvd, Austin, TX 78704</span>
                <p>Sushi with a Texas accent.</p>
            </div>"#,
        );
        let parsed = parse(&page).unwrap();
        assert_eq!(parsed.layout, "place-cards");
        let record = parsed.records.into_iter().next().unwrap().unwrap();
        assert_eq!(record.name.as_deref(), Some("Uchi"));
        assert_eq!(
            record.long_address.as_deref(),
            Some("801 S Lamar Blvd, Austin, TX 78704")
        );
        assert_eq!(
            record.url.as_deref(),
            Some("https://theculturetrip.com/north-america/usa/texas/restaurants/uchi")
        );
    }
}
