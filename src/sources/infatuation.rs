use scraper::ElementRef;

use crate::errors::AppResult;
use crate::models::RawScrapedRecord;
use crate::page::{element_text, Page};
use crate::sources::{
    attr_in, clean_name, has_match, heading_records, select_layout, text_in, ParsedPage, Probe,
};

const VENUE_CARD: &str = "[data-testid=\"venue-venueCard\"]";
const VENUE_LINK: &str = "[data-testid=\"venue-venueLink\"]";

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
    let layout = select_layout(
        page,
        &[(Probe::any(VENUE_LINK), Layout::VenueCards)],
        Layout::Headings,
    )?;

    let records = match layout {
        Layout::VenueCards => {
            let mut records = Vec::new();
            for card in page.select(VENUE_CARD)? {
                if !has_match(card, VENUE_LINK)? {
                    continue;
                }
                records.push(venue_card(page, card));
            }
            records
        }
        Layout::Headings => heading_records(page, "main h2, article h2")?,
    };
    Ok(ParsedPage::new(layout.as_str(), records))
}

fn venue_card(page: &Page, card: ElementRef<'_>) -> AppResult<RawScrapedRecord> {
    let link_heading = format!("{VENUE_LINK} h1, {VENUE_LINK} h2, {VENUE_LINK} h3");
    let name = match text_in(card, &link_heading)? {
        Some(name) => Some(name),
        None => text_in(card, VENUE_LINK)?,
    };
    Ok(RawScrapedRecord {
        name: name.and_then(|name| clean_name(&name)),
        description: sibling_blurb(card),
        url: attr_in(card, &format!("a{VENUE_LINK}"), "href")?
            .and_then(|href| page.resolve(&href)),
        cuisine: text_in(card, "[data-testid=\"venue-cuisine\"]")?,
        short_address: text_in(card, "[data-testid=\"venue-address\"]")?,
        ..RawScrapedRecord::default()
    })
}

/// The review blurb is the paragraph right after the card, not inside it.
fn sibling_blurb(card: ElementRef<'_>) -> Option<String> {
    card.next_siblings()
        .filter_map(ElementRef::wrap)
        .next()
        .filter(|sibling| sibling.value().name() == "p")
        .and_then(element_text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::page_at;

    #[test]
    fn venue_cards_pair_with_following_blurb() {
        let page = page_at(
            "https://www.theinfatuation.com/new-york/guides/best-restaurants-nyc",
            r#"<main>
                <div data-testid="venue-venueCard">
                    <a data-testid="venue-venueLink" href="/new-york/reviews/lilia"><h2>Lilia</h2></a>
                    <span data-testid="venue-cuisine">Italian</span>
                </div>
                <p>Still the pasta place to beat.</p>
                <div data-testid="venue-venueCard"><span>Sponsored</span></div>
                <p>ad copy</p>
                <div data-testid="venue-venueCard">
                    <a data-testid="venue-venueLink" href="/new-york/reviews/via-carota"><h2>Via Carota</h2></a>
                </div>
            </main>"#,
        );
        let parsed = parse(&page).unwrap();
        assert_eq!(parsed.layout, "venue-cards");
        let records: Vec<_> = parsed.records.into_iter().map(Result::unwrap).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name.as_deref(), Some("Lilia"));
        assert_eq!(
            records[0].description.as_deref(),
            Some("Still the pasta place to beat.")
        );
        assert_eq!(
            records[0].url.as_deref(),
            Some("https://www.theinfatuation.com/new-york/reviews/lilia")
        );
        assert_eq!(records[0].cuisine.as_deref(), Some("Italian"));
        assert!(records[1].description.is_none());
    }
}
