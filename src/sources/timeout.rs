use scraper::ElementRef;

use crate::errors::AppResult;
use crate::models::RawScrapedRecord;
use crate::page::Page;
use crate::sources::{attr_in, clean_name, heading_records, select_layout, text_in, ParsedPage, Probe};

const TILE: &str = "article.tile";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Tiles,
    Headings,
}

impl Layout {
    fn as_str(&self) -> &'static str {
        match self {
            Layout::Tiles => "tiles",
            Layout::Headings => "headings",
        }
    }
}

pub fn parse(page: &Page) -> AppResult<ParsedPage> {
    let layout = select_layout(page, &[(Probe::any("article.tile h3"), Layout::Tiles)], Layout::Headings)?;
    let records = match layout {
        Layout::Tiles => page
            .select(TILE)?
            .into_iter()
            .map(|tile| tile_record(page, tile))
            .collect(),
        Layout::Headings => heading_records(page, "article h3, main h3")?,
    };
    Ok(ParsedPage::new(layout.as_str(), records))
}

fn tile_record(page: &Page, tile: ElementRef<'_>) -> AppResult<RawScrapedRecord> {
    let summary = match text_in(tile, "[data-testid=\"summary_testID\"] p")? {
        Some(summary) => Some(summary),
        None => text_in(tile, "p")?,
    };
    Ok(RawScrapedRecord {
        name: text_in(tile, "h3")?.and_then(|name| clean_name(&name)),
        description: summary,
        url: attr_in(tile, "a[data-testid=\"tile-link_testID\"]", "href")?
            .and_then(|href| page.resolve(&href)),
        short_address: text_in(tile, "[data-testid=\"tile-address_testID\"]")?,
        ..RawScrapedRecord::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::page_at;

    #[test]
    fn tiles_strip_list_numbers() {
        let page = page_at(
            "https://www.timeout.com/chicago/restaurants/best-restaurants-in-chicago",
            r#"<article class="tile">
                <a data-testid="tile-link_testID" href="/chicago/restaurants/kasama"><h3>1.&nbsp;Kasama</h3></a>
                <div data-testid="summary_testID"><p>Michelin-starred Filipino.</p></div>
            </article>
            <article class="tile"><h3>2. Avec</h3><p>Chorizo dates.</p></article>"#,
        );
        let parsed = parse(&page).unwrap();
        assert_eq!(parsed.layout, "tiles");
        let records: Vec<_> = parsed.records.into_iter().map(Result::unwrap).collect();
        assert_eq!(records[0].name.as_deref(), Some("Kasama"));
        assert_eq!(records[0].description.as_deref(), Some("Michelin-starred Filipino."));
        assert_eq!(
            records[0].url.as_deref(),
            Some("https://www.timeout.com/chicago/restaurants/kasama")
        );
        assert_eq!(records[1].name.as_deref(), Some("Avec"));
        assert_eq!(records[1].description.as_deref(), Some("Chorizo dates."));
    }
}
