use scraper::ElementRef;
use tracing::warn;

use crate::errors::{AppError, AppResult};
use crate::models::{PriceTier, RawScrapedRecord};
use crate::page::Page;
use crate::sources::{
    attr_in, clean_name, has_match, heading_records, select_layout, text_in, ParsedPage, Probe,
};

const SOURCE_NAME: &str = "cntraveler";
const GALLERY_SLIDE: &str = ".gallery__slides__slide";
const SLIDE_VENUE: &str = ".slide-venue";
const SUMMARY_ITEM: &str = "div.summary-item";
const PRICE_DETAIL: &str = "[class*=\"GallerySlideCaptionDetail\"]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Gallery,
    SummaryList,
    Headings,
}

impl Layout {
    fn as_str(&self) -> &'static str {
        match self {
            Layout::Gallery => "gallery",
            Layout::SummaryList => "summary-list",
            Layout::Headings => "headings",
        }
    }
}

pub fn parse(page: &Page) -> AppResult<ParsedPage> {
    let layout = select_layout(
        page,
        &[
            (Probe::any(".gallery__slides__slide .slide-venue"), Layout::Gallery),
            (Probe::any(SUMMARY_ITEM), Layout::SummaryList),
        ],
        Layout::Headings,
    )?;

    let records = match layout {
        Layout::Gallery => {
            let mut records = Vec::new();
            for slide in page.select(GALLERY_SLIDE)? {
                if has_match(slide, SLIDE_VENUE)? {
                    records.push(gallery_slide(page, slide));
                }
            }
            records
        }
        Layout::SummaryList => page
            .select(SUMMARY_ITEM)?
            .into_iter()
            .map(|item| summary_item(page, item))
            .collect(),
        Layout::Headings => heading_records(page, "article h2")?,
    };
    Ok(ParsedPage::new(layout.as_str(), records))
}

fn gallery_slide(page: &Page, slide: ElementRef<'_>) -> AppResult<RawScrapedRecord> {
    let name = text_in(slide, "h1, h2, h3")?
        .map(|heading| heading.trim_end_matches("Arrow").to_string())
        .and_then(|heading| clean_name(&heading));
    let label = name.clone().unwrap_or_else(|| "unnamed slide".into());

    let price_tier = match text_in(slide, PRICE_DETAIL)? {
        Some(detail) => dollar_tier(page, &label, &detail)?,
        None => {
            warn!(restaurant = %label, url = %page.url(), "no price detail on slide");
            None
        }
    };

    Ok(RawScrapedRecord {
        name,
        description: text_in(slide, "p")?,
        price_tier,
        url: attr_in(slide, "figcaption a", "href")?.and_then(|href| page.resolve(&href)),
        ..RawScrapedRecord::default()
    })
}

fn summary_item(page: &Page, item: ElementRef<'_>) -> AppResult<RawScrapedRecord> {
    Ok(RawScrapedRecord {
        name: text_in(item, ".summary-item__hed")?.and_then(|name| clean_name(&name)),
        description: text_in(item, ".summary-item__dek")?,
        url: attr_in(item, "a.summary-item__hed-link", "href")?
            .and_then(|href| page.resolve(&href)),
        short_address: text_in(item, ".summary-item__address")?,
        ..RawScrapedRecord::default()
    })
}

/// Counts `$` glyphs; more than four means the selector grabbed the wrong node.
fn dollar_tier(page: &Page, restaurant: &str, detail: &str) -> AppResult<Option<PriceTier>> {
    let count = detail.matches('$').count();
    PriceTier::from_count(count).map_err(|count| {
        AppError::integrity(
            SOURCE_NAME,
            page.url().as_str(),
            format!("price indicator for {restaurant} has {count} tiers"),
        )
    })
}
