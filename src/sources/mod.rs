//! Source dispatch and the per-site parsers.
//!
//! Each site module exposes a `parse(&Page)` that first probes the page to
//! pick one of its known layouts, then runs only that layout's extractor.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::ElementRef;
use tracing::debug;
use url::Url;

use crate::errors::{AppError, AppResult};
use crate::models::{AwardSource, DocumentKind, OgMetadata, RawScrapedRecord};
use crate::page::{element_text, selector, Page};

pub mod conde_nast;
pub mod culture_trip;
pub mod eater;
pub mod fifty_best;
pub mod infatuation;
pub mod james_beard;
pub mod michelin;
pub mod thrillist;
pub mod timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    CondeNast,
    Eater,
    Infatuation,
    Timeout,
    Thrillist,
    CultureTrip,
    Michelin,
    JamesBeard,
    FiftyBest,
}

const REGISTRY: &[(&str, Source)] = &[
    ("cntraveler", Source::CondeNast),
    ("eater", Source::Eater),
    ("theinfatuation", Source::Infatuation),
    ("timeout", Source::Timeout),
    ("thrillist", Source::Thrillist),
    ("theculturetrip", Source::CultureTrip),
    ("michelin", Source::Michelin),
    ("jamesbeard", Source::JamesBeard),
    ("theworlds50best", Source::FiftyBest),
];

const TOP_LEVEL_SUFFIXES: &[&str] = &[
    "com", "co", "org", "net", "uk", "au", "ca", "nz", "ie", "us", "fr", "de", "es", "it", "jp",
];

static RANK_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:#\d+[.):]?|No\.\s*\d+[.):]?|\d+[.)])\s*").expect("rank prefix pattern")
});

/// Second-level label of the host with well-known suffixes stripped, so that
/// `la.eater.com` and `www.timeout.co.uk` map to `eater` and `timeout`.
pub fn registrable_domain(url: &Url) -> Option<String> {
    let host = url.host_str()?.trim_end_matches('.').to_lowercase();
    let mut labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
    while labels.len() > 1 && labels.last().is_some_and(|l| TOP_LEVEL_SUFFIXES.contains(l)) {
        labels.pop();
    }
    labels.last().map(|label| label.to_string())
}

pub fn dispatch(url: &Url) -> AppResult<Source> {
    let domain = registrable_domain(url).unwrap_or_default();
    REGISTRY
        .iter()
        .find(|(name, _)| *name == domain)
        .map(|(_, source)| *source)
        .ok_or_else(|| AppError::UnknownSource {
            url: url.to_string(),
            domain,
        })
}

impl Source {
    pub fn name(&self) -> &'static str {
        match self {
            Source::CondeNast => "cntraveler",
            Source::Eater => "eater",
            Source::Infatuation => "theinfatuation",
            Source::Timeout => "timeout",
            Source::Thrillist => "thrillist",
            Source::CultureTrip => "theculturetrip",
            Source::Michelin => "michelin",
            Source::JamesBeard => "jamesbeard",
            Source::FiftyBest => "theworlds50best",
        }
    }

    pub fn document_kind(&self) -> DocumentKind {
        match self {
            Source::Michelin => DocumentKind::AwardListing(AwardSource::Michelin),
            Source::JamesBeard => DocumentKind::AwardListing(AwardSource::JamesBeard),
            Source::FiftyBest => DocumentKind::AwardListing(AwardSource::FiftyBest),
            _ => DocumentKind::Article,
        }
    }

    pub fn parse_page(&self, page: &Page) -> AppResult<ParsedPage> {
        let mut parsed = match self {
            Source::CondeNast => conde_nast::parse(page)?,
            Source::Eater => eater::parse(page)?,
            Source::Infatuation => infatuation::parse(page)?,
            Source::Timeout => timeout::parse(page)?,
            Source::Thrillist => thrillist::parse(page)?,
            Source::CultureTrip => culture_trip::parse(page)?,
            Source::Michelin => michelin::parse(page)?,
            Source::JamesBeard => james_beard::parse(page)?,
            Source::FiftyBest => fifty_best::parse(page)?,
        };
        if matches!(self.document_kind(), DocumentKind::Article) {
            parsed.metadata = page.og_metadata();
        }
        debug!(
            source = self.name(),
            url = %page.url(),
            layout = parsed.layout,
            records = parsed.records.len(),
            "page parsed"
        );
        Ok(parsed)
    }
}

/// Everything read off one loaded page. A failed record never takes its
/// siblings down with it.
#[derive(Debug)]
pub struct ParsedPage {
    pub layout: &'static str,
    pub records: Vec<AppResult<RawScrapedRecord>>,
    pub next_page: Option<Url>,
    pub metadata: OgMetadata,
}

impl ParsedPage {
    pub fn new(layout: &'static str, records: Vec<AppResult<RawScrapedRecord>>) -> Self {
        Self {
            layout,
            records,
            next_page: None,
            metadata: OgMetadata::default(),
        }
    }

    pub fn with_next_page(mut self, next_page: Option<Url>) -> Self {
        self.next_page = next_page;
        self
    }
}

/// Structural signature of a layout: at least `min_matches` elements match.
#[derive(Debug, Clone, Copy)]
pub struct Probe {
    pub selector: &'static str,
    pub min_matches: usize,
}

impl Probe {
    pub const fn any(selector: &'static str) -> Self {
        Self {
            selector,
            min_matches: 1,
        }
    }
}

/// Evaluates the probes in order, once per page; the first hit wins and
/// `fallback` is used when none match.
pub fn select_layout<L: Copy>(page: &Page, probes: &[(Probe, L)], fallback: L) -> AppResult<L> {
    for (probe, layout) in probes {
        if page.count(probe.selector)? >= probe.min_matches {
            return Ok(*layout);
        }
    }
    Ok(fallback)
}

/// Lowest-common-denominator extraction shared by the article parsers:
/// every matching heading is a restaurant, the paragraph right after it
/// is its blurb.
pub fn heading_records(page: &Page, headings: &str) -> AppResult<Vec<AppResult<RawScrapedRecord>>> {
    let records = page
        .select(headings)?
        .into_iter()
        .map(|heading| {
            Ok(RawScrapedRecord {
                name: element_text(heading).and_then(|text| clean_name(&text)),
                description: following_paragraph(heading),
                ..RawScrapedRecord::default()
            })
        })
        .collect();
    Ok(records)
}

fn following_paragraph(element: ElementRef<'_>) -> Option<String> {
    let sibling = element
        .next_siblings()
        .filter_map(ElementRef::wrap)
        .next()?;
    if sibling.value().name() == "p" {
        element_text(sibling)
    } else {
        let paragraph = selector("p").ok()?;
        sibling.select(&paragraph).find_map(element_text)
    }
}

/// Trims list numbering ("12. ", "#3 ") from a scraped name; an empty
/// result means the name was not extractable.
pub fn clean_name(raw: &str) -> Option<String> {
    let name = RANK_PREFIX.replace(raw.trim(), "");
    let name = name.trim();
    (!name.is_empty()).then(|| name.to_string())
}

/// Text of the first match inside `element`, if any.
pub fn text_in(element: ElementRef<'_>, css: &str) -> AppResult<Option<String>> {
    let selector = selector(css)?;
    Ok(crate::page::child_text(element, &selector))
}

pub fn attr_in(element: ElementRef<'_>, css: &str, attr: &str) -> AppResult<Option<String>> {
    let selector = selector(css)?;
    Ok(crate::page::child_attr(element, &selector, attr))
}

pub fn has_match(element: ElementRef<'_>, css: &str) -> AppResult<bool> {
    let selector = selector(css)?;
    let found = element.select(&selector).next().is_some();
    Ok(found)
}

#[cfg(test)]
pub(crate) fn page_at(url: &str, html: &str) -> Page {
    Page::parse(Url::parse(url).expect("test url"), html)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(value: &str) -> Url {
        Url::parse(value).unwrap()
    }

    #[test]
    fn strips_suffixes_to_the_registrable_label() {
        assert_eq!(
            registrable_domain(&url("https://la.eater.com/maps/best")).as_deref(),
            Some("eater")
        );
        assert_eq!(
            registrable_domain(&url("https://www.timeout.co.uk/london")).as_deref(),
            Some("timeout")
        );
        assert_eq!(
            registrable_domain(&url("https://guide.michelin.com/us/en")).as_deref(),
            Some("michelin")
        );
    }

    #[test]
    fn dispatch_fails_closed_for_unknown_domains() {
        assert_eq!(
            dispatch(&url("https://www.theinfatuation.com/new-york/guides/x")).unwrap(),
            Source::Infatuation
        );
        match dispatch(&url("https://www.yelp.com/biz/x")) {
            Err(AppError::UnknownSource { domain, .. }) => assert_eq!(domain, "yelp"),
            other => panic!("expected unknown source, got {other:?}"),
        }
    }

    #[test]
    fn award_sources_produce_award_documents() {
        assert_eq!(
            Source::JamesBeard.document_kind(),
            DocumentKind::AwardListing(AwardSource::JamesBeard)
        );
        assert_eq!(Source::Eater.document_kind(), DocumentKind::Article);
    }

    #[test]
    fn first_matching_probe_wins() {
        let page = page_at(
            "https://example.com",
            r#"<div class="a"></div><div class="b"></div><div class="b"></div>"#,
        );
        let probes = [
            (Probe { selector: "div.b", min_matches: 3 }, "many-b"),
            (Probe::any("div.a"), "a"),
            (Probe::any("div.b"), "b"),
        ];
        assert_eq!(select_layout(&page, &probes, "default").unwrap(), "a");
        assert_eq!(select_layout(&page, &probes[..1], "default").unwrap(), "default");
    }

    #[test]
    fn heading_records_keep_unnamed_entries() {
        let page = page_at(
            "https://example.com",
            r#"<article>
                <h2>1. Kismet</h2><p>Vegetables, mostly.</p>
                <h2>   </h2><p>orphan</p>
                <h2>Bestia</h2><div><p>Pasta.</p></div>
            </article>"#,
        );
        let records: Vec<_> = heading_records(&page, "article h2")
            .unwrap()
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].name.as_deref(), Some("Kismet"));
        assert_eq!(records[0].description.as_deref(), Some("Vegetables, mostly."));
        assert!(records[1].name.is_none());
        assert_eq!(records[2].description.as_deref(), Some("Pasta."));
    }

    #[test]
    fn clean_name_trims_numbering_only() {
        assert_eq!(clean_name("12. Nobu").as_deref(), Some("Nobu"));
        assert_eq!(clean_name("#3 Lucali").as_deref(), Some("Lucali"));
        assert_eq!(clean_name("21 Greenpoint").as_deref(), Some("21 Greenpoint"));
        assert_eq!(clean_name("Nopa").as_deref(), Some("Nopa"));
        assert_eq!(clean_name(" "), None);
    }
}
