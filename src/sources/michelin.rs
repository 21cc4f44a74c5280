use scraper::ElementRef;
use url::Url;

use crate::errors::{AppError, AppResult};
use crate::models::{AwardObservation, AwardSource, MichelinDistinction, PriceTier, RawScrapedRecord};
use crate::page::{attr, has_class, Page};
use crate::sources::{attr_in, clean_name, select_layout, text_in, ParsedPage, Probe};

const SOURCE_NAME: &str = "michelin";
const CARD: &str = "div.card__menu";
const LIKE_BUTTON: &str = "div.card__menu-like";
const TITLE_LINK: &str = "h3.card__menu-content--title a";
const AWARD_ICON: &str = "img.michelin-award";
const PRICE_FOOTER: &str = "div.card__menu-footer--price";
const GUIDE_ORIGIN: &str = "https://guide.michelin.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    DataAttributes,
    CardText,
}

impl Layout {
    fn as_str(&self) -> &'static str {
        match self {
            Layout::DataAttributes => "data-attributes",
            Layout::CardText => "card-text",
        }
    }
}

/// Facts the card stores as attributes on its "like" button.
#[derive(Debug, Default)]
struct CardData {
    name: Option<String>,
    cuisine: Option<String>,
    country: Option<String>,
    region: Option<String>,
    city: Option<String>,
    chef: Option<String>,
}

pub fn parse(page: &Page) -> AppResult<ParsedPage> {
    let layout = select_layout(
        page,
        &[(
            Probe::any("div.card__menu div.card__menu-like[data-restaurant-name]"),
            Layout::DataAttributes,
        )],
        Layout::CardText,
    )?;

    let records = page
        .select(CARD)?
        .into_iter()
        .map(|card| card_record(page, layout, card))
        .collect();
    Ok(ParsedPage::new(layout.as_str(), records).with_next_page(next_page(page)?))
}

fn card_record(page: &Page, layout: Layout, card: ElementRef<'_>) -> AppResult<RawScrapedRecord> {
    let data = match layout {
        Layout::DataAttributes => card_data(card)?,
        Layout::CardText => CardData {
            name: text_in(card, "h3.card__menu-content--title")?,
            city: text_in(card, "div.card__menu-footer--location")?,
            ..CardData::default()
        },
    };
    let name = data.name.as_deref().and_then(clean_name);
    let label = name.clone().unwrap_or_else(|| "unnamed card".into());

    let distinction = distinction(page, card, &label)?;
    let price_tier = price_tier(page, card, &label)?;
    let url = attr_in(card, TITLE_LINK, "href")?.map(|href| absolute(&href));
    let locality = match (&data.city, &data.region) {
        (Some(city), Some(region)) if city != region => Some(format!("{city}, {region}")),
        (Some(city), _) => Some(city.clone()),
        (None, region) => region.clone(),
    };

    Ok(RawScrapedRecord {
        name,
        url: url.clone(),
        price_tier,
        latitude: attr(card, "data-lat").and_then(|v| v.parse().ok()),
        longitude: attr(card, "data-lng").and_then(|v| v.parse().ok()),
        cuisine: data.cuisine,
        chef: data.chef.clone(),
        locality,
        country: data.country,
        award: Some(AwardObservation {
            source: AwardSource::Michelin,
            award_type: distinction.as_str().to_string(),
            year: None,
            chef: data.chef,
            url,
        }),
        ..RawScrapedRecord::default()
    })
}

fn card_data(card: ElementRef<'_>) -> AppResult<CardData> {
    let read = |name: &str| attr_in(card, LIKE_BUTTON, name);
    Ok(CardData {
        name: read("data-restaurant-name")?,
        cuisine: read("data-cooking-type")?,
        country: read("data-restaurant-country")?.map(|c| c.to_lowercase()),
        region: read("data-dtm-region")?,
        city: read("data-dtm-city")?,
        // an empty attribute means no chef is credited
        chef: read("data-dtm-chef")?,
    })
}

/// No icon is a plain guide listing; otherwise the icons are either a Bib
/// Gourmand or one to three stars. Anything else means the markup moved.
fn distinction(page: &Page, card: ElementRef<'_>, label: &str) -> AppResult<MichelinDistinction> {
    let icons = crate::page::selector(AWARD_ICON)?;
    let sources: Vec<Option<&str>> = card
        .select(&icons)
        .map(|icon| icon.value().attr("src"))
        .collect();

    if sources.is_empty() {
        return Ok(MichelinDistinction::Guide);
    }
    if sources.iter().any(Option::is_none) {
        return Err(AppError::integrity(
            SOURCE_NAME,
            page.url().as_str(),
            format!("award icon without src for {label}"),
        ));
    }
    if sources.iter().flatten().any(|src| src.contains("bib-gourmand")) {
        return Ok(MichelinDistinction::BibGourmand);
    }
    let stars = sources.iter().flatten().filter(|src| src.contains("1star")).count();
    MichelinDistinction::from_stars(stars).ok_or_else(|| {
        AppError::integrity(
            SOURCE_NAME,
            page.url().as_str(),
            format!("unrecognised award icons for {label}: {stars} stars"),
        )
    })
}

/// Footer reads like `€€€€ · Modern Cuisine`; the glyphs before the dot are the tier.
fn price_tier(page: &Page, card: ElementRef<'_>, label: &str) -> AppResult<Option<PriceTier>> {
    let Some(footer) = text_in(card, PRICE_FOOTER)? else {
        return Ok(None);
    };
    let glyphs = footer
        .split('·')
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|c| !c.is_whitespace())
        .count();
    PriceTier::from_count(glyphs).map_err(|count| {
        AppError::integrity(
            SOURCE_NAME,
            page.url().as_str(),
            format!("price footer for {label} has {count} glyphs"),
        )
    })
}

fn next_page(page: &Page) -> AppResult<Option<Url>> {
    let buttons = page.select("ul.pagination li")?;
    let Some(last) = buttons.last() else {
        return Ok(None);
    };
    if !last.value().classes().any(|class| class.contains("arrow")) && !has_class(*last, "next") {
        return Ok(None);
    }
    Ok(attr_in(*last, "a", "href")?
        .and_then(|href| page.resolve(&href))
        .and_then(|href| Url::parse(&href).ok()))
}

fn absolute(href: &str) -> String {
    if href.starts_with('/') {
        format!("{GUIDE_ORIGIN}{href}")
    } else {
        href.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::page_at;

    const URL: &str = "https://guide.michelin.com/us/en/restaurants/page/1";

    fn card(name: &str, icons: &str, footer: &str) -> String {
        format!(
            r#"<div class="card__menu" data-lat="41.91" data-lng="-87.64">
                <div class="card__menu-like" data-restaurant-name="{name}" data-cooking-type="Contemporary"
                     data-restaurant-country="USA" data-dtm-region="Illinois" data-dtm-city="Chicago" data-dtm-chef=""></div>
                <div class="card__menu-content--rating">{icons}</div>
                <h3 class="card__menu-content--title"><a href="/us/en/illinois/chicago/restaurant/{name}">{name}</a></h3>
                <div class="card__menu-footer--price">{footer}</div>
            </div>"#
        )
    }

    #[test]
    fn decodes_distinctions_and_card_attributes() {
        let html = [
            card("alinea", r#"<img class="michelin-award" src="/1star.svg"><img class="michelin-award" src="/1star.svg"><img class="michelin-award" src="/1star.svg">"#, "$$$$ · Contemporary"),
            card("avec", r#"<img class="michelin-award" src="/bib-gourmand.svg">"#, "$$ · Mediterranean"),
            card("gibsons", "", "$$$ · Steakhouse"),
        ]
        .join("");
        let page = page_at(URL, &format!(
            "{html}<ul class=\"pagination\"><li><a href=\"/us/en/restaurants/page/1\">1</a></li><li class=\"arrow\"><a href=\"/us/en/restaurants/page/2\">next</a></li></ul>"
        ));

        let parsed = parse(&page).unwrap();
        assert_eq!(parsed.layout, "data-attributes");
        let records: Vec<_> = parsed.records.into_iter().map(Result::unwrap).collect();
        let awards: Vec<_> = records
            .iter()
            .map(|r| r.award.as_ref().unwrap().award_type.as_str())
            .collect();
        assert_eq!(awards, vec!["THREE_STARS", "BIB_GOURMAND", "GUIDE"]);

        let alinea = &records[0];
        assert_eq!(alinea.name.as_deref(), Some("alinea"));
        assert_eq!(alinea.chef, None);
        assert_eq!(alinea.country.as_deref(), Some("usa"));
        assert_eq!(alinea.locality.as_deref(), Some("Chicago, Illinois"));
        assert_eq!(alinea.price_tier.map(|t| t.get()), Some(4));
        assert_eq!(alinea.latitude, Some(41.91));
        assert_eq!(
            alinea.url.as_deref(),
            Some("https://guide.michelin.com/us/en/illinois/chicago/restaurant/alinea")
        );
        assert_eq!(
            parsed.next_page.map(String::from).as_deref(),
            Some("https://guide.michelin.com/us/en/restaurants/page/2")
        );
    }

    #[test]
    fn impossible_values_are_integrity_errors() {
        let html = [
            card("four-stars", &r#"<img class="michelin-award" src="/1star.svg">"#.repeat(4), "$$ · x"),
            card("pricey", "", "$$$$$ · x"),
            card("fine", "", "$ · x"),
        ]
        .join("");
        let parsed = parse(&page_at(URL, &format!("{html}<ul class=\"pagination\"><li class=\"active\">3</li></ul>"))).unwrap();
        assert!(matches!(parsed.records[0], Err(AppError::ExtractionIntegrity { .. })));
        assert!(matches!(parsed.records[1], Err(AppError::ExtractionIntegrity { .. })));
        assert!(parsed.records[2].is_ok());
        assert!(parsed.next_page.is_none());
    }
}
