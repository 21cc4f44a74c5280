use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;
use url::Url;

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::models::OgMetadata;

const USER_AGENT: &str = concat!("fuego-harvester/", env!("CARGO_PKG_VERSION"));

/// Read-only source of page markup. Any failure to obtain a page is a
/// navigation error for that url.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> AppResult<String>;
}

pub fn fetcher_from_config(config: &AppConfig) -> AppResult<Arc<dyn PageFetcher>> {
    match config.browserless_url.as_deref() {
        Some(base_url) => Ok(Arc::new(BrowserlessFetcher::new(
            base_url,
            config.browserless_token.clone(),
        )?)),
        None => Ok(Arc::new(HttpPageFetcher::new()?)),
    }
}

pub struct HttpPageFetcher {
    http: reqwest::Client,
}

impl HttpPageFetcher {
    pub fn new() -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(&self, url: &Url) -> AppResult<String> {
        let response = self
            .http
            .get(url.as_str())
            .send()
            .await
            .map_err(|err| AppError::navigation(url.as_str(), err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::navigation(url.as_str(), format!("status {status}")));
        }
        let body = response
            .text()
            .await
            .map_err(|err| AppError::navigation(url.as_str(), err))?;
        debug!(%url, bytes = body.len(), "page fetched");
        Ok(body)
    }
}

/// Fetches fully rendered markup through a browserless `/content` endpoint.
pub struct BrowserlessFetcher {
    http: reqwest::Client,
    base_url: String,
    token: Option<SecretString>,
}

impl BrowserlessFetcher {
    pub fn new(base_url: &str, token: Option<SecretString>) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }
}

#[async_trait]
impl PageFetcher for BrowserlessFetcher {
    async fn fetch(&self, url: &Url) -> AppResult<String> {
        let endpoint = format!("{}/content", self.base_url);
        let mut request = self
            .http
            .post(&endpoint)
            .json(&serde_json::json!({ "url": url.as_str() }));
        if let Some(token) = &self.token {
            request = request.query(&[("token", token.expose_secret())]);
        }

        let response = request
            .send()
            .await
            .map_err(|err| AppError::navigation(url.as_str(), err))?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AppError::navigation(
                url.as_str(),
                format!("browserless responded {status}: {message}"),
            ));
        }
        response
            .text()
            .await
            .map_err(|err| AppError::navigation(url.as_str(), err))
    }
}

/// A loaded page. Holds the parsed DOM, so it stays on one thread and never
/// crosses an await point.
pub struct Page {
    url: Url,
    document: Html,
}

impl Page {
    pub fn parse(url: Url, html: &str) -> Self {
        Self {
            url,
            document: Html::parse_document(html),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn select(&self, css: &str) -> AppResult<Vec<ElementRef<'_>>> {
        let selector = selector(css)?;
        Ok(self.document.select(&selector).collect())
    }

    pub fn count(&self, css: &str) -> AppResult<usize> {
        let selector = selector(css)?;
        Ok(self.document.select(&selector).count())
    }

    pub fn first_text(&self, css: &str) -> AppResult<Option<String>> {
        let selector = selector(css)?;
        Ok(self.document.select(&selector).find_map(element_text))
    }

    pub fn resolve(&self, href: &str) -> Option<String> {
        let href = href.trim();
        if href.is_empty() {
            return None;
        }
        self.url.join(href).ok().map(String::from)
    }

    pub fn og_metadata(&self) -> OgMetadata {
        OgMetadata {
            title: self.meta_property("og:title"),
            description: self.meta_property("og:description"),
            image: self.meta_property("og:image"),
            site_name: self.meta_property("og:site_name"),
        }
    }

    fn meta_property(&self, property: &str) -> Option<String> {
        let css = format!(r#"meta[property="{property}"]"#);
        let selector = selector(&css).ok()?;
        self.document
            .select(&selector)
            .filter_map(|meta| meta.value().attr("content"))
            .map(clean_text)
            .find(|value| !value.is_empty())
    }
}

pub fn selector(css: &str) -> AppResult<Selector> {
    Selector::parse(css).map_err(|err| AppError::Parse(format!("invalid selector `{css}`: {err}")))
}

/// Collapses runs of whitespace, including newlines, to single spaces.
pub fn clean_text(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn element_text(element: ElementRef<'_>) -> Option<String> {
    let text = clean_text(&element.text().collect::<Vec<_>>().join(" "));
    (!text.is_empty()).then_some(text)
}

/// Non-empty text nodes of an element, in document order.
pub fn text_lines(element: ElementRef<'_>) -> Vec<String> {
    element
        .text()
        .map(clean_text)
        .filter(|line| !line.is_empty())
        .collect()
}

pub fn child_text(element: ElementRef<'_>, selector: &Selector) -> Option<String> {
    element.select(selector).find_map(element_text)
}

pub fn child_attr(element: ElementRef<'_>, selector: &Selector, attr: &str) -> Option<String> {
    element
        .select(selector)
        .filter_map(|child| child.value().attr(attr))
        .map(clean_text)
        .find(|value| !value.is_empty())
}

pub fn attr(element: ElementRef<'_>, name: &str) -> Option<String> {
    element
        .value()
        .attr(name)
        .map(clean_text)
        .filter(|value| !value.is_empty())
}

pub fn has_class(element: ElementRef<'_>, class: &str) -> bool {
    element.value().classes().any(|value| value == class)
}

#[cfg(test)]
mod tests {
    use httptest::{matchers::*, responders::*, Expectation, Server};

    use super::*;

    const ARTICLE: &str = r#"
        <html><head>
            <meta property="og:title" content="The 38 Best Restaurants in LA">
            <meta property="og:site_name" content="Eater LA">
        </head><body>
            <h2 class="name">  Bavel
                </h2>
            <p>first</p><p>second</p>
            <a class="link" href="/venues/bavel">more</a>
        </body></html>
    "#;

    fn page() -> Page {
        Page::parse(
            Url::parse("https://la.eater.com/maps/best").unwrap(),
            ARTICLE,
        )
    }

    #[test]
    fn reads_text_and_metadata() {
        let page = page();
        assert_eq!(page.first_text("h2.name").unwrap().as_deref(), Some("Bavel"));
        assert_eq!(page.count("p").unwrap(), 2);
        let meta = page.og_metadata();
        assert_eq!(meta.title.as_deref(), Some("The 38 Best Restaurants in LA"));
        assert_eq!(meta.site_name.as_deref(), Some("Eater LA"));
        assert!(meta.image.is_none());
    }

    #[test]
    fn resolves_relative_links_against_page_url() {
        let page = page();
        let link = page.select("a.link").unwrap()[0];
        let href = attr(link, "href").unwrap();
        assert_eq!(
            page.resolve(&href).as_deref(),
            Some("https://la.eater.com/venues/bavel")
        );
    }

    #[test]
    fn rejects_malformed_selectors() {
        assert!(matches!(page().count("div[["), Err(AppError::Parse(_))));
    }

    #[tokio::test]
    async fn http_failures_are_navigation_errors() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/gone")).respond_with(status_code(404)),
        );
        server.expect(
            Expectation::matching(request::method_path("GET", "/ok"))
                .respond_with(status_code(200).body("<p>hi</p>")),
        );
        let fetcher = HttpPageFetcher::new().unwrap();

        let gone = Url::parse(&server.url_str("/gone")).unwrap();
        let err = fetcher.fetch(&gone).await.unwrap_err();
        assert!(matches!(err, AppError::Navigation { .. }));

        let ok = Url::parse(&server.url_str("/ok")).unwrap();
        assert_eq!(fetcher.fetch(&ok).await.unwrap(), "<p>hi</p>");
    }

    #[tokio::test]
    async fn browserless_posts_url_to_content_endpoint() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/content"),
                request::query(url_decoded(contains(("token", "t0ken")))),
                request::body(json_decoded(eq(
                    serde_json::json!({ "url": "https://www.eater.com/maps/x" })
                ))),
            ])
            .respond_with(status_code(200).body("<html></html>")),
        );
        let fetcher = BrowserlessFetcher::new(
            &server.url_str(""),
            Some(SecretString::from("t0ken".to_string())),
        )
        .unwrap();
        let body = fetcher
            .fetch(&Url::parse("https://www.eater.com/maps/x").unwrap())
            .await
            .unwrap();
        assert_eq!(body, "<html></html>");
    }
}
