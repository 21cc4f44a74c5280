//! The staleness-driven refresh loop.
//!
//! One document at a time: fetch every page of it, parse each page inside a
//! synchronous scope (the DOM never crosses an await), then reconcile the
//! records against the store and retract whatever the document no longer
//! lists.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{info, instrument, warn};
use url::Url;

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::identity::{IdentityResolver, ResolutionSource};
use crate::journal::{events, RunJournal};
use crate::locality::LocalityResolver;
use crate::models::{DocumentKind, LocalityRef, OgMetadata, RawScrapedRecord, SourceDocument};
use crate::page::{Page, PageFetcher};
use crate::sources::{dispatch, Source};
use crate::store::{AssociationChange, BindOutcome, Store, TombstoneCounts};

const DEFAULT_STALENESS_DAYS: i64 = 30;
const DEFAULT_MAX_PAGES: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshFilter {
    /// Every document past the staleness window.
    Stale,
    /// Just this document, whatever its age.
    Only(String),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DocumentReport {
    pub document_id: i64,
    pub url: String,
    pub layouts: Vec<&'static str>,
    pub pages: usize,
    pub records: usize,
    pub resolved: usize,
    pub unnamed: usize,
    pub integrity_failures: usize,
    pub unplaced: usize,
    pub skipped_deleted: usize,
    pub cache_hits: usize,
    pub restaurants_created: usize,
    pub associations_created: usize,
    pub associations_revived: usize,
    pub awards_recorded: usize,
    /// Set when a broken record kept the retraction sweep from running.
    pub sweep_skipped: bool,
    pub tombstoned: TombstoneCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentFailure {
    pub document_id: i64,
    pub url: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshReport {
    pub refreshed: Vec<DocumentReport>,
    pub failed: Vec<DocumentFailure>,
}

/// Raw output of every page of one document.
struct Harvest {
    layouts: Vec<&'static str>,
    pages: usize,
    records: Vec<AppResult<RawScrapedRecord>>,
    metadata: OgMetadata,
}

pub struct RefreshScheduler {
    store: Store,
    fetcher: Arc<dyn PageFetcher>,
    localities: LocalityResolver,
    identities: IdentityResolver,
    journal: RunJournal,
    staleness: chrono::Duration,
    max_pages: usize,
}

impl RefreshScheduler {
    pub fn new(
        store: Store,
        fetcher: Arc<dyn PageFetcher>,
        localities: LocalityResolver,
        identities: IdentityResolver,
        journal: RunJournal,
    ) -> Self {
        Self {
            store,
            fetcher,
            localities,
            identities,
            journal,
            staleness: chrono::Duration::days(DEFAULT_STALENESS_DAYS),
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    pub fn with_limits(mut self, staleness: chrono::Duration, max_pages: usize) -> Self {
        self.staleness = staleness;
        self.max_pages = max_pages.max(1);
        self
    }

    pub fn configured(self, config: &AppConfig) -> Self {
        self.with_limits(config.staleness_window(), config.max_listing_pages)
    }

    pub async fn run(&self, filter: RefreshFilter) -> AppResult<RefreshReport> {
        self.run_at(Utc::now(), filter).await
    }

    /// Runs one pass as of `now`. Per-document failures are reported and
    /// skipped; only errors that [`AppError::halts_run`] stop the pass.
    pub async fn run_at(&self, now: DateTime<Utc>, filter: RefreshFilter) -> AppResult<RefreshReport> {
        let documents = match &filter {
            RefreshFilter::Stale => self.store.stale_documents(now - self.staleness)?,
            RefreshFilter::Only(url) => {
                let document = self.store.document_by_url(url)?.ok_or_else(|| {
                    AppError::Config(format!("{url} is not a registered source document"))
                })?;
                vec![document]
            }
        };
        info!(documents = documents.len(), ?filter, "refresh pass starting");

        let mut report = RefreshReport::default();
        for document in documents {
            match self.refresh_document(&document, now).await {
                Ok(done) => {
                    self.journal.note(
                        events::DOCUMENT_REFRESHED,
                        json!({
                            "document_id": done.document_id,
                            "url": done.url,
                            "records": done.records,
                            "resolved": done.resolved,
                            "tombstoned": done.tombstoned,
                        }),
                    );
                    report.refreshed.push(done);
                }
                Err(err) => {
                    self.journal.note(
                        events::DOCUMENT_FAILED,
                        json!({ "document_id": document.id, "url": document.url, "error": err.to_string() }),
                    );
                    if err.halts_run() {
                        self.journal.flush()?;
                        return Err(err);
                    }
                    warn!(url = %document.url, error = %err, "document refresh failed");
                    report.failed.push(DocumentFailure {
                        document_id: document.id,
                        url: document.url.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }
        self.journal.flush()?;
        info!(
            refreshed = report.refreshed.len(),
            failed = report.failed.len(),
            "refresh pass finished"
        );
        Ok(report)
    }

    #[instrument(skip_all, fields(document_id = document.id, url = %document.url))]
    async fn refresh_document(
        &self,
        document: &SourceDocument,
        now: DateTime<Utc>,
    ) -> AppResult<DocumentReport> {
        let url = Url::parse(&document.url)
            .map_err(|err| AppError::Parse(format!("invalid document url {}: {err}", document.url)))?;
        let source = dispatch(&url)?;
        let harvest = self.harvest(source, url).await?;

        let mut report = DocumentReport {
            document_id: document.id,
            url: document.url.clone(),
            layouts: harvest.layouts,
            pages: harvest.pages,
            records: harvest.records.len(),
            ..DocumentReport::default()
        };

        for record in harvest.records {
            let record = match record {
                Ok(record) => record,
                Err(err) => {
                    report.integrity_failures += 1;
                    warn!(error = %err, "record rejected");
                    self.journal.note(
                        events::RECORD_REJECTED,
                        json!({ "document_id": document.id, "reason": err.to_string() }),
                    );
                    continue;
                }
            };
            self.reconcile(document, record, now, &mut report).await?;
        }

        if matches!(document.kind, DocumentKind::Article) {
            self.store.fill_document_metadata(document.id, &harvest.metadata)?;
        }
        // A rejected record may still be on the list; sweeping would retract it.
        if report.integrity_failures > 0 {
            report.sweep_skipped = true;
            warn!(
                integrity_failures = report.integrity_failures,
                "retraction sweep skipped"
            );
            self.journal.note(
                events::SWEEP_SKIPPED,
                json!({ "document_id": document.id, "integrity_failures": report.integrity_failures }),
            );
        } else {
            report.tombstoned = self.store.tombstone_unconfirmed(document.id, now)?;
        }
        self.store.mark_document_refreshed(document.id, now)?;
        info!(
            records = report.records,
            resolved = report.resolved,
            retracted = report.tombstoned.associations,
            "document refreshed"
        );
        Ok(report)
    }

    /// Fetches the document and any listing pages that follow it.
    async fn harvest(&self, source: Source, first: Url) -> AppResult<Harvest> {
        let mut harvest = Harvest {
            layouts: Vec::new(),
            pages: 0,
            records: Vec::new(),
            metadata: OgMetadata::default(),
        };
        let mut seen = HashSet::new();
        let mut next = Some(first);

        while let Some(page_url) = next.take() {
            if harvest.pages >= self.max_pages || !seen.insert(page_url.to_string()) {
                break;
            }
            let html = self.fetcher.fetch(&page_url).await?;
            let parsed = {
                let page = Page::parse(page_url, &html);
                source.parse_page(&page)?
            };
            harvest.pages += 1;
            if !harvest.layouts.contains(&parsed.layout) {
                harvest.layouts.push(parsed.layout);
            }
            if harvest.metadata.is_empty() {
                harvest.metadata = parsed.metadata;
            }
            harvest.records.extend(parsed.records);
            next = parsed.next_page;
        }
        Ok(harvest)
    }

    async fn reconcile(
        &self,
        document: &SourceDocument,
        record: RawScrapedRecord,
        now: DateTime<Utc>,
        report: &mut DocumentReport,
    ) -> AppResult<()> {
        let Some(name) = record.name.clone() else {
            report.unnamed += 1;
            self.journal.note(
                events::RECORD_REJECTED,
                json!({
                    "document_id": document.id,
                    "reason": "name not extractable",
                    "fingerprint": record.fingerprint(),
                }),
            );
            return Ok(());
        };

        let Some(locality) = self.place_record(document, &record).await? else {
            report.unplaced += 1;
            warn!(name, "no locality for record");
            self.journal.note(
                events::RECORD_REJECTED,
                json!({
                    "document_id": document.id,
                    "name": name,
                    "reason": "no locality",
                    "fingerprint": record.fingerprint(),
                }),
            );
            return Ok(());
        };

        let resolution = self.identities.resolve(&name, &locality, now).await?;
        report.resolved += 1;
        match resolution.source {
            ResolutionSource::Cache => report.cache_hits += 1,
            ResolutionSource::Lookup(BindOutcome::Created) => report.restaurants_created += 1,
            ResolutionSource::Lookup(_) => {}
        }
        let restaurant = resolution.restaurant;
        if restaurant.deleted_at.is_some() {
            report.skipped_deleted += 1;
            return Ok(());
        }

        match self.store.upsert_association(
            restaurant.id,
            document.id,
            record.description.as_deref(),
            record.url.as_deref(),
            now,
        )? {
            AssociationChange::Created => report.associations_created += 1,
            AssociationChange::Revived => report.associations_revived += 1,
            AssociationChange::Refreshed => {}
        }
        if let Some(award) = &record.award {
            self.store.upsert_award(restaurant.id, document.id, award, now)?;
            report.awards_recorded += 1;
        }
        self.store
            .merge_enrichment(restaurant.id, &record.enrichment(), now)?;
        Ok(())
    }

    /// Articles are about the document's locality. Award listings span many
    /// places, so each record's own place string is resolved, keeping the raw
    /// string when no canonical locality matches.
    async fn place_record(
        &self,
        document: &SourceDocument,
        record: &RawScrapedRecord,
    ) -> AppResult<Option<LocalityRef>> {
        let document_locality = match document.locality_id {
            Some(id) => Some(self.store.locality(id)?.ok_or_else(|| {
                AppError::Config(format!("document {} references missing locality {id}", document.id))
            })?),
            None => None,
        };

        match (document.kind, document_locality, record.locality.as_deref()) {
            (DocumentKind::Article, Some(locality), _) => Ok(Some(LocalityRef::Canonical(locality))),
            (DocumentKind::Article, None, None) => Ok(None),
            (DocumentKind::Article, None, Some(text)) => Ok(self
                .localities
                .resolve(text, record.country.as_deref())
                .await?
                .map(LocalityRef::Canonical)),
            (DocumentKind::AwardListing(_), _, Some(text)) => Ok(Some(
                match self.localities.resolve(text, record.country.as_deref()).await? {
                    Some(locality) => LocalityRef::Canonical(locality),
                    None => LocalityRef::Freeform(text.to_string()),
                },
            )),
            (DocumentKind::AwardListing(_), locality, None) => Ok(locality.map(LocalityRef::Canonical)),
        }
    }
}
