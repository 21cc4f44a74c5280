use std::path::PathBuf;
use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

const DEFAULT_JOURNAL_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_JOURNAL_MAX_FILES: usize = 5;
const DEFAULT_GOOGLE_PLACES_API_BASE: &str = "https://maps.googleapis.com/maps/api/place";
const DEFAULT_OPENAI_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_OPENAI_MODEL: &str = "gpt-3.5-turbo";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub journal_dir: PathBuf,
    pub journal_max_bytes: u64,
    pub journal_max_files: usize,
    pub staleness_days: i64,
    pub places_rate_limit_qps: u32,
    pub google_places_api_key: Option<SecretString>,
    pub google_places_api_base: String,
    pub openai_api_key: Option<SecretString>,
    pub openai_api_base: String,
    pub openai_model: String,
    pub oracle_countries: Vec<String>,
    pub browserless_url: Option<String>,
    pub browserless_token: Option<SecretString>,
    pub max_listing_pages: usize,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub database_path: String,
    pub journal_dir: String,
    pub staleness_days: i64,
    pub places_rate_limit_qps: u32,
    pub google_places_api_base: String,
    pub openai_api_base: String,
    pub openai_model: String,
    pub oracle_countries: Vec<String>,
    pub uses_browserless: bool,
    pub max_listing_pages: usize,
    pub retry_max_attempts: u32,
    pub has_google_places_key: bool,
    pub has_openai_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            database_path: env::var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("fuego.db")),
            journal_dir: env::var("JOURNAL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            journal_max_bytes: parse_u64("JOURNAL_MAX_BYTES", DEFAULT_JOURNAL_MAX_BYTES),
            journal_max_files: parse_usize("JOURNAL_MAX_FILES", DEFAULT_JOURNAL_MAX_FILES).max(1),
            staleness_days: parse_u64("STALENESS_DAYS", 30) as i64,
            places_rate_limit_qps: parse_u32("PLACES_RATE_LIMIT_QPS", 3),
            google_places_api_key: secret_var("GOOGLE_PLACES_API_KEY"),
            google_places_api_base: env::var("GOOGLE_PLACES_API_BASE")
                .unwrap_or_else(|_| DEFAULT_GOOGLE_PLACES_API_BASE.to_string()),
            openai_api_key: secret_var("OPENAI_API_KEY"),
            openai_api_base: env::var("OPENAI_API_BASE")
                .unwrap_or_else(|_| DEFAULT_OPENAI_API_BASE.to_string()),
            openai_model: env::var("OPENAI_MODEL")
                .unwrap_or_else(|_| DEFAULT_OPENAI_MODEL.to_string()),
            oracle_countries: parse_list("ORACLE_COUNTRIES", &["us"]),
            browserless_url: env::var("BROWSERLESS_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            browserless_token: secret_var("BROWSERLESS_TOKEN"),
            max_listing_pages: parse_usize("MAX_LISTING_PAGES", 50).max(1),
            retry_max_attempts: parse_u32("RETRY_MAX_ATTEMPTS", 5).max(1),
            retry_base_delay_ms: parse_u64("RETRY_BASE_DELAY_MS", 250),
        }
    }

    pub fn staleness_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.staleness_days)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            database_path: self.database_path.display().to_string(),
            journal_dir: self.journal_dir.display().to_string(),
            staleness_days: self.staleness_days,
            places_rate_limit_qps: self.places_rate_limit_qps,
            google_places_api_base: self.google_places_api_base.clone(),
            openai_api_base: self.openai_api_base.clone(),
            openai_model: self.openai_model.clone(),
            oracle_countries: self.oracle_countries.clone(),
            uses_browserless: self.browserless_url.is_some(),
            max_listing_pages: self.max_listing_pages,
            retry_max_attempts: self.retry_max_attempts,
            has_google_places_key: self.google_places_api_key.is_some(),
            has_openai_key: self.openai_api_key.is_some(),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn secret_var(key: &str) -> Option<SecretString> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(SecretString::from)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn parse_list(key: &str, default: &[&str]) -> Vec<String> {
    match env::var(key) {
        Ok(value) => value
            .split(',')
            .map(|item| item.trim().to_lowercase())
            .filter(|item| !item.is_empty())
            .collect(),
        Err(_) => default.iter().map(|item| item.to_string()).collect(),
    }
}
