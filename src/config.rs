use std::path::PathBuf;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::{debug, warn};

const DEFAULT_PROVIDERS: &str = "nominatim=https://nominatim.openstreetmap.org";
const DEFAULT_USER_AGENT: &str = concat!("hospital-geocoder/", env!("CARGO_PKG_VERSION"));
const DEFAULT_GOOGLE_ENDPOINT: &str = "https://maps.googleapis.com/maps/api/geocode/json";
const DEFAULT_JOURNAL_KEEP_RUNS: usize = 20;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProviderEndpoint {
    pub name: String,
    pub base_url: String,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub providers: Vec<ProviderEndpoint>,
    pub user_agent: String,
    pub provider_min_interval_ms: u64,
    pub request_timeout_secs: u64,
    pub result_limit: u8,
    pub max_attempts: u32,
    pub cache_file: PathBuf,
    pub cache_flush_every: usize,
    pub journal_enabled: bool,
    pub journal_keep_runs: usize,
    pub google_geocoding_endpoint: String,
    pub google_geocoding_api_key: Option<SecretString>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub providers: Vec<ProviderEndpoint>,
    pub user_agent: String,
    pub provider_min_interval_ms: u64,
    pub request_timeout_secs: u64,
    pub result_limit: u8,
    pub max_attempts: u32,
    pub cache_file: String,
    pub cache_flush_every: usize,
    pub journal_enabled: bool,
    pub has_google_geocoding_key: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            providers: parse_providers(DEFAULT_PROVIDERS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            provider_min_interval_ms: 1_000,
            request_timeout_secs: 15,
            result_limit: 5,
            max_attempts: 2,
            cache_file: PathBuf::from("geocode_cache.json"),
            cache_flush_every: 25,
            journal_enabled: true,
            journal_keep_runs: DEFAULT_JOURNAL_KEEP_RUNS,
            google_geocoding_endpoint: DEFAULT_GOOGLE_ENDPOINT.to_string(),
            google_geocoding_api_key: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            providers: parse_providers(
                &env::var("GEOCODER_PROVIDERS").unwrap_or_else(|_| DEFAULT_PROVIDERS.to_string()),
            ),
            user_agent: env::var("GEOCODER_USER_AGENT")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            provider_min_interval_ms: parse_u64("GEOCODER_MIN_INTERVAL_MS", 1_000),
            request_timeout_secs: parse_u64("GEOCODER_TIMEOUT_SECS", 15).max(1),
            result_limit: parse_u64("GEOCODER_RESULT_LIMIT", 5).clamp(1, 50) as u8,
            max_attempts: parse_u32("GEOCODER_MAX_ATTEMPTS", 2).max(1),
            cache_file: env::var("GEOCODER_CACHE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("geocode_cache.json")),
            cache_flush_every: parse_usize("GEOCODER_CACHE_FLUSH_EVERY", 25),
            journal_enabled: parse_bool("GEOCODER_JOURNAL_ENABLED", true),
            journal_keep_runs: parse_usize("GEOCODER_JOURNAL_KEEP_RUNS", DEFAULT_JOURNAL_KEEP_RUNS)
                .max(1),
            google_geocoding_endpoint: env::var("GOOGLE_GEOCODING_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_GOOGLE_ENDPOINT.to_string()),
            google_geocoding_api_key: env::var("GOOGLE_GEOCODING_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            providers: self.providers.clone(),
            user_agent: self.user_agent.clone(),
            provider_min_interval_ms: self.provider_min_interval_ms,
            request_timeout_secs: self.request_timeout_secs,
            result_limit: self.result_limit,
            max_attempts: self.max_attempts,
            cache_file: self.cache_file.to_string_lossy().to_string(),
            cache_flush_every: self.cache_flush_every,
            journal_enabled: self.journal_enabled,
            has_google_geocoding_key: self.google_geocoding_api_key.is_some(),
        }
    }
}

/// Parses `name=url` pairs separated by commas. A bare URL is named after its host.
pub fn parse_providers(value: &str) -> Vec<ProviderEndpoint> {
    let mut providers = Vec::new();
    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, url) = match entry.split_once('=') {
            Some((name, url)) => (name.trim().to_string(), url.trim()),
            None => (host_of(entry), entry),
        };
        let base_url = url.trim_end_matches('/').to_string();
        if name.is_empty() || !(base_url.starts_with("http://") || base_url.starts_with("https://"))
        {
            warn!(entry, "ignoring malformed provider entry");
            continue;
        }
        providers.push(ProviderEndpoint { name, base_url });
    }
    providers
}

fn host_of(url: &str) -> String {
    url.split("://")
        .nth(1)
        .unwrap_or(url)
        .split(['/', ':'])
        .next()
        .unwrap_or_default()
        .to_string()
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_public_profile_without_secrets() {
        env::set_var("GOOGLE_GEOCODING_API_KEY", "secret");
        env::set_var("GEOCODER_CACHE_FILE", "custom-cache.json");
        env::set_var("GEOCODER_JOURNAL_ENABLED", "false");
        env::set_var("GEOCODER_MAX_ATTEMPTS", "0");

        let config = AppConfig::from_env();
        let public = config.public_profile();

        assert_eq!(public.cache_file, "custom-cache.json");
        assert!(!public.journal_enabled);
        assert!(public.has_google_geocoding_key);
        assert!(config.google_geocoding_api_key.is_some());
        assert_eq!(public.max_attempts, 1);
        let rendered = serde_json::to_string(&public).unwrap();
        assert!(!rendered.contains("secret\""));
    }

    #[test]
    fn parses_named_and_bare_provider_entries() {
        let providers = parse_providers(
            "nominatim=https://nominatim.openstreetmap.org/, https://relay.example.org:8080/api",
        );
        assert_eq!(providers.len(), 2);
        assert_eq!(providers[0].name, "nominatim");
        assert_eq!(providers[0].base_url, "https://nominatim.openstreetmap.org");
        assert_eq!(providers[1].name, "relay.example.org");
        assert_eq!(providers[1].base_url, "https://relay.example.org:8080/api");
    }

    #[test]
    fn skips_provider_entries_without_scheme() {
        let providers = parse_providers("broken=localhost,,ok=http://127.0.0.1:9000");
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].name, "ok");
    }
}
