use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

use crate::config::{AppConfig, ProviderEndpoint};
use crate::errors::AppResult;
use crate::normalize::COUNTRY;

const COUNTRY_CODE: &str = "bg";
const GOOGLE_PROVIDER_NAME: &str = "google";

/// One match returned by a provider, in provider ranking order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub lat: f64,
    pub lng: f64,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredQuery {
    pub street: String,
    pub city: String,
    pub country: String,
}

impl StructuredQuery {
    pub fn new(street: impl Into<String>, city: impl Into<String>) -> Self {
        Self {
            street: street.into(),
            city: city.into(),
            country: COUNTRY.to_string(),
        }
    }

    /// Exact string recorded in the result cache for this query.
    pub fn cache_key(&self) -> String {
        format!(
            "street={}; city={}; country={}",
            self.street, self.city, self.country
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LookupOutcome {
    /// The provider answered; an empty list means it has no data for the query.
    Candidates(Vec<Candidate>),
    /// Transport failure, non-2xx status or undecodable body.
    Unresolved { cause: String },
}

impl LookupOutcome {
    pub(crate) fn unresolved(cause: impl Into<String>) -> Self {
        LookupOutcome::Unresolved {
            cause: cause.into(),
        }
    }
}

#[async_trait]
pub trait GeocodeProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn search(&self, query: &str) -> LookupOutcome;

    async fn search_structured(&self, query: &StructuredQuery) -> LookupOutcome;
}

/// Blocks callers until `min_interval` has passed since the previous call.
pub struct RateLimiter {
    min_interval: Duration,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_tick: AsyncMutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub async fn wait(&self) {
        let interval = self.min_interval();
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < interval {
                trace!(wait = ?(interval - elapsed), "rate limiting provider call");
                sleep(interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}

fn http_client(config: &AppConfig) -> AppResult<reqwest::Client> {
    let http = reqwest::Client::builder()
        .user_agent(config.user_agent.clone())
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .build()?;
    Ok(http)
}

fn describe_transport_error(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        "request timed out".to_string()
    } else if err.is_connect() {
        format!("connection failed: {err}")
    } else {
        format!("request failed: {err}")
    }
}

/// Client for Nominatim-compatible `/search` endpoints, including the CORS relay.
pub struct NominatimClient {
    name: String,
    base_url: String,
    http: reqwest::Client,
    limit: u8,
    limiter: RateLimiter,
}

impl NominatimClient {
    pub fn new(endpoint: &ProviderEndpoint, config: &AppConfig) -> AppResult<Self> {
        Ok(Self {
            name: endpoint.name.clone(),
            base_url: endpoint.base_url.trim_end_matches('/').to_string(),
            http: http_client(config)?,
            limit: config.result_limit,
            limiter: RateLimiter::new(Duration::from_millis(config.provider_min_interval_ms)),
        })
    }

    async fn fetch(&self, mut params: Vec<(&'static str, String)>) -> LookupOutcome {
        #[derive(Deserialize)]
        struct Place {
            lat: Coordinate,
            lon: Coordinate,
            display_name: Option<String>,
            #[serde(rename = "type")]
            kind: Option<String>,
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Coordinate {
            Number(f64),
            Text(String),
        }

        impl Coordinate {
            fn value(&self) -> Option<f64> {
                match self {
                    Coordinate::Number(value) => Some(*value),
                    Coordinate::Text(text) => text.trim().parse().ok(),
                }
            }
        }

        params.extend([
            ("format", "json".to_string()),
            ("limit", self.limit.to_string()),
            ("countrycodes", COUNTRY_CODE.to_string()),
            ("addressdetails", "1".to_string()),
        ]);

        self.limiter.wait().await;
        let url = format!("{}/search", self.base_url);
        let response = match self.http.get(&url).query(&params).send().await {
            Ok(response) => response,
            Err(err) => return LookupOutcome::unresolved(describe_transport_error(&err)),
        };
        let status = response.status();
        if !status.is_success() {
            return LookupOutcome::unresolved(format!("http status {}", status.as_u16()));
        }
        let places: Vec<Place> = match response.json().await {
            Ok(places) => places,
            Err(err) => return LookupOutcome::unresolved(format!("undecodable response: {err}")),
        };

        let candidates = places
            .into_iter()
            .filter_map(|place| {
                Some(Candidate {
                    lat: place.lat.value()?,
                    lng: place.lon.value()?,
                    display_name: place.display_name.unwrap_or_default(),
                    kind: place.kind,
                })
            })
            .collect::<Vec<_>>();
        debug!(provider = %self.name, count = candidates.len(), "nominatim answered");
        LookupOutcome::Candidates(candidates)
    }
}

#[async_trait]
impl GeocodeProvider for NominatimClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, query: &str) -> LookupOutcome {
        self.fetch(vec![("q", query.to_string())]).await
    }

    async fn search_structured(&self, query: &StructuredQuery) -> LookupOutcome {
        let mut params = vec![("country", query.country.clone())];
        if !query.street.is_empty() {
            params.push(("street", query.street.clone()));
        }
        if !query.city.is_empty() {
            params.push(("city", query.city.clone()));
        }
        self.fetch(params).await
    }
}

/// Google Geocoding API; only built when an API key is configured.
pub struct GoogleGeocodingClient {
    endpoint: String,
    http: reqwest::Client,
    api_key: SecretString,
    limiter: RateLimiter,
}

impl GoogleGeocodingClient {
    pub fn new(api_key: SecretString, config: &AppConfig) -> AppResult<Self> {
        Ok(Self {
            endpoint: config.google_geocoding_endpoint.clone(),
            http: http_client(config)?,
            api_key,
            limiter: RateLimiter::new(Duration::from_millis(config.provider_min_interval_ms)),
        })
    }

    async fn fetch(&self, mut params: Vec<(&'static str, String)>) -> LookupOutcome {
        #[derive(Deserialize)]
        struct Response {
            status: String,
            #[serde(default)]
            results: Vec<ResponseResult>,
            error_message: Option<String>,
        }

        #[derive(Deserialize)]
        struct ResponseResult {
            formatted_address: Option<String>,
            geometry: ResponseGeometry,
            #[serde(default)]
            types: Vec<String>,
        }

        #[derive(Deserialize)]
        struct ResponseGeometry {
            location: ResponseLocation,
        }

        #[derive(Deserialize)]
        struct ResponseLocation {
            lat: f64,
            lng: f64,
        }

        params.extend([
            ("region", COUNTRY_CODE.to_string()),
            ("key", self.api_key.expose_secret().to_string()),
        ]);

        self.limiter.wait().await;
        let response = match self.http.get(&self.endpoint).query(&params).send().await {
            Ok(response) => response,
            Err(err) => {
                // the URL carries the API key
                return LookupOutcome::unresolved(describe_transport_error(&err.without_url()));
            }
        };
        let status = response.status();
        if !status.is_success() {
            return LookupOutcome::unresolved(format!("http status {}", status.as_u16()));
        }
        let parsed: Response = match response.json().await {
            Ok(parsed) => parsed,
            Err(err) => {
                return LookupOutcome::unresolved(format!(
                    "undecodable response: {}",
                    err.without_url()
                ))
            }
        };

        match parsed.status.as_str() {
            "OK" | "ZERO_RESULTS" => LookupOutcome::Candidates(
                parsed
                    .results
                    .into_iter()
                    .map(|result| Candidate {
                        lat: result.geometry.location.lat,
                        lng: result.geometry.location.lng,
                        display_name: result.formatted_address.unwrap_or_default(),
                        kind: result.types.into_iter().next(),
                    })
                    .collect(),
            ),
            other => LookupOutcome::unresolved(match parsed.error_message {
                Some(message) => format!("google status {other}: {message}"),
                None => format!("google status {other}"),
            }),
        }
    }
}

#[async_trait]
impl GeocodeProvider for GoogleGeocodingClient {
    fn name(&self) -> &str {
        GOOGLE_PROVIDER_NAME
    }

    async fn search(&self, query: &str) -> LookupOutcome {
        self.fetch(vec![("address", query.to_string())]).await
    }

    async fn search_structured(&self, query: &StructuredQuery) -> LookupOutcome {
        let mut components = vec![format!("country:{}", COUNTRY_CODE.to_uppercase())];
        if !query.city.is_empty() {
            components.push(format!("locality:{}", query.city));
        }
        self.fetch(vec![
            ("address", query.street.clone()),
            ("components", components.join("|")),
        ])
        .await
    }
}

/// Builds the configured providers in query order: Nominatim endpoints first, Google last.
pub fn build_providers(config: &AppConfig) -> AppResult<Vec<Arc<dyn GeocodeProvider>>> {
    let mut providers: Vec<Arc<dyn GeocodeProvider>> = Vec::new();
    for endpoint in &config.providers {
        providers.push(Arc::new(NominatimClient::new(endpoint, config)?));
    }
    if let Some(key) = config.google_geocoding_api_key.clone() {
        providers.push(Arc::new(GoogleGeocodingClient::new(key, config)?));
    }
    Ok(providers)
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::{HashMap, VecDeque};

    use parking_lot::Mutex;

    use super::*;

    /// Answers from a script keyed by query text (or structured cache key); unknown queries get `fallback`.
    pub(crate) struct ScriptedProvider {
        name: String,
        script: Mutex<HashMap<String, VecDeque<LookupOutcome>>>,
        fallback: LookupOutcome,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        pub(crate) fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                script: Mutex::new(HashMap::new()),
                fallback: LookupOutcome::Candidates(Vec::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn failing(name: &str) -> Self {
            Self {
                fallback: LookupOutcome::unresolved("request timed out"),
                ..Self::new(name)
            }
        }

        pub(crate) fn answer(self, key: &str, outcome: LookupOutcome) -> Self {
            self.script
                .lock()
                .entry(key.to_string())
                .or_default()
                .push_back(outcome);
            self
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn next(&self, key: String) -> LookupOutcome {
            let outcome = {
                let mut script = self.script.lock();
                script.get_mut(&key).and_then(|queue| {
                    if queue.len() > 1 {
                        queue.pop_front()
                    } else {
                        queue.front().cloned()
                    }
                })
            };
            self.calls.lock().push(key);
            outcome.unwrap_or_else(|| self.fallback.clone())
        }
    }

    #[async_trait]
    impl GeocodeProvider for ScriptedProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn search(&self, query: &str) -> LookupOutcome {
            self.next(query.to_string())
        }

        async fn search_structured(&self, query: &StructuredQuery) -> LookupOutcome {
            self.next(query.cache_key())
        }
    }

    pub(crate) fn candidate(lat: f64, lng: f64, display_name: &str) -> Candidate {
        Candidate {
            lat,
            lng,
            display_name: display_name.to_string(),
            kind: None,
        }
    }

    pub(crate) fn found(lat: f64, lng: f64, display_name: &str) -> LookupOutcome {
        LookupOutcome::Candidates(vec![candidate(lat, lng, display_name)])
    }
}
