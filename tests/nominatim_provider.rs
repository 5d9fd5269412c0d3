use std::time::Duration;

use httptest::matchers::{all_of, contains, request, url_decoded};
use httptest::responders::{delay_and_then, json_encoded, status_code};
use httptest::{Expectation, Server};
use secrecy::SecretString;
use serde_json::json;

use hospital_geocoder::config::ProviderEndpoint;
use hospital_geocoder::providers::{GoogleGeocodingClient, NominatimClient, StructuredQuery};
use hospital_geocoder::{AppConfig, GeocodeProvider, LookupOutcome};

fn test_config() -> AppConfig {
    AppConfig {
        user_agent: "hospital-geocoder-tests/1.0".into(),
        provider_min_interval_ms: 0,
        request_timeout_secs: 1,
        result_limit: 3,
        ..AppConfig::default()
    }
}

fn nominatim(server: &Server) -> NominatimClient {
    let endpoint = ProviderEndpoint {
        name: "mock".into(),
        base_url: server.url_str(""),
    };
    NominatimClient::new(&endpoint, &test_config()).unwrap()
}

#[tokio::test]
async fn free_text_search_returns_candidates() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/search"),
            request::query(url_decoded(contains(("q", "бул. Витоша 1, София, Bulgaria")))),
            request::query(url_decoded(contains(("countrycodes", "bg")))),
            request::query(url_decoded(contains(("format", "json")))),
            request::query(url_decoded(contains(("limit", "3")))),
            request::headers(contains(("user-agent", "hospital-geocoder-tests/1.0"))),
        ])
        .respond_with(json_encoded(json!([
            {
                "lat": "42.6953",
                "lon": "23.3219",
                "display_name": "1, бул. Витоша, София, България",
                "type": "hospital"
            },
            { "lat": "not a number", "lon": "23.0" }
        ]))),
    );

    let client = nominatim(&server);
    let outcome = client.search("бул. Витоша 1, София, Bulgaria").await;
    let LookupOutcome::Candidates(candidates) = outcome else {
        panic!("expected candidates, got {outcome:?}");
    };
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].lat, 42.6953);
    assert_eq!(candidates[0].lng, 23.3219);
    assert_eq!(candidates[0].kind.as_deref(), Some("hospital"));
    assert_eq!(client.name(), "mock");
}

#[tokio::test]
async fn structured_search_sends_separate_fields() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/search"),
            request::query(url_decoded(contains(("street", "ул. Шипка 3")))),
            request::query(url_decoded(contains(("city", "Варна")))),
            request::query(url_decoded(contains(("country", "Bulgaria")))),
        ])
        .respond_with(json_encoded(json!([]))),
    );

    let client = nominatim(&server);
    let outcome = client
        .search_structured(&StructuredQuery::new("ул. Шипка 3", "Варна"))
        .await;
    assert_eq!(outcome, LookupOutcome::Candidates(Vec::new()));
}

#[tokio::test]
async fn server_error_is_unresolved() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/search"))
            .respond_with(status_code(500)),
    );

    let outcome = nominatim(&server).search("Пловдив, Bulgaria").await;
    match outcome {
        LookupOutcome::Unresolved { cause } => assert!(cause.contains("500"), "{cause}"),
        other => panic!("expected unresolved, got {other:?}"),
    }
}

#[tokio::test]
async fn undecodable_body_is_unresolved() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/search"))
            .respond_with(status_code(200).body("<html>rate limited</html>")),
    );

    let outcome = nominatim(&server).search("Пловдив, Bulgaria").await;
    assert!(matches!(outcome, LookupOutcome::Unresolved { cause } if cause.contains("undecodable")));
}

#[tokio::test]
async fn slow_response_times_out() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/search")).respond_with(
            delay_and_then(Duration::from_secs(3), json_encoded(json!([]))),
        ),
    );

    let outcome = nominatim(&server).search("Шумен, Bulgaria").await;
    match outcome {
        LookupOutcome::Unresolved { cause } => assert!(cause.contains("timed out"), "{cause}"),
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn google_results_become_candidates() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/maps/api/geocode/json"),
            request::query(url_decoded(contains(("address", "бул. Витоша 1")))),
            request::query(url_decoded(contains(("components", "country:BG|locality:София")))),
            request::query(url_decoded(contains(("region", "bg")))),
            request::query(url_decoded(contains(("key", "test-key")))),
        ])
        .respond_with(json_encoded(json!({
            "status": "OK",
            "results": [{
                "formatted_address": "bul. Vitosha 1, Sofia, Bulgaria",
                "geometry": { "location": { "lat": 42.6953, "lng": 23.3219 } },
                "types": ["street_address"]
            }]
        }))),
    );

    let config = AppConfig {
        google_geocoding_endpoint: server.url_str("/maps/api/geocode/json"),
        ..test_config()
    };
    let client = GoogleGeocodingClient::new(SecretString::from("test-key".to_string()), &config)
        .unwrap();
    let outcome = client
        .search_structured(&StructuredQuery::new("бул. Витоша 1", "София"))
        .await;
    let LookupOutcome::Candidates(candidates) = outcome else {
        panic!("expected candidates, got {outcome:?}");
    };
    assert_eq!(candidates[0].display_name, "bul. Vitosha 1, Sofia, Bulgaria");
    assert_eq!(candidates[0].kind.as_deref(), Some("street_address"));
    assert_eq!(client.name(), "google");
}

#[tokio::test]
async fn google_denial_is_unresolved_without_leaking_key() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/maps/api/geocode/json"))
            .respond_with(json_encoded(json!({
                "status": "REQUEST_DENIED",
                "error_message": "The provided API key is invalid."
            }))),
    );

    let config = AppConfig {
        google_geocoding_endpoint: server.url_str("/maps/api/geocode/json"),
        ..test_config()
    };
    let client = GoogleGeocodingClient::new(SecretString::from("test-key".to_string()), &config)
        .unwrap();
    match client.search("Варна, Bulgaria").await {
        LookupOutcome::Unresolved { cause } => {
            assert!(cause.contains("REQUEST_DENIED"));
            assert!(!cause.contains("test-key"));
        }
        other => panic!("expected unresolved, got {other:?}"),
    }
}
