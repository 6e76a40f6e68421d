//! Router over real HTTP backends, each tier served by its own `wiremock`
//! server and built through `Router::from_config`.

use std::time::Duration;

use serde_json::json;
use tokio_cost_router::config::{BackendKind, RouterConfig};
use tokio_cost_router::{ErrorKind, RouteRequest, Router, RouterError, Tier};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ============================================================================
// Test Infrastructure
// ============================================================================

struct Servers {
    cheap: MockServer,
    mid: MockServer,
    premium: MockServer,
}

async fn servers() -> Servers {
    Servers {
        cheap: MockServer::start().await,
        mid: MockServer::start().await,
        premium: MockServer::start().await,
    }
}

/// Each test uses its own key variables so parallel tests never race on the
/// process environment.
fn config_for(s: &Servers, test: &str) -> RouterConfig {
    let mid_var = format!("ROUTER_TEST_{test}_MID_KEY");
    let premium_var = format!("ROUTER_TEST_{test}_PREMIUM_KEY");
    std::env::set_var(&mid_var, "sk-mid-secret");
    std::env::set_var(&premium_var, "sk-premium-secret");

    let mut c = RouterConfig::default();
    c.backends.per_tier_timeout_ms = 500;
    c.backends.cheap.url = Some(s.cheap.uri());
    c.backends.mid.url = Some(s.mid.uri());
    c.backends.mid.api_key_env = Some(mid_var);
    c.backends.premium.url = Some(s.premium.uri());
    c.backends.premium.api_key_env = Some(premium_var);
    c
}

fn openai_ok(text: &str, prompt_tokens: u64, completion_tokens: u64) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{"message": {"role": "assistant", "content": text}}],
        "usage": {"prompt_tokens": prompt_tokens, "completion_tokens": completion_tokens}
    }))
}

// ============================================================================
// Cascade over HTTP
// ============================================================================

#[tokio::test]
async fn test_local_503_falls_back_to_openai_and_bills_usage() {
    let s = servers().await;
    Mock::given(method("POST"))
        .and(path("/completion"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&s.cheap)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-mid-secret"))
        .respond_with(openai_ok("Python is a language.", 10, 20))
        .expect(1)
        .mount(&s.mid)
        .await;

    let router = Router::from_config(&config_for(&s, "FALLBACK")).unwrap();
    let resp = router.handle(RouteRequest::new("What is Python?")).await.unwrap();

    assert_eq!(resp.tier, Tier::Mid);
    assert_eq!(resp.backend, "gpt-4o-mini");
    assert_eq!(resp.response, "Python is a language.");
    assert!((resp.cost - 30.0 / 1000.0 * 0.0006).abs() < 1e-12);
    assert_eq!(resp.attempts.len(), 1);
    assert_eq!(resp.attempts[0].kind, ErrorKind::Unavailable);
    assert!(!resp.attempts[0].message.contains("sk-"));
}

#[tokio::test]
async fn test_every_tier_failing_classifies_each_status() {
    let s = servers().await;
    Mock::given(method("POST"))
        .and(path("/completion"))
        .respond_with(ResponseTemplate::new(504))
        .mount(&s.cheap)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&s.mid)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream stack trace"))
        .mount(&s.premium)
        .await;

    let router = Router::from_config(&config_for(&s, "ALLFAIL")).unwrap();
    let err = router.handle(RouteRequest::new("hello")).await.unwrap_err();
    let RouterError::ExhaustedFailed { attempts } = err else {
        panic!("expected ExhaustedFailed, got {err:?}");
    };
    let kinds: Vec<_> = attempts.iter().map(|a| a.kind).collect();
    assert_eq!(
        kinds,
        [ErrorKind::Timeout, ErrorKind::QuotaExceeded, ErrorKind::Unavailable]
    );
    assert!(attempts.iter().all(|a| !a.message.contains("stack trace")));
    assert!(router.ledger().is_empty());
}

#[tokio::test]
async fn test_slow_local_backend_times_out_and_escalates() {
    let s = servers().await;
    Mock::given(method("POST"))
        .and(path("/completion"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"content": "too late"}))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&s.cheap)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(openai_ok("on time", 2, 2))
        .mount(&s.mid)
        .await;

    let router = Router::from_config(&config_for(&s, "SLOW")).unwrap();
    let resp = router.handle(RouteRequest::new("hi")).await.unwrap();
    assert_eq!(resp.response, "on time");
    assert_eq!(resp.attempts[0].kind, ErrorKind::Timeout);
}

// ============================================================================
// Forced premium
// ============================================================================

#[tokio::test]
async fn test_forced_premium_calls_anthropic_with_headers() {
    let s = servers().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "sk-premium-secret"))
        .and(header("anthropic-version", "2023-06-01"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [{"type": "text", "text": "Deep answer."}],
            "usage": {"input_tokens": 12, "output_tokens": 8}
        })))
        .expect(1)
        .mount(&s.premium)
        .await;

    let router = Router::from_config(&config_for(&s, "FORCED")).unwrap();
    let resp = router
        .handle(RouteRequest::new("What is Python?").with_forced_backend(Tier::Premium))
        .await
        .unwrap();
    assert_eq!(resp.tier, Tier::Premium);
    assert_eq!(resp.response, "Deep answer.");
    assert!((resp.cost - 20.0 / 1000.0 * 0.015).abs() < 1e-12);
    assert_eq!(router.ledger().records()[0].tokens, 20);
}

// ============================================================================
// Health
// ============================================================================

#[tokio::test]
async fn test_health_probes_each_backend() {
    let s = servers().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&s.cheap)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&s.mid)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
        .mount(&s.premium)
        .await;

    let router = Router::from_config(&config_for(&s, "HEALTH")).unwrap();
    let report = router.health().await;
    assert_eq!(report.status, "degraded");
    let live: Vec<_> = report.backends.iter().map(|b| (b.tier, b.live)).collect();
    assert_eq!(
        live,
        [(Tier::Cheap, true), (Tier::Mid, false), (Tier::Premium, true)]
    );
}

// ============================================================================
// Construction
// ============================================================================

#[test]
fn test_missing_api_key_is_config_error() {
    let mut c = RouterConfig::default();
    c.backends.mid.api_key_env = Some("ROUTER_TEST_DEFINITELY_UNSET_KEY".into());
    let err = Router::from_config(&c).unwrap_err();
    assert!(matches!(err, RouterError::Config(_)));
}

#[test]
fn test_disabled_tiers_are_skipped() {
    let mut c = RouterConfig::default();
    c.backends.cheap.kind = BackendKind::Echo;
    c.backends.mid.enabled = false;
    c.backends.premium.enabled = false;
    let router = Router::from_config(&c).unwrap();
    assert_eq!(router.stats().ledger.record_count, 0);
}
