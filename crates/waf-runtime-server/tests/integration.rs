//! Integration tests for waf-runtime-server.
//!
//! These tests drive the full router:
//! - Pre-filter blocks never reach the guest
//! - Verified bot caching and expiry
//! - Fail-open behavior on runtime failures
//! - Blocked response shape and delay
//! - A real guest behind the filter, and a real listener

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tower::util::ServiceExt;

use waf_runtime_common::{
    CallError, DnsConfig, EngineConfig, FilterConfig, FilterError, RuntimeConfig, RuntimeError,
};
use waf_runtime_core::{AnalyzeRequestInput, CompiledModule, Outcome, WasmEngine};
use waf_runtime_host::{ReverseDnsResolver, RuntimeHandle};
use waf_runtime_server::{
    AppState, BlockDelay, Classifier, ClientInfo, RequestAnalyzer, ServerConfig, WafServer,
    build_router,
};

// ============================================================================
// Fixtures
// ============================================================================

const BROWSER: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) Gecko/20100101 Firefox/128.0";

/// Answers every request the same way and records what it was asked.
struct Recording {
    answer: Result<Outcome, FilterError>,
    calls: AtomicUsize,
    inputs: Mutex<Vec<AnalyzeRequestInput>>,
}

impl Recording {
    fn new(answer: Result<Outcome, FilterError>) -> Arc<Self> {
        Arc::new(Self {
            answer,
            calls: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_input(&self) -> Option<AnalyzeRequestInput> {
        self.inputs.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Classifier for Recording {
    async fn analyze_request(&self, input: &AnalyzeRequestInput) -> Result<Outcome, FilterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().unwrap().push(input.clone());
        self.answer.clone()
    }
}

fn app() -> Router {
    Router::new().fallback(|| async { "protected" })
}

fn state(classifier: Arc<dyn Classifier>, config: FilterConfig) -> AppState {
    AppState::from_analyzer(
        RequestAnalyzer::new(classifier, config).with_block_delay(BlockDelay::none()),
    )
}

fn router(classifier: Arc<dyn Classifier>) -> Router {
    router_with(classifier, FilterConfig::default())
}

fn router_with(classifier: Arc<dyn Classifier>, config: FilterConfig) -> Router {
    build_router(state(classifier, config), app(), Duration::from_secs(30))
}

fn client() -> ClientInfo {
    ClientInfo::new(IpAddr::from([203, 0, 113, 50]), "SE", 1257)
}

fn request(path: &str, user_agent: Option<&str>, client: ClientInfo) -> Request<Body> {
    let mut builder = Request::builder().uri(path);
    if let Some(user_agent) = user_agent {
        builder = builder.header(header::USER_AGENT, user_agent);
    }

    let mut request = builder.body(Body::empty()).unwrap();
    request.extensions_mut().insert(client);
    request
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, String) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

// ============================================================================
// Test: Pre-filters
// ============================================================================

#[tokio::test]
async fn test_empty_user_agent_blocked_without_guest_call() {
    let classifier = Recording::new(Ok(Outcome::Allowed));
    let router = router(classifier.clone());

    let (status, body) = send(&router, request("/", None, client())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, "Access denied\n");

    let (status, _) = send(&router, request("/", Some("   "), client())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    assert_eq!(classifier.calls(), 0);
}

#[tokio::test]
async fn test_path_length_limit() {
    let classifier = Recording::new(Ok(Outcome::Allowed));
    let router = router(classifier.clone());

    let longest = format!("/{}", "p".repeat(1023));
    let (status, body) = send(&router, request(&longest, Some(BROWSER), client())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "protected");
    assert_eq!(classifier.calls(), 1);

    let too_long = format!("/{}", "p".repeat(1024));
    let (status, _) = send(&router, request(&too_long, Some(BROWSER), client())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(classifier.calls(), 1);
}

#[tokio::test]
async fn test_blocked_country_without_guest_call() {
    let classifier = Recording::new(Ok(Outcome::Allowed));
    let config = FilterConfig {
        blocked_countries: ["SE".to_string()].into_iter().collect(),
        ..Default::default()
    };
    let router = router_with(classifier.clone(), config);

    let (status, _) = send(&router, request("/", Some(BROWSER), client())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let elsewhere = ClientInfo::new(IpAddr::from([192, 0, 2, 1]), "NO", 2119);
    let (status, _) = send(&router, request("/", Some(BROWSER), elsewhere)).await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(classifier.calls(), 1);
}

// ============================================================================
// Test: Guest Outcomes
// ============================================================================

#[tokio::test]
async fn test_guest_input() {
    let classifier = Recording::new(Ok(Outcome::Allowed));
    let router = router(classifier.clone());

    let ua = format!("  {BROWSER} ");
    send(&router, request("/search?q=rust", Some(&ua), client())).await;

    let input = classifier.last_input().unwrap();
    assert_eq!(input.http_method, "GET");
    assert_eq!(input.user_agent, BROWSER);
    assert_eq!(input.ip_address, client().ip);
    assert_eq!(input.asn, 1257);
    assert_eq!(input.path, "/search");
    assert_eq!((input.http_version_major, input.http_version_minor), (1, 1));
}

#[tokio::test]
async fn test_guest_sees_decoded_path() {
    let classifier = Recording::new(Ok(Outcome::Allowed));
    let router = router(classifier.clone());

    let (status, _) = send(&router, request("/wp%2Dadmin/caf%C3%A9", Some(BROWSER), client())).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(classifier.last_input().unwrap().path, "/wp-admin/café");
}

#[tokio::test]
async fn test_guest_blocks() {
    let classifier = Recording::new(Ok(Outcome::Blocked));
    let router = router(classifier.clone());

    let (status, body) = send(&router, request("/", Some(BROWSER), client())).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, "Access denied\n");
    assert_eq!(classifier.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_verified_bot_skips_guest_until_expiry() {
    let classifier = Recording::new(Ok(Outcome::VerifiedBot));
    let config = FilterConfig {
        allowed_bot_ttl_secs: 60,
        ..Default::default()
    };
    let router = router_with(classifier.clone(), config);
    let bot = "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)";

    for _ in 0..5 {
        let (status, _) = send(&router, request("/", Some(bot), client())).await;
        assert_eq!(status, StatusCode::OK);
    }
    assert_eq!(classifier.calls(), 1);

    tokio::time::advance(Duration::from_secs(61)).await;

    let (status, _) = send(&router, request("/", Some(bot), client())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(classifier.calls(), 2);
}

// ============================================================================
// Test: Fail Open
// ============================================================================

#[tokio::test]
async fn test_fails_open() {
    for error in [
        FilterError::PoolUnavailable,
        FilterError::UnknownOutcome,
        FilterError::Call(CallError::MemoryBounds {
            offset: 65_530,
            length: 64,
            memory_size: 65_536,
        }),
        FilterError::Call(CallError::Application("guest panicked".into())),
    ] {
        let classifier = Recording::new(Err(error));
        let router = router(classifier.clone());

        let (status, body) = send(&router, request("/", Some(BROWSER), client())).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "protected");
        assert_eq!(classifier.calls(), 1);
    }
}

/// Fails after `wait`, like a guest running into its call deadline.
struct Stalled {
    wait: Duration,
}

#[async_trait]
impl Classifier for Stalled {
    async fn analyze_request(&self, _input: &AnalyzeRequestInput) -> Result<Outcome, FilterError> {
        tokio::time::sleep(self.wait).await;
        Err(FilterError::Call(CallError::GuestTrap("epoch deadline exceeded".into())))
    }
}

#[tokio::test(start_paused = true)]
async fn test_slow_guest_is_forwarded() {
    let router = router(Arc::new(Stalled {
        wait: Duration::from_secs(30),
    }));

    let started = tokio::time::Instant::now();
    let (status, body) = send(&router, request("/", Some(BROWSER), client())).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "protected");
    assert!(started.elapsed() < Duration::from_secs(11), "{:?}", started.elapsed());
}

#[tokio::test(start_paused = true)]
async fn test_request_timeout_bounds_application() {
    let classifier = Recording::new(Ok(Outcome::Allowed));
    let slow_app = Router::new().fallback(|| async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        "late"
    });
    let router = build_router(
        state(classifier, FilterConfig::default()),
        slow_app,
        Duration::from_secs(30),
    );

    let (status, _) = send(&router, request("/", Some(BROWSER), client())).await;
    assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
}

// ============================================================================
// Test: Blocked Response
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_blocked_response_shape_and_delay() {
    let classifier: Arc<dyn Classifier> = Recording::new(Ok(Outcome::Blocked));
    let state = AppState::new(classifier, FilterConfig::default());
    let router = build_router(state, app(), Duration::from_secs(30));

    let start = tokio::time::Instant::now();
    let response = router
        .oneshot(request("/", Some(BROWSER), client()))
        .await
        .unwrap();
    let elapsed = start.elapsed();

    assert!(elapsed >= Duration::from_millis(1000), "{elapsed:?}");
    assert!(elapsed <= Duration::from_millis(1500), "{elapsed:?}");

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let headers = response.headers();
    assert_eq!(headers[header::CONNECTION], "close");
    assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
    assert_eq!(headers[header::CONTENT_TYPE], "text/plain; charset=utf-8");
    assert_eq!(headers[header::CONTENT_LENGTH], "14");
    assert!(headers.get(header::ETAG).is_none());
}

// ============================================================================
// Test: Real Guest
// ============================================================================

/// Guest answering every `analyze_request` with `outcome`.
fn guest(outcome: &str) -> String {
    let response = format!(r#"{{"ok":{{"outcome":"{outcome}"}}}}"#);
    let escaped = response.replace('"', "\\\"");
    let len = response.len();

    format!(
        r#"(module
            (memory (export "memory") 1)
            (global $heap (mut i32) (i32.const 1024))
            (data (i32.const 16) "{escaped}")

            (func $allocate (export "allocate") (param $len i32) (result i64)
                (local $ptr i32)
                (local.set $ptr (global.get $heap))
                (global.set $heap (i32.add (global.get $heap) (local.get $len)))
                (i64.or
                    (i64.shl (i64.extend_i32_u (local.get $ptr)) (i64.const 32))
                    (i64.extend_i32_u (local.get $len))))

            (func (export "deallocate") (param i64)
                (global.set $heap (i32.const 1024)))

            (func (export "analyze_request") (param i64) (result i64)
                (local $out i64)
                (local.set $out (call $allocate (i32.const {len})))
                (memory.copy
                    (i32.wrap_i64 (i64.shr_u (local.get $out) (i64.const 32)))
                    (i32.const 16)
                    (i32.const {len}))
                (local.get $out))
        )"#
    )
}

fn runtime(wat: &str) -> RuntimeHandle {
    let config = RuntimeConfig {
        engine: EngineConfig {
            pooling_allocator: false,
            epoch_interruption: false,
            ..Default::default()
        },
        ..Default::default()
    };

    let engine = WasmEngine::new(&config.engine).unwrap();
    let module = CompiledModule::from_wat(engine.inner(), wat).unwrap();
    let resolver = ReverseDnsResolver::new(&DnsConfig::default()).unwrap();

    RuntimeHandle::with_module(engine, module, &config, resolver).unwrap()
}

#[tokio::test]
async fn test_real_guest_verdicts() {
    for (outcome, expected) in [
        ("allowed", StatusCode::OK),
        ("verified_bot", StatusCode::OK),
        ("blocked", StatusCode::FORBIDDEN),
        ("undecided", StatusCode::OK),
    ] {
        let runtime = runtime(&guest(outcome));
        let router = router(Arc::new(runtime.clone()));

        let (status, _) = send(&router, request("/", Some(BROWSER), client())).await;
        assert_eq!(status, expected, "outcome {outcome}");
        assert_eq!(runtime.stats().idle, 1, "instance returned for {outcome}");
    }
}

#[tokio::test]
async fn test_trapping_guest_fails_open() {
    let wat = r#"(module
        (memory (export "memory") 1)
        (func (export "allocate") (param i32) (result i64) (i64.const 4096))
        (func (export "deallocate") (param i64))
        (func (export "analyze_request") (param i64) (result i64) unreachable)
    )"#;
    let runtime = runtime(wat);
    let router = router(Arc::new(runtime.clone()));

    for _ in 0..3 {
        let (status, _) = send(&router, request("/", Some(BROWSER), client())).await;
        assert_eq!(status, StatusCode::OK);
    }

    let stats = runtime.stats();
    assert_eq!(stats.created, 3);
    assert_eq!(stats.discarded, 3);
}

#[tokio::test]
async fn test_closed_runtime_fails_open() {
    let runtime = runtime(&guest("blocked"));
    let router = router(Arc::new(runtime.clone()));
    runtime.close();

    let (status, _) = send(&router, request("/", Some(BROWSER), client())).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &router,
        Request::builder().uri("/ready").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

// ============================================================================
// Test: Listener
// ============================================================================

#[tokio::test]
async fn test_bind_failure_leaves_runtime_untouched() {
    let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let runtime = runtime(&guest("allowed"));
    let config = ServerConfig::default().with_bind_addr(taken.local_addr().unwrap());

    let server = WafServer::new(runtime.clone(), FilterConfig::default(), config, app());
    let result = server.run().await;

    assert!(matches!(result, Err(RuntimeError::InvalidConfig { .. })), "{result:?}");
    assert_eq!(runtime.stats().created, 0);
    assert!(!runtime.pool().is_closed());
}

#[tokio::test]
async fn test_analysis_timeout_longer_than_request_timeout_is_rejected() {
    let runtime = runtime(&guest("allowed"));
    let config = ServerConfig::default()
        .with_bind_addr("127.0.0.1:0".parse().unwrap())
        .with_timeout(5);

    let server = WafServer::new(runtime.clone(), FilterConfig::default(), config, app());
    let result = server.run().await;

    assert!(matches!(result, Err(RuntimeError::InvalidConfig { .. })), "{result:?}");
    assert_eq!(runtime.stats().created, 0);
}

async fn raw_get(addr: std::net::SocketAddr, user_agent: Option<&str>) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut head = String::from("GET /page HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n");
    if let Some(user_agent) = user_agent {
        head.push_str(&format!("User-Agent: {user_agent}\r\n"));
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8(response).unwrap()
}

#[tokio::test]
async fn test_listener_uses_peer_address() {
    let classifier = Recording::new(Ok(Outcome::Allowed));
    let handle = WafServer::start_test(state(classifier.clone(), FilterConfig::default()), app())
        .await
        .unwrap();

    let response = raw_get(handle.addr(), Some(BROWSER)).await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with("protected"), "{response}");

    let input = classifier.last_input().unwrap();
    assert_eq!(input.ip_address, IpAddr::from([127, 0, 0, 1]));
    assert_eq!(input.asn, 0);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_listener_blocked_response() {
    let classifier = Recording::new(Ok(Outcome::Allowed));
    let handle = WafServer::start_test(state(classifier.clone(), FilterConfig::default()), app())
        .await
        .unwrap();

    let response = raw_get(handle.addr(), None).await;
    let lowercase = response.to_ascii_lowercase();

    assert!(response.starts_with("HTTP/1.1 403"), "{response}");
    assert!(lowercase.contains("connection: close"), "{response}");
    assert!(lowercase.contains("content-length: 14"), "{response}");
    assert!(response.ends_with("\r\n\r\nAccess denied\n"), "{response}");
    assert_eq!(classifier.calls(), 0);

    handle.shutdown().await;
}
