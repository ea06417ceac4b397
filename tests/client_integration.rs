use std::{
    collections::VecDeque,
    io::Write,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::IntoResponse,
    Router,
};
use bytes::Bytes;
use flate2::{write::GzEncoder, Compression};
use restpipe::{
    BasicAuth, ClientOptions, ForwardHeaders, Pool, RequestSpec, RestClient, RestError,
    RetryLimiter, SimpleRetry,
};
use serde::Deserialize;
use serde_json::json;

#[derive(Clone)]
struct ScriptedResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
    delay: Duration,
}

impl ScriptedResponse {
    fn status(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Vec::new(),
            delay: Duration::ZERO,
        }
    }

    fn json(status: StatusCode, body: serde_json::Value) -> Self {
        Self::status(status)
            .with_header(header::CONTENT_TYPE, "application/json")
            .with_body(body.to_string().into_bytes())
    }

    fn with_header(mut self, name: header::HeaderName, value: &'static str) -> Self {
        self.headers.insert(name, HeaderValue::from_static(value));
        self
    }

    fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Clone, Debug)]
struct Recorded {
    method: Method,
    path: String,
    headers: HeaderMap,
    body: Bytes,
}

#[derive(Clone)]
struct ServerState {
    responses: Arc<Mutex<VecDeque<ScriptedResponse>>>,
    recorded: Arc<Mutex<Vec<Recorded>>>,
    hits: Arc<AtomicUsize>,
}

async fn scripted_handler(
    State(state): State<ServerState>,
    method: Method,
    uri: axum::http::Uri,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);
    state
        .recorded
        .lock()
        .expect("recorded requests mutex must not be poisoned")
        .push(Recorded {
            method,
            path: uri.path().to_owned(),
            headers,
            body,
        });

    let response = {
        let mut queue = state
            .responses
            .lock()
            .expect("response queue mutex must not be poisoned");
        queue.pop_front().unwrap_or_else(|| {
            ScriptedResponse::json(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "no scripted response available"}),
            )
        })
    };

    if !response.delay.is_zero() {
        tokio::time::sleep(response.delay).await;
    }

    (response.status, response.headers, response.body)
}

struct TestServer {
    base_url: String,
    hits: Arc<AtomicUsize>,
    recorded: Arc<Mutex<Vec<Recorded>>>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl TestServer {
    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    fn recorded(&self) -> Vec<Recorded> {
        self.recorded
            .lock()
            .expect("recorded requests mutex must not be poisoned")
            .clone()
    }

    fn client(&self) -> RestClient {
        RestClient::new(self.base_url.clone())
    }

    fn client_with(&self, options: ClientOptions) -> RestClient {
        RestClient::from_options(ClientOptions {
            base_url: self.base_url.clone(),
            ..options
        })
        .expect("options must be valid")
    }
}

async fn spawn_server(responses: Vec<ScriptedResponse>) -> TestServer {
    let state = ServerState {
        responses: Arc::new(Mutex::new(responses.into())),
        recorded: Arc::new(Mutex::new(Vec::new())),
        hits: Arc::new(AtomicUsize::new(0)),
    };

    let app = Router::new()
        .fallback(scripted_handler)
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("must bind test listener");
    let address = listener.local_addr().expect("must have local addr");
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("scripted server must run");
    });

    TestServer {
        base_url: format!("http://{address}"),
        hits: state.hits,
        recorded: state.recorded,
        task,
    }
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("write gzip");
    encoder.finish().expect("finish gzip")
}

#[derive(Debug, Deserialize, PartialEq)]
struct Order {
    id: u32,
    status: String,
}

#[tokio::test]
async fn get_fills_up_json_body() {
    let server = spawn_server(vec![ScriptedResponse::json(
        StatusCode::OK,
        json!({"id": 7, "status": "shipped"}),
    )])
    .await;

    let response = server
        .client()
        .get("/orders/7")
        .await
        .expect("request must succeed");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.attempts(), 1);
    let order: Order = response.fill_up().expect("json body");
    assert_eq!(
        order,
        Order {
            id: 7,
            status: "shipped".to_owned()
        }
    );

    let recorded = server.recorded();
    assert_eq!(recorded[0].method, Method::GET);
    assert_eq!(recorded[0].path, "/orders/7");
}

#[tokio::test]
async fn retries_server_errors_then_succeeds() {
    let server = spawn_server(vec![
        ScriptedResponse::status(StatusCode::SERVICE_UNAVAILABLE),
        ScriptedResponse::status(StatusCode::SERVICE_UNAVAILABLE),
        ScriptedResponse::json(StatusCode::OK, json!({"id": 1, "status": "ok"})),
    ])
    .await;
    let client = server
        .client()
        .with_retry(SimpleRetry::new(2, Duration::from_millis(5)));

    let response = client.get("/orders/1").await.expect("final 200");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.attempts(), 3);
    assert_eq!(server.hits(), 3);

    let markers: Vec<Option<String>> = server
        .recorded()
        .iter()
        .map(|request| {
            request
                .headers
                .get("x-retry")
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned)
        })
        .collect();
    assert_eq!(markers, vec![None, Some("1".to_owned()), Some("2".to_owned())]);
}

#[tokio::test]
async fn returns_last_response_when_retries_run_out() {
    let server = spawn_server(vec![
        ScriptedResponse::status(StatusCode::SERVICE_UNAVAILABLE),
        ScriptedResponse::status(StatusCode::SERVICE_UNAVAILABLE),
        ScriptedResponse::status(StatusCode::SERVICE_UNAVAILABLE),
        ScriptedResponse::status(StatusCode::OK),
    ])
    .await;
    let client = server
        .client()
        .with_retry(SimpleRetry::new(2, Duration::from_millis(1)));

    let response = client.get("/orders").await.expect("last outcome");

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.attempts(), 3);
    assert_eq!(server.hits(), 3);

    let err = response.error_for_status().expect_err("503 is an error");
    assert!(matches!(err, RestError::Http { status: 503, .. }));
}

#[tokio::test]
async fn post_is_not_retried_by_default() {
    let server = spawn_server(vec![
        ScriptedResponse::status(StatusCode::BAD_GATEWAY),
        ScriptedResponse::status(StatusCode::OK),
    ])
    .await;
    let client = server
        .client()
        .with_retry(SimpleRetry::new(3, Duration::ZERO));

    let response = client
        .post("/orders", json!({"id": 1}))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(server.hits(), 1);
    assert_eq!(server.recorded()[0].body.as_ref(), br#"{"id":1}"#);
}

#[tokio::test]
async fn retry_budget_exhaustion_returns_last_outcome() {
    let server = spawn_server(vec![
        ScriptedResponse::status(StatusCode::SERVICE_UNAVAILABLE),
        ScriptedResponse::status(StatusCode::SERVICE_UNAVAILABLE),
        ScriptedResponse::status(StatusCode::SERVICE_UNAVAILABLE),
    ])
    .await;
    let limiter = Arc::new(RetryLimiter::new(1, Duration::from_secs(60)));
    let client = server
        .client()
        .with_retry(SimpleRetry::new(5, Duration::ZERO))
        .with_retry_limiter(Arc::clone(&limiter));

    let response = client.get("/orders").await.expect("last outcome");

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.attempts(), 2);
    assert_eq!(server.hits(), 2);
    assert!(limiter.available() < 1.0);
}

#[tokio::test]
async fn deadline_surfaces_as_timeout() {
    let server = spawn_server(vec![
        ScriptedResponse::status(StatusCode::OK).with_delay(Duration::from_millis(400))
    ])
    .await;
    let client = server.client_with(ClientOptions {
        timeout_ms: 50,
        ..ClientOptions::default()
    });

    let err = client.get("/slow").await.expect_err("must time out");

    assert!(err.is_transport());
    assert!(err.is_timeout(), "unexpected error: {err}");
}

#[tokio::test]
async fn per_call_timeout_overrides_client_deadline() {
    let server = spawn_server(vec![
        ScriptedResponse::status(StatusCode::OK).with_delay(Duration::from_millis(150))
    ])
    .await;
    let client = server.client_with(ClientOptions {
        timeout_ms: 20,
        ..ClientOptions::default()
    });

    let response = client
        .execute(RequestSpec::get("/slow").timeout(Duration::from_secs(5)))
        .await
        .expect("longer per-call deadline");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        server.recorded()[0].headers["x-socket-timeout"],
        HeaderValue::from_static("5000")
    );
}

#[tokio::test]
async fn timeouts_are_retried_as_transport_errors() {
    let server = spawn_server(vec![
        ScriptedResponse::status(StatusCode::OK).with_delay(Duration::from_millis(400)),
        ScriptedResponse::status(StatusCode::OK),
    ])
    .await;
    let client = server
        .client_with(ClientOptions {
            timeout_ms: 50,
            ..ClientOptions::default()
        })
        .with_retry(SimpleRetry::new(1, Duration::ZERO));

    let response = client.get("/flaky").await.expect("second attempt succeeds");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.attempts(), 2);
    assert_eq!(server.hits(), 2);
}

#[tokio::test]
async fn redirect_is_blocked_unless_enabled() {
    let server = spawn_server(vec![
        ScriptedResponse::status(StatusCode::MOVED_PERMANENTLY)
            .with_header(header::LOCATION, "/v2/orders"),
    ])
    .await;

    let err = server
        .client()
        .with_retry(SimpleRetry::new(3, Duration::ZERO))
        .get("/v1/orders")
        .await
        .expect_err("redirects are not followed by default");

    assert!(matches!(
        err,
        RestError::RedirectBlocked { status: 301, ref location } if location == "/v2/orders"
    ));
    assert_eq!(server.hits(), 1, "redirect errors are never retried");
}

#[tokio::test]
async fn follows_redirects_when_enabled() {
    let server = spawn_server(vec![
        ScriptedResponse::status(StatusCode::TEMPORARY_REDIRECT)
            .with_header(header::LOCATION, "/v2/orders"),
        ScriptedResponse::json(StatusCode::CREATED, json!({"id": 3, "status": "new"})),
    ])
    .await;
    let client = server.client_with(ClientOptions {
        follow_redirect: true,
        ..ClientOptions::default()
    });

    let response = client
        .post("/v1/orders", json!({"id": 3}))
        .await
        .expect("redirect followed");

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.url().path(), "/v2/orders");

    let recorded = server.recorded();
    assert_eq!(recorded.len(), 2);
    assert_eq!(recorded[1].method, Method::POST, "307 keeps the method");
    assert_eq!(recorded[1].body.as_ref(), br#"{"id":3}"#);
}

#[tokio::test]
async fn inflates_gzip_when_enabled() {
    let compressed = gzip(br#"{"id": 9, "status": "packed"}"#);
    let server = spawn_server(vec![
        ScriptedResponse::status(StatusCode::OK)
            .with_header(header::CONTENT_ENCODING, "gzip")
            .with_body(compressed.clone()),
        ScriptedResponse::status(StatusCode::OK)
            .with_header(header::CONTENT_ENCODING, "gzip")
            .with_body(compressed.clone()),
    ])
    .await;

    let inflating = server.client_with(ClientOptions {
        uncompress_response: true,
        ..ClientOptions::default()
    });
    let response = inflating.get("/packed").await.expect("response");
    let order: Order = response.fill_up().expect("inflated json");
    assert_eq!(order.status, "packed");

    let raw = server.client().get("/packed").await.expect("response");
    assert_eq!(raw.bytes().as_ref(), compressed.as_slice());
}

#[tokio::test]
async fn sends_pipeline_headers() {
    let server = spawn_server(vec![ScriptedResponse::status(StatusCode::OK)]).await;
    let client = server
        .client_with(ClientOptions {
            timeout_ms: 800,
            pool_name: Some("pool_orders".to_owned()),
            user_agent: Some("orders-api/3.0".to_owned()),
            basic_auth: Some(BasicAuth::new("svc", "secret")),
            ..ClientOptions::default()
        })
        .with_default_header(
            header::HeaderName::from_static("x-tenant"),
            HeaderValue::from_static("acme"),
        );

    let mut inbound = HeaderMap::new();
    inbound.insert("x-request-id", HeaderValue::from_static("req-42"));
    inbound.insert("x-forwarded-header-names", HeaderValue::from_static("x-user"));
    inbound.insert("x-user", HeaderValue::from_static("u-1"));

    client
        .execute(
            RequestSpec::put("/orders/1", json!({"status": "paid"}))
                .header(
                    header::AUTHORIZATION,
                    HeaderValue::from_static("Bearer overridden"),
                )
                .forward(ForwardHeaders::from_inbound(&inbound)),
        )
        .await
        .expect("request must succeed");

    let headers = &server.recorded()[0].headers;
    assert_eq!(headers["x-tenant"], "acme");
    assert_eq!(headers["x-rest-pool-name"], "pool_orders");
    assert_eq!(headers["x-socket-timeout"], "800");
    assert_eq!(headers["x-request-id"], "req-42");
    assert_eq!(headers["x-user"], "u-1");
    assert_eq!(headers[header::AUTHORIZATION], "Basic c3ZjOnNlY3JldA==");
    assert_eq!(headers[header::USER_AGENT], "orders-api/3.0");
    assert_eq!(headers[header::CONTENT_TYPE], "application/json");
    assert_eq!(headers[header::ACCEPT], "application/json");
    assert!(headers.get("x-retry").is_none());
}

#[tokio::test]
async fn disabled_timeout_reports_zero() {
    let server = spawn_server(vec![ScriptedResponse::status(StatusCode::OK)]).await;
    let client = server.client_with(ClientOptions {
        disable_timeout: true,
        ..ClientOptions::default()
    });

    client.get("/orders").await.expect("request must succeed");

    assert_eq!(server.recorded()[0].headers["x-socket-timeout"], "0");
}

#[tokio::test]
async fn clients_share_one_pool() {
    let server = spawn_server(vec![
        ScriptedResponse::status(StatusCode::OK),
        ScriptedResponse::status(StatusCode::OK),
        ScriptedResponse::status(StatusCode::OK),
        ScriptedResponse::status(StatusCode::OK),
    ])
    .await;
    let pool = Arc::new(Pool::new("pool_shared"));
    let first = server.client().with_pool(Arc::clone(&pool));
    let second = server
        .client_with(ClientOptions {
            timeout_ms: 900,
            ..ClientOptions::default()
        })
        .with_pool(Arc::clone(&pool));

    let (a, b, c, d) = tokio::join!(
        first.get("/a"),
        second.get("/b"),
        first.get("/c"),
        second.get("/d"),
    );
    for result in [a, b, c, d] {
        assert_eq!(result.expect("request").status(), StatusCode::OK);
    }

    assert!(pool.is_initialized());
    assert_eq!(pool.build_count(), 1);
    for request in server.recorded() {
        assert_eq!(request.headers["x-rest-pool-name"], "pool_shared");
    }
}

#[tokio::test]
async fn spawned_call_reports_through_callback() {
    let server = spawn_server(vec![ScriptedResponse::json(
        StatusCode::OK,
        json!({"id": 5, "status": "async"}),
    )])
    .await;
    let client = server.client();
    let (tx, rx) = tokio::sync::oneshot::channel();

    client
        .spawn_with(RequestSpec::get("/orders/5"), move |result| {
            let _ = tx.send(result.map(|response| response.status()));
        })
        .await
        .expect("spawned call completes");

    let status = rx.await.expect("callback must run").expect("call succeeds");
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn unreachable_host_is_a_transport_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let address = listener.local_addr().expect("local addr");
    drop(listener);

    let err = RestClient::new(format!("http://{address}"))
        .get("/orders")
        .await
        .expect_err("nothing listens");

    assert!(err.is_transport());
    assert!(!err.is_timeout());
}

#[tokio::test]
async fn shared_budget_admits_one_of_two_concurrent_retries() {
    let limiter = Arc::new(RetryLimiter::new(1, Duration::from_secs(1)));

    let tasks: Vec<_> = (0..2)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.admit(1) })
        })
        .collect();

    let mut admitted = 0;
    let mut denied = 0;
    for task in tasks {
        match task.await.expect("task must not panic") {
            Ok(()) => admitted += 1,
            Err(RestError::QuotaExceeded) => denied += 1,
            Err(other) => panic!("unexpected limiter error: {other}"),
        }
    }
    assert_eq!((admitted, denied), (1, 1));
}
