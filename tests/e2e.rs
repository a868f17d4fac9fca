//! Upstream-mocked end-to-end tests. Each test stands up a `wiremock`
//! server in place of the real chat/multimodal backend and drives either
//! `Pipeline::run` directly or the full HTTP surface, covering the
//! end-to-end scenarios enumerated for the request pipeline.

use std::sync::Arc;

use assert_matches::assert_matches;
use b2a_gateway::account::pool::AccountPool;
use b2a_gateway::account::{Account, AccountStatus, Cookie, ExternalLease, MailMeta, SESSION_COOKIE_DOMAIN, SESSION_COOKIE_NAME};
use b2a_gateway::config::{Config, LiveConfig, StartupConfig};
use b2a_gateway::http::AppState;
use b2a_gateway::http::auth::InMemorySessionStore;
use b2a_gateway::llm::{CanonicalRequest, openai};
use b2a_gateway::pipeline::{Pipeline, PipelineError};
use b2a_gateway::stats::Stats;
use b2a_gateway::upstream::UpstreamClient;
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

/// Matches a request whose raw body contains `needle`, used to tell the
/// `createSession` and `uploadMedia` calls apart since both hit the same
/// `batchexecute` path.
struct BodyContains(&'static str);

impl wiremock::Match for BodyContains {
	fn matches(&self, request: &Request) -> bool {
		String::from_utf8_lossy(&request.body).contains(self.0)
	}
}

const XSRF_PATH: &str = "/_/BardChatUi/data/assistant.lamda.BardFrontendService/GetAccessToken";
const BATCHEXECUTE_PATH: &str = "/_/BardChatUi/data/batchexecute";
const STREAM_ASSIST_PATH: &str = "/_/BardChatUi/data/assistant.lamda.BardFrontendService/StreamGenerate";

fn ready_account(email: &str, cookie_value: &str) -> Account {
	Account {
		email: email.to_string(),
		full_name: None,
		authorization: "Bearer seed".into(),
		cookies: vec![Cookie {
			name: SESSION_COOKIE_NAME.into(),
			value: cookie_value.into(),
			domain: SESSION_COOKIE_DOMAIN.into(),
			path: None,
			expires: None,
		}],
		config_id: "cfg-1".into(),
		csesidx: "0".into(),
		timestamp: None,
		response_headers: None,
		mail: MailMeta::default(),
		status: AccountStatus::Ready,
		jwt: None,
		fail_count: 0,
		last_used: 0,
		last_refresh: 0,
		daily_count: 0,
		daily_count_day: 0,
		success_count: 0,
		total_count: 0,
		external: ExternalLease::default(),
	}
}

/// Seeds a pool from a temp directory, the way `pool.rs`'s own unit tests
/// do, then promotes every account straight to `ready`.
fn pool_with(accounts: Vec<Account>) -> Arc<AccountPool> {
	let dir = tempfile::tempdir().unwrap();
	for acc in &accounts {
		acc.save_atomic(dir.path()).unwrap();
	}
	let pool = AccountPool::new(dir.path().to_path_buf(), 5, 1000, 60, false, false);
	// leak the tempdir so the pool's data_dir stays valid for the test's life
	std::mem::forget(dir);
	pool.load().unwrap();
	for acc in &accounts {
		pool.mark_ready(&acc.email);
	}
	Arc::new(pool)
}

fn chat_request(content: serde_json::Value, stream: bool) -> CanonicalRequest {
	let body = json!({
		"model": "gemini-2.5-flash",
		"stream": stream,
		"messages": [{"role": "user", "content": content}],
	});
	openai::to_canonical(&body).unwrap()
}

/// Scenario 1: one ready account, simple chat round-trip.
#[tokio::test]
async fn simple_chat_one_ready_account() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path(XSRF_PATH))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "jwt-1"})))
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.and(path(BATCHEXECUTE_PATH))
		.and(header("authorization", "Bearer jwt-1"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({"sessionId": "sess-1"})))
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.and(path(STREAM_ASSIST_PATH))
		.and(header("authorization", "Bearer jwt-1"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!([
			{"streamAssistResponse": {"text": "hello back"}},
		])))
		.mount(&server)
		.await;

	let pool = pool_with(vec![ready_account("a@example.com", "cookie-a")]);
	let upstream = Arc::new(UpstreamClient::with_base_url(server.uri()));
	let pipeline = Pipeline::new(Arc::clone(&pool), upstream);

	let req = chat_request(json!("hi"), false);
	let resp = pipeline.run(&req, "session-1", "req-1", "test_simple_chat").await.unwrap();

	assert_eq!(resp.text, "hello back");
	assert!(resp.is_meaningful());

	let acc = pool.get("a@example.com").unwrap();
	assert_eq!(acc.total_count, 1);
	assert_eq!(acc.success_count, 1);
}

/// Scenario 2: account A's own auth fails (401 on JWT mint), the attempt
/// loop rotates to account B without counting A's fail threshold.
#[tokio::test]
async fn rotates_past_account_with_401_jwt_mint() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path(XSRF_PATH))
		.and(header("cookie", format!("{SESSION_COOKIE_NAME}=cookie-a").as_str()))
		.respond_with(ResponseTemplate::new(401))
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.and(path(XSRF_PATH))
		.and(header("cookie", format!("{SESSION_COOKIE_NAME}=cookie-b").as_str()))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "jwt-b"})))
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.and(path(BATCHEXECUTE_PATH))
		.and(header("authorization", "Bearer jwt-b"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({"sessionId": "sess-b"})))
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.and(path(STREAM_ASSIST_PATH))
		.and(header("authorization", "Bearer jwt-b"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!([
			{"streamAssistResponse": {"text": "hello from b"}},
		])))
		.mount(&server)
		.await;

	let pool = pool_with(vec![
		ready_account("a@example.com", "cookie-a"),
		ready_account("b@example.com", "cookie-b"),
	]);
	let upstream = Arc::new(UpstreamClient::with_base_url(server.uri()));
	let pipeline = Pipeline::new(Arc::clone(&pool), upstream);

	let req = chat_request(json!("hi"), false);
	let resp = pipeline.run(&req, "session-2", "req-2", "test_rotation").await.unwrap();
	assert_eq!(resp.text, "hello from b");

	let acc_a = pool.get("a@example.com").unwrap();
	assert_eq!(acc_a.status, AccountStatus::Pending);
	assert_eq!(acc_a.fail_count, 0, "auth failures must not count toward the fail threshold");

	let acc_b = pool.get("b@example.com").unwrap();
	assert_eq!(acc_b.success_count, 1);
	assert_eq!(acc_b.total_count, 1);
}

/// Scenario 5: a client-supplied `image_url` itself 401s. The upload is
/// rejected, the gateway falls back to downloading the URL directly, that
/// download also 401s, and the failure is surfaced as
/// `media_download_failed` without touching the account's fail bookkeeping.
#[tokio::test]
async fn client_media_url_401_surfaces_media_download_failed_without_flagging_account() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path(XSRF_PATH))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "jwt-1"})))
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.and(path(BATCHEXECUTE_PATH))
		.and(header("authorization", "Bearer jwt-1"))
		.and(BodyContains("configId"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({"sessionId": "sess-1"})))
		.mount(&server)
		.await;
	// The media-upload-by-reference attempt is rejected outright.
	Mock::given(method("POST"))
		.and(path(BATCHEXECUTE_PATH))
		.and(header("authorization", "Bearer jwt-1"))
		.and(BodyContains("\"url\""))
		.respond_with(ResponseTemplate::new(400))
		.mount(&server)
		.await;
	// The client's own URL 401s when the gateway tries to download it.
	Mock::given(method("GET"))
		.and(path("/client-image.png"))
		.respond_with(ResponseTemplate::new(401))
		.mount(&server)
		.await;

	let pool = pool_with(vec![ready_account("a@example.com", "cookie-a")]);
	let upstream = Arc::new(UpstreamClient::with_base_url(server.uri()));
	let pipeline = Pipeline::new(Arc::clone(&pool), upstream);

	let image_url = format!("{}/client-image.png", server.uri());
	let req = chat_request(
		json!([
			{"type": "text", "text": "describe this"},
			{"type": "image_url", "image_url": {"url": image_url}},
		]),
		false,
	);

	let err = pipeline
		.run(&req, "session-5", "req-5", "test_media_download")
		.await
		.unwrap_err();
	assert_eq!(err.code(), "media_download_failed");
	assert_matches!(err, PipelineError::MediaDownloadFailed(_));

	let acc = pool.get("a@example.com").unwrap();
	assert_eq!(acc.status, AccountStatus::Ready, "the account is not ours to blame for a client URL");
	assert_eq!(acc.fail_count, 0);
	assert_eq!(acc.total_count, 0, "mark_used is never called on this path");
}

fn test_app_state(pool: Arc<AccountPool>, upstream: Arc<UpstreamClient>) -> Arc<AppState> {
	let pipeline = Arc::new(Pipeline::new(Arc::clone(&pool), Arc::clone(&upstream)));
	let config = Arc::new(Config {
		startup: Arc::new(StartupConfig {
			listen_addr: "127.0.0.1:0".to_string(),
			data_dir: pool.data_dir().to_path_buf(),
			pool_server_mode: false,
			config_path: std::path::PathBuf::from("unused.json"),
		}),
		live: Arc::new(arc_swap::ArcSwap::new(Arc::new(LiveConfig {
			api_keys: vec!["test-api-key".to_string()],
			..Default::default()
		}))),
	});
	Arc::new(AppState {
		pool,
		upstream,
		pipeline,
		stats: Arc::new(Stats::new()),
		config,
		session_store: Arc::new(InMemorySessionStore::new("change-me")),
	})
}

/// Scenario 3: streaming returns exactly one role frame, at least one
/// content frame, a `finish_reason: stop` frame, and a literal `[DONE]`.
#[tokio::test]
async fn streaming_emits_role_then_content_then_done() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path(XSRF_PATH))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "jwt-1"})))
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.and(path(BATCHEXECUTE_PATH))
		.and(header("authorization", "Bearer jwt-1"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({"sessionId": "sess-1"})))
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.and(path(STREAM_ASSIST_PATH))
		.and(header("authorization", "Bearer jwt-1"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!([
			{"streamAssistResponse": {"text": "streamed text"}},
		])))
		.mount(&server)
		.await;

	let pool = pool_with(vec![ready_account("a@example.com", "cookie-a")]);
	let upstream = Arc::new(UpstreamClient::with_base_url(server.uri()));
	let state = test_app_state(pool, upstream);
	let app = b2a_gateway::http::build_router(state);

	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		axum::serve(listener, app).await.unwrap();
	});

	let client = reqwest::Client::new();
	let resp = client
		.post(format!("http://{addr}/v1/chat/completions"))
		.bearer_auth("test-api-key")
		.json(&json!({
			"model": "gemini-2.5-flash",
			"stream": true,
			"messages": [{"role": "user", "content": "hi"}],
		}))
		.send()
		.await
		.unwrap();
	assert!(resp.status().is_success());
	let body = resp.text().await.unwrap();

	let frames: Vec<&str> = body.lines().filter(|l| l.starts_with("data: ")).map(|l| &l[6..]).collect();
	assert!(frames.first().unwrap().contains("\"role\":\"assistant\""));
	assert!(frames.iter().any(|f| f.contains("streamed text")));
	assert!(frames.iter().any(|f| f.contains("\"finish_reason\":\"stop\"")));
	assert_eq!(frames.last().unwrap(), &"[DONE]");
}
