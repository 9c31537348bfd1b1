//! HTTP surface: auth, chat, per-user context and the study tools.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_stream::stream;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use crate::auth::{AuthError, Claims, TokenIssuer, User, UserStore};
use crate::config::Config;
use crate::context::{
    KeyValueStore, PreferencesContext, PreferencesUpdate, QuotaDecision, Subscription,
    SubscriptionContext, Tier,
};
use crate::llm::Completion;
use crate::normalize::MissingField;
use crate::prompt::{PromptPayload, SamplingOptions};
use crate::tools::{ToolError, ToolKind};

const DEFAULT_CHAT_SYSTEM_PROMPT: &str =
    "You are Studently, a friendly study assistant. Answer clearly and concisely, and explain your reasoning when it helps the student learn.";

#[derive(Clone)]
pub struct AppState {
    completion: Arc<dyn Completion>,
    users: Arc<UserStore>,
    tokens: Arc<TokenIssuer>,
    preferences: PreferencesContext,
    subscriptions: SubscriptionContext,
}

impl AppState {
    pub async fn from_config(config: &Config, completion: Arc<dyn Completion>) -> Result<Self> {
        let store = match &config.storage.state_file {
            Some(path) => Arc::new(KeyValueStore::open(path)?),
            None => Arc::new(KeyValueStore::in_memory()),
        };

        Ok(Self {
            completion,
            users: Arc::new(UserStore::new(&config.auth, store.clone()).await),
            tokens: Arc::new(TokenIssuer::from_config(&config.auth)),
            preferences: PreferencesContext::new(store.clone()),
            subscriptions: SubscriptionContext::new(store, config.subscription.clone()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct Credentials {
    #[serde(default)]
    email: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    success: bool,
    user: User,
    access_token: String,
}

#[derive(Debug, Serialize)]
struct RegisterResponse {
    success: bool,
    user: User,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    system_prompt: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatResponse {
    response: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionUpdate {
    tier: Tier,
    /// Admins may change another account's tier.
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct SubscriptionResponse {
    #[serde(flatten)]
    subscription: Subscription,
    limit: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolResponse {
    success: bool,
    result: Value,
    degraded: bool,
    missing_fields: Vec<MissingField>,
}

/// Bind and serve until the process stops.
pub async fn run_http_server(config: Config, completion: Arc<dyn Completion>) -> Result<()> {
    let state = AppState::from_config(&config, completion).await?;
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "Invalid bind address '{}:{}'",
                config.server.host, config.server.port
            )
        })?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    log::info!("Studently API listening on http://{}", addr);
    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow!("Server error: {}", e))
}

pub fn build_router(state: AppState) -> Router {
    // route_layer: last added runs first, so auth precedes the quota check
    let tools = Router::new()
        .route("/api/tools/{tool}", post(run_tool))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_quota))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let account = Router::new()
        .route(
            "/api/preferences",
            get(get_preferences).put(update_preferences),
        )
        .route(
            "/api/subscription",
            get(get_subscription).put(update_subscription),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/health", get(health))
        .route("/api/auth/login", post(login))
        .route("/api/auth/register", post(register))
        .route("/api/chat", post(chat))
        .route("/api/chat/stream", post(chat_stream))
        .merge(account)
        .merge(tools)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "studently" }))
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|e| ApiError::bad_request(e.body_text()))
}

async fn login(
    State(state): State<AppState>,
    payload: Result<Json<Credentials>, JsonRejection>,
) -> Result<Json<LoginResponse>, ApiError> {
    let creds = json_body(payload)?;
    let user = state.users.authenticate(&creds.email, &creds.password).await?;
    let access_token = state.tokens.issue(&user)?;

    log::info!("Login: {} ({:?})", user.email, user.role);
    Ok(Json(LoginResponse {
        success: true,
        user,
        access_token,
    }))
}

async fn register(
    State(state): State<AppState>,
    payload: Result<Json<Credentials>, JsonRejection>,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    let creds = json_body(payload)?;
    let user = state
        .users
        .register(&creds.email, &creds.password, creds.name.as_deref())
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            success: true,
            user,
        }),
    ))
}

fn chat_payload(req: ChatRequest) -> Result<PromptPayload, ApiError> {
    if req.prompt.trim().is_empty() {
        return Err(ApiError::bad_request("prompt is required"));
    }
    let system = req
        .system_prompt
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CHAT_SYSTEM_PROMPT.to_string());
    Ok(PromptPayload::new(system, req.prompt))
}

fn chat_sampling() -> SamplingOptions {
    SamplingOptions::text(0.7, 1000).with_top_p(0.95)
}

async fn chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let prompt = chat_payload(json_body(payload)?)?;
    let response = state
        .completion
        .complete(&prompt, &chat_sampling())
        .await
        .map_err(|e| {
            log::error!("Chat completion failed: {}", e);
            ApiError::bad_gateway(e.to_string())
        })?;

    Ok(Json(ChatResponse { response }))
}

async fn chat_stream(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Sse<impl futures_util::Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let prompt = chat_payload(json_body(payload)?)?;
    let mut fragments = state.completion.stream(&prompt, &chat_sampling());

    let stream = stream! {
        while let Some(fragment) = fragments.next().await {
            match fragment {
                Ok(content) => yield Ok(sse_json("delta", json!({ "content": content }))),
                Err(e) => {
                    log::error!("Chat stream failed: {}", e);
                    yield Ok(sse_json("error", json!({ "message": e.to_string() })));
                    return;
                }
            }
        }
        yield Ok(sse_json("done", json!({})));
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}

fn sse_json(event: &str, payload: Value) -> SseEvent {
    let data = serde_json::to_string(&payload).unwrap_or_else(|_| "{}".to_string());
    SseEvent::default().event(event).data(data)
}

async fn get_preferences(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Json<Value> {
    let prefs = state.preferences.load(&claims.sub).await;
    Json(json!(prefs))
}

async fn update_preferences(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    payload: Result<Json<PreferencesUpdate>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let update = json_body(payload)?;
    let prefs = state
        .preferences
        .update(&claims.sub, update)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(json!(prefs)))
}

async fn get_subscription(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Json<SubscriptionResponse> {
    let subscription = state.subscriptions.load(&claims.sub).await;
    let limit = state.subscriptions.limit(subscription.tier);
    Json(SubscriptionResponse {
        subscription,
        limit,
    })
}

async fn update_subscription(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    payload: Result<Json<SubscriptionUpdate>, JsonRejection>,
) -> Result<Json<SubscriptionResponse>, ApiError> {
    let update = json_body(payload)?;
    let user_id = match update.user_id {
        Some(other) if other != claims.sub => {
            if !claims.role.is_admin() {
                return Err(ApiError {
                    status: StatusCode::FORBIDDEN,
                    message: "Only admins can change another account's plan".to_string(),
                });
            }
            if state.users.find_by_id(&other).await.is_none() {
                return Err(ApiError::not_found(format!("Unknown user: {}", other)));
            }
            other
        }
        _ => claims.sub.clone(),
    };

    let subscription = state
        .subscriptions
        .set_tier(&user_id, update.tier)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    log::info!("Subscription: {} set to {:?} by {}", user_id, update.tier, claims.email);

    let limit = state.subscriptions.limit(subscription.tier);
    Ok(Json(SubscriptionResponse {
        subscription,
        limit,
    }))
}

async fn run_tool(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<ToolResponse>, ApiError> {
    let tool = ToolKind::from_slug(&slug)
        .ok_or_else(|| ApiError::not_found(format!("Unknown tool: {}", slug)))?;
    let body = json_body(payload)?;

    let outcome = tool.dispatch(state.completion.as_ref(), body).await?;
    Ok(Json(ToolResponse {
        success: true,
        result: outcome.result,
        degraded: !outcome.missing.is_empty(),
        missing_fields: outcome.missing,
    }))
}

/// Verify the bearer token and attach its claims to the request.
async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::unauthorized("Missing bearer token"))?;

    let claims = state.tokens.verify(token)?;
    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

/// Reserve one call against the user's plan; give it back if the tool fails.
async fn require_quota(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let tool = ToolKind::from_slug(&slug)
        .ok_or_else(|| ApiError::not_found(format!("Unknown tool: {}", slug)))?;
    let claims = req
        .extensions()
        .get::<Claims>()
        .cloned()
        .ok_or_else(|| ApiError::unauthorized("Missing bearer token"))?;

    let decision = state
        .subscriptions
        .try_consume(&claims.sub, tool)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    match decision {
        QuotaDecision::Allowed { used, limit } => {
            log::debug!("Quota: {} call {} of {:?} to {}", claims.email, used, limit, slug);
        }
        QuotaDecision::Exceeded { limit } => {
            log::info!("Quota: {} reached {} calls to {}", claims.email, limit, slug);
            return Err(ApiError {
                status: StatusCode::PAYMENT_REQUIRED,
                message: format!(
                    "Daily limit of {} calls to {} reached. Upgrade your plan to continue.",
                    limit, slug
                ),
            });
        }
    }

    let response = next.run(req).await;
    if !response.status().is_success() {
        if let Err(e) = state.subscriptions.refund(&claims.sub, tool).await {
            log::warn!("Quota: failed to refund {} for {}: {}", slug, claims.email, e);
        }
    }
    Ok(response)
}

#[derive(Debug, Clone)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn bad_gateway(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        let status = match &err {
            AuthError::MissingCredentials
            | AuthError::InvalidEmail
            | AuthError::PasswordTooShort(_) => StatusCode::BAD_REQUEST,
            AuthError::InvalidCredentials | AuthError::InvalidToken => StatusCode::UNAUTHORIZED,
            AuthError::EmailTaken => StatusCode::CONFLICT,
            AuthError::Token(_) | AuthError::Storage(_) => {
                log::error!("Auth failure: {}", err);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<ToolError> for ApiError {
    fn from(err: ToolError) -> Self {
        let status = match &err {
            ToolError::InvalidRequest(_) | ToolError::Validation(_) => StatusCode::BAD_REQUEST,
            ToolError::Completion(_) => StatusCode::BAD_GATEWAY,
            ToolError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "success": false,
                "error": self.message,
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubscriptionConfig;
    use crate::tools::testing::{FailingCompletion, FixedCompletion};
    use anyhow::bail;

    const MATH_ANSWER: &str =
        "Answer: x = 4\n\nSolution Steps:\n1. Subtract 3\n2. Divide by 2\n\nExplanation: Isolate x.";

    async fn spawn_with(
        config: Config,
        completion: Arc<dyn Completion>,
    ) -> Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
        let state = AppState::from_config(&config, completion).await?;
        let app = build_router(state);
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok((addr, handle))
    }

    async fn spawn_test_server(
        completion: Arc<dyn Completion>,
    ) -> Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
        spawn_with(Config::default(), completion).await
    }

    async fn dev_token(client: &reqwest::Client, addr: SocketAddr) -> Result<String> {
        let body: Value = client
            .post(format!("http://{}/api/auth/login", addr))
            .json(&json!({ "email": "dave@studently.uk", "password": "studently" }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        match body["accessToken"].as_str() {
            Some(token) => Ok(token.to_string()),
            None => bail!("login response had no accessToken: {}", body),
        }
    }

    #[tokio::test]
    async fn health_endpoint_works() -> Result<()> {
        let (addr, handle) = spawn_test_server(Arc::new(FixedCompletion::new("hi"))).await?;
        let health: Value = reqwest::get(format!("http://{}/health", addr)).await?.json().await?;
        assert_eq!(health["status"], "ok");
        handle.abort();
        Ok(())
    }

    #[tokio::test]
    async fn dev_login_returns_admin_token() -> Result<()> {
        let (addr, handle) = spawn_test_server(Arc::new(FixedCompletion::new("hi"))).await?;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("http://{}/api/auth/login", addr))
            .json(&json!({ "email": "dave@studently.uk", "password": "studently" }))
            .send()
            .await?;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = resp.json().await?;
        assert_eq!(body["success"], true);
        assert_eq!(body["user"]["role"], "ADMIN");
        assert!(body["accessToken"].as_str().is_some_and(|t| !t.is_empty()));

        handle.abort();
        Ok(())
    }

    #[tokio::test]
    async fn login_rejects_bad_credentials() -> Result<()> {
        let (addr, handle) = spawn_test_server(Arc::new(FixedCompletion::new("hi"))).await?;
        let client = reqwest::Client::new();
        let url = format!("http://{}/api/auth/login", addr);

        for creds in [
            json!({ "email": "dave@studently.uk", "password": "wrong" }),
            json!({ "email": "eve@studently.uk", "password": "studently" }),
        ] {
            let resp = client.post(&url).json(&creds).send().await?;
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
            let body: Value = resp.json().await?;
            assert_eq!(body["success"], false);
        }

        let resp = client.post(&url).json(&json!({ "email": "" })).send().await?;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .body("{not json")
            .send()
            .await?;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        handle.abort();
        Ok(())
    }

    #[tokio::test]
    async fn register_flow() -> Result<()> {
        let (addr, handle) = spawn_test_server(Arc::new(FixedCompletion::new("hi"))).await?;
        let client = reqwest::Client::new();
        let url = format!("http://{}/api/auth/register", addr);

        let resp = client
            .post(&url)
            .json(&json!({ "email": "ada@uni.ac.uk", "password": "short" }))
            .send()
            .await?;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = client
            .post(&url)
            .json(&json!({ "email": "ada@uni.ac.uk", "password": "long enough", "name": "Ada" }))
            .send()
            .await?;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body: Value = resp.json().await?;
        assert_eq!(body["user"]["role"], "USER");
        assert_eq!(body["user"]["name"], "Ada");

        let resp = client
            .post(&url)
            .json(&json!({ "email": "ADA@uni.ac.uk", "password": "long enough" }))
            .send()
            .await?;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = client
            .post(&url)
            .json(&json!({ "email": "dave@studently.uk", "password": "long enough" }))
            .send()
            .await?;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let body: Value = client
            .post(format!("http://{}/api/auth/login", addr))
            .json(&json!({ "email": "ada@uni.ac.uk", "password": "long enough" }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert_eq!(body["user"]["role"], "USER");

        handle.abort();
        Ok(())
    }

    #[tokio::test]
    async fn register_storage_failure_is_internal_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = Config::default();
        config.storage.state_file = Some(
            dir.path()
                .join("missing/state.json")
                .to_string_lossy()
                .into_owned(),
        );
        let (addr, handle) = spawn_with(config, Arc::new(FixedCompletion::new("hi"))).await?;

        let resp = reqwest::Client::new()
            .post(format!("http://{}/api/auth/register", addr))
            .json(&json!({ "email": "ada@uni.ac.uk", "password": "long enough" }))
            .send()
            .await?;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        handle.abort();
        Ok(())
    }

    #[tokio::test]
    async fn chat_returns_completion() -> Result<()> {
        let (addr, handle) =
            spawn_test_server(Arc::new(FixedCompletion::new("Photosynthesis makes sugar."))).await?;
        let client = reqwest::Client::new();
        let url = format!("http://{}/api/chat", addr);

        let body: Value = client
            .post(&url)
            .json(&json!({ "prompt": "What is photosynthesis?", "systemPrompt": "Be brief." }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert_eq!(body["response"], "Photosynthesis makes sugar.");

        let resp = client.post(&url).json(&json!({ "prompt": "  " })).send().await?;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        handle.abort();
        Ok(())
    }

    #[tokio::test]
    async fn chat_upstream_failure_is_bad_gateway() -> Result<()> {
        let (addr, handle) = spawn_test_server(Arc::new(FailingCompletion)).await?;
        let resp = reqwest::Client::new()
            .post(format!("http://{}/api/chat", addr))
            .json(&json!({ "prompt": "hello" }))
            .send()
            .await?;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let body: Value = resp.json().await?;
        assert!(body["error"].as_str().is_some_and(|e| e.contains("connection refused")));
        handle.abort();
        Ok(())
    }

    #[tokio::test]
    async fn chat_stream_emits_deltas_then_done() -> Result<()> {
        let (addr, handle) =
            spawn_test_server(Arc::new(FixedCompletion::new("one two three"))).await?;
        let text = reqwest::Client::new()
            .post(format!("http://{}/api/chat/stream", addr))
            .json(&json!({ "prompt": "count" }))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let events: Vec<&str> = text
            .lines()
            .filter_map(|l| l.strip_prefix("event:"))
            .map(str::trim)
            .collect();
        assert_eq!(events, vec!["delta", "delta", "delta", "done"]);

        let content: String = text
            .lines()
            .filter_map(|l| l.strip_prefix("data:"))
            .filter_map(|d| serde_json::from_str::<Value>(d.trim()).ok())
            .filter_map(|v| v["content"].as_str().map(String::from))
            .collect();
        assert_eq!(content, "one two three");

        handle.abort();
        Ok(())
    }

    #[tokio::test]
    async fn chat_stream_reports_upstream_error() -> Result<()> {
        let (addr, handle) = spawn_test_server(Arc::new(FailingCompletion)).await?;
        let text = reqwest::Client::new()
            .post(format!("http://{}/api/chat/stream", addr))
            .json(&json!({ "prompt": "count" }))
            .send()
            .await?
            .text()
            .await?;
        let events: Vec<&str> = text
            .lines()
            .filter_map(|l| l.strip_prefix("event:"))
            .map(str::trim)
            .collect();
        assert_eq!(events, vec!["error"]);
        handle.abort();
        Ok(())
    }

    #[tokio::test]
    async fn tools_require_auth() -> Result<()> {
        let (addr, handle) = spawn_test_server(Arc::new(FixedCompletion::new(MATH_ANSWER))).await?;
        let client = reqwest::Client::new();
        let url = format!("http://{}/api/tools/math-solver", addr);

        let resp = client.post(&url).json(&json!({ "problem": "2x+3=11" })).send().await?;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = client
            .post(&url)
            .bearer_auth("not-a-token")
            .json(&json!({ "problem": "2x+3=11" }))
            .send()
            .await?;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        handle.abort();
        Ok(())
    }

    #[tokio::test]
    async fn tool_run_returns_normalized_result() -> Result<()> {
        let (addr, handle) = spawn_test_server(Arc::new(FixedCompletion::new(MATH_ANSWER))).await?;
        let client = reqwest::Client::new();
        let token = dev_token(&client, addr).await?;

        let body: Value = client
            .post(format!("http://{}/api/tools/math-solver", addr))
            .bearer_auth(&token)
            .json(&json!({ "problem": "2x+3=11" }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert_eq!(body["success"], true);
        assert_eq!(body["degraded"], false);
        assert_eq!(body["result"]["answer"], "x = 4");
        assert_eq!(body["result"]["steps"].as_array().map(Vec::len), Some(2));

        let resp = client
            .post(format!("http://{}/api/tools/time-machine", addr))
            .bearer_auth(&token)
            .json(&json!({}))
            .send()
            .await?;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = client
            .post(format!("http://{}/api/tools/math-solver", addr))
            .bearer_auth(&token)
            .json(&json!({ "problem": "" }))
            .send()
            .await?;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        handle.abort();
        Ok(())
    }

    #[tokio::test]
    async fn tool_degraded_and_upstream_failure() -> Result<()> {
        let (addr, handle) =
            spawn_test_server(Arc::new(FixedCompletion::new("Answer: 42"))).await?;
        let client = reqwest::Client::new();
        let token = dev_token(&client, addr).await?;

        let body: Value = client
            .post(format!("http://{}/api/tools/math-solver", addr))
            .bearer_auth(&token)
            .json(&json!({ "problem": "6 * 7" }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert_eq!(body["degraded"], true);
        assert_eq!(body["missingFields"], json!(["steps", "explanation"]));
        handle.abort();

        let (addr, handle) = spawn_test_server(Arc::new(FailingCompletion)).await?;
        let token = dev_token(&client, addr).await?;
        let resp = client
            .post(format!("http://{}/api/tools/math-solver", addr))
            .bearer_auth(&token)
            .json(&json!({ "problem": "6 * 7" }))
            .send()
            .await?;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        handle.abort();
        Ok(())
    }

    #[tokio::test]
    async fn quota_exceeded_returns_payment_required() -> Result<()> {
        let mut config = Config::default();
        config.subscription = SubscriptionConfig {
            free_limit: Some(1),
            pro_limit: Some(3),
            premium_limit: None,
        };
        let (addr, handle) = spawn_with(config, Arc::new(FixedCompletion::new(MATH_ANSWER))).await?;
        let client = reqwest::Client::new();
        let token = dev_token(&client, addr).await?;
        let url = format!("http://{}/api/tools/math-solver", addr);

        // A failed call does not use up the quota
        let resp = client
            .post(&url)
            .bearer_auth(&token)
            .json(&json!({ "problem": " " }))
            .send()
            .await?;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = client
            .post(&url)
            .bearer_auth(&token)
            .json(&json!({ "problem": "2x+3=11" }))
            .send()
            .await?;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = client
            .post(&url)
            .bearer_auth(&token)
            .json(&json!({ "problem": "2x+3=11" }))
            .send()
            .await?;
        assert_eq!(resp.status(), StatusCode::PAYMENT_REQUIRED);

        let sub: Value = client
            .put(format!("http://{}/api/subscription", addr))
            .bearer_auth(&token)
            .json(&json!({ "tier": "pro" }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert_eq!(sub["tier"], "pro");
        assert_eq!(sub["limit"], 3);
        assert_eq!(sub["usage"]["math-solver"], 1);

        let resp = client
            .post(&url)
            .bearer_auth(&token)
            .json(&json!({ "problem": "2x+3=11" }))
            .send()
            .await?;
        assert_eq!(resp.status(), StatusCode::OK);

        handle.abort();
        Ok(())
    }

    #[tokio::test]
    async fn only_admins_change_other_plans() -> Result<()> {
        let (addr, handle) = spawn_test_server(Arc::new(FixedCompletion::new("hi"))).await?;
        let client = reqwest::Client::new();

        let registered: Value = client
            .post(format!("http://{}/api/auth/register", addr))
            .json(&json!({ "email": "ada@uni.ac.uk", "password": "long enough" }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let ada_id = registered["user"]["id"].as_str().unwrap_or_default().to_string();

        let login: Value = client
            .post(format!("http://{}/api/auth/login", addr))
            .json(&json!({ "email": "ada@uni.ac.uk", "password": "long enough" }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let ada_token = login["accessToken"].as_str().unwrap_or_default().to_string();

        let resp = client
            .put(format!("http://{}/api/subscription", addr))
            .bearer_auth(&ada_token)
            .json(&json!({ "tier": "premium", "userId": "someone-else" }))
            .send()
            .await?;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let admin = dev_token(&client, addr).await?;
        let resp = client
            .put(format!("http://{}/api/subscription", addr))
            .bearer_auth(&admin)
            .json(&json!({ "tier": "premium", "userId": "no-such-user" }))
            .send()
            .await?;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        client
            .put(format!("http://{}/api/subscription", addr))
            .bearer_auth(&admin)
            .json(&json!({ "tier": "premium", "userId": ada_id }))
            .send()
            .await?
            .error_for_status()?;

        let sub: Value = client
            .get(format!("http://{}/api/subscription", addr))
            .bearer_auth(&ada_token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert_eq!(sub["tier"], "premium");
        assert_eq!(sub["limit"], Value::Null);

        handle.abort();
        Ok(())
    }

    #[tokio::test]
    async fn admin_preferences_survive_restart() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = Config::default();
        config.storage.state_file =
            Some(dir.path().join("state.json").to_string_lossy().into_owned());
        let client = reqwest::Client::new();

        let (addr, handle) =
            spawn_with(config.clone(), Arc::new(FixedCompletion::new("hi"))).await?;
        let token = dev_token(&client, addr).await?;
        client
            .put(format!("http://{}/api/preferences", addr))
            .bearer_auth(&token)
            .json(&json!({ "locale": "fr" }))
            .send()
            .await?
            .error_for_status()?;
        handle.abort();

        let (addr, handle) = spawn_with(config, Arc::new(FixedCompletion::new("hi"))).await?;
        let token = dev_token(&client, addr).await?;
        let prefs: Value = client
            .get(format!("http://{}/api/preferences", addr))
            .bearer_auth(&token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert_eq!(prefs["locale"], "fr");

        handle.abort();
        Ok(())
    }

    #[tokio::test]
    async fn preferences_round_trip() -> Result<()> {
        let (addr, handle) = spawn_test_server(Arc::new(FixedCompletion::new("hi"))).await?;
        let client = reqwest::Client::new();
        let token = dev_token(&client, addr).await?;
        let url = format!("http://{}/api/preferences", addr);

        let prefs: Value = client
            .get(&url)
            .bearer_auth(&token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert_eq!(prefs, json!({ "locale": "en", "sidebarCollapsed": false }));

        let prefs: Value = client
            .put(&url)
            .bearer_auth(&token)
            .json(&json!({ "sidebarCollapsed": true }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert_eq!(prefs, json!({ "locale": "en", "sidebarCollapsed": true }));

        let resp = client.get(&url).send().await?;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        handle.abort();
        Ok(())
    }
}
