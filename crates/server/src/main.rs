mod bus;
mod chat;
mod chats;
mod config;
mod fanout;
#[cfg(feature = "metrics")]
mod metrics;
mod session;
mod socket;
mod telemetry;

const CONTENT_SECURITY_POLICY: &str =
    "default-src 'none'; frame-ancestors 'none'; base-uri 'none'; form-action 'self'";
const REFERRER_POLICY: &str = "no-referrer";
const X_CONTENT_TYPE_OPTIONS: &str = "nosniff";
const X_FRAME_OPTIONS: &str = "DENY";

use std::{future::IntoFuture, net::SocketAddr, sync::Arc, time::Instant};

#[cfg(feature = "metrics")]
use anyhow::Context;
use anyhow::{anyhow, Result};
use axum::{
    extract::State,
    http::{header::HeaderName, HeaderValue},
    routing::{delete, get},
    Json, Router,
};
#[cfg(feature = "metrics")]
use axum::{
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
#[cfg(test)]
use tokio::sync::Notify;
use tokio::{net::TcpListener, signal};
use tower::ServiceBuilder;
use tower_http::{
    propagate_header::PropagateHeaderLayer,
    request_id::{MakeRequestUuid, SetRequestIdLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::{error, info, warn};

#[cfg(test)]
use once_cell::sync::Lazy;
#[cfg(test)]
use std::sync::Mutex;

use harmony_storage::{
    connect, migrate, KeyValueStore, MemoryStore, PgStore, RegisterUserError, Repositories,
    StoreUserDirectory,
};

#[cfg(feature = "metrics")]
use crate::metrics::MetricsContext;
use crate::{
    bus::{InMemoryBus, MessageBus, RedisBus},
    chat::{ChatError, ChatService},
    config::{CliOverrides, LogFormat, ServerConfig},
    fanout::{FanoutError, LocalConnectionManager, PubSubManager, PubSubSettings},
    session::SessionSigner,
    telemetry::{init_tracing, HttpOnResponse, HttpSpanMaker, REQUEST_ID_HEADER},
};

#[derive(Parser, Debug, Default)]
#[command(name = "harmony-server", version, about = "Harmony chat fan-out server")]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,
    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Args, Debug, Default, Clone)]
struct ConfigArgs {
    #[arg(long)]
    bind_addr: Option<String>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    server_name: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    log_format: Option<LogFormat>,
    #[arg(long)]
    metrics_enabled: Option<bool>,
    #[arg(long)]
    metrics_bind_addr: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    bus_url: Option<String>,
    #[arg(long)]
    bus_listen: Option<bool>,
    #[arg(long)]
    session_signing_key: Option<String>,
    #[arg(long)]
    max_users_per_operation: Option<usize>,
}

impl ConfigArgs {
    fn into_overrides(self) -> CliOverrides {
        CliOverrides {
            bind_addr: self.bind_addr,
            host: self.host,
            port: self.port,
            server_name: self.server_name,
            log_format: self.log_format,
            metrics_enabled: self.metrics_enabled,
            metrics_bind_addr: self.metrics_bind_addr,
            database_url: self.database_url,
            bus_url: self.bus_url,
            bus_listen: self.bus_listen,
            session_signing_key: self.session_signing_key,
            max_users_per_operation: self.max_users_per_operation,
        }
    }
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Register a user id in the configured database.
    SeedUser(SeedUserCommand),
    /// Print a bearer token for local testing.
    DevToken(DevTokenCommand),
}

#[derive(Args, Debug)]
struct SeedUserCommand {
    #[arg(long)]
    user_id: String,
}

#[derive(Args, Debug)]
struct DevTokenCommand {
    #[arg(long)]
    user_id: String,
    /// Token lifetime in minutes.
    #[arg(long, default_value_t = 60)]
    ttl_minutes: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let overrides = cli.config.clone().into_overrides();
    let mut config = ServerConfig::load()?;
    config.apply_overrides(&overrides)?;

    if let Some(command) = cli.command {
        return run_command(&config, command).await;
    }

    run(Arc::new(config)).await
}

async fn run_command(config: &ServerConfig, command: CliCommand) -> Result<()> {
    match command {
        CliCommand::SeedUser(cmd) => seed_user(config, cmd).await,
        CliCommand::DevToken(cmd) => dev_token(config, cmd),
    }
}

async fn seed_user(config: &ServerConfig, cmd: SeedUserCommand) -> Result<()> {
    let database_url = config
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow!("database_url must be configured to seed users"))?;

    let pool = connect(database_url).await?;
    migrate(&pool).await?;
    let store: Arc<dyn KeyValueStore> = Arc::new(PgStore::new(pool));
    let users = StoreUserDirectory::new(store, config.storage.settings().retry);
    match users.register_user(&cmd.user_id).await {
        Ok(()) => {
            println!("Seeded user '{}'", cmd.user_id);
            Ok(())
        }
        Err(RegisterUserError::AlreadyExists) => {
            println!("User '{}' already exists; skipping", cmd.user_id);
            Ok(())
        }
        Err(RegisterUserError::Other(err)) => Err(err.into()),
    }
}

fn dev_token(config: &ServerConfig, cmd: DevTokenCommand) -> Result<()> {
    if config.session.signing_key.is_none() {
        return Err(anyhow!(
            "session.signing_key must be configured to mint tokens the server will accept"
        ));
    }
    if cmd.ttl_minutes <= 0 {
        return Err(anyhow!("--ttl-minutes must be positive"));
    }
    let signer = SessionSigner::from_config(&config.session)?;
    let token = signer.issue(&cmd.user_id, chrono::Duration::minutes(cmd.ttl_minutes))?;
    println!("{token}");
    Ok(())
}

async fn open_store(config: &ServerConfig) -> Result<Arc<dyn KeyValueStore>> {
    match config.database_url.as_deref() {
        Some(url) => {
            let pool = connect(url).await?;
            migrate(&pool).await?;
            info!("database connection established");
            Ok(Arc::new(PgStore::new(pool)))
        }
        None => {
            warn!("database_url not configured; chats are kept in memory");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn open_bus(config: &ServerConfig) -> Result<Arc<dyn MessageBus>> {
    match config.bus.url.as_deref() {
        Some(url) => Ok(Arc::new(RedisBus::open(url)?)),
        None => {
            warn!("bus.url not configured; live delivery stays within this process");
            Ok(Arc::new(InMemoryBus::standalone()))
        }
    }
}

async fn run(config: Arc<ServerConfig>) -> Result<()> {
    init_tracing(&config);

    let env_override_keys = ServerConfig::environment_override_keys();
    if env_override_keys.is_empty() {
        info!("no HARMONY_SERVER environment overrides detected");
    } else {
        info!(keys = ?env_override_keys, "detected HARMONY_SERVER environment overrides");
    }

    info!(
        bind_addr = ?config.bind_addr,
        host = %config.host,
        port = config.port,
        server_name = %config.server_name,
        log_format = ?config.log_format,
        metrics_enabled = config.metrics.enabled,
        metrics_bind_addr = ?config.metrics.bind_addr,
        database_url_configured = config.database_url.is_some(),
        bus_url_configured = config.bus.url.is_some(),
        bus_listen = config.bus.listen,
        max_users_per_operation = config.chat.max_users_per_operation,
        session_signing_key_configured = config.session.signing_key.is_some(),
        "resolved server configuration"
    );

    let store = open_store(&config).await?;
    let repos = Repositories::new(store, config.storage.settings());

    let session = SessionSigner::from_config(&config.session)?;
    if config.session.signing_key.is_none() {
        info!(
            verifying_key = %session.verifying_key_base64(),
            "no session signing key supplied; generated ephemeral key"
        );
    }

    let fanout = Arc::new(PubSubManager::new(
        open_bus(&config)?,
        Arc::new(LocalConnectionManager::new()),
        PubSubSettings {
            stall_timeout: config.bus.stall_timeout(),
            connect_retry: config.bus.connect_retry(),
        },
    ));
    fanout.connect().await.map_err(ChatError::from)?;

    let users = Arc::new(repos.users.clone());
    let chat = Arc::new(ChatService::new(
        repos,
        users,
        fanout.clone(),
        config.chat.settings(),
    ));

    #[cfg_attr(not(feature = "metrics"), allow(unused_mut))]
    let mut state = AppState::new(config.clone(), chat.clone(), fanout.clone(), Arc::new(session));

    #[cfg(feature = "metrics")]
    {
        let metrics = if config.metrics.enabled {
            Some(MetricsContext::init()?)
        } else {
            None
        };
        state = state.with_metrics(metrics);
        if let (true, Some(bind_addr)) = (config.metrics.enabled, &config.metrics.bind_addr) {
            let metrics_addr: SocketAddr = bind_addr
                .parse()
                .context("failed to parse metrics bind addr")?;
            let metrics_state = state.clone();
            tokio::spawn(async move {
                if let Err(err) = serve_metrics(metrics_addr, metrics_state).await {
                    error!(?err, "metrics server terminated unexpectedly");
                }
            });
        }
    }

    let app = build_app(state);

    let addr: SocketAddr = config.listener_addr()?;
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {addr}");

    let server = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .into_future();

    let outcome = if config.bus.listen {
        let mut listener_task = fanout.start_listen();
        tokio::select! {
            served = server => served.map_err(anyhow::Error::from),
            listened = &mut listener_task => Err(listener_outcome(listened)),
        }
    } else {
        info!("bus listener disabled; this process only publishes");
        server.await.map_err(anyhow::Error::from)
    };

    fanout.shutdown().await;
    chat.drain_purges().await;
    outcome
}

/// Anything ending the listener before shutdown leaves this process deaf.
fn listener_outcome(
    result: Result<Result<(), FanoutError>, tokio::task::JoinError>,
) -> anyhow::Error {
    match result {
        Ok(Ok(())) => anyhow!("message bus listener stopped unexpectedly"),
        Ok(Err(err)) => {
            error!(?err, "message bus listener failed; shutting down");
            ChatError::from(err).into()
        }
        Err(err) => anyhow!("message bus listener panicked: {err}"),
    }
}

#[derive(Clone)]
struct AppState {
    started_at: Instant,
    config: Arc<ServerConfig>,
    chat: Arc<ChatService>,
    fanout: Arc<PubSubManager>,
    session: Arc<SessionSigner>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<MetricsContext>>,
}

impl AppState {
    fn new(
        config: Arc<ServerConfig>,
        chat: Arc<ChatService>,
        fanout: Arc<PubSubManager>,
        session: Arc<SessionSigner>,
    ) -> Self {
        Self {
            started_at: Instant::now(),
            config,
            chat,
            fanout,
            session,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    #[cfg(test)]
    fn with_start_time(mut self, started_at: Instant) -> Self {
        self.started_at = started_at;
        self
    }

    #[cfg(feature = "metrics")]
    fn with_metrics(mut self, metrics: Option<Arc<MetricsContext>>) -> Self {
        self.metrics = metrics;
        self
    }

    fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    fn chat(&self) -> &Arc<ChatService> {
        &self.chat
    }

    fn fanout(&self) -> &Arc<PubSubManager> {
        &self.fanout
    }

    fn session(&self) -> &Arc<SessionSigner> {
        &self.session
    }

    #[cfg(feature = "metrics")]
    fn metrics(&self) -> Option<Arc<MetricsContext>> {
        if self.config.metrics.enabled {
            self.metrics.clone()
        } else {
            None
        }
    }
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct ReadinessResponse {
    status: &'static str,
    uptime_seconds: u64,
    upstream_channels: usize,
    components: Vec<ComponentStatus>,
}

#[derive(Serialize)]
struct ComponentStatus {
    name: &'static str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

async fn readiness(State(state): State<AppState>) -> Json<ReadinessResponse> {
    let listening = state.config.bus.listen;
    let components = vec![
        ComponentStatus {
            name: "database",
            status: "connected",
            details: Some(state.chat().backend_name().to_string()),
        },
        ComponentStatus {
            name: "bus",
            status: if listening { "listening" } else { "publish_only" },
            details: Some(state.fanout().backend_name().to_string()),
        },
    ];

    Json(ReadinessResponse {
        status: if listening { "ready" } else { "degraded" },
        uptime_seconds: state.uptime_seconds(),
        upstream_channels: state.fanout().upstream_channel_count(),
        components,
    })
}

#[derive(Serialize)]
struct VersionResponse {
    version: &'static str,
    server_name: String,
}

async fn version(State(state): State<AppState>) -> Json<VersionResponse> {
    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
        server_name: state.config.server_name.clone(),
    })
}

async fn shutdown_signal() {
    #[cfg(test)]
    {
        let notify_opt = TEST_SHUTDOWN_NOTIFY
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        if let Some(notify) = notify_opt {
            tokio::select! {
                res = signal::ctrl_c() => {
                    if let Err(e) = res {
                        error!(?e, "failed to install Ctrl+C handler");
                    }
                }
                _ = notify.notified() => {}
            }
            info!("shutdown signal received");
            *TEST_SHUTDOWN_NOTIFY
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
            return;
        }
    }

    if let Err(e) = signal::ctrl_c().await {
        error!(?e, "failed to install Ctrl+C handler");
    }
    info!("shutdown signal received");
}

#[cfg(test)]
static TEST_SHUTDOWN_NOTIFY: Lazy<Mutex<Option<Arc<Notify>>>> = Lazy::new(|| Mutex::new(None));

#[cfg(test)]
fn install_shutdown_trigger() -> Arc<Notify> {
    let notify = Arc::new(Notify::new());
    *TEST_SHUTDOWN_NOTIFY.lock().unwrap() = Some(notify.clone());
    notify
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/chats", get(chats::list_chats).post(chats::create_chat))
        .route(
            "/chats/{chat_id}",
            get(chats::chat_history)
                .post(chats::send_message)
                .delete(chats::delete_chat),
        )
        .route(
            "/chats/{chat_id}/members",
            get(chats::list_members).post(chats::add_members),
        )
        .route("/chats/{chat_id}/members/me", delete(chats::leave_chat))
        .route("/ws/{chat_id}", get(socket::chat_socket))
}

fn build_app(state: AppState) -> Router {
    #[cfg_attr(not(feature = "metrics"), allow(unused_mut))]
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/ready", get(readiness))
        .route("/version", get(version))
        .nest("/api/v1", api_routes());

    #[cfg(feature = "metrics")]
    let metrics_ctx = state.metrics();
    #[cfg(feature = "metrics")]
    {
        if metrics_ctx.is_some() && state.config.metrics.bind_addr.is_none() {
            router = router.route("/metrics", get(metrics_handler));
        }
    }

    let request_id_header = HeaderName::from_static(REQUEST_ID_HEADER);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(HttpSpanMaker)
        .on_response(HttpOnResponse);

    let builder = ServiceBuilder::new()
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("content-security-policy"),
            HeaderValue::from_static(CONTENT_SECURITY_POLICY),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static(REFERRER_POLICY),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static(X_CONTENT_TYPE_OPTIONS),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static(X_FRAME_OPTIONS),
        ))
        .layer(PropagateHeaderLayer::new(request_id_header.clone()))
        .layer(trace_layer)
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid));

    #[cfg(feature = "metrics")]
    let builder = builder.layer(telemetry::MetricsRecorderLayer::new(metrics_ctx));

    router.layer(builder.into_inner()).with_state(state)
}

#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let Some(metrics) = state.metrics() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    metrics.set_upstream_channels(state.fanout().upstream_channel_count());

    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(?err, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(feature = "metrics")]
fn build_metrics_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

#[cfg(feature = "metrics")]
async fn serve_metrics(bind_addr: SocketAddr, state: AppState) -> Result<()> {
    let router = build_metrics_router(state);
    let listener = TcpListener::bind(bind_addr).await?;
    let addr = listener.local_addr()?;
    info!("metrics listening on {addr}");
    axum::serve(listener, router.into_make_service()).await?;
    Ok(())
}
