//! WebSocket server wiring
//!
//! Builds the axum app, owns the process-wide shared state (pools, event
//! bus, memories, history workers), negotiates the transport `hello`, and
//! runs each device connection's read loop against its session controller.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::{Config, DeviceConfig};
use crate::events::EventBus;
use crate::history::{shard_count, spawn_history_workers, HistoryPipeline, HistoryService};
use crate::memory::{LongMemory, RedisLongMemory, ShortMemory};
use crate::pool::PoolRegistry;
use crate::session::SessionController;
use crate::transport::{AudioParams, ClientMessage, Outbound, ServerMessage, UdpEndpoint};
use crate::types::AudioFormat;

/// Shared server state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub bus: Arc<EventBus>,
    pub pools: Arc<PoolRegistry>,
    pub long_memory: Option<Arc<dyn LongMemory>>,
    pub history: Arc<HistoryService>,
    pub http_client: Client,
    pub process_token: CancellationToken,
}

/// Assemble process-wide state: pools, bus, memories, history workers.
pub async fn build_state(config: Config) -> Result<AppState> {
    let config = Arc::new(config);
    let bus = Arc::new(EventBus::new());
    let pools = PoolRegistry::init(&config);
    let process_token = CancellationToken::new();

    let memory_mode = config.memory_mode();
    let short_memory = match memory_mode {
        crate::config::MemoryMode::None => None,
        _ => match ShortMemory::connect(&config.memory.redis_url, config.memory.short_memory_len)
            .await
        {
            Ok(m) => Some(m),
            Err(e) => {
                warn!(error = %e, "short memory unavailable, continuing without");
                None
            }
        },
    };
    let long_memory: Option<Arc<dyn LongMemory>> =
        if memory_mode == crate::config::MemoryMode::Long {
            match RedisLongMemory::connect(&config.memory.redis_url).await {
                Ok(m) => Some(Arc::new(m)),
                Err(e) => {
                    warn!(error = %e, "long memory unavailable, continuing without");
                    None
                }
            }
        } else {
            None
        };

    let history = Arc::new(HistoryService::new(&config.history)?);
    let pipeline = Arc::new(HistoryPipeline::new(
        history.clone(),
        short_memory,
        long_memory.clone(),
        memory_mode,
    ));
    let shards = shard_count();
    spawn_history_workers(&bus, pipeline, shards);
    info!(shards, "history workers started");

    Ok(AppState {
        config,
        bus,
        pools,
        long_memory,
        history,
        http_client: Client::new(),
        process_token,
    })
}

/// Start the server and block until shutdown.
pub async fn start(config: Config) -> Result<()> {
    let host = config.server.host.clone();
    let port = config.server.port;
    let state = build_state(config).await?;
    let process_token = state.process_token.clone();

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(state.clone());

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(addr = %addr, "voxhub listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            process_token.cancel();
        })
        .await
        .context("server error")?;

    state.pools.shutdown().await;
    Ok(())
}

fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    if !state.config.auth.enable {
        return true;
    }
    let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let token = value.strip_prefix("Bearer ").unwrap_or(value);
    state.config.auth.tokens.iter().any(|t| t == token)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    if !authorized(&state, &headers) {
        return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
    }
    ws.on_upgrade(|socket| handle_device_connection(socket, state))
}

/// Resolve the per-device configuration snapshot.
async fn resolve_device_config(state: &AppState, device_id: &str) -> DeviceConfig {
    match state.config.config_provider.r#type.as_str() {
        "redis" if !state.config.config_provider.redis_url.is_empty() => {
            match fetch_device_config_redis(state, device_id).await {
                Ok(Some(config)) => return config,
                Ok(None) => {}
                Err(e) => warn!(error = %e, "redis device config lookup failed"),
            }
        }
        "manager" if !state.config.config_provider.manager_base_url.is_empty() => {
            match fetch_device_config_manager(state, device_id).await {
                Ok(Some(config)) => return config,
                Ok(None) => {}
                Err(e) => warn!(error = %e, "manager device config lookup failed"),
            }
        }
        _ => {}
    }
    state.config.device_defaults.clone()
}

async fn fetch_device_config_redis(
    state: &AppState,
    device_id: &str,
) -> Result<Option<DeviceConfig>> {
    let client = redis::Client::open(state.config.config_provider.redis_url.as_str())?;
    let mut conn = client.get_multiplexed_async_connection().await?;
    let raw: Option<String> = redis::AsyncCommands::get(
        &mut conn,
        format!("voxhub:device_config:{}", device_id),
    )
    .await?;
    Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
}

async fn fetch_device_config_manager(
    state: &AppState,
    device_id: &str,
) -> Result<Option<DeviceConfig>> {
    let url = format!(
        "{}/api/internal/devices/{}/config",
        state.config.config_provider.manager_base_url.trim_end_matches('/'),
        device_id
    );
    let response = state
        .http_client
        .get(&url)
        .timeout(Duration::from_secs(5))
        .send()
        .await?;
    if !response.status().is_success() {
        return Ok(None);
    }
    Ok(response.json().await.ok())
}

async fn handle_device_connection(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(64);

    // The pump is the only writer to the socket.
    let mut pump = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let result = match message {
                Outbound::Json(m) => {
                    ws_tx
                        .send(Message::Text(
                            serde_json::to_string(&m).unwrap_or_default().into(),
                        ))
                        .await
                }
                Outbound::Frame(f) => ws_tx.send(Message::Binary(f.into())).await,
            };
            if result.is_err() {
                break;
            }
        }
    });

    // The first control message must be `hello`.
    let hello = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(Ok(message)) = ws_rx.next().await {
            if let Message::Text(raw) = message {
                match serde_json::from_str::<ClientMessage>(&raw) {
                    Ok(ClientMessage::Hello {
                        device_id,
                        transport,
                        audio_params,
                        ..
                    }) => return Some((device_id, transport, audio_params)),
                    Ok(_) => debug!("pre-hello control message ignored"),
                    Err(e) => debug!(error = %e, "unparseable pre-hello message"),
                }
            }
        }
        None
    })
    .await;

    let Ok(Some((device_id, transport, audio_params))) = hello else {
        debug!("connection closed before hello");
        pump.abort();
        return;
    };

    let transport = transport.unwrap_or_else(|| "websocket".to_string());
    let input_format: AudioFormat = audio_params.unwrap_or_default().into();
    // Output mirrors the negotiated input rate; frame geometry is ours.
    let output_format = AudioFormat {
        sample_rate: input_format.sample_rate,
        channels: 1,
        frame_duration_ms: input_format.frame_duration_ms,
    };

    let device_config = resolve_device_config(&state, &device_id).await;
    let controller = SessionController::start(
        device_id,
        state.config.clone(),
        device_config,
        input_format,
        output_format,
        &state.process_token,
        outbound_tx.clone(),
        state.bus.clone(),
        state.pools.clone(),
        state.long_memory.clone(),
        state.history.enabled().then(|| state.history.clone()),
    );

    let udp = (transport == "mqtt_udp").then(|| UdpEndpoint {
        server: state.config.server.udp_server.clone(),
        port: state.config.server.udp_port,
        key: uuid::Uuid::new_v4().simple().to_string(),
        nonce: uuid::Uuid::new_v4().simple().to_string(),
    });
    controller
        .core
        .send_control(ServerMessage::Hello {
            session_id: controller.core.session_id.clone(),
            transport,
            audio_params: AudioParams::from(output_format),
            udp,
        })
        .await;

    let session_token = controller.core.session_token.clone();
    loop {
        tokio::select! {
            message = ws_rx.next() => {
                match message {
                    Some(Ok(Message::Text(raw))) => {
                        match serde_json::from_str::<ClientMessage>(&raw) {
                            Ok(parsed) => controller.handle_control(parsed).await,
                            Err(e) => {
                                // Malformed frames are logged, never fatal.
                                debug!(error = %e, "malformed control message");
                            }
                        }
                    }
                    Some(Ok(Message::Binary(frame))) => {
                        controller.handle_audio_frame(frame.to_vec());
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "websocket read error");
                        break;
                    }
                }
                if controller.is_closed() {
                    break;
                }
            }
            _ = controller.core.close_notify.notified() => {
                controller.close().await;
                break;
            }
            _ = session_token.cancelled() => break,
        }
    }

    controller.close().await;
    drop(outbound_tx);
    // Give the pump a moment to flush the goodbye, then stop it.
    if tokio::time::timeout(Duration::from_secs(2), &mut pump).await.is_err() {
        pump.abort();
    }
    debug!("device connection finished");
}
