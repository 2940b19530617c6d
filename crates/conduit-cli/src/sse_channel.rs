//! HTTP + SSE adapter: `POST /v1/messages` enqueues an inbound turn,
//! `GET /v1/events/:chat_id` streams that chat's replies back as
//! `text/event-stream`. One handler per route, state extracted per
//! request; one `tokio::broadcast` channel per subscriber, events dropped
//! silently when nobody is listening.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use conduit_channels::{Channel, ChannelError};
use conduit_core::{ChannelId, ChatId, UserId};
use conduit_protocol::{OutgoingMessage, SseEvent, UnifiedMessage};

const STREAM_CAPACITY: usize = 256;

struct SseState {
    inbound: mpsc::Sender<UnifiedMessage>,
    streams: Arc<DashMap<String, broadcast::Sender<String>>>,
}

#[derive(Deserialize)]
struct PostMessageRequest {
    chat_id: String,
    user_id: String,
    text: String,
}

pub struct HttpSseChannel {
    bind: String,
    port: u16,
    running: Arc<AtomicBool>,
    inbound: Option<mpsc::Sender<UnifiedMessage>>,
    streams: Arc<DashMap<String, broadcast::Sender<String>>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl HttpSseChannel {
    pub fn new(bind: impl Into<String>, port: u16) -> Self {
        Self {
            bind: bind.into(),
            port,
            running: Arc::new(AtomicBool::new(false)),
            inbound: None,
            streams: Arc::new(DashMap::new()),
            shutdown: None,
        }
    }

    fn stream_for(streams: &DashMap<String, broadcast::Sender<String>>, chat_id: &str) -> broadcast::Sender<String> {
        streams
            .entry(chat_id.to_string())
            .or_insert_with(|| broadcast::channel(STREAM_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl Channel for HttpSseChannel {
    fn channel_name(&self) -> &str {
        "http"
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn set_inbound(&mut self, tx: mpsc::Sender<UnifiedMessage>) {
        self.inbound = Some(tx);
    }

    async fn start(&mut self) -> Result<(), ChannelError> {
        if self.is_running() {
            return Ok(());
        }
        let Some(inbound) = self.inbound.clone() else {
            return Err(ChannelError::ConfigError("set_inbound must be called before start".into()));
        };

        let addr: SocketAddr = format!("{}:{}", self.bind, self.port)
            .parse()
            .map_err(|e| ChannelError::ConfigError(format!("invalid bind address: {e}")))?;

        let state = Arc::new(SseState { inbound, streams: self.streams.clone() });
        let router = Router::new()
            .route("/v1/messages", post(post_message))
            .route("/v1/events/{chat_id}", get(stream_events))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown = Some(shutdown_tx);
        self.running.store(true, Ordering::Release);
        let running = self.running.clone();

        info!(%addr, "http-sse channel listening");
        tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = serve.await {
                warn!(error = %e, "http-sse server exited with error");
            }
            running.store(false, Ordering::Release);
        });

        Ok(())
    }

    async fn stop(&mut self) -> Result<(), ChannelError> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.running.store(false, Ordering::Release);
        Ok(())
    }

    async fn send_message(&self, msg: &OutgoingMessage) -> Result<(), ChannelError> {
        self.send_text(msg.chat_id.as_str(), &msg.text, msg.reply_to.as_deref(), msg.thread_id.as_deref()).await
    }

    async fn send_text(
        &self,
        chat_id: &str,
        text: &str,
        _reply_to: Option<&str>,
        _thread_id: Option<&str>,
    ) -> Result<(), ChannelError> {
        let sender = Self::stream_for(&self.streams, chat_id);
        let _ = sender.send(SseEvent::TextDelta { text: text.to_string() }.to_wire());
        let _ = sender.send(SseEvent::Done.to_wire());
        Ok(())
    }

    async fn send_typing(&self, chat_id: &str) -> Result<(), ChannelError> {
        let sender = Self::stream_for(&self.streams, chat_id);
        let _ = sender.send(SseEvent::ThinkingStart.to_wire());
        Ok(())
    }
}

async fn post_message(State(state): State<Arc<SseState>>, Json(req): Json<PostMessageRequest>) -> impl IntoResponse {
    let msg = UnifiedMessage::text(
        ChannelId::new("http"),
        uuid::Uuid::new_v4().to_string(),
        ChatId::from(req.chat_id.as_str()),
        UserId::from(req.user_id.as_str()),
        req.user_id.as_str(),
        req.text,
    );

    match state.inbound.send(msg).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn stream_events(State(state): State<Arc<SseState>>, Path(chat_id): Path<String>) -> impl IntoResponse {
    let sender = HttpSseChannel::stream_for(&state.streams, &chat_id);
    let rx = sender.subscribe();
    let body_stream = BroadcastStream::new(rx).filter_map(|item| item.ok());

    axum::response::Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(axum::body::Body::from_stream(body_stream.map(Ok::<_, std::io::Error>)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
