//! Network handling for the relay server

use crate::metrics::{LogLevel, Metrics, MetricsObserver, ServerStatus};
use cowatch_core::api::{
    ApiClient, AuthVerifier, HttpAuthVerifier, HttpRoomService, InsecureTokenVerifier,
};
use cowatch_core::relay::{
    lanes, serve_member, ClientFrame, MemberSender, RelayError, RelayHub, RelayServices,
    ServerFrame, DEFAULT_RECONNECT_GRACE,
};
use cowatch_core::SessionConfig;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Default WebSocket port
const DEFAULT_PORT: u16 = 8787;

/// Relay settings, read from the environment
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind: String,
    pub port: u16,
    /// Base URL of the auth backend; tokens are trusted as user ids without it
    pub auth_url: Option<String>,
    /// Base URL of the room backend; rooms are created on first join without it
    pub rooms_url: Option<String>,
    pub reconnect_grace: Duration,
    pub bulk_queue_depth: usize,
}

impl RelayConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        Self {
            bind: lookup("RELAY_BIND").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: lookup("RELAY_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            auth_url: lookup("AUTH_URL").filter(|u| !u.is_empty()),
            rooms_url: lookup("ROOMS_URL").filter(|u| !u.is_empty()),
            reconnect_grace: parsed("RECONNECT_GRACE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RECONNECT_GRACE),
            bulk_queue_depth: parsed("BULK_QUEUE_DEPTH")
                .map(|d| d.max(1) as usize)
                .unwrap_or_else(|| SessionConfig::default().bulk_queue_depth),
        }
    }

    fn services(&self) -> Result<RelayServices, Box<dyn Error>> {
        let auth: Arc<dyn AuthVerifier> = match &self.auth_url {
            Some(url) => Arc::new(HttpAuthVerifier::new(ApiClient::new(url.as_str())?)),
            None => {
                warn!("AUTH_URL not set, trusting tokens as user ids");
                Arc::new(InsecureTokenVerifier)
            }
        };
        let mut services = RelayServices::new(auth).with_reconnect_grace(self.reconnect_grace);
        if let Some(url) = &self.rooms_url {
            services =
                services.with_rooms(Arc::new(HttpRoomService::new(ApiClient::new(url.as_str())?)));
        }
        Ok(services)
    }
}

/// Run the relay, reporting into `metrics`
pub async fn run_with_dashboard(metrics: Arc<RwLock<Metrics>>) -> Result<(), Box<dyn Error>> {
    let config = RelayConfig::from_env();
    info!("Cowatch Relay Server starting...");

    let services = match config.services() {
        Ok(services) => services,
        Err(e) => {
            let mut m = metrics.write();
            m.status = ServerStatus::Error;
            m.log(LogLevel::Error, format!("Bad configuration: {}", e));
            return Err(e);
        }
    };
    {
        let mut m = metrics.write();
        m.auth_mode = if config.auth_url.is_some() {
            "http"
        } else {
            "insecure"
        };
        m.room_service = config.rooms_url.is_some();
        if config.auth_url.is_none() {
            m.log(LogLevel::Warning, "No AUTH_URL, tokens are trusted as user ids");
        }
    }

    let hub = Arc::new(RelayHub::with_observer(Arc::new(MetricsObserver::new(
        metrics.clone(),
    ))));

    let listener = match TcpListener::bind((config.bind.as_str(), config.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            let mut m = metrics.write();
            m.status = ServerStatus::Error;
            m.log(
                LogLevel::Error,
                format!("Cannot listen on {}:{}: {}", config.bind, config.port, e),
            );
            return Err(e.into());
        }
    };
    let local_addr = listener.local_addr()?;
    info!("Listening on ws://{}", local_addr);
    {
        let mut m = metrics.write();
        m.listen_addr = Some(local_addr);
        m.status = ServerStatus::Running;
        m.log(LogLevel::Info, format!("Listening on ws://{}", local_addr));
    }

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept failed: {}", e);
                metrics.write().log(LogLevel::Error, format!("Accept failed: {}", e));
                continue;
            }
        };
        tokio::spawn(handle_connection(
            stream,
            addr,
            hub.clone(),
            services.clone(),
            metrics.clone(),
            config.bulk_queue_depth,
        ));
    }
}

/// Serve one WebSocket client until it leaves or drops
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: Arc<RelayHub>,
    services: RelayServices,
    metrics: Arc<RwLock<Metrics>>,
    bulk_depth: usize,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("Handshake with {} failed: {}", addr, e);
            metrics
                .write()
                .log(LogLevel::Warning, format!("Handshake failed: {}", addr));
            return;
        }
    };
    info!("Client connected: {}", addr);
    metrics.write().connection_opened(addr);

    let (mut sink, mut source) = ws.split();
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let (member_tx, mut member_rx) = lanes::<ServerFrame>(bulk_depth);

    let writer = tokio::spawn(async move {
        while let Some((frame, _)) = member_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode frame: {}", e);
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::text(text)).await {
                debug!("Write to {} failed: {}", addr, e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    let reader_hub = hub.clone();
    let errors: MemberSender = member_tx.clone();
    let reader = tokio::spawn(async move {
        while let Some(msg) = source.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    match serde_json::from_str::<ClientFrame>(text.as_str()) {
                        Ok(frame) => {
                            if frames_tx.send(frame).is_err() {
                                break;
                            }
                        }
                        Err(e) => reader_hub.send_error(&errors, &RelayError::BadFrame(e.to_string())),
                    }
                }
                Ok(Message::Binary(_)) => reader_hub.send_error(
                    &errors,
                    &RelayError::BadFrame("binary frames are not supported".to_string()),
                ),
                Ok(Message::Close(_)) => break,
                // Ping and pong are answered by tungstenite
                Ok(_) => {}
                Err(e) => {
                    debug!("Read from {} failed: {}", addr, e);
                    break;
                }
            }
        }
    });

    serve_member(hub, services, frames_rx, member_tx).await;

    // Dropping the reader's sender lets the writer flush and close
    reader.abort();
    let _ = writer.await;

    info!("Client disconnected: {}", addr);
    metrics.write().connection_closed(addr);
}

/// Run with plain logging (no dashboard)
pub async fn run_with_logging(metrics: Arc<RwLock<Metrics>>) -> Result<(), Box<dyn Error>> {
    // Initialize tracing for logging mode
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cowatch_relay=info".parse()?)
                .add_directive("cowatch_core=info".parse()?)
                .add_directive("tungstenite=warn".parse()?),
        )
        .init();

    run_with_dashboard(metrics).await
}
