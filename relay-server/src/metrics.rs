//! Metrics tracking for the relay server

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Local};
use cowatch_core::relay::{Lane, RelayErrorKind, RelayObserver};
use parking_lot::RwLock;

/// Maximum number of log entries to keep
const MAX_LOG_ENTRIES: usize = 100;

/// A log entry for the dashboard
#[derive(Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Connection,
    Room,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Connection => "CONN",
            LogLevel::Room => "ROOM",
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
pub enum ServerStatus {
    Starting,
    Running,
    Error,
}

/// A live room, for display
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RoomInfo {
    pub members: BTreeSet<String>,
    /// Members waiting out their reconnect grace
    pub reconnecting: BTreeSet<String>,
    pub host_id: Option<String>,
}

/// Server metrics
pub struct Metrics {
    pub start_time: DateTime<Local>,
    pub status: ServerStatus,

    /// Address the WebSocket listener is bound to
    pub listen_addr: Option<SocketAddr>,
    /// How tokens are checked ("http" or "insecure")
    pub auth_mode: &'static str,
    pub room_service: bool,

    /// Open WebSocket connections
    pub connections: usize,
    pub total_connections: u64,
    pub peak_connections: usize,

    pub rooms: BTreeMap<String, RoomInfo>,
    pub total_rooms: u64,
    pub host_changes: u64,
    pub rejected_frames: u64,

    pub control_messages: u64,
    pub bulk_messages: u64,
    /// Envelope bytes times recipients
    pub bytes_relayed: u64,
    /// Bulk frames dropped on full queues
    pub dropped_bulk: u64,

    pub logs: VecDeque<LogEntry>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: Local::now(),
            status: ServerStatus::Starting,
            listen_addr: None,
            auth_mode: "insecure",
            room_service: false,
            connections: 0,
            total_connections: 0,
            peak_connections: 0,
            rooms: BTreeMap::new(),
            total_rooms: 0,
            host_changes: 0,
            rejected_frames: 0,
            control_messages: 0,
            bulk_messages: 0,
            bytes_relayed: 0,
            dropped_bulk: 0,
            logs: VecDeque::with_capacity(MAX_LOG_ENTRIES),
        }
    }

    /// Add a log entry
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        if self.logs.len() >= MAX_LOG_ENTRIES {
            self.logs.pop_front();
        }
        self.logs.push_back(LogEntry {
            timestamp: Local::now(),
            level,
            message: message.into(),
        });
    }

    pub fn connection_opened(&mut self, addr: SocketAddr) {
        self.connections += 1;
        self.total_connections += 1;
        self.peak_connections = self.peak_connections.max(self.connections);
        self.log(LogLevel::Connection, format!("Connected: {}", addr));
    }

    pub fn connection_closed(&mut self, addr: SocketAddr) {
        self.connections = self.connections.saturating_sub(1);
        self.log(LogLevel::Connection, format!("Disconnected: {}", addr));
    }

    pub fn participants(&self) -> usize {
        self.rooms.values().map(|r| r.members.len()).sum()
    }

    pub fn reconnecting(&self) -> usize {
        self.rooms.values().map(|r| r.reconnecting.len()).sum()
    }

    fn member_joined(&mut self, room_id: &str, user_id: &str, created: bool) {
        let room = self.rooms.entry(room_id.to_string()).or_default();
        room.members.insert(user_id.to_string());
        if created {
            room.host_id = Some(user_id.to_string());
            self.total_rooms += 1;
            self.log(LogLevel::Room, format!("{} opened {}", user_id, room_id));
        } else if room.reconnecting.remove(user_id) {
            self.log(LogLevel::Room, format!("{} rejoined {}", user_id, room_id));
        } else {
            self.log(LogLevel::Room, format!("{} joined {}", user_id, room_id));
        }
    }

    fn member_left(&mut self, room_id: &str, user_id: &str, closed: bool) {
        if closed {
            self.rooms.remove(room_id);
            self.log(LogLevel::Room, format!("{} left, {} closed", user_id, room_id));
            return;
        }
        if let Some(room) = self.rooms.get_mut(room_id) {
            room.members.remove(user_id);
            room.reconnecting.remove(user_id);
        }
        self.log(LogLevel::Room, format!("{} left {}", user_id, room_id));
    }

    fn member_reconnecting(&mut self, room_id: &str, user_id: &str) {
        if let Some(room) = self.rooms.get_mut(room_id) {
            room.reconnecting.insert(user_id.to_string());
        }
        self.log(
            LogLevel::Warning,
            format!("{} dropped from {}, holding seat", user_id, room_id),
        );
    }

    fn host_changed(&mut self, room_id: &str, host_id: &str) {
        self.host_changes += 1;
        if let Some(room) = self.rooms.get_mut(room_id) {
            room.host_id = Some(host_id.to_string());
        }
        self.log(LogLevel::Room, format!("{} now hosts {}", host_id, room_id));
    }

    fn relayed(&mut self, lane: Lane, bytes: usize, recipients: usize) {
        match lane {
            Lane::Control => self.control_messages += 1,
            Lane::Bulk => self.bulk_messages += 1,
        }
        self.bytes_relayed += (bytes * recipients) as u64;
    }

    /// Get uptime as formatted string
    pub fn uptime(&self) -> String {
        let duration = Local::now().signed_duration_since(self.start_time);
        let secs = duration.num_seconds();

        if secs < 60 {
            format!("{}s", secs)
        } else if secs < 3600 {
            format!("{}m {}s", secs / 60, secs % 60)
        } else {
            let hours = secs / 3600;
            let mins = (secs % 3600) / 60;
            format!("{}h {}m", hours, mins)
        }
    }
}

/// Feeds hub activity into the shared metrics
pub struct MetricsObserver {
    metrics: Arc<RwLock<Metrics>>,
}

impl MetricsObserver {
    pub fn new(metrics: Arc<RwLock<Metrics>>) -> Self {
        Self { metrics }
    }
}

impl RelayObserver for MetricsObserver {
    fn member_joined(&self, room_id: &str, user_id: &str, room_created: bool) {
        self.metrics.write().member_joined(room_id, user_id, room_created);
    }

    fn member_left(&self, room_id: &str, user_id: &str, room_closed: bool) {
        self.metrics.write().member_left(room_id, user_id, room_closed);
    }

    fn member_reconnecting(&self, room_id: &str, user_id: &str) {
        self.metrics.write().member_reconnecting(room_id, user_id);
    }

    fn host_changed(&self, room_id: &str, host_id: &str) {
        self.metrics.write().host_changed(room_id, host_id);
    }

    fn relayed(&self, lane: Lane, bytes: usize, recipients: usize) {
        self.metrics.write().relayed(lane, bytes, recipients);
    }

    fn dropped(&self, lane: Lane) {
        let mut m = self.metrics.write();
        if lane == Lane::Bulk {
            m.dropped_bulk += 1;
        } else {
            m.log(LogLevel::Error, "Dropped a control frame");
        }
    }

    fn rejected(&self, kind: RelayErrorKind, message: &str) {
        let mut m = self.metrics.write();
        m.rejected_frames += 1;
        m.log(LogLevel::Warning, format!("Rejected ({:?}): {}", kind, message));
    }
}
