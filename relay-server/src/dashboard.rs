//! Terminal dashboard for the relay server

use crate::metrics::{LogLevel, Metrics, ServerStatus};
use crate::network;
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use parking_lot::RwLock;
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph},
    Frame, Terminal,
};
use std::io::stdout;
use std::sync::Arc;
use std::time::Duration;

/// How far the activity log is scrolled back; zero follows new entries
#[derive(Default)]
struct LogView {
    offset: usize,
}

impl LogView {
    /// Apply a key press; returns false when the dashboard should quit
    fn handle_key(&mut self, key: KeyEvent, log_count: usize) -> bool {
        let step = match key.code {
            KeyCode::Char('q') | KeyCode::Esc => return false,
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => return false,
            KeyCode::Up => 1,
            KeyCode::PageUp => 10,
            KeyCode::Down => -1,
            KeyCode::PageDown => -10,
            _ => 0,
        };
        let oldest = log_count.saturating_sub(1) as isize;
        self.offset = (self.offset as isize + step).clamp(0, oldest) as usize;
        true
    }

    fn following(&self) -> bool {
        self.offset == 0
    }
}

/// Run the dashboard
pub async fn run(metrics: Arc<RwLock<Metrics>>) -> Result<(), Box<dyn std::error::Error>> {
    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = ratatui::backend::CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    // Relay in background; its failures land in the activity log
    let metrics_for_network = Arc::clone(&metrics);
    tokio::spawn(async move {
        if let Err(e) = network::run_with_dashboard(metrics_for_network.clone()).await {
            let mut m = metrics_for_network.write();
            m.status = ServerStatus::Error;
            m.log(LogLevel::Error, format!("Relay stopped: {}", e));
        }
    });

    let mut view = LogView::default();

    let tick_rate = Duration::from_millis(100);
    loop {
        terminal.draw(|f| draw(f, &metrics, &view))?;

        if event::poll(tick_rate)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    let log_count = metrics.read().logs.len();
                    if !view.handle_key(key, log_count) {
                        break;
                    }
                }
            }
        }
    }

    // Cleanup
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    Ok(())
}

/// Draw the dashboard
fn draw(f: &mut Frame, metrics: &Arc<RwLock<Metrics>>, view: &LogView) {
    let m = metrics.read();

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(3), // Header
            Constraint::Length(6), // Stats
            Constraint::Min(10),   // Logs and rooms
            Constraint::Length(1), // Footer
        ])
        .split(f.area());

    draw_header(f, chunks[0], &m);
    draw_stats(f, chunks[1], &m);

    let body = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(70), Constraint::Percentage(30)])
        .split(chunks[2]);
    draw_logs(f, body[0], &m, view);
    draw_rooms(f, body[1], &m);

    draw_footer(f, chunks[3], view);
}

fn draw_header(f: &mut Frame, area: Rect, m: &Metrics) {
    let (status_text, status_style) = match m.status {
        ServerStatus::Starting => ("STARTING", Style::default().fg(Color::Yellow)),
        ServerStatus::Running => ("RUNNING", Style::default().fg(Color::Green)),
        ServerStatus::Error => ("ERROR", Style::default().fg(Color::Red)),
    };

    let title = vec![Line::from(vec![
        Span::styled(
            "Cowatch Relay Server",
            Style::default().add_modifier(Modifier::BOLD),
        ),
        Span::raw("  │  Status: "),
        Span::styled(status_text, status_style),
        Span::raw("  │  Uptime: "),
        Span::styled(m.uptime(), Style::default().fg(Color::Cyan)),
    ])];

    let header =
        Paragraph::new(title).block(Block::default().borders(Borders::ALL).title(" Dashboard "));

    f.render_widget(header, area);
}

fn stat<'a>(label: &'a str, value: String, color: Color) -> Line<'a> {
    Line::from(vec![
        Span::raw(label),
        Span::styled(value, Style::default().fg(color)),
    ])
}

fn draw_stats(f: &mut Frame, area: Rect, m: &Metrics) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(25),
            Constraint::Percentage(25),
            Constraint::Percentage(25),
            Constraint::Percentage(25),
        ])
        .split(area);

    let listen = m
        .listen_addr
        .map(|a| format!("ws://{}", a))
        .unwrap_or_else(|| "...".to_string());
    let auth_color = if m.auth_mode == "insecure" {
        Color::Yellow
    } else {
        Color::Green
    };
    let server_info = vec![
        stat("Listen: ", listen, Color::Cyan),
        stat("Auth: ", m.auth_mode.to_string(), auth_color),
        stat(
            "Rooms API: ",
            if m.room_service { "http" } else { "open" }.to_string(),
            Color::Cyan,
        ),
    ];
    f.render_widget(
        Paragraph::new(server_info).block(Block::default().borders(Borders::ALL).title(" Server ")),
        chunks[0],
    );

    let conn_info = vec![
        Line::from(vec![
            Span::raw("Active: "),
            Span::styled(
                m.connections.to_string(),
                Style::default()
                    .fg(Color::Green)
                    .add_modifier(Modifier::BOLD),
            ),
        ]),
        stat("Total: ", m.total_connections.to_string(), Color::White),
        stat("Peak: ", m.peak_connections.to_string(), Color::Magenta),
    ];
    f.render_widget(
        Paragraph::new(conn_info)
            .block(Block::default().borders(Borders::ALL).title(" Connections ")),
        chunks[1],
    );

    let room_info = vec![
        stat(
            "Open: ",
            format!("{} ({} total)", m.rooms.len(), m.total_rooms),
            Color::Green,
        ),
        stat(
            "Members: ",
            format!("{} ({} away)", m.participants(), m.reconnecting()),
            Color::Cyan,
        ),
        stat("Host changes: ", m.host_changes.to_string(), Color::Yellow),
    ];
    f.render_widget(
        Paragraph::new(room_info).block(Block::default().borders(Borders::ALL).title(" Rooms ")),
        chunks[2],
    );

    let drop_color = if m.dropped_bulk > 0 {
        Color::Red
    } else {
        Color::Green
    };
    let relay_info = vec![
        stat(
            "Frames: ",
            format!("{} ctl / {} bulk", m.control_messages, m.bulk_messages),
            Color::Cyan,
        ),
        stat("Relayed: ", format_bytes(m.bytes_relayed), Color::Green),
        stat(
            "Dropped: ",
            format!("{} ({} rejected)", m.dropped_bulk, m.rejected_frames),
            drop_color,
        ),
    ];
    f.render_widget(
        Paragraph::new(relay_info).block(Block::default().borders(Borders::ALL).title(" Relay ")),
        chunks[3],
    );
}

fn draw_logs(f: &mut Frame, area: Rect, m: &Metrics, view: &LogView) {
    let visible_height = area.height.saturating_sub(2) as usize;

    let log_items: Vec<ListItem> = m
        .logs
        .iter()
        .rev()
        .skip(view.offset)
        .take(visible_height)
        .map(|entry| {
            let color = match entry.level {
                LogLevel::Info => Color::Blue,
                LogLevel::Warning => Color::Yellow,
                LogLevel::Error => Color::Red,
                LogLevel::Connection => Color::Green,
                LogLevel::Room => Color::Magenta,
            };
            ListItem::new(Line::from(vec![
                Span::styled(
                    entry.timestamp.format("%H:%M:%S ").to_string(),
                    Style::default().fg(Color::DarkGray),
                ),
                Span::styled(
                    format!("[{}] ", entry.level.as_str()),
                    Style::default().fg(color),
                ),
                Span::raw(&entry.message),
            ]))
        })
        .collect();

    let title = if view.following() {
        " Activity ".to_string()
    } else {
        format!(" Activity (-{}) ", view.offset)
    };
    let logs = List::new(log_items).block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(logs, area);
}

fn draw_rooms(f: &mut Frame, area: Rect, m: &Metrics) {
    let visible_height = area.height.saturating_sub(2) as usize;
    let items: Vec<ListItem> = m
        .rooms
        .iter()
        .take(visible_height)
        .map(|(room_id, room)| {
            let host = room.host_id.as_deref().unwrap_or("-");
            let mut spans = vec![
                Span::styled(
                    format!("{} ", room_id),
                    Style::default()
                        .fg(Color::Cyan)
                        .add_modifier(Modifier::BOLD),
                ),
                Span::raw(format!("{} in, host {}", room.members.len(), host)),
            ];
            if !room.reconnecting.is_empty() {
                spans.push(Span::styled(
                    format!(" ({} away)", room.reconnecting.len()),
                    Style::default().fg(Color::Yellow),
                ));
            }
            ListItem::new(Line::from(spans))
        })
        .collect();

    let rooms = List::new(items).block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!(" Live Rooms ({}) ", m.rooms.len())),
    );
    f.render_widget(rooms, area);
}

fn draw_footer(f: &mut Frame, area: Rect, view: &LogView) {
    let key = Style::default().fg(Color::Black).bg(Color::White);
    let mut spans = vec![
        Span::styled(" Q ", key),
        Span::raw(" Quit  "),
        Span::styled(" ↑↓ PgUp/Dn ", key),
        Span::raw(" Scroll log"),
    ];
    if !view.following() {
        spans.push(Span::styled(
            "  (paused, scroll down to follow)",
            Style::default().fg(Color::Yellow),
        ));
    }
    f.render_widget(Paragraph::new(Line::from(spans)), area);
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 3] = ["KB", "MB", "GB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn press(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    #[test]
    fn test_scrolling_back_pauses_the_log() {
        let mut view = LogView::default();
        assert!(view.following());

        assert!(view.handle_key(press(KeyCode::PageUp), 25));
        assert_eq!(view.offset, 10);
        assert!(!view.following());

        // Stops at the oldest entry
        for _ in 0..3 {
            view.handle_key(press(KeyCode::PageUp), 25);
        }
        assert_eq!(view.offset, 24);

        view.handle_key(press(KeyCode::PageDown), 25);
        view.handle_key(press(KeyCode::PageDown), 25);
        view.handle_key(press(KeyCode::Down), 25);
        assert!(!view.following());
        view.handle_key(press(KeyCode::PageDown), 25);
        assert!(view.following());
    }

    #[test]
    fn test_quit_keys() {
        let mut view = LogView::default();
        assert!(!view.handle_key(press(KeyCode::Char('q')), 0));
        assert!(!view.handle_key(
            KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL),
            0
        ));
        // Nothing to scroll back to
        assert!(view.handle_key(press(KeyCode::Up), 0));
        assert!(view.following());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024 * 1024), "3072.0 GB");
    }
}
