//! UI rendering for the TUI

use ratatui::{
    buffer::Buffer,
    layout::{Constraint, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Widget},
    Frame,
};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use super::app::App;
use super::logbuf::LogBuffer;
use crate::call::{fmt_duration, Call, CallOutcome, CallState, Direction, HistoryEntry};
use crate::session::ConnectionStatus;

/// Width of the call-history pane on the right.
const HISTORY_WIDTH: u16 = 32;
/// Height of the log pane when toggled on.
const LOG_HEIGHT: u16 = 10;

/// Header badge color per connection state.
fn connection_color(status: &ConnectionStatus) -> Color {
    match status {
        ConnectionStatus::Disconnected => Color::DarkGray,
        ConnectionStatus::Connecting => Color::Yellow,
        ConnectionStatus::Connected { .. } => Color::Green,
        ConnectionStatus::Error(_) => Color::Red,
    }
}

/// Main render function
pub fn render(frame: &mut Frame, app: &App, logs: &LogBuffer) {
    let area = frame.area();

    // Layout: header (1 line) + main content + optional log pane + status bar
    let (header_area, main_area, log_area, status_area) = if app.show_log {
        let [h, m, l, s] = Layout::vertical([
            Constraint::Length(1),
            Constraint::Fill(1),
            Constraint::Length(LOG_HEIGHT),
            Constraint::Length(1),
        ])
        .areas(area);
        (h, m, Some(l), s)
    } else {
        let [h, m, s] = Layout::vertical([
            Constraint::Length(1),
            Constraint::Fill(1),
            Constraint::Length(1),
        ])
        .areas(area);
        (h, m, None, s)
    };

    render_header(header_area, frame.buffer_mut(), app);

    // Split main area: call panel + history (32 cols)
    let [call_area, history_area] =
        Layout::horizontal([Constraint::Fill(1), Constraint::Length(HISTORY_WIDTH)])
            .areas(main_area);

    render_call_panel(call_area, frame.buffer_mut(), app);
    render_history(history_area, frame.buffer_mut(), &app.snapshot.history);

    if let Some(log_area) = log_area {
        render_log(log_area, frame.buffer_mut(), logs);
    }

    render_status(status_area, frame.buffer_mut(), app);
}

/// Render the header bar
fn render_header(area: Rect, buf: &mut Buffer, app: &App) {
    let title = Span::styled(
        " Dispatch Softphone",
        Style::default()
            .fg(Color::White)
            .add_modifier(Modifier::BOLD),
    );

    let status = &app.snapshot.connection;
    let badge = Span::styled(
        format!(" {} ", status.label()),
        Style::default()
            .fg(connection_color(status))
            .add_modifier(Modifier::BOLD),
    );

    let identity = match status {
        ConnectionStatus::Connected { registered_as } => format!(" {} ", registered_as),
        _ => String::new(),
    };
    let identity_span = Span::styled(identity.clone(), Style::default().fg(Color::Cyan));

    // Calculate spacing to right-align the right-side elements
    let left_width = " Dispatch Softphone".len();
    let right_width = status.label().len() + 2 + identity.len();
    let padding_width = area.width.saturating_sub((left_width + right_width) as u16) as usize;
    let padding = Span::raw(" ".repeat(padding_width));

    let header_line = Line::from(vec![title, padding, badge, identity_span]);
    let header = Paragraph::new(header_line).style(Style::default().bg(Color::DarkGray));

    header.render(area, buf);
}

// ---------------------------------------------------------------------------
// Call panel
// ---------------------------------------------------------------------------

/// Render the main call panel: dial buffer when idle, call details otherwise.
fn render_call_panel(area: Rect, buf: &mut Buffer, app: &App) {
    let block = Block::default().borders(Borders::ALL);
    let inner = block.inner(area);
    block.render(area, buf);

    if inner.height == 0 || inner.width == 0 {
        return;
    }

    let lines = match &app.snapshot.call {
        None => idle_lines(app),
        Some(call) => call_lines(call, app.snapshot.mic_level),
    };

    // Center the block of lines vertically.
    let top = inner.height.saturating_sub(lines.len() as u16) / 2;
    for (i, line) in lines.into_iter().enumerate() {
        let y = inner.y + top + i as u16;
        if y >= inner.y + inner.height {
            break;
        }
        let row = Rect::new(inner.x, y, inner.width, 1);
        Paragraph::new(line).centered().render(row, buf);
    }
}

fn idle_lines(app: &App) -> Vec<Line<'static>> {
    if app.dial.is_empty() {
        let hint = if app.snapshot.connection.is_connected() {
            "Type a number, Enter dials"
        } else {
            "Press c to connect"
        };
        return vec![
            Line::from(Span::styled(
                "No active call",
                Style::default().fg(Color::DarkGray),
            )),
            Line::default(),
            Line::from(Span::styled(hint, Style::default().fg(Color::DarkGray))),
        ];
    }

    vec![
        Line::from(Span::styled(
            "Dial",
            Style::default().fg(Color::DarkGray),
        )),
        Line::default(),
        Line::from(Span::styled(
            format!("{}_", app.dial),
            Style::default()
                .fg(Color::White)
                .add_modifier(Modifier::BOLD),
        )),
    ]
}

fn call_lines(call: &Call, mic_level: u8) -> Vec<Line<'static>> {
    let who = Span::styled(
        call.who().to_string(),
        Style::default()
            .fg(Color::White)
            .add_modifier(Modifier::BOLD),
    );

    match call.state {
        CallState::Establishing => vec![
            Line::from(Span::styled(
                "CALLING",
                Style::default().fg(Color::Yellow),
            )),
            Line::default(),
            Line::from(who),
            Line::default(),
            Line::from(Span::styled(
                "h: cancel",
                Style::default().fg(Color::DarkGray),
            )),
        ],
        CallState::Ringing => vec![
            Line::from(Span::styled(
                "INCOMING CALL",
                Style::default()
                    .fg(Color::Yellow)
                    .add_modifier(Modifier::BOLD),
            )),
            Line::default(),
            Line::from(who),
            Line::default(),
            Line::from(Span::styled(
                "a: answer   r: reject",
                Style::default().fg(Color::Gray),
            )),
        ],
        CallState::Active | CallState::Held => {
            let mut lines = vec![
                Line::from(who),
                Line::default(),
                Line::from(Span::styled(
                    fmt_duration(call.duration_secs),
                    Style::default().fg(Color::Gray),
                )),
            ];
            let badges = call_badges(call);
            if !badges.is_empty() {
                lines.push(Line::default());
                lines.push(Line::from(badges));
            }
            lines.push(Line::default());
            lines.push(mic_meter(mic_level));
            lines.push(Line::default());
            lines.push(Line::from(Span::styled(
                "h: hang up   m: mute   o: hold",
                Style::default().fg(Color::DarkGray),
            )));
            lines
        }
        CallState::Terminated => vec![Line::from(Span::styled(
            "Call ended",
            Style::default().fg(Color::DarkGray),
        ))],
    }
}

/// MUTED / HELD / LISTEN-ONLY badges for the in-call panel.
fn call_badges(call: &Call) -> Vec<Span<'static>> {
    let mut badges = Vec::new();
    if call.state == CallState::Held {
        badges.push(Span::styled(
            " HELD ",
            Style::default().fg(Color::Black).bg(Color::Yellow),
        ));
    }
    if call.muted {
        if !badges.is_empty() {
            badges.push(Span::raw(" "));
        }
        badges.push(Span::styled(
            " MUTED ",
            Style::default().fg(Color::Black).bg(Color::Red),
        ));
    }
    if call.listen_only {
        if !badges.is_empty() {
            badges.push(Span::raw(" "));
        }
        badges.push(Span::styled(
            " LISTEN-ONLY ",
            Style::default().fg(Color::Black).bg(Color::DarkGray),
        ));
    }
    badges
}

/// Eight-segment microphone level bar.
fn mic_meter(level: u8) -> Line<'static> {
    let filled = usize::from(level.min(8));
    let bar: String = "\u{2588}".repeat(filled) + &"\u{2591}".repeat(8 - filled);
    Line::from(vec![
        Span::styled("mic ", Style::default().fg(Color::DarkGray)),
        Span::styled(bar, Style::default().fg(Color::Green)),
    ])
}

// ---------------------------------------------------------------------------
// History pane
// ---------------------------------------------------------------------------

/// Render the newest-first call history list.
fn render_history(area: Rect, buf: &mut Buffer, history: &[HistoryEntry]) {
    let block = Block::default().borders(Borders::ALL).title(" History ");
    let inner = block.inner(area);
    block.render(area, buf);

    if inner.height == 0 || inner.width == 0 {
        return;
    }

    if history.is_empty() {
        let row = Rect::new(inner.x, inner.y, inner.width, 1);
        Paragraph::new(Line::from(Span::styled(
            " no calls yet",
            Style::default().fg(Color::DarkGray),
        )))
        .render(row, buf);
        return;
    }

    for (row_idx, entry) in history.iter().take(inner.height as usize).enumerate() {
        let row = Rect::new(inner.x, inner.y + row_idx as u16, inner.width, 1);
        render_history_row(row, buf, entry);
    }
}

fn render_history_row(area: Rect, buf: &mut Buffer, entry: &HistoryEntry) {
    let width = area.width as usize;
    if width == 0 {
        return;
    }

    let marker = match entry.direction {
        Direction::Inbound => "\u{2190}",
        Direction::Outbound => "\u{2192}",
    };
    let time = entry
        .started_at
        .with_timezone(&chrono::Local)
        .format("%H:%M");

    let badge = match entry.outcome {
        CallOutcome::Completed => fmt_duration(entry.duration_secs),
        other => other.label().to_string(),
    };
    let badge_style = match entry.outcome {
        CallOutcome::Completed => Style::default().fg(Color::Gray),
        CallOutcome::Missed | CallOutcome::Failed => Style::default().fg(Color::Red),
        CallOutcome::Canceled => Style::default().fg(Color::DarkGray),
    };

    let prefix = format!("{time} {marker} ");
    // Display names can be wide; keep one space before the badge.
    let name_budget = width
        .saturating_sub(prefix.width())
        .saturating_sub(badge.len() + 1);
    let name = truncate_to_width(entry.who(), name_budget);

    let used = prefix.width() + name.width() + badge.len();
    let pad = width.saturating_sub(used);

    let line = Line::from(vec![
        Span::styled(prefix, Style::default().fg(Color::DarkGray)),
        Span::styled(name, Style::default().fg(Color::White)),
        Span::raw(" ".repeat(pad)),
        Span::styled(badge, badge_style),
    ]);
    Paragraph::new(line).render(area, buf);
}

/// Truncate a string to at most `max` display columns.
fn truncate_to_width(s: &str, max: usize) -> String {
    if s.width() <= max {
        return s.to_string();
    }
    let mut out = String::new();
    let mut used = 0;
    for c in s.chars() {
        let w = c.width().unwrap_or(0);
        if used + w > max {
            break;
        }
        out.push(c);
        used += w;
    }
    out
}

// ---------------------------------------------------------------------------
// Log pane
// ---------------------------------------------------------------------------

/// Render the most recent captured log lines.
fn render_log(area: Rect, buf: &mut Buffer, logs: &LogBuffer) {
    let block = Block::default().borders(Borders::ALL).title(" Log ");
    let inner = block.inner(area);
    block.render(area, buf);

    if inner.height == 0 || inner.width == 0 {
        return;
    }

    let lines = logs.tail(inner.height as usize);
    for (row_idx, text) in lines.into_iter().enumerate() {
        let row = Rect::new(inner.x, inner.y + row_idx as u16, inner.width, 1);
        Paragraph::new(Line::from(Span::styled(
            text,
            Style::default().fg(Color::DarkGray),
        )))
        .render(row, buf);
    }
}

// ---------------------------------------------------------------------------
// Status bar
// ---------------------------------------------------------------------------

/// Render the status bar
fn render_status(area: Rect, buf: &mut Buffer, app: &App) {
    // Transient notices take the whole bar.
    if let Some(ref notice) = app.snapshot.notice {
        let line = Line::from(Span::styled(
            format!(" {} ", notice),
            Style::default().fg(Color::Yellow).bg(Color::DarkGray),
        ));
        Paragraph::new(line)
            .style(Style::default().bg(Color::DarkGray))
            .render(area, buf);
        return;
    }

    // Sticky microphone warning.
    if app.snapshot.mic_denied {
        let line = Line::from(Span::styled(
            " microphone access denied; calls use a silent stream ",
            Style::default().fg(Color::Red).bg(Color::DarkGray),
        ));
        Paragraph::new(line)
            .style(Style::default().bg(Color::DarkGray))
            .render(area, buf);
        return;
    }

    let hints: &[&str] = match app.call_state() {
        Some(CallState::Ringing) => &["a: answer", "r: reject"],
        Some(CallState::Establishing) => &["h: cancel"],
        Some(CallState::Active | CallState::Held) => &["h: hang up", "m: mute", "o: hold"],
        _ => &["c: connect", "d: disconnect", "l: log", "q: quit"],
    };

    let sep_style = Style::default().fg(Color::DarkGray);
    let mut spans = Vec::new();
    for (i, hint) in hints.iter().enumerate() {
        if i > 0 {
            spans.push(Span::styled(" | ", sep_style));
        } else {
            spans.push(Span::raw(" "));
        }
        spans.push(Span::styled(*hint, Style::default().fg(Color::Gray)));
    }

    let status = Paragraph::new(Line::from(spans)).style(Style::default().bg(Color::DarkGray));
    status.render(area, buf);
}
