//! UI rendering with ratatui.
//!
//! Layout, top to bottom: header, chat column, input line, status bar.

use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style, Stylize};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Paragraph, Scrollbar, ScrollbarOrientation, ScrollbarState, Wrap};
use ratatui::Frame;
use streamchat_core::{ConversationTurn, DisconnectReason, LinkState, Role};

use crate::app::App;
use crate::markdown::render_markdown;

/// Horizontal padding inside the chat column.
const CHAT_PADDING: u16 = 1;

/// Render the UI.
pub fn render(frame: &mut Frame, app: &mut App) {
    let layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1), // Header
            Constraint::Min(3),    // Chat
            Constraint::Length(1), // Separator
            Constraint::Length(1), // Input
            Constraint::Length(1), // Status bar
        ])
        .split(frame.area());

    render_header(frame, app, layout[0]);
    render_chat(frame, app, layout[1]);
    render_input(frame, app, layout[2], layout[3]);
    render_status_bar(frame, app, layout[4]);
}

/// Truncate a string in the middle with an ellipsis if it exceeds `max`.
fn truncate_middle(s: &str, max: usize) -> String {
    let len = s.chars().count();
    if len <= max {
        return s.to_string();
    }
    if max < 5 {
        return s.chars().take(max).collect();
    }
    let keep = (max - 3) / 2;
    let start: String = s.chars().take(keep).collect();
    let end: String = s.chars().skip(len - keep).collect();
    format!("{start}...{end}")
}

fn status_color(state: LinkState) -> Color {
    match state {
        LinkState::Connected => Color::Green,
        LinkState::Unknown | LinkState::Disconnected(DisconnectReason::BypassPending) => {
            Color::Yellow
        }
        LinkState::Disconnected(DisconnectReason::Interstitial) => Color::LightYellow,
        LinkState::Disconnected(_) => Color::Red,
    }
}

fn render_header(frame: &mut Frame, app: &App, area: Rect) {
    let title = "STREAMCHAT";
    let status = &app.connection.reason_text;
    let max_url = (area.width as usize / 2).saturating_sub(4);
    let url = truncate_middle(app.base_url(), max_url);

    let right_len = url.chars().count() + status.chars().count() + 4;
    let gap = (area.width as usize).saturating_sub(title.len() + right_len);

    let line = Line::from(vec![
        Span::styled(title, Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)),
        Span::raw(" ".repeat(gap)),
        Span::raw(url),
        Span::raw(" ["),
        Span::styled(status.clone(), Style::default().fg(status_color(app.connection.state))),
        Span::raw("] "),
    ]);
    frame.render_widget(Paragraph::new(line).style(Style::default().bg(Color::DarkGray)), area);
}

fn turn_lines(turn: &ConversationTurn, width: usize, spinner: &'static str) -> Vec<Line<'static>> {
    let label = |text: &'static str, color: Color| {
        Line::from(Span::styled(text, Style::default().fg(color).add_modifier(Modifier::BOLD)))
    };
    let mut lines = Vec::new();
    match turn.role {
        Role::User => {
            // User text is never interpreted as Markdown.
            lines.push(label("[You]", Color::Cyan));
            lines.extend(
                turn.content
                    .lines()
                    .map(|l| Line::from(Span::styled(l.to_string(), Style::default().fg(Color::White)))),
            );
        }
        Role::Assistant => {
            lines.push(label("[Assistant]", Color::Green));
            lines.extend(render_markdown(&turn.content, width));
        }
        Role::Error => {
            lines.push(label("[Error]", Color::Red));
            lines.push(Line::from(Span::styled(turn.content.clone(), Style::default().fg(Color::Red))));
        }
        Role::Thinking => {
            lines.push(label("[Assistant]", Color::Green));
            lines.push(Line::from(vec![
                Span::styled(spinner, Style::default().fg(Color::Yellow)),
                Span::styled(" thinking...", Style::default().fg(Color::DarkGray)),
            ]));
        }
    }
    lines.push(Line::default());
    lines
}

fn render_chat(frame: &mut Frame, app: &mut App, area: Rect) {
    let chat_area = Rect::new(
        area.x + CHAT_PADDING,
        area.y,
        area.width.saturating_sub(CHAT_PADDING * 2 + 1), // +1 for scrollbar
        area.height,
    );
    let width = chat_area.width as usize;
    let spinner = app.spinner_char();

    let mut lines: Vec<Line> = Vec::new();
    for turn in app.turns() {
        lines.extend(turn_lines(turn, width, spinner));
    }
    if let Some(active) = app.active_turn() {
        let mut active_lines = turn_lines(active, width, spinner);
        if active.role == Role::Assistant {
            active_lines.pop();
            active_lines.push(Line::from(Span::styled(spinner, Style::default().fg(Color::Yellow))));
        }
        lines.extend(active_lines);
    }

    let text = Text::from(lines);
    let total = u32::try_from(wrapped_line_count(&text, width)).unwrap_or(u32::MAX);
    let visible = u32::from(chat_area.height);
    app.update_viewport(total, visible);

    let offset = u16::try_from(app.scroll_offset).unwrap_or(u16::MAX);
    let paragraph = Paragraph::new(text).wrap(Wrap { trim: false }).scroll((offset, 0));
    frame.render_widget(paragraph, chat_area);

    if total > visible {
        let mut state = ScrollbarState::new(total as usize)
            .position(app.scroll_offset as usize)
            .viewport_content_length(visible as usize);
        frame.render_stateful_widget(
            Scrollbar::new(ScrollbarOrientation::VerticalRight),
            area,
            &mut state,
        );
    }

    if app.scroll.show_jump_affordance() && chat_area.height > 0 {
        let hint = " ↓ new output (End) ";
        let hint_width = u16::try_from(hint.chars().count()).unwrap_or(u16::MAX);
        let hint_area = Rect::new(
            chat_area.x + chat_area.width.saturating_sub(hint_width),
            chat_area.y + chat_area.height - 1,
            hint_width.min(chat_area.width),
            1,
        );
        frame.render_widget(
            Paragraph::new(hint).style(Style::default().fg(Color::Black).bg(Color::Yellow)),
            hint_area,
        );
    }
}

fn render_input(frame: &mut Frame, app: &App, separator_area: Rect, input_area: Rect) {
    frame.render_widget(
        Paragraph::new("─".repeat(separator_area.width as usize))
            .style(Style::default().fg(Color::DarkGray)),
        separator_area,
    );

    let (prompt, color) = if app.is_editing() {
        ("edit> ", Color::Magenta)
    } else {
        ("> ", Color::Cyan)
    };
    let line = Line::from(vec![
        Span::styled(prompt, Style::default().fg(color)),
        Span::styled(app.input.as_str(), Style::default().fg(Color::White)),
    ]);
    frame.render_widget(Paragraph::new(line), input_area);

    // Hide the cursor while streaming to avoid flicker.
    if !app.is_generating() {
        let x = input_area.x
            + u16::try_from(prompt.len() + app.cursor_position).unwrap_or(input_area.width);
        frame.set_cursor_position((x.min(input_area.right().saturating_sub(1)), input_area.y));
    }
}

fn render_status_bar(frame: &mut Frame, app: &App, area: Rect) {
    let key = |k: &'static str| Span::styled(k, Style::default().fg(Color::Yellow));

    let status = if let Some(error) = app.visible_error() {
        Line::from(vec![
            Span::styled(" ERROR: ", Style::default().fg(Color::Red).bold()),
            Span::styled(error.to_string(), Style::default().fg(Color::Red)),
        ])
    } else if let Some(status) = &app.status_message {
        Line::from(Span::styled(format!(" {status}"), Style::default().fg(Color::Green)))
    } else if app.connection.offers_bypass() {
        Line::from(vec![
            Span::styled(" Tunnel warning page detected. ", Style::default().fg(Color::Yellow)),
            key("Ctrl+B"),
            Span::raw(":bypass"),
        ])
    } else {
        Line::from(vec![
            Span::raw(" "),
            key("Enter"),
            Span::raw(":send "),
            key("Esc"),
            Span::raw(":stop "),
            key("^N"),
            Span::raw(":new "),
            key("^R"),
            Span::raw(":regenerate "),
            key("^E"),
            Span::raw(":edit "),
            key("^C"),
            Span::raw(":quit"),
        ])
    };
    frame.render_widget(Paragraph::new(status).style(Style::default().bg(Color::DarkGray)), area);
}

/// Number of visual lines after wrapping at `width`.
fn wrapped_line_count(text: &Text, width: usize) -> usize {
    if width == 0 {
        return text.lines.len();
    }
    text.lines
        .iter()
        .map(|line| line.width().div_ceil(width).max(1))
        .sum()
}
