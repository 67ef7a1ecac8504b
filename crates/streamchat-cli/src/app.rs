//! Application state.
//!
//! Owns the chat pipeline and mirrors the health monitor's status. Streaming
//! turns run on their own task and come back as [`AppEvent`]s, so the event
//! loop keeps handling keys (including stop) while text arrives.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use streamchat_core::{
    ChatPipeline, ClientConfig, ConnectionStatus, ConversationTurn, HealthMonitor, Role,
    ScrollFollow, SendRejected, Transport, TurnEnd, TurnId, TurnTicket, TurnUpdate,
};
use tokio::sync::mpsc;

/// Events delivered to the UI loop from background tasks.
#[derive(Debug)]
pub enum AppEvent {
    /// Progress of the streaming turn.
    Turn(TurnUpdate),
    /// The health monitor published a new status.
    Status(ConnectionStatus),
}

/// Application state.
pub struct App {
    config: Arc<ClientConfig>,
    pipeline: ChatPipeline,
    monitor: HealthMonitor,
    transport: Arc<dyn Transport>,
    events: mpsc::Sender<AppEvent>,

    /// Latest published connection status.
    pub connection: ConnectionStatus,
    /// Current input buffer.
    pub input: String,
    /// Cursor position in input, in chars.
    pub cursor_position: usize,
    /// Turn being edited, when the input holds an earlier message.
    editing: Option<TurnId>,

    /// Follow/detach tracking for the chat view.
    pub scroll: ScrollFollow,
    /// Lines skipped from the top of the chat view.
    pub scroll_offset: u32,
    content_height: u32,
    viewport_height: u32,

    /// Status message to display.
    pub status_message: Option<String>,
    error: Option<(String, Instant)>,
    /// URL to open for the interstitial bypass, while pending.
    pub bypass_url: Option<String>,
    /// Whether the app should quit.
    pub should_quit: bool,
    /// Animation frame counter for the thinking spinner.
    pub animation_frame: usize,
}

impl App {
    /// Create the application. Status updates from `monitor` must be
    /// forwarded to `events` by the caller.
    #[must_use]
    pub fn new(
        config: Arc<ClientConfig>,
        pipeline: ChatPipeline,
        monitor: HealthMonitor,
        transport: Arc<dyn Transport>,
        events: mpsc::Sender<AppEvent>,
    ) -> Self {
        let connection = monitor.status();
        let scroll = ScrollFollow::new(config.ui.scroll_threshold);
        Self {
            config,
            pipeline,
            monitor,
            transport,
            events,
            connection,
            input: String::new(),
            cursor_position: 0,
            editing: None,
            scroll,
            scroll_offset: 0,
            content_height: 0,
            viewport_height: 0,
            status_message: None,
            error: None,
            bypass_url: None,
            should_quit: false,
            animation_frame: 0,
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Base URL for the header.
    #[must_use]
    pub fn base_url(&self) -> &str {
        self.config.api.base()
    }

    /// Committed turns.
    #[must_use]
    pub fn turns(&self) -> &[ConversationTurn] {
        self.pipeline.turns()
    }

    /// Turn being streamed, if any.
    #[must_use]
    pub fn active_turn(&self) -> Option<&ConversationTurn> {
        self.pipeline.active_turn()
    }

    /// Whether a response is streaming.
    #[must_use]
    pub fn is_generating(&self) -> bool {
        self.pipeline.is_generating()
    }

    /// Whether the input holds an edited earlier message.
    #[must_use]
    pub const fn is_editing(&self) -> bool {
        self.editing.is_some()
    }

    /// Error to show, until it expires.
    #[must_use]
    pub fn visible_error(&self) -> Option<&str> {
        self.error
            .as_ref()
            .filter(|(_, at)| at.elapsed() < self.config.ui.error_display())
            .map(|(msg, _)| msg.as_str())
    }

    /// Advance the spinner and drop an expired error.
    pub fn tick(&mut self) {
        self.animation_frame = self.animation_frame.wrapping_add(1);
        if self.error.is_some() && self.visible_error().is_none() {
            self.error = None;
        }
    }

    /// Current spinner frame.
    #[must_use]
    pub fn spinner_char(&self) -> &'static str {
        const SPINNER: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
        SPINNER[self.animation_frame % SPINNER.len()]
    }

    /// Set the status message (also clears any error).
    pub fn set_status(&mut self, message: impl Into<String>) {
        self.status_message = Some(message.into());
        self.error = None;
    }

    /// Show a transient error.
    pub fn set_error(&mut self, message: impl Into<String>) {
        self.error = Some((message.into(), Instant::now()));
    }

    /// Clear the error message.
    pub fn clear_error(&mut self) {
        self.error = None;
    }

    // =========================================================================
    // Input Handling
    // =========================================================================

    fn byte_index(&self) -> usize {
        self.input
            .char_indices()
            .nth(self.cursor_position)
            .map_or(self.input.len(), |(i, _)| i)
    }

    fn input_chars(&self) -> usize {
        self.input.chars().count()
    }

    /// Insert a character at the cursor position.
    pub fn insert_char(&mut self, c: char) {
        let at = self.byte_index();
        self.input.insert(at, c);
        self.cursor_position += 1;
    }

    /// Delete the character before the cursor.
    pub fn delete_char(&mut self) {
        if self.cursor_position > 0 {
            self.cursor_position -= 1;
            let at = self.byte_index();
            self.input.remove(at);
        }
    }

    /// Delete the character at the cursor.
    pub fn delete_char_forward(&mut self) {
        if self.cursor_position < self.input_chars() {
            let at = self.byte_index();
            self.input.remove(at);
        }
    }

    /// Delete back to the previous word boundary.
    pub fn delete_word(&mut self) {
        while self.cursor_position > 0 {
            self.delete_char();
            let prev = self.input.chars().nth(self.cursor_position.wrapping_sub(1));
            if self.cursor_position == 0 || prev == Some(' ') {
                break;
            }
        }
    }

    /// Move cursor left.
    pub fn move_cursor_left(&mut self) {
        self.cursor_position = self.cursor_position.saturating_sub(1);
    }

    /// Move cursor right.
    pub fn move_cursor_right(&mut self) {
        if self.cursor_position < self.input_chars() {
            self.cursor_position += 1;
        }
    }

    /// Move cursor to the start.
    pub fn move_cursor_start(&mut self) {
        self.cursor_position = 0;
    }

    /// Move cursor to the end.
    pub fn move_cursor_end(&mut self) {
        self.cursor_position = self.input_chars();
    }

    /// Clear the input and leave edit mode.
    pub fn clear_input(&mut self) {
        self.input.clear();
        self.cursor_position = 0;
        self.editing = None;
    }

    fn set_input(&mut self, text: &str) {
        self.input = text.to_string();
        self.cursor_position = self.input_chars();
    }

    // =========================================================================
    // Chat Operations
    // =========================================================================

    /// Send the input, or resubmit it in place of the edited turn.
    pub fn submit(&mut self) {
        if self.input.trim().is_empty() {
            return;
        }
        let started = match self.editing {
            Some(id) => self.pipeline.begin_edit(id, &self.input),
            None => self.pipeline.begin(&self.input),
        };
        match started {
            Ok(ticket) => {
                self.clear_input();
                self.start_stream(ticket);
            }
            Err(e) => self.reject(&e),
        }
    }

    /// Regenerate the last response.
    pub fn regenerate(&mut self) {
        match self.pipeline.begin_regenerate() {
            Ok(ticket) => self.start_stream(ticket),
            Err(e) => self.reject(&e),
        }
    }

    fn reject(&mut self, reason: &SendRejected) {
        tracing::debug!(reason = %reason, "Send rejected");
        if *reason != SendRejected::EmptyInput {
            self.set_error(reason.to_string());
        }
    }

    fn start_stream(&mut self, ticket: TurnTicket) {
        let mut updates = ChatPipeline::stream_turn(Arc::clone(&self.transport), ticket);
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(update) = updates.next().await {
                if events.send(AppEvent::Turn(update)).await.is_err() {
                    break;
                }
            }
        });
        self.set_status("Generating... (Esc to stop)");
        self.jump_to_bottom();
    }

    /// Stop the streaming response. Returns `false` if idle.
    pub fn stop(&mut self) -> bool {
        let stopped = self.pipeline.stop();
        if stopped {
            self.set_status("Stopping...");
        }
        stopped
    }

    /// Start a fresh conversation (ignored while generating).
    pub fn new_chat(&mut self) {
        if self.pipeline.new_chat() {
            self.clear_input();
            self.set_status("New chat");
            self.jump_to_bottom();
        }
    }

    /// Load the most recent user message into the input for editing.
    pub fn edit_last(&mut self) {
        if self.is_generating() {
            return;
        }
        let last = self
            .pipeline
            .turns()
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| (t.id, t.content.clone()));
        match last {
            Some((id, content)) => {
                self.set_input(&content);
                self.editing = Some(id);
                self.set_status("Editing last message (Enter to resubmit, Esc to cancel)");
            }
            None => self.set_error("No message to edit"),
        }
    }

    /// Escape: stop, cancel an edit, or clear the error.
    pub fn escape(&mut self) {
        if self.stop() {
            return;
        }
        if self.editing.is_some() {
            self.clear_input();
            self.status_message = None;
        } else {
            self.clear_error();
        }
    }

    /// Start the interstitial bypass.
    pub fn bypass(&mut self) {
        if let Some(url) = self.monitor.begin_bypass() {
            self.set_status(format!("Open {url} in a browser; re-checking shortly"));
            self.bypass_url = Some(url);
        } else {
            self.set_error("Bypass is only available when the tunnel shows its warning page");
        }
    }

    /// Handle an event from a background task. Returns `true` if the UI
    /// should be redrawn.
    pub fn handle_event(&mut self, event: AppEvent) -> bool {
        match event {
            AppEvent::Turn(update) => {
                if let Some(end) = self.pipeline.apply(update) {
                    match end {
                        TurnEnd::Completed => self.set_status("Done"),
                        TurnEnd::Cancelled => self.set_status("Stopped"),
                        TurnEnd::Failed(e) => self.set_error(e.user_message()),
                    }
                }
                true
            }
            AppEvent::Status(status) => {
                if status.is_connected() {
                    self.bypass_url = None;
                }
                self.connection = status;
                true
            }
        }
    }

    // =========================================================================
    // Chat Scrolling
    // =========================================================================

    fn bottom(&self) -> u32 {
        self.content_height.saturating_sub(self.viewport_height)
    }

    /// Record the chat view's size after layout and pin to the bottom while
    /// following.
    pub fn update_viewport(&mut self, content_height: u32, viewport_height: u32) {
        self.content_height = content_height;
        self.viewport_height = viewport_height;
        let bottom = self.bottom();
        if self.scroll.on_render_tick() {
            if self.scroll_offset != bottom {
                self.scroll_offset = bottom;
                self.scroll.on_scroll(bottom, content_height, viewport_height);
            }
        } else if self.scroll_offset > bottom {
            self.scroll_offset = bottom;
        }
    }

    /// Scroll toward older messages.
    pub fn scroll_up(&mut self, lines: u32) {
        self.scroll.on_user_gesture();
        self.scroll_offset = self.scroll_offset.saturating_sub(lines);
        self.scroll
            .on_scroll(self.scroll_offset, self.content_height, self.viewport_height);
    }

    /// Scroll toward newer messages.
    pub fn scroll_down(&mut self, lines: u32) {
        self.scroll.on_user_gesture();
        self.scroll_offset = self.scroll_offset.saturating_add(lines).min(self.bottom());
        self.scroll
            .on_scroll(self.scroll_offset, self.content_height, self.viewport_height);
    }

    /// Jump to the latest output and resume following.
    pub fn jump_to_bottom(&mut self) {
        self.scroll.jump_to_bottom();
        self.scroll_offset = self.bottom();
        self.scroll
            .on_scroll(self.scroll_offset, self.content_height, self.viewport_height);
    }

    /// Page size for PageUp/PageDown.
    #[must_use]
    pub fn page(&self) -> u32 {
        self.viewport_height.saturating_sub(2).max(1)
    }

    /// Time between periodic redraws when idle.
    #[must_use]
    pub fn tick_rate(&self) -> Duration {
        if self.is_generating() {
            Duration::from_millis(80)
        } else {
            Duration::from_millis(200)
        }
    }
}
