//! Streamchat CLI - terminal chat client for tunnel-fronted backends.
//!
//! This is the entry point for the `schat` binary.

mod app;
mod markdown;
mod ui;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use crossterm::event::{
    self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEvent, KeyEventKind,
    KeyModifiers, MouseEventKind,
};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::Terminal;
use streamchat_core::{
    build_transport, ChatPipeline, ClientConfig, ConversationStore, Dialect, HealthMonitor,
    TransportKind,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use app::{App, AppEvent};

/// Lines moved per mouse wheel notch.
const WHEEL_LINES: u32 = 3;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TransportArg {
    Http,
    Websocket,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DialectArg {
    Openai,
    SingleEndpoint,
}

/// Streamchat - chat with a streaming text-generation backend.
#[derive(Parser, Debug)]
#[command(name = "schat")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a JSON config file.
    #[arg(long, env = "STREAMCHAT_CONFIG")]
    config: Option<PathBuf>,

    /// Backend base URL (overrides the config file).
    #[arg(long, env = "STREAMCHAT_BASE_URL")]
    base_url: Option<String>,

    /// Wire shape for chat turns.
    #[arg(long, value_enum, env = "STREAMCHAT_TRANSPORT")]
    transport: Option<TransportArg>,

    /// Request dialect.
    #[arg(long, value_enum, env = "STREAMCHAT_DIALECT")]
    dialect: Option<DialectArg>,

    /// Request timeout in milliseconds.
    #[arg(long, env = "STREAMCHAT_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// System prompt for new turns.
    #[arg(long, env = "STREAMCHAT_SYSTEM_PROMPT")]
    system_prompt: Option<String>,

    /// Where to persist the conversation.
    #[arg(long, env = "STREAMCHAT_SESSION_FILE")]
    session_file: Option<PathBuf>,

    /// Do not load or save the conversation.
    #[arg(long, default_value = "false")]
    no_persist: bool,

    /// Enable debug logging.
    #[arg(long, default_value = "false")]
    debug: bool,

    /// Write debug logs to this file instead of stderr.
    #[arg(long, requires = "debug")]
    log_file: Option<PathBuf>,
}

impl Args {
    fn load_config(&self) -> anyhow::Result<ClientConfig> {
        let path = self.config.clone().or_else(ClientConfig::default_path);
        let mut config = match &path {
            Some(path) => ClientConfig::load(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => ClientConfig::default(),
        };

        if let Some(url) = &self.base_url {
            config.api.base_url.clone_from(url);
        }
        if let Some(transport) = self.transport {
            config.api.transport = match transport {
                TransportArg::Http => TransportKind::HttpStream,
                TransportArg::Websocket => TransportKind::Websocket,
            };
        }
        if let Some(dialect) = self.dialect {
            config.api.dialect = match dialect {
                DialectArg::Openai => Dialect::OpenAi,
                DialectArg::SingleEndpoint => Dialect::SingleEndpoint,
            };
        }
        if let Some(ms) = self.timeout_ms {
            config.api.timeout_ms = ms;
        }
        if let Some(prompt) = &self.system_prompt {
            config.defaults.system_prompt.clone_from(prompt);
        }
        if let Some(path) = &self.session_file {
            config.storage_path = Some(path.clone());
        }

        config.validate()?;
        Ok(config)
    }

    fn init_logging(&self) -> anyhow::Result<()> {
        if !self.debug {
            return Ok(());
        }
        let filter = "streamchat_cli=debug,streamchat_core=debug,warn";
        match &self.log_file {
            Some(path) => {
                let file = std::fs::File::create(path)
                    .with_context(|| format!("creating log file {}", path.display()))?;
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file))
                    .init();
            }
            None => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(std::io::stderr)
                    .init();
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    args.init_logging()?;

    let config = Arc::new(args.load_config()?);
    tracing::info!(base_url = %config.api.base_url, transport = ?config.api.transport, "Starting");

    let (events_tx, events_rx) = mpsc::channel::<AppEvent>(256);

    let monitor = HealthMonitor::new(config.clone())?;
    {
        let tx = events_tx.clone();
        monitor.subscribe(move |status| {
            if tx.try_send(AppEvent::Status(status.clone())).is_err() {
                tracing::debug!("Dropped status update, UI channel full");
            }
        });
    }
    let shutdown = CancellationToken::new();
    let health_task = monitor.spawn_periodic(shutdown.clone());

    let store = if args.no_persist {
        None
    } else {
        match ConversationStore::from_config(&config) {
            Ok(store) => Some(store),
            Err(e) => {
                tracing::warn!(error = %e, "Conversation will not be persisted");
                None
            }
        }
    };
    let transport = build_transport(&config.api)?;
    let pipeline = ChatPipeline::new(config.clone(), Arc::new(monitor.clone()), store);
    let mut app = App::new(config, pipeline, monitor, transport, events_tx);

    // Setup terminal with mouse capture enabled
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run_event_loop(&mut terminal, &mut app, events_rx).await;

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
    terminal.show_cursor()?;

    app.stop();
    shutdown.cancel();
    let _ = health_task.await;

    result
}

/// Main event loop. Redraws immediately on every streamed update.
async fn run_event_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
    mut events: mpsc::Receiver<AppEvent>,
) -> anyhow::Result<()> {
    loop {
        app.tick();
        terminal.draw(|f| ui::render(f, app))?;

        tokio::select! {
            () = tokio::time::sleep(app.tick_rate()) => {
                while event::poll(Duration::from_millis(0)).unwrap_or(false) {
                    if let Ok(evt) = event::read() {
                        handle_input(app, evt);
                    }
                }
            }

            Some(event) = events.recv() => {
                if app.handle_event(event) {
                    terminal.draw(|f| ui::render(f, app))?;
                }
            }
        }

        if app.should_quit {
            break;
        }
    }
    Ok(())
}

/// Handle terminal input events.
fn handle_input(app: &mut App, event: Event) {
    match event {
        Event::Key(key) if key.kind == KeyEventKind::Press => handle_key(app, key),
        Event::Mouse(mouse) => match mouse.kind {
            MouseEventKind::ScrollUp => app.scroll_up(WHEEL_LINES),
            MouseEventKind::ScrollDown => app.scroll_down(WHEEL_LINES),
            _ => {}
        },
        _ => {}
    }
}

fn handle_key(app: &mut App, key: KeyEvent) {
    if key.modifiers.contains(KeyModifiers::CONTROL) {
        match key.code {
            KeyCode::Char('c') => app.should_quit = true,
            KeyCode::Char('n') => app.new_chat(),
            KeyCode::Char('r') => app.regenerate(),
            KeyCode::Char('e') => app.edit_last(),
            KeyCode::Char('b') => app.bypass(),
            KeyCode::Char('a') => app.move_cursor_start(),
            KeyCode::Char('u') => app.clear_input(),
            KeyCode::Char('w') => app.delete_word(),
            _ => {}
        }
        return;
    }

    match key.code {
        KeyCode::Enter => app.submit(),
        KeyCode::Esc => app.escape(),
        KeyCode::PageUp => app.scroll_up(app.page()),
        KeyCode::PageDown => app.scroll_down(app.page()),
        KeyCode::Up => app.scroll_up(1),
        KeyCode::Down => app.scroll_down(1),
        KeyCode::End => app.jump_to_bottom(),
        KeyCode::Home => app.move_cursor_start(),
        KeyCode::Left => app.move_cursor_left(),
        KeyCode::Right => app.move_cursor_right(),
        KeyCode::Backspace => app.delete_char(),
        KeyCode::Delete => app.delete_char_forward(),
        KeyCode::Char(c) => app.insert_char(c),
        _ => {}
    }
}
