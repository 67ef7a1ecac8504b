//! Core of the streamchat client.
//!
//! This crate talks to a tunnel-fronted text-generation backend:
//!
//! - **Transport**: streaming HTTP body or WebSocket, behind one cancellable
//!   fragment stream
//! - **Decoder**: `data:`-prefixed line records into content deltas
//! - **Health**: periodic liveness probing with retry and interstitial detection
//! - **Pipeline**: one chat turn at a time, with stop, edit and regenerate
//! - **Scroll**: whether the view follows new output
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use streamchat_core::{build_transport, ChatPipeline, ClientConfig, HealthMonitor};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(ClientConfig::default());
//! let monitor = HealthMonitor::new(config.clone())?;
//! monitor.probe().await;
//!
//! let transport = build_transport(&config.api)?;
//! let mut pipeline = ChatPipeline::new(config, Arc::new(monitor), None);
//! pipeline
//!     .send(&transport, "2+2?", &mut |turn: &streamchat_core::ConversationTurn| {
//!         println!("{}", turn.content);
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod decoder;
pub mod error;
pub mod health;
pub mod ids;
pub mod pipeline;
pub mod scroll;
pub mod store;
pub mod transport;
pub mod types;

pub use config::{ApiConfig, ClientConfig, Dialect, GenerationDefaults, TransportKind, UiConfig};
pub use decoder::{decode_stream, FrameDecoder, StreamEvent};
pub use error::{ConfigError, Result, SendRejected, StoreError, TransportError};
pub use health::{
    ConnectionStatus, DisconnectReason, HealthMonitor, LinkState, StatusSource, SubscriptionId,
};
pub use ids::{IdError, TurnId};
pub use pipeline::{ChatPipeline, StopHandle, TurnEnd, TurnObserver, TurnTicket, TurnUpdate};
pub use scroll::{FollowState, ScrollFollow, ScrollState};
pub use store::ConversationStore;
pub use transport::{
    build_transport, FragmentStream, HttpStreamTransport, Transport, WebSocketTransport,
};
pub use types::{ConversationState, ConversationTurn, Role, SEED_GREETING};
