//! Streaming message pipeline.
//!
//! Owns the conversation and runs one chat turn at a time. A turn goes
//! through three steps:
//!
//! 1. [`ChatPipeline::begin`] validates the input, appends the user turn,
//!    creates the active placeholder and issues a cancellation token.
//! 2. [`ChatPipeline::stream_turn`] opens the transport and yields
//!    [`TurnUpdate`]s. It holds no borrow of the pipeline, so it can run on
//!    another task while the owner keeps handling input.
//! 3. [`ChatPipeline::apply`] folds each update into the active turn. The
//!    final `Finished` update commits it.
//!
//! [`ChatPipeline::send`] runs all three inline.
//!
//! The active turn lives outside the committed list until it finishes, and
//! its presence is the "generating" flag. It is cleared in exactly one
//! place, [`ChatPipeline::apply`] on `Finished`.

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::{ClientConfig, Dialect};
use crate::decoder::{decode_stream, StreamEvent};
use crate::error::{SendRejected, TransportError};
use crate::health::StatusSource;
use crate::ids::TurnId;
use crate::store::ConversationStore;
use crate::transport::Transport;
use crate::types::{
    ChatRequest, ConversationState, ConversationTurn, EndpointRequest, Role, TurnRequest,
    WireMessage,
};

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEnd {
    /// The stream ended, or sent its stop record.
    Completed,
    /// The user stopped generation. Not a failure.
    Cancelled,
    /// The transport failed; the turn becomes an `error` turn.
    Failed(TransportError),
}

/// Progress of a streaming turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnUpdate {
    /// The transport is open; the placeholder becomes an assistant turn.
    Opened,
    /// Text to append.
    Delta(String),
    /// Always the last update of a turn.
    Finished(TurnEnd),
}

/// Everything [`ChatPipeline::stream_turn`] needs to run one turn.
#[derive(Debug)]
pub struct TurnTicket {
    turn_id: TurnId,
    request: TurnRequest,
    cancel: CancellationToken,
}

impl TurnTicket {
    /// Id of the placeholder turn this ticket streams into.
    #[must_use]
    pub const fn turn_id(&self) -> TurnId {
        self.turn_id
    }

    /// Request that will be sent.
    #[must_use]
    pub const fn request(&self) -> &TurnRequest {
        &self.request
    }
}

/// Callbacks invoked by [`ChatPipeline::send`] as a turn progresses.
pub trait TurnObserver {
    /// The active turn changed (opened or received text).
    fn on_update(&mut self, turn: &ConversationTurn);

    /// The turn was committed.
    fn on_finished(&mut self, _end: &TurnEnd) {}
}

impl<F> TurnObserver for F
where
    F: FnMut(&ConversationTurn),
{
    fn on_update(&mut self, turn: &ConversationTurn) {
        self(turn);
    }
}

/// Stops the active generation from another task.
#[derive(Debug, Clone)]
pub struct StopHandle {
    slot: Arc<Mutex<Option<CancellationToken>>>,
}

impl StopHandle {
    /// Cancel the active generation. Returns `false` if none is active.
    pub fn stop(&self) -> bool {
        match self.slot.lock().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// Conversation owner and turn orchestrator.
pub struct ChatPipeline {
    config: Arc<ClientConfig>,
    status: Arc<dyn StatusSource>,
    store: Option<ConversationStore>,
    state: ConversationState,
    active: Option<ConversationTurn>,
    cancel_slot: Arc<Mutex<Option<CancellationToken>>>,
}

impl std::fmt::Debug for ChatPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatPipeline")
            .field("turns", &self.state.turns.len())
            .field("generating", &self.is_generating())
            .finish_non_exhaustive()
    }
}

impl ChatPipeline {
    /// Create a pipeline, loading the conversation from `store` if given.
    #[must_use]
    pub fn new(
        config: Arc<ClientConfig>,
        status: Arc<dyn StatusSource>,
        store: Option<ConversationStore>,
    ) -> Self {
        let default_prompt = config.defaults.system_prompt.clone();
        let state = store.as_ref().map_or_else(
            || ConversationState::seeded(default_prompt.clone()),
            |s| s.load_or_seed(&default_prompt),
        );
        Self {
            config,
            status,
            store,
            state,
            active: None,
            cancel_slot: Arc::new(Mutex::new(None)),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Whether a turn is streaming.
    #[must_use]
    pub const fn is_generating(&self) -> bool {
        self.active.is_some()
    }

    /// Committed turns, oldest first.
    #[must_use]
    pub fn turns(&self) -> &[ConversationTurn] {
        &self.state.turns
    }

    /// The in-flight turn, if any.
    #[must_use]
    pub const fn active_turn(&self) -> Option<&ConversationTurn> {
        self.active.as_ref()
    }

    /// Committed conversation.
    #[must_use]
    pub const fn state(&self) -> &ConversationState {
        &self.state
    }

    /// Current system prompt.
    #[must_use]
    pub fn system_prompt(&self) -> &str {
        &self.state.system_prompt
    }

    /// Handle that can stop the active generation from elsewhere.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            slot: Arc::clone(&self.cancel_slot),
        }
    }

    // =========================================================================
    // Turn lifecycle
    // =========================================================================

    fn check_can_send(&self, text: &str) -> Result<(), SendRejected> {
        if self.is_generating() {
            return Err(SendRejected::Busy);
        }
        if text.trim().is_empty() {
            return Err(SendRejected::EmptyInput);
        }
        let status = self.status.current_status();
        if !status.is_connected() {
            return Err(SendRejected::NotConnected(status.reason_text));
        }
        Ok(())
    }

    /// Start a turn for `text`.
    ///
    /// # Errors
    ///
    /// Rejected while generating, for blank input, or when the connection
    /// status is not `Connected`. Nothing changes on rejection.
    pub fn begin(&mut self, text: &str) -> Result<TurnTicket, SendRejected> {
        self.check_can_send(text)?;
        let text = text.trim();

        self.state.turns.push(ConversationTurn::user(text));
        let request = self.build_request(text);

        let placeholder = ConversationTurn::new(Role::Thinking, "");
        let turn_id = placeholder.id;
        let cancel = CancellationToken::new();
        *self.cancel_slot.lock() = Some(cancel.clone());
        self.active = Some(placeholder);
        self.persist();

        tracing::info!(turn_id = %turn_id, history = self.state.turns.len(), "Turn started");
        Ok(TurnTicket {
            turn_id,
            request,
            cancel,
        })
    }

    fn build_request(&self, latest: &str) -> TurnRequest {
        match self.config.api.dialect {
            Dialect::SingleEndpoint => TurnRequest::Endpoint(EndpointRequest::Chat {
                message: latest.to_string(),
            }),
            Dialect::OpenAi => {
                let system = (!self.state.system_prompt.is_empty()).then(|| WireMessage {
                    role: "system".to_string(),
                    content: self.state.system_prompt.clone(),
                });
                let history = self
                    .state
                    .turns
                    .iter()
                    // A reply stopped before its first delta has nothing to send.
                    .filter(|t| t.role.is_sendable() && !t.content.is_empty())
                    .map(|t| WireMessage {
                        role: t.role.as_str().to_string(),
                        content: t.content.clone(),
                    });
                TurnRequest::Chat(ChatRequest {
                    messages: system.into_iter().chain(history).collect(),
                    max_tokens: self.config.defaults.max_tokens,
                    temperature: self.config.defaults.temperature,
                })
            }
        }
    }

    /// Open the transport and stream the turn's updates.
    ///
    /// Always ends with exactly one `Finished`. Malformed records are
    /// skipped.
    pub fn stream_turn(
        transport: Arc<dyn Transport>,
        ticket: TurnTicket,
    ) -> BoxStream<'static, TurnUpdate> {
        enum Phase {
            Opening(Arc<dyn Transport>, TurnTicket),
            Reading(BoxStream<'static, Result<StreamEvent, TransportError>>),
            Done,
        }

        fn finished(e: TransportError) -> TurnUpdate {
            if e.is_cancelled() {
                TurnUpdate::Finished(TurnEnd::Cancelled)
            } else {
                TurnUpdate::Finished(TurnEnd::Failed(e))
            }
        }

        stream::unfold(Phase::Opening(transport, ticket), |phase| async move {
            match phase {
                Phase::Opening(transport, ticket) => {
                    match transport.open(&ticket.request, ticket.cancel.clone()).await {
                        Ok(fragments) => Some((
                            TurnUpdate::Opened,
                            Phase::Reading(decode_stream(fragments)),
                        )),
                        Err(e) => Some((finished(e), Phase::Done)),
                    }
                }
                Phase::Reading(mut events) => loop {
                    match events.next().await {
                        Some(Ok(StreamEvent::ContentDelta(text))) => {
                            return Some((TurnUpdate::Delta(text), Phase::Reading(events)));
                        }
                        Some(Ok(StreamEvent::MalformedFrame(raw))) => {
                            tracing::debug!(payload = %raw, "Skipping malformed record");
                        }
                        Some(Ok(StreamEvent::Stop)) | None => {
                            return Some((TurnUpdate::Finished(TurnEnd::Completed), Phase::Done));
                        }
                        Some(Err(e)) => return Some((finished(e), Phase::Done)),
                    }
                },
                Phase::Done => None,
            }
        })
        .boxed()
    }

    /// Fold one update into the active turn. Returns the outcome when the
    /// update finished the turn.
    pub fn apply(&mut self, update: TurnUpdate) -> Option<TurnEnd> {
        let Some(active) = self.active.as_mut() else {
            tracing::debug!(?update, "Update with no active turn");
            return None;
        };
        match update {
            TurnUpdate::Opened => {
                active.role = Role::Assistant;
                None
            }
            TurnUpdate::Delta(text) => {
                active.role = Role::Assistant;
                active.content.push_str(&text);
                None
            }
            TurnUpdate::Finished(end) => {
                self.finalize(&end);
                Some(end)
            }
        }
    }

    fn finalize(&mut self, end: &TurnEnd) {
        let Some(mut turn) = self.active.take() else {
            return;
        };
        self.cancel_slot.lock().take();

        match end {
            TurnEnd::Completed | TurnEnd::Cancelled => turn.role = Role::Assistant,
            TurnEnd::Failed(e) => {
                tracing::warn!(turn_id = %turn.id, error = %e, "Turn failed");
                turn.role = Role::Error;
                turn.content = e.user_message();
            }
        }
        tracing::info!(turn_id = %turn.id, outcome = ?end, chars = turn.content.len(), "Turn finished");
        self.state.turns.push(turn);
        self.persist();
    }

    /// Run a whole turn inline, reporting progress to `observer`.
    ///
    /// # Errors
    ///
    /// Same rejections as [`begin`](Self::begin). Transport failures are not
    /// errors here; they finish the turn as an `error` turn.
    pub async fn send(
        &mut self,
        transport: &Arc<dyn Transport>,
        text: &str,
        observer: &mut dyn TurnObserver,
    ) -> Result<TurnEnd, SendRejected> {
        let ticket = self.begin(text)?;
        Ok(self.drive(transport, ticket, observer).await)
    }

    async fn drive(
        &mut self,
        transport: &Arc<dyn Transport>,
        ticket: TurnTicket,
        observer: &mut dyn TurnObserver,
    ) -> TurnEnd {
        let mut updates = Self::stream_turn(Arc::clone(transport), ticket);
        while let Some(update) = updates.next().await {
            if let Some(end) = self.apply(update) {
                observer.on_finished(&end);
                return end;
            }
            if let Some(turn) = self.active_turn() {
                observer.on_update(turn);
            }
        }
        // stream_turn always ends with Finished; guard against a dropped stream.
        let end = TurnEnd::Cancelled;
        self.finalize(&end);
        end
    }

    /// Cancel the active generation. No effect when idle.
    pub fn stop(&self) -> bool {
        self.stop_handle().stop()
    }

    /// Start a turn that replaces the history from `turn_id` onward with
    /// `new_text`.
    ///
    /// # Errors
    ///
    /// Same rejections as [`begin`](Self::begin), plus `UnknownTurn`. The
    /// history is untouched on rejection.
    pub fn begin_edit(
        &mut self,
        turn_id: TurnId,
        new_text: &str,
    ) -> Result<TurnTicket, SendRejected> {
        self.check_can_send(new_text)?;
        let position = self
            .state
            .position(turn_id)
            .ok_or(SendRejected::UnknownTurn(turn_id))?;
        tracing::debug!(turn_id = %turn_id, position, "Resubmitting edited turn");
        self.state.turns.truncate(position);
        self.persist();
        self.begin(new_text)
    }

    /// Inline form of [`begin_edit`](Self::begin_edit).
    ///
    /// # Errors
    ///
    /// See [`begin_edit`](Self::begin_edit).
    pub async fn edit_and_resubmit(
        &mut self,
        transport: &Arc<dyn Transport>,
        turn_id: TurnId,
        new_text: &str,
        observer: &mut dyn TurnObserver,
    ) -> Result<TurnEnd, SendRejected> {
        let ticket = self.begin_edit(turn_id, new_text)?;
        Ok(self.drive(transport, ticket, observer).await)
    }

    /// Start a turn that resubmits the most recent user turn.
    ///
    /// # Errors
    ///
    /// `Busy` while generating, `NothingToRegenerate` without a user turn,
    /// or `NotConnected`.
    pub fn begin_regenerate(&mut self) -> Result<TurnTicket, SendRejected> {
        if self.is_generating() {
            return Err(SendRejected::Busy);
        }
        let position = self
            .state
            .last_user_position()
            .ok_or(SendRejected::NothingToRegenerate)?;
        let text = self.state.turns[position].content.clone();
        self.check_can_send(&text)?;
        self.state.turns.truncate(position);
        self.persist();
        self.begin(&text)
    }

    /// Inline form of [`begin_regenerate`](Self::begin_regenerate).
    ///
    /// # Errors
    ///
    /// See [`begin_regenerate`](Self::begin_regenerate).
    pub async fn regenerate(
        &mut self,
        transport: &Arc<dyn Transport>,
        observer: &mut dyn TurnObserver,
    ) -> Result<TurnEnd, SendRejected> {
        let ticket = self.begin_regenerate()?;
        Ok(self.drive(transport, ticket, observer).await)
    }

    /// Reset to the seed greeting. Returns `false` (and does nothing) while
    /// generating.
    pub fn new_chat(&mut self) -> bool {
        if self.is_generating() {
            return false;
        }
        self.state = ConversationState::seeded(std::mem::take(&mut self.state.system_prompt));
        self.persist();
        tracing::info!("New chat");
        true
    }

    /// Replace the system prompt. Blank text restores the default.
    pub fn update_system_prompt(&mut self, text: &str) {
        let text = text.trim();
        self.state.system_prompt = if text.is_empty() {
            self.config.defaults.system_prompt.clone()
        } else {
            text.to_string()
        };
        self.persist();
    }

    fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.save(&self.state) {
            tracing::warn!(path = %store.path().display(), error = %e, "Failed to persist conversation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{ConnectionStatus, DisconnectReason};
    use crate::transport::scripted::{Script, ScriptedTransport};
    use crate::types::SEED_GREETING;

    fn connected() -> Arc<dyn StatusSource> {
        Arc::new(ConnectionStatus::connected())
    }

    fn pipeline() -> ChatPipeline {
        ChatPipeline::new(Arc::new(ClientConfig::default()), connected(), None)
    }

    fn transport(scripts: Vec<Script>) -> (Arc<ScriptedTransport>, Arc<dyn Transport>) {
        let scripted = Arc::new(ScriptedTransport::new(scripts));
        let dyn_transport: Arc<dyn Transport> = scripted.clone();
        (scripted, dyn_transport)
    }

    fn last_request(scripted: &ScriptedTransport) -> ChatRequest {
        match scripted.requests.lock().last().cloned() {
            Some(TurnRequest::Chat(req)) => req,
            other => panic!("expected chat request, got {other:?}"),
        }
    }

    fn noop() -> impl FnMut(&ConversationTurn) {
        |_: &ConversationTurn| {}
    }

    #[tokio::test]
    async fn two_plus_two() {
        let (scripted, t) = transport(vec![ScriptedTransport::fragments(&[
            "data: {\"content\":\"4\"}\n",
            "data: [DONE]\n",
        ])]);
        let mut p = pipeline();

        let mut seen = Vec::new();
        let end = p
            .send(&t, "2+2?", &mut |turn: &ConversationTurn| seen.push(turn.content.clone()))
            .await
            .unwrap();

        assert_eq!(end, TurnEnd::Completed);
        assert!(!p.is_generating());
        let last = p.turns().last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.content, "4");
        assert_eq!(seen, vec![String::new(), "4".to_string()]);

        let req = last_request(&scripted);
        assert_eq!(req.messages[0].role, "system");
        assert_eq!(req.messages.last().unwrap().content, "2+2?");
        assert_eq!(req.max_tokens, 2048);
    }

    #[tokio::test]
    async fn placeholder_thinks_until_opened() {
        let (_, t) = transport(vec![ScriptedTransport::fragments(&["data: {\"content\":\"x\"}\n"])]);
        let mut p = pipeline();

        let ticket = p.begin("hi").unwrap();
        assert_eq!(p.active_turn().unwrap().role, Role::Thinking);
        assert_eq!(p.active_turn().unwrap().id, ticket.turn_id());

        let mut updates = ChatPipeline::stream_turn(t, ticket);
        assert_eq!(updates.next().await, Some(TurnUpdate::Opened));
        p.apply(TurnUpdate::Opened);
        assert_eq!(p.active_turn().unwrap().role, Role::Assistant);
    }

    #[tokio::test]
    async fn cancel_keeps_accumulated_text() {
        let (_, t) = transport(vec![Script::ItemsThenHang(vec![
            Ok("data: {\"content\":\"a\"}\n".into()),
            Ok("data: {\"content\":\"b\"}\n".into()),
            Ok("data: {\"content\":\"c\"}\n".into()),
        ])]);
        let mut p = pipeline();
        let handle = p.stop_handle();

        let ticket = p.begin("count").unwrap();
        let mut updates = ChatPipeline::stream_turn(t, ticket);
        for _ in 0..4 {
            let update = updates.next().await.unwrap();
            assert!(p.apply(update).is_none());
        }

        assert!(handle.stop());
        let end = p.apply(updates.next().await.unwrap());
        assert_eq!(end, Some(TurnEnd::Cancelled));
        assert!(updates.next().await.is_none());

        assert!(!p.is_generating());
        let last = p.turns().last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.content, "abc");
    }

    #[tokio::test]
    async fn stop_before_open_finishes_cancelled() {
        let (_, t) = transport(vec![Script::ItemsThenHang(vec![])]);
        let mut p = pipeline();

        let ticket = p.begin("hi").unwrap();
        assert!(p.stop());
        let end = p.drive(&t, ticket, &mut noop()).await;
        assert_eq!(end, TurnEnd::Cancelled);
        assert_eq!(p.turns().last().unwrap().role, Role::Assistant);
    }

    #[tokio::test]
    async fn empty_cancelled_reply_is_not_sent_back() {
        let (scripted, t) = transport(vec![
            Script::ItemsThenHang(vec![]),
            ScriptedTransport::fragments(&["data: {\"content\":\"ok\"}\n"]),
        ]);
        let mut p = pipeline();

        let ticket = p.begin("first").unwrap();
        assert!(p.stop());
        p.drive(&t, ticket, &mut noop()).await;
        assert_eq!(p.turns().last().unwrap().content, "");

        p.send(&t, "second", &mut noop()).await.unwrap();
        let req = last_request(&scripted);
        let roles: Vec<_> = req.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "assistant", "user", "user"]);
        assert!(req.messages.iter().all(|m| !m.content.is_empty()));
    }

    #[tokio::test]
    async fn turn_over_websocket() {
        use crate::transport::build_transport;
        use crate::transport::scripted::ws_backend;
        use futures::SinkExt;
        use tokio_tungstenite::tungstenite::Message;

        let api = ws_backend(|mut ws| async move {
            let _ = ws.next().await;
            ws.send(Message::Text("{\"content\":\"4\"}".into())).await.unwrap();
            ws.send(Message::Text("{\"stop\":true}".into())).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;
        let mut config = ClientConfig::default();
        config.api = api;
        let config = Arc::new(config);
        let t = build_transport(&config.api).unwrap();
        let mut p = ChatPipeline::new(config, connected(), None);

        let end = p.send(&t, "2+2?", &mut noop()).await.unwrap();
        assert_eq!(end, TurnEnd::Completed);
        let last = p.turns().last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.content, "4");
        assert!(!p.is_generating());
    }

    #[test]
    fn stop_when_idle_changes_nothing() {
        let p = pipeline();
        let before = p.state().clone();
        assert!(!p.stop());
        assert!(!p.stop_handle().stop());
        assert_eq!(p.state(), &before);
        assert!(!p.is_generating());
    }

    #[tokio::test]
    async fn edit_first_of_three_turns_drops_all_history() {
        let (scripted, t) = transport(vec![
            ScriptedTransport::fragments(&["data: {\"content\":\"first\"}\n"]),
            ScriptedTransport::fragments(&["data: {\"content\":\"second\"}\n"]),
        ]);
        let mut p = pipeline();
        p.send(&t, "q1", &mut noop()).await.unwrap();
        assert_eq!(p.turns().len(), 3);

        let first = p.turns()[0].id;
        let ticket = p.begin_edit(first, "fresh").unwrap();
        assert_eq!(p.turns().len(), 1);
        assert_eq!(p.turns()[0].content, "fresh");
        p.drive(&t, ticket, &mut noop()).await;

        let req = last_request(&scripted);
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].role, "system");
        assert_eq!(req.messages[1].content, "fresh");
        assert_eq!(p.turns().last().unwrap().content, "second");
    }

    #[tokio::test]
    async fn edit_rejections_leave_history() {
        let (_, t) = transport(vec![ScriptedTransport::fragments(&["data: {\"content\":\"a\"}\n"])]);
        let mut p = pipeline();
        p.send(&t, "q", &mut noop()).await.unwrap();
        let before = p.state().clone();

        let unknown = TurnId::generate();
        assert_eq!(
            p.begin_edit(unknown, "x").unwrap_err(),
            SendRejected::UnknownTurn(unknown)
        );
        let user = p.turns()[1].id;
        assert_eq!(p.begin_edit(user, "  ").unwrap_err(), SendRejected::EmptyInput);
        assert_eq!(p.state(), &before);
    }

    #[tokio::test]
    async fn edit_and_resubmit_inline() {
        let (_, t) = transport(vec![
            ScriptedTransport::fragments(&["data: {\"content\":\"a\"}\n"]),
            ScriptedTransport::fragments(&["data: {\"content\":\"b\"}\n"]),
        ]);
        let mut p = pipeline();
        p.send(&t, "q", &mut noop()).await.unwrap();
        let user = p.turns()[1].id;

        let end = p.edit_and_resubmit(&t, user, "q2", &mut noop()).await.unwrap();
        assert_eq!(end, TurnEnd::Completed);
        let contents: Vec<_> = p.turns().iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec![SEED_GREETING, "q2", "b"]);
    }

    #[tokio::test]
    async fn regenerate_resubmits_last_user_text() {
        let (scripted, t) = transport(vec![
            ScriptedTransport::fragments(&["data: {\"content\":\"one\"}\n"]),
            ScriptedTransport::fragments(&["data: {\"content\":\"two\"}\n"]),
        ]);
        let mut p = pipeline();
        p.send(&t, "pick a number", &mut noop()).await.unwrap();
        p.regenerate(&t, &mut noop()).await.unwrap();

        let contents: Vec<_> = p.turns().iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec![SEED_GREETING, "pick a number", "two"]);
        assert_eq!(
            last_request(&scripted).messages.last().unwrap().content,
            "pick a number"
        );
    }

    #[test]
    fn regenerate_without_user_turn() {
        let mut p = pipeline();
        assert_eq!(
            p.begin_regenerate().unwrap_err(),
            SendRejected::NothingToRegenerate
        );
    }

    #[tokio::test]
    async fn new_chat_resets_unless_generating() {
        let (_, t) = transport(vec![
            ScriptedTransport::fragments(&["data: {\"content\":\"a\"}\n"]),
        ]);
        let mut p = pipeline();
        p.update_system_prompt("be brief");
        p.send(&t, "q", &mut noop()).await.unwrap();

        let _ticket = p.begin("again").unwrap();
        assert!(!p.new_chat());
        assert_eq!(p.turns().len(), 4);

        p.apply(TurnUpdate::Finished(TurnEnd::Cancelled));
        assert!(p.new_chat());
        assert_eq!(p.turns().len(), 1);
        assert_eq!(p.turns()[0].content, SEED_GREETING);
        assert_eq!(p.system_prompt(), "be brief");
    }

    #[tokio::test]
    async fn gateway_error_becomes_error_turn() {
        let (_, t) = transport(vec![Script::OpenError(TransportError::HttpStatus(503))]);
        let mut p = pipeline();

        let end = p.send(&t, "hi", &mut noop()).await.unwrap();
        assert_eq!(end, TurnEnd::Failed(TransportError::HttpStatus(503)));
        let last = p.turns().last().unwrap();
        assert_eq!(last.role, Role::Error);
        assert_eq!(
            last.content,
            "AI service temporarily unavailable. Please try again in a moment."
        );
        assert!(!p.is_generating());
    }

    #[tokio::test]
    async fn mid_stream_failure_replaces_partial_text() {
        let (_, t) = transport(vec![Script::Items(vec![
            Ok("data: {\"content\":\"par\"}\n".into()),
            Err(TransportError::NetworkFailure("reset".into())),
        ])]);
        let mut p = pipeline();

        p.send(&t, "hi", &mut noop()).await.unwrap();
        let last = p.turns().last().unwrap();
        assert_eq!(last.role, Role::Error);
        assert_eq!(
            last.content,
            "Network connection failed. Please check the tunnel URL and try again."
        );
    }

    #[tokio::test]
    async fn malformed_records_are_ignored() {
        let (_, t) = transport(vec![ScriptedTransport::fragments(&[
            "data: {\"content\":\"a\"}\n",
            "data: {oops\n",
            "data: {\"content\":\"b\"}\n",
        ])]);
        let mut p = pipeline();
        let end = p.send(&t, "hi", &mut noop()).await.unwrap();
        assert_eq!(end, TurnEnd::Completed);
        assert_eq!(p.turns().last().unwrap().content, "ab");
    }

    #[tokio::test]
    async fn error_turns_are_not_sent_back() {
        let (scripted, t) = transport(vec![
            Script::OpenError(TransportError::Timeout),
            ScriptedTransport::fragments(&["data: {\"content\":\"ok\"}\n"]),
        ]);
        let mut p = pipeline();
        p.send(&t, "first", &mut noop()).await.unwrap();
        p.send(&t, "second", &mut noop()).await.unwrap();

        let req = last_request(&scripted);
        assert!(req.messages.iter().all(|m| m.role != "error"));
        let roles: Vec<_> = req.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "assistant", "user", "user"]);
    }

    #[test]
    fn rejects_busy_empty_and_disconnected() {
        let mut p = pipeline();
        assert_eq!(p.begin("   ").unwrap_err(), SendRejected::EmptyInput);

        let _ticket = p.begin("one").unwrap();
        assert_eq!(p.begin("two").unwrap_err(), SendRejected::Busy);

        let offline = Arc::new(ConnectionStatus::disconnected(DisconnectReason::Interstitial));
        let mut p = ChatPipeline::new(Arc::new(ClientConfig::default()), offline, None);
        assert_eq!(
            p.begin("hi").unwrap_err(),
            SendRejected::NotConnected("Click to bypass interstitial page".into())
        );
        assert_eq!(p.turns().len(), 1);
    }

    #[test]
    fn system_prompt_update_trims_and_defaults() {
        let mut p = pipeline();
        p.update_system_prompt("  terse  ");
        assert_eq!(p.system_prompt(), "terse");
        p.update_system_prompt("   ");
        assert_eq!(p.system_prompt(), ClientConfig::default().defaults.system_prompt);
    }

    #[tokio::test]
    async fn single_endpoint_sends_latest_message_only() {
        let (scripted, t) = transport(vec![ScriptedTransport::fragments(&["data: {\"content\":\"hey\"}\n"])]);
        let mut config = ClientConfig::default();
        config.api.dialect = Dialect::SingleEndpoint;
        let mut p = ChatPipeline::new(Arc::new(config), connected(), None);

        p.send(&t, " hello ", &mut noop()).await.unwrap();
        assert_eq!(
            scripted.requests.lock().last().cloned(),
            Some(TurnRequest::Endpoint(EndpointRequest::Chat { message: "hello".into() }))
        );
    }

    #[tokio::test]
    async fn conversation_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let config = Arc::new(ClientConfig::default());
        let (_, t) = transport(vec![ScriptedTransport::fragments(&["data: {\"content\":\"4\"}\n"])]);

        {
            let mut p = ChatPipeline::new(config.clone(), connected(), Some(ConversationStore::new(&path)));
            p.update_system_prompt("math only");
            p.send(&t, "2+2?", &mut noop()).await.unwrap();
        }

        let p = ChatPipeline::new(config, connected(), Some(ConversationStore::new(&path)));
        let contents: Vec<_> = p.turns().iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec![SEED_GREETING, "2+2?", "4"]);
        assert_eq!(p.system_prompt(), "math only");
    }

    #[tokio::test]
    async fn unwritable_store_does_not_block_turns() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes every save fail.
        let path = dir.path().join("blocked");
        std::fs::create_dir(&path).unwrap();
        let (_, t) = transport(vec![ScriptedTransport::fragments(&["data: {\"content\":\"ok\"}\n"])]);

        let mut p = ChatPipeline::new(
            Arc::new(ClientConfig::default()),
            connected(),
            Some(ConversationStore::new(&path)),
        );
        let end = p.send(&t, "hi", &mut noop()).await.unwrap();
        assert_eq!(end, TurnEnd::Completed);
        assert_eq!(p.turns().last().unwrap().content, "ok");
    }
}
