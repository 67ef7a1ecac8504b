//! Transport adapters for the chat stream.
//!
//! Two wire shapes are supported behind one [`Transport`] trait:
//!
//! - [`HttpStreamTransport`]: a POST whose response body is read incrementally
//!   and decoded as UTF-8 text chunks.
//! - [`WebSocketTransport`]: a message-oriented connection where each inbound
//!   text message is one fragment.
//!
//! Both produce a lazy [`FragmentStream`] and honor a `CancellationToken`:
//! once it fires, no further fragment is yielded, the stream yields
//! `Err(TransportError::Cancelled)` once, and the connection is dropped.
//! Adapters never retry.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use futures::SinkExt;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, CACHE_CONTROL, CONTENT_TYPE, USER_AGENT,
};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::config::{ApiConfig, TransportKind};
use crate::decoder::RECORD_MARKER;
use crate::error::{Result, TransportError};
use crate::types::TurnRequest;

/// Lazy sequence of raw text fragments.
pub type FragmentStream = BoxStream<'static, Result<String>>;

/// Opens one cancellable chat stream.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` and return the response as a fragment stream.
    ///
    /// # Errors
    ///
    /// Returns `Timeout`, `NetworkFailure` or `HttpStatus` if the stream could
    /// not be opened, or `Cancelled` if `cancel` fired first.
    async fn open(&self, request: &TurnRequest, cancel: CancellationToken) -> Result<FragmentStream>;
}

/// Build the transport selected by the config.
///
/// # Errors
///
/// Returns an error if the HTTP client cannot be created.
pub fn build_transport(api: &ApiConfig) -> Result<Arc<dyn Transport>> {
    Ok(match api.transport {
        TransportKind::HttpStream => Arc::new(HttpStreamTransport::new(api.clone())?),
        TransportKind::Websocket => Arc::new(WebSocketTransport::new(api.clone())),
    })
}

/// Headers from the config plus `Cache-Control: no-cache` and the user agent.
///
/// Entries that are not valid header names or values are skipped.
pub(crate) fn config_headers(api: &ApiConfig) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in &api.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::warn!(header = %name, "Skipping invalid configured header"),
        }
    }
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    if let Ok(agent) = HeaderValue::from_str(&api.user_agent) {
        headers.insert(USER_AGENT, agent);
    }
    headers
}

// =============================================================================
// Cancellation and UTF-8 Handling
// =============================================================================

/// Incremental UTF-8 decoder.
///
/// A multi-byte character split across chunks is held back until the rest
/// arrives; genuinely invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Decode a chunk, returning all complete characters.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(std::str::from_utf8(&self.pending[..valid]).unwrap_or_default());
                    if let Some(len) = e.error_len() {
                        out.push(char::REPLACEMENT_CHARACTER);
                        self.pending.drain(..valid + len);
                    } else {
                        self.pending.drain(..valid);
                        return out;
                    }
                }
            }
        }
    }

    /// Flush whatever is left at end of input.
    pub fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}

/// Turn a byte stream into a UTF-8 fragment stream.
fn text_fragments<S, B>(bytes: S) -> FragmentStream
where
    S: Stream<Item = Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let state = (bytes.boxed(), Utf8Decoder::default(), false);
    stream::unfold(state, |(mut bytes, mut decoder, done)| async move {
        if done {
            return None;
        }
        loop {
            match bytes.next().await {
                Some(Ok(chunk)) => {
                    let text = decoder.decode(chunk.as_ref());
                    if !text.is_empty() {
                        return Some((Ok(text), (bytes, decoder, false)));
                    }
                }
                Some(Err(e)) => return Some((Err(e), (bytes, decoder, true))),
                None => {
                    let tail = decoder.finish();
                    if tail.is_empty() {
                        return None;
                    }
                    return Some((Ok(tail), (bytes, decoder, true)));
                }
            }
        }
    })
    .boxed()
}

/// Wrap a fragment stream so it stops at cancellation.
///
/// The token is checked before every read; after it fires the inner stream
/// is dropped and `Err(Cancelled)` is yielded exactly once.
pub fn cancellable(fragments: FragmentStream, cancel: CancellationToken) -> FragmentStream {
    stream::unfold(Some((fragments, cancel)), |state| async move {
        let (mut fragments, cancel) = state?;
        tokio::select! {
            biased;
            () = cancel.cancelled() => Some((Err(TransportError::Cancelled), None)),
            next = fragments.next() => match next {
                Some(Ok(fragment)) => Some((Ok(fragment), Some((fragments, cancel)))),
                Some(Err(e)) => Some((Err(e), None)),
                None => None,
            }
        }
    })
    .boxed()
}

/// Await `fut` bounded by `timeout`, aborting early on cancellation.
async fn guarded<F, T>(
    fut: F,
    timeout: std::time::Duration,
    cancel: &CancellationToken,
) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(TransportError::Cancelled),
        result = tokio::time::timeout(timeout, fut) => result.map_err(|_| TransportError::Timeout)?,
    }
}

// =============================================================================
// HTTP Streaming Body
// =============================================================================

/// Streams the chat response body of a POST request.
#[derive(Debug, Clone)]
pub struct HttpStreamTransport {
    client: reqwest::Client,
    api: ApiConfig,
}

impl HttpStreamTransport {
    /// Create a transport for the given API settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(api: ApiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(api.timeout())
            .build()
            .map_err(|e| TransportError::Protocol(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client, api })
    }
}

#[async_trait]
impl Transport for HttpStreamTransport {
    async fn open(&self, request: &TurnRequest, cancel: CancellationToken) -> Result<FragmentStream> {
        let url = self.api.with_skip_param(&self.api.chat_url());
        let body = request
            .to_json()
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        tracing::debug!(url = %url, "Opening chat stream");

        let send = async {
            self.client
                .post(&url)
                .headers(config_headers(&self.api))
                .header(CONTENT_TYPE, "application/json")
                .body(body)
                .send()
                .await
                .map_err(TransportError::from)
        };

        // The timeout bounds the response headers only; the body may stream
        // for as long as the backend keeps generating.
        let response = guarded(send, self.api.timeout(), &cancel).await?;

        let status = response.status();
        if !status.is_success() {
            tracing::debug!(status = status.as_u16(), "Chat request rejected");
            return Err(TransportError::HttpStatus(status.as_u16()));
        }

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransportError::from));
        Ok(cancellable(text_fragments(bytes), cancel))
    }
}

// =============================================================================
// WebSocket Messages
// =============================================================================

/// Carries the chat over a WebSocket; each text message is one record.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    api: ApiConfig,
}

impl WebSocketTransport {
    /// Create a transport for the given API settings.
    #[must_use]
    pub const fn new(api: ApiConfig) -> Self {
        Self { api }
    }

    /// WebSocket form of the chat URL.
    #[must_use]
    pub fn ws_url(&self) -> String {
        to_ws_url(&self.api.with_skip_param(&self.api.chat_url()))
    }
}

/// Map an `http(s)://` URL to `ws(s)://`.
fn to_ws_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

/// Re-frame one message as a complete record line.
fn message_to_record(text: &str) -> String {
    let text = text.trim_end_matches('\n');
    if text.starts_with(RECORD_MARKER) {
        format!("{text}\n")
    } else {
        format!("{RECORD_MARKER} {text}\n")
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, request: &TurnRequest, cancel: CancellationToken) -> Result<FragmentStream> {
        let url = self.ws_url();
        let body = request
            .to_json()
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        let mut ws_request = url
            .as_str()
            .into_client_request()
            .map_err(TransportError::from)?;
        for (name, value) in &config_headers(&self.api) {
            ws_request.headers_mut().insert(name.clone(), value.clone());
        }

        tracing::debug!(url = %url, "Opening chat WebSocket");

        // Handshake and request share one timeout; a peer that accepts and
        // then stalls cannot hold `open` past it.
        let connect = async {
            let (ws_stream, _) = tokio_tungstenite::connect_async(ws_request).await?;
            let (mut write, read) = ws_stream.split();
            write.send(Message::Text(body)).await?;
            Ok::<_, TransportError>((write, read))
        };
        let (write, read) = guarded(connect, self.api.timeout(), &cancel).await?;

        // The sink rides along in the stream state so both halves are dropped
        // together when the stream ends or is cancelled.
        let messages = stream::unfold(Some((read, write)), |state| async move {
            let (mut read, write) = state?;
            loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        return Some((Ok(message_to_record(&text)), Some((read, write))));
                    }
                    Some(Ok(Message::Close(_))) | None => return None,
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_))) => {}
                    Some(Err(e)) => return Some((Err(TransportError::from(e)), None)),
                }
            }
        })
        .boxed();

        Ok(cancellable(messages, cancel))
    }
}

// =============================================================================
// Test Double
// =============================================================================

/// Scripted in-memory transport for pipeline tests.
#[cfg(test)]
pub(crate) mod scripted {
    use super::*;
    use parking_lot::Mutex;

    /// What the scripted transport does when opened.
    #[derive(Debug, Clone)]
    pub(crate) enum Script {
        /// Fail to open.
        OpenError(TransportError),
        /// Yield these items, then end.
        Items(Vec<Result<String>>),
        /// Yield these items, then never end (until cancelled).
        ItemsThenHang(Vec<Result<String>>),
    }

    pub(crate) struct ScriptedTransport {
        scripts: Mutex<std::collections::VecDeque<Script>>,
        pub(crate) requests: Mutex<Vec<TurnRequest>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new(scripts: Vec<Script>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn fragments(items: &[&str]) -> Script {
            Script::Items(items.iter().map(|s| Ok((*s).to_string())).collect())
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn open(
            &self,
            request: &TurnRequest,
            cancel: CancellationToken,
        ) -> Result<FragmentStream> {
            self.requests.lock().push(request.clone());
            let script = self
                .scripts
                .lock()
                .pop_front()
                .unwrap_or(Script::Items(Vec::new()));
            let inner = match script {
                Script::OpenError(e) => return Err(e),
                Script::Items(items) => stream::iter(items).boxed(),
                Script::ItemsThenHang(items) => stream::iter(items).chain(stream::pending()).boxed(),
            };
            Ok(cancellable(inner, cancel))
        }
    }

    /// Accept one WebSocket connection on a local port and hand it to
    /// `serve`. Returns API settings pointing at it.
    pub(crate) async fn ws_backend<F, Fut>(serve: F) -> ApiConfig
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            serve(ws).await;
        });
        ApiConfig {
            base_url: format!("http://{addr}"),
            timeout_ms: 2_000,
            transport: TransportKind::Websocket,
            ..ApiConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::scripted::ws_backend;
    use super::*;
    use crate::types::{ChatRequest, WireMessage};
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn chat_request() -> TurnRequest {
        TurnRequest::Chat(ChatRequest {
            messages: vec![WireMessage { role: "user".into(), content: "2+2?".into() }],
            max_tokens: 32,
            temperature: 0.7,
        })
    }

    fn api_for(server: &MockServer) -> ApiConfig {
        ApiConfig {
            base_url: server.uri(),
            timeout_ms: 500,
            ..ApiConfig::default()
        }
    }

    #[test]
    fn utf8_decoder_holds_split_characters() {
        let bytes = "é✓".as_bytes();
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(&bytes[..1]), "");
        assert_eq!(decoder.decode(&bytes[1..3]), "é");
        assert_eq!(decoder.decode(&bytes[3..]), "✓");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn utf8_decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(&[b'a', 0xFF, b'b']), "a\u{FFFD}b");
    }

    #[test]
    fn ws_url_mapping() {
        assert_eq!(to_ws_url("https://x.io/api/chat"), "wss://x.io/api/chat");
        assert_eq!(to_ws_url("http://localhost:3000/api"), "ws://localhost:3000/api");
    }

    #[test]
    fn messages_become_record_lines() {
        assert_eq!(message_to_record("{\"content\":\"a\"}"), "data: {\"content\":\"a\"}\n");
        assert_eq!(message_to_record("data: [DONE]"), "data: [DONE]\n");
    }

    #[test]
    fn invalid_configured_headers_are_skipped() {
        let mut api = ApiConfig::default();
        api.headers.insert("X-Ok".into(), "yes".into());
        api.headers.insert("bad header".into(), "x".into());
        let headers = config_headers(&api);
        assert_eq!(headers.get("x-ok").unwrap(), "yes");
        assert_eq!(headers.get(CACHE_CONTROL).unwrap(), "no-cache");
        assert!(headers.get(USER_AGENT).unwrap().to_str().unwrap().starts_with("streamchat/"));
        assert_eq!(headers.len(), 3);
    }

    #[tokio::test]
    async fn cancellable_stops_before_next_fragment() {
        let cancel = CancellationToken::new();
        let inner = stream::iter(vec![Ok("a".to_string()), Ok("b".to_string())]).boxed();
        let mut wrapped = cancellable(inner, cancel.clone());

        assert_eq!(wrapped.next().await, Some(Ok("a".to_string())));
        cancel.cancel();
        assert_eq!(wrapped.next().await, Some(Err(TransportError::Cancelled)));
        assert_eq!(wrapped.next().await, None);
    }

    #[tokio::test]
    async fn http_stream_yields_body_text() {
        let server = MockServer::start().await;
        let body = "data: {\"content\":\"4\"}\n\ndata: [DONE]\n";
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(query_param("skip_zrok_interstitial", "true"))
            .and(header("cache-control", "no-cache"))
            .and(body_partial_json(serde_json::json!({"max_tokens": 32})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let transport = HttpStreamTransport::new(api_for(&server)).unwrap();
        let stream = transport
            .open(&chat_request(), CancellationToken::new())
            .await
            .unwrap();
        let text: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(text.concat(), body);
    }

    #[tokio::test]
    async fn http_status_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let transport = HttpStreamTransport::new(api_for(&server)).unwrap();
        let err = transport
            .open(&chat_request(), CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert_eq!(err, TransportError::HttpStatus(503));
    }

    #[tokio::test]
    async fn slow_headers_time_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_delay(std::time::Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let transport = HttpStreamTransport::new(api_for(&server)).unwrap();
        let err = transport
            .open(&chat_request(), CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert_eq!(err, TransportError::Timeout);
    }

    #[tokio::test]
    async fn cancel_before_response_aborts_open() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_delay(std::time::Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let transport = HttpStreamTransport::new(api_for(&server)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = transport.open(&chat_request(), cancel).await.err().unwrap();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn unreachable_host_is_network_failure() {
        let api = ApiConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            timeout_ms: 2_000,
            ..ApiConfig::default()
        };
        let transport = HttpStreamTransport::new(api).unwrap();
        let err = transport
            .open(&chat_request(), CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::NetworkFailure(_)), "got {err:?}");
    }

    const RECORD_A: &str = "data: {\"content\":\"a\"}\n";

    /// Local port that accepts TCP but never answers the handshake.
    async fn stalled_backend(timeout_ms: u64) -> ApiConfig {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_tcp, _) = listener.accept().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(10)).await;
        });
        ApiConfig {
            base_url: format!("http://{addr}"),
            timeout_ms,
            transport: TransportKind::Websocket,
            ..ApiConfig::default()
        }
    }

    #[tokio::test]
    async fn websocket_sends_request_and_frames_messages() {
        let (request_tx, request_rx) = tokio::sync::oneshot::channel();
        let api = ws_backend(move |mut ws| async move {
            if let Some(Ok(Message::Text(request))) = ws.next().await {
                let _ = request_tx.send(request);
            }
            ws.send(Message::Text("{\"content\":\"a\"}".into())).await.unwrap();
            ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
            ws.send(Message::Text("data: [DONE]".into())).await.unwrap();
            ws.close(None).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let transport = WebSocketTransport::new(api);
        let stream = transport
            .open(&chat_request(), CancellationToken::new())
            .await
            .unwrap();
        let fragments: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(fragments, vec![RECORD_A.to_string(), "data: [DONE]\n".to_string()]);

        let request: serde_json::Value = serde_json::from_str(&request_rx.await.unwrap()).unwrap();
        assert_eq!(request["messages"][0]["content"], "2+2?");
        assert_eq!(request["max_tokens"], 32);
    }

    #[tokio::test]
    async fn websocket_cancel_ends_stream() {
        let api = ws_backend(|mut ws| async move {
            let _ = ws.next().await;
            ws.send(Message::Text("{\"content\":\"a\"}".into())).await.unwrap();
            ws.send(Message::Text("{\"content\":\"b\"}".into())).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let transport = WebSocketTransport::new(api);
        let cancel = CancellationToken::new();
        let mut stream = transport.open(&chat_request(), cancel.clone()).await.unwrap();
        assert_eq!(stream.next().await, Some(Ok(RECORD_A.to_string())));
        assert_eq!(
            stream.next().await,
            Some(Ok("data: {\"content\":\"b\"}\n".to_string()))
        );

        cancel.cancel();
        assert_eq!(stream.next().await, Some(Err(TransportError::Cancelled)));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn websocket_stalled_peer_times_out() {
        let transport = WebSocketTransport::new(stalled_backend(200).await);
        let err = transport
            .open(&chat_request(), CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert_eq!(err, TransportError::Timeout);
    }

    #[tokio::test]
    async fn websocket_stalled_peer_is_cancellable() {
        let transport = WebSocketTransport::new(stalled_backend(5_000).await);
        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                cancel.cancel();
            });
        }
        let err = transport.open(&chat_request(), cancel).await.err().unwrap();
        assert!(err.is_cancelled(), "got {err:?}");
    }
}
