use crate::config::{CONNECT_TIMEOUT, RECONNECT_DELAY};
use crate::error::{GatewayError, Result};
use crate::protocol::{parse_event, WS_HANDSHAKE, WS_PATH, WS_SUBPROTOCOL};
use crate::subscription::{ListenerSet, UnitReceiver, UnitStatusListener};
use crate::types::UnitData;
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

const UPDATE_CHANNEL_CAPACITY: usize = 100;

/// Lifecycle of the event socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal: set by [`EventStream::dispose`]
    ShuttingDown,
}

/// Everything the socket can tell the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Opened,
    Message(String),
    Closed { code: Option<u16>, reason: String },
    Error(String),
}

/// Timing knobs for the event stream
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Fixed delay before reopening a dropped socket. Default: 20s.
    pub reconnect_delay: Duration,

    /// Upper bound on opening the socket. Default: 10s.
    pub connect_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: RECONNECT_DELAY,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

struct StreamState {
    connection: ConnectionState,
    /// Set while a reconnect timer is scheduled and has not fired yet
    reconnect_pending: bool,
    reconnect_task: Option<JoinHandle<()>>,
    /// Outgoing frames for the live socket's writer task
    ws_tx: Option<mpsc::UnboundedSender<Message>>,
    /// Bumped for every opened socket so events from an old one are dropped
    generation: u64,
}

struct Inner {
    url: String,
    config: StreamConfig,
    listeners: ListenerSet,
    update_tx: broadcast::Sender<UnitData>,
    state: Mutex<StreamState>,
    cancel: CancellationToken,
}

/// Persistent event socket to a controller
///
/// Receives `UNIT_CHANGED` notifications, parses them and fans them out to
/// registered listeners. A socket that drops after being established is
/// reopened after a fixed delay until [`dispose`](Self::dispose) is called.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use touchwand::{EventStream, UnitData, UnitStatusListener};
///
/// struct Printer;
///
/// impl UnitStatusListener for Printer {
///     fn on_data_received(&self, unit: &UnitData) {
///         println!("{} changed: {:?}", unit.name, unit.curr_status);
///     }
/// }
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let stream = EventStream::new("192.168.1.20");
///     stream.register_listener(Arc::new(Printer));
///     stream.connect().await?;
///
///     tokio::time::sleep(std::time::Duration::from_secs(60)).await;
///     stream.dispose();
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct EventStream {
    inner: Arc<Inner>,
}

impl EventStream {
    /// Event stream for the controller at `host` (optionally `host:port`)
    pub fn new(host: &str) -> Self {
        Self::with_config(host, StreamConfig::default())
    }

    pub fn with_config(host: &str, config: StreamConfig) -> Self {
        let (update_tx, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                url: format!("ws://{}{}", host, WS_PATH),
                config,
                listeners: ListenerSet::new(),
                update_tx,
                state: Mutex::new(StreamState {
                    connection: ConnectionState::Disconnected,
                    reconnect_pending: false,
                    reconnect_task: None,
                    ws_tx: None,
                    generation: 0,
                }),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Socket URL this stream connects to
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn state(&self) -> ConnectionState {
        self.lock_state().connection
    }

    /// Whether a reconnect timer is scheduled and has not fired yet
    pub fn is_reconnect_pending(&self) -> bool {
        self.lock_state().reconnect_pending
    }

    /// Add a listener; adding one that is already registered does nothing
    pub fn register_listener(&self, listener: Arc<dyn UnitStatusListener>) -> bool {
        self.inner.listeners.register(listener)
    }

    /// Remove a listener; removing one that is not registered does nothing
    pub fn unregister_listener(&self, listener: &Arc<dyn UnitStatusListener>) -> bool {
        self.inner.listeners.unregister(listener)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Subscribe to unit updates as an async stream
    pub fn subscribe(&self) -> UnitReceiver {
        UnitReceiver::new(self.inner.update_tx.subscribe())
    }

    /// Open the socket and send the handshake.
    ///
    /// A failure here is logged and leaves the stream disconnected without
    /// scheduling a retry: only a socket that was established and then lost
    /// is reopened automatically.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.lock_state();
            match state.connection {
                ConnectionState::ShuttingDown => return Err(GatewayError::ConnectionClosed),
                ConnectionState::Connecting => return Ok(()),
                ConnectionState::Connected if state.ws_tx.is_some() => return Ok(()),
                ConnectionState::Connected | ConnectionState::Disconnected => {
                    state.connection = ConnectionState::Connecting
                }
            }
        }

        tracing::info!("Connecting to {}", self.inner.url);
        match self.open().await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!("Could not connect webSocket {} : {}", self.inner.url, e);
                let mut state = self.lock_state();
                if state.connection == ConnectionState::Connecting {
                    state.connection = ConnectionState::Disconnected;
                }
                Err(e)
            }
        }
    }

    /// Shut the stream down for good.
    ///
    /// Cancels a pending reconnect, closes the socket and latches the
    /// `ShuttingDown` state so no later close or error reopens it. Safe to
    /// call from any thread, any number of times; never waits on in-flight
    /// callbacks.
    pub fn dispose(&self) {
        let ws_tx = {
            let mut state = self.lock_state();
            if state.connection == ConnectionState::ShuttingDown {
                return;
            }
            state.connection = ConnectionState::ShuttingDown;
            state.reconnect_pending = false;
            if let Some(task) = state.reconnect_task.take() {
                task.abort();
            }
            state.ws_tx.take()
        };

        if let Some(tx) = ws_tx {
            let _ = tx.send(Message::Close(None));
        }
        self.inner.cancel.cancel();
        tracing::info!("Event stream to {} disposed", self.inner.url);
    }

    /// Feed one socket event through the state machine.
    ///
    /// The socket tasks call this for everything they observe; it is public
    /// so hosts with their own transport can drive the stream directly.
    pub fn handle_event(&self, event: SocketEvent) {
        match event {
            SocketEvent::Opened => {
                let mut state = self.lock_state();
                // Only completes a connect in progress; a socket that already
                // dropped must not be marked live again.
                if state.connection != ConnectionState::Connecting {
                    tracing::debug!("Ignoring open for {} in state {:?}", self.inner.url, state.connection);
                    return;
                }
                state.connection = ConnectionState::Connected;
                if let Some(tx) = &state.ws_tx {
                    if tx.send(Message::Text(WS_HANDSHAKE.to_string())).is_err() {
                        tracing::warn!("Failed to queue handshake for {}", self.inner.url);
                    }
                }
                tracing::info!("Event stream connected to {}", self.inner.url);
            }
            SocketEvent::Message(text) => self.on_message(&text),
            SocketEvent::Closed { code, reason } => {
                tracing::debug!("Connection closed: {:?} - {}", code, reason);
                self.on_disconnect();
            }
            SocketEvent::Error(cause) => {
                tracing::warn!("WebSocket error: {}", cause);
                self.on_disconnect();
            }
        }
    }

    fn on_message(&self, text: &str) {
        if self.state() == ConnectionState::ShuttingDown {
            return;
        }

        match parse_event(text) {
            Ok(Some(unit)) => {
                tracing::debug!(
                    unit_id = %unit.id,
                    "UNIT_CHANGED: name {} status {:?}",
                    unit.name,
                    unit.curr_status
                );
                self.inner.listeners.dispatch(&unit);
                let _ = self.inner.update_tx.send(unit);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Dropping unparseable event: {}", e);
            }
        }
    }

    fn on_disconnect(&self) {
        {
            let mut state = self.lock_state();
            if state.connection == ConnectionState::ShuttingDown {
                return;
            }
            state.connection = ConnectionState::Disconnected;
            state.ws_tx = None;
        }
        tracing::debug!("Event stream lost - reconnecting");
        self.schedule_reconnect();
    }

    /// Schedule one reconnect attempt after the fixed delay.
    ///
    /// Returns `false` when a timer is already pending or the stream is
    /// shutting down.
    fn schedule_reconnect(&self) -> bool {
        let mut state = self.lock_state();
        if state.connection == ConnectionState::ShuttingDown || state.reconnect_pending {
            return false;
        }
        state.reconnect_pending = true;

        let stream = self.clone();
        let delay = self.inner.config.reconnect_delay;
        let cancel = self.inner.cancel.clone();
        tracing::info!("Reconnecting to {} in {:?}", self.inner.url, delay);

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(delay) => {}
            }

            {
                let mut state = stream.lock_state();
                state.reconnect_pending = false;
                state.reconnect_task = None;
                if state.connection == ConnectionState::ShuttingDown {
                    return;
                }
            }

            // A failed attempt keeps recovering the dropped connection.
            if stream.connect().await.is_err() {
                stream.schedule_reconnect();
            }
        });
        state.reconnect_task = Some(handle);
        true
    }

    async fn open(&self) -> Result<()> {
        let mut request = self.inner.url.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(WS_SUBPROTOCOL));

        let cancel = self.inner.cancel.clone();
        let (ws_stream, _) = tokio::select! {
            _ = cancel.cancelled() => return Err(GatewayError::ConnectionClosed),
            result = timeout(self.inner.config.connect_timeout, connect_async(request)) => {
                result.map_err(|_| GatewayError::Timeout)??
            }
        };
        let (mut write, mut read) = ws_stream.split();
        let (ws_tx, mut ws_rx) = mpsc::unbounded_channel::<Message>();

        let generation = {
            let mut state = self.lock_state();
            if state.connection == ConnectionState::ShuttingDown {
                return Err(GatewayError::ConnectionClosed);
            }
            state.ws_tx = Some(ws_tx);
            state.generation += 1;
            state.generation
        };

        // Mark the stream live and queue the handshake before the reader can
        // report a close for this socket.
        self.handle_event(SocketEvent::Opened);

        // Forward outgoing frames to the socket
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    msg = ws_rx.recv() => {
                        let Some(msg) = msg else { break };
                        let closing = matches!(msg, Message::Close(_));
                        if let Err(e) = write.send(msg).await {
                            tracing::error!("Failed to send message: {}", e);
                            break;
                        }
                        if closing {
                            break;
                        }
                    }
                    _ = writer_cancel.cancelled() => {
                        let _ = write.close().await;
                        break;
                    }
                }
            }
        });

        // Receive frames and translate them into socket events
        let stream = self.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = read.next() => msg,
                };

                match msg {
                    Some(Ok(Message::Text(text))) => {
                        stream.handle_socket_event(generation, SocketEvent::Message(text))
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = match frame {
                            Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                            None => (None, String::new()),
                        };
                        stream.handle_socket_event(generation, SocketEvent::Closed { code, reason });
                        break;
                    }
                    Some(Err(e)) => {
                        stream.handle_socket_event(generation, SocketEvent::Error(e.to_string()));
                        break;
                    }
                    None => {
                        stream.handle_socket_event(generation, SocketEvent::Closed {
                            code: None,
                            reason: "stream ended".to_string(),
                        });
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        });

        Ok(())
    }

    /// Feed an event from the socket opened as `generation`; events from a
    /// socket that has since been replaced are dropped.
    fn handle_socket_event(&self, generation: u64, event: SocketEvent) {
        if self.lock_state().generation != generation {
            tracing::debug!("Dropping event from a replaced socket to {}", self.inner.url);
            return;
        }
        self.handle_event(event);
    }

    fn lock_state(&self) -> MutexGuard<'_, StreamState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        ids: Mutex<Vec<(String, String)>>,
    }

    impl UnitStatusListener for Counter {
        fn on_data_received(&self, unit: &UnitData) {
            self.ids.lock().unwrap().push((unit.id.clone(), unit.name.clone()));
        }
    }

    const LAMP_EVENT: &str =
        r#"{"type":"UNIT_CHANGED","unit":{"status":"ALIVE","type":"Switch", "id":"7","name":"Lamp"}}"#;

    fn stream() -> EventStream {
        EventStream::with_config(
            "127.0.0.1:9",
            StreamConfig {
                reconnect_delay: Duration::from_secs(20),
                connect_timeout: Duration::from_millis(200),
            },
        )
    }

    #[test]
    fn url_targets_async_endpoint() {
        assert_eq!(EventStream::new("10.0.0.5").url(), "ws://10.0.0.5/async");
    }

    #[tokio::test]
    async fn alive_unit_changed_reaches_listener_once() {
        let stream = stream();
        let counter = Arc::new(Counter::default());
        let listener: Arc<dyn UnitStatusListener> = counter.clone();
        stream.register_listener(listener.clone());
        stream.register_listener(listener);

        stream.handle_event(SocketEvent::Message(LAMP_EVENT.to_string()));

        let ids = counter.ids.lock().unwrap();
        assert_eq!(*ids, vec![("7".to_string(), "Lamp".to_string())]);
    }

    #[tokio::test]
    async fn offline_unit_is_not_dispatched() {
        let stream = stream();
        let counter = Arc::new(Counter::default());
        stream.register_listener(counter.clone());

        stream.handle_event(SocketEvent::Message(LAMP_EVENT.replace("ALIVE", "OFFLINE")));
        assert!(counter.ids.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_messages_are_dropped_without_side_effects() {
        let stream = stream();
        let counter = Arc::new(Counter::default());
        stream.register_listener(counter.clone());

        for bad in ["", "{", "[]", r#"{"type":5}"#, r#"{"type":"UNIT_CHANGED","unit":[]}"#] {
            stream.handle_event(SocketEvent::Message(bad.to_string()));
        }
        assert_eq!(stream.listener_count(), 1);
        assert!(counter.ids.lock().unwrap().is_empty());

        stream.handle_event(SocketEvent::Message(LAMP_EVENT.to_string()));
        assert_eq!(counter.ids.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn subscribers_receive_updates() {
        let stream = stream();
        let mut rx = stream.subscribe();
        stream.handle_event(SocketEvent::Message(LAMP_EVENT.to_string()));
        assert_eq!(rx.try_recv().unwrap().unwrap().id, "7");
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_close_and_error_schedule_one_reconnect() {
        let stream = stream();
        stream.handle_event(SocketEvent::Closed { code: Some(1006), reason: String::new() });
        assert!(stream.is_reconnect_pending());
        assert!(!stream.schedule_reconnect());

        stream.handle_event(SocketEvent::Error("reset".to_string()));
        assert!(stream.is_reconnect_pending());
        assert_eq!(stream.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_suppresses_reconnects() {
        let stream = stream();
        stream.handle_event(SocketEvent::Closed { code: None, reason: String::new() });
        assert!(stream.is_reconnect_pending());

        stream.dispose();
        stream.dispose();
        assert_eq!(stream.state(), ConnectionState::ShuttingDown);
        assert!(!stream.is_reconnect_pending());

        stream.handle_event(SocketEvent::Closed { code: None, reason: String::new() });
        stream.handle_event(SocketEvent::Error("late".to_string()));
        assert!(!stream.is_reconnect_pending());
        assert!(matches!(stream.connect().await, Err(GatewayError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn messages_after_dispose_are_ignored() {
        let stream = stream();
        let counter = Arc::new(Counter::default());
        stream.register_listener(counter.clone());
        stream.dispose();
        stream.handle_event(SocketEvent::Message(LAMP_EVENT.to_string()));
        assert!(counter.ids.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn close_seen_before_open_leaves_stream_reconnecting() {
        let stream = stream();
        stream.lock_state().connection = ConnectionState::Connecting;

        stream.handle_event(SocketEvent::Closed { code: Some(1000), reason: String::new() });
        stream.handle_event(SocketEvent::Opened);

        assert_eq!(stream.state(), ConnectionState::Disconnected);
        assert!(stream.is_reconnect_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn events_from_a_replaced_socket_are_dropped() {
        let stream = stream();
        {
            let mut state = stream.lock_state();
            state.connection = ConnectionState::Connected;
            state.generation = 2;
        }

        stream.handle_socket_event(1, SocketEvent::Error("old socket".to_string()));
        assert_eq!(stream.state(), ConnectionState::Connected);
        assert!(!stream.is_reconnect_pending());

        stream.handle_socket_event(2, SocketEvent::Error("reset".to_string()));
        assert_eq!(stream.state(), ConnectionState::Disconnected);
        assert!(stream.is_reconnect_pending());
    }

    #[tokio::test]
    async fn failed_first_connect_does_not_retry() {
        let stream = EventStream::new("bad host");
        assert!(stream.connect().await.is_err());
        assert_eq!(stream.state(), ConnectionState::Disconnected);
        assert!(!stream.is_reconnect_pending());
    }
}
