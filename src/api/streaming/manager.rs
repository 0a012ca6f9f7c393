use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::api::base::{KisError, Result};
use crate::api::exchange::ExchangeResolver;
use crate::api::quote::{Market, Quote, QuoteSource};
use crate::api::token::{CredentialKind, TokenManager};
use crate::client::KisClient;
use crate::config::WS_URL;

use super::frame::{parse_frame, StreamFrame, Tick, TR_DOMESTIC_TICK, TR_OVERSEAS_TICK};

const TR_TYPE_SUBSCRIBE: &str = "1";
const TR_TYPE_UNSUBSCRIBE: &str = "2";

/// Buffered ticks per fan-out consumer before a slow consumer starts lagging.
const TICK_CHANNEL_CAPACITY: usize = 256;

/// Connection lifecycle of the streaming endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Configuration for the streaming connection.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub ws_url: String,
    /// Fixed delay between reconnect attempts. The upstream connection is
    /// expected to be long-lived, so there is no backoff ceiling.
    pub reconnect_delay: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ws_url: WS_URL.to_string(),
            reconnect_delay: Duration::from_secs(3),
        }
    }
}

/// Identity of one realtime subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub market: Market,
    pub symbol: String,
}

impl SubscriptionKey {
    fn new(symbol: &str, market: Market) -> Self {
        let symbol = match market {
            Market::Kr => symbol.to_string(),
            Market::Us => symbol.to_uppercase(),
        };
        Self { market, symbol }
    }

    fn tr_id(&self) -> &'static str {
        match self.market {
            Market::Kr => TR_DOMESTIC_TICK,
            Market::Us => TR_OVERSEAS_TICK,
        }
    }

    fn tr_key(&self, resolver: &dyn ExchangeResolver) -> String {
        match self.market {
            Market::Kr => self.symbol.clone(),
            Market::Us => format!(
                "{}{}",
                resolver.resolve(&self.symbol).stream_prefix(),
                self.symbol
            ),
        }
    }
}

#[derive(Serialize)]
struct ControlRequest<'a> {
    header: ControlRequestHeader<'a>,
    body: ControlRequestBody<'a>,
}

#[derive(Serialize)]
struct ControlRequestHeader<'a> {
    approval_key: &'a str,
    custtype: &'a str,
    tr_type: &'a str,
    #[serde(rename = "content-type")]
    content_type: &'a str,
}

#[derive(Serialize)]
struct ControlRequestBody<'a> {
    input: ControlRequestInput<'a>,
}

#[derive(Serialize)]
struct ControlRequestInput<'a> {
    tr_id: &'a str,
    tr_key: &'a str,
}

fn control_frame(
    approval_key: &str,
    tr_type: &str,
    tr_id: &str,
    tr_key: &str,
) -> serde_json::Result<String> {
    serde_json::to_string(&ControlRequest {
        header: ControlRequestHeader {
            approval_key,
            custtype: "P",
            tr_type,
            content_type: "utf-8",
        },
        body: ControlRequestBody {
            input: ControlRequestInput { tr_id, tr_key },
        },
    })
}

/// Caller intent plus the per-connection send state. Desired-set mutation and
/// the matching control-frame send happen under this one lock, so concurrent
/// acquire/release calls cannot interleave between them.
struct DesiredState {
    refs: HashMap<SubscriptionKey, usize>,
    /// tr_keys the current connection has confirmed. Cleared on disconnect
    /// and rebuilt from `refs` after every reconnect.
    acked: HashSet<String>,
    outbound: Option<flume::Sender<Message>>,
    approval_key: Option<String>,
}

impl DesiredState {
    fn send_control(&mut self, resolver: &dyn ExchangeResolver, key: &SubscriptionKey, tr_type: &str) {
        let (Some(out), Some(approval)) = (&self.outbound, &self.approval_key) else {
            // Not connected; intent is realized at the next reconciliation.
            return;
        };

        let tr_key = key.tr_key(resolver);
        match control_frame(approval, tr_type, key.tr_id(), &tr_key) {
            Ok(text) => {
                let verb = if tr_type == TR_TYPE_SUBSCRIBE {
                    "subscribe"
                } else {
                    "unsubscribe"
                };
                debug!(market = %key.market, tr_key = %tr_key, "{}", verb);
                let _ = out.send(Message::Text(text));
            }
            Err(e) => warn!(error = %e, "failed to serialize control frame"),
        }
        if tr_type == TR_TYPE_UNSUBSCRIBE {
            self.acked.remove(&tr_key);
        }
    }
}

struct Shared {
    config: StreamConfig,
    tokens: Arc<TokenManager>,
    resolver: Arc<dyn ExchangeResolver>,
    desired: Mutex<DesiredState>,
    latest: RwLock<HashMap<String, Quote>>,
    ticks: broadcast::Sender<Tick>,
    status_tx: watch::Sender<StreamStatus>,
    status_rx: watch::Receiver<StreamStatus>,
    shutdown: AtomicBool,
}

impl Shared {
    fn set_status(&self, status: StreamStatus) {
        self.status_tx.send_replace(status);
    }

    fn lock_desired(&self) -> std::sync::MutexGuard<'_, DesiredState> {
        self.desired.lock().expect("subscription state poisoned")
    }

    /// Decode and dispatch one inbound text frame. Malformed frames are
    /// logged and dropped; one bad frame must not interrupt the stream.
    fn handle_text(&self, raw: &str, out: &flume::Sender<Message>) {
        match parse_frame(raw) {
            Ok(StreamFrame::Tick(tick)) => {
                debug!(symbol = %tick.symbol, price = tick.price, "tick");
                let quote = Quote {
                    symbol: tick.symbol.clone(),
                    market: tick.market,
                    price: tick.price,
                    change: tick.change,
                    change_percent: tick.change_percent,
                    observed_at: Utc::now(),
                    source: QuoteSource::Stream,
                };
                self.latest
                    .write()
                    .expect("latest-tick map poisoned")
                    .insert(tick.symbol.clone(), quote);
                let _ = self.ticks.send(tick);
            }
            Ok(StreamFrame::Control(msg)) => {
                if msg.is_ping() {
                    // The endpoint expects the probe echoed back verbatim.
                    let _ = out.send(Message::Text(raw.to_string()));
                    return;
                }
                let confirmed = msg
                    .body
                    .as_ref()
                    .and_then(|b| b.rt_cd.as_deref())
                    .map(|code| code == "0")
                    .unwrap_or(false);
                if let (true, Some(tr_key)) = (confirmed, msg.header.tr_key.as_deref()) {
                    self.lock_desired().acked.insert(tr_key.to_string());
                }
                debug!(
                    tr_id = %msg.header.tr_id,
                    tr_key = msg.header.tr_key.as_deref().unwrap_or(""),
                    msg = msg
                        .body
                        .as_ref()
                        .and_then(|b| b.msg1.as_deref())
                        .unwrap_or(""),
                    "stream ack"
                );
            }
            Ok(StreamFrame::Unrecognized) => {
                debug!("ignoring frame for unconsumed tr_id");
            }
            Err(e) => warn!(error = %e, "dropping malformed frame"),
        }
    }
}

/// Owns the one multiplexed streaming connection.
///
/// A background task keeps the connection alive: `Disconnected → Connecting →
/// Connected`, reconnecting on a fixed delay after any close or error. On
/// every `Connected` transition the desired-subscription set is replayed,
/// which reconciles acknowledged state after any gap — including the very
/// first connection.
pub struct StreamManager {
    shared: Arc<Shared>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StreamManager {
    /// Spawn the connection task and return the manager.
    pub fn start(
        tokens: Arc<TokenManager>,
        resolver: Arc<dyn ExchangeResolver>,
        config: StreamConfig,
    ) -> Self {
        let (status_tx, status_rx) = watch::channel(StreamStatus::Disconnected);
        let (ticks, _) = broadcast::channel(TICK_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            config,
            tokens,
            resolver,
            desired: Mutex::new(DesiredState {
                refs: HashMap::new(),
                acked: HashSet::new(),
                outbound: None,
                approval_key: None,
            }),
            latest: RwLock::new(HashMap::new()),
            ticks,
            status_tx,
            status_rx,
            shutdown: AtomicBool::new(false),
        });

        let task = tokio::spawn(connection_manager(shared.clone()));

        Self {
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    /// Register interest in a symbol. The desired set is mutated immediately
    /// (so intent survives disconnects); a subscribe frame is sent only when
    /// currently connected and this is the first reference. Dropping the
    /// returned handle releases the reference.
    pub fn acquire(&self, symbol: &str, market: Market) -> SubscriptionHandle {
        let key = SubscriptionKey::new(symbol, market);
        {
            let mut desired = self.shared.lock_desired();
            let count = desired.refs.entry(key.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                desired.send_control(self.shared.resolver.as_ref(), &key, TR_TYPE_SUBSCRIBE);
            }
        }
        SubscriptionHandle {
            shared: self.shared.clone(),
            key,
        }
    }

    pub fn status(&self) -> StreamStatus {
        *self.shared.status_rx.borrow()
    }

    /// Observe status transitions; useful for health surfaces and tests.
    pub fn status_watch(&self) -> watch::Receiver<StreamStatus> {
        self.shared.status_rx.clone()
    }

    /// Fan-out receiver for decoded ticks. Every receiver sees every tick
    /// published after it subscribed.
    pub fn subscribe_ticks(&self) -> broadcast::Receiver<Tick> {
        self.shared.ticks.subscribe()
    }

    /// The freshest stream quote for a symbol, if any tick has arrived. No
    /// age cutoff: a stale tick just means no recent market activity.
    pub fn latest(&self, symbol: &str) -> Option<Quote> {
        self.shared
            .latest
            .read()
            .expect("latest-tick map poisoned")
            .get(symbol)
            .cloned()
    }

    /// Snapshot of the desired set (caller intent).
    pub fn desired_subscriptions(&self) -> Vec<SubscriptionKey> {
        self.shared.lock_desired().refs.keys().cloned().collect()
    }

    /// Snapshot of the tr_keys the live connection has confirmed.
    pub fn acknowledged_subscriptions(&self) -> HashSet<String> {
        self.shared.lock_desired().acked.clone()
    }

    /// Tear the connection down for process shutdown.
    pub fn close(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        if let Some(task) = self
            .task
            .lock()
            .expect("stream task handle poisoned")
            .take()
        {
            task.abort();
        }
        self.shared.set_status(StreamStatus::Disconnected);
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        self.close();
    }
}

/// A reference-counted claim on one realtime subscription. Dropping the last
/// handle for a key removes it from the desired set and, when connected,
/// sends the unsubscribe frame.
pub struct SubscriptionHandle {
    shared: Arc<Shared>,
    key: SubscriptionKey,
}

impl SubscriptionHandle {
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Explicit release; equivalent to dropping the handle.
    pub fn release(self) {}
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        let mut desired = self.shared.lock_desired();
        if let Some(count) = desired.refs.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                desired.refs.remove(&self.key);
                desired.send_control(
                    self.shared.resolver.as_ref(),
                    &self.key,
                    TR_TYPE_UNSUBSCRIBE,
                );
            }
        }
    }
}

/// Connection lifecycle loop: obtain a streaming credential, connect, replay
/// the desired set, pump frames until the connection drops, then retry after
/// the fixed reconnect delay.
async fn connection_manager(shared: Arc<Shared>) {
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }

        // Connecting requires a streaming credential; without one the
        // manager stays Disconnected and retries on the same delay.
        let approval = match shared.tokens.get(CredentialKind::Streaming).await {
            Ok(cred) => cred.value,
            Err(e) => {
                warn!(error = %e, "streaming credential unavailable");
                tokio::time::sleep(shared.config.reconnect_delay).await;
                continue;
            }
        };
        shared.set_status(StreamStatus::Connecting);

        match run_connection(&shared, &approval).await {
            Ok(reason) => info!("stream disconnected: {}", reason),
            Err(e) => {
                error!(error = %e, "stream connection failed");
                shared.set_status(StreamStatus::Error);
            }
        }

        {
            let mut desired = shared.lock_desired();
            desired.outbound = None;
            desired.approval_key = None;
            desired.acked.clear();
        }
        shared.set_status(StreamStatus::Disconnected);

        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(shared.config.reconnect_delay).await;
    }
}

/// Run one connection to completion. Returns the disconnect reason; an `Err`
/// means the connection could not be established at all.
async fn run_connection(shared: &Arc<Shared>, approval_key: &str) -> Result<String> {
    let url = url::Url::parse(&shared.config.ws_url)
        .map_err(|e| KisError::Config(format!("invalid ws_url: {e}")))?;

    info!("connecting to stream endpoint: {}", url);
    let (ws_stream, _response) = connect_async(url).await?;
    info!("stream connection established");

    let (mut write, mut read) = ws_stream.split();
    let (out_tx, out_rx) = flume::unbounded::<Message>();

    // Install the outbound channel and reconcile: every desired key gets a
    // subscribe frame, rebuilding acknowledged state after the gap.
    {
        let mut desired = shared.lock_desired();
        desired.outbound = Some(out_tx.clone());
        desired.approval_key = Some(approval_key.to_string());
        let keys: Vec<SubscriptionKey> = desired.refs.keys().cloned().collect();
        if !keys.is_empty() {
            info!("replaying {} subscriptions", keys.len());
        }
        for key in keys {
            desired.send_control(shared.resolver.as_ref(), &key, TR_TYPE_SUBSCRIBE);
        }
    }
    shared.set_status(StreamStatus::Connected);

    let write_task = tokio::spawn(async move {
        while let Ok(message) = out_rx.recv_async().await {
            if let Err(e) = write.send(message).await {
                error!(error = %e, "stream write error");
                break;
            }
        }
    });

    // Frames are processed sequentially on this one loop, so tick delivery
    // per symbol preserves upstream send order.
    let reason = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => shared.handle_text(&text, &out_tx),
            Some(Ok(Message::Ping(payload))) => {
                let _ = out_tx.send(Message::Pong(payload));
            }
            Some(Ok(Message::Close(_))) => break "closed by upstream".to_string(),
            Some(Ok(_)) => {}
            Some(Err(e)) => break format!("read error: {e}"),
            None => break "stream ended".to_string(),
        }
    };

    write_task.abort();
    Ok(reason)
}

impl KisClient {
    /// Create a stream manager using this client's credentials and resolver.
    pub fn create_stream_manager(&self) -> StreamManager {
        self.create_stream_manager_with_config(StreamConfig {
            ws_url: self.config().ws_url.clone(),
            ..StreamConfig::default()
        })
    }

    pub fn create_stream_manager_with_config(&self, config: StreamConfig) -> StreamManager {
        StreamManager::start(self.tokens(), self.exchange_resolver().clone(), config)
    }
}
