//! Per-user stream session manager
//!
//! Owns the full lifecycle of each user's private data stream: token
//! acquisition, socket supervision, keepalive renewal, jittered reconnection
//! with an attempt cap, and rate-limit cooldown with a single scheduled
//! resumption. All session state lives behind this manager's API.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use desk_core::{
    BalanceUpdate, ConnectionState, CredentialProvider, DeskResult, ExchangeCredential,
    OrderUpdate, StreamConnection, StreamEvent, StreamNotification, StreamPayload, StreamTokenApi,
    TransportFrame, UserStreamTransport,
};
use rand::Rng;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant};
use tracing::{debug, info, warn};

use crate::events::EventBus;

/// Configuration for [`UserStreamSessionManager`]
#[derive(Debug, Clone)]
pub struct StreamSessionConfig {
    /// Cadence of stream-token renewal while connected
    pub keepalive_interval: Duration,
    /// First reconnect delay; doubles per attempt
    pub reconnect_base: Duration,
    /// Ceiling on the reconnect delay before jitter
    pub reconnect_max_delay: Duration,
    /// Reconnect attempts before the session is abandoned
    pub max_reconnect_attempts: u32,
    /// Cooldown entered when token acquisition is rate limited
    pub rate_limit_cooldown: Duration,
    /// Slack added to the cooldown before the automatic retry fires
    pub cooldown_retry_buffer: Duration,
}

impl Default for StreamSessionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(30 * 60),
            reconnect_base: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            rate_limit_cooldown: Duration::from_secs(10 * 60),
            cooldown_retry_buffer: Duration::from_secs(5),
        }
    }
}

/// Pre-jitter reconnect delay for the given attempt (1-based)
pub(crate) fn reconnect_delay(config: &StreamSessionConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let delay = config
        .reconnect_base
        .saturating_mul(2u32.saturating_pow(exponent));
    delay.min(config.reconnect_max_delay)
}

/// Add up to 25% random jitter so mass reconnects spread out
pub(crate) fn with_jitter(delay: Duration) -> Duration {
    let jitter_ms = (delay.as_millis() as u64) / 4;
    if jitter_ms == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
}

struct StreamSession {
    state: ConnectionState,
    stream_token: Option<String>,
    reconnect_attempt: u32,
    rate_limited_until: Option<Instant>,
    /// Bumped per session generation; stale tasks check it before touching
    /// the record, so a disconnect can never be undone by an in-flight
    /// reconnect
    epoch: u64,
    keepalive: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    cooldown_timer: Option<JoinHandle<()>>,
    close_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl StreamSession {
    fn new(epoch: u64) -> Self {
        Self {
            state: ConnectionState::Idle,
            stream_token: None,
            reconnect_attempt: 0,
            rate_limited_until: None,
            epoch,
            keepalive: None,
            reader: None,
            reconnect_timer: None,
            cooldown_timer: None,
            close_tx: None,
        }
    }

    fn cancel_tasks(&mut self) {
        for handle in [
            self.keepalive.take(),
            self.reader.take(),
            self.reconnect_timer.take(),
            self.cooldown_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

struct ManagerInner {
    config: StreamSessionConfig,
    credentials: Arc<dyn CredentialProvider>,
    token_api: Arc<dyn StreamTokenApi>,
    transport: Arc<dyn UserStreamTransport>,
    events: EventBus,
    sessions: Mutex<HashMap<String, StreamSession>>,
    last_balances: DashMap<String, BalanceUpdate>,
    last_orders: DashMap<String, OrderUpdate>,
    epochs: AtomicU64,
}

/// Manages one private data stream per user
pub struct UserStreamSessionManager {
    inner: Arc<ManagerInner>,
}

impl UserStreamSessionManager {
    pub fn new(
        credentials: Arc<dyn CredentialProvider>,
        token_api: Arc<dyn StreamTokenApi>,
        transport: Arc<dyn UserStreamTransport>,
        config: StreamSessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                credentials,
                token_api,
                transport,
                events: EventBus::new(),
                sessions: Mutex::new(HashMap::new()),
                last_balances: DashMap::new(),
                last_orders: DashMap::new(),
                epochs: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe to the typed notification bus
    pub fn subscribe(&self) -> broadcast::Receiver<StreamNotification> {
        self.inner.events.subscribe()
    }

    pub fn events(&self) -> EventBus {
        self.inner.events.clone()
    }

    /// Open (or re-open) the user's stream session
    ///
    /// No-op while already connected or connecting. During a rate-limit
    /// cooldown this publishes a RateLimited status and returns without side
    /// effects; rate-limited token acquisition schedules its own resumption
    /// and is not surfaced as an error. Credential failures are terminal.
    pub async fn connect(&self, user_id: &str) -> DeskResult<()> {
        Self::connect_session(&self.inner, user_id).await
    }

    /// Tear the session down
    ///
    /// Idempotent and safe at any time, including mid-reconnect: every timer
    /// is cancelled, the reader is detached before the socket closes, the
    /// stream token is released best-effort, and the record is removed so no
    /// in-flight task can resurrect it.
    pub async fn disconnect(&self, user_id: &str) -> DeskResult<()> {
        let session = { self.inner.sessions.lock().await.remove(user_id) };
        let Some(mut session) = session else {
            debug!("[Stream] Disconnect for {} with no session; no-op", user_id);
            return Ok(());
        };

        session.cancel_tasks();
        if let Some(close) = session.close_tx.take() {
            let _ = close.send(());
        }
        session.rate_limited_until = None;

        if let Some(token) = session.stream_token.take() {
            match self.inner.credentials.credential(user_id).await {
                Ok(credential) => {
                    if let Err(e) = self
                        .inner
                        .token_api
                        .release_stream_token(&credential, &token)
                        .await
                    {
                        warn!("[Stream] Token release for {} failed: {}", user_id, e);
                    }
                }
                Err(e) => {
                    warn!(
                        "[Stream] Credential lookup for token release of {} failed: {}",
                        user_id, e
                    );
                }
            }
        }

        info!("[Stream] Session for {} disconnected", user_id);
        self.inner.events.publish(
            user_id,
            StreamEvent::ConnectionStatus {
                state: ConnectionState::Disconnected,
                detail: None,
            },
        );
        Ok(())
    }

    pub async fn state(&self, user_id: &str) -> Option<ConnectionState> {
        self.inner
            .sessions
            .lock()
            .await
            .get(user_id)
            .map(|session| session.state)
    }

    pub async fn session_count(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    /// Latest balance state seen on the user's stream
    pub fn last_balance(&self, user_id: &str) -> Option<BalanceUpdate> {
        self.inner
            .last_balances
            .get(user_id)
            .map(|entry| entry.value().clone())
    }

    /// Latest order state seen on the user's stream
    pub fn last_order(&self, user_id: &str) -> Option<OrderUpdate> {
        self.inner
            .last_orders
            .get(user_id)
            .map(|entry| entry.value().clone())
    }

    // ========================================================================
    // Session lifecycle internals
    // ========================================================================

    async fn connect_session(inner: &Arc<ManagerInner>, user_id: &str) -> DeskResult<()> {
        enum Plan {
            NoOp,
            CoolingDown,
            Proceed {
                epoch: u64,
                token: Option<String>,
            },
        }

        let plan = {
            let mut sessions = inner.sessions.lock().await;
            match sessions.get_mut(user_id) {
                Some(session) => match session.state {
                    ConnectionState::Connected | ConnectionState::Connecting => {
                        debug!(
                            "[Stream] {} already {}; connect is a no-op",
                            user_id, session.state
                        );
                        Plan::NoOp
                    }
                    ConnectionState::RateLimited
                        if session
                            .rate_limited_until
                            .is_some_and(|until| Instant::now() < until) =>
                    {
                        Plan::CoolingDown
                    }
                    _ => {
                        // A passed cooldown is cleared before further
                        // attempts proceed; taking over a reconnecting
                        // session supersedes its pending timer.
                        session.rate_limited_until = None;
                        if let Some(timer) = session.cooldown_timer.take() {
                            timer.abort();
                        }
                        if let Some(timer) = session.reconnect_timer.take() {
                            timer.abort();
                        }
                        session.state = ConnectionState::Connecting;
                        Plan::Proceed {
                            epoch: session.epoch,
                            token: session.stream_token.clone(),
                        }
                    }
                },
                None => {
                    let epoch = inner.epochs.fetch_add(1, Ordering::SeqCst) + 1;
                    let mut session = StreamSession::new(epoch);
                    session.state = ConnectionState::Connecting;
                    sessions.insert(user_id.to_string(), session);
                    Plan::Proceed { epoch, token: None }
                }
            }
        };

        let (epoch, existing_token) = match plan {
            Plan::NoOp => return Ok(()),
            Plan::CoolingDown => {
                inner.events.publish(
                    user_id,
                    StreamEvent::ConnectionStatus {
                        state: ConnectionState::RateLimited,
                        detail: Some("token acquisition cooling down".to_string()),
                    },
                );
                return Ok(());
            }
            Plan::Proceed { epoch, token } => (epoch, token),
        };

        inner.events.publish(
            user_id,
            StreamEvent::ConnectionStatus {
                state: ConnectionState::Connecting,
                detail: None,
            },
        );

        let credential = match inner.credentials.credential(user_id).await {
            Ok(credential) => credential,
            Err(e) => {
                Self::remove_session(inner, user_id, epoch).await;
                inner.events.publish(
                    user_id,
                    StreamEvent::Error {
                        message: format!("credential lookup failed: {}", e),
                    },
                );
                return Err(e);
            }
        };

        // A non-terminal session keeps its token; only sessions without one
        // request a new token.
        let token = match existing_token {
            Some(token) => token,
            None => match inner.token_api.create_stream_token(&credential).await {
                Ok(token) => token,
                Err(e) if e.is_rate_limited() => {
                    Self::enter_cooldown(inner, user_id, epoch).await;
                    return Ok(());
                }
                Err(e) => {
                    Self::remove_session(inner, user_id, epoch).await;
                    inner.events.publish(
                        user_id,
                        StreamEvent::Error {
                            message: format!("stream token acquisition failed: {}", e),
                        },
                    );
                    return Err(e);
                }
            },
        };

        Self::open_stream(inner, user_id, epoch, credential, token).await;
        Ok(())
    }

    /// Boxed (not `async fn`) so its type is nameable, breaking the opaque-type
    /// recursion cycle this forms with [`Self::try_reconnect`] via [`Self::handle_stream_down`].
    fn open_stream<'a>(
        inner: &'a Arc<ManagerInner>,
        user_id: &'a str,
        epoch: u64,
        credential: ExchangeCredential,
        token: String,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            match inner.transport.open(&token).await {
                Ok(connection) => {
                    let StreamConnection { frames, close } = connection;
                    let mut sessions = inner.sessions.lock().await;
                    let current = sessions
                        .get_mut(user_id)
                        .filter(|session| session.epoch == epoch);
                    let Some(session) = current else {
                        // Disconnected (or superseded) while the socket was
                        // opening; dropping the close handle shuts it down.
                        drop(sessions);
                        debug!("[Stream] Discarding stale socket for {}", user_id);
                        return;
                    };

                    session.state = ConnectionState::Connected;
                    session.stream_token = Some(token.clone());
                    session.reconnect_attempt = 0;
                    session.close_tx = Some(close);
                    session.reader = Some(tokio::spawn(Self::read_frames(
                        Arc::clone(inner),
                        user_id.to_string(),
                        epoch,
                        frames,
                    )));
                    session.keepalive = Some(tokio::spawn(Self::keepalive_loop(
                        Arc::clone(inner),
                        user_id.to_string(),
                        epoch,
                        credential,
                        token,
                    )));
                    drop(sessions);

                    info!("[Stream] User stream connected for {}", user_id);
                    inner.events.publish(
                        user_id,
                        StreamEvent::ConnectionStatus {
                            state: ConnectionState::Connected,
                            detail: None,
                        },
                    );
                }
                Err(e) => {
                    warn!("[Stream] Socket open for {} failed: {}", user_id, e);
                    Self::handle_stream_down(inner, user_id, epoch, e.to_string()).await;
                }
            }
        })
    }

    /// Route a dead socket (or failed open/renewal) into reconnection
    ///
    /// Boxed (not `async fn`) so its type is nameable, breaking the opaque-type
    /// recursion cycle this forms with [`Self::try_reconnect`] via its spawned
    /// reconnect timer.
    fn handle_stream_down<'a>(
        inner: &'a Arc<ManagerInner>,
        user_id: &'a str,
        epoch: u64,
        reason: String,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let (attempt, delay) = {
                let mut sessions = inner.sessions.lock().await;
                let current = sessions
                    .get_mut(user_id)
                    .filter(|session| session.epoch == epoch);
                let Some(session) = current else {
                    return;
                };

                // Detach listeners before the socket handle goes away.
                if let Some(handle) = session.reader.take() {
                    handle.abort();
                }
                if let Some(handle) = session.keepalive.take() {
                    handle.abort();
                }
                session.close_tx = None;

                session.reconnect_attempt += 1;
                let attempt = session.reconnect_attempt;

                if attempt > inner.config.max_reconnect_attempts {
                    if let Some(mut session) = sessions.remove(user_id) {
                        session.cancel_tasks();
                    }
                    drop(sessions);
                    warn!(
                        "[Stream] Abandoning session for {} after {} reconnect attempts",
                        user_id,
                        attempt - 1
                    );
                    inner.events.publish(
                        user_id,
                        StreamEvent::ConnectionStatus {
                            state: ConnectionState::Failed,
                            detail: Some(reason.clone()),
                        },
                    );
                    inner.events.publish(
                        user_id,
                        StreamEvent::Error {
                            message: format!(
                                "stream abandoned after {} reconnect attempts: {}",
                                attempt - 1,
                                reason
                            ),
                        },
                    );
                    return;
                }

                session.state = ConnectionState::Reconnecting;
                let delay = with_jitter(reconnect_delay(&inner.config, attempt));
                let inner_task = Arc::clone(inner);
                let user = user_id.to_string();
                session.reconnect_timer = Some(tokio::spawn(async move {
                    sleep(delay).await;
                    Self::try_reconnect(inner_task, user, epoch).await;
                }));
                (attempt, delay)
            };

            info!(
                "[Stream] Stream down for {} ({}); reconnect attempt {} in {:?}",
                user_id, reason, attempt, delay
            );
            inner.events.publish(
                user_id,
                StreamEvent::ConnectionStatus {
                    state: ConnectionState::Reconnecting,
                    detail: Some(reason),
                },
            );
        })
    }

    async fn try_reconnect(inner: Arc<ManagerInner>, user_id: String, epoch: u64) {
        let token = {
            let mut sessions = inner.sessions.lock().await;
            let current = sessions
                .get_mut(&user_id)
                .filter(|session| session.epoch == epoch);
            let Some(session) = current else {
                // Disconnected while the timer was pending.
                return;
            };
            if session.state != ConnectionState::Reconnecting {
                return;
            }
            session.state = ConnectionState::Connecting;
            session.stream_token.clone()
        };

        let credential = match inner.credentials.credential(&user_id).await {
            Ok(credential) => credential,
            Err(e) => {
                Self::handle_stream_down(
                    &inner,
                    &user_id,
                    epoch,
                    format!("credential lookup failed: {}", e),
                )
                .await;
                return;
            }
        };

        let token = match token {
            Some(token) => token,
            None => match inner.token_api.create_stream_token(&credential).await {
                Ok(token) => token,
                Err(e) if e.is_rate_limited() => {
                    Self::enter_cooldown(&inner, &user_id, epoch).await;
                    return;
                }
                Err(e) => {
                    Self::handle_stream_down(
                        &inner,
                        &user_id,
                        epoch,
                        format!("token acquisition failed: {}", e),
                    )
                    .await;
                    return;
                }
            },
        };

        Self::open_stream(&inner, &user_id, epoch, credential, token).await;
    }

    /// Enter the rate-limit cooldown and schedule its single resumption
    ///
    /// Boxed (not `async fn`) so its type is nameable, breaking the opaque-type
    /// recursion cycle this forms with [`Self::connect_session`] via its spawned
    /// resumption task.
    fn enter_cooldown<'a>(
        inner: &'a Arc<ManagerInner>,
        user_id: &'a str,
        epoch: u64,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let cooldown = inner.config.rate_limit_cooldown;
            let retry_in = cooldown + inner.config.cooldown_retry_buffer;
            {
                let mut sessions = inner.sessions.lock().await;
                let current = sessions
                    .get_mut(user_id)
                    .filter(|session| session.epoch == epoch);
                let Some(session) = current else {
                    return;
                };

                session.state = ConnectionState::RateLimited;
                session.rate_limited_until = Some(Instant::now() + cooldown);

                // One retry per cooldown, at expiry plus the buffer, never
                // before.
                if let Some(timer) = session.cooldown_timer.take() {
                    timer.abort();
                }
                let inner_task = Arc::clone(inner);
                let user = user_id.to_string();
                session.cooldown_timer = Some(tokio::spawn(async move {
                    sleep(retry_in).await;
                    {
                        let mut sessions = inner_task.sessions.lock().await;
                        let current = sessions
                            .get_mut(&user)
                            .filter(|session| session.epoch == epoch);
                        let Some(session) = current else {
                            return;
                        };
                        if session.state != ConnectionState::RateLimited {
                            return;
                        }
                        session.rate_limited_until = None;
                    }
                    if let Err(e) = Self::connect_session(&inner_task, &user).await {
                        warn!("[Stream] Post-cooldown connect for {} failed: {}", user, e);
                    }
                }));
            }

            warn!(
                "[Stream] Token acquisition rate limited for {}; retrying in {:?}",
                user_id, retry_in
            );
            inner.events.publish(
                user_id,
                StreamEvent::ConnectionStatus {
                    state: ConnectionState::RateLimited,
                    detail: Some(format!("retrying in {:?}", retry_in)),
                },
            );
        })
    }

    async fn remove_session(inner: &Arc<ManagerInner>, user_id: &str, epoch: u64) {
        let mut sessions = inner.sessions.lock().await;
        let matches = sessions
            .get(user_id)
            .map(|session| session.epoch == epoch)
            .unwrap_or(false);
        if matches {
            if let Some(mut session) = sessions.remove(user_id) {
                session.cancel_tasks();
            }
        }
    }

    /// Forward decoded frames to the bus and retain latest per-user state
    async fn read_frames(
        inner: Arc<ManagerInner>,
        user_id: String,
        epoch: u64,
        mut frames: mpsc::Receiver<TransportFrame>,
    ) {
        while let Some(frame) = frames.recv().await {
            match frame {
                TransportFrame::Payload(StreamPayload::Balance(update)) => {
                    inner.last_balances.insert(user_id.clone(), update.clone());
                    inner
                        .events
                        .publish(&user_id, StreamEvent::BalanceUpdate(update));
                }
                TransportFrame::Payload(StreamPayload::Order(update)) => {
                    inner.last_orders.insert(user_id.clone(), update.clone());
                    inner
                        .events
                        .publish(&user_id, StreamEvent::OrderUpdate(update));
                }
                TransportFrame::Closed { reason } => {
                    let reason = reason.unwrap_or_else(|| "connection closed".to_string());
                    Self::handle_stream_down(&inner, &user_id, epoch, reason).await;
                    return;
                }
            }
        }

        // The transport dropped its sender without a close frame.
        Self::handle_stream_down(&inner, &user_id, epoch, "stream channel ended".to_string())
            .await;
    }

    /// Renew the stream token on a fixed cadence
    ///
    /// A failed renewal force-closes the socket instead of leaving a stale
    /// token active, routing recovery through the ordinary reconnect path.
    async fn keepalive_loop(
        inner: Arc<ManagerInner>,
        user_id: String,
        epoch: u64,
        credential: ExchangeCredential,
        token: String,
    ) {
        let mut timer = interval(inner.config.keepalive_interval);
        // The interval's immediate first tick would renew a token created
        // moments ago.
        timer.tick().await;

        loop {
            timer.tick().await;
            match inner
                .token_api
                .renew_stream_token(&credential, &token)
                .await
            {
                Ok(()) => {
                    debug!("[Stream] Stream token renewed for {}", user_id);
                }
                Err(e) => {
                    warn!(
                        "[Stream] Token renewal for {} failed; forcing socket close: {}",
                        user_id, e
                    );
                    {
                        let mut sessions = inner.sessions.lock().await;
                        if let Some(session) = sessions.get_mut(&user_id) {
                            if session.epoch == epoch {
                                // The token is stale; reconnection must mint
                                // a fresh one.
                                session.stream_token = None;
                            }
                        }
                    }
                    Self::handle_stream_down(
                        &inner,
                        &user_id,
                        epoch,
                        format!("token renewal failed: {}", e),
                    )
                    .await;
                    return;
                }
            }
        }
    }
}

impl std::fmt::Debug for UserStreamSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserStreamSessionManager")
            .field("config", &self.inner.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use desk_core::{AssetBalance, DeskError};
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicBool, AtomicU32};

    struct MockCredentials;

    #[async_trait]
    impl CredentialProvider for MockCredentials {
        async fn credential(&self, _user_id: &str) -> Result<ExchangeCredential, DeskError> {
            Ok(ExchangeCredential::new("key", "secret"))
        }
    }

    #[derive(Default)]
    struct MockTokenApi {
        create_calls: AtomicU32,
        renew_calls: AtomicU32,
        release_calls: AtomicU32,
        rate_limit_creates: AtomicBool,
        fail_renewals: AtomicBool,
    }

    #[async_trait]
    impl StreamTokenApi for MockTokenApi {
        async fn create_stream_token(
            &self,
            _credential: &ExchangeCredential,
        ) -> Result<String, DeskError> {
            let n = self.create_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.rate_limit_creates.load(Ordering::SeqCst) {
                return Err(DeskError::rate_limited(None));
            }
            Ok(format!("token-{}", n))
        }

        async fn renew_stream_token(
            &self,
            _credential: &ExchangeCredential,
            _token: &str,
        ) -> Result<(), DeskError> {
            self.renew_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_renewals.load(Ordering::SeqCst) {
                return Err(DeskError::network("renewal refused"));
            }
            Ok(())
        }

        async fn release_stream_token(
            &self,
            _credential: &ExchangeCredential,
            _token: &str,
        ) -> Result<(), DeskError> {
            self.release_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockTransport {
        open_calls: AtomicU32,
        fail_opens: AtomicBool,
        frame_senders: parking_lot::Mutex<Vec<mpsc::Sender<TransportFrame>>>,
    }

    impl MockTransport {
        fn latest_sender(&self) -> mpsc::Sender<TransportFrame> {
            self.frame_senders
                .lock()
                .last()
                .expect("transport was never opened")
                .clone()
        }
    }

    #[async_trait]
    impl UserStreamTransport for MockTransport {
        async fn open(&self, _token: &str) -> Result<StreamConnection, DeskError> {
            self.open_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_opens.load(Ordering::SeqCst) {
                return Err(DeskError::stream_disconnected("mock socket refused"));
            }
            let (tx, rx) = mpsc::channel(16);
            let (close_tx, close_rx) = tokio::sync::oneshot::channel::<()>();
            let held = tx.clone();
            self.frame_senders.lock().push(tx);
            tokio::spawn(async move {
                let _ = close_rx.await;
                drop(held);
            });
            Ok(StreamConnection {
                frames: rx,
                close: close_tx,
            })
        }
    }

    struct Harness {
        manager: UserStreamSessionManager,
        token_api: Arc<MockTokenApi>,
        transport: Arc<MockTransport>,
    }

    fn harness(config: StreamSessionConfig) -> Harness {
        let token_api = Arc::new(MockTokenApi::default());
        let transport = Arc::new(MockTransport::default());
        let manager = UserStreamSessionManager::new(
            Arc::new(MockCredentials),
            Arc::clone(&token_api) as Arc<dyn StreamTokenApi>,
            Arc::clone(&transport) as Arc<dyn UserStreamTransport>,
            config,
        );
        Harness {
            manager,
            token_api,
            transport,
        }
    }

    fn fast_config() -> StreamSessionConfig {
        StreamSessionConfig {
            keepalive_interval: Duration::from_secs(60),
            reconnect_base: Duration::from_millis(10),
            reconnect_max_delay: Duration::from_millis(40),
            max_reconnect_attempts: 5,
            rate_limit_cooldown: Duration::from_millis(80),
            cooldown_retry_buffer: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn connect_twice_opens_one_socket_and_one_keepalive() {
        let h = harness(fast_config());

        h.manager.connect("user-1").await.unwrap();
        h.manager.connect("user-1").await.unwrap();

        assert_eq!(h.transport.open_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.token_api.create_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.manager.state("user-1").await,
            Some(ConnectionState::Connected)
        );
        assert_eq!(h.manager.session_count().await, 1);
    }

    #[tokio::test]
    async fn rate_limited_token_schedules_exactly_one_retry_at_expiry() {
        let h = harness(fast_config());
        h.token_api.rate_limit_creates.store(true, Ordering::SeqCst);

        // Rate limiting is not an error to the caller.
        h.manager.connect("user-1").await.unwrap();
        assert_eq!(
            h.manager.state("user-1").await,
            Some(ConnectionState::RateLimited)
        );
        assert_eq!(h.token_api.create_calls.load(Ordering::SeqCst), 1);

        // Connecting during the cooldown is a no-op.
        h.manager.connect("user-1").await.unwrap();
        assert_eq!(h.token_api.create_calls.load(Ordering::SeqCst), 1);

        // No retry fires before the cooldown expires.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.token_api.create_calls.load(Ordering::SeqCst), 1);

        // The single scheduled retry lands after cooldown + buffer.
        h.token_api.rate_limit_creates.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(h.token_api.create_calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            h.manager.state("user-1").await,
            Some(ConnectionState::Connected)
        );
    }

    #[test]
    fn reconnect_delays_are_non_decreasing_and_capped() {
        let config = StreamSessionConfig::default();
        let delays: Vec<Duration> = (1..=5).map(|a| reconnect_delay(&config, a)).collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
            ]
        );
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert_eq!(reconnect_delay(&config, 10), Duration::from_secs(30));

        let base = Duration::from_secs(4);
        for _ in 0..20 {
            let jittered = with_jitter(base);
            assert!(jittered >= base);
            assert!(jittered <= base + Duration::from_secs(1));
        }
    }

    #[tokio::test]
    async fn reconnection_stops_permanently_after_the_attempt_cap() {
        let config = StreamSessionConfig {
            max_reconnect_attempts: 2,
            ..fast_config()
        };
        let h = harness(config);
        h.transport.fail_opens.store(true, Ordering::SeqCst);
        let mut events = h.manager.subscribe();

        h.manager.connect("user-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        // initial open + 2 reconnect attempts, nothing after the cap
        assert_eq!(h.transport.open_calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.manager.session_count().await, 0);

        let mut saw_failed = false;
        while let Ok(notification) = events.try_recv() {
            if matches!(
                notification.event,
                StreamEvent::ConnectionStatus {
                    state: ConnectionState::Failed,
                    ..
                }
            ) {
                saw_failed = true;
            }
        }
        assert!(saw_failed, "expected a terminal Failed status event");
    }

    #[tokio::test]
    async fn failed_renewal_forces_reconnection_with_a_fresh_token() {
        let config = StreamSessionConfig {
            keepalive_interval: Duration::from_millis(30),
            ..fast_config()
        };
        let h = harness(config);
        h.token_api.fail_renewals.store(true, Ordering::SeqCst);

        h.manager.connect("user-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(70)).await;
        h.token_api.fail_renewals.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(70)).await;

        assert!(h.token_api.renew_calls.load(Ordering::SeqCst) >= 1);
        // The stale token was discarded, so reconnection minted a new one.
        assert!(h.token_api.create_calls.load(Ordering::SeqCst) >= 2);
        assert!(h.transport.open_calls.load(Ordering::SeqCst) >= 2);
        assert_eq!(
            h.manager.state("user-1").await,
            Some(ConnectionState::Connected)
        );

        h.manager.disconnect("user-1").await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_releases_the_token() {
        let h = harness(fast_config());

        h.manager.connect("user-1").await.unwrap();
        h.manager.disconnect("user-1").await.unwrap();
        h.manager.disconnect("user-1").await.unwrap();

        assert_eq!(h.token_api.release_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn disconnect_during_reconnect_prevents_resurrection() {
        let config = StreamSessionConfig {
            reconnect_base: Duration::from_millis(60),
            reconnect_max_delay: Duration::from_millis(60),
            ..fast_config()
        };
        let h = harness(config);

        h.manager.connect("user-1").await.unwrap();
        h.transport
            .latest_sender()
            .send(TransportFrame::Closed { reason: None })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            h.manager.state("user-1").await,
            Some(ConnectionState::Reconnecting)
        );

        h.manager.disconnect("user-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(h.transport.open_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn stream_events_update_last_known_state() {
        let h = harness(fast_config());
        let mut events = h.manager.subscribe();

        h.manager.connect("user-1").await.unwrap();
        let update = BalanceUpdate {
            balances: vec![AssetBalance {
                asset: "BTC".to_string(),
                free: dec!(1),
                locked: dec!(0),
            }],
            event_time: Utc::now(),
        };
        h.transport
            .latest_sender()
            .send(TransportFrame::Payload(StreamPayload::Balance(update)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let retained = h.manager.last_balance("user-1").expect("balance retained");
        assert_eq!(retained.balances[0].asset, "BTC");

        let mut saw_balance = false;
        while let Ok(notification) = events.try_recv() {
            assert_eq!(notification.user_id, "user-1");
            if matches!(notification.event, StreamEvent::BalanceUpdate(_)) {
                saw_balance = true;
            }
        }
        assert!(saw_balance, "expected a balance notification on the bus");
    }
}
