//! Shared poll multiplexer
//!
//! One polling pair per (exchange, symbol), ref-counted by subscriber count.
//! Every subscriber of a key shares the same upstream ticker and candle
//! fetches; upstream load is bounded by the number of entries, not the
//! number of subscribers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use desk_core::{Candle, CandleInterval, Exchange, MarketDataSource, Ticker};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Poll entry key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PollKey {
    pub exchange: Exchange,
    pub symbol: String,
}

impl std::fmt::Display for PollKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.exchange, self.symbol)
    }
}

/// Update broadcast to every subscriber of an entry
#[derive(Debug, Clone)]
pub enum PollUpdate {
    Ticker {
        key: PollKey,
        ticker: Ticker,
    },
    Candles {
        key: PollKey,
        interval: CandleInterval,
        candles: Vec<Candle>,
    },
}

/// Configuration for [`SharedPollMultiplexer`]
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Fast poll cadence for tickers
    pub ticker_interval: Duration,
    /// Slower poll cadence for candles
    pub candle_interval: Duration,
    /// Candle interval fetched by the candle poll
    pub candle_kind: CandleInterval,
    pub candle_limit: u32,
    pub channel_capacity: usize,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            ticker_interval: Duration::from_secs(3),
            candle_interval: Duration::from_secs(30),
            candle_kind: CandleInterval::OneMinute,
            candle_limit: 60,
            channel_capacity: 256,
        }
    }
}

/// Handed to a subscriber on join
///
/// `last_ticker`/`last_candles` carry the entry's most recent results so a
/// late joiner is never left waiting for the next tick.
pub struct PollSubscription {
    pub receiver: broadcast::Receiver<PollUpdate>,
    pub last_ticker: Option<PollUpdate>,
    pub last_candles: Option<PollUpdate>,
}

struct PollEntry {
    subscribers: HashSet<String>,
    update_tx: broadcast::Sender<PollUpdate>,
    last_ticker: Arc<RwLock<Option<PollUpdate>>>,
    last_candles: Arc<RwLock<Option<PollUpdate>>>,
    ticker_task: JoinHandle<()>,
    candle_task: JoinHandle<()>,
}

impl PollEntry {
    fn shutdown(&self) {
        self.ticker_task.abort();
        self.candle_task.abort();
    }
}

#[derive(Default)]
struct PollRegistry {
    entries: HashMap<PollKey, PollEntry>,
    /// subscriber id -> the key it currently holds
    index: HashMap<String, PollKey>,
}

/// Fan-out multiplexer sharing one upstream poll across subscribers
pub struct SharedPollMultiplexer {
    source: Arc<dyn MarketDataSource>,
    config: PollConfig,
    registry: Mutex<PollRegistry>,
}

impl SharedPollMultiplexer {
    pub fn new(source: Arc<dyn MarketDataSource>, config: PollConfig) -> Self {
        Self {
            source,
            config,
            registry: Mutex::new(PollRegistry::default()),
        }
    }

    /// Subscribe to a symbol's shared polls
    ///
    /// The first subscriber of a key creates the entry and starts both poll
    /// tasks; the very first fetch fires immediately, not after the first
    /// interval elapses. A subscriber holds at most one entry; re-joining
    /// under a different key moves it.
    pub fn join(&self, exchange: Exchange, symbol: &str, subscriber_id: &str) -> PollSubscription {
        let key = PollKey {
            exchange,
            symbol: symbol.to_string(),
        };

        let mut registry = self.registry.lock();

        if let Some(previous) = registry
            .index
            .insert(subscriber_id.to_string(), key.clone())
        {
            if previous != key {
                Self::remove_from_entry(&mut registry, &previous, subscriber_id);
            }
        }

        if let Some(entry) = registry.entries.get_mut(&key) {
            entry.subscribers.insert(subscriber_id.to_string());
            return PollSubscription {
                receiver: entry.update_tx.subscribe(),
                last_ticker: entry.last_ticker.read().clone(),
                last_candles: entry.last_candles.read().clone(),
            };
        }

        let (update_tx, receiver) = broadcast::channel(self.config.channel_capacity);
        let last_ticker = Arc::new(RwLock::new(None));
        let last_candles = Arc::new(RwLock::new(None));

        let ticker_task = tokio::spawn(Self::ticker_loop(
            Arc::clone(&self.source),
            key.clone(),
            update_tx.clone(),
            Arc::clone(&last_ticker),
            self.config.ticker_interval,
        ));
        let candle_task = tokio::spawn(Self::candle_loop(
            Arc::clone(&self.source),
            key.clone(),
            update_tx.clone(),
            Arc::clone(&last_candles),
            self.config.candle_interval,
            self.config.candle_kind,
            self.config.candle_limit,
        ));

        info!("[Poll] Started polling {}", key);

        registry.entries.insert(
            key,
            PollEntry {
                subscribers: HashSet::from([subscriber_id.to_string()]),
                update_tx,
                last_ticker,
                last_candles,
                ticker_task,
                candle_task,
            },
        );

        PollSubscription {
            receiver,
            last_ticker: None,
            last_candles: None,
        }
    }

    /// Drop a subscriber; an emptied entry cancels both of its timers
    pub fn leave(&self, subscriber_id: &str) {
        let mut registry = self.registry.lock();
        let Some(key) = registry.index.remove(subscriber_id) else {
            return;
        };
        Self::remove_from_entry(&mut registry, &key, subscriber_id);
    }

    fn remove_from_entry(registry: &mut PollRegistry, key: &PollKey, subscriber_id: &str) {
        let emptied = match registry.entries.get_mut(key) {
            Some(entry) => {
                entry.subscribers.remove(subscriber_id);
                entry.subscribers.is_empty()
            }
            None => false,
        };

        if emptied {
            if let Some(entry) = registry.entries.remove(key) {
                entry.shutdown();
                info!("[Poll] Stopped polling {} (no subscribers left)", key);
            }
        }
    }

    pub fn subscriber_count(&self, exchange: Exchange, symbol: &str) -> usize {
        let key = PollKey {
            exchange,
            symbol: symbol.to_string(),
        };
        self.registry
            .lock()
            .entries
            .get(&key)
            .map(|entry| entry.subscribers.len())
            .unwrap_or(0)
    }

    pub fn active_entries(&self) -> usize {
        self.registry.lock().entries.len()
    }

    async fn ticker_loop(
        source: Arc<dyn MarketDataSource>,
        key: PollKey,
        update_tx: broadcast::Sender<PollUpdate>,
        last: Arc<RwLock<Option<PollUpdate>>>,
        period: Duration,
    ) {
        // The interval's first tick completes immediately.
        let mut timer = tokio::time::interval(period);
        loop {
            timer.tick().await;
            match source.ticker(key.exchange, &key.symbol).await {
                Ok(ticker) => {
                    let update = PollUpdate::Ticker {
                        key: key.clone(),
                        ticker,
                    };
                    *last.write() = Some(update.clone());
                    let _ = update_tx.send(update);
                }
                Err(e) => {
                    // A failed poll skips one tick; the timer stays alive.
                    warn!("[Poll] Ticker fetch for {} failed: {}", key, e);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn candle_loop(
        source: Arc<dyn MarketDataSource>,
        key: PollKey,
        update_tx: broadcast::Sender<PollUpdate>,
        last: Arc<RwLock<Option<PollUpdate>>>,
        period: Duration,
        interval: CandleInterval,
        limit: u32,
    ) {
        let mut timer = tokio::time::interval(period);
        loop {
            timer.tick().await;
            match source.candles(key.exchange, &key.symbol, interval, limit).await {
                Ok(candles) => {
                    let update = PollUpdate::Candles {
                        key: key.clone(),
                        interval,
                        candles,
                    };
                    *last.write() = Some(update.clone());
                    let _ = update_tx.send(update);
                }
                Err(e) => {
                    warn!("[Poll] Candle fetch for {} failed: {}", key, e);
                }
            }
        }
    }
}

impl Drop for SharedPollMultiplexer {
    fn drop(&mut self) {
        let mut registry = self.registry.lock();
        for (_, entry) in registry.entries.drain() {
            entry.shutdown();
        }
    }
}

impl std::fmt::Debug for SharedPollMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.lock();
        f.debug_struct("SharedPollMultiplexer")
            .field("entries", &registry.entries.len())
            .field("subscribers", &registry.index.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use desk_core::{DeskError, OrderBook, Trade};
    use rust_decimal_macros::dec;

    #[derive(Default)]
    struct MockSource {
        ticker_calls: Mutex<HashMap<String, u32>>,
        candle_calls: Mutex<HashMap<String, u32>>,
    }

    impl MockSource {
        fn ticker_count(&self, symbol: &str) -> u32 {
            *self.ticker_calls.lock().get(symbol).unwrap_or(&0)
        }

        fn candle_count(&self, symbol: &str) -> u32 {
            *self.candle_calls.lock().get(symbol).unwrap_or(&0)
        }
    }

    #[async_trait]
    impl MarketDataSource for MockSource {
        async fn ticker(&self, exchange: Exchange, symbol: &str) -> Result<Ticker, DeskError> {
            *self
                .ticker_calls
                .lock()
                .entry(symbol.to_string())
                .or_insert(0) += 1;
            Ok(Ticker {
                exchange,
                symbol: symbol.to_string(),
                last_price: dec!(100),
                price_change: None,
                price_change_percent: None,
                high: None,
                low: None,
                volume: None,
                timestamp: Utc::now(),
            })
        }

        async fn candles(
            &self,
            _exchange: Exchange,
            symbol: &str,
            _interval: CandleInterval,
            _limit: u32,
        ) -> Result<Vec<Candle>, DeskError> {
            *self
                .candle_calls
                .lock()
                .entry(symbol.to_string())
                .or_insert(0) += 1;
            Ok(vec![Candle {
                open_time: Utc::now(),
                open: dec!(99),
                high: dec!(101),
                low: dec!(98),
                close: dec!(100),
                volume: dec!(10),
            }])
        }

        async fn order_book(
            &self,
            exchange: Exchange,
            symbol: &str,
            _depth: u32,
        ) -> Result<OrderBook, DeskError> {
            Ok(OrderBook::new(exchange, symbol))
        }

        async fn recent_trades(
            &self,
            _exchange: Exchange,
            _symbol: &str,
            _limit: u32,
        ) -> Result<Vec<Trade>, DeskError> {
            Ok(vec![])
        }
    }

    fn slow_config() -> PollConfig {
        PollConfig {
            ticker_interval: Duration::from_secs(30),
            candle_interval: Duration::from_secs(30),
            ..PollConfig::default()
        }
    }

    #[tokio::test]
    async fn join_yields_an_immediate_first_value() {
        let source = Arc::new(MockSource::default());
        let mux = SharedPollMultiplexer::new(source.clone(), slow_config());

        let mut sub = mux.join(Exchange::Binance, "BTCUSDT", "client-1");
        let update = tokio::time::timeout(Duration::from_millis(500), sub.receiver.recv())
            .await
            .expect("first value must arrive long before the first interval elapses")
            .unwrap();

        match update {
            PollUpdate::Ticker { key, .. } | PollUpdate::Candles { key, .. } => {
                assert_eq!(key.symbol, "BTCUSDT");
            }
        }
    }

    #[tokio::test]
    async fn n_subscribers_share_one_upstream_fetch_per_tick() {
        let source = Arc::new(MockSource::default());
        let config = PollConfig {
            ticker_interval: Duration::from_millis(40),
            candle_interval: Duration::from_secs(30),
            ..PollConfig::default()
        };
        let mux = SharedPollMultiplexer::new(source.clone(), config);

        let _a = mux.join(Exchange::Binance, "BTCUSDT", "a");
        let _b = mux.join(Exchange::Binance, "BTCUSDT", "b");
        let _c = mux.join(Exchange::Binance, "BTCUSDT", "c");
        assert_eq!(mux.subscriber_count(Exchange::Binance, "BTCUSDT"), 3);

        tokio::time::sleep(Duration::from_millis(170)).await;

        // ~5 ticks elapsed; a per-subscriber poll would have tripled this
        let tickers = source.ticker_count("BTCUSDT");
        assert!(
            (2..=7).contains(&tickers),
            "expected one shared fetch per tick, saw {}",
            tickers
        );
        // Only the immediate candle fetch fired within the window
        assert_eq!(source.candle_count("BTCUSDT"), 1);
    }

    #[tokio::test]
    async fn last_leave_cancels_both_timers() {
        let source = Arc::new(MockSource::default());
        let config = PollConfig {
            ticker_interval: Duration::from_millis(30),
            candle_interval: Duration::from_millis(30),
            ..PollConfig::default()
        };
        let mux = SharedPollMultiplexer::new(source.clone(), config);

        let _a = mux.join(Exchange::Binance, "BTCUSDT", "a");
        let _b = mux.join(Exchange::Binance, "BTCUSDT", "b");
        tokio::time::sleep(Duration::from_millis(80)).await;

        mux.leave("a");
        assert_eq!(mux.active_entries(), 1);
        mux.leave("b");
        assert_eq!(mux.active_entries(), 0);

        // Let any in-flight tick settle, then confirm silence.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let tickers = source.ticker_count("BTCUSDT");
        let candles = source.candle_count("BTCUSDT");
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(source.ticker_count("BTCUSDT"), tickers);
        assert_eq!(source.candle_count("BTCUSDT"), candles);
    }

    #[tokio::test]
    async fn leaving_one_symbol_leaves_others_running() {
        let source = Arc::new(MockSource::default());
        let config = PollConfig {
            ticker_interval: Duration::from_millis(30),
            candle_interval: Duration::from_secs(30),
            ..PollConfig::default()
        };
        let mux = SharedPollMultiplexer::new(source.clone(), config);

        let _a = mux.join(Exchange::Binance, "BTCUSDT", "a");
        let _b = mux.join(Exchange::Binance, "ETHUSDT", "b");
        tokio::time::sleep(Duration::from_millis(50)).await;

        mux.leave("a");
        assert_eq!(mux.active_entries(), 1);

        let eth_before = source.ticker_count("ETHUSDT");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(source.ticker_count("ETHUSDT") > eth_before);
    }

    #[tokio::test]
    async fn late_joiner_reads_last_known_values() {
        let source = Arc::new(MockSource::default());
        let mux = SharedPollMultiplexer::new(source.clone(), slow_config());

        let mut first = mux.join(Exchange::Bybit, "BTCUSDT", "a");
        // Wait for the immediate fetches to land.
        let _ = tokio::time::timeout(Duration::from_millis(500), first.receiver.recv())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let late = mux.join(Exchange::Bybit, "BTCUSDT", "b");
        assert!(late.last_ticker.is_some() || late.last_candles.is_some());
    }

    #[tokio::test]
    async fn rejoining_under_a_new_key_moves_the_subscriber() {
        let source = Arc::new(MockSource::default());
        let mux = SharedPollMultiplexer::new(source.clone(), slow_config());

        let _first = mux.join(Exchange::Binance, "BTCUSDT", "a");
        assert_eq!(mux.active_entries(), 1);

        let _second = mux.join(Exchange::Binance, "ETHUSDT", "a");
        assert_eq!(mux.active_entries(), 1);
        assert_eq!(mux.subscriber_count(Exchange::Binance, "BTCUSDT"), 0);
        assert_eq!(mux.subscriber_count(Exchange::Binance, "ETHUSDT"), 1);
    }
}
