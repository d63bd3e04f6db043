// =============================================================================
// Realtime Quote Service — upstream polling, market clock, and push fan-out
// =============================================================================
//
// Owns the subscriber hub and the periodic broadcaster task. Each broadcast
// cycle delivers a consistent {status, quotes-of-cycle} view; the subscriber
// set is partitioned into upstream batches of at most `batch_quote_cap`
// symbols. Upstream failures are logged and retried implicitly on the next
// cycle — they never terminate the service.
// =============================================================================

pub mod book;
pub mod clock;
pub mod hub;
pub mod quote;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::errors::CoreError;
use crate::runtime_config::RuntimeConfig;

pub use book::{BookLevel, OrderBook};
pub use clock::{current_market_status, market_status_at, MarketState, MarketStatus};
pub use hub::{PushEnvelope, QuoteHub, SinkId};
pub use quote::{MisQuoteClient, RealtimeQuote};

pub struct RealtimeService {
    pub hub: QuoteHub,
    client: MisQuoteClient,
    broadcast_interval: Duration,
    batch_cap: usize,
}

impl RealtimeService {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            hub: QuoteHub::new(config.sink_buffer),
            client: MisQuoteClient::new(
                Duration::from_secs(config.quote_timeout_secs),
                Duration::from_secs(config.batch_quote_timeout_secs),
                config.batch_quote_cap,
            ),
            broadcast_interval: Duration::from_secs(config.broadcast_interval_secs),
            batch_cap: config.batch_quote_cap,
        }
    }

    pub async fn get_quote(&self, symbol: &str) -> Result<RealtimeQuote, CoreError> {
        self.client.get_quote(symbol).await
    }

    pub async fn get_batch_quotes(
        &self,
        symbols: &[String],
    ) -> Result<Vec<RealtimeQuote>, CoreError> {
        self.client.get_batch_quotes(symbols).await
    }

    /// Spawn the long-lived broadcaster. The handle is owned by the caller
    /// (main) and aborted on shutdown.
    pub fn spawn_broadcaster(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        info!(
            interval_secs = service.broadcast_interval.as_secs(),
            "realtime broadcaster starting"
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.broadcast_interval);
            // The first tick fires immediately; subscribers connected later
            // are picked up on the following cycles.
            loop {
                ticker.tick().await;
                service.broadcast_cycle().await;
            }
        })
    }

    async fn broadcast_cycle(&self) {
        let symbols = self.hub.subscribed_symbols();
        if symbols.is_empty() {
            return;
        }

        // Status first: every cycle opens with a consistent clock reading.
        let status = clock::current_market_status();
        self.hub.broadcast_status(&status);

        for batch in symbols.chunks(self.batch_cap) {
            match self.client.get_batch_quotes(batch).await {
                Ok(quotes) => {
                    for quote in &quotes {
                        self.hub.broadcast_quote(quote);
                    }
                }
                Err(e) => {
                    // Next cycle is the retry.
                    warn!(error = %e, batch = batch.len(), "broadcast batch fetch failed");
                }
            }
        }
    }
}
