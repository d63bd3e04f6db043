// =============================================================================
// Quote Hub — subscribe/broadcast fabric for push clients
// =============================================================================
//
// State is `symbol → {sink_id → bounded sender}` behind a read-write lock:
// readers (broadcast) concurrent, writers (subscribe/unsubscribe) briefly
// exclusive. Delivery is `try_send`: a sink whose buffer is full loses the
// update — a slow consumer never stalls the broadcaster.
//
// Ownership is one-directional: the hub owns the senders; each client owns
// its receiver and is unregistered from every symbol on disconnect.
// =============================================================================

use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::realtime::clock::MarketStatus;
use crate::realtime::quote::RealtimeQuote;

/// Tagged server→client envelope for the push channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEnvelope {
    Quote { data: RealtimeQuote },
    Status { data: MarketStatus },
    Error { message: String },
    Subscribed { data: Vec<String> },
    Unsubscribed { data: Vec<String> },
}

/// Opaque sink identity, one per connected client.
pub type SinkId = Uuid;

pub struct QuoteHub {
    subscribers: RwLock<HashMap<String, HashMap<SinkId, mpsc::Sender<PushEnvelope>>>>,
    buffer: usize,
}

impl QuoteHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            buffer: buffer.max(1),
        }
    }

    /// Allocate a sink for a new client connection. The receiver belongs to
    /// the client; the hub keeps only senders handed over via `subscribe`.
    pub fn register_sink(&self) -> (SinkId, mpsc::Sender<PushEnvelope>, mpsc::Receiver<PushEnvelope>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        (Uuid::new_v4(), tx, rx)
    }

    pub fn subscribe(&self, symbol: &str, sink_id: SinkId, sender: mpsc::Sender<PushEnvelope>) {
        let mut map = self.subscribers.write();
        map.entry(symbol.to_string())
            .or_default()
            .insert(sink_id, sender);
        debug!(%symbol, %sink_id, "sink subscribed");
    }

    pub fn unsubscribe(&self, symbol: &str, sink_id: &SinkId) {
        let mut map = self.subscribers.write();
        if let Some(sinks) = map.get_mut(symbol) {
            sinks.remove(sink_id);
            if sinks.is_empty() {
                map.remove(symbol);
            }
        }
        debug!(%symbol, %sink_id, "sink unsubscribed");
    }

    /// Drop a sink from every symbol (client disconnect).
    pub fn remove_sink(&self, sink_id: &SinkId) {
        let mut map = self.subscribers.write();
        map.retain(|_, sinks| {
            sinks.remove(sink_id);
            !sinks.is_empty()
        });
        info!(%sink_id, "sink removed from all symbols");
    }

    /// Union of subscribed symbols, sorted for deterministic batching.
    pub fn subscribed_symbols(&self) -> Vec<String> {
        self.subscribers
            .read()
            .keys()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Deliver a quote to every sink of its symbol. Returns how many sinks
    /// accepted it; full buffers drop silently.
    pub fn broadcast_quote(&self, quote: &RealtimeQuote) -> usize {
        let map = self.subscribers.read();
        let Some(sinks) = map.get(&quote.symbol) else {
            return 0;
        };

        let mut delivered = 0;
        for sender in sinks.values() {
            if sender
                .try_send(PushEnvelope::Quote { data: quote.clone() })
                .is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver the market status to every distinct sink once.
    pub fn broadcast_status(&self, status: &MarketStatus) -> usize {
        let map = self.subscribers.read();

        let mut seen: HashMap<SinkId, &mpsc::Sender<PushEnvelope>> = HashMap::new();
        for sinks in map.values() {
            for (id, sender) in sinks {
                seen.entry(*id).or_insert(sender);
            }
        }

        let mut delivered = 0;
        for sender in seen.values() {
            if sender
                .try_send(PushEnvelope::Status {
                    data: status.clone(),
                })
                .is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn sink_count(&self) -> usize {
        let map = self.subscribers.read();
        let mut ids = BTreeSet::new();
        for sinks in map.values() {
            ids.extend(sinks.keys().copied());
        }
        ids.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn quote(symbol: &str) -> RealtimeQuote {
        RealtimeQuote {
            symbol: symbol.to_string(),
            name: None,
            last: Some(dec!(585)),
            open: None,
            high: None,
            low: None,
            prev_close: None,
            change: None,
            change_percent: None,
            volume: 0,
            best_bid: None,
            best_ask: None,
            limit_up: None,
            limit_down: None,
            order_book: None,
            trade_time: None,
        }
    }

    #[tokio::test]
    async fn subscribe_then_broadcast_delivers() {
        let hub = QuoteHub::new(8);
        let (id, tx, mut rx) = hub.register_sink();
        hub.subscribe("2330", id, tx);

        assert_eq!(hub.broadcast_quote(&quote("2330")), 1);
        match rx.recv().await.unwrap() {
            PushEnvelope::Quote { data } => assert_eq!(data.symbol, "2330"),
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[tokio::test]
    async fn broadcast_only_reaches_that_symbol() {
        let hub = QuoteHub::new(8);
        let (id, tx, mut rx) = hub.register_sink();
        hub.subscribe("2317", id, tx);

        assert_eq!(hub.broadcast_quote(&quote("2330")), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_buffer_drops_instead_of_blocking() {
        let hub = QuoteHub::new(1);
        let (id, tx, _rx) = hub.register_sink();
        hub.subscribe("2330", id, tx);

        // First fills the buffer, second is dropped; neither blocks.
        assert_eq!(hub.broadcast_quote(&quote("2330")), 1);
        assert_eq!(hub.broadcast_quote(&quote("2330")), 0);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let hub = QuoteHub::new(8);
        let (id, tx, mut rx) = hub.register_sink();
        hub.subscribe("2330", id, tx);
        hub.unsubscribe("2330", &id);

        assert_eq!(hub.broadcast_quote(&quote("2330")), 0);
        assert!(rx.try_recv().is_err());
        assert!(hub.subscribed_symbols().is_empty());
    }

    #[tokio::test]
    async fn remove_sink_clears_every_symbol() {
        let hub = QuoteHub::new(8);
        let (id, tx, _rx) = hub.register_sink();
        hub.subscribe("2330", id, tx.clone());
        hub.subscribe("2317", id, tx);
        assert_eq!(hub.subscribed_symbols(), vec!["2317", "2330"]);

        hub.remove_sink(&id);
        assert!(hub.subscribed_symbols().is_empty());
        assert_eq!(hub.sink_count(), 0);
    }

    #[tokio::test]
    async fn cycle_delivers_status_then_quote() {
        let hub = QuoteHub::new(8);
        let (id, tx, mut rx) = hub.register_sink();
        hub.subscribe("2330", id, tx);

        // The broadcaster opens each cycle with a status, then the quotes.
        let status = crate::realtime::clock::current_market_status();
        hub.broadcast_status(&status);
        hub.broadcast_quote(&quote("2330"));

        assert!(matches!(
            rx.recv().await.unwrap(),
            PushEnvelope::Status { .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            PushEnvelope::Quote { .. }
        ));

        // After unsubscribing, a later cycle delivers nothing for the symbol.
        hub.unsubscribe("2330", &id);
        hub.broadcast_quote(&quote("2330"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn status_reaches_each_sink_once() {
        let hub = QuoteHub::new(8);
        let (id, tx, mut rx) = hub.register_sink();
        // Same sink on two symbols must still get one status.
        hub.subscribe("2330", id, tx.clone());
        hub.subscribe("2317", id, tx);

        let status = crate::realtime::clock::current_market_status();
        assert_eq!(hub.broadcast_status(&status), 1);

        assert!(matches!(
            rx.recv().await.unwrap(),
            PushEnvelope::Status { .. }
        ));
        assert!(rx.try_recv().is_err());
    }
}
