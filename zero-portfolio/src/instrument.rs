//! Symbol ↔ instrument reference cache.
//!
//! Brokers address securities by an opaque instrument reference, while
//! strategies and the ledger speak in tickers. The cache keeps a bounded
//! bijection between the two and evicts the least frequently used symbol,
//! where frequency is `count / age`: hits on the key divided by cache calls
//! since the key was inserted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use crate::broker::{Broker, InstrumentRef};

/// Usage counters for one cached symbol
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct KeyStats {
    /// Successful calls that touched the key
    pub count: u64,
    /// Successful calls since the key was inserted
    pub age: u64,
}

impl KeyStats {
    /// Eviction rank, lowest goes first
    pub fn frequency(&self) -> f64 {
        if self.age == 0 {
            0.0
        } else {
            self.count as f64 / self.age as f64
        }
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    forward: HashMap<String, InstrumentRef>,
    backward: HashMap<InstrumentRef, String>,
    stats: HashMap<String, KeyStats>,
}

impl CacheInner {
    fn insert(&mut self, symbol: &str, instrument: InstrumentRef) {
        if let Some(old) = self.forward.insert(symbol.to_string(), instrument.clone()) {
            self.backward.remove(&old);
        }
        if let Some(old_symbol) = self.backward.insert(instrument, symbol.to_string()) {
            if old_symbol != symbol {
                self.forward.remove(&old_symbol);
                self.stats.remove(&old_symbol);
            }
        }
        self.stats.entry(symbol.to_string()).or_default();
    }

    /// Count a successful call on `symbol` and evict if over capacity.
    fn touch(&mut self, symbol: &str, capacity: usize) -> Option<String> {
        for stats in self.stats.values_mut() {
            stats.age += 1;
        }
        if let Some(stats) = self.stats.get_mut(symbol) {
            stats.count += 1;
        }

        if self.forward.len() <= capacity {
            return None;
        }

        let victim = self
            .stats
            .iter()
            .filter(|(key, _)| key.as_str() != symbol)
            .min_by(|(ka, a), (kb, b)| {
                a.frequency()
                    .total_cmp(&b.frequency())
                    .then_with(|| ka.cmp(kb))
            })
            .map(|(key, _)| key.clone())?;

        if let Some(instrument) = self.forward.remove(&victim) {
            self.backward.remove(&instrument);
        }
        self.stats.remove(&victim);
        Some(victim)
    }
}

/// Bounded symbol ↔ instrument cache in front of a broker
pub struct SymbolInstrumentCache {
    broker: Arc<dyn Broker>,
    capacity: usize,
    ref_prefix: String,
    inner: Mutex<CacheInner>,
}

impl SymbolInstrumentCache {
    /// Create a cache holding at most `capacity` symbols.
    ///
    /// Queries starting with `ref_prefix` are treated as instrument references.
    pub fn new(broker: Arc<dyn Broker>, capacity: usize, ref_prefix: impl Into<String>) -> Self {
        Self {
            broker,
            capacity: capacity.max(1),
            ref_prefix: ref_prefix.into(),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_instrument(&self, query: &str) -> bool {
        !self.ref_prefix.is_empty() && query.starts_with(&self.ref_prefix)
    }

    /// Translate a symbol to its instrument reference or the reverse.
    ///
    /// Returns `None` when the broker cannot resolve the query; the cache is
    /// left untouched in that case.
    pub async fn resolve(&self, query: &str) -> Option<String> {
        if self.is_instrument(query) {
            self.symbol_for(&InstrumentRef::new(query)).await
        } else {
            self.instrument_for(query)
                .await
                .map(|instrument| instrument.as_str().to_string())
        }
    }

    /// Instrument reference for a symbol
    pub async fn instrument_for(&self, symbol: &str) -> Option<InstrumentRef> {
        let cached = self.lock().forward.get(symbol).cloned();

        let instrument = match cached {
            Some(instrument) => instrument,
            None => match self.broker.instrument_lookup(symbol).await {
                Ok(instrument) => {
                    self.lock().insert(symbol, instrument.clone());
                    instrument
                }
                Err(e) => {
                    warn!(symbol, error = %e, "Instrument lookup failed");
                    return None;
                }
            },
        };

        self.record_hit(symbol);
        Some(instrument)
    }

    /// Symbol for an instrument reference
    pub async fn symbol_for(&self, instrument: &InstrumentRef) -> Option<String> {
        let cached = self.lock().backward.get(instrument).cloned();

        let symbol = match cached {
            Some(symbol) => symbol,
            None => match self.broker.reverse_instrument_lookup(instrument).await {
                Ok(symbol) => {
                    self.lock().insert(&symbol, instrument.clone());
                    symbol
                }
                Err(e) => {
                    warn!(instrument = %instrument, error = %e, "Reverse instrument lookup failed");
                    return None;
                }
            },
        };

        self.record_hit(&symbol);
        Some(symbol)
    }

    fn record_hit(&self, symbol: &str) {
        if let Some(evicted) = self.lock().touch(symbol, self.capacity) {
            debug!(evicted = %evicted, "Evicted instrument cache entry");
        }
    }

    /// Number of cached symbols
    pub fn len(&self) -> usize {
        self.lock().forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_symbol(&self, symbol: &str) -> bool {
        self.lock().forward.contains_key(symbol)
    }

    /// Usage counters for a cached symbol
    pub fn stats(&self, symbol: &str) -> Option<KeyStats> {
        self.lock().stats.get(symbol).copied()
    }
}

// ============================================================================
// Tests
// ============================================================================
