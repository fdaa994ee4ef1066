//! In-flight fetch registry
//!
//! At most one fetch runs per dedup key. The first caller to register a key
//! gets a [`FlightTicket`] and performs the fetch; later callers get a
//! [`PendingFetch`] on the same flight. The ticket publishes its result on a
//! `watch` channel and unregisters the key before doing so; dropping the
//! ticket also unregisters it, so a flight is released even when its task
//! fails or panics.

use super::LookupError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;

/// Outcome shared by every waiter of one flight
pub type FlightResult = Result<Arc<Vec<u8>>, LookupError>;

type FlightSlot = watch::Receiver<Option<FlightResult>>;

#[derive(Debug, Default, Clone)]
pub struct InFlightSet {
    flights: Arc<DashMap<String, FlightSlot>>,
}

/// Result of [`InFlightSet::try_register`]
#[derive(Debug)]
pub enum Registration {
    /// The caller owns the new flight
    Registered(FlightTicket),
    /// A fetch for the key is already running
    InFlight(PendingFetch),
}

impl InFlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically register `key` unless a flight for it already exists
    pub fn try_register(&self, key: &str) -> Registration {
        match self.flights.entry(key.to_string()) {
            Entry::Occupied(entry) => {
                Registration::InFlight(PendingFetch { rx: entry.get().clone() })
            }
            Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(None);
                entry.insert(rx.clone());
                Registration::Registered(FlightTicket {
                    key: key.to_string(),
                    slot: rx,
                    tx,
                    flights: Arc::clone(&self.flights),
                })
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.flights.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.flights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flights.is_empty()
    }
}

/// Ownership of one registered flight
#[derive(Debug)]
pub struct FlightTicket {
    key: String,
    slot: FlightSlot,
    tx: watch::Sender<Option<FlightResult>>,
    flights: Arc<DashMap<String, FlightSlot>>,
}

impl FlightTicket {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// A waiter on this flight
    pub fn subscribe(&self) -> PendingFetch {
        PendingFetch { rx: self.tx.subscribe() }
    }

    /// Release the key, then publish the result to every waiter
    pub fn complete(self, result: FlightResult) {
        self.release();
        self.tx.send_replace(Some(result));
    }

    /// Unregister the key unless a newer flight already took it over
    fn release(&self) {
        self.flights
            .remove_if(&self.key, |_, slot| slot.same_channel(&self.slot));
    }
}

impl Drop for FlightTicket {
    fn drop(&mut self) {
        self.release();
    }
}

/// Handle on a flight that may still be running
///
/// Dropping it or giving up on it never cancels the fetch.
#[derive(Debug, Clone)]
pub struct PendingFetch {
    rx: watch::Receiver<Option<FlightResult>>,
}

impl PendingFetch {
    /// Wait for the flight to finish
    pub async fn wait(&mut self) -> FlightResult {
        loop {
            let current = self.rx.borrow_and_update().clone();
            if let Some(result) = current {
                return result;
            }
            if self.rx.changed().await.is_err() {
                // Sender gone; it may still have published before dropping
                let last = self.rx.borrow().clone();
                return last.unwrap_or_else(|| {
                    Err(LookupError::NetworkFailure("fetch abandoned".to_string()))
                });
            }
        }
    }

    /// Wait until `deadline` at most; `None` means the flight is still running
    pub async fn try_wait_until(&mut self, deadline: Instant) -> Option<FlightResult> {
        tokio::time::timeout_at(deadline, self.wait()).await.ok()
    }
}
