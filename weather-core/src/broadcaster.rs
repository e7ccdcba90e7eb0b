//! The weather broadcaster: selection state, inbound commands and the
//! periodic publish loop.

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    model::{CityTable, WeatherRecord},
    protocol::{self, Command, ParseError},
    transport::{InboundHandler, Transport},
};

/// What an inbound message did to the selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    Selected(String),
    UnknownCity(String),
    Malformed(ParseError),
    /// Not a command (e.g. our own `[DATA]` echo).
    Ignored,
}

/// Longest interval `run` accepts; longer ones are clamped to it.
pub const MAX_TICK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Shortest interval `run` accepts; shorter ones are clamped to it.
const MIN_TICK_INTERVAL: Duration = Duration::from_millis(1);

/// The two payloads published on every tick, and the city they describe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tick {
    pub city: String,
    pub data: String,
    pub cities: String,
}

#[derive(Debug)]
pub struct Broadcaster {
    table: CityTable,
    /// Index into `table`; always in range because the table never changes.
    selected: AtomicUsize,
    cities_payload: String,
}

impl Broadcaster {
    pub fn new(table: CityTable) -> Self {
        let cities_payload = protocol::encode_cities(&table);
        Self {
            table,
            selected: AtomicUsize::new(0),
            cities_payload,
        }
    }

    pub fn table(&self) -> &CityTable {
        &self.table
    }

    pub fn selected_city(&self) -> &str {
        &self.table.entry(self.selected.load(Ordering::Acquire)).name
    }

    pub fn selected_record(&self) -> &WeatherRecord {
        &self.table.entry(self.selected.load(Ordering::Acquire)).record
    }

    /// Applies a `[CITY] <name>` command.
    ///
    /// Unknown cities and malformed commands leave the selection untouched;
    /// they are logged, never returned as errors.
    pub fn handle_inbound(&self, raw: &str) -> InboundOutcome {
        let outcome = match protocol::parse_command(raw) {
            Ok(Some(Command::SelectCity(city))) => self.select(city),
            Ok(None) => InboundOutcome::Ignored,
            Err(err) => InboundOutcome::Malformed(err),
        };
        log_outcome(raw, &outcome);
        outcome
    }

    fn select(&self, city: &str) -> InboundOutcome {
        match self.table.position(city) {
            Some(idx) => {
                self.selected.store(idx, Ordering::Release);
                InboundOutcome::Selected(city.to_owned())
            }
            None => InboundOutcome::UnknownCity(city.to_owned()),
        }
    }

    /// Builds the payloads for the current selection.
    pub fn tick(&self) -> Tick {
        let entry = self.table.entry(self.selected.load(Ordering::Acquire));
        Tick {
            city: entry.name.clone(),
            data: protocol::encode_data(&entry.record),
            cities: self.cities_payload.clone(),
        }
    }

    /// Publishes one tick. Failures are logged and counted, never fatal.
    ///
    /// Returns the number of payloads that were handed to the transport.
    pub async fn publish_tick(&self, transport: &dyn Transport, topic: &str) -> usize {
        let tick = self.tick();
        let mut published = 0;

        for payload in [&tick.data, &tick.cities] {
            match transport.publish(topic, payload.as_bytes()).await {
                Ok(()) => published += 1,
                Err(err) => warn!(error = %err, payload = payload.trim_end(), "publish failed"),
            }
        }

        debug!(city = %tick.city, published, "tick");
        published
    }

    /// Publishes a tick every `every` until `cancel` fires.
    ///
    /// The first tick happens one interval after the call. `every` is clamped
    /// to between 1 ms and [`MAX_TICK_INTERVAL`]. Returns the number of ticks
    /// run.
    pub async fn run(
        &self,
        transport: &dyn Transport,
        topic: &str,
        every: Duration,
        cancel: &CancellationToken,
    ) -> u64 {
        let every = every.clamp(MIN_TICK_INTERVAL, MAX_TICK_INTERVAL);
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            city = self.selected_city(),
            interval_secs = every.as_secs_f64(),
            "broadcasting"
        );

        let mut ticks = 0;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.publish_tick(transport, topic).await;
                    ticks += 1;
                }
            }
        }

        info!(ticks, "broadcast loop stopped");
        ticks
    }
}

impl InboundHandler for Broadcaster {
    fn on_message(&self, topic: &str, payload: &[u8]) {
        match std::str::from_utf8(payload) {
            Ok(raw) => {
                self.handle_inbound(raw);
            }
            Err(_) => warn!(topic, bytes = payload.len(), "{}", ParseError::NotUtf8),
        }
    }
}

fn log_outcome(raw: &str, outcome: &InboundOutcome) {
    match outcome {
        InboundOutcome::Selected(city) => info!(city = %city, "selected city"),
        InboundOutcome::UnknownCity(city) => {
            warn!(city = %city, "city is not in the table, keeping current selection")
        }
        InboundOutcome::Malformed(err) => {
            warn!(error = %err, message = raw.trim_end(), "ignoring malformed command")
        }
        InboundOutcome::Ignored => {}
    }
}
