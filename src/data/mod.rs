//! Market data sources feeding the engine.

use std::collections::VecDeque;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::models::MarketEvent;

/// Time-ordered producer of market events. `None` means the stream ended.
#[async_trait]
pub trait DataProvider: Send {
    async fn next_event(&mut self) -> Result<Option<MarketEvent>>;
}

/// Finite, in-memory history replayed in timestamp order.
#[derive(Debug, Clone, Default)]
pub struct HistoricalDataProvider {
    events: VecDeque<MarketEvent>,
}

impl HistoricalDataProvider {
    /// Build from events in any order; they are sorted by timestamp (stable).
    pub fn from_events(mut events: Vec<MarketEvent>) -> Self {
        events.sort_by_key(MarketEvent::timestamp);
        Self {
            events: events.into(),
        }
    }

    /// Load a JSON-lines file, one `MarketEvent` per line. Blank lines and
    /// `#` comments are skipped.
    pub fn from_json_lines(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read market data from {}", path.display()))?;

        let events = parse_json_lines(&contents)
            .with_context(|| format!("Invalid market data in {}", path.display()))?;
        info!(path = %path.display(), events = events.len(), "Loaded historical market data");

        Ok(Self::from_events(events))
    }

    /// Keep only the most recent `n` events.
    pub fn keep_last(mut self, n: usize) -> Self {
        let excess = self.events.len().saturating_sub(n);
        self.events.drain(..excess);
        self
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.events.front().map(MarketEvent::timestamp)
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.events.back().map(MarketEvent::timestamp)
    }
}

#[async_trait]
impl DataProvider for HistoricalDataProvider {
    async fn next_event(&mut self) -> Result<Option<MarketEvent>> {
        Ok(self.events.pop_front())
    }
}

/// Parse JSON-lines market data.
pub fn parse_json_lines(contents: &str) -> Result<Vec<MarketEvent>> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(idx, line)| {
            serde_json::from_str(line).with_context(|| format!("line {}", idx + 1))
        })
        .collect()
}
