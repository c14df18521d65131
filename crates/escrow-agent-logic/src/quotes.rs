//! Display price quotes aggregated across providers
//!
//! Quotes are informational only. Settlement amounts always come from the
//! negotiated price, never from here.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::join_all;
use rust_decimal::Decimal;
use tracing::warn;

#[async_trait]
pub trait QuoteProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn quote(&self, pair: &str) -> Result<Decimal>;
}

/// Queries all providers concurrently and reconciles disagreement by median.
pub struct QuoteService {
    providers: Vec<Arc<dyn QuoteProvider>>,
}

impl QuoteService {
    pub fn new(providers: Vec<Arc<dyn QuoteProvider>>) -> Self {
        Self { providers }
    }

    /// Median of the successful provider responses. Refuses to quote when
    /// no provider answered rather than serving a stale or invented price.
    pub async fn quote(&self, pair: &str) -> Result<Decimal> {
        let responses = join_all(self.providers.iter().map(|p| p.quote(pair))).await;

        let mut prices = Vec::with_capacity(responses.len());
        for (provider, response) in self.providers.iter().zip(responses) {
            match response {
                Ok(price) => prices.push(price),
                Err(e) => warn!("Quote provider {} failed for {}: {}", provider.name(), pair, e),
            }
        }

        median(&mut prices).ok_or_else(|| anyhow!("No quote available for {}", pair))
    }
}

/// Median; mean of the middle two on even counts. Sorts in place.
fn median(values: &mut [Decimal]) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    values.sort();
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        Some((values[mid - 1] + values[mid]) / Decimal::TWO)
    }
}
