//! Demo quote providers for local runs
//!
//! Each provider reports a configured reference price with a small random
//! jitter, and one can be marked flaky to exercise the aggregator's
//! partial-failure path.

use anyhow::{bail, Result};
use async_trait::async_trait;
use rand::Rng;
use rust_decimal::Decimal;

use escrow_agent_logic::quotes::QuoteProvider;

pub struct JitterProvider {
    name: String,
    reference: Decimal,
    /// Jitter half-width in basis points of the reference price
    spread_bps: u32,
    flaky: bool,
}

impl JitterProvider {
    pub fn new(name: &str, reference: Decimal, spread_bps: u32, flaky: bool) -> Self {
        Self {
            name: name.to_string(),
            reference,
            spread_bps,
            flaky,
        }
    }
}

#[async_trait]
impl QuoteProvider for JitterProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn quote(&self, _pair: &str) -> Result<Decimal> {
        let offset_bps = {
            let mut rng = rand::thread_rng();
            if self.flaky && rng.gen_bool(0.3) {
                bail!("{} timed out", self.name);
            }
            rng.gen_range(-(self.spread_bps as i64)..=self.spread_bps as i64)
        };
        let jitter = self.reference * Decimal::from(offset_bps) / Decimal::from(10_000);
        Ok((self.reference + jitter).round_dp(6))
    }
}
