//! Basis-point fee arithmetic matching the escrow contract exactly
//!
//! The contract computes everything in integer base units (6 decimal places)
//! with floor division at a 10,000 denominator. Reproducing that bit-for-bit
//! is settlement-critical: a one-unit rounding difference between the bot's
//! displayed breakdown and the contract's payout would surface as a
//! reconciliation mismatch. All math here is `u128`, never floating point.
//!
//! Order of operations is fee-then-split: the fee pool is derived from the
//! base amount first, and only then divided into operator/receiver shares.
//! Splitting each side's fee separately would drift by up to one unit.

use anyhow::{anyhow, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Fixed-point fee denominator: 1 bps = 0.01%
pub const BPS_DENOMINATOR: u128 = 10_000;

/// Amount scale: base units per whole token (6 decimal places)
pub const AMOUNT_SCALE: u32 = 6;
const AMOUNT_UNIT: u128 = 1_000_000;

/// floor(amount * num / den) without intermediate overflow.
///
/// Decomposes amount = q*den + r, so the only multiplication that can grow
/// is r*num with r < den — safe for any den/num pair up to 2^64.
fn mul_div_floor(amount: u128, num: u128, den: u128) -> u128 {
    let q = amount / den;
    let r = amount % den;
    q * num + (r * num) / den
}

/// Total the buyer pays: floor(base * (1 + fee_bps/10000))
pub fn buyer_total(base: u128, fee_bps: u32) -> u128 {
    mul_div_floor(base, BPS_DENOMINATOR + fee_bps as u128, BPS_DENOMINATOR)
}

/// Amount the seller receives: floor(base * (1 - fee_bps/10000))
pub fn seller_payout(base: u128, fee_bps: u32) -> u128 {
    mul_div_floor(base, BPS_DENOMINATOR - fee_bps as u128, BPS_DENOMINATOR)
}

/// The full fee pool: buyer premium plus seller discount
pub fn fee_pool(base: u128, fee_bps: u32) -> u128 {
    buyer_total(base, fee_bps) - seller_payout(base, fee_bps)
}

/// Split a fee pool into (operator, receiver) shares.
///
/// Operator share is floored; the receiver takes the remainder so no unit
/// of the pool is lost.
pub fn split_fee_pool(pool: u128, operator_share_bps: u32) -> (u128, u128) {
    let operator = mul_div_floor(pool, operator_share_bps as u128, BPS_DENOMINATOR);
    (operator, pool - operator)
}

/// Full settlement breakdown for display and reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementBreakdown {
    pub base: u128,
    pub fee_bps: u32,
    pub buyer_total: u128,
    pub seller_payout: u128,
    pub fee_pool: u128,
    pub operator_share: u128,
    pub receiver_share: u128,
}

pub fn settlement_breakdown(base: u128, fee_bps: u32, operator_share_bps: u32) -> SettlementBreakdown {
    let buyer = buyer_total(base, fee_bps);
    let seller = seller_payout(base, fee_bps);
    let pool = buyer - seller;
    let (operator, receiver) = split_fee_pool(pool, operator_share_bps);
    SettlementBreakdown {
        base,
        fee_bps,
        buyer_total: buyer,
        seller_payout: seller,
        fee_pool: pool,
        operator_share: operator,
        receiver_share: receiver,
    }
}

impl SettlementBreakdown {
    /// Human-readable breakdown for the status message
    pub fn render(&self) -> String {
        format!(
            "base {} | buyer pays {} | seller receives {} | fee {} ({} bps: operator {}, receiver {})",
            format_base_units(self.base),
            format_base_units(self.buyer_total),
            format_base_units(self.seller_payout),
            format_base_units(self.fee_pool),
            self.fee_bps,
            format_base_units(self.operator_share),
            format_base_units(self.receiver_share),
        )
    }
}

/// Convert a user-facing decimal amount to integer base units.
///
/// Rejects negatives and amounts with more than 6 decimal places — the
/// contract has no representation for them, so truncating silently here
/// would diverge from what gets settled.
pub fn to_base_units(amount: Decimal) -> Result<u128> {
    if amount.is_sign_negative() {
        return Err(anyhow!("Amount must not be negative: {}", amount));
    }
    let scaled = amount
        .checked_mul(Decimal::from(AMOUNT_UNIT))
        .ok_or_else(|| anyhow!("Amount out of range: {}", amount))?;
    if scaled.fract() != Decimal::ZERO {
        return Err(anyhow!(
            "Amount {} has more than {} decimal places",
            amount,
            AMOUNT_SCALE
        ));
    }
    scaled
        .trunc()
        .to_u128()
        .ok_or_else(|| anyhow!("Amount out of range: {}", amount))
}

/// Render base units as a fixed 6-decimal string (the contract's display form)
pub fn format_base_units(units: u128) -> String {
    format!("{}.{:06}", units / AMOUNT_UNIT, units % AMOUNT_UNIT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::str::FromStr;

    #[test]
    fn test_breakdown_exact_reference_case() {
        // base 1.000000 at 250 bps: buyer 1.025000, seller 0.975000, exact
        let base = to_base_units(Decimal::from_str("1.000000").unwrap()).unwrap();
        assert_eq!(base, 1_000_000);
        assert_eq!(buyer_total(base, 250), 1_025_000);
        assert_eq!(seller_payout(base, 250), 975_000);
        assert_eq!(format_base_units(buyer_total(base, 250)), "1.025000");
        assert_eq!(format_base_units(seller_payout(base, 250)), "0.975000");
    }

    #[test]
    fn test_floor_on_inexact_division() {
        // 0.999999 * 250 bps = 24999.975 units -> floors both directions
        let base = 999_999u128;
        assert_eq!(buyer_total(base, 250), 1_024_998);
        assert_eq!(seller_payout(base, 250), 974_999);
        assert_eq!(fee_pool(base, 250), 49_999);
    }

    #[test]
    fn test_split_preserves_pool() {
        let pool = 49_999u128;
        let (operator, receiver) = split_fee_pool(pool, 3_000);
        assert_eq!(operator, 14_999); // floor(49999 * 0.3)
        assert_eq!(operator + receiver, pool);
    }

    #[test]
    fn test_fee_then_split_order() {
        // Splitting each side's fee separately would lose a unit vs.
        // pooling first — the breakdown must pool first.
        let b = settlement_breakdown(999_999, 250, 5_000);
        assert_eq!(b.fee_pool, 49_999);
        assert_eq!(b.operator_share, 24_999);
        assert_eq!(b.receiver_share, 25_000);
        assert_eq!(b.operator_share + b.receiver_share, b.fee_pool);
    }

    #[test]
    fn test_zero_base_and_zero_fee() {
        assert_eq!(buyer_total(0, 250), 0);
        assert_eq!(seller_payout(0, 250), 0);
        assert_eq!(buyer_total(12_345, 0), 12_345);
        assert_eq!(seller_payout(12_345, 0), 12_345);
    }

    #[test]
    fn test_to_base_units_validation() {
        assert_eq!(
            to_base_units(Decimal::from_str("10.00").unwrap()).unwrap(),
            10_000_000
        );
        assert!(to_base_units(Decimal::from_str("-1").unwrap()).is_err());
        assert!(to_base_units(Decimal::from_str("0.0000001").unwrap()).is_err());
    }

    proptest! {
        #[test]
        fn prop_buyer_bounds(base in 0u128..=10u128.pow(24), bps in 0u32..=BPS_DENOMINATOR as u32) {
            prop_assert!(buyer_total(base, bps) >= base);
            prop_assert!(seller_payout(base, bps) <= base);
        }

        #[test]
        fn prop_floor_inversion_stable(base in 0u128..=10u128.pow(24), bps in 0u32..=2_000u32) {
            // Inverting the buyer-total formula at the integer level and
            // reapplying it lands on the same total (floor-aware stability).
            let total = buyer_total(base, bps);
            let inverted = mul_div_floor(total, BPS_DENOMINATOR, BPS_DENOMINATOR + bps as u128);
            prop_assert!(inverted <= base);
            prop_assert!(buyer_total(inverted, bps) <= total);
        }

        #[test]
        fn prop_split_conserves(pool in 0u128..=10u128.pow(24), share in 0u32..=BPS_DENOMINATOR as u32) {
            let (op, recv) = split_fee_pool(pool, share);
            prop_assert_eq!(op + recv, pool);
            prop_assert!(op <= pool);
        }
    }
}
