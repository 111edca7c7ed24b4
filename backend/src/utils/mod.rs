//! # Utilities Module
//!
//! Formatting and unit-conversion helpers used across the service.
//!
//! ## Units
//!
//! | Asset | On-chain decimals |
//! |-------|-------------------|
//! | Vault shares | 18 |
//! | USDC | 6 |

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

/// Decimals of Enzyme vault shares.
pub const SHARE_DECIMALS: u32 = 18;

/// Decimals of USDC.
pub const USDC_DECIMALS: u32 = 6;

/// Convert a decimal amount into on-chain integer units.
///
/// Fractions below one unit are truncated toward zero. Returns `None`
/// for negative amounts or on overflow.
///
/// ## Examples
///
/// ```rust,ignore
/// assert_eq!(to_base_units(dec!(10.5), SHARE_DECIMALS), Some(10_500_000_000_000_000_000));
/// assert_eq!(to_base_units(dec!(1.5), USDC_DECIMALS), Some(1_500_000));
/// ```
pub fn to_base_units(amount: Decimal, decimals: u32) -> Option<u128> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return None;
    }
    let scale = Decimal::from(10u64.checked_pow(decimals)?);
    amount.checked_mul(scale)?.trunc().to_u128()
}

/// Convert on-chain integer units into a decimal amount.
///
/// Returns `None` when the value does not fit a 96-bit decimal mantissa.
pub fn from_base_units(raw: u128, decimals: u32) -> Option<Decimal> {
    let raw = i128::try_from(raw).ok()?;
    Decimal::try_from_i128_with_scale(raw, decimals)
        .ok()
        .map(|d| d.normalize())
}

/// Format a USD value like the dashboard does: `$1,234.57`.
///
/// Missing values render as `$—`.
pub fn format_usd(value: Option<Decimal>) -> String {
    let value = match value {
        Some(v) => v,
        None => return "$—".to_string(),
    };

    let rounded = value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    let negative = rounded.is_sign_negative() && !rounded.is_zero();
    let abs = rounded.abs();

    let whole = abs.trunc();
    let cents = ((abs - whole) * Decimal::from(100)).to_u64().unwrap_or(0);

    // Add commas
    let whole_str = whole.to_string();
    let mut result = String::new();
    for (i, c) in whole_str.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    let grouped: String = result.chars().rev().collect();

    format!("{}${}.{:02}", if negative { "-" } else { "" }, grouped, cents)
}

/// Format a percentage with an explicit sign: `+12.00%`.
///
/// Missing values render as `—%`.
pub fn format_percent(value: Option<Decimal>) -> String {
    match value {
        Some(v) => {
            let rounded = v.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
            let sign = if rounded.is_sign_negative() && !rounded.is_zero() { "" } else { "+" };
            format!("{}{:.2}%", sign, rounded)
        }
        None => "—%".to_string(),
    }
}

/// Format the time left until a redemption unlocks.
///
/// `Ready!` once elapsed, `Hh Mm` for an hour or more, otherwise `Mm Ss`.
pub fn format_countdown(remaining_ms: i64) -> String {
    if remaining_ms <= 0 {
        return "Ready!".to_string();
    }
    let total_seconds = remaining_ms / 1000;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m {}s", minutes, seconds)
    }
}

/// Shorten a wallet address for display: `0x1234...abcd`.
pub fn short_address(address: &str) -> String {
    if address.len() <= 10 || !address.is_char_boundary(6) || !address.is_char_boundary(address.len() - 4) {
        return address.to_string();
    }
    format!("{}...{}", &address[..6], &address[address.len() - 4..])
}

/// Normalize a wallet address.
///
/// Returns the lowercase `0x`-prefixed form used as cache key and on
/// the record store wire format.
pub fn normalize_address(address: &str) -> Result<String, String> {
    let parsed: alloy_primitives::Address = address
        .trim()
        .parse()
        .map_err(|e| format!("Invalid wallet address {}: {}", address, e))?;
    Ok(parsed.to_string().to_lowercase())
}

/// Format a timestamp as ISO 8601.
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_to_base_units() {
        assert_eq!(
            to_base_units(dec("10.5"), SHARE_DECIMALS),
            Some(10_500_000_000_000_000_000)
        );
        assert_eq!(to_base_units(dec("1.5"), USDC_DECIMALS), Some(1_500_000));
        // Sub-unit dust is truncated
        assert_eq!(to_base_units(dec("0.0000019"), USDC_DECIMALS), Some(1));
        assert_eq!(to_base_units(Decimal::ZERO, USDC_DECIMALS), Some(0));
        assert_eq!(to_base_units(dec("-1"), USDC_DECIMALS), None);
    }

    #[test]
    fn test_from_base_units() {
        assert_eq!(
            from_base_units(10_500_000_000_000_000_000, SHARE_DECIMALS),
            Some(dec("10.5"))
        );
        assert_eq!(from_base_units(1_234_567, USDC_DECIMALS), Some(dec("1.234567")));
        assert_eq!(from_base_units(0, USDC_DECIMALS), Some(Decimal::ZERO));
    }

    #[test]
    fn test_format_usd() {
        assert_eq!(format_usd(Some(dec("1234.567"))), "$1,234.57");
        assert_eq!(format_usd(Some(dec("0.5"))), "$0.50");
        assert_eq!(format_usd(Some(dec("1000000"))), "$1,000,000.00");
        assert_eq!(format_usd(Some(dec("-12.3"))), "-$12.30");
        assert_eq!(format_usd(None), "$—");
    }

    #[test]
    fn test_format_percent() {
        assert_eq!(format_percent(Some(dec("12"))), "+12.00%");
        assert_eq!(format_percent(Some(dec("-0.456"))), "-0.46%");
        assert_eq!(format_percent(Some(Decimal::ZERO)), "+0.00%");
        assert_eq!(format_percent(None), "—%");
    }

    #[test]
    fn test_format_countdown() {
        assert_eq!(format_countdown(0), "Ready!");
        assert_eq!(format_countdown(-5), "Ready!");
        assert_eq!(format_countdown(120_000), "2m 0s");
        assert_eq!(format_countdown(59_999), "0m 59s");
        assert_eq!(format_countdown(3_660_000), "1h 1m");
    }

    #[test]
    fn test_short_address() {
        assert_eq!(
            short_address("0xAAbbccddeeff00112233445566778899aabbccdd"),
            "0xAAbb...ccdd"
        );
        assert_eq!(short_address("0x1234"), "0x1234");
    }

    #[test]
    fn test_normalize_address() {
        assert_eq!(
            normalize_address("0xAF88d065e77c8cC2239327C5EDb3A432268e5831").unwrap(),
            "0xaf88d065e77c8cc2239327c5edb3a432268e5831"
        );
        assert!(normalize_address("0x1234").is_err());
    }
}
