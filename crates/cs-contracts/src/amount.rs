//! 18-decimal fixed point helpers. Division truncates; multiplication is
//! checked and overflow is reported as `AmountOverflow`.

use alloy_primitives::{Address, U256};
use cs_api_types::DashboardError;

pub const DECIMALS: u8 = 18;

/// `10^decimals`.
pub fn unit(decimals: u8) -> U256 {
    U256::from(10_u64).pow(U256::from(decimals))
}

pub fn checked_mul(a: U256, b: U256) -> Result<U256, DashboardError> {
    a.checked_mul(b).ok_or(DashboardError::AmountOverflow)
}

/// Native coin to send for a stablecoin-denominated amount at `rate`
/// stablecoin per native coin (both 18 decimals).
pub fn native_for_stable(amount: U256, rate: U256) -> Result<U256, DashboardError> {
    if rate.is_zero() {
        return Err(DashboardError::UnknownBackendError(
            "exchange rate reported as zero".to_owned(),
        ));
    }
    Ok(checked_mul(amount, unit(DECIMALS))? / rate)
}

/// Parses a decimal string such as `"12.5"` into base units.
pub fn parse_units(text: &str, decimals: u8) -> Result<U256, DashboardError> {
    let invalid = || DashboardError::InvalidAmount(text.to_owned());
    let trimmed = text.trim();
    let (whole, fraction) = match trimmed.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (trimmed, ""),
    };

    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid());
    }
    if fraction.len() > usize::from(decimals) {
        return Err(invalid());
    }

    let ten = U256::from(10_u64);
    let mut value = U256::ZERO;
    let padding = usize::from(decimals) - fraction.len();
    let digits = whole
        .chars()
        .chain(fraction.chars())
        .chain(std::iter::repeat_n('0', padding));
    for ch in digits {
        let digit = ch.to_digit(10).ok_or_else(invalid)?;
        value = value
            .checked_mul(ten)
            .and_then(|v| v.checked_add(U256::from(digit)))
            .ok_or(DashboardError::AmountOverflow)?;
    }
    Ok(value)
}

/// Renders base units with at most `precision` fractional digits, cutting
/// off (never rounding) the rest.
pub fn format_units(value: U256, decimals: u8, precision: u8) -> String {
    let scale = unit(decimals);
    let whole = value / scale;
    let precision = precision.min(decimals);
    if precision == 0 {
        return whole.to_string();
    }

    let fraction = format!("{:0>width$}", (value % scale).to_string(), width = usize::from(decimals));
    format!("{whole}.{}", &fraction[..usize::from(precision)])
}

/// `0x1234...abcd` from the checksummed form.
pub fn short_address(address: &Address) -> String {
    let full = address.to_checksum(None);
    format!("{}...{}", &full[..6], &full[full.len() - 4..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    #[test]
    fn parse_units_accepts_plain_decimals() -> Result<(), DashboardError> {
        assert_eq!(parse_units("1", 18)?, unit(18));
        assert_eq!(parse_units(" 0.5 ", 18)?, unit(18) / U256::from(2));
        assert_eq!(parse_units("12.", 2)?, U256::from(1200));
        assert_eq!(parse_units(".25", 2)?, U256::from(25));
        Ok(())
    }

    #[test]
    fn parse_units_rejects_garbage_and_excess_precision() {
        for input in ["", ".", "-1", "1e18", "1.2.3", "abc", "0.001"] {
            assert_eq!(
                parse_units(input, 2),
                Err(DashboardError::InvalidAmount(input.to_owned())),
                "{input:?}"
            );
        }
        let huge = "9".repeat(90);
        assert_eq!(parse_units(&huge, 18), Err(DashboardError::AmountOverflow));
    }

    #[test]
    fn format_units_truncates() {
        let value = parse_units("1234.567891", 18).unwrap_or_default();
        assert_eq!(format_units(value, 18, 4), "1234.5678");
        assert_eq!(format_units(value, 18, 0), "1234");
        assert_eq!(format_units(U256::from(1), 18, 4), "0.0000");
        assert_eq!(format_units(U256::ZERO, 18, 2), "0.00");
    }

    #[test]
    fn native_amount_uses_rate_and_refuses_zero() -> Result<(), DashboardError> {
        // 300 stablecoin per native coin; 150 stablecoin buys half a coin.
        let rate = parse_units("300", 18)?;
        let amount = parse_units("150", 18)?;
        assert_eq!(native_for_stable(amount, rate)?, unit(18) / U256::from(2));
        assert!(matches!(
            native_for_stable(amount, U256::ZERO),
            Err(DashboardError::UnknownBackendError(_))
        ));
        assert_eq!(
            native_for_stable(U256::MAX, rate),
            Err(DashboardError::AmountOverflow)
        );
        Ok(())
    }

    #[test]
    fn short_address_keeps_checksum_ends() {
        let addr = address!("0x45CbCA5f88c510526049F31cECeF626Eb5254784");
        assert_eq!(short_address(&addr), "0x45Cb...4784");
    }
}
