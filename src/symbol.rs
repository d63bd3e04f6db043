// =============================================================================
// Symbol Canonicalization — Taiwan equity tickers
// =============================================================================
//
// Canonical form: four ASCII digits ("2330"). Input and user-visible output
// may carry a market suffix (".TW" for TWSE listings, ".TWO" for the OTC
// board); storage and joins always use the stripped core.
// =============================================================================

use crate::errors::CoreError;

/// Strip a recognised market suffix, if any.
fn strip_suffix(symbol: &str) -> &str {
    symbol
        .strip_suffix(".TWO")
        .or_else(|| symbol.strip_suffix(".TW"))
        .unwrap_or(symbol)
}

/// Validate `input` against the canonical pattern and return the stripped
/// 4-digit core.
///
/// Accepted: `2330`, `2330.TW`, `6488.TWO`. Everything else is a
/// `Validation` error.
pub fn canonicalize(input: &str) -> Result<String, CoreError> {
    let core = strip_suffix(input.trim());

    if core.len() == 4 && core.bytes().all(|b| b.is_ascii_digit()) {
        Ok(core.to_string())
    } else {
        Err(CoreError::validation(format!(
            "invalid symbol '{input}': expected 4 digits with optional .TW/.TWO suffix"
        )))
    }
}

/// `true` when `input` already satisfies the canonical pattern.
pub fn is_valid(input: &str) -> bool {
    canonicalize(input).is_ok()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_four_digits() {
        assert_eq!(canonicalize("2330").unwrap(), "2330");
        assert_eq!(canonicalize("0050").unwrap(), "0050");
    }

    #[test]
    fn suffixes_stripped() {
        assert_eq!(canonicalize("2330.TW").unwrap(), "2330");
        assert_eq!(canonicalize("6488.TWO").unwrap(), "6488");
    }

    #[test]
    fn whitespace_trimmed() {
        assert_eq!(canonicalize("  2317 ").unwrap(), "2317");
    }

    #[test]
    fn rejects_malformed() {
        for bad in ["", "233", "23305", "ABCD", "2330.US", "23.TW", "２３３０"] {
            assert!(canonicalize(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn is_valid_matches_canonicalize() {
        assert!(is_valid("2330.TW"));
        assert!(!is_valid("tsmc"));
    }
}
