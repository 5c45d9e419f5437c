//! Decoder for OCC-style option tickers as used in the daily flat files.
//!
//! Format: `O:` + underlying + `YYMMDD` + `C|P` + 8-digit strike in
//! thousandths of a dollar. The underlying has no fixed width and may carry
//! an adjustment digit (`ACB1` after a corporate action), so the fixed-width
//! suffix is parsed from the right and the underlying is whatever remains,
//! reduced to its letters.

use crate::domain::{OptionIdentity, OptionType};
use chrono::{Datelike, NaiveDate};
use thiserror::Error;

pub const OPTION_PREFIX: &str = "O:";

const DATE_LEN: usize = 6;
const TYPE_LEN: usize = 1;
const STRIKE_LEN: usize = 8;
const SUFFIX_LEN: usize = DATE_LEN + TYPE_LEN + STRIKE_LEN;

/// Why a ticker could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeErrorKind {
    #[error("missing 'O:' prefix")]
    MissingPrefix,

    #[error("body is {0} chars, need at least 16")]
    TooShort(usize),

    #[error("contains non-ASCII characters")]
    NonAscii,

    #[error("strike field is not 8 digits")]
    InvalidStrike,

    #[error("option type '{0}' is not C or P")]
    InvalidOptionType(char),

    #[error("expiration is not a valid YYMMDD date")]
    InvalidExpiration,

    #[error("no underlying symbol")]
    MissingUnderlying,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot decode option ticker '{ticker}': {kind}")]
pub struct DecodeError {
    pub ticker: String,
    pub kind: DecodeErrorKind,
}

/// Decode an option ticker into its structured identity.
pub fn decode_option_ticker(ticker: &str) -> Result<OptionIdentity, DecodeError> {
    let fail = |kind| DecodeError {
        ticker: ticker.to_string(),
        kind,
    };

    let body = ticker
        .strip_prefix(OPTION_PREFIX)
        .ok_or_else(|| fail(DecodeErrorKind::MissingPrefix))?;
    if !body.is_ascii() {
        return Err(fail(DecodeErrorKind::NonAscii));
    }
    if body.len() <= SUFFIX_LEN {
        return Err(fail(DecodeErrorKind::TooShort(body.len())));
    }

    let (raw_underlying, suffix) = body.split_at(body.len() - SUFFIX_LEN);
    let (date_field, rest) = suffix.split_at(DATE_LEN);
    let (type_field, strike_field) = rest.split_at(TYPE_LEN);

    let strike_thousandths =
        parse_digits(strike_field).ok_or_else(|| fail(DecodeErrorKind::InvalidStrike))?;

    let type_code = type_field.chars().next().unwrap_or(' ');
    let option_type = OptionType::from_code(type_code)
        .ok_or_else(|| fail(DecodeErrorKind::InvalidOptionType(type_code)))?;

    let expiration_date =
        parse_yymmdd(date_field).ok_or_else(|| fail(DecodeErrorKind::InvalidExpiration))?;

    let underlying_symbol: String = raw_underlying
        .chars()
        .map(|c| c.to_ascii_uppercase())
        .filter(char::is_ascii_uppercase)
        .collect();
    if underlying_symbol.is_empty() {
        return Err(fail(DecodeErrorKind::MissingUnderlying));
    }

    Ok(OptionIdentity {
        underlying_symbol,
        expiration_date,
        option_type,
        strike_thousandths,
    })
}

/// Build the canonical ticker for an identity. Inverse of
/// [`decode_option_ticker`] for identities whose underlying is plain letters
/// and whose expiration falls in 2000-2099.
pub fn encode_option_ticker(identity: &OptionIdentity) -> String {
    let exp = identity.expiration_date;
    format!(
        "{OPTION_PREFIX}{}{:02}{:02}{:02}{}{:08}",
        identity.underlying_symbol,
        exp.year().rem_euclid(100),
        exp.month(),
        exp.day(),
        identity.option_type.code(),
        identity.strike_thousandths,
    )
}

fn parse_digits(field: &str) -> Option<u32> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    field.parse().ok()
}

fn parse_yymmdd(field: &str) -> Option<NaiveDate> {
    if field.len() != DATE_LEN {
        return None;
    }
    let yy = parse_digits(&field[0..2])?;
    let mm = parse_digits(&field[2..4])?;
    let dd = parse_digits(&field[4..6])?;
    NaiveDate::from_ymd_opt(2000 + yy as i32, mm, dd)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn kind_of(ticker: &str) -> DecodeErrorKind {
        decode_option_ticker(ticker).unwrap_err().kind
    }

    #[test]
    fn decodes_standard_call() {
        let id = decode_option_ticker("O:AAPL210917C00145000").unwrap();
        assert_eq!(id.underlying_symbol, "AAPL");
        assert_eq!(id.expiration_date, d(2021, 9, 17));
        assert_eq!(id.option_type, OptionType::Call);
        assert_eq!(id.strike_price(), 145.0);
    }

    #[test]
    fn decodes_large_strike_put() {
        let id = decode_option_ticker("O:TSLA220121P01000000").unwrap();
        assert_eq!(id.underlying_symbol, "TSLA");
        assert_eq!(id.option_type, OptionType::Put);
        assert_eq!(id.strike_price(), 1000.0);
    }

    #[test]
    fn adjusted_underlying_keeps_letters_only() {
        let id = decode_option_ticker("O:ACB1260116C00001000").unwrap();
        assert_eq!(id.underlying_symbol, "ACB");
        assert_eq!(id.expiration_date, d(2026, 1, 16));
        assert_eq!(id.strike_price(), 1.0);

        let id = decode_option_ticker("O:AQMS1251017P00002500").unwrap();
        assert_eq!(id.underlying_symbol, "AQMS");
        assert_eq!(id.option_type, OptionType::Put);
        assert_eq!(id.strike_price(), 2.5);
    }

    #[test]
    fn short_underlyings() {
        assert_eq!(
            decode_option_ticker("O:A230616C00100000").unwrap().underlying_symbol,
            "A"
        );
        assert_eq!(
            decode_option_ticker("O:GM240315P00050000").unwrap().underlying_symbol,
            "GM"
        );
    }

    #[test]
    fn missing_prefix() {
        assert_eq!(kind_of("AAPL210917C00145000"), DecodeErrorKind::MissingPrefix);
    }

    #[test]
    fn too_short() {
        assert_eq!(kind_of("O:C00145000"), DecodeErrorKind::TooShort(9));
        assert_eq!(kind_of("O:210917C00145000"), DecodeErrorKind::TooShort(15));
    }

    #[test]
    fn short_strike_field() {
        assert_eq!(kind_of("O:AAPL210917C0014500"), DecodeErrorKind::InvalidStrike);
    }

    #[test]
    fn missing_type_char() {
        assert_eq!(
            kind_of("O:AAPL21091700145000"),
            DecodeErrorKind::InvalidOptionType('7')
        );
    }

    #[test]
    fn impossible_expiration() {
        assert_eq!(kind_of("O:AAPL211317C00145000"), DecodeErrorKind::InvalidExpiration);
        assert_eq!(kind_of("O:AAPL210230C00145000"), DecodeErrorKind::InvalidExpiration);
    }

    #[test]
    fn digits_only_underlying() {
        assert_eq!(kind_of("O:12210917C00145000"), DecodeErrorKind::MissingUnderlying);
    }

    #[test]
    fn non_ascii_rejected() {
        assert_eq!(kind_of("O:ÄAPL210917C00145000"), DecodeErrorKind::NonAscii);
    }

    #[test]
    fn error_message_names_ticker() {
        let err = decode_option_ticker("O:AAPL210917X00145000").unwrap_err();
        assert!(err.to_string().contains("O:AAPL210917X00145000"));
        assert!(err.to_string().contains("'X'"));
    }

    #[test]
    fn encode_matches_vendor_format() {
        let id = OptionIdentity {
            underlying_symbol: "SPY".into(),
            expiration_date: d(2024, 3, 15),
            option_type: OptionType::Put,
            strike_thousandths: 450_500,
        };
        assert_eq!(encode_option_ticker(&id), "O:SPY240315P00450500");
    }
}
