//! Option contract identity decoded from a vendor ticker.

use super::bar::RawBar;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    pub fn from_code(code: char) -> Option<Self> {
        match code {
            'C' => Some(OptionType::Call),
            'P' => Some(OptionType::Put),
            _ => None,
        }
    }

    /// Single-letter code used in tickers and in the options table.
    pub fn code(self) -> char {
        match self {
            OptionType::Call => 'C',
            OptionType::Put => 'P',
        }
    }
}

impl fmt::Display for OptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Structured fields of an option contract.
///
/// The strike is kept in thousandths of a dollar so equality and hashing are
/// exact; `strike_price()` gives the decimal value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OptionIdentity {
    pub underlying_symbol: String,
    pub expiration_date: NaiveDate,
    pub option_type: OptionType,
    pub strike_thousandths: u32,
}

impl OptionIdentity {
    pub fn strike_price(&self) -> f64 {
        f64::from(self.strike_thousandths) / 1000.0
    }
}

/// A RawBar for an option contract together with its decoded identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionBar {
    pub bar: RawBar,
    pub identity: OptionIdentity,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strike_price_is_exact_to_three_decimals() {
        let id = OptionIdentity {
            underlying_symbol: "AQMS".into(),
            expiration_date: NaiveDate::from_ymd_opt(2025, 10, 17).unwrap(),
            option_type: OptionType::Put,
            strike_thousandths: 2_500,
        };
        assert_eq!(id.strike_price(), 2.5);
    }

    #[test]
    fn option_type_codes() {
        assert_eq!(OptionType::from_code('C'), Some(OptionType::Call));
        assert_eq!(OptionType::from_code('P'), Some(OptionType::Put));
        assert_eq!(OptionType::from_code('X'), None);
        assert_eq!(OptionType::Put.code(), 'P');
    }
}
