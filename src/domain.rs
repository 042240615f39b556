use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{TradingError, TradingResult};

/// Kalshi charges 15% of profit on winning contracts, minimum 1 cent.
pub const KALSHI_FEE_RATE: f64 = 0.15;
pub const MIN_FEE_CENTS: i64 = 1;

/// The four cities with daily-high temperature markets.
///
/// Variant order is alphabetical by code so that derived `Ord` matches
/// lexicographic city-code ordering (per-city processing is sorted).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum City {
    Aus,
    Chi,
    Mia,
    Nyc,
}

impl City {
    pub const ALL: [City; 4] = [City::Aus, City::Chi, City::Mia, City::Nyc];

    pub fn as_str(&self) -> &'static str {
        match self {
            City::Aus => "AUS",
            City::Chi => "CHI",
            City::Mia => "MIA",
            City::Nyc => "NYC",
        }
    }
}

impl FromStr for City {
    type Err = TradingError;
    fn from_str(s: &str) -> TradingResult<Self> {
        match s.to_uppercase().as_str() {
            "AUS" => Ok(City::Aus),
            "CHI" => Ok(City::Chi),
            "MIA" => Ok(City::Mia),
            "NYC" => Ok(City::Nyc),
            _ => Err(TradingError::input(format!("unknown city code: '{}'", s))),
        }
    }
}

impl std::fmt::Display for City {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Contract side. The exchange prices only YES; NO cost = 100 - YES price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Yes => "yes",
            Side::No => "no",
        }
    }

    /// Cost of one contract in cents, given the YES price.
    pub fn cost_cents(&self, yes_price_cents: i64) -> i64 {
        match self {
            Side::Yes => yes_price_cents,
            Side::No => 100 - yes_price_cents,
        }
    }
}

impl FromStr for Side {
    type Err = TradingError;
    fn from_str(s: &str) -> TradingResult<Self> {
        match s.to_lowercase().as_str() {
            "yes" => Ok(Side::Yes),
            "no" => Ok(Side::No),
            _ => Err(TradingError::input(format!(
                "side must be 'yes' or 'no', got '{}'",
                s
            ))),
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
        }
    }
}

impl FromStr for Confidence {
    type Err = TradingError;
    fn from_str(s: &str) -> TradingResult<Self> {
        match s.to_lowercase().as_str() {
            "high" => Ok(Confidence::High),
            "medium" => Ok(Confidence::Medium),
            "low" => Ok(Confidence::Low),
            _ => Err(TradingError::input(format!(
                "unknown confidence level: '{}'",
                s
            ))),
        }
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    Open,
    Won,
    Lost,
    Canceled,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Open => "OPEN",
            TradeStatus::Won => "WON",
            TradeStatus::Lost => "LOST",
            TradeStatus::Canceled => "CANCELED",
        }
    }
}

impl FromStr for TradeStatus {
    type Err = TradingError;
    fn from_str(s: &str) -> TradingResult<Self> {
        match s.to_uppercase().as_str() {
            "OPEN" => Ok(TradeStatus::Open),
            "WON" => Ok(TradeStatus::Won),
            "LOST" => Ok(TradeStatus::Lost),
            "CANCELED" => Ok(TradeStatus::Canceled),
            _ => Err(TradingError::input(format!(
                "unknown trade status: '{}'",
                s
            ))),
        }
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PendingTradeStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Executed,
}

impl PendingTradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingTradeStatus::Pending => "PENDING",
            PendingTradeStatus::Approved => "APPROVED",
            PendingTradeStatus::Rejected => "REJECTED",
            PendingTradeStatus::Expired => "EXPIRED",
            PendingTradeStatus::Executed => "EXECUTED",
        }
    }
}

impl FromStr for PendingTradeStatus {
    type Err = TradingError;
    fn from_str(s: &str) -> TradingResult<Self> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(PendingTradeStatus::Pending),
            "APPROVED" => Ok(PendingTradeStatus::Approved),
            "REJECTED" => Ok(PendingTradeStatus::Rejected),
            "EXPIRED" => Ok(PendingTradeStatus::Expired),
            "EXECUTED" => Ok(PendingTradeStatus::Executed),
            _ => Err(TradingError::input(format!(
                "unknown pending trade status: '{}'",
                s
            ))),
        }
    }
}

impl std::fmt::Display for PendingTradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One source's forecast for one (city, date). Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct WeatherObservation {
    pub source: String,
    pub city: City,
    pub date: NaiveDate,
    pub forecast_high_f: f64,
    pub fetched_at: DateTime<Utc>,
}

// ─── Money helpers ───

pub fn dollars_to_cents(price: f64) -> i64 {
    (price * 100.0).round() as i64
}

pub fn cents_to_dollars(cents: i64) -> f64 {
    cents as f64 / 100.0
}

/// Validate a market YES price in cents. Valid range is [1, 99].
pub fn validate_price_cents(price_cents: i64) -> TradingResult<()> {
    if !(1..=99).contains(&price_cents) {
        return Err(TradingError::input(format!(
            "price_cents must be 1-99, got {}",
            price_cents
        )));
    }
    Ok(())
}

/// Estimate the exchange fee for one contract, in cents.
///
/// The fee is 15% of profit on a winning contract, minimum 1 cent.
/// YES side: profit_if_win = 100 - price_cents. NO side: price_cents.
/// Losing contracts pay no fee.
pub fn estimate_fees(price_cents: i64, side: Side) -> TradingResult<i64> {
    validate_price_cents(price_cents)?;
    let profit_if_win = match side {
        Side::Yes => 100 - price_cents,
        Side::No => price_cents,
    };
    let fee_cents = (profit_if_win as f64 * KALSHI_FEE_RATE) as i64;
    Ok(fee_cents.max(MIN_FEE_CENTS))
}

// ─── Bracket labels ───

/// A bracket's bounds, parsed once from its label and never re-parsed.
///
/// Label grammar (degree symbols and trailing F are stripped first):
///   "<=52F"  -> Below(52.0)        hit when actual <= 52
///   ">=57F"  -> Above(57.0)        hit when actual >= 57
///   "53-54F" -> Range(53.0, 54.0)  hit when 53 <= actual <= 54 (inclusive)
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BracketBounds {
    Below { upper: f64 },
    Range { lower: f64, upper: f64 },
    Above { lower: f64 },
}

fn bound_number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\d.]+").unwrap())
}

impl BracketBounds {
    pub fn parse(label: &str) -> TradingResult<BracketBounds> {
        let clean = label.replace('\u{00b0}', "").replace(' ', "");
        let clean = clean.trim();

        if let Some(rest) = clean.strip_prefix("<=") {
            let upper = first_number(rest)?;
            return Ok(BracketBounds::Below { upper });
        }
        if let Some(rest) = clean.strip_prefix(">=") {
            let lower = first_number(rest)?;
            return Ok(BracketBounds::Above { lower });
        }

        // Standard bracket: "53-54F" or "53-54"
        let trimmed = clean.trim_end_matches(['F', 'f']);
        let parts: Vec<&str> = trimmed.split('-').collect();
        if parts.len() == 2 {
            let lower = parts[0]
                .parse::<f64>()
                .map_err(|_| bad_label(label))?;
            let upper = parts[1]
                .parse::<f64>()
                .map_err(|_| bad_label(label))?;
            return Ok(BracketBounds::Range { lower, upper });
        }

        Err(bad_label(label))
    }

    /// Whether an observed temperature lands inside the bracket.
    /// Range bounds are inclusive on both ends.
    pub fn contains(&self, actual_temp_f: f64) -> bool {
        match *self {
            BracketBounds::Below { upper } => actual_temp_f <= upper,
            BracketBounds::Range { lower, upper } => {
                lower <= actual_temp_f && actual_temp_f <= upper
            }
            BracketBounds::Above { lower } => actual_temp_f >= lower,
        }
    }
}

fn first_number(text: &str) -> TradingResult<f64> {
    bound_number_re()
        .find(text)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .ok_or_else(|| bad_label(text))
}

fn bad_label(label: &str) -> TradingError {
    TradingError::input(format!("unparseable bracket label: '{}'", label))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_city_round_trip() {
        for city in City::ALL {
            assert_eq!(city.as_str().parse::<City>().unwrap(), city);
        }
        assert!("LAX".parse::<City>().is_err());
        assert_eq!("nyc".parse::<City>().unwrap(), City::Nyc);
    }

    #[test]
    fn test_city_ordering_is_lexicographic() {
        let mut cities = vec![City::Nyc, City::Aus, City::Mia, City::Chi];
        cities.sort();
        assert_eq!(cities, vec![City::Aus, City::Chi, City::Mia, City::Nyc]);
    }

    #[test]
    fn test_side_cost() {
        assert_eq!(Side::Yes.cost_cents(22), 22);
        assert_eq!(Side::No.cost_cents(22), 78);
    }

    #[test]
    fn test_status_round_trip() {
        assert_eq!("OPEN".parse::<TradeStatus>().unwrap(), TradeStatus::Open);
        assert_eq!("won".parse::<TradeStatus>().unwrap(), TradeStatus::Won);
        assert!("SETTLED".parse::<TradeStatus>().is_err());
        assert_eq!(
            "EXECUTED".parse::<PendingTradeStatus>().unwrap(),
            PendingTradeStatus::Executed
        );
    }

    #[test]
    fn test_dollars_cents_conversion() {
        assert_eq!(dollars_to_cents(0.22), 22);
        assert_eq!(dollars_to_cents(0.999), 100);
        assert!((cents_to_dollars(22) - 0.22).abs() < f64::EPSILON);
    }

    #[test]
    fn test_price_validation_boundaries() {
        assert!(validate_price_cents(1).is_ok());
        assert!(validate_price_cents(99).is_ok());
        assert!(validate_price_cents(0).is_err());
        assert!(validate_price_cents(100).is_err());
    }

    #[test]
    fn test_estimate_fees_yes_side() {
        // price 15 -> profit_if_win 85 -> floor(85 * 0.15) = 12
        assert_eq!(estimate_fees(15, Side::Yes).unwrap(), 12);
        // price 22 -> profit 78 -> floor(11.7) = 11
        assert_eq!(estimate_fees(22, Side::Yes).unwrap(), 11);
        // price 99 -> profit 1 -> floor(0.15) = 0 -> minimum 1
        assert_eq!(estimate_fees(99, Side::Yes).unwrap(), 1);
    }

    #[test]
    fn test_estimate_fees_no_side() {
        // NO side profit_if_win is the YES price
        assert_eq!(estimate_fees(15, Side::No).unwrap(), 2);
        assert_eq!(estimate_fees(1, Side::No).unwrap(), 1);
    }

    #[test]
    fn test_estimate_fees_rejects_invalid_price() {
        assert!(estimate_fees(0, Side::Yes).is_err());
        assert!(estimate_fees(100, Side::No).is_err());
    }

    #[test]
    fn test_fee_sum_bounded_by_larger_cost() {
        // fees(c, yes) + fees(c, no) <= max(c, 100 - c), each >= 1
        for c in 1..=99 {
            let yes = estimate_fees(c, Side::Yes).unwrap();
            let no = estimate_fees(c, Side::No).unwrap();
            assert!(yes >= 1 && no >= 1, "c={}", c);
            assert!(yes + no <= c.max(100 - c), "c={}", c);
        }
    }

    #[test]
    fn test_bracket_parse_below() {
        let b = BracketBounds::parse("<=52F").unwrap();
        assert_eq!(b, BracketBounds::Below { upper: 52.0 });
        assert!(b.contains(52.0));
        assert!(b.contains(40.0));
        assert!(!b.contains(52.1));
    }

    #[test]
    fn test_bracket_parse_above() {
        let b = BracketBounds::parse(">=57F").unwrap();
        assert_eq!(b, BracketBounds::Above { lower: 57.0 });
        assert!(b.contains(57.0));
        assert!(b.contains(90.0));
        assert!(!b.contains(56.9));
    }

    #[test]
    fn test_bracket_parse_range_inclusive() {
        let b = BracketBounds::parse("53-54F").unwrap();
        assert_eq!(
            b,
            BracketBounds::Range {
                lower: 53.0,
                upper: 54.0
            }
        );
        assert!(b.contains(53.0));
        assert!(b.contains(54.0));
        assert!(b.contains(53.5));
        assert!(!b.contains(52.9));
        assert!(!b.contains(54.1));
    }

    #[test]
    fn test_bracket_parse_degree_symbol_variants() {
        assert_eq!(
            BracketBounds::parse("53-54\u{00b0}F").unwrap(),
            BracketBounds::Range {
                lower: 53.0,
                upper: 54.0
            }
        );
        assert_eq!(
            BracketBounds::parse("<=52\u{00b0}F").unwrap(),
            BracketBounds::Below { upper: 52.0 }
        );
    }

    #[test]
    fn test_bracket_parse_rejects_garbage() {
        assert!(BracketBounds::parse("hot").is_err());
        assert!(BracketBounds::parse("53F").is_err());
        assert!(BracketBounds::parse("").is_err());
    }
}
