use chrono::NaiveDate;

use crate::brackets::BracketDef;
use crate::domain::City;

/// Ticker prefix shared by every daily-high weather market.
pub const WEATHER_TICKER_PREFIX: &str = "KXHIGH";

/// Series ticker for a city's daily-high market family.
pub fn series_ticker(city: City) -> &'static str {
    match city {
        City::Nyc => "KXHIGHNY",
        City::Chi => "KXHIGHCH",
        City::Mia => "KXHIGHMI",
        City::Aus => "KXHIGHAU",
    }
}

/// Whether a ticker belongs to a weather market we track.
pub fn is_weather_ticker(ticker: &str) -> bool {
    ticker.starts_with(WEATHER_TICKER_PREFIX)
}

/// Event tickers embed the date as uppercased %y%b%d, e.g. "KXHIGHNY-26FEB18".
pub fn build_event_ticker(city: City, date: NaiveDate) -> String {
    format!(
        "{}-{}",
        series_ticker(city),
        date.format("%y%b%d").to_string().to_uppercase()
    )
}

/// Recover the city from a market or event ticker by its series prefix.
pub fn city_from_ticker(ticker: &str) -> Option<City> {
    City::ALL
        .into_iter()
        .find(|&city| ticker.starts_with(series_ticker(city)))
}

/// Recover the event date from a ticker like "KXHIGHNY-26FEB18-B3".
pub fn date_from_ticker(ticker: &str) -> Option<NaiveDate> {
    let date_part = ticker.split('-').nth(1)?;
    NaiveDate::parse_from_str(date_part, "%y%b%d").ok()
}

/// Cache keys use compact YYMMDD date strings.
pub fn date_str_yymmdd(date: NaiveDate) -> String {
    date.format("%y%m%d").to_string()
}

/// Render a bracket label from market strike bounds.
///
/// Kalshi middle markets carry strikes like floor=53.0 / cap=54.99; the
/// bracket covers the whole degrees 53 and 54, so the label is "53-54F".
/// Edge markets have one missing strike: a missing floor is the bottom
/// catch-all ("<=52F"), a missing cap the top catch-all (">=58F").
pub fn bracket_label_from_strikes(
    floor_strike: Option<f64>,
    cap_strike: Option<f64>,
) -> Option<String> {
    match (floor_strike, cap_strike) {
        (None, Some(cap)) => Some(format!("<={:.0}F", cap.floor())),
        (Some(floor), None) => Some(format!(">={:.0}F", floor)),
        (Some(floor), Some(cap)) => Some(format!("{:.0}-{:.0}F", floor, cap.floor())),
        (None, None) => None,
    }
}

/// Bracket definitions (label + bounds) for a full event's market list,
/// in the order the markets were returned.
pub fn bracket_defs_from_strikes(strikes: &[(Option<f64>, Option<f64>)]) -> Vec<BracketDef> {
    strikes
        .iter()
        .filter_map(|&(floor, cap)| {
            let label = bracket_label_from_strikes(floor, cap)?;
            Some(BracketDef {
                label,
                lower_bound_f: floor,
                upper_bound_f: cap,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feb18() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, 18).unwrap()
    }

    #[test]
    fn test_series_tickers() {
        assert_eq!(series_ticker(City::Nyc), "KXHIGHNY");
        assert_eq!(series_ticker(City::Chi), "KXHIGHCH");
        assert_eq!(series_ticker(City::Mia), "KXHIGHMI");
        assert_eq!(series_ticker(City::Aus), "KXHIGHAU");
    }

    #[test]
    fn test_build_event_ticker() {
        assert_eq!(build_event_ticker(City::Nyc, feb18()), "KXHIGHNY-26FEB18");
        let jul4 = NaiveDate::from_ymd_opt(2026, 7, 4).unwrap();
        assert_eq!(build_event_ticker(City::Aus, jul4), "KXHIGHAU-26JUL04");
    }

    #[test]
    fn test_city_from_ticker() {
        assert_eq!(city_from_ticker("KXHIGHNY-26FEB18-B3"), Some(City::Nyc));
        assert_eq!(city_from_ticker("KXHIGHAU-26FEB18"), Some(City::Aus));
        assert_eq!(city_from_ticker("KXBTC-26FEB18"), None);
    }

    #[test]
    fn test_date_from_ticker() {
        assert_eq!(date_from_ticker("KXHIGHNY-26FEB18-B3"), Some(feb18()));
        assert_eq!(date_from_ticker("KXHIGHNY"), None);
        assert_eq!(date_from_ticker("KXHIGHNY-NODATE-B3"), None);
    }

    #[test]
    fn test_is_weather_ticker() {
        assert!(is_weather_ticker("KXHIGHNY-26FEB18-B3"));
        assert!(!is_weather_ticker("KXBTCD-26FEB18"));
    }

    #[test]
    fn test_date_str_yymmdd() {
        assert_eq!(date_str_yymmdd(feb18()), "260218");
    }

    #[test]
    fn test_bracket_label_from_strikes() {
        assert_eq!(
            bracket_label_from_strikes(Some(53.0), Some(54.99)),
            Some("53-54F".to_string())
        );
        assert_eq!(
            bracket_label_from_strikes(None, Some(52.99)),
            Some("<=52F".to_string())
        );
        assert_eq!(
            bracket_label_from_strikes(Some(58.0), None),
            Some(">=58F".to_string())
        );
        assert_eq!(bracket_label_from_strikes(None, None), None);
    }

    #[test]
    fn test_bracket_defs_from_strikes() {
        let strikes = vec![
            (None, Some(50.99)),
            (Some(51.0), Some(52.99)),
            (Some(53.0), None),
            (None, None), // malformed market is skipped
        ];
        let defs = bracket_defs_from_strikes(&strikes);
        assert_eq!(defs.len(), 3);
        assert_eq!(defs[0].label, "<=50F");
        assert_eq!(defs[1].label, "51-52F");
        assert_eq!(defs[2].label, ">=53F");
    }
}
