use std::collections::HashMap;

use crate::backtest::{BacktestResult, CityStats, KellyStats, SimulatedTrade};
use crate::domain::{estimate_fees, City};

/// Annualization factor: trading days per year.
const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Populate every aggregate metric on a backtest result: win rate, total
/// P&L, ROI, annualized Sharpe, max drawdown, per-city breakdown, and
/// Kelly effectiveness when Kelly sizing was on.
pub fn compute_metrics(result: &mut BacktestResult) {
    let all_trades: Vec<&SimulatedTrade> =
        result.days.iter().flat_map(|d| d.trades.iter()).collect();

    result.total_days_simulated = result.days.len() as i64;
    result.days_with_trades = result.days.iter().filter(|d| !d.trades.is_empty()).count() as i64;
    result.total_trades = all_trades.len() as i64;
    result.wins = all_trades.iter().filter(|t| t.won).count() as i64;
    result.losses = result.total_trades - result.wins;
    result.win_rate = if result.total_trades > 0 {
        result.wins as f64 / result.total_trades as f64
    } else {
        0.0
    };
    result.total_pnl_cents = all_trades.iter().map(|t| t.pnl_cents).sum();
    result.roi_pct = compute_roi(result.total_pnl_cents, result.config.initial_bankroll_cents);
    result.sharpe_ratio = compute_sharpe(result);
    result.max_drawdown_pct = compute_max_drawdown(result);
    result.per_city_stats = compute_per_city_stats(&all_trades);
    result.kelly_stats = result
        .config
        .use_kelly
        .then(|| compute_kelly_stats(&all_trades));
}

fn compute_roi(total_pnl_cents: i64, initial_bankroll_cents: i64) -> f64 {
    if initial_bankroll_cents <= 0 {
        return 0.0;
    }
    round2(total_pnl_cents as f64 / initial_bankroll_cents as f64 * 100.0)
}

/// Annualized Sharpe from daily returns (daily P&L over the starting
/// bankroll). Sample standard deviation, sqrt(252) annualization; zero
/// with fewer than two days or a degenerate std.
fn compute_sharpe(result: &BacktestResult) -> f64 {
    if result.days.len() < 2 {
        return 0.0;
    }

    let initial = result.config.initial_bankroll_cents as f64;
    let daily_returns: Vec<f64> = result
        .days
        .iter()
        .map(|d| d.daily_pnl_cents as f64 / initial)
        .collect();

    let n = daily_returns.len() as f64;
    let mean = daily_returns.iter().sum::<f64>() / n;
    let variance = daily_returns
        .iter()
        .map(|r| (r - mean).powi(2))
        .sum::<f64>()
        / (n - 1.0);
    let std = variance.sqrt();

    if std < 1e-12 {
        return 0.0;
    }

    round4(mean / std * TRADING_DAYS_PER_YEAR.sqrt())
}

/// Largest percentage decline from a running bankroll peak to a daily
/// close.
fn compute_max_drawdown(result: &BacktestResult) -> f64 {
    let mut peak = result.config.initial_bankroll_cents;
    let mut max_dd = 0.0f64;

    for day in &result.days {
        if day.bankroll_end_cents > peak {
            peak = day.bankroll_end_cents;
        }
        if peak > 0 {
            let dd = (peak - day.bankroll_end_cents) as f64 / peak as f64 * 100.0;
            max_dd = max_dd.max(dd);
        }
    }

    round2(max_dd)
}

fn compute_per_city_stats(trades: &[&SimulatedTrade]) -> HashMap<City, CityStats> {
    let mut by_city: HashMap<City, Vec<&SimulatedTrade>> = HashMap::new();
    for trade in trades {
        by_city.entry(trade.city).or_default().push(trade);
    }

    by_city
        .into_iter()
        .map(|(city, city_trades)| {
            let total = city_trades.len() as i64;
            let wins = city_trades.iter().filter(|t| t.won).count() as i64;
            let pnl = city_trades.iter().map(|t| t.pnl_cents).sum();
            let avg_ev = city_trades.iter().map(|t| t.ev).sum::<f64>() / total as f64;
            (
                city,
                CityStats {
                    total_trades: total,
                    wins,
                    losses: total - wins,
                    win_rate: round4(wins as f64 / total as f64),
                    total_pnl_cents: pnl,
                    avg_ev: round4(avg_ev),
                },
            )
        })
        .collect()
}

/// Kelly effectiveness: average and peak quantity, and the P&L delta
/// against replaying every trade at a flat single contract.
fn compute_kelly_stats(trades: &[&SimulatedTrade]) -> KellyStats {
    if trades.is_empty() {
        return KellyStats::default();
    }

    let quantities: Vec<i64> = trades.iter().map(|t| t.quantity).collect();
    let avg_quantity = quantities.iter().sum::<i64>() as f64 / quantities.len() as f64;
    let max_quantity = quantities.iter().copied().max().unwrap_or(0);

    let mut flat_pnl = 0i64;
    for trade in trades {
        let cost_1 = trade.side.cost_cents(trade.price_cents);
        if trade.won {
            let fee_1 = estimate_fees(trade.price_cents, trade.side).unwrap_or(1);
            flat_pnl += 100 - cost_1 - fee_1;
        } else {
            flat_pnl -= cost_1;
        }
    }

    let actual_pnl: i64 = trades.iter().map(|t| t.pnl_cents).sum();
    KellyStats {
        avg_quantity: round2(avg_quantity),
        max_quantity,
        pnl_vs_flat: actual_pnl - flat_pnl,
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round4(v: f64) -> f64 {
    (v * 1e4).round() / 1e4
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::{BacktestConfig, BacktestDay};
    use crate::domain::{Confidence, Side};
    use chrono::NaiveDate;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, day).unwrap()
    }

    fn sim_trade(
        city: City,
        side: Side,
        price_cents: i64,
        quantity: i64,
        won: bool,
        pnl_cents: i64,
    ) -> SimulatedTrade {
        SimulatedTrade {
            day: date(10),
            city,
            bracket_label: "53-54F".to_string(),
            side,
            price_cents,
            quantity,
            model_probability: 0.35,
            market_probability: 0.22,
            ev: 0.08,
            confidence: Confidence::Medium,
            actual_temp_f: 53.5,
            won,
            pnl_cents,
            fees_cents: if won { 11 * quantity } else { 0 },
            bankroll_after_cents: 0,
        }
    }

    fn result_with_days(days: Vec<BacktestDay>, use_kelly: bool) -> BacktestResult {
        let mut config = BacktestConfig::new(date(10), date(12));
        config.use_kelly = use_kelly;
        BacktestResult {
            config,
            days,
            total_trades: 0,
            wins: 0,
            losses: 0,
            win_rate: 0.0,
            total_pnl_cents: 0,
            roi_pct: 0.0,
            sharpe_ratio: 0.0,
            max_drawdown_pct: 0.0,
            per_city_stats: HashMap::new(),
            kelly_stats: None,
            total_days_simulated: 0,
            days_with_trades: 0,
            duration_seconds: 0.0,
        }
    }

    fn day(
        d: u32,
        trades: Vec<SimulatedTrade>,
        bankroll_start: i64,
        bankroll_end: i64,
    ) -> BacktestDay {
        let daily_pnl = trades.iter().map(|t| t.pnl_cents).sum();
        BacktestDay {
            day: date(d),
            trades,
            daily_pnl_cents: daily_pnl,
            bankroll_start_cents: bankroll_start,
            bankroll_end_cents: bankroll_end,
            trades_blocked_by_risk: 0,
        }
    }

    #[test]
    fn test_counts_and_roi() {
        // Two wins, one loss: pnl = 67 + 67 - 22 = 112 on a 100_000 bankroll.
        let days = vec![
            day(
                10,
                vec![
                    sim_trade(City::Nyc, Side::Yes, 22, 1, true, 67),
                    sim_trade(City::Chi, Side::Yes, 22, 1, false, -22),
                ],
                100_000,
                100_045,
            ),
            day(
                11,
                vec![sim_trade(City::Nyc, Side::Yes, 22, 1, true, 67)],
                100_045,
                100_112,
            ),
        ];
        let mut result = result_with_days(days, false);
        compute_metrics(&mut result);

        assert_eq!(result.total_trades, 3);
        assert_eq!(result.wins, 2);
        assert_eq!(result.losses, 1);
        assert!((result.win_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(result.total_pnl_cents, 112);
        // 112 / 100_000 * 100 = 0.112 -> rounded 0.11
        assert_eq!(result.roi_pct, 0.11);
        assert_eq!(result.total_days_simulated, 2);
        assert_eq!(result.days_with_trades, 2);
        assert!(result.kelly_stats.is_none());
    }

    #[test]
    fn test_sharpe_hand_computed() {
        // Daily pnl 100 and -50 on 100_000: returns 0.001 and -0.0005.
        // mean = 0.00025, sample var = 2*(0.00075)^2 ... computed below.
        let days = vec![
            day(10, vec![sim_trade(City::Nyc, Side::Yes, 22, 1, true, 100)], 100_000, 100_100),
            day(11, vec![sim_trade(City::Nyc, Side::Yes, 22, 1, false, -50)], 100_100, 100_050),
        ];
        let mut result = result_with_days(days, false);
        compute_metrics(&mut result);

        let r1 = 0.001f64;
        let r2 = -0.0005f64;
        let mean = (r1 + r2) / 2.0;
        let var = ((r1 - mean).powi(2) + (r2 - mean).powi(2)) / 1.0; // ddof=1
        let expected = mean / var.sqrt() * 252f64.sqrt();
        assert!((result.sharpe_ratio - (expected * 1e4).round() / 1e4).abs() < 1e-9);
    }

    #[test]
    fn test_sharpe_zero_for_single_day_or_flat_returns() {
        let days = vec![day(10, vec![], 100_000, 100_000)];
        let mut result = result_with_days(days, false);
        compute_metrics(&mut result);
        assert_eq!(result.sharpe_ratio, 0.0);

        // Identical daily returns: std below threshold.
        let days = vec![
            day(10, vec![sim_trade(City::Nyc, Side::Yes, 22, 1, true, 50)], 100_000, 100_050),
            day(11, vec![sim_trade(City::Nyc, Side::Yes, 22, 1, true, 50)], 100_050, 100_100),
        ];
        let mut result = result_with_days(days, false);
        compute_metrics(&mut result);
        assert_eq!(result.sharpe_ratio, 0.0);
    }

    #[test]
    fn test_max_drawdown() {
        // Peak 110_000 then trough 99_000: dd = 11_000/110_000 = 10%.
        let days = vec![
            day(10, vec![], 100_000, 110_000),
            day(11, vec![], 110_000, 99_000),
            day(12, vec![], 99_000, 105_000),
        ];
        let mut result = result_with_days(days, false);
        compute_metrics(&mut result);
        assert_eq!(result.max_drawdown_pct, 10.0);
    }

    #[test]
    fn test_drawdown_zero_when_monotonic() {
        let days = vec![
            day(10, vec![], 100_000, 101_000),
            day(11, vec![], 101_000, 102_000),
        ];
        let mut result = result_with_days(days, false);
        compute_metrics(&mut result);
        assert_eq!(result.max_drawdown_pct, 0.0);
    }

    #[test]
    fn test_per_city_breakdown() {
        let days = vec![day(
            10,
            vec![
                sim_trade(City::Nyc, Side::Yes, 22, 1, true, 67),
                sim_trade(City::Nyc, Side::Yes, 30, 1, false, -30),
                sim_trade(City::Chi, Side::No, 80, 1, true, 68),
            ],
            100_000,
            100_105,
        )];
        let mut result = result_with_days(days, false);
        compute_metrics(&mut result);

        let nyc = &result.per_city_stats[&City::Nyc];
        assert_eq!(nyc.total_trades, 2);
        assert_eq!(nyc.wins, 1);
        assert_eq!(nyc.losses, 1);
        assert_eq!(nyc.win_rate, 0.5);
        assert_eq!(nyc.total_pnl_cents, 37);

        let chi = &result.per_city_stats[&City::Chi];
        assert_eq!(chi.total_trades, 1);
        assert_eq!(chi.total_pnl_cents, 68);
        assert!(!result.per_city_stats.contains_key(&City::Mia));
    }

    #[test]
    fn test_kelly_stats_vs_flat() {
        // 3-contract win at 22c: pnl = 300 - 66 - 33 = 201.
        // Flat 1-contract: 100 - 22 - 11 = 67. Delta so far +134.
        // 2-contract loss at 30c: pnl = -60; flat loses 30. Delta -30.
        let days = vec![day(
            10,
            vec![
                sim_trade(City::Nyc, Side::Yes, 22, 3, true, 201),
                sim_trade(City::Chi, Side::Yes, 30, 2, false, -60),
            ],
            100_000,
            100_141,
        )];
        let mut result = result_with_days(days, true);
        compute_metrics(&mut result);

        let kelly = result.kelly_stats.unwrap();
        assert_eq!(kelly.avg_quantity, 2.5);
        assert_eq!(kelly.max_quantity, 3);
        // actual 141 vs flat 37: +104
        assert_eq!(kelly.pnl_vs_flat, 104);
    }

    #[test]
    fn test_empty_result_is_all_zeroes() {
        let mut result = result_with_days(vec![], true);
        compute_metrics(&mut result);
        assert_eq!(result.total_trades, 0);
        assert_eq!(result.win_rate, 0.0);
        assert_eq!(result.roi_pct, 0.0);
        assert_eq!(result.sharpe_ratio, 0.0);
        assert_eq!(result.max_drawdown_pct, 0.0);
        assert!(result.per_city_stats.is_empty());
        assert_eq!(result.kelly_stats.unwrap(), KellyStats::default());
    }
}
