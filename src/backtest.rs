use std::collections::{BTreeMap, HashMap};

use chrono::{Duration, NaiveDate};
use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use statrs::distribution::Normal;
use tracing::info;

use crate::backtest_metrics::compute_metrics;
use crate::domain::{City, Confidence, Side};
use crate::errors::{TradingError, TradingResult};
use crate::ev_scanner::{scan_all_brackets, SizingContext, TradeSignal};
use crate::kelly::KellySettings;
use crate::markets::build_event_ticker;
use crate::prediction::EnsemblePrediction;
use crate::settlement::{did_bracket_win, settlement_pnl};

/// Configuration for one backtest run. All monetary values in cents.
#[derive(Debug, Clone, PartialEq)]
pub struct BacktestConfig {
    pub cities: Vec<City>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub initial_bankroll_cents: i64,
    pub min_ev_threshold: f64,
    pub use_kelly: bool,
    pub kelly_fraction: f64,
    pub max_daily_trades: i64,
    pub consecutive_loss_limit: i64,
    pub max_contracts_per_trade: i64,
    pub max_bankroll_pct_per_trade: f64,
    pub price_noise_cents: i64,
    /// Fixed seed reproduces price noise and synthetic settlements exactly.
    pub seed: Option<u64>,
}

impl BacktestConfig {
    pub fn new(start_date: NaiveDate, end_date: NaiveDate) -> Self {
        BacktestConfig {
            cities: City::ALL.to_vec(),
            start_date,
            end_date,
            initial_bankroll_cents: 100_000,
            min_ev_threshold: 0.02,
            use_kelly: true,
            kelly_fraction: 0.25,
            max_daily_trades: 20,
            consecutive_loss_limit: 5,
            max_contracts_per_trade: 10,
            max_bankroll_pct_per_trade: 0.05,
            price_noise_cents: 5,
            seed: None,
        }
    }

    pub fn validate(&self) -> TradingResult<()> {
        if self.cities.is_empty() {
            return Err(TradingError::input("at least one city must be selected"));
        }
        if self.end_date < self.start_date {
            return Err(TradingError::input(format!(
                "end_date ({}) must be >= start_date ({})",
                self.end_date, self.start_date
            )));
        }
        if self.initial_bankroll_cents < 1_000 {
            return Err(TradingError::input(
                "initial_bankroll_cents must be at least 1000",
            ));
        }
        Ok(())
    }
}

/// A single trade from the simulation, with its full outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedTrade {
    pub day: NaiveDate,
    pub city: City,
    pub bracket_label: String,
    pub side: Side,
    pub price_cents: i64,
    pub quantity: i64,
    pub model_probability: f64,
    pub market_probability: f64,
    pub ev: f64,
    pub confidence: Confidence,
    pub actual_temp_f: f64,
    pub won: bool,
    pub pnl_cents: i64,
    pub fees_cents: i64,
    pub bankroll_after_cents: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BacktestDay {
    pub day: NaiveDate,
    pub trades: Vec<SimulatedTrade>,
    pub daily_pnl_cents: i64,
    pub bankroll_start_cents: i64,
    pub bankroll_end_cents: i64,
    pub trades_blocked_by_risk: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CityStats {
    pub total_trades: i64,
    pub wins: i64,
    pub losses: i64,
    pub win_rate: f64,
    pub total_pnl_cents: i64,
    pub avg_ev: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KellyStats {
    pub avg_quantity: f64,
    pub max_quantity: i64,
    /// P&L improvement in cents over replaying every trade at quantity 1.
    pub pnl_vs_flat: i64,
}

#[derive(Debug, Clone)]
pub struct BacktestResult {
    pub config: BacktestConfig,
    pub days: Vec<BacktestDay>,
    pub total_trades: i64,
    pub wins: i64,
    pub losses: i64,
    pub win_rate: f64,
    pub total_pnl_cents: i64,
    pub roi_pct: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown_pct: f64,
    pub per_city_stats: HashMap<City, CityStats>,
    pub kelly_stats: Option<KellyStats>,
    pub total_days_simulated: i64,
    pub days_with_trades: i64,
    pub duration_seconds: f64,
}

/// In-memory risk manager mirroring the live limits: daily trade cap,
/// consecutive-loss block, bankroll tracking. No I/O.
pub struct BacktestRiskManager {
    pub bankroll_cents: i64,
    pub max_daily_trades: i64,
    pub consecutive_loss_limit: i64,
    daily_trade_count: i64,
    consecutive_losses: i64,
    total_trades: i64,
    total_blocked: i64,
    peak_bankroll: i64,
}

impl BacktestRiskManager {
    pub fn new(
        initial_bankroll_cents: i64,
        max_daily_trades: i64,
        consecutive_loss_limit: i64,
    ) -> Self {
        BacktestRiskManager {
            bankroll_cents: initial_bankroll_cents,
            max_daily_trades,
            consecutive_loss_limit,
            daily_trade_count: 0,
            consecutive_losses: 0,
            total_trades: 0,
            total_blocked: 0,
            peak_bankroll: initial_bankroll_cents,
        }
    }

    pub fn daily_trade_count(&self) -> i64 {
        self.daily_trade_count
    }

    pub fn consecutive_losses(&self) -> i64 {
        self.consecutive_losses
    }

    pub fn total_trades(&self) -> i64 {
        self.total_trades
    }

    pub fn total_blocked(&self) -> i64 {
        self.total_blocked
    }

    pub fn peak_bankroll(&self) -> i64 {
        self.peak_bankroll
    }

    /// Whether a trade is allowed right now; each refusal is counted.
    pub fn can_trade(&mut self) -> bool {
        if self.bankroll_cents <= 0 {
            self.total_blocked += 1;
            return false;
        }
        if self.daily_trade_count >= self.max_daily_trades {
            self.total_blocked += 1;
            return false;
        }
        if self.consecutive_losses >= self.consecutive_loss_limit {
            self.total_blocked += 1;
            return false;
        }
        true
    }

    pub fn record_trade(&mut self, pnl_cents: i64, won: bool) {
        self.bankroll_cents += pnl_cents;
        self.daily_trade_count += 1;
        self.total_trades += 1;

        if won {
            self.consecutive_losses = 0;
        } else {
            self.consecutive_losses += 1;
        }

        if self.bankroll_cents > self.peak_bankroll {
            self.peak_bankroll = self.bankroll_cents;
        }
    }

    /// Daily counters reset between days; consecutive losses persist,
    /// matching the live cooldown behavior.
    pub fn advance_day(&mut self) {
        self.daily_trade_count = 0;
    }

    /// Cap any single trade at 10% of bankroll, 100c minimum.
    pub fn get_max_trade_size_cents(&self) -> i64 {
        (self.bankroll_cents / 10).max(100)
    }
}

/// Deterministic day-by-day replay through the real scanner, sizer,
/// adjudicator, and P&L math. All data is in memory; no I/O during
/// simulation. Fixed seed + config + inputs give a bit-identical result.
pub fn run_backtest(
    config: &BacktestConfig,
    predictions: &[EnsemblePrediction],
    settlements: Option<&HashMap<(City, NaiveDate), f64>>,
) -> TradingResult<BacktestResult> {
    config.validate()?;
    let started = std::time::Instant::now();

    let filtered: Vec<&EnsemblePrediction> = predictions
        .iter()
        .filter(|p| {
            config.cities.contains(&p.city)
                && config.start_date <= p.date
                && p.date <= config.end_date
        })
        .collect();

    if filtered.is_empty() {
        return Err(TradingError::InsufficientData(format!(
            "no predictions match the backtest config ({} candidates, {} to {})",
            predictions.len(),
            config.start_date,
            config.end_date
        )));
    }

    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    // Synthetic settlements draw from the same seeded RNG as price noise.
    let settlements: HashMap<(City, NaiveDate), f64> = match settlements {
        Some(provided) => provided.clone(),
        None => generate_settlement_temps(&filtered, &mut rng),
    };

    let mut by_day: BTreeMap<NaiveDate, BTreeMap<City, &EnsemblePrediction>> = BTreeMap::new();
    for pred in &filtered {
        by_day.entry(pred.date).or_default().insert(pred.city, pred);
    }

    let mut risk = BacktestRiskManager::new(
        config.initial_bankroll_cents,
        config.max_daily_trades,
        config.consecutive_loss_limit,
    );

    let mut days = Vec::new();
    let mut current_date = config.start_date;
    while current_date <= config.end_date {
        let empty = BTreeMap::new();
        let day_predictions = by_day.get(&current_date).unwrap_or(&empty);
        let day = simulate_day(
            current_date,
            day_predictions,
            &settlements,
            &mut risk,
            config,
            &mut rng,
        )?;
        days.push(day);
        risk.advance_day();
        current_date += Duration::days(1);
    }

    let mut result = BacktestResult {
        config: config.clone(),
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
    };
    compute_metrics(&mut result);
    result.duration_seconds = started.elapsed().as_secs_f64();

    info!(
        total_trades = result.total_trades,
        win_rate = result.win_rate,
        total_pnl_cents = result.total_pnl_cents,
        days = result.total_days_simulated,
        "Backtest complete"
    );
    Ok(result)
}

fn simulate_day(
    current_date: NaiveDate,
    day_predictions: &BTreeMap<City, &EnsemblePrediction>,
    settlements: &HashMap<(City, NaiveDate), f64>,
    risk: &mut BacktestRiskManager,
    config: &BacktestConfig,
    rng: &mut StdRng,
) -> TradingResult<BacktestDay> {
    let bankroll_start = risk.bankroll_cents;
    let mut trades = Vec::new();
    let mut blocked_count = 0i64;

    // BTreeMap iteration gives lexicographic city order for reproducibility.
    for (&city, prediction) in day_predictions {
        let Some(&actual_temp) = settlements.get(&(city, current_date)) else {
            continue;
        };

        let market_prices = generate_synthetic_prices(prediction, config.price_noise_cents, rng);
        let market_tickers = generate_synthetic_tickers(prediction);

        let sizing = config.use_kelly.then(|| SizingContext {
            settings: KellySettings {
                use_kelly_sizing: true,
                kelly_fraction: config.kelly_fraction,
                max_bankroll_pct_per_trade: config.max_bankroll_pct_per_trade,
                max_contracts_per_trade: config.max_contracts_per_trade,
            },
            bankroll_cents: risk.bankroll_cents,
            max_trade_size_cents: risk.get_max_trade_size_cents(),
        });

        let signals = scan_all_brackets(
            prediction,
            &market_prices,
            &market_tickers,
            config.min_ev_threshold,
            sizing.as_ref(),
        );

        for signal in &signals {
            if !risk.can_trade() {
                blocked_count += 1;
                continue;
            }
            trades.push(execute_simulated_trade(signal, actual_temp, risk, current_date)?);
        }
    }

    let daily_pnl = trades.iter().map(|t| t.pnl_cents).sum();
    Ok(BacktestDay {
        day: current_date,
        daily_pnl_cents: daily_pnl,
        bankroll_start_cents: bankroll_start,
        bankroll_end_cents: risk.bankroll_cents,
        trades_blocked_by_risk: blocked_count,
        trades,
    })
}

fn execute_simulated_trade(
    signal: &TradeSignal,
    actual_temp_f: f64,
    risk: &mut BacktestRiskManager,
    trade_date: NaiveDate,
) -> TradingResult<SimulatedTrade> {
    let won = did_bracket_win(&signal.bracket, actual_temp_f, signal.side);
    let (pnl_cents, fees_cents) =
        settlement_pnl(signal.price_cents, signal.quantity, signal.side, won)
            .map_err(|e| TradingError::input(e.to_string()))?;

    risk.record_trade(pnl_cents, won);

    Ok(SimulatedTrade {
        day: trade_date,
        city: signal.city,
        bracket_label: signal.bracket.clone(),
        side: signal.side,
        price_cents: signal.price_cents,
        quantity: signal.quantity,
        model_probability: signal.model_probability,
        market_probability: signal.market_probability,
        ev: signal.ev,
        confidence: signal.confidence,
        actual_temp_f,
        won,
        pnl_cents,
        fees_cents,
        bankroll_after_cents: risk.bankroll_cents,
    })
}

/// Each bracket's synthetic YES price is its probability in cents,
/// perturbed by uniform integer noise and clamped into [1, 99].
pub fn generate_synthetic_prices(
    prediction: &EnsemblePrediction,
    noise_cents: i64,
    rng: &mut StdRng,
) -> HashMap<String, i64> {
    let mut prices = HashMap::new();
    for bracket in &prediction.brackets {
        let base_price = (bracket.probability * 100.0) as i64;
        let price = if noise_cents > 0 {
            base_price + rng.gen_range(-noise_cents..=noise_cents)
        } else {
            base_price
        };
        prices.insert(bracket.bracket_label.clone(), price.clamp(1, 99));
    }
    prices
}

/// Deterministic synthetic tickers: "{series}-{YYMMMDD}-B{index}".
pub fn generate_synthetic_tickers(prediction: &EnsemblePrediction) -> HashMap<String, String> {
    let event = build_event_ticker(prediction.city, prediction.date);
    prediction
        .brackets
        .iter()
        .enumerate()
        .map(|(i, bracket)| (bracket.bracket_label.clone(), format!("{}-B{}", event, i + 1)))
        .collect()
}

/// Synthetic actual highs drawn from N(ensemble_mean, ensemble_std),
/// rounded to one decimal, in the input order of predictions.
pub fn generate_settlement_temps(
    predictions: &[&EnsemblePrediction],
    rng: &mut StdRng,
) -> HashMap<(City, NaiveDate), f64> {
    let mut settlements = HashMap::new();
    for pred in predictions {
        let temp = if pred.ensemble_std_f > 0.0 {
            match Normal::new(pred.ensemble_mean_f, pred.ensemble_std_f) {
                Ok(dist) => dist.sample(rng),
                Err(_) => pred.ensemble_mean_f,
            }
        } else {
            pred.ensemble_mean_f
        };
        settlements.insert((pred.city, pred.date), (temp * 10.0).round() / 10.0);
    }
    settlements
}
