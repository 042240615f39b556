use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::config::UserSettings;
use crate::db::Database;
use crate::risk::{end_of_trading_day, trading_day_for};

/// Manages per-loss and consecutive-loss cooldown timers.
///
/// Two kinds of cooldown share the `cooldown_until` field on the daily
/// risk state:
///   - per-loss: each settled loss extends the deadline by a configured
///     number of minutes (monotonically, never retracted within a day);
///   - rest-of-day: hitting the consecutive-loss limit pushes the deadline
///     to 23:59:59 ET of the current trading day.
/// A win resets the loss counter only; an existing timer expires naturally.
pub struct CooldownManager<'a> {
    pub settings: &'a UserSettings,
    pub db: &'a Database,
    pub user_id: &'a str,
}

impl<'a> CooldownManager<'a> {
    pub fn new(settings: &'a UserSettings, db: &'a Database, user_id: &'a str) -> Self {
        CooldownManager {
            settings,
            db,
            user_id,
        }
    }

    /// Whether any cooldown is active. Active means strictly
    /// `now < cooldown_until`; at the deadline itself trading resumes.
    ///
    /// The reason distinguishes a rest-of-day cooldown (deadline within a
    /// minute of 23:59:59 ET) from a per-loss timer with remaining minutes.
    pub fn is_cooldown_active(&self, now: DateTime<Utc>) -> Result<(bool, String)> {
        let day = trading_day_for(now);
        let Some(state) = self.db.get_daily_state(self.user_id, day)? else {
            return Ok((false, String::new()));
        };
        let Some(cooldown_until) = state.cooldown_until else {
            return Ok((false, String::new()));
        };

        if now < cooldown_until {
            let end_of_day = end_of_trading_day(now);
            let is_rest_of_day = (cooldown_until - end_of_day).num_seconds().abs() < 60;

            let reason = if is_rest_of_day {
                info!(
                    consecutive_losses = state.consecutive_losses,
                    "Cooldown active (consecutive-loss)"
                );
                "Consecutive loss limit hit -- paused for rest of trading day".to_string()
            } else {
                let remaining_min = (cooldown_until - now).num_seconds() as f64 / 60.0;
                info!(
                    remaining_min = format!("{:.1}", remaining_min),
                    "Cooldown active (per-loss)"
                );
                format!("Per-loss cooldown: {:.0} min remaining", remaining_min)
            };
            return Ok((true, reason));
        }

        Ok((false, String::new()))
    }

    /// Settled loss: extend the per-loss timer, bump the loss counter, and
    /// escalate to a rest-of-day pause at the consecutive-loss limit.
    pub fn on_trade_loss(&self, now: DateTime<Utc>) -> Result<()> {
        let day = trading_day_for(now);
        let state = self.db.ensure_daily_state(self.user_id, day)?;

        let mut cooldown_until = state.cooldown_until;

        if self.settings.cooldown_per_loss_minutes > 0 {
            let candidate = now + Duration::minutes(self.settings.cooldown_per_loss_minutes);
            // Deadlines only ever move forward within a trading day.
            cooldown_until = Some(match cooldown_until {
                Some(current) => current.max(candidate),
                None => candidate,
            });
            info!(until = %candidate, "Per-loss cooldown activated");
        }

        let consecutive_losses = state.consecutive_losses + 1;

        if self.settings.consecutive_loss_limit > 0
            && consecutive_losses >= self.settings.consecutive_loss_limit
        {
            let end_of_day = end_of_trading_day(now);
            cooldown_until = Some(match cooldown_until {
                Some(current) => current.max(end_of_day),
                None => end_of_day,
            });
            warn!(
                count = consecutive_losses,
                limit = self.settings.consecutive_loss_limit,
                cooldown_until = %end_of_day,
                "Consecutive loss limit hit -- rest of day cooldown"
            );
        }

        self.db
            .update_cooldown_state(self.user_id, day, cooldown_until, consecutive_losses)?;
        Ok(())
    }

    /// Settled win: reset the consecutive loss counter. The per-loss
    /// timer is deliberately left untouched.
    pub fn on_trade_win(&self, now: DateTime<Utc>) -> Result<()> {
        let day = trading_day_for(now);
        let state = self.db.ensure_daily_state(self.user_id, day)?;
        self.db
            .update_cooldown_state(self.user_id, day, state.cooldown_until, 0)?;
        info!(user_id = %self.user_id, "Consecutive loss counter reset (win)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn setup() -> (Database, UserSettings) {
        (Database::open_in_memory().unwrap(), UserSettings::default())
    }

    fn noon_utc() -> DateTime<Utc> {
        // 07:00 ET, comfortably inside one ET trading day.
        Utc.with_ymd_and_hms(2026, 2, 18, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_no_state_means_no_cooldown() {
        let (db, settings) = setup();
        let cm = CooldownManager::new(&settings, &db, "u1");
        let (active, reason) = cm.is_cooldown_active(noon_utc()).unwrap();
        assert!(!active);
        assert!(reason.is_empty());
    }

    #[test]
    fn test_loss_starts_per_loss_cooldown() {
        let (db, settings) = setup();
        let cm = CooldownManager::new(&settings, &db, "u1");
        let now = noon_utc();
        cm.on_trade_loss(now).unwrap();

        let (active, reason) = cm.is_cooldown_active(now + Duration::minutes(30)).unwrap();
        assert!(active);
        assert!(reason.contains("Per-loss cooldown"));
        assert!(reason.contains("30 min"));

        // After the 60-minute timer, trading resumes.
        let (active, _) = cm.is_cooldown_active(now + Duration::minutes(61)).unwrap();
        assert!(!active);
    }

    #[test]
    fn test_cooldown_boundary_is_strict() {
        let (db, settings) = setup();
        let cm = CooldownManager::new(&settings, &db, "u1");
        let now = noon_utc();
        cm.on_trade_loss(now).unwrap();

        let deadline = now + Duration::minutes(settings.cooldown_per_loss_minutes);
        // Exactly at the deadline the cooldown is NOT active.
        let (active, _) = cm.is_cooldown_active(deadline).unwrap();
        assert!(!active);
        let (active, _) = cm
            .is_cooldown_active(deadline - Duration::seconds(1))
            .unwrap();
        assert!(active);
    }

    #[test]
    fn test_deadline_extends_monotonically() {
        let (db, settings) = setup();
        let cm = CooldownManager::new(&settings, &db, "u1");
        let now = noon_utc();

        cm.on_trade_loss(now).unwrap();
        let first = db
            .get_daily_state("u1", trading_day_for(now))
            .unwrap()
            .unwrap()
            .cooldown_until
            .unwrap();

        // A later loss pushes the deadline forward, never backward.
        cm.on_trade_loss(now + Duration::minutes(10)).unwrap();
        let second = db
            .get_daily_state("u1", trading_day_for(now))
            .unwrap()
            .unwrap()
            .cooldown_until
            .unwrap();
        assert!(second > first);
        assert_eq!(second, now + Duration::minutes(70));
    }

    #[test]
    fn test_consecutive_loss_limit_halts_rest_of_day() {
        let (db, settings) = setup(); // limit 3
        let cm = CooldownManager::new(&settings, &db, "u1");
        let now = noon_utc();

        cm.on_trade_loss(now).unwrap();
        cm.on_trade_loss(now).unwrap();
        let state = db
            .get_daily_state("u1", trading_day_for(now))
            .unwrap()
            .unwrap();
        assert_eq!(state.consecutive_losses, 2);

        cm.on_trade_loss(now).unwrap();
        let state = db
            .get_daily_state("u1", trading_day_for(now))
            .unwrap()
            .unwrap();
        assert_eq!(state.consecutive_losses, 3);
        assert_eq!(state.cooldown_until.unwrap(), end_of_trading_day(now));

        // The next signal the same day is blocked with the rest-of-day reason.
        let (active, reason) = cm.is_cooldown_active(now + Duration::hours(2)).unwrap();
        assert!(active);
        assert!(reason.contains("rest of trading day"));
    }

    #[test]
    fn test_win_resets_counter_but_keeps_timer() {
        let (db, settings) = setup();
        let cm = CooldownManager::new(&settings, &db, "u1");
        let now = noon_utc();

        cm.on_trade_loss(now).unwrap();
        cm.on_trade_loss(now).unwrap();
        cm.on_trade_win(now + Duration::minutes(5)).unwrap();

        let state = db
            .get_daily_state("u1", trading_day_for(now))
            .unwrap()
            .unwrap();
        assert_eq!(state.consecutive_losses, 0);
        // The per-loss timer is NOT cleared by the win.
        assert_eq!(state.cooldown_until.unwrap(), now + Duration::minutes(60));
        let (active, _) = cm.is_cooldown_active(now + Duration::minutes(30)).unwrap();
        assert!(active);
    }

    #[test]
    fn test_zero_per_loss_minutes_only_counts() {
        let (db, mut settings) = setup();
        settings.cooldown_per_loss_minutes = 0;
        let cm = CooldownManager::new(&settings, &db, "u1");
        let now = noon_utc();

        cm.on_trade_loss(now).unwrap();
        let (active, _) = cm.is_cooldown_active(now + Duration::seconds(1)).unwrap();
        assert!(!active);
        let state = db
            .get_daily_state("u1", trading_day_for(now))
            .unwrap()
            .unwrap();
        assert_eq!(state.consecutive_losses, 1);
        assert!(state.cooldown_until.is_none());
    }

    #[test]
    fn test_zero_loss_limit_never_halts() {
        let (db, mut settings) = setup();
        settings.consecutive_loss_limit = 0;
        settings.cooldown_per_loss_minutes = 0;
        let cm = CooldownManager::new(&settings, &db, "u1");
        let now = noon_utc();

        for _ in 0..10 {
            cm.on_trade_loss(now).unwrap();
        }
        let state = db
            .get_daily_state("u1", trading_day_for(now))
            .unwrap()
            .unwrap();
        assert_eq!(state.consecutive_losses, 10);
        assert!(state.cooldown_until.is_none());
    }
}
