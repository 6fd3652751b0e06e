//! Rate-limited account - counters and availability for one outgoing identity

use chrono::{DateTime, Duration, DurationRound, NaiveDate, Utc};
use outreach_common::types::AccountConfig;
use serde::Serialize;

/// Why an account can or cannot take a send right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Available,
    /// Circuit open after repeated failures
    Inactive,
    DailyLimit,
    HourlyLimit,
    /// Minimum spacing since the last send has not elapsed
    Spacing,
    /// Another attempt currently holds the account
    Leased,
}

/// Point-in-time view of an account's counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountSnapshot {
    pub name: String,
    pub sent_today: u32,
    pub sent_this_hour: u32,
    pub daily_limit: u32,
    pub hourly_limit: u32,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub consecutive_failures: u32,
}

/// One outgoing identity with its runtime counters
#[derive(Debug)]
pub struct RateLimitedAccount {
    config: AccountConfig,
    sent_today: u32,
    sent_this_hour: u32,
    day_window_start: NaiveDate,
    hour_window_start: DateTime<Utc>,
    last_sent_at: Option<DateTime<Utc>>,
    active: bool,
    consecutive_failures: u32,
    leased: bool,
}

fn hour_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.duration_trunc(Duration::hours(1)).unwrap_or(now)
}

impl RateLimitedAccount {
    pub fn new(config: AccountConfig, now: DateTime<Utc>) -> Self {
        Self {
            config,
            sent_today: 0,
            sent_this_hour: 0,
            day_window_start: now.date_naive(),
            hour_window_start: hour_start(now),
            last_sent_at: None,
            active: true,
            consecutive_failures: 0,
            leased: false,
        }
    }

    pub fn config(&self) -> &AccountConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn sent_today(&self) -> u32 {
        self.sent_today
    }

    pub fn sent_this_hour(&self) -> u32 {
        self.sent_this_hour
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub(crate) fn is_leased(&self) -> bool {
        self.leased
    }

    pub(crate) fn set_leased(&mut self, leased: bool) {
        self.leased = leased;
    }

    /// Restart both windows at `now`, keeping counters
    pub(crate) fn restamp_windows(&mut self, now: DateTime<Utc>) {
        self.day_window_start = now.date_naive();
        self.hour_window_start = hour_start(now);
    }

    /// Reset counters whose window has been crossed
    pub fn roll_windows(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today > self.day_window_start {
            self.sent_today = 0;
            self.day_window_start = today;
        }

        let hour = hour_start(now);
        if hour > self.hour_window_start {
            self.sent_this_hour = 0;
            self.hour_window_start = hour;
        }
    }

    /// Availability at `now`; call [`roll_windows`](Self::roll_windows) first
    pub fn availability(&self, now: DateTime<Utc>) -> Availability {
        if !self.active {
            return Availability::Inactive;
        }

        if self.sent_today >= self.config.daily_limit {
            return Availability::DailyLimit;
        }

        if self.sent_this_hour >= self.config.hourly_limit {
            return Availability::HourlyLimit;
        }

        if let Some(last) = self.last_sent_at {
            let elapsed = now.signed_duration_since(last);
            let min_delay = Duration::milliseconds((self.config.min_delay_secs * 1000.0) as i64);
            if elapsed < min_delay {
                return Availability::Spacing;
            }
        }

        if self.leased {
            return Availability::Leased;
        }

        Availability::Available
    }

    /// Account a delivered message
    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.roll_windows(now);
        self.sent_today += 1;
        self.sent_this_hour += 1;
        self.last_sent_at = Some(now);
        self.consecutive_failures = 0;
    }

    /// Account a failed attempt; returns true when this failure opened the circuit
    pub fn record_failure(&mut self, max_failures: u32) -> bool {
        self.consecutive_failures += 1;

        if self.active && self.consecutive_failures >= max_failures {
            self.active = false;
            return true;
        }

        false
    }

    /// Clear the circuit breaker after the account has been fixed
    pub fn reactivate(&mut self) {
        self.active = true;
        self.consecutive_failures = 0;
    }

    pub fn snapshot(&self) -> AccountSnapshot {
        AccountSnapshot {
            name: self.config.name.clone(),
            sent_today: self.sent_today,
            sent_this_hour: self.sent_this_hour,
            daily_limit: self.config.daily_limit,
            hourly_limit: self.config.hourly_limit,
            last_sent_at: self.last_sent_at,
            active: self.active,
            consecutive_failures: self.consecutive_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
    }

    fn account(daily: u32, hourly: u32, delay: f64) -> RateLimitedAccount {
        let config = AccountConfig::new("a1", "smtp.example.com", "me@example.com")
            .with_limits(daily, hourly)
            .with_min_delay(delay);
        RateLimitedAccount::new(config, at(9, 0))
    }

    #[test]
    fn test_daily_limit_blocks() {
        let mut acc = account(2, 10, 0.0);
        acc.record_success(at(9, 1));
        acc.record_success(at(9, 2));
        assert_eq!(acc.availability(at(9, 3)), Availability::DailyLimit);
        assert_eq!(acc.sent_today(), 2);
    }

    #[test]
    fn test_hour_window_resets() {
        let mut acc = account(100, 1, 0.0);
        acc.record_success(at(9, 30));
        assert_eq!(acc.availability(at(9, 45)), Availability::HourlyLimit);

        acc.roll_windows(at(10, 0));
        assert_eq!(acc.sent_this_hour(), 0);
        assert_eq!(acc.sent_today(), 1);
        assert_eq!(acc.availability(at(10, 0)), Availability::Available);
    }

    #[test]
    fn test_min_delay_spacing() {
        let mut acc = account(100, 100, 120.0);
        acc.record_success(at(9, 0));
        assert_eq!(acc.availability(at(9, 1)), Availability::Spacing);
        assert_eq!(acc.availability(at(9, 2)), Availability::Available);
    }

    #[test]
    fn test_failure_opens_circuit_once() {
        let mut acc = account(100, 100, 0.0);
        for _ in 0..4 {
            assert!(!acc.record_failure(5));
        }
        assert!(acc.record_failure(5));
        assert!(!acc.is_active());
        assert!(!acc.record_failure(5));
        assert_eq!(acc.availability(at(9, 0)), Availability::Inactive);

        acc.reactivate();
        assert_eq!(acc.availability(at(9, 0)), Availability::Available);
    }

    #[test]
    fn test_success_resets_failures() {
        let mut acc = account(100, 100, 0.0);
        acc.record_failure(5);
        acc.record_failure(5);
        acc.record_success(at(9, 5));
        assert_eq!(acc.consecutive_failures(), 0);
    }

    #[test]
    fn test_failure_does_not_consume_quota() {
        let mut acc = account(1, 1, 0.0);
        acc.record_failure(5);
        assert_eq!(acc.sent_today(), 0);
        assert_eq!(acc.availability(at(9, 0)), Availability::Available);
    }
}
