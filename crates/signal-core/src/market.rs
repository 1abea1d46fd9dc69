use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use chrono_tz::US::Eastern;

/// Market-hours clock. Regular NYSE session, 09:30-16:00 Eastern, weekdays.
/// No holiday calendar; holiday data is an external-data concern.
///
/// In 24/7 mode (crypto symbols) the market is always open and every gate
/// driven by this clock is disabled.
#[derive(Debug, Clone, Copy)]
pub struct MarketClock {
    run_24_7: bool,
}

impl MarketClock {
    pub fn new(run_24_7: bool) -> Self {
        Self { run_24_7 }
    }

    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        if self.run_24_7 {
            return true;
        }
        let eastern = now.with_timezone(&Eastern);
        match eastern.weekday() {
            Weekday::Sat | Weekday::Sun => return false,
            _ => {}
        }
        let t = eastern.time();
        let open = NaiveTime::from_hms_opt(9, 30, 0).unwrap();
        let close = NaiveTime::from_hms_opt(16, 0, 0).unwrap();
        t >= open && t < close
    }

    pub fn is_open_now(&self) -> bool {
        self.is_open(Utc::now())
    }
}
