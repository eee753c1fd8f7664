//! Weekly calibration schedule

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc, Weekday};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info};

use crate::calibrator::Calibrator;
use crate::store::{CalibrationSink, OutcomeStore};

/// First `weekday` at `time` (UTC) strictly after `now`
pub fn next_run_after(now: DateTime<Utc>, weekday: Weekday, time: NaiveTime) -> DateTime<Utc> {
    let days_ahead = (7 + weekday.num_days_from_monday() as i64 - now.weekday().num_days_from_monday() as i64) % 7;
    let candidate = (now.date_naive() + Duration::days(days_ahead)).and_time(time).and_utc();

    if candidate > now {
        candidate
    } else {
        candidate + Duration::days(7)
    }
}

/// Runs the calibrator once a week until shutdown
pub struct CalibrationScheduler {
    calibrator: Calibrator,
    outcomes: Arc<dyn OutcomeStore>,
    sink: Arc<dyn CalibrationSink>,
    weekday: Weekday,
    time: NaiveTime,
}

impl CalibrationScheduler {
    pub fn new(
        calibrator: Calibrator,
        outcomes: Arc<dyn OutcomeStore>,
        sink: Arc<dyn CalibrationSink>,
        weekday: Weekday,
        time: NaiveTime,
    ) -> Self {
        Self { calibrator, outcomes, sink, weekday, time }
    }

    /// A failed run is logged and retried at the next weekly slot
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting weekly calibration schedule ({} {} UTC)", self.weekday, self.time.format("%H:%M"));

        loop {
            let now = Utc::now();
            let next_run = next_run_after(now, self.weekday, self.time);
            let wait = (next_run - now).to_std().unwrap_or_default();
            info!("Next calibration scheduled for: {}", next_run);

            tokio::select! {
                _ = sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match self.calibrator.run(self.outcomes.as_ref(), self.sink.as_ref(), next_run, false).await {
                Ok(report) => info!("Weekly calibration completed for {} outlets", report.outlets.len()),
                Err(e) => error!("Weekly calibration failed, nothing written: {}", e),
            }
        }

        info!("Calibration schedule stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        // 2026-10-19 is a Monday
        Utc.with_ymd_and_hms(2026, 10, day, hour, minute, 0).unwrap()
    }

    fn three_am() -> NaiveTime {
        NaiveTime::from_hms_opt(3, 0, 0).unwrap()
    }

    #[test]
    fn test_next_run_later_same_day() {
        assert_eq!(next_run_after(at(19, 1, 30), Weekday::Mon, three_am()), at(19, 3, 0));
    }

    #[test]
    fn test_next_run_rolls_to_next_week() {
        assert_eq!(next_run_after(at(19, 3, 0), Weekday::Mon, three_am()), at(26, 3, 0));
        assert_eq!(next_run_after(at(19, 9, 0), Weekday::Mon, three_am()), at(26, 3, 0));
    }

    #[test]
    fn test_next_run_mid_week() {
        assert_eq!(next_run_after(at(22, 12, 0), Weekday::Mon, three_am()), at(26, 3, 0));
        assert_eq!(next_run_after(at(22, 12, 0), Weekday::Fri, three_am()), at(23, 3, 0));
    }
}
