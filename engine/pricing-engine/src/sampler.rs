//! Signal sampler: reads the current value of each requested signal for an opportunity

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::models::{OpportunityId, SignalReading};
use crate::store::ActivityStore;

/// Signals the sampler knows how to compute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Bids24h,
    Pitches24h,
    PitchesTotal,
    Clicks24h,
    Saves24h,
    HoursToDeadline,
    HoursSincePosted,
}

impl Signal {
    pub const ALL: [Signal; 7] = [
        Signal::Bids24h,
        Signal::Pitches24h,
        Signal::PitchesTotal,
        Signal::Clicks24h,
        Signal::Saves24h,
        Signal::HoursToDeadline,
        Signal::HoursSincePosted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Bids24h => "bids_24h",
            Signal::Pitches24h => "pitches_24h",
            Signal::PitchesTotal => "pitches_total",
            Signal::Clicks24h => "clicks_24h",
            Signal::Saves24h => "saves_24h",
            Signal::HoursToDeadline => "hours_to_deadline",
            Signal::HoursSincePosted => "hours_since_posted",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|signal| signal.as_str() == name)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct SignalSampler {
    activity: Arc<dyn ActivityStore>,
}

impl SignalSampler {
    pub fn new(activity: Arc<dyn ActivityStore>) -> Self {
        Self { activity }
    }

    /// Sample every requested variable for one opportunity.
    ///
    /// Unknown names, failed lookups and non-finite values contribute a zero
    /// reading; a single bad signal never fails the whole sample.
    pub async fn sample(
        &self,
        opportunity_id: OpportunityId,
        variable_names: &[String],
        now: DateTime<Utc>,
    ) -> HashMap<String, SignalReading> {
        let lookups = variable_names.iter().map(|name| async move {
            let reading = match Signal::from_name(name) {
                Some(signal) => self.read_one(opportunity_id, signal, now).await,
                None => {
                    debug!("No sampler for variable {}, defaulting to 0", name);
                    SignalReading::zero()
                }
            };
            (name.clone(), reading)
        });

        join_all(lookups).await.into_iter().collect()
    }

    async fn read_one(
        &self,
        opportunity_id: OpportunityId,
        signal: Signal,
        now: DateTime<Utc>,
    ) -> SignalReading {
        match self.activity.read_signal(opportunity_id, signal, now).await {
            Ok(reading) if reading.value.is_finite() => reading,
            Ok(reading) => {
                warn!(
                    "Signal {} for opportunity {} returned non-finite value {}, using 0",
                    signal, opportunity_id, reading.value
                );
                SignalReading::zero()
            }
            Err(e) => {
                warn!("Failed to sample {} for opportunity {}: {}, using 0", signal, opportunity_id, e);
                metrics::increment_counter!("pricing_signal_failures_total", "signal" => signal.as_str());
                SignalReading::zero()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PricingError, Result};
    use crate::memory::MemoryStore;
    use async_trait::async_trait;

    struct FlakyActivity {
        inner: MemoryStore,
        failing: Signal,
    }

    #[async_trait]
    impl ActivityStore for FlakyActivity {
        async fn read_signal(
            &self,
            opportunity_id: OpportunityId,
            signal: Signal,
            now: DateTime<Utc>,
        ) -> Result<SignalReading> {
            if signal == self.failing {
                return Err(PricingError::sampling(opportunity_id, "activity table unavailable"));
            }
            self.inner.read_signal(opportunity_id, signal, now).await
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_signal_names_round_trip() {
        for signal in Signal::ALL {
            assert_eq!(Signal::from_name(signal.as_str()), Some(signal));
        }
        assert_eq!(Signal::from_name("unknown"), None);
    }

    #[tokio::test]
    async fn test_sample_reads_known_signals() {
        let store = MemoryStore::new();
        store.set_signal(7, Signal::Pitches24h, SignalReading::new(3.0, 2.0)).await;
        store.set_signal(7, Signal::Clicks24h, SignalReading::new(40.0, 0.5)).await;

        let sampler = SignalSampler::new(Arc::new(store));
        let readings = sampler.sample(7, &names(&["pitches_24h", "clicks_24h", "saves_24h"]), Utc::now()).await;

        assert_eq!(readings["pitches_24h"], SignalReading::new(3.0, 2.0));
        assert_eq!(readings["clicks_24h"].value, 40.0);
        assert_eq!(readings["saves_24h"], SignalReading::zero());
    }

    #[tokio::test]
    async fn test_failed_signal_is_isolated() {
        let inner = MemoryStore::new();
        inner.set_signal(1, Signal::Pitches24h, SignalReading::new(3.0, 0.0)).await;
        inner.set_signal(1, Signal::Bids24h, SignalReading::new(9.0, 0.0)).await;

        let sampler = SignalSampler::new(Arc::new(FlakyActivity { inner, failing: Signal::Bids24h }));
        let readings = sampler.sample(1, &names(&["pitches_24h", "bids_24h", "mystery"]), Utc::now()).await;

        assert_eq!(readings.len(), 3);
        assert_eq!(readings["pitches_24h"].value, 3.0);
        assert_eq!(readings["bids_24h"].value, 0.0);
        assert_eq!(readings["mystery"].value, 0.0);
    }
}
