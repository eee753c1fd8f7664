//! Key layout of the shared `system_config` table.
//!
//! The calibration job writes outlet bounds here and the engine reads them at
//! tick start; this is the only coupling between the two processes.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

use crate::config::EngineConfig;
use crate::models::OutletCalibration;

pub const OUTLET_PREFIX: &str = "outlet.";
pub const LAST_OUTLET_CALIBRATION: &str = "lastOutletCalibration";
pub const ENGINE_TICK_INTERVAL_MS: &str = "engine.tickIntervalMs";
pub const ENGINE_PRICE_STEP: &str = "engine.priceStep";

const AVG_PRICE: &str = "avgPrice";
const RECOMMENDED_FLOOR: &str = "recommendedFloor";
const RECOMMENDED_CEILING: &str = "recommendedCeiling";
const CONFIDENCE_SCORE: &str = "confidenceScore";
const SAMPLE_SIZE: &str = "sampleSize";
const LAST_CALIBRATION: &str = "lastCalibration";

/// `outlet.<name>.<field>`
pub fn outlet_key(outlet: &str, field: &str) -> String {
    format!("{OUTLET_PREFIX}{outlet}.{field}")
}

/// Flatten a calibration into its config rows
pub fn calibration_entries(calibration: &OutletCalibration) -> Vec<(String, String)> {
    let outlet = calibration.outlet.as_str();
    vec![
        (outlet_key(outlet, AVG_PRICE), calibration.avg_price.to_string()),
        (outlet_key(outlet, RECOMMENDED_FLOOR), calibration.recommended_floor.to_string()),
        (outlet_key(outlet, RECOMMENDED_CEILING), calibration.recommended_ceiling.to_string()),
        (outlet_key(outlet, CONFIDENCE_SCORE), calibration.confidence_score.to_string()),
        (outlet_key(outlet, SAMPLE_SIZE), calibration.sample_size.to_string()),
        (outlet_key(outlet, LAST_CALIBRATION), calibration.last_calibration.to_rfc3339()),
    ]
}

/// Flatten an engine config into its config rows
pub fn engine_config_entries(config: &EngineConfig) -> Vec<(String, String)> {
    vec![
        (ENGINE_TICK_INTERVAL_MS.to_string(), config.tick_interval_ms.to_string()),
        (ENGINE_PRICE_STEP.to_string(), config.price_step.to_string()),
    ]
}

/// Rebuild the engine config from its rows. A missing key falls back to
/// `fallback`; `None` when neither key is present or a value does not parse.
pub fn parse_engine_config(
    tick_interval_ms: Option<&str>,
    price_step: Option<&str>,
    fallback: EngineConfig,
) -> Option<EngineConfig> {
    if tick_interval_ms.is_none() && price_step.is_none() {
        return None;
    }

    let tick_interval_ms = match tick_interval_ms {
        Some(raw) => raw.trim().parse().ok()?,
        None => fallback.tick_interval_ms,
    };
    let price_step = match price_step {
        Some(raw) => raw.trim().parse().ok()?,
        None => fallback.price_step,
    };

    Some(EngineConfig { tick_interval_ms, price_step })
}

/// Rebuild calibrations from config rows. Rows that do not belong to an
/// outlet are ignored; outlets with missing or malformed fields are skipped.
pub fn parse_calibrations<I>(entries: I) -> HashMap<String, OutletCalibration>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut by_outlet: BTreeMap<String, HashMap<String, String>> = BTreeMap::new();

    for (key, value) in entries {
        let Some(rest) = key.strip_prefix(OUTLET_PREFIX) else {
            continue;
        };
        // outlet names may contain dots, the field never does
        let Some((outlet, field)) = rest.rsplit_once('.') else {
            continue;
        };
        by_outlet.entry(outlet.to_string()).or_default().insert(field.to_string(), value);
    }

    let mut calibrations = HashMap::new();
    for (outlet, fields) in by_outlet {
        match build_calibration(&outlet, &fields) {
            Some(calibration) => {
                calibrations.insert(outlet, calibration);
            }
            None => {
                warn!("Ignoring incomplete or malformed calibration for outlet {}", outlet);
            }
        }
    }

    calibrations
}

fn build_calibration(outlet: &str, fields: &HashMap<String, String>) -> Option<OutletCalibration> {
    let number = |field: &str| -> Option<f64> {
        fields.get(field)?.parse::<f64>().ok().filter(|v| v.is_finite())
    };

    let last_calibration = fields
        .get(LAST_CALIBRATION)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| ts.with_timezone(&Utc))?;

    Some(OutletCalibration {
        outlet: outlet.to_string(),
        avg_price: number(AVG_PRICE)?,
        recommended_floor: number(RECOMMENDED_FLOOR)?,
        recommended_ceiling: number(RECOMMENDED_CEILING)?,
        confidence_score: number(CONFIDENCE_SCORE)?,
        sample_size: fields.get(SAMPLE_SIZE).and_then(|v| v.parse().ok()).unwrap_or(0),
        last_calibration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn calibration(outlet: &str) -> OutletCalibration {
        OutletCalibration {
            outlet: outlet.to_string(),
            avg_price: 164.0,
            recommended_floor: 90.0,
            recommended_ceiling: 200.0,
            confidence_score: 0.62,
            sample_size: 5,
            last_calibration: Utc.with_ymd_and_hms(2026, 10, 12, 3, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_outlet_key_layout() {
        assert_eq!(outlet_key("Forbes", "avgPrice"), "outlet.Forbes.avgPrice");
    }

    #[test]
    fn test_entries_parse_back() {
        let original = calibration("techcrunch.com");
        let mut entries = calibration_entries(&original);
        entries.push((LAST_OUTLET_CALIBRATION.to_string(), "2026-10-12T03:00:00Z".to_string()));
        entries.push((ENGINE_PRICE_STEP.to_string(), "5".to_string()));

        let parsed = parse_calibrations(entries);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed["techcrunch.com"], original);
    }

    #[test]
    fn test_incomplete_outlet_is_skipped() {
        let entries = vec![
            (outlet_key("Wired", "avgPrice"), "120".to_string()),
            (outlet_key("Wired", "recommendedFloor"), "not-a-number".to_string()),
        ];
        assert!(parse_calibrations(entries).is_empty());
    }

    #[test]
    fn test_engine_config_rows() {
        let fallback = EngineConfig::default();
        assert_eq!(parse_engine_config(None, None, fallback), None);
        assert_eq!(
            parse_engine_config(None, Some("7.5"), fallback),
            Some(EngineConfig { tick_interval_ms: 60_000, price_step: 7.5 })
        );
        assert_eq!(parse_engine_config(Some("abc"), Some("5"), fallback), None);

        let config = EngineConfig { tick_interval_ms: 90_000, price_step: 3.0 };
        let rows = engine_config_entries(&config);
        assert_eq!(
            parse_engine_config(Some(&rows[0].1), Some(&rows[1].1), fallback),
            Some(config)
        );
    }
}
