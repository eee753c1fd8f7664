//! Command line interface of the calibration binary

use clap::{Parser, Subcommand};

use crate::config::CalibrationParams;

#[derive(Debug, Parser)]
#[command(name = "outlet-calibration")]
#[command(about = "Derive per-outlet price bounds from trailing winning bids")]
#[command(version = "0.1.0")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
pub enum Command {
    /// Calibrate once and exit
    Run {
        /// Compute and print the report without writing it
        #[arg(long)]
        dry_run: bool,

        /// Trailing window in days
        #[arg(long)]
        window_days: Option<u32>,

        /// Minimum winning bids per outlet
        #[arg(long)]
        min_samples: Option<usize>,
    },

    /// Calibrate weekly at the configured slot until interrupted
    Schedule,
}

impl Cli {
    /// Apply command line overrides on top of the configured parameters
    pub fn apply_overrides(&self, params: &mut CalibrationParams) {
        if let Command::Run { window_days, min_samples, .. } = &self.command {
            if let Some(days) = window_days {
                params.window_days = *days;
            }
            if let Some(samples) = min_samples {
                params.min_sample_size = *samples;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_with_overrides() {
        let cli = Cli::try_parse_from([
            "outlet-calibration",
            "run",
            "--dry-run",
            "--window-days",
            "30",
            "--min-samples",
            "8",
        ])
        .unwrap();

        assert_eq!(cli.command, Command::Run { dry_run: true, window_days: Some(30), min_samples: Some(8) });

        let mut params = CalibrationParams::default();
        cli.apply_overrides(&mut params);
        assert_eq!(params.window_days, 30);
        assert_eq!(params.min_sample_size, 8);
    }

    #[test]
    fn test_schedule_keeps_configured_params() {
        let cli = Cli::try_parse_from(["outlet-calibration", "schedule"]).unwrap();
        let mut params = CalibrationParams::default();
        cli.apply_overrides(&mut params);
        assert_eq!(params, CalibrationParams::default());
    }

    #[test]
    fn test_unknown_subcommand_rejected() {
        assert!(Cli::try_parse_from(["outlet-calibration", "purge"]).is_err());
    }
}
