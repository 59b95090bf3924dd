//! Tessera smoke renderer
//!
//! Renders the end-to-end scenarios on the software device, writes each
//! result as a PNG, and checks it against its analytic reference.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p tessera-smoke -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `-o, --output <DIR>`: Output directory (default: `smoke_output`)
//! - `-s, --size <N>`: Image width and height in pixels (default: 64)
//! - `--scenario <NAME>`: Render only this scenario (repeatable)
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)
//! - `TESSERA_VALIDATION`: Force device validation on (`1`) or off (`0`)

use anyhow::{bail, Context};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tessera_device::config::VALIDATION_ENV;
use tessera_test::{compare_with_mask, Scenario};

const DEFAULT_SIZE: u32 = 64;
const MAX_SIZE: u32 = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
struct SmokeConfig {
    output: PathBuf,
    size: u32,
    scenarios: Vec<Scenario>,
}

impl Default for SmokeConfig {
    fn default() -> Self {
        Self {
            output: PathBuf::from("smoke_output"),
            size: DEFAULT_SIZE,
            scenarios: Scenario::ALL.to_vec(),
        }
    }
}

impl SmokeConfig {
    /// Parse options; `None` means help was requested.
    fn from_args(args: &[String]) -> anyhow::Result<Option<Self>> {
        let mut config = Self::default();
        let mut selected = Vec::new();

        let mut i = 0;
        while i < args.len() {
            let value = || {
                args.get(i + 1)
                    .with_context(|| format!("{} needs a value", args[i]))
            };
            match args[i].as_str() {
                "-h" | "--help" => return Ok(None),
                "-o" | "--output" => {
                    config.output = PathBuf::from(value()?);
                    i += 1;
                }
                "-s" | "--size" => {
                    let size: u32 = value()?
                        .parse()
                        .with_context(|| format!("invalid size {:?}", args[i + 1]))?;
                    if size == 0 || size > MAX_SIZE {
                        bail!("size must be between 1 and {MAX_SIZE}");
                    }
                    config.size = size;
                    i += 1;
                }
                "--scenario" => {
                    selected.push(value()?.parse::<Scenario>()?);
                    i += 1;
                }
                other => bail!("unknown option {other:?} (see --help)"),
            }
            i += 1;
        }

        if !selected.is_empty() {
            config.scenarios = selected;
        }
        Ok(Some(config))
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(config) = SmokeConfig::from_args(&args)? else {
        print_help();
        return Ok(());
    };

    std::fs::create_dir_all(&config.output)
        .with_context(|| format!("creating {}", config.output.display()))?;
    info!(
        output = %config.output.display(),
        size = config.size,
        scenarios = config.scenarios.len(),
        "Tessera smoke run"
    );

    let mut failures = 0;
    for scenario in &config.scenarios {
        let image = scenario
            .render(config.size)
            .with_context(|| format!("rendering {scenario}"))?;
        let path = config.output.join(format!("{scenario}.png"));
        image
            .save(&path)
            .with_context(|| format!("writing {}", path.display()))?;

        let (expected, mask) = scenario.reference(config.size);
        let report = compare_with_mask(&expected, &image, &mask)?;
        if report.passed() {
            info!(%scenario, path = %path.display(), max_error = report.max_error, "Passed");
        } else {
            error!(
                %scenario,
                failed_pixels = report.failed_pixels,
                max_error = report.max_error,
                first_failure = ?report.first_failure,
                "Image outside the error mask"
            );
            failures += 1;
        }
    }

    if failures > 0 {
        bail!("{failures} of {} scenarios failed", config.scenarios.len());
    }
    info!("All scenarios passed");
    Ok(())
}

fn print_help() {
    let names: Vec<&str> = Scenario::ALL.iter().map(|s| s.name()).collect();
    eprintln!(
        "Tessera smoke renderer

USAGE:
    cargo run -p tessera-smoke -- [OPTIONS]

OPTIONS:
    -o, --output <DIR>      Output directory (default: smoke_output)
    -s, --size <N>          Image width and height in pixels (default: {DEFAULT_SIZE})
    --scenario <NAME>       Render only this scenario; may be repeated
                            Scenarios: {}
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)
    {VALIDATION_ENV}      Force device validation on (1) or off (0)",
        names.join(", ")
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<Option<SmokeConfig>> {
        let args: Vec<String> = args.iter().map(ToString::to_string).collect();
        SmokeConfig::from_args(&args)
    }

    #[test]
    fn defaults_render_everything() {
        let config = parse(&[]).unwrap().unwrap();
        assert_eq!(config, SmokeConfig::default());
        assert_eq!(config.scenarios.len(), Scenario::ALL.len());
    }

    #[test]
    fn options_are_parsed() {
        let config = parse(&["-o", "out", "--size", "32", "--scenario", "gradient"])
            .unwrap()
            .unwrap();
        assert_eq!(config.output, PathBuf::from("out"));
        assert_eq!(config.size, 32);
        assert_eq!(config.scenarios, vec![Scenario::Gradient]);
    }

    #[test]
    fn help_short_circuits() {
        assert!(parse(&["-s", "8", "-h"]).unwrap().is_none());
    }

    #[test]
    fn bad_input_is_rejected() {
        assert!(parse(&["--size", "0"]).is_err());
        assert!(parse(&["--size"]).is_err());
        assert!(parse(&["--scenario", "teapot"]).is_err());
        assert!(parse(&["--frobnicate"]).is_err());
    }
}
