//! Configuration: command-line flags, optional YAML file, validation.
//!
//! Flags take precedence over the file. The resolved [`Config`] is validated
//! before any kernel state is touched and never changes afterwards.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, ValueEnum};
use serde::Deserialize;

use tc_dropper_common::MAX_PROBABILITY;

pub const DEFAULT_MAX_PROBABILITY: u32 = 50;
pub const DEFAULT_MIN_RATE_PPS: u64 = 1_000;
pub const DEFAULT_MAX_RATE_PPS: u64 = 100_000;

/// Liveness route served next to the metrics path.
pub const HEALTH_PATH: &str = "/healthz";

// ---------------------------------------------------------------------------
// Top-Level Config
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Config {
    /// Network interface to attach to (e.g. "veth1").
    pub interface: String,

    /// Operating mode and its parameters.
    pub mode: DropMode,

    pub metrics: MetricsConfig,
}

// ---------------------------------------------------------------------------
// Mode Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DropMode {
    /// Constant drop probability, written once at startup.
    Fixed { probability: u32 },
    /// Probability derived from the observed packet rate.
    Dynamic(DynamicParams),
}

impl DropMode {
    pub fn name(&self) -> &'static str {
        match self {
            DropMode::Fixed { .. } => "fixed",
            DropMode::Dynamic(_) => "dynamic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DynamicParams {
    /// Probability applied at and above `max_rate_pps`.
    pub max_probability: u32,
    /// Rate at or below which nothing is dropped.
    pub min_rate_pps: u64,
    /// Rate at which `max_probability` is reached.
    pub max_rate_pps: u64,
}

impl Default for DynamicParams {
    fn default() -> Self {
        Self {
            max_probability: DEFAULT_MAX_PROBABILITY,
            min_rate_pps: DEFAULT_MIN_RATE_PPS,
            max_rate_pps: DEFAULT_MAX_RATE_PPS,
        }
    }
}

impl DynamicParams {
    /// Piecewise-linear map from packet rate to drop probability, truncated
    /// and clamped to `[0, max_probability]`.
    pub fn probability_for_rate(&self, pps: f64) -> u32 {
        let min = self.min_rate_pps as f64;
        let max = self.max_rate_pps as f64;

        if pps <= min {
            return 0;
        }
        if pps >= max {
            return self.max_probability;
        }

        let scaled = self.max_probability as f64 * (pps - min) / (max - min);
        // `as` saturates: NaN and negatives become 0.
        (scaled as u32).min(self.max_probability)
    }
}

// ---------------------------------------------------------------------------
// Metrics Config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_bind")]
    pub bind: SocketAddr,

    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_metrics_bind(),
            path: default_metrics_path(),
        }
    }
}

fn default_metrics_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}
fn default_metrics_path() -> String {
    "/metrics".to_string()
}

// ---------------------------------------------------------------------------
// Command-Line Flags
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Fixed,
    Dynamic,
}

/// Flags that feed [`Config`]. Flattened into the binary's CLI.
#[derive(Debug, Args)]
pub struct ConfigArgs {
    /// Network interface to attach to.
    #[arg(required_unless_present = "config")]
    pub interface: Option<String>,

    /// Operating mode.
    #[arg(long, value_enum)]
    pub mode: Option<ModeArg>,

    /// Fixed drop probability (0-100). Required for fixed mode.
    #[arg(long = "prob")]
    pub probability: Option<u32>,

    /// Maximum drop probability (0-100) in dynamic mode [default: 50].
    #[arg(long = "max-prob")]
    pub max_probability: Option<u32>,

    /// Packet rate at which dynamic mode starts dropping [default: 1000].
    #[arg(long = "min-rate")]
    pub min_rate_pps: Option<u64>,

    /// Packet rate at which dynamic mode reaches --max-prob [default: 100000].
    #[arg(long = "max-rate")]
    pub max_rate_pps: Option<u64>,

    /// Optional YAML configuration file. Flags override its values.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Serve Prometheus metrics on this address.
    #[arg(long)]
    pub metrics_bind: Option<SocketAddr>,
}

// ---------------------------------------------------------------------------
// Loading & Validation
// ---------------------------------------------------------------------------

/// YAML file layout. Every field is optional so a file can carry only part
/// of the configuration:
///
/// ```yaml
/// interface: veth1
/// mode: dynamic
/// max_probability: 40
/// metrics:
///   enabled: true
///   bind: "0.0.0.0:9090"
/// ```
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    interface: Option<String>,
    mode: Option<ModeArg>,
    probability: Option<u32>,
    max_probability: Option<u32>,
    min_rate_pps: Option<u64>,
    max_rate_pps: Option<u64>,
    #[serde(default)]
    metrics: MetricsConfig,
}

impl<'de> Deserialize<'de> for ModeArg {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ModeArg::from_str(&s, true).map_err(|_| {
            serde::de::Error::custom(format!("invalid mode '{}', use 'fixed' or 'dynamic'", s))
        })
    }
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&contents).with_context(|| "parsing YAML config")
    }
}

impl Config {
    /// Build the config from flags, layered over `--config` if given.
    pub fn resolve(args: &ConfigArgs) -> Result<Self> {
        let file = match &args.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::merge(args, file)
    }

    fn merge(args: &ConfigArgs, file: FileConfig) -> Result<Self> {
        let interface = match args.interface.clone().or(file.interface) {
            Some(iface) => iface,
            None => bail!("interface name is required"),
        };

        let mode = match args.mode.or(file.mode) {
            Some(ModeArg::Fixed) => match args.probability.or(file.probability) {
                Some(probability) => DropMode::Fixed { probability },
                None => bail!("--prob is required for fixed mode"),
            },
            Some(ModeArg::Dynamic) => {
                let defaults = DynamicParams::default();
                DropMode::Dynamic(DynamicParams {
                    max_probability: args
                        .max_probability
                        .or(file.max_probability)
                        .unwrap_or(defaults.max_probability),
                    min_rate_pps: args
                        .min_rate_pps
                        .or(file.min_rate_pps)
                        .unwrap_or(defaults.min_rate_pps),
                    max_rate_pps: args
                        .max_rate_pps
                        .or(file.max_rate_pps)
                        .unwrap_or(defaults.max_rate_pps),
                })
            }
            None => bail!("operating mode is required, use --mode <fixed|dynamic>"),
        };

        let mut metrics = file.metrics;
        if let Some(bind) = args.metrics_bind {
            metrics.enabled = true;
            metrics.bind = bind;
        }

        let config = Config {
            interface,
            mode,
            metrics,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration consistency.
    fn validate(&self) -> Result<()> {
        if self.interface.trim().is_empty() {
            bail!("interface name must not be empty");
        }

        match self.mode {
            DropMode::Fixed { probability } => {
                if probability > MAX_PROBABILITY {
                    bail!(
                        "for fixed mode, --prob must be between 0 and {}, got {}",
                        MAX_PROBABILITY,
                        probability
                    );
                }
            }
            DropMode::Dynamic(params) => {
                if params.max_probability > MAX_PROBABILITY {
                    bail!(
                        "for dynamic mode, --max-prob must be between 0 and {}, got {}",
                        MAX_PROBABILITY,
                        params.max_probability
                    );
                }
                if params.min_rate_pps >= params.max_rate_pps {
                    bail!(
                        "for dynamic mode, --min-rate ({}) must be below --max-rate ({})",
                        params.min_rate_pps,
                        params.max_rate_pps
                    );
                }
            }
        }

        if !self.metrics.path.starts_with('/') {
            bail!("metrics path must start with '/', got '{}'", self.metrics.path);
        }
        if self.metrics.path == HEALTH_PATH {
            bail!("metrics path must not be {}, it is reserved", HEALTH_PATH);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: ConfigArgs,
    }

    fn resolve(argv: &[&str]) -> Result<Config> {
        let cli = TestCli::try_parse_from(std::iter::once("tc-dropper").chain(argv.iter().copied()))
            .expect("flags should parse");
        Config::merge(&cli.args, FileConfig::default())
    }

    fn params() -> DynamicParams {
        DynamicParams {
            max_probability: 50,
            min_rate_pps: 1_000,
            max_rate_pps: 100_000,
        }
    }

    #[test]
    fn test_fixed_mode() {
        let config = resolve(&["veth1", "--mode", "fixed", "--prob", "10"]).unwrap();
        assert_eq!(config.interface, "veth1");
        assert_eq!(config.mode, DropMode::Fixed { probability: 10 });
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn test_fixed_mode_requires_probability() {
        let err = resolve(&["veth1", "--mode", "fixed"]).unwrap_err();
        assert!(err.to_string().contains("--prob"));
    }

    #[test]
    fn test_probability_out_of_range() {
        assert!(resolve(&["veth1", "--mode", "fixed", "--prob", "101"]).is_err());
        assert!(resolve(&["veth1", "--mode", "dynamic", "--max-prob", "150"]).is_err());
        assert!(resolve(&["veth1", "--mode", "fixed", "--prob", "100"]).is_ok());
        assert!(resolve(&["veth1", "--mode", "fixed", "--prob", "0"]).is_ok());
    }

    #[test]
    fn test_dynamic_defaults() {
        let config = resolve(&["veth1", "--mode", "dynamic"]).unwrap();
        assert_eq!(config.mode, DropMode::Dynamic(DynamicParams::default()));
        assert_eq!(config.mode, DropMode::Dynamic(params()));
    }

    #[test]
    fn test_dynamic_overrides() {
        let config = resolve(&[
            "eth0",
            "--mode",
            "dynamic",
            "--max-prob",
            "80",
            "--min-rate",
            "10",
            "--max-rate",
            "20",
        ])
        .unwrap();
        assert_eq!(
            config.mode,
            DropMode::Dynamic(DynamicParams {
                max_probability: 80,
                min_rate_pps: 10,
                max_rate_pps: 20,
            })
        );
    }

    #[test]
    fn test_rate_bounds_must_be_ordered() {
        let err = resolve(&[
            "veth1", "--mode", "dynamic", "--min-rate", "5000", "--max-rate", "5000",
        ])
        .unwrap_err();
        assert!(err.to_string().contains("--min-rate"));
    }

    #[test]
    fn test_mode_is_required() {
        let err = resolve(&["veth1"]).unwrap_err();
        assert!(err.to_string().contains("mode"));
    }

    #[test]
    fn test_metrics_bind_enables_metrics() {
        let config = resolve(&[
            "veth1",
            "--mode",
            "fixed",
            "--prob",
            "5",
            "--metrics-bind",
            "0.0.0.0:9100",
        ])
        .unwrap();
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.bind, "0.0.0.0:9100".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_yaml_config() {
        let file: FileConfig = serde_yaml::from_str(
            r#"
interface: veth1
mode: dynamic
max_probability: 40
metrics:
  enabled: true
"#,
        )
        .unwrap();
        let cli = TestCli::try_parse_from(["tc-dropper", "--config", "dropper.yaml"]).unwrap();

        let config = Config::merge(&cli.args, file).unwrap();
        assert_eq!(config.interface, "veth1");
        assert_eq!(
            config.mode,
            DropMode::Dynamic(DynamicParams {
                max_probability: 40,
                ..DynamicParams::default()
            })
        );
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.path, "/metrics");
    }

    #[test]
    fn test_yaml_rejects_unknown_mode() {
        assert!(serde_yaml::from_str::<FileConfig>("mode: bursty\n").is_err());
    }

    #[test]
    fn test_metrics_path_cannot_shadow_health_route() {
        let file: FileConfig = serde_yaml::from_str(
            r#"
interface: veth1
mode: fixed
probability: 5
metrics:
  enabled: true
  path: /healthz
"#,
        )
        .unwrap();
        let cli = TestCli::try_parse_from(["tc-dropper", "--config", "dropper.yaml"]).unwrap();

        let err = Config::merge(&cli.args, file).unwrap_err();
        assert!(err.to_string().contains(HEALTH_PATH), "{err}");
    }

    #[test]
    fn test_flags_override_file() {
        let file: FileConfig = serde_yaml::from_str(
            r#"
interface: veth0
mode: dynamic
min_rate_pps: 200
max_rate_pps: 400
"#,
        )
        .unwrap();
        let cli = TestCli::try_parse_from(["tc-dropper", "veth1", "--max-rate", "800"]).unwrap();

        let config = Config::merge(&cli.args, file).unwrap();
        assert_eq!(config.interface, "veth1");
        assert_eq!(
            config.mode,
            DropMode::Dynamic(DynamicParams {
                max_probability: DEFAULT_MAX_PROBABILITY,
                min_rate_pps: 200,
                max_rate_pps: 800,
            })
        );
    }

    #[test]
    fn test_rate_mapping_boundaries() {
        let p = params();
        assert_eq!(p.probability_for_rate(0.0), 0);
        assert_eq!(p.probability_for_rate(500.0), 0);
        assert_eq!(p.probability_for_rate(1_000.0), 0);
        assert_eq!(p.probability_for_rate(50_500.0), 25);
        assert_eq!(p.probability_for_rate(100_000.0), 50);
        assert_eq!(p.probability_for_rate(150_000.0), 50);
    }

    #[test]
    fn test_rate_mapping_truncates_and_is_monotonic() {
        let p = params();
        // 50 * 2980 / 99000 = 1.505..
        assert_eq!(p.probability_for_rate(3_980.0), 1);

        let mut last = 0;
        for pps in (0..200_000).step_by(997) {
            let prob = p.probability_for_rate(pps as f64);
            assert!(prob >= last);
            assert!(prob <= p.max_probability);
            last = prob;
        }
    }

    #[test]
    fn test_rate_mapping_nan_is_zero() {
        assert_eq!(params().probability_for_rate(f64::NAN), 0);
    }
}
