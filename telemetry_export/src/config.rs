use anyhow::{Context, Result};
use clap::Parser;
use heck::ToSnakeCase;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use telemetry_codec::VarintEncoding;

#[derive(Debug)]
pub struct Config {
    /// Enables verbose logging of errors that occur while exporting metrics
    pub debug: bool,

    /// How frequently (in seconds) to log internal debug metrics
    pub debug_interval: Option<Duration>,

    /// Where to read the metrics text exposition from.
    pub input: Endpoint,

    /// Where to append the encoded frames.
    pub output: Endpoint,

    /// How frequently to re-read the input and export a cycle.
    /// If unset, a single cycle is exported.
    pub interval: Option<Duration>,

    /// A comma separated list of static labels to add to every exported metric.
    /// e.g. "environment=production,version=0.5.0"
    pub static_labels: Vec<(String, String)>,

    /// The varint flavour both peers agreed on.
    pub varint: VarintEncoding,

    /// The schema version the peer holds before the first cycle.
    pub peer_version: u64,

    /// Whether to decode every cycle's output and compare it with the input.
    pub verify: bool,
}

/// A file path, or the process's standard stream when given as "-"
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Endpoint {
    Standard,
    Path(PathBuf),
}

impl FromStr for Endpoint {
    type Err = std::convert::Infallible;
    fn from_str(val: &str) -> std::result::Result<Self, Self::Err> {
        match val {
            "-" | "" => Ok(Endpoint::Standard),
            _ => Ok(Endpoint::Path(val.into())),
        }
    }
}

impl Config {
    /// Loads configuration from arguments, env and dotenv
    pub fn load() -> Result<Config> {
        // Attempts to find a `.env` file to initialize/extend the environment
        dotenv::dotenv().ok();

        // Load the config from arguments, then environment variables
        let env = Environment::parse();
        Config::from_environment(env, dotenv::var("DEBUG").ok())
    }

    fn from_environment(env: Environment, debug_var: Option<String>) -> Result<Config> {
        let interval = match env.interval {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        if interval.is_some() && env.input == Endpoint::Standard {
            return Err(anyhow::format_err!(
                "EXPORT_INTERVAL requires EXPORT_INPUT to be a file"
            ));
        }

        Ok(Config {
            debug: env.debug
                || match debug_var {
                    Some(val) if val == "true" || val == "on" || val == "1" => true,
                    Some(val) if val == "false" || val == "off" || val == "0" || val == "" => false,
                    Some(val) => val.parse::<bool>().context("invalid DEBUG")?,
                    None => false,
                },
            debug_interval: match env.debug_interval {
                ToggleValue::Enabled(secs) => Some(Duration::from_secs(secs)),
                ToggleValue::EnabledDefault => Some(Duration::from_secs(300)),
                ToggleValue::Disabled => None,
            },
            input: env.input,
            output: env.output,
            interval,
            static_labels: parse_static_labels(&env.labels)?,
            varint: env.varint,
            peer_version: env.peer_version,
            verify: env.verify,
        })
    }
}

fn parse_static_labels(labels: &str) -> Result<Vec<(String, String)>> {
    labels
        .split(',')
        .filter(|name_value| !name_value.trim().is_empty())
        .map(|name_value| {
            let name_value = name_value.trim().splitn(2, '=').collect::<Vec<_>>();
            match name_value.as_slice() {
                [name, value]
                    if !value.is_empty() && !name.is_empty() && *name == name.to_snake_case() =>
                {
                    Ok((name.to_string(), value.to_string()))
                }
                _ => Err(anyhow::format_err!("invalid EXPORT_LABELS")),
            }
        })
        .collect()
}

#[derive(Debug, Parser)]
#[command(name = "telemetry-export")]
struct Environment {
    /// Enables verbose logging of errors that occur while exporting metrics
    #[arg(short, long)]
    debug: bool,

    /// How frequently (in seconds) to log internal debug metrics
    #[arg(long, env = "DEBUG_INTERVAL", default_value = "300")]
    debug_interval: ToggleValue<u64>,

    /// The metrics text exposition to read ("-" for stdin)
    #[arg(short, long, env = "EXPORT_INPUT", default_value = "-")]
    input: Endpoint,

    /// The file to append encoded frames to ("-" for stdout)
    #[arg(short, long, env = "EXPORT_OUTPUT", default_value = "-")]
    output: Endpoint,

    /// How frequently (in seconds) to export; 0 exports once
    #[arg(long, env = "EXPORT_INTERVAL", default_value = "0")]
    interval: u64,

    /// A comma separated list of static labels to add to metrics
    #[arg(long, env = "EXPORT_LABELS", default_value = "")]
    labels: String,

    /// Either "compat" or "leb128"
    #[arg(long, env = "EXPORT_VARINT", default_value = "compat")]
    varint: VarintEncoding,

    /// The schema version the peer already holds
    #[arg(long, env = "EXPORT_PEER_VERSION", default_value = "0")]
    peer_version: u64,

    /// Decode each cycle's frames and compare them with the input
    #[arg(long, env = "EXPORT_VERIFY")]
    verify: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum ToggleValue<T: FromStr> {
    Enabled(T),
    EnabledDefault,
    Disabled,
}

impl<T: FromStr> Default for ToggleValue<T> {
    fn default() -> Self {
        ToggleValue::Disabled
    }
}

impl<T: FromStr> FromStr for ToggleValue<T> {
    type Err = T::Err;
    fn from_str(val: &str) -> std::result::Result<Self, Self::Err> {
        match val {
            "false" | "off" | "0" | "" => Ok(ToggleValue::Disabled),
            "true" | "on" | "1" => Ok(ToggleValue::EnabledDefault),
            _ => val.parse().map(ToggleValue::Enabled),
        }
    }
}
