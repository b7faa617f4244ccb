use std::path::PathBuf;

use anyhow::{ensure, Context};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use sensorgw_config::{ConfigSource, GatewayConfig};
use sensorgw_engine::run_gateway;
use sensorgw_protocols::SensorFrame;
use sensorgw_telemetry::GatewayLogger;

#[derive(Parser)]
#[command(name = "sensorgw", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the gateway until a fatal error
    Run(ConfigArgs),
    /// Load and validate configuration, then print the effective values
    CheckConfig(ConfigArgs),
    /// Print a hex-encoded sensor frame
    EncodeFrame(EncodeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Configuration file; defaults to config/sensorgw.yaml when present
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct EncodeArgs {
    #[arg(long)]
    pub device: u8,
    /// Temperature in degrees Celsius
    #[arg(long)]
    pub temp: f64,
    /// Relative humidity in percent
    #[arg(long)]
    pub humi: f64,
    #[arg(long, default_value_t = 0)]
    pub status: u8,
}

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run(args),
        Commands::CheckConfig(args) => check_config(args),
        Commands::EncodeFrame(args) => {
            println!("{}", encode_frame(&args)?);
            Ok(())
        }
    }
}

fn load(args: &ConfigArgs) -> anyhow::Result<(GatewayConfig, ConfigSource)> {
    GatewayConfig::resolve(args.config.as_deref()).context("failed to load configuration")
}

fn run(args: ConfigArgs) -> anyhow::Result<()> {
    let (config, source) = load(&args)?;
    GatewayLogger::init(&config.telemetry.log_level)?;
    info!(?source, "Configuration loaded");

    run_gateway(config).context("gateway stopped")
}

fn check_config(args: ConfigArgs) -> anyhow::Result<()> {
    let (config, source) = load(&args)?;
    match source {
        ConfigSource::File(path) => eprintln!("configuration OK ({})", path.display()),
        ConfigSource::Defaults => eprintln!("configuration OK (defaults)"),
    }
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Hundredths of a unit, as carried on the wire.
fn to_raw(value: f64, name: &str) -> anyhow::Result<u16> {
    let raw = (value * 100.0).round();
    ensure!(
        raw.is_finite() && (0.0..=f64::from(u16::MAX)).contains(&raw),
        "{name} {value} is outside 0.00..=655.35"
    );
    Ok(raw as u16)
}

fn encode_frame(args: &EncodeArgs) -> anyhow::Result<String> {
    let frame = SensorFrame::new(
        args.device,
        to_raw(args.temp, "temperature")?,
        to_raw(args.humi, "humidity")?,
        args.status,
    );
    Ok(hex::encode(frame.to_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_encode_reference_frame() {
        let cli = parse(&[
            "sensorgw", "encode-frame", "--device", "3", "--temp", "25.5", "--humi", "60",
        ]);
        let Commands::EncodeFrame(args) = cli.command else {
            panic!("wrong subcommand");
        };
        assert_eq!(encode_frame(&args).unwrap(), "00080309f61770002169");
    }

    #[test]
    fn test_encode_rejects_out_of_range() {
        let args = EncodeArgs {
            device: 1,
            temp: -1.0,
            humi: 10.0,
            status: 0,
        };
        assert!(encode_frame(&args).is_err());

        let args = EncodeArgs {
            temp: 700.0,
            ..args
        };
        assert!(encode_frame(&args).is_err());
    }

    #[test]
    fn test_config_flag_is_optional() {
        let Commands::Run(args) = parse(&["sensorgw", "run"]).command else {
            panic!("wrong subcommand");
        };
        assert!(args.config.is_none());

        let Commands::CheckConfig(args) =
            parse(&["sensorgw", "check-config", "--config", "gw.yaml"]).command
        else {
            panic!("wrong subcommand");
        };
        assert_eq!(args.config, Some(PathBuf::from("gw.yaml")));
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let args = ConfigArgs {
            config: Some(PathBuf::from("/nonexistent/sensorgw.yaml")),
        };
        assert!(check_config(args).is_err());
    }
}
