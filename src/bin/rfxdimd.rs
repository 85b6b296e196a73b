use clap::Parser;
use color_eyre::eyre::{bail, eyre, Result};
use rfx_dimmer::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Line based control of a simulated light
#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// Name of the light
    #[arg(default_value = "light")]
    name: String,
    /// Brightness the light starts at (0-255)
    #[arg(short, long, default_value_t = 0)]
    start: u8,
    /// How many times each command is transmitted
    #[arg(long, default_value_t = 1)]
    repetitions: u8,
}

/// Parses `[brightness][,seconds]`
fn parse_arguments(args: Option<&str>) -> Result<(Option<u8>, Option<Duration>)> {
    let Some(args) = args else {
        return Ok((None, None));
    };

    let mut parts = args.split(',').map(str::trim);
    let brightness = match parts.next() {
        Some("") | None => None,
        Some(b) => Some(b.parse().map_err(|_| eyre!("Invalid brightness: {b}"))?),
    };
    let transition = match parts.next() {
        Some("") | None => None,
        Some(s) => {
            let seconds: f64 = s.parse().map_err(|_| eyre!("Invalid transition: {s}"))?;
            Some(Duration::try_from_secs_f64(seconds)?)
        }
    };
    if parts.next().is_some() {
        bail!("Too many arguments, use <brightness>,<seconds>");
    }
    Ok((brightness, transition))
}

fn parse_event(args: Option<&str>) -> Result<GatewayEvent> {
    let args = args.ok_or_else(|| eyre!("No event given"))?.trim().to_lowercase();
    let mut words = args.split_whitespace();
    match (words.next(), words.next()) {
        (Some("on"), None) => Ok(GatewayEvent::On),
        (Some("off"), None) => Ok(GatewayEvent::Off),
        (Some("dim"), Some(level)) => {
            let percent: u8 = level.parse().map_err(|_| eyre!("Invalid dim level: {level}"))?;
            if percent > 100 {
                bail!("Dim level must be between 0 and 100");
            }
            Ok(GatewayEvent::Dim(percent))
        }
        _ => bail!("Unknown event: {args}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| EnvFilter::new("rfx_dimmer=info")),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();
    color_eyre::install()?;

    let args = Args::parse();
    let config = GatewayConfig {
        signal_repetitions: args.repetitions,
        ..GatewayConfig::default()
    };
    let gateway = Arc::new(SimulatedGateway::new());
    let light = DimmableLight::with_brightness(
        args.name,
        QueuedSender::new(gateway, config),
        args.start,
    );

    // Inform about successful initialization
    println!("OK");

    // Mainloop: wait for user input, line by line
    let mut lines = BufReader::new(io::stdin()).lines();
    while let Some(input) = lines.next_line().await? {
        let mut cmd = input.trim().splitn(2, ':');
        let result = match cmd.next() {
            Some("turn_on") => match parse_arguments(cmd.next()) {
                Ok((brightness, transition)) => light
                    .turn_on(brightness, transition)
                    .await
                    .map_err(Into::into),
                Err(e) => Err(e),
            },
            Some("turn_off") => match parse_arguments(cmd.next()) {
                Ok((brightness, transition)) => light
                    .turn_off(brightness, transition)
                    .await
                    .map_err(Into::into),
                Err(e) => Err(e),
            },
            Some("cancel") => {
                light.cancel_transition();
                Ok(())
            }
            Some("event") => parse_event(cmd.next()).map(|event| light.apply_event(event)),
            Some("state") => {
                println!(
                    "OK brightness={} on={} transitioning={}",
                    light.brightness(),
                    light.is_on(),
                    light.is_transitioning()
                );
                continue;
            }
            Some("quit") => break,
            Some("") | None => Err(eyre!("No command given")),
            Some(other) => Err(eyre!("Unknown command: {other}")),
        };

        match result {
            // Respond with OK message
            Ok(()) => println!("OK"),
            Err(e) => eprintln!("ERR {e}"),
        }
    }

    light.cancel_transition();
    Ok(())
}
