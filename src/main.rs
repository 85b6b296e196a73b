use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{eyre, Result};
use rfx_dimmer::*;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, info, instrument, trace};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Brightness the light starts at (0-255)
    #[arg(short, long, default_value_t = 0)]
    start: u8,

    #[command(flatten)]
    gateway: GatewayArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Debug)]
struct GatewayArgs {
    /// How many times each command is transmitted
    #[arg(long, default_value_t = 1)]
    repetitions: u8,
    /// Minimum delay between commands in milliseconds
    #[arg(long, default_value_t = 0)]
    command_delay: u64,
    /// Attempts per command before giving up
    #[arg(long, default_value_t = 3)]
    retries: u8,
}

impl GatewayArgs {
    fn config(&self) -> GatewayConfig {
        GatewayConfig {
            signal_repetitions: self.repetitions,
            command_delay: Duration::from_millis(self.command_delay),
            max_retries: self.retries,
            ..GatewayConfig::default()
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Demonstration of fades
    Demo,
    /// Turn the light on
    On {
        /// Brightness level (0-255)
        #[arg(short, long)]
        brightness: Option<u8>,
        /// Fade duration in seconds
        #[arg(short, long)]
        transition: Option<f64>,
    },
    /// Turn the light off
    Off {
        /// Brightness to fade down to (0-255)
        #[arg(short, long)]
        brightness: Option<u8>,
        /// Fade duration in seconds
        #[arg(short, long)]
        transition: Option<f64>,
    },
}

type Light = DimmableLight<QueuedSender<Arc<SimulatedGateway>>>;

#[tokio::main]
#[instrument]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| EnvFilter::new("rfx_dimmer=info")),
        )
        .compact()
        .init();

    color_eyre::install()?;

    let cli = Cli::parse();
    debug!("Parsed command line arguments");

    let gateway = Arc::new(SimulatedGateway::new());
    let sender = QueuedSender::new(gateway.clone(), cli.gateway.config());
    let light = DimmableLight::with_brightness("light", sender, cli.start);

    match cli.command.unwrap_or(Commands::Demo) {
        Commands::Demo => {
            run_demo(&light).await?;
        }
        Commands::On {
            brightness,
            transition,
        } => {
            light
                .turn_on(brightness, parse_transition(transition)?)
                .await?;
        }
        Commands::Off {
            brightness,
            transition,
        } => {
            light
                .turn_off(brightness, parse_transition(transition)?)
                .await?;
        }
    }

    wait_for_transition(&light).await;
    print_history(&gateway);
    println!(
        "Final brightness {} ({})",
        light.brightness(),
        if light.is_on() { "on" } else { "off" }
    );

    Ok(())
}

/// Converts a seconds argument to a duration
fn parse_transition(seconds: Option<f64>) -> Result<Option<Duration>> {
    seconds
        .map(|s| {
            Duration::try_from_secs_f64(s).map_err(|e| eyre!("Invalid transition {}: {}", s, e))
        })
        .transpose()
}

/// Waits until the light stops stepping
#[instrument(skip(light))]
async fn wait_for_transition(light: &Light) {
    while light.is_transitioning() {
        trace!("Waiting for transition to finish");
        tokio::time::sleep(TICK_INTERVAL).await;
    }
}

fn print_history(gateway: &SimulatedGateway) {
    for sent in gateway.history() {
        println!("{}  {}", sent.wall.format("%H:%M:%S%.3f"), sent.command);
    }
}

/// Run a demonstration of fades and cancellation
#[instrument(skip(light))]
async fn run_demo(light: &Light) -> Result<()> {
    info!("Running fade demo");

    info!("Turning light on");
    light.turn_on(None, None).await?;

    info!("Setting brightness to 50");
    light.turn_on(Some(50), None).await?;

    info!("Fading up to 150 over 1s");
    light
        .turn_on(Some(150), Some(Duration::from_secs(1)))
        .await?;
    wait_for_transition(light).await;

    info!("Fading up to full over 3s, interrupted after 1s");
    light.turn_on(None, Some(Duration::from_secs(3))).await?;
    tokio::time::sleep(Duration::from_secs(1)).await;
    light.turn_on(Some(200), None).await?;

    info!("Fading down to 100 over 1s");
    light
        .turn_off(Some(100), Some(Duration::from_secs(1)))
        .await?;
    wait_for_transition(light).await;

    info!("Fading out over 0.5s");
    light
        .turn_off(None, Some(Duration::from_millis(500)))
        .await?;
    wait_for_transition(light).await;

    info!("Demo completed!");
    Ok(())
}
