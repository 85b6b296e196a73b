/*!
 # RFX Dimmer

 A Rust library for fading dimmable lights that sit behind an RF transceiver
 gateway. The gateway only understands absolute commands (on, off, dim to a
 percentage), so smooth transitions are produced by stepping the brightness
 every 100 ms until the target is reached.

 ## Features

 * Immediate on/off/dim commands
 * Timed fades up (`turn_on`) and down (`turn_off`)
 * Cancellation of running fades by any newer command
 * Rate limiting, retries and signal repetitions for the gateway
 * Reflecting state changes received from the gateway

 ## Example

 ```rust,no_run
 use std::sync::Arc;
 use std::time::Duration;
 use rfx_dimmer::*;

 #[tokio::main]
 async fn main() -> Result<()> {
     // Initialize tracing for logs
     tracing_subscriber::fmt::init();

     let gateway = Arc::new(SimulatedGateway::new());
     let sender = QueuedSender::new(gateway.clone(), GatewayConfig::default());
     let light = DimmableLight::new("hallway", sender);

     // Fade up to 150 over one second
     light.turn_on(Some(150), Some(Duration::from_secs(1))).await?;

     // Fade out over half a second
     tokio::time::sleep(Duration::from_secs(2)).await;
     light.turn_off(None, Some(Duration::from_millis(500))).await?;

     Ok(())
 }
 ```
*/

use thiserror::Error;

/// Custom error types for the RFX dimmer library
#[derive(Error, Debug)]
pub enum Error {
    /// The gateway rejected or failed to transmit a command
    #[error("Gateway communication error: {0}")]
    Gateway(String),

    /// Command timeout
    #[error("Command failed after {0} attempts")]
    CommandTimeout(u8),

    /// Other errors
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod event;
pub mod gateway;
pub mod light;
pub mod transition;

// Re-export key types
pub use event::GatewayEvent;
pub use gateway::{CommandSender, GatewayCommand, GatewayConfig, QueuedSender, SimulatedGateway};
pub use light::{DimmableLight, FULL_BRIGHTNESS};
pub use transition::{Tick, Transition, TICK_INTERVAL};
