use futures::future::{self, BoxFuture};
use parking_lot::Mutex as SyncMutex;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{Error, Result};

/// Absolute command understood by a gateway lighting device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayCommand {
    /// Switch on at full or last-known level
    On,
    /// Switch off
    Off,
    /// Dim to a percentage (0-100)
    Dim(u8),
}

impl fmt::Display for GatewayCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayCommand::On => write!(f, "on"),
            GatewayCommand::Off => write!(f, "off"),
            GatewayCommand::Dim(percent) => write!(f, "dim {}%", percent),
        }
    }
}

/// Something that can deliver lighting commands to a device
pub trait CommandSender: Send + Sync {
    /// Commands the device on
    fn send_on(&self) -> BoxFuture<'_, Result<()>>;

    /// Commands the device off
    fn send_off(&self) -> BoxFuture<'_, Result<()>>;

    /// Commands the device to a dim percentage (0-100)
    fn send_dim(&self, percent: u8) -> BoxFuture<'_, Result<()>>;

    /// Dispatches `command` to the matching operation
    fn send(&self, command: GatewayCommand) -> BoxFuture<'_, Result<()>> {
        match command {
            GatewayCommand::On => self.send_on(),
            GatewayCommand::Off => self.send_off(),
            GatewayCommand::Dim(percent) => self.send_dim(percent),
        }
    }
}

impl<T: CommandSender + ?Sized> CommandSender for Arc<T> {
    fn send_on(&self) -> BoxFuture<'_, Result<()>> {
        (**self).send_on()
    }

    fn send_off(&self) -> BoxFuture<'_, Result<()>> {
        (**self).send_off()
    }

    fn send_dim(&self, percent: u8) -> BoxFuture<'_, Result<()>> {
        (**self).send_dim(percent)
    }
}

/// Transmission settings for a gateway
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// How many times every command is transmitted
    pub signal_repetitions: u8,
    /// Minimum time between two transmissions
    pub command_delay: Duration,
    /// Attempts per transmission before giving up
    pub max_retries: u8,
    /// Wait between failed attempts
    pub retry_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            signal_repetitions: 1,
            command_delay: Duration::ZERO,
            max_retries: 3,
            retry_delay: Duration::from_millis(300),
        }
    }
}

/// Serializes transmissions and keeps them at least `min_delay` apart
struct CommandQueue {
    min_delay: Duration,
    /// Held for the whole transmission, so only one runs at a time
    last_command: Mutex<Option<Instant>>,
}

impl CommandQueue {
    fn new(min_delay: Duration) -> Self {
        Self {
            min_delay,
            last_command: Mutex::new(None),
        }
    }

    async fn execute<T, F>(&self, future: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let mut last_cmd = self.last_command.lock().await;

        // Check if we need to wait before executing
        if let Some(last) = *last_cmd {
            let elapsed = last.elapsed();
            if elapsed < self.min_delay {
                let wait_time = self.min_delay - elapsed;
                trace!("Rate limiting: waiting {:?} before next command", wait_time);
                time::sleep(wait_time).await;
            }
        }

        let result = future.await;
        *last_cmd = Some(Instant::now());

        result
    }
}

/// Wraps a sender with rate limiting, retries and signal repetitions
pub struct QueuedSender<S> {
    inner: S,
    config: GatewayConfig,
    queue: CommandQueue,
}

impl<S: CommandSender> QueuedSender<S> {
    pub fn new(inner: S, config: GatewayConfig) -> Self {
        debug!("Creating command queue with {:?}", config);
        let queue = CommandQueue::new(config.command_delay);
        Self {
            inner,
            config,
            queue,
        }
    }

    /// Sends `command` once per configured repetition
    #[instrument(skip(self))]
    async fn transmit(&self, command: GatewayCommand) -> Result<()> {
        let repetitions = self.config.signal_repetitions.max(1);
        for repetition in 0..repetitions {
            trace!("Repetition {}/{}", repetition + 1, repetitions);
            self.queue.execute(self.transmit_once(command)).await?;
        }
        Ok(())
    }

    /// Single transmission with retries
    async fn transmit_once(&self, command: GatewayCommand) -> Result<()> {
        let max_retries = self.config.max_retries.max(1);
        let mut attempt = 0;

        loop {
            trace!(
                "Sending {} (attempt {}/{})",
                command,
                attempt + 1,
                max_retries
            );

            match self.inner.send(command).await {
                Ok(()) => {
                    trace!("Command sent successfully");
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;
                    warn!(
                        "Command {} failed (attempt {}/{}): {}",
                        command, attempt, max_retries, e
                    );

                    if attempt >= max_retries {
                        error!("Command {} failed permanently: {}", command, e);
                        return Err(Error::CommandTimeout(max_retries));
                    }

                    trace!("Waiting before retry...");
                    time::sleep(self.config.retry_delay).await;
                }
            }
        }
    }
}

impl<S: CommandSender> CommandSender for QueuedSender<S> {
    fn send_on(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.transmit(GatewayCommand::On))
    }

    fn send_off(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.transmit(GatewayCommand::Off))
    }

    fn send_dim(&self, percent: u8) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.transmit(GatewayCommand::Dim(percent.min(100))))
    }
}

/// A command recorded by [`SimulatedGateway`]
#[derive(Debug, Clone)]
pub struct SentCommand {
    /// Monotonic time of the transmission
    pub at: Instant,
    /// Wall clock time of the transmission
    pub wall: chrono::DateTime<chrono::Local>,
    pub command: GatewayCommand,
}

/// In-memory gateway that logs and records every command
#[derive(Debug, Default)]
pub struct SimulatedGateway {
    history: SyncMutex<Vec<SentCommand>>,
    /// Number of upcoming sends that will fail
    failures: AtomicU32,
}

impl SimulatedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gateway whose next `count` sends fail
    pub fn with_failures(count: u32) -> Self {
        let gateway = Self::new();
        gateway.fail_next(count);
        gateway
    }

    /// Makes the next `count` sends fail
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Everything sent so far, oldest first
    pub fn history(&self) -> Vec<SentCommand> {
        self.history.lock().clone()
    }

    /// Commands sent so far without timestamps
    pub fn commands(&self) -> Vec<GatewayCommand> {
        self.history.lock().iter().map(|s| s.command).collect()
    }

    /// Records `command`, or fails it if a failure is pending
    fn record(&self, command: GatewayCommand) -> Result<()> {
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            debug!("Simulated transmission failure for {}", command);
            return Err(Error::Gateway(format!("transmission of {} failed", command)));
        }

        info!("Gateway <- {}", command);
        self.history.lock().push(SentCommand {
            at: Instant::now(),
            wall: chrono::Local::now(),
            command,
        });
        Ok(())
    }
}

impl CommandSender for SimulatedGateway {
    fn send_on(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(future::ready(self.record(GatewayCommand::On)))
    }

    fn send_off(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(future::ready(self.record(GatewayCommand::Off)))
    }

    fn send_dim(&self, percent: u8) -> BoxFuture<'_, Result<()>> {
        Box::pin(future::ready(self.record(GatewayCommand::Dim(percent.min(100)))))
    }
}
