use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, instrument, trace};

use crate::event::{brightness_to_percent, percent_to_brightness, GatewayEvent};
use crate::gateway::{CommandSender, GatewayCommand};
use crate::transition::{Tick, Transition, TICK_INTERVAL};
use crate::Result;

/// Highest brightness a light accepts
pub const FULL_BRIGHTNESS: u8 = 255;

/// Absolute level a single command leaves the device at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Full,
    Brightness(u8),
    Off,
}

impl Level {
    fn command(self) -> GatewayCommand {
        match self {
            Level::Full => GatewayCommand::On,
            Level::Brightness(b) => GatewayCommand::Dim(brightness_to_percent(b)),
            Level::Off => GatewayCommand::Off,
        }
    }
}

#[derive(Debug)]
struct LightState {
    /// Last known brightness (0-255)
    brightness: u8,
    is_on: bool,
    /// Bumped on every new command; stale work compares against it
    generation: u64,
    /// Stepper task of the running transition
    pending: Option<JoinHandle<()>>,
}

impl LightState {
    fn set(&mut self, level: Level) {
        match level {
            Level::Full => {
                self.brightness = FULL_BRIGHTNESS;
                self.is_on = true;
            }
            Level::Brightness(b) => {
                self.brightness = b;
                self.is_on = b > 0;
            }
            Level::Off => {
                self.brightness = 0;
                self.is_on = false;
            }
        }
    }
}

struct Shared<S> {
    name: String,
    sender: S,
    state: Mutex<LightState>,
}

impl<S: CommandSender> Shared<S> {
    /// Supersedes whatever is running and returns the new generation
    fn cancel(&self) -> u64 {
        let mut state = self.state.lock();
        state.generation = state.generation.wrapping_add(1);
        if let Some(handle) = state.pending.take() {
            if !handle.is_finished() {
                debug!(light = %self.name, "Cancelling running transition");
            }
            // Aborting a finished task does nothing
            handle.abort();
        }
        state.generation
    }

    /// Records `level` and sends it, unless a newer command took over
    async fn apply(&self, generation: u64, level: Level) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.generation != generation {
                trace!(light = %self.name, "Superseded before applying {:?}", level);
                return Ok(());
            }
            state.set(level);
        }
        self.transmit(level).await
    }

    /// One transition step. `None` means a newer command took over.
    async fn tick(&self, generation: u64, run: &mut Transition) -> Result<Option<Tick>> {
        let (tick, level) = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return Ok(None);
            }

            let tick = run.advance(state.brightness);
            let level = match tick {
                Tick::Finish(0) => Level::Off,
                tick => Level::Brightness(tick.brightness()),
            };
            state.set(level);
            (tick, level)
        };

        trace!(light = %self.name, "Transition tick {:?}", tick);
        self.transmit(level).await?;
        Ok(Some(tick))
    }

    async fn transmit(&self, level: Level) -> Result<()> {
        debug!(light = %self.name, "Sending {}", level.command());
        match level {
            Level::Full => self.sender.send_on().await,
            Level::Brightness(b) => self.sender.send_dim(brightness_to_percent(b)).await,
            Level::Off => self.sender.send_off().await,
        }
    }

    /// Drops the stored handle once its run has ended
    fn finish(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation == generation {
            state.pending = None;
        }
    }
}

/// Keeps stepping until the run finishes or is superseded
async fn run_transition<S: CommandSender>(
    shared: Arc<Shared<S>>,
    generation: u64,
    mut run: Transition,
) {
    loop {
        time::sleep(TICK_INTERVAL).await;

        match shared.tick(generation, &mut run).await {
            Ok(Some(Tick::Step(_))) => continue,
            Ok(Some(Tick::Finish(brightness))) => {
                info!(light = %shared.name, "Transition finished at {}", brightness);
                break;
            }
            Ok(None) => {
                trace!(light = %shared.name, "Transition superseded");
                return;
            }
            Err(e) => {
                error!(light = %shared.name, "Transition stopped: {}", e);
                break;
            }
        }
    }

    shared.finish(generation);
}

/// A dimmable light behind a gateway
///
/// The light remembers the brightness it was last set to and turns timed
/// requests into a series of dim commands, one every [`TICK_INTERVAL`].
/// Every new command cancels a transition that is still running.
///
/// Cloning yields another handle to the same light.
pub struct DimmableLight<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for DimmableLight<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: CommandSender + 'static> DimmableLight<S> {
    /// Creates a light that is off
    pub fn new(name: impl Into<String>, sender: S) -> Self {
        Self::with_brightness(name, sender, 0)
    }

    /// Creates a light with a known starting brightness
    pub fn with_brightness(name: impl Into<String>, sender: S, brightness: u8) -> Self {
        let name = name.into();
        debug!("Registering light {} at brightness {}", name, brightness);
        Self {
            shared: Arc::new(Shared {
                name,
                sender,
                state: Mutex::new(LightState {
                    brightness,
                    is_on: brightness > 0,
                    generation: 0,
                    pending: None,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Current brightness (0-255)
    pub fn brightness(&self) -> u8 {
        self.shared.state.lock().brightness
    }

    pub fn is_on(&self) -> bool {
        self.shared.state.lock().is_on
    }

    /// Whether a transition is still stepping
    pub fn is_transitioning(&self) -> bool {
        self.shared
            .state
            .lock()
            .pending
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stops a running transition, leaving the brightness where it is
    ///
    /// Does nothing when no transition is running.
    pub fn cancel_transition(&self) {
        self.shared.cancel();
    }

    /// Turns the light on
    ///
    /// # Arguments
    ///
    /// * `brightness` - Target brightness (0-255); full when omitted
    /// * `transition` - Fade duration; immediate when omitted
    ///
    /// A fade never goes down: if the target is below the current
    /// brightness the request is ignored. Use [`turn_off`](Self::turn_off)
    /// with a brightness floor to fade down.
    #[instrument(skip(self), fields(light = %self.shared.name))]
    pub async fn turn_on(&self, brightness: Option<u8>, transition: Option<Duration>) -> Result<()> {
        let generation = self.shared.cancel();

        let transition = match (brightness, transition) {
            (None, None) => {
                info!("Turning on");
                return self.shared.apply(generation, Level::Full).await;
            }
            (Some(b), None) => {
                info!("Setting brightness to {}", b);
                return self.shared.apply(generation, Level::Brightness(b)).await;
            }
            (_, Some(transition)) => transition,
        };

        let target = brightness
            .filter(|b| *b > 0)
            .unwrap_or(FULL_BRIGHTNESS);
        let current = self.brightness();
        if target < current {
            debug!(
                "Ignoring fade up to {} below current brightness {}",
                target, current
            );
            return Ok(());
        }

        if transition.is_zero() {
            info!("Setting brightness to {}", target);
            return self.shared.apply(generation, Level::Brightness(target)).await;
        }

        self.start_transition(generation, Transition::new(current, target, transition))
            .await
    }

    /// Turns the light off
    ///
    /// # Arguments
    ///
    /// * `brightness` - Level to fade down to (0-255); off when omitted or 0
    /// * `transition` - Fade duration; immediate off when omitted or zero
    ///
    /// A fade never goes up: a floor above the current brightness is ignored.
    #[instrument(skip(self), fields(light = %self.shared.name))]
    pub async fn turn_off(&self, brightness: Option<u8>, transition: Option<Duration>) -> Result<()> {
        let generation = self.shared.cancel();

        let transition = match transition {
            Some(transition) if !transition.is_zero() => transition,
            _ => {
                info!("Turning off");
                return self.shared.apply(generation, Level::Off).await;
            }
        };

        let target = brightness.unwrap_or(0);
        let current = self.brightness();
        if target > current {
            debug!(
                "Ignoring fade down to {} above current brightness {}",
                target, current
            );
            return Ok(());
        }

        self.start_transition(generation, Transition::new(current, target, transition))
            .await
    }

    /// Reflects a command the gateway received from another transmitter
    ///
    /// A running transition keeps going from the new brightness.
    pub fn apply_event(&self, event: GatewayEvent) {
        let mut state = self.shared.state.lock();
        match event {
            GatewayEvent::On => state.is_on = true,
            GatewayEvent::Off => state.is_on = false,
            GatewayEvent::Dim(percent) => {
                let brightness = percent_to_brightness(percent);
                state.brightness = brightness;
                state.is_on = brightness > 0;
            }
        }
        debug!(
            light = %self.shared.name,
            "Applied received {} (brightness {}, on: {})",
            event, state.brightness, state.is_on
        );
    }

    /// Runs the first tick right away and hands the rest to a task
    async fn start_transition(&self, generation: u64, mut run: Transition) -> Result<()> {
        info!(
            "Fading to {} ({:+.2} per tick)",
            run.target(),
            run.step()
        );

        match self.shared.tick(generation, &mut run).await? {
            Some(Tick::Step(_)) => {}
            Some(Tick::Finish(brightness)) => {
                info!("Transition finished at {}", brightness);
                return Ok(());
            }
            None => return Ok(()),
        }

        {
            let mut state = self.shared.state.lock();
            // A newer command may have arrived while the first step was sent
            if state.generation == generation {
                let shared = Arc::clone(&self.shared);
                state.pending = Some(tokio::spawn(run_transition(shared, generation, run)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayConfig, QueuedSender, SimulatedGateway};
    use crate::Error;

    fn light_at(brightness: u8) -> (Arc<SimulatedGateway>, DimmableLight<Arc<SimulatedGateway>>) {
        let gateway = Arc::new(SimulatedGateway::new());
        let light = DimmableLight::with_brightness("test", gateway.clone(), brightness);
        (gateway, light)
    }

    fn dim(brightness: u8) -> GatewayCommand {
        GatewayCommand::Dim(brightness_to_percent(brightness))
    }

    #[tokio::test(start_paused = true)]
    async fn turn_on_without_arguments_goes_full() {
        let (gateway, light) = light_at(0);

        light.turn_on(None, None).await.unwrap();

        assert_eq!(light.brightness(), 255);
        assert!(light.is_on());
        assert!(!light.is_transitioning());
        assert_eq!(gateway.commands(), vec![GatewayCommand::On]);

        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(gateway.commands().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn turn_on_with_brightness_dims() {
        let (gateway, light) = light_at(0);

        light.turn_on(Some(100), None).await.unwrap();

        assert_eq!(light.brightness(), 100);
        assert_eq!(gateway.commands(), vec![GatewayCommand::Dim(39)]);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_transition_is_immediate() {
        let (faded, a) = light_at(20);
        let (direct, b) = light_at(20);

        a.turn_on(Some(100), Some(Duration::ZERO)).await.unwrap();
        b.turn_on(Some(100), None).await.unwrap();
        time::sleep(Duration::from_secs(1)).await;

        assert_eq!(a.brightness(), b.brightness());
        assert_eq!(faded.commands(), direct.commands());
    }

    #[tokio::test(start_paused = true)]
    async fn fade_up_steps_every_tick() {
        let (gateway, light) = light_at(50);

        light
            .turn_on(Some(150), Some(Duration::from_secs(1)))
            .await
            .unwrap();

        // First step goes out before turn_on returns
        assert_eq!(gateway.commands(), vec![dim(60)]);
        assert!(light.is_transitioning());

        time::sleep(Duration::from_secs(2)).await;

        let expected: Vec<GatewayCommand> = (6..=15).map(|n| dim(n * 10)).collect();
        assert_eq!(gateway.commands(), expected);
        assert_eq!(light.brightness(), 150);
        assert!(!light.is_transitioning());

        let history = gateway.history();
        for pair in history.windows(2) {
            let gap = pair[1].at - pair[0].at;
            assert!(gap >= TICK_INTERVAL && gap < TICK_INTERVAL + Duration::from_millis(5));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fade_without_brightness_goes_full() {
        let (gateway, light) = light_at(205);

        light
            .turn_on(Some(0), Some(Duration::from_millis(500)))
            .await
            .unwrap();
        time::sleep(Duration::from_secs(1)).await;

        assert_eq!(light.brightness(), 255);
        assert_eq!(
            gateway.commands(),
            vec![dim(215), dim(225), dim(235), dim(245), dim(255)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fade_down_to_zero_ends_with_off() {
        let (gateway, light) = light_at(100);

        light
            .turn_off(Some(0), Some(Duration::from_millis(500)))
            .await
            .unwrap();
        time::sleep(Duration::from_secs(1)).await;

        assert_eq!(
            gateway.commands(),
            vec![dim(80), dim(60), dim(40), dim(20), GatewayCommand::Off]
        );
        assert_eq!(light.brightness(), 0);
        assert!(!light.is_on());
    }

    #[tokio::test(start_paused = true)]
    async fn fade_down_to_floor_stays_on() {
        let (gateway, light) = light_at(200);

        light
            .turn_off(Some(100), Some(Duration::from_millis(200)))
            .await
            .unwrap();
        time::sleep(Duration::from_secs(1)).await;

        assert_eq!(gateway.commands(), vec![dim(150), dim(100)]);
        assert_eq!(light.brightness(), 100);
        assert!(light.is_on());
    }

    #[tokio::test(start_paused = true)]
    async fn turn_on_does_not_fade_down() {
        let (gateway, light) = light_at(150);

        light
            .turn_on(Some(100), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        time::sleep(Duration::from_secs(2)).await;
        assert!(gateway.commands().is_empty());
        assert_eq!(light.brightness(), 150);

        // Without a transition the same brightness is set directly
        light.turn_on(Some(100), None).await.unwrap();
        assert_eq!(gateway.commands(), vec![dim(100)]);
        assert_eq!(light.brightness(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn turn_off_does_not_fade_up() {
        let (gateway, light) = light_at(50);

        light
            .turn_off(Some(80), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        time::sleep(Duration::from_secs(2)).await;

        assert!(gateway.commands().is_empty());
        assert_eq!(light.brightness(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn turn_off_without_transition_is_immediate() {
        let (gateway, light) = light_at(180);

        light
            .turn_off(Some(40), Some(Duration::ZERO))
            .await
            .unwrap();

        assert_eq!(gateway.commands(), vec![GatewayCommand::Off]);
        assert_eq!(light.brightness(), 0);
        assert!(!light.is_on());
    }

    #[tokio::test(start_paused = true)]
    async fn new_command_cancels_running_fade() {
        let (gateway, light) = light_at(0);

        light
            .turn_on(Some(255), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        time::sleep(Duration::from_millis(350)).await;
        assert_eq!(gateway.commands().len(), 4);

        light.turn_off(None, None).await.unwrap();
        assert!(!light.is_transitioning());

        time::sleep(Duration::from_secs(2)).await;
        let commands = gateway.commands();
        assert_eq!(commands.len(), 5);
        assert_eq!(commands.last(), Some(&GatewayCommand::Off));
        assert_eq!(light.brightness(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn new_fade_replaces_running_fade() {
        let (gateway, light) = light_at(0);

        light
            .turn_on(Some(200), Some(Duration::from_secs(2)))
            .await
            .unwrap();
        time::sleep(Duration::from_millis(250)).await;
        let reached = light.brightness();

        light
            .turn_off(Some(0), Some(Duration::from_millis(300)))
            .await
            .unwrap();
        time::sleep(Duration::from_secs(3)).await;

        let commands = gateway.commands();
        assert_eq!(commands.last(), Some(&GatewayCommand::Off));
        // 3 steps up, 2 steps down, then off
        assert_eq!(commands.len(), 6);
        assert_eq!(reached, 30);
        assert!(!light.is_transitioning());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_twice_is_harmless() {
        let (gateway, light) = light_at(90);

        light.cancel_transition();
        light.cancel_transition();
        assert!(gateway.commands().is_empty());
        assert_eq!(light.brightness(), 90);

        light
            .turn_on(Some(110), Some(Duration::from_millis(200)))
            .await
            .unwrap();
        time::sleep(Duration::from_secs(1)).await;
        light.cancel_transition();

        assert_eq!(light.brightness(), 110);
        assert_eq!(gateway.commands(), vec![dim(100), dim(110)]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_keeps_reached_brightness() {
        let (gateway, light) = light_at(0);

        light
            .turn_on(Some(100), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        time::sleep(Duration::from_millis(150)).await;
        light.cancel_transition();
        time::sleep(Duration::from_secs(2)).await;

        assert_eq!(light.brightness(), 20);
        assert_eq!(gateway.commands(), vec![dim(10), dim(20)]);
    }

    #[tokio::test(start_paused = true)]
    async fn received_dim_is_picked_up_by_fade() {
        let (gateway, light) = light_at(50);

        light
            .turn_on(Some(150), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        time::sleep(Duration::from_millis(50)).await;

        // Wall switch set the light to 40% (brightness 102)
        light.apply_event(GatewayEvent::Dim(40));
        assert_eq!(light.brightness(), 102);
        assert!(light.is_transitioning());

        time::sleep(Duration::from_secs(2)).await;

        let commands = gateway.commands();
        assert_eq!(commands[1], dim(112));
        assert_eq!(commands.last(), Some(&dim(150)));
        assert_eq!(light.brightness(), 150);
    }

    #[tokio::test(start_paused = true)]
    async fn received_on_off_updates_power_state() {
        let (gateway, light) = light_at(0);

        light.apply_event(GatewayEvent::On);
        assert!(light.is_on());
        light.apply_event(GatewayEvent::Off);
        assert!(!light.is_on());
        assert!(gateway.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn received_on_off_keeps_brightness() {
        let (gateway, light) = light_at(120);

        light.apply_event(GatewayEvent::Off);
        assert!(!light.is_on());
        assert_eq!(light.brightness(), 120);

        light.apply_event(GatewayEvent::On);
        assert!(light.is_on());
        assert_eq!(light.brightness(), 120);
        assert!(gateway.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dim_to_zero_reports_off() {
        let (gateway, light) = light_at(80);

        light.turn_on(Some(0), None).await.unwrap();
        assert_eq!(gateway.commands(), vec![dim(0)]);
        assert_eq!(light.brightness(), 0);
        assert!(!light.is_on());
    }

    #[tokio::test(start_paused = true)]
    async fn gateway_failure_is_returned() {
        let gateway = Arc::new(SimulatedGateway::with_failures(5));
        let config = GatewayConfig {
            max_retries: 2,
            ..GatewayConfig::default()
        };
        let light = DimmableLight::new("test", QueuedSender::new(gateway.clone(), config));

        let result = light.turn_on(None, None).await;
        assert!(matches!(result, Err(Error::CommandTimeout(2))));
    }

    #[tokio::test(start_paused = true)]
    async fn gateway_failure_stops_fade() {
        let (gateway, light) = light_at(0);

        light
            .turn_on(Some(200), Some(Duration::from_secs(2)))
            .await
            .unwrap();
        gateway.fail_next(1);
        time::sleep(Duration::from_secs(3)).await;

        assert_eq!(gateway.commands(), vec![dim(10)]);
        assert!(!light.is_transitioning());
    }

    #[tokio::test(start_paused = true)]
    async fn fade_to_current_brightness_sends_once() {
        let (gateway, light) = light_at(120);

        light
            .turn_on(Some(120), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(!light.is_transitioning());
        assert_eq!(gateway.commands(), vec![dim(120)]);

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(gateway.commands(), vec![dim(120)]);
        assert_eq!(light.brightness(), 120);
    }

    #[tokio::test(start_paused = true)]
    async fn fade_out_when_already_off_sends_off_once() {
        let (gateway, light) = light_at(0);

        light
            .turn_off(None, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(!light.is_transitioning());

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(gateway.commands(), vec![GatewayCommand::Off]);
        assert!(!light.is_on());
    }

    /// Sender that only records which operation was called
    #[derive(Default)]
    struct CallLog {
        calls: parking_lot::Mutex<Vec<String>>,
    }

    impl CallLog {
        fn push(&self, call: String) -> futures::future::BoxFuture<'_, Result<()>> {
            self.calls.lock().push(call);
            Box::pin(futures::future::ready(Ok(())))
        }
    }

    impl CommandSender for CallLog {
        fn send_on(&self) -> futures::future::BoxFuture<'_, Result<()>> {
            self.push("on".to_string())
        }

        fn send_off(&self) -> futures::future::BoxFuture<'_, Result<()>> {
            self.push("off".to_string())
        }

        fn send_dim(&self, percent: u8) -> futures::future::BoxFuture<'_, Result<()>> {
            self.push(format!("dim {}", percent))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn light_uses_sender_operations() {
        let log = Arc::new(CallLog::default());
        let light = DimmableLight::with_brightness("test", log.clone(), 60);

        light.turn_on(None, None).await.unwrap();
        light.turn_on(Some(100), None).await.unwrap();
        light
            .turn_off(None, Some(Duration::from_millis(200)))
            .await
            .unwrap();
        time::sleep(Duration::from_secs(1)).await;
        light.turn_off(None, None).await.unwrap();

        assert_eq!(
            *log.calls.lock(),
            vec!["on", "dim 39", "dim 19", "off", "off"]
        );
    }
}
