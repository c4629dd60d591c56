//! HiresTI console host
//!
//! Drives the audio core from a terminal. The core expects a foreground
//! thread it can post work to, so this host runs a small loop over a
//! crossbeam channel of [`MainTask`]s and pumps the core on every wake-up.
//!
//! ```text
//! hiresti drivers
//! hiresti devices ALSA
//! hiresti play ~/music/track.flac --driver ALSA --device "USB DAC (Card 1)" --bit-perfect --exclusive
//! hiresti verdict ~/music/track.flac
//! hiresti --simulate watch --seconds 30
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info};

use hiresti_core::{
    init_logging, AudioCore, CoreConfig, CoreParts, DeviceList, EnvConfig, Health, HostSurface,
    LatencyProfile, MainTask, MemorySettingsStore, NoticeLevel, OutputRequest, SimHandle,
    SimulatedBackend, StaticSource, StreamFormat, SwitchOutcome, Track, Transition,
};
use hiresti_platform::memory::{MemoryClock, MemoryEnumerator};
use hiresti_platform::{system_enumerator, Device, DeviceEnumerator, Driver, SessionControl};

/// Upper bound between two pumps when nothing is posted
const PUMP_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "hiresti", version, about = "HiresTI audio core console host")]
struct Cli {
    /// Use in-memory devices and a simulated decoder instead of the system
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the drivers available on this system
    Drivers,

    /// List output devices of a driver
    Devices {
        #[arg(value_parser = parse_driver, default_value = "Auto (Default)")]
        driver: Driver,
    },

    /// Print the bit-perfect verdict and signal path for the saved output
    Verdict {
        /// Play this for a moment first so the source format is known
        uri: Option<String>,

        #[arg(long, default_value_t = 2)]
        seconds: u64,
    },

    /// Play a local file or URI
    Play {
        uri: String,

        #[command(flatten)]
        output: OutputArgs,

        /// Stop after this many seconds instead of at the end of the stream
        #[arg(long)]
        seconds: Option<u64>,
    },

    /// Follow output state and hotplug events
    Watch {
        #[arg(long)]
        seconds: Option<u64>,
    },
}

#[derive(clap::Args)]
struct OutputArgs {
    /// `ALSA`, `PipeWire`, `PulseAudio` or `auto`; the saved output when omitted
    #[arg(long, value_parser = parse_driver)]
    driver: Option<Driver>,

    /// Device name as listed by `devices`; the first real device when omitted
    #[arg(long)]
    device: Option<String>,

    #[arg(long)]
    bit_perfect: bool,

    /// Hold the ALSA device exclusively; implies --bit-perfect
    #[arg(long)]
    exclusive: bool,

    #[arg(long, value_enum)]
    latency: Option<LatencyArg>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LatencyArg {
    Safe,
    Standard,
    Low,
    Aggressive,
}

impl From<LatencyArg> for LatencyProfile {
    fn from(arg: LatencyArg) -> Self {
        match arg {
            LatencyArg::Safe => LatencyProfile::Safe,
            LatencyArg::Standard => LatencyProfile::Standard,
            LatencyArg::Low => LatencyProfile::LowLatency,
            LatencyArg::Aggressive => LatencyProfile::Aggressive,
        }
    }
}

fn parse_driver(raw: &str) -> Result<Driver, String> {
    Driver::ALL
        .into_iter()
        .find(|d| d.as_str().eq_ignore_ascii_case(raw.trim()))
        .map(Ok)
        .unwrap_or_else(|| raw.parse::<Driver>().map_err(|e| e.to_string()))
}

// ============================================================================
// Host surface
// ============================================================================

/// Prints notices and transitions; posted tasks go to the main loop
struct ConsoleHost {
    tasks: Sender<MainTask>,
    finished: Arc<AtomicBool>,
}

impl HostSurface for ConsoleHost {
    fn post_to_main(&self, task: MainTask) {
        let _ = self.tasks.send(task);
    }

    fn show_notice(&self, level: NoticeLevel, text: &str, _timeout_ms: u32) {
        let tag = match level {
            NoticeLevel::Info => "info",
            NoticeLevel::Success => " ok ",
            NoticeLevel::Warning => "warn",
            NoticeLevel::Error => "FAIL",
        };
        println!("[{}] {}", tag, text);
    }

    fn record_diag_event(&self, message: &str) {
        debug!("{}", message);
    }

    fn set_diag_health(&self, area: &str, health: Health, detail: Option<&str>) {
        debug!("Health {}: {} {}", area, health.as_str(), detail.unwrap_or(""));
    }

    fn on_output_state_transition(&self, transition: &Transition) {
        println!("{}", transition.log_line());
    }

    fn reset_play_button(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    fn on_tag(&self, format: &StreamFormat) {
        println!("Source: {} {}", format.codec, format.describe());
    }

    fn on_eos(&self) {
        println!("End of stream");
        self.finished.store(true, Ordering::SeqCst);
    }

    fn on_devices_changed(&self, devices: &DeviceList) {
        print_devices(devices);
    }
}

// ============================================================================
// Core construction
// ============================================================================

struct Session {
    core: AudioCore,
    tasks: Receiver<MainTask>,
    finished: Arc<AtomicBool>,
    enumerator: Arc<dyn DeviceEnumerator>,
}

/// Scripted devices for `--simulate`
fn simulated_enumerator() -> Arc<MemoryEnumerator> {
    let devices = Arc::new(MemoryEnumerator::new());
    devices.set_devices(
        Driver::Auto,
        vec![Device::new(Driver::Auto, hiresti_platform::DEFAULT_OUTPUT_NAME, None)],
    );
    devices.set_devices(
        Driver::Alsa,
        vec![
            Device::new(Driver::Alsa, "USB DAC (Card 1)", Some("hw:1,0".into())),
            Device::new(Driver::Alsa, "Built-in Audio (Card 0)", Some("hw:0,0".into())),
        ],
    );
    devices.set_devices(
        Driver::PipeWire,
        vec![
            Device::new(Driver::PipeWire, hiresti_platform::DEFAULT_SYSTEM_OUTPUT_NAME, None),
            Device::new(Driver::PipeWire, "USB DAC", Some("alsa_output.usb-dac.analog-stereo".into()))
                .with_node_id(42),
        ],
    );
    devices
}

fn enumerator(simulate: bool) -> Arc<dyn DeviceEnumerator> {
    if simulate {
        simulated_enumerator() as Arc<dyn DeviceEnumerator>
    } else {
        system_enumerator()
    }
}

fn open_session(simulate: bool) -> Result<Session> {
    let (tx, tasks) = unbounded::<MainTask>();
    let finished = Arc::new(AtomicBool::new(false));
    let host = Arc::new(ConsoleHost {
        tasks: tx,
        finished: Arc::clone(&finished),
    });
    let source = Arc::new(StaticSource::new("LOSSLESS"));

    let parts = if simulate {
        let clock: Arc<dyn SessionControl> = Arc::new(MemoryClock::new(48000));
        CoreParts {
            host,
            enumerator: simulated_enumerator(),
            clock: Some(clock),
            backend: SimulatedBackend::factory(SimHandle::new()),
            source,
            settings: Arc::new(MemorySettingsStore::new()),
            audio_cache: None,
            cover_cache: None,
            config: CoreConfig::default(),
            env: EnvConfig::from_env(),
        }
    } else {
        CoreParts::system(host, source).context("failed to prepare the audio core")?
    };
    let enumerator = Arc::clone(&parts.enumerator);
    let core = AudioCore::new(parts).context("failed to start the audio core")?;

    Ok(Session {
        core,
        tasks,
        finished,
        enumerator,
    })
}

impl Session {
    /// Serve posted tasks and pump until `done` or `limit` elapses
    fn run(&mut self, limit: Option<Duration>, mut done: impl FnMut(&Session) -> bool) {
        let deadline = limit.map(|l| Instant::now() + l);
        loop {
            match self.tasks.recv_timeout(PUMP_INTERVAL) {
                Ok(MainTask::Call(f)) => f(),
                Ok(MainTask::Pump) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.core.pump();
            if done(self) || deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
        }
    }

    fn request_for(&self, args: &OutputArgs) -> Result<Option<OutputRequest>> {
        let Some(driver) = args.driver else {
            if args.device.is_some() {
                bail!("--device needs --driver");
            }
            return Ok(None);
        };
        let list = self
            .enumerator
            .list_devices(driver)
            .with_context(|| format!("failed to list {} devices", driver))?;
        let device = match &args.device {
            Some(name) => match list.find_by_name(name) {
                Some(device) => device.clone(),
                None => bail!("no {} device named {:?}; try `hiresti devices {}`", driver, name, driver),
            },
            None => match list.first_available() {
                Some(device) => device.clone(),
                None => bail!("no {} devices found", driver),
            },
        };
        let target = self.core.target();
        Ok(Some(OutputRequest {
            driver,
            device_id: device.id,
            device_name: device.name,
            bit_perfect: args.bit_perfect || args.exclusive,
            exclusive: args.exclusive,
            latency: args.latency.map(LatencyProfile::from).unwrap_or(target.latency),
        }))
    }

    fn print_verdict(&self) {
        let verdict = self.core.verdict();
        println!("Bit-perfect: {}", verdict.label());
        for reason in &verdict.reasons {
            println!("  - {}", reason);
        }
        println!();
        for line in self.core.diagnostics() {
            println!("{}", line);
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

fn print_devices(list: &DeviceList) {
    println!("{} devices:", list.driver);
    if list.is_empty() {
        println!("  (none)");
    }
    for device in list {
        println!("  {:<40} {}", device.name, device.id.as_deref().unwrap_or("default"));
    }
}

fn cmd_drivers(simulate: bool) {
    for driver in enumerator(simulate).list_drivers() {
        println!("{}", driver);
    }
}

fn cmd_devices(simulate: bool, driver: Driver) -> Result<()> {
    let list = enumerator(simulate)
        .list_devices(driver)
        .with_context(|| format!("failed to list {} devices", driver))?;
    print_devices(&list);
    Ok(())
}

fn cmd_verdict(simulate: bool, uri: Option<String>, seconds: u64) -> Result<()> {
    let mut session = open_session(simulate)?;
    session.run(Some(Duration::from_millis(500)), |_| false);
    if let Some(uri) = uri {
        session.core.play_track(Track::new(uri.as_str(), uri.as_str()))?;
        session.run(Some(Duration::from_secs(seconds)), |s| {
            s.finished.load(Ordering::SeqCst)
        });
    }
    session.print_verdict();
    session.core.shutdown();
    Ok(())
}

fn cmd_play(simulate: bool, uri: String, output: OutputArgs, seconds: Option<u64>) -> Result<()> {
    let mut session = open_session(simulate)?;
    if let Some(request) = session.request_for(&output)? {
        match session.core.set_output(request)? {
            SwitchOutcome::Started(id) => info!("Output switch #{} started", id),
            SwitchOutcome::Unchanged | SwitchOutcome::Coalesced => {}
        }
    }
    if let (None, Some(latency)) = (output.driver, output.latency) {
        session.core.set_latency_profile(latency.into())?;
    }

    session.core.play_track(Track::new(uri.as_str(), uri.as_str()))?;
    session.run(seconds.map(Duration::from_secs), |s| {
        s.finished.load(Ordering::SeqCst)
    });

    let (position, duration) = session.core.position();
    match duration {
        Some(total) => println!("Stopped at {:.1}s / {:.1}s", position, total),
        None => println!("Stopped at {:.1}s", position),
    }
    session.print_verdict();
    session.core.stop()?;
    session.core.shutdown();
    Ok(())
}

fn cmd_watch(simulate: bool, seconds: Option<u64>) -> Result<()> {
    let mut session = open_session(simulate)?;
    let driver = session.core.target().driver;
    session.core.refresh_devices(driver)?;
    println!("Watching {} output; state {}", driver, session.core.output_state());

    let mut last_phase = session.core.watchdog_phase();
    session.run(seconds.map(Duration::from_secs), |s| {
        let phase = s.core.watchdog_phase();
        if phase != last_phase {
            println!("Hotplug watchdog: {:?}", phase);
            last_phase = phase;
        }
        false
    });
    println!("Output: {}", session.core.output_state());
    session.core.shutdown();
    Ok(())
}

fn main() -> Result<()> {
    init_logging().context("failed to initialise logging")?;
    let cli = Cli::parse();
    info!("HiresTI console host starting{}", if cli.simulate { " (simulated)" } else { "" });

    match cli.command {
        Command::Drivers => {
            cmd_drivers(cli.simulate);
            Ok(())
        }
        Command::Devices { driver } => cmd_devices(cli.simulate, driver),
        Command::Verdict { uri, seconds } => cmd_verdict(cli.simulate, uri, seconds),
        Command::Play {
            uri,
            output,
            seconds,
        } => cmd_play(cli.simulate, uri, output, seconds),
        Command::Watch { seconds } => cmd_watch(cli.simulate, seconds),
    }
}
