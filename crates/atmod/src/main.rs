//! atmod - home weather station daemon.
//!
//! Reads an indoor BME680 and an outdoor 1-Wire thermometer at a fixed
//! interval and forwards the readings as StatsD gauges to Graphite.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use atmo_core::config::{
    Config, ConfigError, EmitterConfig, IndoorConfig, MetricNames, OutdoorConfig,
    duration_from_secs,
};
use atmo_core::emitter::{Emitter, LogTransport, Transport, UdpTransport};
use atmo_core::sample::Sampler;
use atmo_core::scheduler::{Scheduler, init_with_retry};
use atmo_core::sensor::{
    Bme680, IndoorSensor, OutdoorSensor, SensorInitError, W1Therm,
};
#[cfg(not(target_os = "linux"))]
use atmo_core::sysfs::MockFs;
#[cfg(target_os = "linux")]
use atmo_core::sysfs::RealFs;

/// Invalid configuration (same status clap uses for usage errors).
const EXIT_CONFIG: u8 = 2;
/// A sensor could not be opened at startup.
const EXIT_SENSOR_INIT: u8 = 3;
/// `--once` cycle whose transmission failed.
const EXIT_EMIT: u8 = 1;

/// Home weather station: sensors to StatsD bridge.
///
/// Every option can also be set through the environment variable shown.
#[derive(Parser, Debug)]
#[command(name = "atmod", about = "Home weather station daemon", version)]
struct Args {
    /// Sampling interval in seconds.
    #[arg(long, env = "SENSORS_SAMPLE_INTERVAL", default_value = "5.0")]
    interval: f64,

    /// I2C address of the indoor BME680 (hex with 0x prefix, or decimal).
    #[arg(long, env = "SENSOR_INDOOR_I2C_ADDR", default_value = "0x76", value_parser = parse_i2c_addr)]
    indoor_i2c_addr: u16,

    /// I2C bus number of the indoor sensor.
    #[arg(long, env = "SENSOR_INDOOR_I2C_BUS", default_value_t = 1)]
    indoor_i2c_bus: u8,

    /// Oversampling ratio for temperature, pressure and humidity (1, 2, 4, 8, 16).
    #[arg(long, env = "SENSOR_INDOOR_OVERSAMPLING", default_value_t = 8)]
    indoor_oversampling: u8,

    /// 1-Wire id of the outdoor probe (e.g. 28-000005e2fdc3). Defaults to the first found.
    #[arg(long, env = "SENSOR_OUTDOOR_W1_ID")]
    outdoor_w1_id: Option<String>,

    /// Extra attempts to open each sensor at startup, one interval apart.
    #[arg(long, env = "SENSOR_INIT_RETRIES", default_value_t = 0)]
    init_retries: u32,

    /// Mount point of sysfs (for testing).
    #[arg(long, env = "ATMO_SYSFS_PATH", default_value = "/sys")]
    sysfs_path: PathBuf,

    /// StatsD/Graphite host.
    #[arg(long, env = "GRAPHITE_HOST")]
    graphite_host: String,

    /// StatsD/Graphite UDP port.
    #[arg(long, env = "GRAPHITE_PORT", default_value_t = 8125)]
    graphite_port: u16,

    /// Bound on one metrics transmission, in seconds.
    #[arg(long, env = "GRAPHITE_TIMEOUT", default_value = "1.0")]
    graphite_timeout: f64,

    /// Prefix of every metric name. Empty for none.
    #[arg(long, env = "METRICS_PREFIX", default_value = "atmo")]
    metrics_prefix: String,

    /// Metric leaf name for indoor temperature.
    #[arg(long, env = "METRIC_TEMPERATURE_INDOOR", default_value = "temperature_indoor")]
    metric_temperature_indoor: String,

    /// Metric leaf name for outdoor temperature.
    #[arg(long, env = "METRIC_TEMPERATURE_OUTDOOR", default_value = "temperature_outdoor")]
    metric_temperature_outdoor: String,

    /// Metric leaf name for pressure.
    #[arg(long, env = "METRIC_PRESSURE", default_value = "pressure")]
    metric_pressure: String,

    /// Metric leaf name for humidity.
    #[arg(long, env = "METRIC_HUMIDITY", default_value = "humidity")]
    metric_humidity: String,

    /// Run a single cycle, print the sample as JSON and exit.
    #[arg(long)]
    once: bool,

    /// Log the metric lines instead of sending them.
    #[arg(long)]
    dry_run: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Parses an I2C address given as `0x76` or `118`.
fn parse_i2c_addr(s: &str) -> Result<u16, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse::<u16>(),
    };
    parsed.map_err(|e| format!("invalid I2C address '{}': {}", s, e))
}

/// Builds and validates the immutable runtime configuration.
fn build_config(args: &Args) -> Result<Config, ConfigError> {
    let config = Config {
        interval: duration_from_secs("SENSORS_SAMPLE_INTERVAL", args.interval)?,
        init_retries: args.init_retries,
        sysfs_path: args.sysfs_path.clone(),
        indoor: IndoorConfig {
            i2c_bus: args.indoor_i2c_bus,
            i2c_addr: args.indoor_i2c_addr,
            oversampling: args.indoor_oversampling,
        },
        outdoor: OutdoorConfig {
            w1_id: args.outdoor_w1_id.clone(),
        },
        emitter: EmitterConfig {
            host: args.graphite_host.clone(),
            port: args.graphite_port,
            timeout: duration_from_secs("GRAPHITE_TIMEOUT", args.graphite_timeout)?,
            prefix: args.metrics_prefix.clone(),
            names: MetricNames {
                temperature_indoor: args.metric_temperature_indoor.clone(),
                temperature_outdoor: args.metric_temperature_outdoor.clone(),
                pressure: args.metric_pressure.clone(),
                humidity: args.metric_humidity.clone(),
            },
        },
    };
    config.validate()?;
    Ok(config)
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        "error"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("atmod={level},atmo_core={level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    info!("atmod {} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Config: interval={:?}, collector={}:{} (timeout {:?}), prefix={:?}",
        config.interval,
        config.emitter.host,
        config.emitter.port,
        config.emitter.timeout,
        config.emitter.prefix
    );

    // Setup graceful shutdown (SIGINT and SIGTERM)
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("Failed to set signal handler: {}", e);
    }

    #[cfg(target_os = "linux")]
    let fs = RealFs::new();
    #[cfg(not(target_os = "linux"))]
    let fs = {
        warn!("No sysfs on this platform, using simulated sensors");
        MockFs::weather_station()
    };

    let mut indoor = Bme680::new(fs.clone(), &config.sysfs_path, &config.indoor);
    let mut outdoor = W1Therm::new(fs, &config.sysfs_path, &config.outdoor);

    let opened = init_with_retry(
        "Indoor sensor",
        config.init_retries,
        config.interval,
        &running,
        || indoor.init(),
    )
    .and_then(|()| {
        init_with_retry(
            "Outdoor sensor",
            config.init_retries,
            config.interval,
            &running,
            || outdoor.init(),
        )
    });

    if let Err(e) = opened {
        if !running.load(Ordering::SeqCst) {
            info!("Shutdown requested while waiting for sensors");
            return ExitCode::SUCCESS;
        }
        error!("Unable to acquire sensors, exiting: {}", e);
        print_sensor_hint(&e);
        return ExitCode::from(EXIT_SENSOR_INIT);
    }
    info!(
        "Sensors acquired: indoor={}, outdoor={}",
        indoor.describe(),
        outdoor.describe()
    );

    let transport: Box<dyn Transport> = if args.dry_run {
        info!("Dry run: metrics are logged, not sent");
        Box::new(LogTransport::new())
    } else {
        Box::new(UdpTransport::new(&config.emitter))
    };
    let emitter = Emitter::new(&config.emitter, transport);
    let mut scheduler = Scheduler::new(Sampler::new(indoor, outdoor), emitter, config.interval);

    if args.once {
        return run_once(&mut scheduler);
    }

    scheduler.run(&running);

    // Dropping the scheduler releases the sensors.
    drop(scheduler);
    info!("Shutdown complete");
    ExitCode::SUCCESS
}

/// Runs a single cycle and prints the sample to stdout.
fn run_once<I, O, T>(scheduler: &mut Scheduler<I, O, T>) -> ExitCode
where
    I: IndoorSensor,
    O: OutdoorSensor,
    T: Transport,
{
    let (sample, code) = match scheduler.run_cycle() {
        Ok(report) => (report.sample, ExitCode::SUCCESS),
        Err(e) => {
            error!("{}", e);
            (e.sample, ExitCode::from(EXIT_EMIT))
        }
    };

    match serde_json::to_string_pretty(&sample) {
        Ok(json) => println!("{json}"),
        Err(e) => error!("Failed to serialize sample: {}", e),
    }
    code
}

/// Prints a colored hint on enabling the sensor buses.
fn print_sensor_hint(error: &SensorInitError) {
    // ANSI colors: red for error, yellow for hints, reset after
    const RED: &str = "\x1b[1;31m";
    const YELLOW: &str = "\x1b[33m";
    const RESET: &str = "\x1b[0m";

    eprintln!("{RED}{error}{RESET}");
    eprintln!();
    eprintln!("{YELLOW}  Check that the sensor buses are enabled in /boot/config.txt:");
    eprintln!("    dtparam=i2c_arm=on");
    eprintln!("    dtoverlay=w1-gpio");
    eprintln!();
    eprintln!("  and that the BME680 is bound to its kernel driver:");
    eprintln!("    echo bme680 0x76 | sudo tee /sys/bus/i2c/devices/i2c-1/new_device");
    eprintln!("  Use SENSOR_INIT_RETRIES to wait for late devices.{RESET}");
}
