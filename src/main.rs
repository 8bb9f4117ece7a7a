use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use scopecam::{Runtime, ScopecamConfig};

#[derive(Parser, Debug)]
#[command(name = "scopecam")]
#[command(about = "Multi-stream video acquisition runtime for scientific microscopy")]
#[command(version)]
#[command(
    long_about = "Runs camera-to-storage acquisition streams from a TOML profile: \
each stream couples a camera source to a storage sink through a bounded frame \
ring, with live progress reporting and drop accounting. Simulated cameras and \
raw/TIFF/side-by-side/trash sinks are built in."
)]
struct Args {
    /// Path to the acquisition profile
    #[arg(
        short,
        long,
        default_value = "scopecam.toml",
        help = "Path to TOML acquisition profile"
    )]
    config: String,

    /// Override the frame count of every stream
    #[arg(long, help = "Acquire this many frames per stream, overriding the profile")]
    frames: Option<u64>,

    /// Stop unbounded acquisitions after this many seconds
    #[arg(
        long,
        default_value_t = 0,
        help = "Wall-clock bound for unbounded streams; 0 requires bounded streams"
    )]
    duration_secs: u64,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate the profile and exit
    #[arg(long, help = "Validate the acquisition profile and exit without acquiring")]
    validate_config: bool,

    /// Print the default profile and exit
    #[arg(long, help = "Print the default profile in TOML format and exit")]
    print_config: bool,

    /// Configure devices but do not start
    #[arg(long, help = "Perform dry run - configure devices but do not acquire")]
    dry_run: bool,

    /// Override log format (json, pretty, compact)
    #[arg(
        long,
        value_name = "FORMAT",
        help = "Log output format: json, pretty, or compact"
    )]
    log_format: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return Ok(());
    }

    init_logging(&args)?;

    info!("Starting scopecam v{}", env!("CARGO_PKG_VERSION"));
    info!("Acquisition profile: {}", args.config);

    let mut config = match ScopecamConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load profile: {}", e);
            return Err(e.into());
        }
    };
    if let Some(frames) = args.frames {
        for stream in &mut config.streams {
            stream.frame_count = frames;
        }
    }

    if let Err(e) = config.validate() {
        error!("Profile validation failed: {}", e);
        eprintln!("✗ Profile validation failed: {e}");
        std::process::exit(1);
    }
    if args.validate_config {
        println!("✓ Profile is valid");
        return Ok(());
    }

    let unbounded = config.streams.iter().any(|stream| stream.frame_count == 0);
    if unbounded && args.duration_secs == 0 && !args.dry_run {
        eprintln!("✗ Unbounded streams need --duration-secs");
        std::process::exit(1);
    }

    let mut runtime = Runtime::new().map_err(|e| {
        error!("Failed to initialize runtime: {}", e);
        e
    })?;

    let mut properties = config.to_properties(runtime.device_manager())?;
    runtime.configure(&mut properties)?;
    for (index, stream) in config.streams.iter().enumerate() {
        info!(
            "[stream {}] {} -> {} ({}x{} {}, {} frames)",
            index,
            properties.streams[index].camera.identifier.name,
            properties.streams[index].storage.identifier.name,
            stream.width,
            stream.height,
            stream.sample_type,
            stream.frame_count
        );
    }

    if args.dry_run {
        info!("Dry run complete - devices configured but not started");
        println!("✓ Dry run completed successfully - all devices configured");
        return Ok(());
    }

    runtime.start()?;
    wait_for_completion(&runtime, &config, args.duration_secs);
    let stop_result = runtime.stop();

    for index in 0..config.streams.len() {
        let progress = runtime.stream_progress(index)?;
        println!(
            "stream {}: {} frames written, {} dropped, {} appended",
            index, progress.frames_written, progress.frames_dropped, progress.frames_appended
        );
    }

    runtime.shutdown()?;
    stop_result?;
    info!("Acquisition complete");
    Ok(())
}

/// Poll stream progress until every bounded stream finished or the wall-clock
/// bound expires.
fn wait_for_completion(runtime: &Runtime, config: &ScopecamConfig, duration_secs: u64) {
    use std::time::{Duration, Instant};

    let deadline = (duration_secs > 0).then(|| Instant::now() + Duration::from_secs(duration_secs));
    let poll = Duration::from_millis(config.system.poll_ms.max(1));
    loop {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                info!("Wall-clock bound reached; stopping");
                return;
            }
        }
        let mut all_finished = true;
        for index in 0..config.streams.len() {
            match runtime.stream_progress(index) {
                Ok(progress) => {
                    if config.system.progress {
                        info!(
                            "[stream {}] {} written / {} dropped",
                            index, progress.frames_written, progress.frames_dropped
                        );
                    }
                    all_finished &= progress.finished;
                }
                Err(e) => {
                    error!("progress query failed: {}", e);
                    return;
                }
            }
        }
        if all_finished {
            return;
        }
        std::thread::sleep(poll);
    }
}

fn init_logging(args: &Args) -> Result<()> {
    use tracing_subscriber::{
        fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
    };

    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("scopecam={log_level}")));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{format}', using default");
            fmt::layer()
                .with_target(true)
                .with_thread_ids(args.debug)
                .with_file(args.debug)
                .with_line_number(args.debug)
                .boxed()
        }
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();

    Ok(())
}

/// Print the default acquisition profile in TOML format.
fn print_default_config() {
    println!("# scopecam acquisition profile");
    println!("# These are the built-in defaults; override in TOML or SCOPECAM_* env vars");
    println!();

    let default_config = ScopecamConfig::default();
    match toml::to_string_pretty(&default_config) {
        Ok(toml_str) => println!("{toml_str}"),
        Err(e) => eprintln!("Failed to render default profile: {e}"),
    }
}
