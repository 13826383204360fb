//! usbasp-console
//!
//! Serial console for USBasp programmers. Waits for the programmer to be
//! plugged in, claims it and prints whatever its UART receives.

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use common::setup_logging;
use console::config::{ConfigProvider, ConsoleConfig, OutputSettings, SharedConfig};
use console::usb::{OpenOutcome, RusbTransport, SessionController, Transport};
use console::{Console, ConsoleSink, SHUTDOWN_TIMEOUT, WriterSink};
use protocol::{TestCommand, USBASP};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usbasp-console")]
#[command(author, version, about = "Serial console for USBasp programmers")]
#[command(long_about = "
Prints the output of a USBasp programmer's UART. The programmer is picked up
automatically when it is plugged in and released when it is unplugged.

EXAMPLES:
    # Run with default config
    usbasp-console --enable

    # Run with custom config
    usbasp-console --config /path/to/console.toml

    # Check whether a USBasp is connected
    usbasp-console --probe

    # Blink the programmer's LED
    usbasp-console --test-command 2

CONFIGURATION:
    The console looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbasp-console/console.toml
    3. /etc/usbasp-console/console.toml
    4. Built-in defaults

Send SIGHUP to reload the configuration file.
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Enable the console regardless of the configuration file
    #[arg(long)]
    enable: bool,

    /// Report whether a USBasp is connected and exit
    #[arg(long)]
    probe: bool,

    /// Send diagnostic command N (1-3) to a connected USBasp and exit
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u8).range(1..=3))]
    test_command: Option<u8>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = ConsoleConfig::default();
        let path = ConsoleConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = load_config(args.config.as_ref())?;

    // Use CLI log level if specified, otherwise use config value
    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.console.log_level);

    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usbasp-console v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    if args.probe {
        return tokio::task::spawn_blocking(probe_mode)
            .await
            .context("Probe task failed")?;
    }

    if let Some(number) = args.test_command {
        let baud_rate = config.console.baud_rate;
        return tokio::task::spawn_blocking(move || test_command_mode(number, baud_rate))
            .await
            .context("Test command task failed")?;
    }

    run_console(args, config).await
}

/// Load the configuration file, falling back to defaults unless a path was
/// given explicitly
fn load_config(path: Option<&PathBuf>) -> Result<ConsoleConfig> {
    match path {
        Some(path) => {
            ConsoleConfig::load(Some(path.clone())).context("Failed to load configuration")
        }
        None => Ok(ConsoleConfig::load_or_default()),
    }
}

fn open_sink(output: &OutputSettings) -> Result<Box<dyn ConsoleSink>> {
    match output.resolved_path() {
        Some(path) => {
            let sink = WriterSink::file(&path, output.append)
                .with_context(|| format!("Failed to open output file: {}", path.display()))?;
            info!("Writing device output to {}", path.display());
            Ok(Box::new(sink))
        }
        None => Ok(Box::new(WriterSink::stdout())),
    }
}

/// Run until Ctrl+C, reloading the configuration on SIGHUP
async fn run_console(args: Args, config: ConsoleConfig) -> Result<()> {
    let shared = Arc::new(SharedConfig::new(config.clone()));
    if args.enable {
        shared.set_enabled(true);
    }

    let sink = open_sink(&config.output)?;
    let console = Arc::new(
        Console::<RusbTransport>::new(
            USBASP,
            Arc::clone(&shared) as Arc<dyn ConfigProvider>,
            Box::new(RusbTransport::new),
            sink,
        )
        .context("Failed to start console reader")?,
    );

    apply_settings(&console).await;
    if !shared.is_feature_enabled() {
        info!("USBasp console is disabled; set console.enabled or pass --enable");
    }

    let mut reload = ReloadSignal::new()?;
    info!("Press Ctrl+C to shutdown");

    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                    Err(e) => error!("Error waiting for Ctrl+C: {}", e),
                }
                break;
            }
            Some(()) = reload.recv() => {
                info!("Received SIGHUP, reloading configuration");
                match load_config(args.config.as_ref()) {
                    Ok(mut next) => {
                        if next.output != shared.get().output {
                            warn!("Output settings changed; restart to apply them");
                        }
                        next.console.enabled |= args.enable;
                        match shared.replace(next) {
                            Ok(()) => apply_settings(&console).await,
                            Err(e) => error!("Rejected configuration: {:#}", e),
                        }
                    }
                    Err(e) => error!("{:#}", e),
                }
            }
        }
    }

    let stopped = tokio::task::spawn_blocking(move || match Arc::try_unwrap(console) {
        Ok(console) => console.shutdown(SHUTDOWN_TIMEOUT),
        // Remaining references shut it down on drop
        Err(_) => false,
    })
    .await
    .context("Shutdown task failed")?;

    if !stopped {
        warn!("Console reader did not stop cleanly");
    }
    info!("Shutdown complete");
    Ok(())
}

/// Deliver a settings-changed notification off the async runtime
async fn apply_settings(console: &Arc<Console<RusbTransport>>) {
    let console = Arc::clone(console);
    match tokio::task::spawn_blocking(move || console.settings_changed()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Failed to apply settings"),
        Err(e) => error!("Settings task failed: {}", e),
    }
}

/// Report whether a USBasp is connected
fn probe_mode() -> Result<()> {
    let transport = RusbTransport::new().context("Failed to initialise USB")?;

    match transport
        .open_by_identity(&USBASP)
        .context("Failed to query USB devices")?
    {
        Some(_) => println!("USBasp found: {}", USBASP),
        None => println!("No USBasp connected ({})", USBASP),
    }
    println!(
        "Hotplug support: {}",
        if transport.has_hotplug() { "yes" } else { "no" }
    );

    Ok(())
}

/// Open a one-off session, send a diagnostic command and close again
fn test_command_mode(number: u8, baud_rate: u32) -> Result<()> {
    let command = TestCommand::from_number(number)
        .ok_or_else(|| anyhow!("Test command must be 1, 2 or 3, got {}", number))?;

    let transport = RusbTransport::new().context("Failed to initialise USB")?;
    let controller = SessionController::new(USBASP);

    match controller
        .open_session(&transport, baud_rate)
        .context("Failed to open USBasp")?
    {
        OpenOutcome::Opened { .. } => {}
        OpenOutcome::NotPresent => bail!("No USBasp connected ({})", USBASP),
    }

    let reply = controller.test_command(command);
    if let Err(e) = controller.close_session() {
        warn!(error = %e, "Error closing session");
    }

    match reply.with_context(|| format!("Test command {} failed", number))? {
        Some(byte) => println!("Test command {} returned 0x{:02x}", number, byte),
        None => println!("Test command {} returned no data", number),
    }
    Ok(())
}

/// SIGHUP listener; never fires on platforms without it
#[cfg(unix)]
struct ReloadSignal(signal::unix::Signal);

#[cfg(unix)]
impl ReloadSignal {
    fn new() -> Result<Self> {
        signal::unix::signal(signal::unix::SignalKind::hangup())
            .map(Self)
            .context("Failed to install SIGHUP handler")
    }

    async fn recv(&mut self) -> Option<()> {
        self.0.recv().await
    }
}

#[cfg(not(unix))]
struct ReloadSignal;

#[cfg(not(unix))]
impl ReloadSignal {
    fn new() -> Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> Option<()> {
        std::future::pending().await
    }
}
