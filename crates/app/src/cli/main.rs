//! Phire preamp CLI Application

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use phire_core::domain::config::{ConfigManager, PreampConfig};
use phire_core::domain::controller::PreampController;
use phire_core::domain::preamp::{FilterEngine, Preamp};
use phire_core::domain::scheduler::Scheduler;
use phire_core::domain::sim::{RecordingFilterEngine, SimulatedGpio};
use phire_infra::{BruteFir, SysfsGpio, ThreadScheduler};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const BACKENDS: &[(&str, &str)] = &[
    ("phire", "sysfs GPIO relay boards with the BruteFIR filter engine"),
    ("simulated", "in-memory relays and filter engine, no hardware access"),
];

#[derive(Parser)]
#[command(name = "phire")]
#[command(about = "Relay preamplifier control", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backend to drive; `?` lists the available ones
    #[arg(short, long, default_value = "phire")]
    backend: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate the configuration and list the composite outputs
    Check,

    /// Drive the hardware to its safe state and print it
    ///
    /// Startup opens every output relay, sets volume 0 and drops the
    /// amplifier line, so a running system is reset, not inspected.
    Status,

    /// Power on, apply settings, hold until Ctrl-C, then power off
    Run {
        /// Composite output to select, as `output:coeff`
        #[arg(long)]
        output: Option<String>,

        /// Volume level 0-255
        #[arg(long)]
        volume: Option<i32>,

        /// Start muted
        #[arg(long)]
        mute: bool,

        /// Power off right after applying settings
        #[arg(long)]
        once: bool,
    },
}

async fn load_config(path: Option<PathBuf>) -> anyhow::Result<PreampConfig> {
    let config = match path {
        Some(path) => PreampConfig::load_from_file(&path)
            .await
            .with_context(|| format!("loading {}", path.display()))?,
        None => ConfigManager::new(ConfigManager::default_config_dir()?)
            .load()
            .await?,
    };
    Ok(config)
}

fn build(backend: &str, config: &PreampConfig) -> anyhow::Result<PreampController> {
    let scheduler: Arc<dyn Scheduler> =
        Arc::new(ThreadScheduler::new().context("starting timer thread")?);

    let preamp = match backend {
        "phire" => {
            let gpio = SysfsGpio::from_config(&config.gpio);
            let engine: Arc<dyn FilterEngine> = Arc::new(BruteFir::from_config(&config.filter_engine));
            PreampController::new(config, &gpio, engine, scheduler)?
        }
        "simulated" => {
            let gpio = SimulatedGpio::new();
            let engine: Arc<dyn FilterEngine> = Arc::new(RecordingFilterEngine::new());
            PreampController::new(config, &gpio, engine, scheduler)?
        }
        other => bail!("Unknown backend '{}', use --backend ? for a list", other),
    };
    Ok(preamp)
}

async fn blocking<T, F>(preamp: &Arc<PreampController>, f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&PreampController) -> phire_core::Result<T> + Send + 'static,
{
    let preamp = Arc::clone(preamp);
    Ok(tokio::task::spawn_blocking(move || f(&preamp)).await??)
}

fn print_status(preamp: &PreampController) -> anyhow::Result<()> {
    let status = preamp.status()?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Settings applied by `run` after power-on
struct Settings {
    output: Option<String>,
    volume: Option<i32>,
    mute: bool,
}

async fn apply_settings(preamp: &Arc<PreampController>, settings: Settings) -> anyhow::Result<()> {
    blocking(preamp, |p| p.turn_on()).await?;
    if let Some(output) = settings.output {
        blocking(preamp, move |p| p.set_output(&output)).await?;
    }
    if let Some(level) = settings.volume {
        blocking(preamp, move |p| p.set_volume(level)).await?;
    }
    if settings.mute {
        blocking(preamp, |p| p.mute(true)).await?;
    }
    print_status(preamp)
}

/// Power on, apply settings, optionally hold until Ctrl-C, then power off
///
/// Power-off runs even when a setting fails; the first error is returned.
async fn run_session(preamp: &Arc<PreampController>, settings: Settings, hold: bool) -> anyhow::Result<()> {
    let session = async move {
        apply_settings(preamp, settings).await?;
        if hold {
            info!("Holding, press Ctrl-C to power off");
            tokio::signal::ctrl_c().await?;
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;

    let shutdown = blocking(preamp, |p| p.shutdown()).await;
    if let (Err(e), Err(shutdown_error)) = (&session, &shutdown) {
        error!(error = %shutdown_error, session_error = %e, "Power-off after failed session also failed");
    }
    session?;
    shutdown?;
    print_status(preamp)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    if cli.backend == "?" {
        println!("Valid backends:");
        for (name, description) in BACKENDS {
            println!("\t{:<10} {}", name, description);
        }
        return Ok(());
    }

    let config = load_config(cli.config).await?;

    if let Command::Check = cli.command {
        for id in config.output_ids() {
            println!("{}", id);
        }
        info!(outputs = config.outputs.len(), "Configuration is valid");
        return Ok(());
    }

    let backend = cli.backend.clone();
    let preamp = Arc::new(
        tokio::task::spawn_blocking(move || build(&backend, &config)).await??,
    );
    info!(backend = %cli.backend, "Preamp ready");

    match cli.command {
        Command::Check => {}
        Command::Status => print_status(&preamp)?,
        Command::Run {
            output,
            volume,
            mute,
            once,
        } => {
            let settings = Settings {
                output,
                volume,
                mute,
            };
            run_session(&preamp, settings, !once).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use phire_core::domain::error::PreampError;

    fn simulated() -> Arc<PreampController> {
        let mut config = PreampConfig::factory_default();
        config.timing.settle_ms = 0;
        config.timing.debounce_ms = 0;
        config.amplifier.on_delay_ms = 0;
        Arc::new(build("simulated", &config).unwrap())
    }

    #[tokio::test]
    async fn test_failed_setting_still_powers_off() {
        let preamp = simulated();
        let settings = Settings {
            output: Some("speakers:harman_with_sub_dec7".to_string()),
            volume: Some(300),
            mute: false,
        };

        let err = run_session(&preamp, settings, false).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PreampError>(),
            Some(PreampError::InvalidParameter { parameter: "volume", .. })
        ));

        assert!(!preamp.is_on());
        assert_eq!(preamp.get_volume(), 0);
        assert!(!preamp.amplifier_powered().unwrap());
        assert!(!preamp.amplifier_off_pending());
        assert!(preamp.physical_outputs().is_empty());
    }

    #[tokio::test]
    async fn test_session_applies_settings_then_powers_off() {
        let preamp = simulated();
        let settings = Settings {
            output: Some("headphones:hd650".to_string()),
            volume: Some(120),
            mute: true,
        };

        run_session(&preamp, settings, false).await.unwrap();

        assert!(!preamp.is_on());
        assert_eq!(preamp.get_volume(), 0);
        assert_eq!(preamp.get_output().as_deref(), Some("off:dirac"));
    }

    #[test]
    fn test_status_help_warns_about_reset() {
        let cli = Cli::command();
        let status = cli.find_subcommand("status").unwrap();
        let help = status.get_long_about().unwrap().to_string();
        assert!(help.contains("reset"));
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let err = build("nope", &PreampConfig::factory_default()).err().unwrap();
        assert!(err.to_string().contains("Unknown backend"));
    }
}
