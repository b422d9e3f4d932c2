use anyhow::{bail, Context};
use chrono::{Local, Utc};
use clap::{Parser, Subcommand};
use reveille::alarm::{next_occurrence, parse_time_of_day, Alarm, AlarmId};
use reveille::config::{self, Config};
use reveille::daemon;
use reveille::engine::DismissOutcome;
use reveille::ipc::{self, IpcCommand, IpcResponse, IpcResponseData};
use reveille::playback::sounds::catalog_name;
use reveille::playback::SoundCatalog;
use reveille::store::{AlarmStore, JsonAlarmStore};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "reveille")]
#[command(author, version, about = "Wake-up alarm daemon that rings until dismissed", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon
    Start {
        /// Run in foreground instead of daemonizing
        #[arg(short, long)]
        foreground: bool,
    },

    /// Stop the running daemon
    Stop,

    /// Check daemon status
    Status,

    /// Manage alarms
    Alarm {
        #[command(subcommand)]
        action: AlarmAction,
    },

    /// Open the ringing alarm (keeps it ringing until dismissed)
    Open {
        /// Alarm id or id prefix (defaults to the ringing alarm)
        id: Option<String>,
    },

    /// Dismiss the ringing alarm
    Dismiss {
        /// Alarm id or id prefix (defaults to the ringing alarm)
        id: Option<String>,
    },

    /// Snooze the ringing alarm
    Snooze {
        /// Alarm id or id prefix (defaults to the ringing alarm)
        id: Option<String>,
    },

    /// List alarm sounds and whether their files are installed
    Sounds,

    /// Configure settings
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[derive(Subcommand)]
enum AlarmAction {
    /// Add an alarm at a local time of day
    Add {
        /// Time of day, 24h (e.g. "06:30")
        time: String,

        /// Label shown in notifications
        #[arg(short, long, default_value = "")]
        label: String,

        /// Sound name (see `reveille sounds`)
        #[arg(short, long)]
        sound: Option<String>,

        /// Ring once, then delete the alarm
        #[arg(long)]
        once: bool,
    },

    /// List alarms
    List,

    /// Remove an alarm
    Remove { id: String },

    /// Enable an alarm
    Enable { id: String },

    /// Disable an alarm
    Disable { id: String },

    /// Ring an alarm right now
    Test { id: String },
}

/// Set up stderr logging, plus a daily log file for the daemon.
fn init_logging(verbose: bool, config: &Config, log_to_file: bool) -> Option<WorkerGuard> {
    let filter = if verbose {
        EnvFilter::new("reveille=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("reveille={}", config.logging.level)))
    };

    let (file_layer, guard) = match Config::data_dir() {
        Ok(dir) if log_to_file && config.logging.file => {
            let appender = tracing_appender::rolling::daily(dir, "reveille.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    guard
}

/// Forward a command to the daemon if it is running. Alarm edits are still
/// picked up at the next daemon start when it is not.
fn notify_daemon(cmd: IpcCommand) {
    if !daemon::is_running() {
        return;
    }
    match ipc::request(cmd) {
        Ok(response) if !response.ok => {
            warn!(
                "Daemon rejected update: {}",
                response.error.unwrap_or_default()
            );
        }
        Ok(_) => {}
        Err(e) => warn!("Could not notify daemon: {}", e),
    }
}

/// Send a command to the daemon, failing when it is not running or refuses.
fn send(cmd: IpcCommand) -> anyhow::Result<IpcResponse> {
    if !daemon::is_running() {
        bail!("Daemon not running (start it with `reveille start`)");
    }
    let response = ipc::request(cmd)?;
    if !response.ok {
        bail!("{}", response.error.unwrap_or_else(|| "request failed".into()));
    }
    Ok(response)
}

fn lookup(store: &dyn AlarmStore, id: &str) -> anyhow::Result<Alarm> {
    daemon::find_alarm(store, id).with_context(|| format!("No alarm matches '{}'", id))
}

/// Resolve an optional id argument, accepting prefixes of stored alarms.
fn target(store: &dyn AlarmStore, id: Option<String>) -> Option<AlarmId> {
    id.map(|id| {
        daemon::find_alarm(store, &id)
            .map(|a| a.id)
            .unwrap_or_else(|| AlarmId::from(id))
    })
}

fn short_id(id: &AlarmId) -> &str {
    id.as_str().get(..8).unwrap_or(id.as_str())
}

fn alarm_command(action: AlarmAction, config: &Config) -> anyhow::Result<()> {
    let store = JsonAlarmStore::open_default()?;

    match action {
        AlarmAction::Add {
            time,
            label,
            sound,
            once,
        } => {
            let time_of_day = parse_time_of_day(&time)
                .with_context(|| format!("Invalid time '{}', expected HH:MM", time))?;
            let when = next_occurrence(time_of_day, Local::now())
                .with_context(|| format!("{} does not exist today or tomorrow", time))?;

            let sound = match sound {
                Some(name) => catalog_name(&name)
                    .with_context(|| format!("Unknown sound '{}' (see `reveille sounds`)", name))?
                    .to_string(),
                None => config
                    .playback
                    .preferred_sounds
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "radar".to_string()),
            };

            let alarm = if once {
                Alarm::one_shot(when, label, sound)
            } else {
                Alarm::new(when, label, sound)
            };
            let id = alarm.id.clone();
            store.upsert(alarm)?;
            info!("Added alarm {}", id);
            println!(
                "Added alarm {} for {}",
                short_id(&id),
                when.with_timezone(&Local).format("%a %H:%M")
            );
            notify_daemon(IpcCommand::Arm { alarm_id: id });
        }

        AlarmAction::List => {
            let mut alarms = store.list();
            if alarms.is_empty() {
                println!("No alarms");
                return Ok(());
            }
            alarms.sort_by_key(|a| a.time);
            for alarm in alarms {
                println!(
                    "{}  {}  {:<8} {:<6} {:<9} {}",
                    short_id(&alarm.id),
                    alarm.time.with_timezone(&Local).format("%a %H:%M"),
                    if alarm.enabled { "enabled" } else { "disabled" },
                    if alarm.is_one_shot() { "once" } else { "daily" },
                    alarm.sound_name,
                    alarm.label
                );
            }
        }

        AlarmAction::Remove { id } => {
            let alarm = lookup(&store, &id)?;
            store.remove(&alarm.id)?;
            println!("Removed alarm {}", short_id(&alarm.id));
            notify_daemon(IpcCommand::Disarm { alarm_id: alarm.id });
        }

        AlarmAction::Enable { id } => {
            let mut alarm = lookup(&store, &id)?;
            alarm.enabled = true;
            if alarm.time <= Utc::now() {
                let time_of_day = alarm.time.with_timezone(&Local).time();
                if let Some(next) = next_occurrence(time_of_day, Local::now()) {
                    alarm.time = next;
                }
            }
            let alarm_id = alarm.id.clone();
            store.upsert(alarm)?;
            println!("Enabled alarm {}", short_id(&alarm_id));
            notify_daemon(IpcCommand::Arm { alarm_id });
        }

        AlarmAction::Disable { id } => {
            let alarm = lookup(&store, &id)?;
            store.set_enabled(&alarm.id, false)?;
            println!("Disabled alarm {}", short_id(&alarm.id));
            notify_daemon(IpcCommand::Disarm { alarm_id: alarm.id });
        }

        AlarmAction::Test { id } => {
            let alarm = lookup(&store, &id)?;
            send(IpcCommand::Test {
                alarm_id: alarm.id.clone(),
            })?;
            println!(
                "Alarm {} is ringing, stop it with `reveille dismiss`",
                short_id(&alarm.id)
            );
        }
    }

    Ok(())
}

fn list_sounds(config: &Config) -> anyhow::Result<()> {
    let catalog = SoundCatalog::scan(
        config.playback.sounds_dir()?,
        &config.playback.preferred_sounds,
    );

    println!("Sounds directory: {}\n", catalog.dir().display());
    for (name, installed) in catalog.entries() {
        println!(
            "  {:<10} {}",
            name,
            if installed { "installed" } else { "missing (built-in tone is used)" }
        );
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    reveille::panic_handler::install();

    let cli = Cli::parse();
    let config = Config::load()?;
    let _log_guard = init_logging(
        cli.verbose,
        &config,
        matches!(cli.command, Commands::Start { .. }),
    );

    match cli.command {
        Commands::Start { foreground } => {
            info!("Starting Reveille daemon...");
            daemon::run(config, foreground).await?;
        }

        Commands::Stop => {
            info!("Stopping Reveille daemon...");
            daemon::stop().await?;
        }

        Commands::Status => {
            daemon::status().await?;
        }

        Commands::Alarm { action } => alarm_command(action, &config)?,

        Commands::Open { id } => {
            let store = JsonAlarmStore::open_default()?;
            send(IpcCommand::Open {
                alarm_id: target(&store, id),
            })?;
            println!("Alarm opened, it keeps ringing until dismissed");
        }

        Commands::Dismiss { id } => {
            let store = JsonAlarmStore::open_default()?;
            let response = send(IpcCommand::Dismiss {
                alarm_id: target(&store, id),
            })?;
            match response.data {
                Some(IpcResponseData::Dismissed {
                    outcome: DismissOutcome::Dismissed,
                }) => println!("Alarm dismissed"),
                Some(IpcResponseData::Dismissed {
                    outcome: DismissOutcome::AlreadyDismissed,
                }) => println!("Alarm was already dismissed"),
                _ => println!("No alarm is ringing"),
            }
        }

        Commands::Snooze { id } => {
            let store = JsonAlarmStore::open_default()?;
            let response = send(IpcCommand::Snooze {
                alarm_id: target(&store, id),
            })?;
            if let Some(IpcResponseData::Snoozed { until, .. }) = response.data {
                println!(
                    "Snoozed until {}",
                    until.with_timezone(&Local).format("%H:%M")
                );
            }
        }

        Commands::Sounds => list_sounds(&config)?,

        Commands::Config { show } => {
            if show {
                config::show()?;
            } else {
                println!("Edit {} to change settings", Config::config_path()?.display());
            }
        }
    }

    Ok(())
}
