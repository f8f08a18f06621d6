pub mod anomaly;
pub mod config;
pub mod db {
    pub mod models;
}
pub mod mailer;
pub mod push;
pub mod schema;
pub mod server;
pub mod services {
    pub mod evaluation;
    pub mod receipts;
    pub mod registry;
    pub mod scheduler;
}
pub mod utils;
pub mod weather;

use crate::config::{Config, Settings, SharedSettings};
use crate::mailer::Mailer;
use crate::push::PushClient;
use crate::server::AppState;
use crate::services::{receipts, scheduler};
use crate::utils::Shutdown;
use crate::weather::WeatherClient;
use diesel::{Connection, PgConnection};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::{error, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

fn apply_database_migrations(conn: &mut PgConnection) -> Result<(), String> {
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| format!("database migration failed: {}", e))?;
    if applied.is_empty() {
        info!("Database schema already current; no migrations to apply");
    } else {
        let names: Vec<String> = applied.iter().map(|v| v.to_string()).collect();
        info!("Applied {} migration(s): {}", applied.len(), names.join(", "));
    }
    Ok(())
}

pub fn run() -> Result<(), String> {
    // 1) Load config and initial settings
    let cfg = Config::from_env()?;
    let settings = SharedSettings::new(Settings::from_env()?);
    {
        let snapshot = settings.snapshot();
        info!(
            "Config loaded (threshold={}°F, check_interval={}s, historical_years={}, scheduler_enabled={}, listen={})",
            snapshot.threshold_f,
            snapshot.check_interval.as_secs(),
            cfg.historical_years,
            cfg.scheduler_enabled,
            cfg.listen_addr
        );
    }

    // 2) Connect DB and apply pending migrations
    let mut conn = PgConnection::establish(&cfg.database_url).map_err(|e| format!("DB connection failed: {}", e))?;
    info!("Connected to database");
    apply_database_migrations(&mut conn)?;

    // 3) Init collaborator clients
    let weather = Arc::new(WeatherClient::new(&cfg.weather_base_url, &cfg.weather_api_key));
    let push = Arc::new(PushClient::new(&cfg.push_base_url));
    let mailer = Arc::new(
        Mailer::new(&cfg.smtp_host, cfg.smtp_port, &cfg.mail_username, &cfg.mail_password)
            .map_err(|e| format!("SMTP transport init failed: {}", e))?,
    );

    let shutdown = Arc::new(Shutdown::default());

    // 4) HTTP control surface on its own thread (owns the tokio runtime)
    let http_state = AppState {
        database_url: cfg.database_url.clone(),
        settings: settings.clone(),
        weather: Arc::clone(&weather),
        mailer: Arc::clone(&mailer),
        push: Arc::clone(&push),
        historical_years: cfg.historical_years,
    };
    let http_shutdown = Arc::clone(&shutdown);
    let listen_addr = cfg.listen_addr.clone();
    let http_handle = thread::Builder::new()
        .name("http".to_string())
        .spawn(move || {
            if let Err(e) = server::run_blocking(http_state, &listen_addr, Arc::clone(&http_shutdown)) {
                error!("HTTP server terminated: {}", e);
                http_shutdown.trigger();
            }
        })
        .map_err(|e| format!("spawning http thread failed: {}", e))?;

    // 5) Push receipt reconciliation loop, time-decoupled from evaluation
    let receipts_shutdown = Arc::clone(&shutdown);
    let receipts_push = Arc::clone(&push);
    let receipts_db_url = cfg.database_url.clone();
    let receipts_handle = thread::Builder::new()
        .name("receipts".to_string())
        .spawn(move || match PgConnection::establish(&receipts_db_url) {
            Ok(mut conn) => receipts::run_loop(&mut conn, &receipts_push, &receipts_shutdown),
            Err(e) => error!("Receipt loop disabled, DB connection failed: {}", e),
        })
        .map_err(|e| format!("spawning receipts thread failed: {}", e))?;

    // 6) Scheduled evaluation loop on the main thread
    if cfg.scheduler_enabled {
        info!(
            "Starting scheduler loop (interval={}s)",
            settings.snapshot().check_interval.as_secs()
        );
        scheduler::run_loop(
            &mut conn,
            &weather,
            &mailer,
            &push,
            &settings,
            cfg.historical_years,
            &shutdown,
        );
    } else {
        info!("Scheduler disabled via SCHEDULER_ENABLED; serving HTTP triggers only");
        while !shutdown.sleep(Duration::from_secs(60)) {}
    }

    // 7) Shutdown: latch is tripped, wait for the background threads
    if receipts_handle.join().is_err() {
        error!("Receipts thread panicked during shutdown");
    }
    if http_handle.join().is_err() {
        error!("HTTP thread panicked during shutdown");
    }
    info!("Shutdown complete");
    Ok(())
}

#[derive(Debug)]
struct LoadedEnvFile {
    path: PathBuf,
    explicit: bool,
}

fn configure_env_from_cli() -> Result<Option<LoadedEnvFile>, String> {
    let mut args = std::env::args_os();
    args.next(); // skip program name

    let mut env_file: Option<PathBuf> = None;

    while let Some(arg) = args.next() {
        // Both spellings: `--env-file PATH` and `--env-file=PATH`.
        let path = match arg.to_str() {
            Some("--env-file") => args.next().map(PathBuf::from),
            Some(s) if s.starts_with("--env-file=") => {
                Some(&s["--env-file=".len()..]).filter(|p| !p.is_empty()).map(PathBuf::from)
            }
            Some("--") => break,
            Some(other) => return Err(format!("unrecognised argument: {}", other)),
            None => return Err("argument contains invalid UTF-8".to_string()),
        };
        let path = path.ok_or_else(|| "`--env-file` requires a path argument".to_string())?;
        if env_file.replace(path).is_some() {
            return Err("`--env-file` given more than once".to_string());
        }
    }

    match env_file {
        Some(path) => {
            if !path.is_file() {
                return Err(format!("env file does not exist: {}", path.display()));
            }
            load_env_file(&path)?;
            Ok(Some(LoadedEnvFile { path, explicit: true }))
        }
        None => {
            let fallback = std::env::current_dir()
                .map_err(|e| format!("unable to read current directory: {}", e))?
                .join(".env");
            if !fallback.is_file() {
                return Ok(None);
            }
            load_env_file(&fallback)?;
            Ok(Some(LoadedEnvFile {
                path: fallback,
                explicit: false,
            }))
        }
    }
}

/// Minimal `.env` loader: `KEY=VALUE` lines, `#` comments, optional
/// `export ` prefix, optional single/double quoting of the whole value.
/// Values already present in the process environment win.
fn load_env_file(path: &Path) -> Result<(), String> {
    let contents = std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;

    for (index, line) in contents.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let assignment = trimmed.strip_prefix("export ").map(str::trim_start).unwrap_or(trimmed);
        let (key, raw_value) = assignment
            .split_once('=')
            .ok_or_else(|| format!("{}:{}: missing '=' in assignment", path.display(), index + 1))?;

        let key = key.trim();
        if key.is_empty() || key.chars().any(char::is_whitespace) {
            return Err(format!(
                "{}:{}: invalid environment variable name: {:?}",
                path.display(),
                index + 1,
                key
            ));
        }

        let raw_value = raw_value.trim();
        let value = raw_value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| raw_value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(raw_value);

        if std::env::var_os(key).is_none() {
            std::env::set_var(key, value);
        }
    }

    Ok(())
}

fn main() {
    let loaded_env = match configure_env_from_cli() {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "toohot-alerts {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run() {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
