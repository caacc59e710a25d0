use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use eyre::{Context, Result, eyre};
use serde::Deserialize;

use signal_media_export::config::{ExportConfig, normalize_phone_number};
use signal_media_export::run;

/// Export media attachments and conversations from Signal Desktop to HTML.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Output directory for media files and conversation HTML.
    /// Defaults to ./signal-export if not set in config.
    #[arg(value_name = "OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Signal Desktop profile directory.
    /// Defaults to the platform config dir (e.g. ~/.config/Signal).
    #[arg(short, long, value_name = "PATH")]
    signal_dir: Option<PathBuf>,

    /// Path to a specific configuration file.
    /// Defaults to $XDG_CONFIG_HOME/signal-media-export/config.toml
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Export media for at most N messages then stop (0 = no limit).
    #[arg(long, value_name = "N")]
    max_messages: Option<i64>,

    /// Stop exporting attachments after N of them (0 = no limit).
    #[arg(long, value_name = "N")]
    max_attachments: Option<i64>,

    /// Include expiring messages.
    #[arg(short = 'e', long)]
    include_expiring_messages: bool,

    /// One directory per conversation with an index.html, instead of
    /// flat {name}.html files.
    #[arg(long)]
    conversation_dirs: bool,

    /// Log every skipped file and dedup decision.
    #[arg(short, long)]
    verbose: bool,

    /// Only log warnings and errors.
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct FileConfig {
    output_dir: Option<PathBuf>,
    signal_dir: Option<PathBuf>,
    max_messages: Option<i64>,
    max_attachments: Option<i64>,
    include_expiring_messages: Option<bool>,
    conversation_dirs: Option<bool>,
    /// Phone number → display name overrides.
    contacts: Option<BTreeMap<String, String>>,
    /// Extra PRAGMA settings for the encrypted database.
    sqlcipher: Option<BTreeMap<String, toml::Value>>,
}

fn default_signal_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("Signal"))
}

fn load_file_config(explicit_path: Option<&Path>) -> Result<FileConfig> {
    let path = if let Some(p) = explicit_path {
        if !p.exists() {
            return Err(eyre!("Config file not found: {}", p.display()));
        }
        Some(p.to_path_buf())
    } else {
        dirs::config_dir()
            .map(|d| d.join("signal-media-export/config.toml"))
            .filter(|p| p.exists())
    };

    match path {
        None => Ok(FileConfig::default()),
        Some(p) => {
            let content = fs::read_to_string(&p)
                .wrap_err_with(|| format!("Failed to read config: {}", p.display()))?;
            toml::from_str(&content)
                .wrap_err_with(|| format!("Failed to parse config: {}", p.display()))
        }
    }
}

fn non_negative(value: Option<i64>, what: &str) -> Result<Option<u64>> {
    match value {
        None => Ok(None),
        Some(n) if n >= 0 => Ok(Some(n as u64)),
        Some(n) => Err(eyre!("Invalid {} {} (must be >= 0).", what, n)),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.quiet {
        "warn"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    // Command line args override the config file, which overrides defaults.
    let file_cfg = load_file_config(cli.config.as_deref())?;

    let output_dir = cli
        .output_dir
        .or(file_cfg.output_dir)
        .unwrap_or_else(|| PathBuf::from("signal-export"));

    let signal_dir = cli
        .signal_dir
        .or(file_cfg.signal_dir)
        .or_else(default_signal_dir)
        .ok_or_else(|| {
            eyre!("Could not determine the Signal profile directory.\nUse --signal-dir to specify it manually.")
        })?;

    let max_messages = non_negative(cli.max_messages, "max number of messages")?
        .or(non_negative(file_cfg.max_messages, "max number of messages")?)
        .unwrap_or(0);
    let max_attachments = non_negative(cli.max_attachments, "max number of attachments")?
        .or(non_negative(file_cfg.max_attachments, "max number of attachments")?)
        .unwrap_or(0);

    let contacts = file_cfg
        .contacts
        .unwrap_or_default()
        .into_iter()
        .map(|(number, name)| (normalize_phone_number(&number), name))
        .collect();

    let mut sqlcipher: BTreeMap<String, String> =
        [("cipher_compatibility".to_string(), "4".to_string())].into();
    for (setting, value) in file_cfg.sqlcipher.unwrap_or_default() {
        let value = match value {
            toml::Value::String(s) => s,
            other => other.to_string(),
        };
        sqlcipher.insert(setting, value);
    }

    let config = ExportConfig {
        output_dir,
        signal_dir,
        max_messages,
        max_attachments,
        include_expiring: cli.include_expiring_messages
            || file_cfg.include_expiring_messages.unwrap_or(false),
        conversation_dirs: cli.conversation_dirs || file_cfg.conversation_dirs.unwrap_or(false),
        contacts,
        sqlcipher,
    };

    run::execute(&config)
}
