//! cloak: encrypt files and folders in place
//!
//! Commands:
//!   encrypt <path>   - seal a file or directory tree behind an opaque id
//!   decrypt <path>   - restore an `<id>.enc` file or `<id>` directory
//!   hide <id>        - hide the artifact of a registered item
//!   reveal <id>      - make a hidden artifact visible again
//!   list             - show every registered item
//!   config show      - display current configuration
//!
//! The passphrase is read from `--passphrase-file` or `CLOAK_PASSPHRASE`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use secrecy::SecretString;
use tracing::info;

use cloak_core::config::CloakConfig;
use cloak_core::types::ExtraProps;
use cloak_core::Item;
use cloak_crypto::KdfParams;
use cloak_engine::{Engine, FolderDecryption, ProgressFn};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "cloak",
    version,
    about = "In-place file and folder encryption",
    long_about = "cloak: encrypt files and folders in place, hiding their names behind opaque ids"
)]
struct Cli {
    /// Path to cloak.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "CLOAK_CONFIG",
        default_value = "~/.config/cloak/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [log].level
    #[arg(long, env = "CLOAK_LOG")]
    log: Option<String>,

    /// Log format; overrides [log].format
    #[arg(long, env = "CLOAK_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    /// Read the passphrase from this file instead of CLOAK_PASSPHRASE
    #[arg(long, global = true)]
    passphrase_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encrypt a file or directory tree in place
    Encrypt {
        /// File or directory to encrypt
        path: PathBuf,
        /// Attach a `key=value` property to the file record (repeatable;
        /// requires engine.allow_extra_props)
        #[arg(long = "prop", value_parser = parse_prop)]
        props: Vec<(String, String)>,
    },

    /// Restore an encrypted file (`<id>.enc`) or directory (`<id>`)
    Decrypt {
        /// Encrypted artifact, hidden or not
        path: PathBuf,
    },

    /// Hide the artifact of a registered item
    Hide { id: String },

    /// Make a hidden artifact visible again
    Reveal { id: String },

    /// List registered items
    List {
        /// Print the records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cloak_core::config::expand_home(&cli.config);
    let config = CloakConfig::load(&config_path)
        .with_context(|| format!("loading config {}", config_path.display()))?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = match &cli.log_format {
        Some(format) => format.clone(),
        None if config.log.format.eq_ignore_ascii_case("json") => LogFormat::Json,
        None => LogFormat::Text,
    };
    init_logging(&level, &format);

    if let Commands::Config { action: ConfigAction::Show } = &cli.command {
        return cmd_config_show(&config, &config_path);
    }

    let passphrase = read_passphrase(cli.passphrase_file.as_deref())?;
    let engine = Engine::init(
        &passphrase,
        config.engine.clone(),
        KdfParams::from(&config.kdf),
    )
    .await
    .context("opening the encrypted store")?;

    let result = match cli.command {
        Commands::Encrypt { path, props } => cmd_encrypt(&engine, &path, props).await,
        Commands::Decrypt { path } => cmd_decrypt(&engine, &path).await,
        Commands::Hide { id } => cmd_visibility(&engine, &id, true).await,
        Commands::Reveal { id } => cmd_visibility(&engine, &id, false).await,
        Commands::List { json } => cmd_list(&engine, json).await,
        Commands::Config { .. } => Ok(()),
    };

    engine.shutdown();
    result
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn read_passphrase(file: Option<&Path>) -> Result<SecretString> {
    let raw = match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading passphrase file {}", path.display()))?,
        None => std::env::var("CLOAK_PASSPHRASE")
            .context("no passphrase: set CLOAK_PASSPHRASE or pass --passphrase-file")?,
    };
    let trimmed = raw.trim_end_matches(['\r', '\n']);
    anyhow::ensure!(!trimmed.is_empty(), "passphrase is empty");
    Ok(SecretString::from(trimmed.to_string()))
}

fn parse_prop(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got {raw:?}")),
    }
}

/// Progress callback that logs once per 10% step.
fn progress_logger(label: String) -> ProgressFn {
    let last_step = AtomicU64::new(0);
    Arc::new(move |done: u64, total: u64| {
        let step = progress_step(done, total);
        if step > last_step.fetch_max(step, Ordering::Relaxed) {
            info!(target: "cloak::progress", path = %label, done, total, "{}%", step * 10);
        }
    })
}

/// Completed tenths of `total`, 0..=10.
fn progress_step(done: u64, total: u64) -> u64 {
    if total == 0 {
        return 10;
    }
    (done.min(total) as u128 * 10 / total as u128) as u64
}

// ── `cloak encrypt` / `cloak decrypt` ─────────────────────────────────────────

async fn cmd_encrypt(engine: &Engine, path: &Path, props: Vec<(String, String)>) -> Result<()> {
    let meta = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("stat {}", path.display()))?;
    let progress = Some(progress_logger(path.display().to_string()));

    if meta.is_dir() {
        anyhow::ensure!(props.is_empty(), "--prop applies to files only");
        let encrypted = engine
            .encrypt_folder(path, progress)
            .await
            .with_context(|| format!("encrypting folder {}", path.display()))?;
        println!("Encrypted folder:");
        println!("  id:      {}", encrypted.item.meta.id);
        println!("  path:    {}", encrypted.path.display());
        println!("  size:    {}", fmt_bytes(encrypted.item.meta.size));
        println!("  skipped: {}", encrypted.skipped);
    } else {
        let item = if props.is_empty() {
            engine.encrypt_file(path, progress).await
        } else {
            let props: ExtraProps = props
                .into_iter()
                .map(|(k, v)| (k, serde_json::Value::String(v)))
                .collect();
            engine.encrypt_file_with_props(path, props, progress).await
        }
        .with_context(|| format!("encrypting {}", path.display()))?;
        let artifact =
            path.with_file_name(format!("{}.{}", item.meta.id, cloak_core::ENCRYPTED_EXTENSION));
        println!("Encrypted file:");
        println!("  id:    {}", item.meta.id);
        println!("  path:  {}", artifact.display());
        println!("  size:  {}", fmt_bytes(item.meta.size));
    }
    Ok(())
}

async fn cmd_decrypt(engine: &Engine, path: &Path) -> Result<()> {
    let meta = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("stat {}", path.display()))?;
    let progress = Some(progress_logger(path.display().to_string()));

    if meta.is_dir() {
        match engine.decrypt_folder(path, progress).await {
            FolderDecryption::Restored { item, path, skipped } => {
                println!("Restored folder:");
                println!("  name:    {}", item.meta.original_name);
                println!("  path:    {}", path.display());
                println!("  skipped: {skipped}");
            }
            FolderDecryption::Untouched { path, error } => {
                return Err(anyhow::Error::new(error)
                    .context(format!("decrypting folder {}", path.display())));
            }
        }
    } else {
        let restored = engine
            .decrypt_file(path, progress)
            .await
            .with_context(|| format!("decrypting {}", path.display()))?;
        println!("Restored file:");
        println!("  name:  {}", restored.item.meta.original_name);
        println!("  path:  {}", restored.path.display());
    }
    Ok(())
}

// ── `cloak hide` / `cloak reveal` ─────────────────────────────────────────────

async fn cmd_visibility(engine: &Engine, id: &str, hide: bool) -> Result<()> {
    let verb = if hide { "hide" } else { "reveal" };
    let changed = if hide {
        engine.hide_item(id).await
    } else {
        engine.reveal_item(id).await
    }
    .with_context(|| format!("{verb} {id}"))?;

    match (changed, hide) {
        (true, true) => println!("{id}: hidden"),
        (true, false) => println!("{id}: visible"),
        (false, true) => println!("{id}: already hidden"),
        (false, false) => println!("{id}: already visible"),
    }
    Ok(())
}

// ── `cloak list` ──────────────────────────────────────────────────────────────

async fn cmd_list(engine: &Engine, json: bool) -> Result<()> {
    let items = engine.list_items().await;
    if json {
        let rendered = serde_json::to_string_pretty(&items).context("serializing items")?;
        println!("{rendered}");
        return Ok(());
    }

    println!("Registered items: {}", items.len());
    for item in items.values() {
        println!("{}", list_line(item));
    }
    Ok(())
}

fn list_line(item: &Item) -> String {
    let meta = item.meta();
    let kind = if item.is_folder() { "dir " } else { "file" };
    let hidden = if meta.is_hidden { " (hidden)" } else { "" };
    format!(
        "  {}  {kind}  {:>10}  {}{hidden}",
        meta.id,
        fmt_bytes(meta.size),
        meta.path
    )
}

// ── `cloak config show` ───────────────────────────────────────────────────────

fn cmd_config_show(config: &CloakConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
