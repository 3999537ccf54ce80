use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use shelf_cache::{
    BincodeCodec, CacheKey, CacheStore, CacheStoreConfig, ClearOptions, ClearReport, Codec,
    JsonCodec, LockPolicy,
};
use shelf_config::{CodecKind, ShelfConfig};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "shelf", version, about = "Inspect and manage a shelf file cache")]
struct Cli {
    #[command(subcommand)]
    command: Command,
    /// TOML config file (defaults are used when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Storage directory; overrides `cache.dir` and `SHELF_CACHE_DIR`
    #[arg(long, global = true)]
    dir: Option<PathBuf>,
    /// Key prefix; overrides `cache.key_prefix`
    #[arg(long, global = true)]
    prefix: Option<String>,
    /// Emit JSON suitable for scripts
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Print a fresh entry to stdout (exit 1 on miss)
    Get(GetArgs),
    /// Store VALUE (or stdin) under KEY
    Put(PutArgs),
    /// Exit 0 when KEY holds a fresh entry, 1 otherwise
    Exists(ExistsArgs),
    /// Print the file path KEY maps to
    Path(KeyArgs),
    /// Delete the entry for KEY
    Rm(KeyArgs),
    /// Delete entries whose file names match PATTERN
    Clear(ClearArgs),
}

#[derive(Args)]
struct KeyArgs {
    key: String,
    /// Use KEY as the file name without the configured prefix
    #[arg(long)]
    no_prefix: bool,
}

impl KeyArgs {
    fn cache_key(&self) -> CacheKey<'_> {
        if self.no_prefix {
            CacheKey::unprefixed(self.key.as_str())
        } else {
            CacheKey::prefixed(self.key.as_str())
        }
    }
}

#[derive(Args)]
struct GetArgs {
    #[command(flatten)]
    key: KeyArgs,
    /// Maximum entry age in seconds (defaults to `cache.default_lifetime_secs`)
    #[arg(long)]
    lifetime: Option<u64>,
    /// Decode the entry as a string with the configured codec
    #[arg(long)]
    text: bool,
}

#[derive(Args)]
struct PutArgs {
    #[command(flatten)]
    key: KeyArgs,
    /// Value to store; read from stdin when omitted
    value: Option<String>,
    /// Encode the value as a string with the configured codec
    #[arg(long)]
    text: bool,
}

#[derive(Args)]
struct ExistsArgs {
    #[command(flatten)]
    key: KeyArgs,
    #[arg(long)]
    lifetime: Option<u64>,
}

#[derive(Args)]
struct ClearArgs {
    /// Glob over entry file names (prefix-qualified unless --no-prefix)
    #[arg(default_value = "*")]
    pattern: String,
    #[arg(long)]
    no_prefix: bool,
    /// Also delete entries matching a protected pattern
    #[arg(long)]
    include_protected: bool,
    /// Only delete entries at least this many seconds old
    #[arg(long, value_name = "SECS")]
    min_age: Option<u64>,
    /// Additional protected pattern (repeatable)
    #[arg(long = "protect", value_name = "GLOB")]
    protect: Vec<String>,
}

fn main() {
    let cli = Cli::parse();
    let exit_code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            2
        }
    };

    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<i32> {
    let config = match &cli.config {
        Some(path) => ShelfConfig::load_from_path(path)?,
        None => ShelfConfig::default().with_env_overrides(),
    };
    shelf_config::init_tracing(&config.logging);

    match config.cache.codec {
        CodecKind::Bincode => execute(open_store(&cli, &config, BincodeCodec)?, &cli, &config),
        CodecKind::Json => execute(open_store(&cli, &config, JsonCodec)?, &cli, &config),
    }
}

fn open_store<C: Codec>(cli: &Cli, config: &ShelfConfig, codec: C) -> Result<CacheStore<C>> {
    let dir = match &cli.dir {
        Some(dir) => dir.clone(),
        None => config.cache.storage_dir()?,
    };
    let prefix = cli
        .prefix
        .clone()
        .unwrap_or_else(|| config.cache.key_prefix.clone());
    let lock = LockPolicy {
        timeout: config.cache.lock.timeout(),
        retry_interval: config.cache.lock.retry_interval(),
        require_lock: config.cache.lock.require_lock,
    };

    let store = CacheStore::with_codec(
        CacheStoreConfig::new(&dir)
            .key_prefix(prefix)
            .auto_create_dir(config.cache.auto_create_dir)
            .lock_policy(lock),
        codec,
    )
    .with_context(|| format!("failed to open cache at {}", dir.display()))?;

    store.set_enabled(config.cache.enabled);
    store.set_force_enabled(config.cache.force);
    tracing::debug!(
        target: "shelf.cli",
        root = %store.storage_root().display(),
        prefix = store.key_prefix(),
        active = store.is_active(),
        "opened cache store"
    );
    for pattern in &config.cache.protected_patterns {
        store.add_protected_pattern(pattern)?;
    }
    Ok(store)
}

fn execute<C: Codec>(store: CacheStore<C>, cli: &Cli, config: &ShelfConfig) -> Result<i32> {
    let lifetime_or_default = |secs: Option<u64>| {
        secs.map(Duration::from_secs)
            .unwrap_or_else(|| config.cache.default_lifetime())
    };

    match &cli.command {
        Command::Get(args) => {
            let key = args.key.cache_key();
            let lifetime = lifetime_or_default(args.lifetime);
            if args.text {
                let Some(value) = store.get::<String>(key, lifetime)? else {
                    return Ok(1);
                };
                if cli.json {
                    print_json(&value)?;
                } else {
                    println!("{value}");
                }
            } else {
                let Some(bytes) = store.get_raw(key, lifetime) else {
                    return Ok(1);
                };
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(&bytes)?;
                stdout.flush()?;
            }
            Ok(0)
        }
        Command::Put(args) => {
            let value = match &args.value {
                Some(value) => value.clone().into_bytes(),
                None => {
                    let mut buf = Vec::new();
                    std::io::stdin()
                        .read_to_end(&mut buf)
                        .context("failed to read value from stdin")?;
                    buf
                }
            };
            let key = args.key.cache_key();
            let stored = if args.text {
                let text = String::from_utf8(value).context("value is not valid UTF-8")?;
                store.store(key, text.as_str())?
            } else {
                store.store_raw(key, &value)?
            };

            if cli.json {
                print_json(&serde_json::json!({ "stored": stored }))?;
            } else if !stored {
                eprintln!("shelf: entry not stored (cache inactive or entry unwritable)");
            }
            Ok(if stored { 0 } else { 1 })
        }
        Command::Exists(args) => {
            let fresh = store.exists(args.key.cache_key(), lifetime_or_default(args.lifetime));
            if cli.json {
                print_json(&serde_json::json!({ "exists": fresh }))?;
            }
            Ok(if fresh { 0 } else { 1 })
        }
        Command::Path(args) => {
            let path = store.file_path(args.cache_key());
            if cli.json {
                print_json(&serde_json::json!({ "path": path }))?;
            } else {
                println!("{}", path.display());
            }
            Ok(0)
        }
        Command::Rm(args) => {
            let removed = store.remove(args.cache_key());
            if cli.json {
                print_json(&serde_json::json!({ "removed": removed }))?;
            }
            Ok(if removed { 0 } else { 1 })
        }
        Command::Clear(args) => {
            for pattern in &args.protect {
                store.add_protected_pattern(pattern)?;
            }
            let mut options = ClearOptions::default().pattern(args.pattern.as_str());
            if args.no_prefix {
                options = options.unprefixed();
            }
            if args.include_protected {
                options = options.include_protected();
            }
            if let Some(secs) = args.min_age {
                options = options.minimum_age(Duration::from_secs(secs));
            }

            let report = store.clear(&options)?;
            print_clear_report(&report, cli.json)?;
            Ok(if report.is_complete() { 0 } else { 1 })
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value)?;
    println!("{out}");
    Ok(())
}

fn print_clear_report(report: &ClearReport, json: bool) -> Result<()> {
    if json {
        return print_json(report);
    }

    println!(
        "clear: removed {} of {} entries",
        report.removed_count(),
        report.considered_count()
    );
    for path in &report.removed {
        println!("  removed {}", path.display());
    }
    for path in report.failed() {
        println!("  failed  {}", path.display());
    }
    Ok(())
}
