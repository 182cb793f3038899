//! packrun - pack installer and runner
//!
//! ## Usage
//!
//! ```sh
//! packrun install <url|file> [--tag <tag> --checksum <sha256>] [--ref <ref>]
//! packrun list
//! packrun remove <pack-id>
//! packrun run <pack-id> [--env KEY=VALUE]...
//! packrun validate <pack.json|workflow.json>
//! packrun checksum <file>
//! packrun history [pack-id]
//! ```
//!
//! A `--tag` makes the install a prod install, which requires `--checksum`.
//! Without it the install is a dev install from `--ref` (default `local`).
//!
//! Global `--config <path>` selects a TOML config; `RUST_LOG` controls
//! logging.

use anyhow::{Context, bail};
use packrun::instance::{JsonInstanceRepository, InstanceRepository};
use packrun::{
    EnvSecretResolver, FileKvStore, HistoryStore, HttpFetcher, InstallSource, InstanceManager,
    KeyValueStore, LogBuffer, PackInstaller, PackManifest, PackStore, RuntimeConfig, SecretResolver,
    WasmHost, WorkflowDefinition, WorkflowEngine, checksum,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Upper bound on how long `run` waits for an instance to finish.
const RUN_WAIT_TIMEOUT: Duration = Duration::from_secs(3600);

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
enum Command {
    Install {
        target: String,
        tag: Option<String>,
        checksum: Option<String>,
        source_ref: Option<String>,
    },
    List,
    Remove {
        id: String,
    },
    Run {
        id: String,
        env: Vec<(String, String)>,
    },
    Validate {
        path: PathBuf,
    },
    Checksum {
        path: PathBuf,
    },
    History {
        id: Option<String>,
    },
    Version,
    Help,
}

#[derive(Debug)]
struct Cli {
    config: Option<PathBuf>,
    command: Command,
}

fn take_value(args: &[String], i: usize, flag: &str) -> Result<String, String> {
    args.get(i + 1)
        .cloned()
        .ok_or_else(|| format!("{} requires a value", flag))
}

fn parse_args() -> Result<Cli, String> {
    let mut args: Vec<String> = std::env::args().collect();

    let mut config = None;
    if let Some(pos) = args.iter().position(|a| a == "--config" || a == "-c") {
        config = Some(PathBuf::from(take_value(&args, pos, "--config")?));
        args.drain(pos..pos + 2);
    }

    if args.len() < 2 {
        return Ok(Cli {
            config,
            command: Command::Help,
        });
    }

    let command = match args[1].as_str() {
        "install" => {
            if args.len() < 3 {
                return Err("install requires <url|file>".to_string());
            }
            let target = args[2].clone();
            let mut tag = None;
            let mut checksum = None;
            let mut source_ref = None;
            let mut i = 3;
            while i < args.len() {
                match args[i].as_str() {
                    "--tag" | "-t" => {
                        tag = Some(take_value(&args, i, "--tag")?);
                        i += 2;
                    }
                    "--checksum" | "-s" => {
                        checksum = Some(take_value(&args, i, "--checksum")?);
                        i += 2;
                    }
                    "--ref" | "-r" => {
                        source_ref = Some(take_value(&args, i, "--ref")?);
                        i += 2;
                    }
                    other => return Err(format!("unknown install option: {}", other)),
                }
            }
            Command::Install {
                target,
                tag,
                checksum,
                source_ref,
            }
        }
        "list" | "ls" => Command::List,
        "remove" | "rm" => {
            if args.len() < 3 {
                return Err("remove requires <pack-id>".to_string());
            }
            Command::Remove {
                id: args[2].clone(),
            }
        }
        "run" => {
            if args.len() < 3 {
                return Err("run requires <pack-id>".to_string());
            }
            let id = args[2].clone();
            let mut env = Vec::new();
            let mut i = 3;
            while i < args.len() {
                match args[i].as_str() {
                    "--env" | "-e" => {
                        let pair = take_value(&args, i, "--env")?;
                        let (k, v) = pair
                            .split_once('=')
                            .ok_or_else(|| format!("--env expects KEY=VALUE, got '{}'", pair))?;
                        env.push((k.to_string(), v.to_string()));
                        i += 2;
                    }
                    other => return Err(format!("unknown run option: {}", other)),
                }
            }
            Command::Run { id, env }
        }
        "validate" => {
            if args.len() < 3 {
                return Err("validate requires <path>".to_string());
            }
            Command::Validate {
                path: PathBuf::from(&args[2]),
            }
        }
        "checksum" => {
            if args.len() < 3 {
                return Err("checksum requires <file>".to_string());
            }
            Command::Checksum {
                path: PathBuf::from(&args[2]),
            }
        }
        "history" => Command::History {
            id: args.get(2).cloned(),
        },
        "version" | "--version" | "-v" => Command::Version,
        "help" | "--help" | "-h" => Command::Help,
        unknown => return Err(format!("unknown command: {}", unknown)),
    };

    Ok(Cli { config, command })
}

// =============================================================================
// Commands
// =============================================================================

fn open_store(config: &RuntimeConfig) -> anyhow::Result<Arc<PackStore>> {
    let store = PackStore::with_path(config.store_dir())
        .with_context(|| format!("opening pack store at {}", config.store_dir().display()))?;
    Ok(Arc::new(store))
}

fn installer(config: &RuntimeConfig) -> anyhow::Result<PackInstaller> {
    let fetcher = HttpFetcher::with_timeouts(config.download_timeout(), packrun::CONNECT_TIMEOUT)?;
    let mut installer = PackInstaller::new(open_store(config)?, Arc::new(fetcher))
        .with_max_archive_size(config.download.max_archive_size)
        .with_retry_policy(config.retry_policy());
    if let Some(token) = &config.bearer_token {
        installer = installer.with_bearer_token(token.clone());
    }
    Ok(installer)
}

async fn cmd_install(
    config: &RuntimeConfig,
    target: String,
    tag: Option<String>,
    checksum: Option<String>,
    source_ref: Option<String>,
) -> anyhow::Result<()> {
    let local = Path::new(&target);
    let url = if local.is_file() {
        format!("file://{}", local.display())
    } else {
        target.clone()
    };

    let source = match tag {
        Some(tag) => InstallSource::Prod {
            tag,
            url,
            checksum,
        },
        None => InstallSource::dev(source_ref.unwrap_or_else(|| "local".to_string()), url),
    };

    let installer = installer(config)?;
    let result = if local.is_file() {
        installer.install_from_file(local, source).await?
    } else {
        installer.install(source).await?
    };

    println!(
        "Installed {} {} ({}) at {}",
        result.pack.id,
        result.pack.version,
        result.pack.pack_type,
        result.pack.install_path.display()
    );
    println!("sha256: {}", result.checksum);
    Ok(())
}

fn cmd_list(config: &RuntimeConfig) -> anyhow::Result<()> {
    let store = open_store(config)?;
    println!("ID\tVERSION\tTYPE\tSOURCE\tINSTALLED");
    for pack in store.list()? {
        let source = if pack.source.is_prod() { "prod" } else { "dev" };
        println!(
            "{}\t{}\t{}\t{}\t{}",
            pack.id,
            pack.version,
            pack.pack_type,
            source,
            pack.installed_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn cmd_remove(config: &RuntimeConfig, id: String) -> anyhow::Result<()> {
    open_store(config)?.remove(&id).await?;
    eprintln!("Removed pack {}", id);
    Ok(())
}

async fn cmd_run(config: &RuntimeConfig, id: String, env: Vec<(String, String)>) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let pack = store.get(&id)?;

    let logs = LogBuffer::new(config.log_buffer_capacity);
    let host = Arc::new(WasmHost::new());
    if let Some(reason) = host.unavailable_reason() {
        bail!("WASM runtime unavailable: {}", reason);
    }
    let kv: Arc<dyn KeyValueStore> = Arc::new(FileKvStore::new(config.kv_dir())?);
    let engine = Arc::new(WorkflowEngine::new(kv, host, logs.clone())?);
    let history = Arc::new(HistoryStore::open(&config.history_path())?);
    let repository: Arc<dyn InstanceRepository> =
        Arc::new(JsonInstanceRepository::open(&config.instances_path())?);
    let manager = InstanceManager::new(repository, engine, history);
    manager.recover().await?;

    let resolver = EnvSecretResolver::with_prefix(config.secret_env_prefix.clone());
    let mut resolved: BTreeMap<String, String> = resolver.resolve(&pack.manifest.required_env);
    resolved.extend(env);

    let instance = manager.create_instance(&pack, "").await?;
    manager.start_instance(instance.id, &pack, resolved).await?;
    let finished = manager.wait(instance.id, RUN_WAIT_TIMEOUT).await?;

    for entry in logs.snapshot() {
        eprintln!("{}", entry);
    }

    if let Some(item) = manager.history().list(Some(&pack.id))?.first() {
        if !item.output.is_empty() {
            println!("{}", item.output);
        }
        eprintln!("{} in {} ms", item.status, item.duration_ms);
    }

    match finished.last_exit_code {
        Some(0) => Ok(()),
        code => bail!(
            "instance {} ended: {} (exit code {:?})",
            finished.id,
            finished.last_exit_reason.unwrap_or_default(),
            code
        ),
    }
}

fn cmd_validate(path: PathBuf) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("parsing {}", path.display()))?;

    if value.get("steps").is_some() {
        let workflow = WorkflowDefinition::from_json(&text)?;
        println!(
            "workflow '{}' is valid ({} steps)",
            workflow.name,
            workflow.steps.len()
        );
    } else {
        let manifest = PackManifest::from_json(&text)?;
        println!(
            "manifest for {} {} ({}) is valid",
            manifest.id, manifest.version, manifest.pack_type
        );
    }
    Ok(())
}

fn cmd_checksum(path: PathBuf) -> anyhow::Result<()> {
    let digest = checksum::digest_file(&path)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    println!("{}  {}", digest, name);
    Ok(())
}

fn cmd_history(config: &RuntimeConfig, id: Option<String>) -> anyhow::Result<()> {
    let history = HistoryStore::open(&config.history_path())?;
    println!("RUN\tPACK\tSTATUS\tSTARTED\tDURATION");
    for item in history.list(id.as_deref())? {
        println!(
            "{}\t{}\t{}\t{}\t{}ms",
            item.run_id,
            item.pack_id,
            item.status,
            item.started_at.format("%Y-%m-%d %H:%M:%S"),
            item.duration_ms
        );
    }
    Ok(())
}

fn cmd_version() {
    println!("packrun version {}", env!("CARGO_PKG_VERSION"));
    println!("manifest schema: {}", packrun::MANIFEST_SCHEMA_VERSION);
}

fn cmd_help() {
    println!(
        r#"packrun - install and run verified packs

USAGE:
    packrun [--config <path>] <command> [options]

COMMANDS:
    install <url|file>        Install a pack archive
    list                      List installed packs
    remove <pack-id>          Remove an installed pack
    run <pack-id>             Run a pack and wait for it
    validate <path>           Validate a pack.json or workflow document
    checksum <file>           Print the SHA-256 of a file
    history [pack-id]         Show execution history
    version                   Show version info
    help                      Show this help

OPTIONS:
    --config, -c <path>       TOML config (default: ~/.packrun/config.toml)
    --tag, -t <tag>           Prod install of a tagged release
    --checksum, -s <sha256>   Expected archive digest (required with --tag)
    --ref, -r <ref>           Source ref recorded for dev installs
    --env, -e KEY=VALUE       Environment for run (repeatable)

EXAMPLES:
    packrun install ./pack-demo-1.0.0.zip
    packrun install https://example.com/pack-demo-1.0.0.zip --tag v1.0.0 --checksum <sha256>
    packrun run demo --env API_TOKEN=secret
"#
    );
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = match parse_args() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("error: {}", e);
            cmd_help();
            return ExitCode::FAILURE;
        }
    };

    let config = match RuntimeConfig::load_or_default(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::Install {
            target,
            tag,
            checksum,
            source_ref,
        } => cmd_install(&config, target, tag, checksum, source_ref).await,
        Command::List => cmd_list(&config),
        Command::Remove { id } => cmd_remove(&config, id).await,
        Command::Run { id, env } => cmd_run(&config, id, env).await,
        Command::Validate { path } => cmd_validate(path),
        Command::Checksum { path } => cmd_checksum(path),
        Command::History { id } => cmd_history(&config, id),
        Command::Version => {
            cmd_version();
            Ok(())
        }
        Command::Help => {
            cmd_help();
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
