// src/main.rs

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use tpkg::archive::crypto::{FixedPassphrase, PassphraseSource, PromptPassphrase};
use tpkg::config::{Config, ConfigFile, DEFAULT_CONFIG_PATH};
use tpkg::db::models::{Changeset, PackageEvent};
use tpkg::install::{ExitStatus, OperationReport, Options, Orchestrator};
use tpkg::installed::{InstalledStore, verify_installed};
use tpkg::metadata::Metadata;
use tpkg::repository::{self, NoNative, Repository};
use tracing::info;

#[derive(Parser)]
#[command(name = "tpkg")]
#[command(author, version, about = "Host package manager for self-contained .tpkg archives", long_about = None)]
struct Cli {
    /// Configuration file (default: /etc/tpkg.conf when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Installation base for relocatable files
    #[arg(long, global = true)]
    base: Option<PathBuf>,

    /// Prefix for absolute package paths
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Package source: directory, .tpkg file or http(s) URL (repeatable)
    #[arg(short, long = "source", global = true)]
    sources: Vec<String>,

    /// Continue past failed pre-scripts, file conflicts and broken dependents
    #[arg(long, global = true)]
    force: bool,

    /// Remove installed packages that conflict with the requested ones
    #[arg(long, global = true)]
    force_replace: bool,

    /// Take the lock even if another process holds it
    #[arg(long, global = true)]
    force_unlock: bool,

    /// Passphrase for encrypted package files
    #[arg(long, global = true)]
    passphrase: Option<String>,

    /// Never ask for confirmation
    #[arg(long, global = true)]
    no_prompt: bool,

    /// Debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install packages and their dependencies
    Install {
        /// name, name=version, name=version=package_version or a .tpkg file
        #[arg(required = true)]
        packages: Vec<String>,
    },
    /// Upgrade packages (all installed packages if none are given)
    Upgrade {
        packages: Vec<String>,
        /// Allow versions older than the installed one
        #[arg(long)]
        downgrade: bool,
    },
    /// Remove packages (all installed packages if none are given)
    Remove {
        packages: Vec<String>,
    },
    /// List installed packages, or available ones
    Query {
        /// Only packages with these names
        names: Vec<String>,
        /// Query the configured sources instead of installed packages
        #[arg(short, long)]
        available: bool,
        /// Print metadata as JSON
        #[arg(long)]
        json: bool,
    },
    /// Verify the checksums of package archives
    Verify {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Compare installed files against their recorded checksums
    VerifyInstalled {
        /// Package names (all installed packages if none are given)
        names: Vec<String>,
    },
    /// List the contents of a package file
    Files {
        package: PathBuf,
    },
    /// Show which installed packages own a path
    Owner {
        path: PathBuf,
    },
    /// Build a package from a source directory
    Make {
        /// Directory holding tpkg.yml
        source: PathBuf,
        /// Output directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },
    /// Write metadata.yml for a directory of packages
    Index {
        dir: PathBuf,
    },
    /// Show operation history
    History {
        /// Number of operations to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
    /// Generate shell completion scripts
    Completions {
        /// Shell type
        shell: Shell,
    },
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut file = ConfigFile::default();
    match &cli.config {
        Some(path) => file = file.merge(ConfigFile::load(path)?),
        None => {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            if default.is_file() {
                file = file.merge(ConfigFile::load(default)?);
            }
        }
    }

    let flags = ConfigFile {
        base: cli.base.clone(),
        root: cli.root.clone(),
        sources: cli.sources.clone(),
        prompt: cli.no_prompt.then_some(false),
        ..Default::default()
    };

    let mut config = Config::resolve(file.merge(flags));
    config.debug = cli.debug;
    Ok(config)
}

fn passphrase_source(cli: &Cli) -> Box<dyn PassphraseSource> {
    match &cli.passphrase {
        Some(p) => Box::new(FixedPassphrase(p.clone())),
        None => Box::new(PromptPassphrase::default()),
    }
}

/// Ask a yes/no question on the terminal; anything but "y" is no
fn confirm(question: &str) -> bool {
    eprintln!("{}", question);
    eprint!("Continue anyway? [y/N] ");
    if io::stderr().flush().is_err() {
        return false;
    }
    let mut answer = String::new();
    match io::stdin().lock().read_line(&mut answer) {
        Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
        Err(_) => false,
    }
}

fn print_report(report: &OperationReport) {
    for name in &report.removed {
        println!("Removed {}", name);
    }
    for name in &report.installed {
        println!("Installed {}", name);
    }
    for (package, error) in &report.failures {
        eprintln!("Failed {}: {}", package, error);
    }
    if !report.warnings.is_empty() {
        eprintln!("\n{} warning(s):", report.warnings.len());
        for warning in &report.warnings {
            eprintln!("  {}", warning);
        }
    }
    if report.status.contains(ExitStatus::POSTINSTALL_FAILED) {
        eprintln!("A postinstall script failed");
    }
    if report.status.contains(ExitStatus::POSTREMOVE_FAILED) {
        eprintln!("A postremove script failed");
    }
    if report.status.contains(ExitStatus::INIT_SCRIPT_FAILED) {
        eprintln!("An init script could not be linked");
    }
}

fn print_metadata(packages: &[Metadata], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(packages)?);
        return Ok(());
    }

    if packages.is_empty() {
        println!("No packages found.");
        return Ok(());
    }
    for md in packages {
        print!("  {} {}", md.name, md.full_version());
        if !md.operatingsystem.is_empty() {
            print!(" [{}]", md.operatingsystem.join(","));
        }
        if !md.architecture.is_empty() {
            print!(" [{}]", md.architecture.join(","));
        }
        println!();
        if let Some(desc) = &md.description {
            println!("      {}", desc);
        }
    }
    println!("\nTotal: {} package(s)", packages.len());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(io::stderr)
        .init();

    let config = load_config(&cli)?;
    let options = Options {
        force: cli.force,
        force_replace: cli.force_replace,
        downgrade: false,
        force_unlock: cli.force_unlock,
    };
    let native = NoNative;

    let report = match &cli.command {
        Commands::Install { packages } => {
            info!("Installing {}", packages.join(" "));
            let repo = Repository::load(&config, &native)?;
            let mut orchestrator =
                Orchestrator::new(&config, repo, passphrase_source(&cli), options).with_confirm(confirm);
            orchestrator.install(packages)?
        }
        Commands::Upgrade { packages, downgrade } => {
            let repo = Repository::load(&config, &native)?;
            let options = Options {
                downgrade: *downgrade,
                ..options
            };
            let mut orchestrator =
                Orchestrator::new(&config, repo, passphrase_source(&cli), options).with_confirm(confirm);
            orchestrator.upgrade(packages)?
        }
        Commands::Remove { packages } => {
            let repo = Repository::load(&config, &native)?;
            let mut orchestrator = Orchestrator::new(&config, repo, passphrase_source(&cli), options);
            orchestrator.remove(packages)?
        }
        Commands::Query { names, available, json } => {
            let mut packages: Vec<Metadata> = if *available {
                Repository::load(&config, &native)?
                    .available()
                    .iter()
                    .map(|c| c.metadata.clone())
                    .collect()
            } else {
                InstalledStore::open(&config)
                    .list()?
                    .into_iter()
                    .map(|p| p.metadata)
                    .collect()
            };
            packages.retain(|md| names.is_empty() || names.contains(&md.name));
            packages.sort_by(|a, b| {
                a.name
                    .cmp(&b.name)
                    .then_with(|| tpkg::version::compare(&a.version, &b.version))
            });
            print_metadata(&packages, *json)?;
            return Ok(());
        }
        Commands::Verify { files } => {
            let mut bad = 0;
            for file in files {
                match tpkg::archive::verify(file) {
                    Ok(manifest) => println!("{}: OK ({})", file.display(), manifest.algorithm.name()),
                    Err(e) => {
                        println!("{}: FAILED ({})", file.display(), e);
                        bad += 1;
                    }
                }
            }
            if bad > 0 {
                std::process::exit(ExitStatus::FAILURE.into());
            }
            return Ok(());
        }
        Commands::VerifyInstalled { names } => {
            let store = InstalledStore::open(&config);
            let packages = if names.is_empty() {
                store.list()?
            } else {
                let mut packages = Vec::new();
                for name in names {
                    let found = store.find(name)?;
                    if found.is_empty() {
                        eprintln!("{} is not installed", name);
                    }
                    packages.extend(found);
                }
                packages
            };

            let mut dirty = 0;
            for pkg in &packages {
                let result = verify_installed(pkg, &config)?;
                if result.is_clean() {
                    println!("{}-{}: OK", pkg.name(), pkg.metadata.full_version());
                    continue;
                }
                dirty += 1;
                println!("{}-{}:", pkg.name(), pkg.metadata.full_version());
                for path in &result.missing {
                    println!("  missing  {}", path.display());
                }
                for path in &result.modified {
                    println!("  modified {}", path.display());
                }
                for path in &result.attributes {
                    println!("  mode/owner {}", path.display());
                }
            }
            if dirty > 0 || packages.len() < names.len() {
                std::process::exit(ExitStatus::FAILURE.into());
            }
            return Ok(());
        }
        Commands::Files { package } => {
            for path in tpkg::archive::list_files(package)? {
                println!("{}", path);
            }
            return Ok(());
        }
        Commands::Owner { path } => {
            let owners = InstalledStore::open(&config).owners(path, &config)?;
            if owners.is_empty() {
                println!("{} is not owned by any installed package", path.display());
                std::process::exit(ExitStatus::FAILURE.into());
            }
            for pkg in owners {
                println!("{}-{}", pkg.name(), pkg.metadata.full_version());
            }
            return Ok(());
        }
        Commands::Make { source, output } => {
            let path = tpkg::archive::build(source, output, cli.passphrase.as_deref())?;
            println!("Built {}", path.display());
            return Ok(());
        }
        Commands::Index { dir } => {
            let path = repository::write_index(dir)?;
            println!("Wrote {}", path.display());
            return Ok(());
        }
        Commands::History { limit } => {
            if !config.history_db().exists() {
                println!("No operation history.");
                return Ok(());
            }
            let conn = tpkg::db::open(&config.history_db())?;
            let changesets = Changeset::list_recent(&conn, *limit)?;
            if changesets.is_empty() {
                println!("No operation history.");
                return Ok(());
            }

            println!("Operation history:");
            for changeset in &changesets {
                let Some(id) = changeset.id else {
                    continue;
                };
                let timestamp = changeset
                    .finished_at
                    .as_deref()
                    .or(changeset.created_at.as_deref())
                    .unwrap_or("pending");
                println!(
                    "  [{}] {} {} {} ({}, exit {})",
                    id,
                    timestamp,
                    changeset.operation.as_str(),
                    changeset.description,
                    changeset.status.as_str(),
                    changeset.exit_status
                );
                for event in PackageEvent::find_by_changeset(&conn, id)? {
                    let outcome = if event.succeeded { "ok" } else { "failed" };
                    print!("      {} {}-{} {}", event.action.as_str(), event.name, event.version, outcome);
                    if let Some(msg) = &event.message {
                        print!(": {}", msg);
                    }
                    println!();
                }
            }
            return Ok(());
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "tpkg", &mut io::stdout());
            return Ok(());
        }
    };

    print_report(&report);
    std::process::exit(report.status.code());
}
