//! Kiln CLI.

use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::Section;
use color_eyre::eyre::{Report, Result, WrapErr, bail, eyre};
use kiln_common::{KilnError, KilnPaths};

use crate::build::{BuildOutcome, BuildRequest, Builder};
use crate::cache::{self, LayerCache};
use crate::cancel::CancelToken;
use crate::config::{KilnConfig, LogFormat};
use crate::descriptor::{BuildArgs, Descriptor};
use crate::events::BuildEvent;
use crate::graph::StageGraph;

/// Kiln - multi-stage container image builder
#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Log output format (overrides the config file)
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Config file (defaults to ./kiln.toml when present)
    #[arg(long, global = true, env = "KILN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Kiln commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build an image from a descriptor
    Build {
        /// Path to the build descriptor
        descriptor: PathBuf,

        /// Build context directory (defaults to the descriptor's directory)
        #[arg(short, long)]
        context: Option<PathBuf>,

        /// Target stage to build (defaults to the last stage)
        #[arg(long)]
        target: Option<String>,

        /// Build arguments (KEY=VALUE)
        #[arg(long = "build-arg", value_name = "KEY=VALUE")]
        build_args: Vec<String>,

        /// Don't use cached layers
        #[arg(long)]
        no_cache: bool,

        /// Write the manifest here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show stages in build order
    Graph {
        /// Path to the build descriptor
        descriptor: PathBuf,

        /// Build arguments (KEY=VALUE)
        #[arg(long = "build-arg", value_name = "KEY=VALUE")]
        build_args: Vec<String>,
    },

    /// Manage the layer cache
    Cache {
        /// Cache subcommands.
        #[command(subcommand)]
        command: CacheCommands,
    },
}

/// Layer cache subcommands.
#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// List cached layers
    List {
        /// Show detailed information
        #[arg(short, long)]
        verbose: bool,
    },
    /// Remove old entries or shrink the cache to a size budget
    Prune {
        /// Remove entries not used for N days
        #[arg(long, value_name = "DAYS", required_unless_present = "max_bytes")]
        older_than: Option<u32>,
        /// Keep the most recently used layers within N bytes
        #[arg(long, value_name = "BYTES", conflicts_with = "older_than")]
        max_bytes: Option<u64>,
    },
    /// Remove every cached layer
    Clear {
        /// Don't ask for confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Show cache statistics
    Stats,
}

impl Cli {
    /// Load the config file selected by `--config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or invalid.
    pub fn load_config(&self) -> Result<KilnConfig> {
        Ok(KilnConfig::load(self.config.as_deref())?)
    }

    /// Effective log format.
    #[must_use]
    pub fn log_format(&self, config: &KilnConfig) -> LogFormat {
        self.log_format.unwrap_or(config.log.format)
    }

    /// Effective level for kiln's own targets.
    #[must_use]
    pub fn log_level<'a>(&self, config: &'a KilnConfig) -> &'a str {
        if self.debug { "debug" } else { &config.log.level }
    }

    /// Execute the CLI command.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn execute(self, config: KilnConfig) -> Result<()> {
        let paths = KilnPaths::new();

        match self.command {
            Commands::Build {
                descriptor,
                context,
                target,
                build_args,
                no_cache,
                output,
            } => {
                tracing::info!(
                    descriptor = %descriptor.display(),
                    target = ?target,
                    no_cache,
                    "Building image"
                );

                let mut request = BuildRequest::from_file(&descriptor).with_no_cache(no_cache);
                if let Some(context) = context {
                    request = request.with_context(context);
                }
                if let Some(target) = target {
                    request = request.with_target(target);
                }
                for (name, value) in parse_build_args(&build_args)? {
                    request = request.with_build_arg(name, value);
                }

                let cache = open_cache(&config, &paths)?;
                let builder = Builder::new(cache)
                    .with_max_parallel(config.parallelism())
                    .with_retry(config.retry_policy())
                    .with_work_dir(config.work_dir(&paths));

                let outcome = run_build(&builder, request).await?;
                print_summary(&outcome);

                let json = outcome.manifest.to_canonical_json()?;
                match output {
                    Some(path) => {
                        std::fs::write(&path, &json)
                            .wrap_err_with(|| format!("writing {}", path.display()))?;
                        eprintln!("  Manifest: {}", path.display());
                    }
                    None => {
                        let mut stdout = std::io::stdout().lock();
                        stdout.write_all(&json)?;
                        writeln!(stdout)?;
                    }
                }
                Ok(())
            }

            Commands::Graph {
                descriptor,
                build_args,
            } => {
                let args = parse_build_args(&build_args)?;
                let graph = Descriptor::from_file(&descriptor, &args)
                    .and_then(StageGraph::build)
                    .map_err(report)?;
                print!("{}", graph.render());
                Ok(())
            }

            Commands::Cache { command } => {
                let cache_dir = config.cache_dir(&paths);
                let cache = LayerCache::open(&cache_dir)?;

                match command {
                    CacheCommands::List { verbose } => {
                        let mut entries = cache.entries();
                        if entries.is_empty() {
                            println!("No cached layers");
                            return Ok(());
                        }
                        entries.sort_by(|a, b| b.1.last_access.cmp(&a.1.last_access));

                        println!("Cached layers ({}):", entries.len());
                        println!();

                        for (key, entry) in &entries {
                            if verbose {
                                println!("Key:      {key}");
                                println!("Layer:    {}", entry.layer.digest);
                                println!("Size:     {}", format_size(entry.layer.size));
                                println!("Created:  {}", format_timestamp(entry.created));
                                println!("Accessed: {}", format_timestamp(entry.last_access));
                                println!("Command:  {}", entry.layer.created_by);
                                println!();
                            } else {
                                println!(
                                    "  {} ({}) - {} - {}",
                                    key.digest().short(),
                                    format_size(entry.layer.size),
                                    format_timestamp(entry.last_access),
                                    truncate(&entry.layer.created_by, 60)
                                );
                            }
                        }

                        let stats = cache.stats();
                        println!();
                        println!(
                            "Total: {} entries, {} total",
                            stats.entries,
                            format_size(stats.total_bytes)
                        );
                        Ok(())
                    }

                    CacheCommands::Prune {
                        older_than,
                        max_bytes,
                    } => {
                        let report = if let Some(days) = older_than {
                            println!("Pruning cache entries unused for {days} days...");
                            cache.evict(cache::older_than(chrono::Duration::days(i64::from(
                                days,
                            ))))?
                        } else if let Some(budget) = max_bytes {
                            println!("Shrinking cache to {}...", format_size(budget));
                            cache.evict(cache::lru_budget(&cache, budget))?
                        } else {
                            bail!("either --older-than or --max-bytes is required");
                        };
                        println!(
                            "Removed {} entries, freed {} of disk space",
                            report.entries,
                            format_size(report.bytes)
                        );
                        Ok(())
                    }

                    CacheCommands::Clear { yes } => {
                        if !yes && !confirm("This will delete all cached layers.")? {
                            println!("Aborted");
                            return Ok(());
                        }
                        let report = cache.evict(|_, _| true)?;
                        println!("Cleared cache, freed {} of disk space", format_size(report.bytes));
                        Ok(())
                    }

                    CacheCommands::Stats => {
                        let stats = cache.stats();
                        println!("Layer Cache Statistics");
                        println!("======================");
                        println!("Location: {}", cache_dir.display());
                        println!("Entries:  {}", stats.entries);
                        println!("Size:     {}", format_size(stats.total_bytes));
                        Ok(())
                    }
                }
            }
        }
    }
}

fn open_cache(config: &KilnConfig, paths: &KilnPaths) -> Result<LayerCache> {
    let dir = config.cache_dir(paths);
    LayerCache::open(&dir).wrap_err_with(|| format!("opening layer cache at {}", dir.display()))
}

/// Run a build with Ctrl-C wired to cancellation and progress on stderr.
async fn run_build(builder: &Builder, request: BuildRequest) -> Result<BuildOutcome> {
    let cancel = CancelToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Interrupted, cancelling build...");
                cancel.cancel();
            }
        })
    };

    let mut events = builder.events().subscribe();
    let progress = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                BuildEvent::StageStarted { stage } => eprintln!("[{stage}] started"),
                BuildEvent::LayerReady {
                    stage,
                    digest,
                    cached: true,
                } => eprintln!("[{stage}] cached {digest}"),
                BuildEvent::StageCompleted { stage, layers } => {
                    eprintln!("[{stage}] done ({layers} layers)");
                }
                BuildEvent::StageFailed { stage, error } => eprintln!("[{stage}] failed: {error}"),
                BuildEvent::StageSkipped { stage, dependency } => {
                    eprintln!("[{stage}] skipped, {dependency} failed");
                }
                BuildEvent::PhaseChanged { phase, .. } if phase.is_terminal() => break,
                _ => {}
            }
        }
    });

    let result = builder.build(request, &cancel).await;
    interrupt.abort();
    // Every build ends with a terminal phase event, which stops the printer.
    if let Err(e) = progress.await {
        tracing::debug!(error = %e, "Progress printer stopped");
    }

    match result {
        Ok(outcome) => Ok(outcome),
        Err(KilnError::BuildFailed { failures }) => {
            eprintln!();
            eprintln!("Build failed:");
            for failure in &failures {
                eprintln!("  - {failure}");
            }
            Err(eyre!("{} stage(s) did not complete", failures.len()))
        }
        Err(e) => Err(report(e)),
    }
}

/// Carry the error's diagnostic help over to the eyre report.
fn report(err: KilnError) -> Report {
    let help = miette::Diagnostic::help(&err).map(|help| help.to_string());
    let report = Report::new(err);
    match help {
        Some(help) => report.suggestion(help),
        None => report,
    }
}

fn print_summary(outcome: &BuildOutcome) {
    let stats = &outcome.stats;
    eprintln!();
    eprintln!("Build complete!");
    eprintln!("  Build:  {}", outcome.build_id);
    eprintln!("  Digest: {}", outcome.digest);
    eprintln!("  Stages: {}", stats.stages);
    eprintln!(
        "  Layers: {} ({} cached, {} built)",
        stats.layers, stats.cache_hits, stats.cache_misses
    );
    eprintln!("  Size:   {}", format_size(outcome.manifest.total_size()));
    eprintln!("  Time:   {:.2}s", stats.duration.as_secs_f64());
}

/// Parse `KEY=VALUE` pairs.
fn parse_build_args(raw: &[String]) -> Result<BuildArgs> {
    raw.iter()
        .map(|arg| match arg.split_once('=') {
            Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
            _ => Err(eyre!("invalid build-arg '{arg}', expected KEY=VALUE")),
        })
        .collect()
}

fn confirm(prompt: &str) -> Result<bool> {
    println!("{prompt}");
    print!("Continue? [y/N] ");
    std::io::stdout().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let head: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{head}...")
}

fn format_timestamp(ts: chrono::DateTime<chrono::Utc>) -> String {
    let secs = (chrono::Utc::now() - ts).num_seconds();
    if secs < 0 {
        "unknown".to_string()
    } else if secs < 60 {
        format!("{secs}s ago")
    } else if secs < 3600 {
        format!("{}m ago", secs / 60)
    } else if secs < 86400 {
        format!("{}h ago", secs / 3600)
    } else {
        format!("{}d ago", secs / 86400)
    }
}

#[allow(clippy::cast_precision_loss)]
fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn build_flags() {
        let cli = Cli::try_parse_from([
            "kiln",
            "--debug",
            "build",
            "Dockerfile",
            "--no-cache",
            "--target",
            "builder",
            "--build-arg",
            "VERSION=1.2",
        ])
        .unwrap();
        assert!(cli.debug);
        let Commands::Build {
            descriptor,
            target,
            no_cache,
            build_args,
            ..
        } = cli.command
        else {
            panic!("expected build");
        };
        assert_eq!(descriptor, PathBuf::from("Dockerfile"));
        assert_eq!(target.as_deref(), Some("builder"));
        assert!(no_cache);
        assert_eq!(build_args, vec!["VERSION=1.2"]);
    }

    #[test]
    fn prune_requires_a_limit() {
        assert!(Cli::try_parse_from(["kiln", "cache", "prune"]).is_err());
        assert!(Cli::try_parse_from(["kiln", "cache", "prune", "--older-than", "7"]).is_ok());
        assert!(Cli::try_parse_from(["kiln", "cache", "prune", "--max-bytes", "1024"]).is_ok());
        assert!(
            Cli::try_parse_from([
                "kiln",
                "cache",
                "prune",
                "--older-than",
                "7",
                "--max-bytes",
                "1"
            ])
            .is_err()
        );
    }

    #[test]
    fn log_format_flag_overrides_config() {
        let cli = Cli::try_parse_from(["kiln", "--log-format", "json", "cache", "stats"]).unwrap();
        assert_eq!(cli.log_format(&KilnConfig::default()), LogFormat::Json);
        assert_eq!(cli.log_level(&KilnConfig::default()), "info");

        let cli = Cli::try_parse_from(["kiln", "--debug", "cache", "stats"]).unwrap();
        assert_eq!(cli.log_format(&KilnConfig::default()), LogFormat::Pretty);
        assert_eq!(cli.log_level(&KilnConfig::default()), "debug");
    }

    #[test]
    fn build_args_parse() {
        let args = parse_build_args(&["A=1".into(), "B=x=y".into(), "C=".into()]).unwrap();
        assert_eq!(args["A"], "1");
        assert_eq!(args["B"], "x=y");
        assert_eq!(args["C"], "");
        assert!(parse_build_args(&["NOVALUE".into()]).is_err());
        assert!(parse_build_args(&["=1".into()]).is_err());
    }

    #[test]
    fn size_formatting() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.00 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.00 MB");
    }

    #[test]
    fn timestamp_formatting() {
        let now = chrono::Utc::now();
        assert_eq!(format_timestamp(now - chrono::Duration::hours(2)), "2h ago");
        assert_eq!(format_timestamp(now - chrono::Duration::days(3)), "3d ago");
    }

    #[test]
    fn truncation() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("RUN mvn package -DskipTests", 10), "RUN mvn...");
    }
}
