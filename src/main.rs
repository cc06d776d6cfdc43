//! CLI entry point for `mimestore`.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use mimestore::config::{Config, StoreConfig};
use mimestore::export::attachment::{self, PartSummary};
use mimestore::parser::multipart::{boundary_from_content_type, sniff_boundary};
use mimestore::Message;

/// Bytes scanned for the first delimiter line when no boundary is given.
const SNIFF_LEN: usize = 8 * 1024;

#[derive(Parser)]
#[command(
    name = "mimestore",
    version,
    about = "Inspect and extract the parts of a multipart body"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Bytes per part kept in memory before spilling to disk (-1 = never spill)
    #[arg(long, global = true, value_name = "BYTES", allow_hyphen_values = true)]
    threshold: Option<i64>,

    /// Directory for spill files
    #[arg(long, global = true, value_name = "DIR")]
    temp_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List the parts of a multipart file
    List {
        path: PathBuf,
        #[command(flatten)]
        boundary: BoundaryArgs,
        #[arg(long)]
        json: bool,
    },
    /// Write every part of a multipart file to a directory
    Extract {
        path: PathBuf,
        #[command(flatten)]
        boundary: BoundaryArgs,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(clap::Args)]
struct BoundaryArgs {
    /// Boundary token (without the leading dashes)
    #[arg(short, long, conflicts_with = "content_type")]
    boundary: Option<String>,

    /// Multipart Content-Type header value carrying the boundary
    #[arg(long, value_name = "VALUE")]
    content_type: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = mimestore::config::load_config();

    let log_level = match cli.verbose {
        0 => config.general.log_level.clone(),
        1 => "info".to_string(),
        2 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    setup_logging(&log_level, &config);

    if let Some(threshold) = cli.threshold {
        config.store.memory_threshold = threshold;
    }
    if let Some(dir) = cli.temp_dir {
        config.store.temp_dir = Some(dir);
    }

    match cli.command {
        Commands::List {
            path,
            boundary,
            json,
        } => cmd_list(&path, &boundary, json, config.store),
        Commands::Extract {
            path,
            boundary,
            output,
        } => cmd_extract(&path, &boundary, &output, config.store),
        Commands::Completions { shell } => cmd_completions(shell),
    }
}

/// Set up tracing with stderr output and optional file logging.
fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let log_dir = mimestore::config::cache_dir(config);
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(&log_dir, "mimestore.log");
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
        tracing::debug!(
            path = %mimestore::config::log_file_path(config).display(),
            "File logging enabled"
        );
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }
}

/// Work out the boundary: explicit flag, Content-Type value, or the first
/// delimiter line of the file.
fn resolve_boundary(path: &Path, args: &BoundaryArgs) -> anyhow::Result<String> {
    if let Some(b) = &args.boundary {
        return Ok(b.clone());
    }
    if let Some(ct) = &args.content_type {
        return Ok(boundary_from_content_type(ct)?);
    }

    let mut head = Vec::with_capacity(SNIFF_LEN);
    std::fs::File::open(path)?
        .take(SNIFF_LEN as u64)
        .read_to_end(&mut head)?;
    let boundary = sniff_boundary(&head).ok_or_else(|| {
        anyhow::anyhow!(
            "no boundary line in the first {} of {}; pass --boundary",
            humansize::format_size(SNIFF_LEN, humansize::BINARY),
            path.display()
        )
    })?;
    tracing::debug!(boundary = %boundary, "Sniffed boundary");
    Ok(boundary)
}

fn open_message(path: &Path, args: &BoundaryArgs, store: StoreConfig) -> anyhow::Result<Message> {
    if !path.exists() {
        anyhow::bail!("File not found: {}", path.display());
    }
    let boundary = resolve_boundary(path, args)?;
    Ok(Message::open(path, &boundary, store)?)
}

/// List the parts of a multipart file.
fn cmd_list(path: &Path, args: &BoundaryArgs, json: bool, store: StoreConfig) -> anyhow::Result<()> {
    let start = Instant::now();
    let message = open_message(path, args, store)?;
    let parts = attachment::summarize(&message)?;
    let elapsed = start.elapsed();

    if json {
        println!("{}", serde_json::to_string_pretty(&parts)?);
    } else {
        print_parts_table(path, &parts, elapsed);
    }
    message.close();
    Ok(())
}

/// Extract all parts of a multipart file.
fn cmd_extract(
    path: &Path,
    args: &BoundaryArgs,
    output: &Path,
    store: StoreConfig,
) -> anyhow::Result<()> {
    let message = open_message(path, args, store)?;

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} Extracting [{bar:40.cyan/blue}] {pos}/{len}")
            .expect("valid template")
            .progress_chars("#>-"),
    );

    let report = attachment::export_all(&message, output, &|current, total| {
        pb.set_length(total as u64);
        pb.set_position(current as u64);
    })?;

    pb.finish_and_clear();
    println!(
        "  Extracted {} part(s) to {}",
        report.paths.len(),
        output.display()
    );
    message.close();

    if !report.failed.is_empty() {
        let indices: Vec<String> = report.failed.iter().map(|i| i.to_string()).collect();
        println!("  Failed:    {} part(s) ({})", report.failed.len(), indices.join(", "));
        anyhow::bail!("{} part(s) could not be extracted", report.failed.len());
    }
    Ok(())
}

/// Print the part listing as a human-readable table.
fn print_parts_table(path: &Path, parts: &[PartSummary], elapsed: std::time::Duration) {
    use humansize::{format_size, BINARY};

    let total: u64 = parts.iter().map(|p| p.size).sum();
    println!();
    println!("  File:       {}", path.display());
    println!("  Parts:      {}", parts.len());
    println!("  Body bytes: {}", format_size(total, BINARY));
    println!("  Parse time: {:.2}s", elapsed.as_secs_f64());
    println!();

    if parts.is_empty() {
        return;
    }

    println!(
        "  {:>4}  {:<32}  {:<28}  {:>10}  {}",
        "#", "Content-ID", "Content-Type", "Size", "Filename"
    );
    println!("  {}", "-".repeat(96));
    for part in parts {
        let spilled = if part.spilled { " (disk)" } else { "" };
        println!(
            "  {:>4}  {:<32}  {:<28}  {:>10}  {}{}",
            part.index,
            truncate(&part.content_id, 32),
            truncate(&part.content_type, 28),
            format_size(part.size, BINARY),
            part.filename.as_deref().unwrap_or("-"),
            spilled
        );
    }
    println!();
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}

/// Generate shell completions and print to stdout.
fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "mimestore", &mut std::io::stdout());
    Ok(())
}
