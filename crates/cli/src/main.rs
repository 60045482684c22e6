//! `mediacache`: look into and maintain a media cache directory.
//!
//! Opening a cache wipes its chunk directories, so don't point this at a
//! cache an application is downloading into right now.

mod error;

use crate::error::{ErrorKind, Result};
use clap::{Parser, Subcommand};
use exn::ResultExt;
use mediacache::{Cache, InnerCache, TrimReport};
use mediacache_config::Config;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mediacache", version, about = "Inspect and maintain a media cache directory")]
struct Cli {
    /// Configuration file (TOML, YAML or JSON). `MEDIACACHE_*` environment
    /// variables override it.
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// More logging; repeat for even more. `RUST_LOG` takes precedence.
    #[arg(long, short, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show size and budget of every category
    Stats,
    /// Evict old entries until each category is back under budget
    Trim {
        /// Only this category
        category: Option<String>,
    },
    /// Delete every entry
    Clear {
        /// Only this category
        category: Option<String>,
    },
    /// Print the path of a completely downloaded entry (exit code 1 if there
    /// is none)
    Lookup { category: String, url: String },
    /// Delete the entry for a URL
    Evict { category: String, url: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::from(2)
        },
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = Config::load(cli.config.as_deref()).or_raise(|| ErrorKind::Config)?;
    let cache = Cache::open(&config).await.or_raise(|| ErrorKind::Open)?;
    tracing::debug!(root = %config.root.display(), "Cache opened");

    match cli.command {
        Command::Stats => {
            print_stats(&cache);
        },
        Command::Trim { category } => {
            for inner in select(&cache, category.as_deref())? {
                let report = inner.manual_trim().await;
                print_trim(inner, &report);
            }
        },
        Command::Clear { category } => {
            for inner in select(&cache, category.as_deref())? {
                let before = inner.size();
                inner.clear_all().await;
                println!("{}: cleared {}", inner.name(), format_bytes(before));
            }
        },
        Command::Lookup { category, url } => {
            let inner = find(&cache, &category)?;
            match inner.get_or_null(&url).await {
                Some(path) => println!("{}", path.display()),
                None => return Ok(ExitCode::FAILURE),
            }
        },
        Command::Evict { category, url } => {
            let inner = find(&cache, &category)?;
            if !inner.delete_url(&url).await {
                eprintln!("{category}: failed to delete entry for {url}");
                return Ok(ExitCode::FAILURE);
            }
            println!("{category}: deleted entry for {url}");
        },
    }
    Ok(ExitCode::SUCCESS)
}

fn find<'a>(cache: &'a Cache, category: &str) -> Result<&'a InnerCache> {
    match cache.category(category) {
        Some(inner) => Ok(inner),
        None => exn::bail!(ErrorKind::UnknownCategory(category.to_string())),
    }
}

fn select<'a>(cache: &'a Cache, category: Option<&str>) -> Result<Vec<&'a InnerCache>> {
    match category {
        Some(category) => Ok(vec![find(cache, category)?]),
        None => Ok(cache.categories().collect()),
    }
}

fn print_stats(cache: &Cache) {
    println!("{:<16} {:>12} {:>12} {:>6}  DIRECTORY", "CATEGORY", "SIZE", "BUDGET", "USED");
    for stats in cache.stats() {
        println!(
            "{:<16} {:>12} {:>12} {:>5}%  {}",
            stats.name,
            format_bytes(stats.size),
            format_bytes(stats.max_size),
            percent(stats.size, stats.max_size),
            stats.dir.display(),
        );
    }
    println!(
        "{:<16} {:>12} {:>12} {:>5}%",
        "total",
        format_bytes(cache.total_size()),
        format_bytes(cache.total_max_size()),
        percent(cache.total_size(), cache.total_max_size()),
    );
}

fn print_trim(cache: &InnerCache, report: &TrimReport) {
    println!(
        "{}: evicted {} entries ({}), removed {} broken, skipped {} in use and {} too new; now {} of {}",
        cache.name(),
        report.evicted,
        format_bytes(report.freed),
        report.removed_corrupt,
        report.skipped_active,
        report.skipped_young,
        format_bytes(report.size_after),
        format_bytes(cache.max_size()),
    );
}

fn percent(part: u64, whole: u64) -> u64 {
    if whole == 0 {
        return 0;
    }
    (u128::from(part) * 100 / u128::from(whole)).try_into().unwrap_or(u64::MAX)
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    match unit {
        0 => format!("{bytes} B"),
        _ => format!("{value:.1} {}", UNITS[unit]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use rstest::rstest;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[rstest]
    #[case(&["mediacache", "stats"])]
    #[case(&["mediacache", "-vv", "trim"])]
    #[case(&["mediacache", "trim", "images", "--config", "cache.toml"])]
    #[case(&["mediacache", "lookup", "images", "https://example.com/a.png"])]
    fn test_parses(#[case] args: &[&str]) {
        Cli::try_parse_from(args).unwrap();
    }

    #[test]
    fn test_lookup_needs_url() {
        assert!(Cli::try_parse_from(["mediacache", "lookup", "images"]).is_err());
    }

    #[rstest]
    #[case(0, "0 B")]
    #[case(1023, "1023 B")]
    #[case(1024, "1.0 KiB")]
    #[case(512 * 1024 * 1024, "512.0 MiB")]
    fn test_format_bytes(#[case] bytes: u64, #[case] expected: &str) {
        assert_eq!(format_bytes(bytes), expected);
    }

    #[rstest]
    #[case(50, 100, 50)]
    #[case(150, 100, 150)]
    #[case(1, 0, 0)]
    fn test_percent(#[case] part: u64, #[case] whole: u64, #[case] expected: u64) {
        assert_eq!(percent(part, whole), expected);
    }
}
