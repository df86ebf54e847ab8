use anyhow::Context;
use anyhow::Result;
use chrono::NaiveDate;
use clap::Parser;
use clap::Subcommand;
use owo_colors::OwoColorize;
use rota_resolver::EngineConfig;
use rota_resolver::ScheduleEngine;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Schedule lookups over a directory of BASE and OVERRIDE workbooks.
#[derive(Debug, Parser)]
#[command(name = "rota", version)]
pub struct Cli {
    /// Directory holding the schedule workbooks
    #[arg(
        long,
        value_name = "PATH",
        default_value = "downloaded_files",
        global = true
    )]
    pub dir: PathBuf,

    /// TOML file with engine settings
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// JSON file persisting promoted entities across runs
    #[arg(long, value_name = "FILE", global = true)]
    pub popular_store: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the schedule of one entity for an inclusive date range
    Resolve(ResolveArgs),

    /// Build the entity index and print what it found
    Index(IndexArgs),

    /// Build the index and print engine statistics
    Status,

    /// Keep the index and popular answers fresh until Ctrl-C
    Watch,
}

#[derive(Debug, Parser)]
pub struct ResolveArgs {
    /// Entity name, e.g. "Иванов И.И."
    #[arg(value_name = "ENTITY")]
    pub entity: String,

    /// First day (dd.mm.yyyy)
    #[arg(value_name = "FROM", value_parser = parse_day)]
    pub from: NaiveDate,

    /// Last day (dd.mm.yyyy)
    #[arg(value_name = "TO", value_parser = parse_day)]
    pub to: NaiveDate,
}

#[derive(Debug, Parser)]
pub struct IndexArgs {
    /// List the files that mention this entity
    #[arg(long, value_name = "NAME")]
    pub entity: Option<String>,
}

/// Accepts `dd.mm.yyyy` and `dd.mm.yy`.
pub fn parse_day(text: &str) -> Result<NaiveDate, String> {
    ["%d.%m.%y", "%d.%m.%Y"]
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(text.trim(), format).ok())
        .ok_or_else(|| format!("expected a date like 02.05.2025, got `{text}`"))
}

impl Cli {
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::load(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => EngineConfig::default(),
        };
        if let Some(path) = &self.popular_store {
            config.popularity.store_path = Some(path.clone());
        }
        Ok(config)
    }

    pub async fn run(self) -> Result<()> {
        let config = self.engine_config()?;
        let engine = ScheduleEngine::for_directory(config, &self.dir)
            .context("Failed to initialize the schedule engine")?;
        match self.command {
            Command::Resolve(args) => run_resolve(&engine, args).await,
            Command::Index(args) => run_index(&engine, &self.dir, args).await,
            Command::Status => run_status(&engine).await,
            Command::Watch => run_watch(&engine).await,
        }
    }
}

async fn run_resolve(engine: &ScheduleEngine, args: ResolveArgs) -> Result<()> {
    if let Err(err) = engine.build_index().await {
        info!("index unavailable, resolving without it: {err}");
    }
    let text = engine.answer(&args.entity, args.from, args.to).await;
    print!("{text}");
    Ok(())
}

async fn run_index(engine: &ScheduleEngine, dir: &Path, args: IndexArgs) -> Result<()> {
    let report = engine
        .build_index()
        .await
        .context("Failed to build the entity index")?;
    let snapshot = &report.snapshot;

    match args.entity {
        Some(entity) => {
            let files = snapshot.files_for_entity(&entity);
            if files.is_empty() {
                println!("No files mention {entity}.");
            }
            for file in files {
                let kind = if file.is_override() { "override" } else { "base" };
                println!("{} {}", file.name, format!("({kind})").dimmed());
            }
        }
        None => {
            println!("{} Indexed {}", "▶".bright_blue(), dir.display());
            println!("  Base files:     {}", snapshot.catalog.base_files().len());
            println!("  Override files: {}", snapshot.catalog.override_files().len());
            println!("  Entities:       {}", snapshot.entity_count());
            println!("  Changed files:  {}", report.diff.len());
        }
    }
    Ok(())
}

async fn run_status(engine: &ScheduleEngine) -> Result<()> {
    engine
        .build_index()
        .await
        .context("Failed to build the entity index")?;
    let stats = engine.stats();

    println!("{}", "Index".bold());
    println!("  Ready:          {}", stats.index_ready);
    println!("  Generation:     {}", stats.index_generation);
    println!("  Base files:     {}", stats.base_files);
    println!("  Override files: {}", stats.override_files);
    println!("  Entities:       {}", stats.entities);
    println!("{}", "Caches".bold());
    println!("  Results:        {}", stats.cached_results);
    println!(
        "  Documents:      {} (hits {}, loads {}, evictions {})",
        stats.documents.entries,
        stats.documents.hits,
        stats.documents.loads,
        stats.documents.evictions
    );
    println!("{}", "Popularity".bold());
    println!("  Promoted:       {}", stats.popular_entities);
    println!("  Tracked:        {}", stats.tracked_entities);
    println!("{}", "Workers".bold());
    println!(
        "  Pool:           {} workers, {} available",
        stats.pool.workers, stats.pool.available
    );
    Ok(())
}

async fn run_watch(engine: &ScheduleEngine) -> Result<()> {
    if let Err(err) = engine.build_index().await {
        info!("initial index build failed, the refresher will retry: {err}");
    }
    let warmed = engine.warm_documents().await.unwrap_or_default();
    info!(warmed, "documents preloaded");

    let background = engine.start_background();
    println!(
        "{} Watching for schedule changes, press Ctrl-C to stop",
        "▶".bright_blue()
    );
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    background.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_both_year_widths() {
        let expected = NaiveDate::from_ymd_opt(2025, 5, 2);
        assert_eq!(parse_day("02.05.2025").ok(), expected);
        assert_eq!(parse_day("02.05.25").ok(), expected);
        assert!(parse_day("2025-05-02").is_err());
    }

    #[test]
    fn popular_store_flag_overrides_config() {
        let cli = Cli::parse_from([
            "rota",
            "--popular-store",
            "/tmp/popular.json",
            "resolve",
            "Иванов И.И.",
            "01.05.2025",
            "03.05.2025",
        ]);
        let config = cli.engine_config().expect("config");
        assert_eq!(
            config.popularity.store_path,
            Some(PathBuf::from("/tmp/popular.json"))
        );
        assert_eq!(cli.dir, PathBuf::from("downloaded_files"));
    }
}
