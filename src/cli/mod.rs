//! Command-line interface for the two harvest stages.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

use crate::config::Settings;
use crate::extract::ContentExtractor;
use crate::pipeline;
use crate::scrapers::politeness::PolitenessConfig;
use crate::scrapers::{BrowserRenderer, HttpClient, PageRenderer, PolitenessGate};
use crate::sink::{ExtractionSink, LinkSink};

#[derive(Parser)]
#[command(name = "tias")]
#[command(about = "Harvest treaty documents from the State Department catalog")]
#[command(version)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to a TOML settings file
    #[arg(short, long, global = true, env = "TIAS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Enumerate catalog years and collect detail-page links (stage 1)
    Links {
        /// CSV feed with a year column
        #[arg(long, default_value = "tias_years.csv")]
        years: PathBuf,

        /// Limit the walk to the N most recent years
        #[arg(long)]
        max_years: Option<usize>,

        /// Link output CSV (appended to, deduplicated)
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Fetch each collected link and extract its content (stage 2)
    Extract {
        /// URL list: the stage-1 CSV or a plain newline-separated file
        #[arg(long, default_value = "all_extracted_links.csv")]
        input: PathBuf,

        /// Extraction output CSV (appended to, deduplicated)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Render pages in a browser when static fetches come back empty
        #[arg(long)]
        render: bool,
    },
}

/// Peek at argv before full parsing so logging can be set up first.
pub fn is_verbose() -> bool {
    std::env::args().any(|a| a == "-v" || a == "--verbose")
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;

    let exit_code = match cli.command {
        Command::Links {
            years,
            max_years,
            output,
        } => {
            if let Some(max_years) = max_years {
                settings.catalog.max_years = max_years;
            }

            let feed = crate::catalog::YearFeed::from_csv_path(&years)?;
            info!(
                "Year feed has {} years, walking {}",
                feed.len(),
                if settings.catalog.max_years == 0 {
                    "all".to_string()
                } else {
                    settings.catalog.max_years.to_string()
                }
            );

            let gate = PolitenessGate::new(PolitenessConfig::from_settings(&settings.fetch));
            let mut renderer = BrowserRenderer::new(
                settings.browser.clone(),
                settings.fetch.user_agents.clone(),
            );
            let links_path = output.unwrap_or_else(|| settings.output.links_csv.clone());
            let mut sink = LinkSink::open(&links_path)?;

            let stats =
                pipeline::discover_links(&feed, &settings, &mut renderer, &gate, &mut sink)
                    .await?;
            renderer.close().await;

            log_gate_stats(&gate).await;
            println!("{}", stats.summary());
            stats.exit_code()
        }
        Command::Extract {
            input,
            output,
            render,
        } => {
            let urls = pipeline::load_url_list(&input)?;
            info!("Loaded {} URLs from {}", urls.len(), input.display());

            let gate = PolitenessGate::new(PolitenessConfig::from_settings(&settings.fetch));
            let client = HttpClient::new(
                gate.clone(),
                settings.fetch.timeout(),
                settings.fetch.referer.clone(),
            );
            let extractor =
                ContentExtractor::new(client, settings.output.documents_dir.clone());
            let out_path = output.unwrap_or_else(|| settings.output.extractions_csv.clone());
            let mut sink = ExtractionSink::open(&out_path)?;

            let mut renderer = render.then(|| {
                BrowserRenderer::new(
                    settings.browser.clone(),
                    settings.fetch.user_agents.clone(),
                )
            });

            let stats = pipeline::extract_documents(
                &urls,
                &extractor,
                &mut sink,
                renderer.as_mut().map(|r| r as &mut dyn PageRenderer),
            )
            .await?;
            if let Some(mut renderer) = renderer {
                renderer.close().await;
            }

            log_gate_stats(&gate).await;
            println!("{}", stats.summary());
            stats.exit_code()
        }
    };

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

async fn log_gate_stats(gate: &PolitenessGate) {
    for (domain, stats) in gate.stats().await {
        info!(
            "{}: {} requests, {} blocked, current delay {:?}",
            domain, stats.total_requests, stats.blocked_hits, stats.current_delay
        );
    }
}
