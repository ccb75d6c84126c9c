use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod app;
mod bookmarks;
mod cli;
mod config;
mod lock;
mod profile;
mod semantic;
mod snapshot;
mod storage;
#[cfg(test)]
mod tests;
mod web;

use cli::Command;
use config::Config;
use semantic::{RefreshReport, SearchError, SearchHit};

fn print_progress(done: usize, total: usize) {
    eprint!("\rembedding titles: {done}/{total}");
    if done == total {
        eprintln!();
    }
}

fn print_report(report: &RefreshReport) {
    println!(
        "{} bookmarks: {} added, {} updated, {} relinked, {} removed, {} unchanged",
        report.total,
        report.added,
        report.updated,
        report.relinked,
        report.removed,
        report.unchanged
    );
}

fn print_hits(hits: &[SearchHit]) {
    if hits.is_empty() {
        println!("no results");
        return;
    }

    for (rank, hit) in hits.iter().enumerate() {
        let title = if hit.title.is_empty() { "(untitled)" } else { &hit.title };
        println!("{:>2}. {title}  [{:.3}]", rank + 1, hit.score);
        println!("    {}", hit.url);
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();

    let paths = app::AppPaths::from_env()?;
    let mut config = Config::load_with(&paths.base)
        .with_context(|| format!("failed to load config from {}", paths.base.display()))?;

    if let Some(places) = args.places {
        config.profile_path = Some(places);
    }

    let mut pipeline = app::build_pipeline(&config, &paths.base)?;

    match args.command {
        Command::Index { rebuild } => {
            let report = if rebuild {
                pipeline.rebuild(&mut print_progress)?
            } else {
                pipeline.ensure_index_fresh_with(&mut print_progress)?
            };
            print_report(&report);
        }

        Command::Search { query, k, json } => {
            // a stale index is still searchable when the browser profile is unavailable
            if let Err(err) = pipeline.ensure_index_fresh_with(&mut print_progress) {
                log::warn!("could not refresh index, searching the saved one: {err}");
            }

            let k = k.unwrap_or(config.top_k);
            let hits = match pipeline.search(&query, k) {
                Ok(hits) => hits,
                Err(SearchError::EmptyIndex) => {
                    bail!("no bookmarks indexed yet, run `marksearch index` first")
                }
                Err(err) => return Err(err.into()),
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
            } else {
                print_hits(&hits);
            }
        }

        Command::Status {} => {
            pipeline.load_index()?;
            println!("{}", serde_json::to_string_pretty(&pipeline.status())?);
        }

        Command::Serve { addr } => {
            let addr = addr.unwrap_or_else(|| config.listen_addr.clone());
            web::start_daemon(pipeline, config.top_k, &addr)?;
        }

        Command::Profile {} => {
            println!("{}", pipeline.locate_profile()?.display());
        }
    }

    Ok(())
}
