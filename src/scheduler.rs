//! The load → crawl → persist pipeline and the loop that runs it on a timer.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::crawler::{CrawlPermit, Crawler};
use crate::error::PipelineError;
use crate::fetcher::FeedFetcher;
use crate::model::CrawlResult;
use crate::storage::write_result;

pub struct Pipeline {
    crawler: Crawler<FeedFetcher>,
    friends_url: String,
    output_file: PathBuf,
}

impl Pipeline {
    pub fn new(
        crawler: Crawler<FeedFetcher>,
        friends_url: impl Into<String>,
        output_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            crawler,
            friends_url: friends_url.into(),
            output_file: output_file.into(),
        }
    }

    pub fn output_file(&self) -> &Path {
        &self.output_file
    }

    /// Claims the process-wide crawl slot, or `None` if a run is in progress.
    pub fn try_begin(&self) -> Option<CrawlPermit> {
        self.crawler.try_begin()
    }

    pub fn is_running(&self) -> bool {
        self.crawler.is_crawling()
    }

    /// Runs once while holding `permit`. The previous artifact is only
    /// replaced when the whole run succeeds.
    pub async fn run(&self, permit: CrawlPermit) -> Result<CrawlResult, PipelineError> {
        let friends = self
            .crawler
            .source()
            .load_friends(&self.friends_url)
            .await
            .map_err(PipelineError::Friends)?;

        let result = self.crawler.crawl(&friends).await;
        write_result(&self.output_file, &result).await?;

        drop(permit);
        Ok(result)
    }
}

/// Outcome of one timer tick.
#[derive(Debug)]
pub enum Tick {
    Completed(CrawlResult),
    Skipped,
    Failed(PipelineError),
}

pub async fn run_scheduled(pipeline: &Pipeline) -> Tick {
    let Some(permit) = pipeline.try_begin() else {
        info!("Crawl already in progress, skipping scheduled run");
        return Tick::Skipped;
    };

    match pipeline.run(permit).await {
        Ok(result) => {
            info!(
                "Scheduled crawl finished: {} articles written to {}",
                result.meta.article_count,
                pipeline.output_file().display()
            );
            Tick::Completed(result)
        }
        Err(e) => Tick::Failed(e),
    }
}

/// Runs the pipeline immediately and then every `interval_minutes`.
///
/// A persistence failure on this path ends the process: it points at a broken
/// environment that retrying on a timer will not fix.
pub async fn start_background_refresh(pipeline: Arc<Pipeline>, interval_minutes: u64) {
    let interval = refresh_period(interval_minutes);

    info!("Starting initial crawl");
    loop {
        match run_scheduled(&pipeline).await {
            Tick::Failed(PipelineError::Persist(e)) => {
                error!("Failed to write crawl result: {}", e);
                std::process::exit(1);
            }
            Tick::Failed(e) => error!("Scheduled crawl failed: {}", e),
            Tick::Completed(_) | Tick::Skipped => {}
        }

        tokio::time::sleep(interval).await;
        info!("Starting scheduled crawl");
    }
}

fn refresh_period(interval_minutes: u64) -> Duration {
    Duration::from_secs(interval_minutes.saturating_mul(60))
}
