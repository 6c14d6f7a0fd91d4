use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feed_rs::model::Entry;
use feed_rs::parser;
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, info, warn};

use crate::error::FetchError;
use crate::model::{Article, Friend};
use crate::sanitize::{sanitize, CONTENT_LIMIT};
use crate::time::format_local;

pub const USER_AGENT: &str = concat!(
    "friend-circle/",
    env!("CARGO_PKG_VERSION"),
    " (+feed aggregator)"
);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HEADER_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry budget for transport-level failures. Status errors are never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// Anything that can turn a friend into a list of articles.
#[async_trait]
pub trait ArticleSource: Send + Sync + 'static {
    async fn fetch_articles(
        &self,
        friend: &Friend,
        max_count: usize,
    ) -> Result<Vec<Article>, FetchError>;
}

pub struct FeedFetcher {
    client: Client,
    retry: RetryPolicy,
    header_timeout: Duration,
}

impl FeedFetcher {
    pub fn new() -> Result<Self, reqwest::Error> {
        // connect_timeout also bounds the TLS handshake
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            retry: RetryPolicy::default(),
            header_timeout: HEADER_TIMEOUT,
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Downloads the remote friend list (a JSON array of friends).
    pub async fn load_friends(&self, url: &str) -> Result<Vec<Friend>, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Transport {
                attempts: 1,
                cause: e.to_string(),
            })?;

        let body = Self::read_ok_body(response).await?;
        let friends: Vec<Friend> =
            serde_json::from_slice(&body).map_err(|e| FetchError::Parse(e.to_string()))?;

        info!("Loaded {} friends from {}", friends.len(), url);
        Ok(friends)
    }

    /// Fetches one friend's feed and converts up to `max_count` entries, in
    /// feed order, into articles.
    pub async fn fetch_articles(
        &self,
        friend: &Friend,
        max_count: usize,
    ) -> Result<Vec<Article>, FetchError> {
        let started = Instant::now();
        let response = self.send_with_retry(&friend.feed_url).await;
        debug!(
            friend = %friend.name,
            elapsed = ?started.elapsed(),
            "feed request finished"
        );

        let body = Self::read_ok_body(response?).await?;
        let parsed = parser::parse(&body[..]).map_err(|e| FetchError::Parse(e.to_string()))?;

        let now = Utc::now();
        Ok(parsed
            .entries
            .into_iter()
            .take(max_count)
            .map(|entry| article_from_entry(friend, entry, now))
            .collect())
    }

    async fn send_with_retry(&self, url: &str) -> Result<Response, FetchError> {
        let attempts = self.retry.attempts();
        let mut last_cause = String::new();

        for attempt in 1..=attempts {
            match self.send_once(url).await {
                Ok(response) => return Ok(response),
                Err(cause) => {
                    warn!(url, attempt, "feed request failed: {}", cause);
                    last_cause = cause;
                    if attempt < attempts {
                        tokio::time::sleep(self.retry.delay).await;
                    }
                }
            }
        }

        Err(FetchError::Transport {
            attempts,
            cause: last_cause,
        })
    }

    /// `send` resolves once the response headers arrive, so the outer timeout
    /// acts as a header timeout while the client timeout bounds the whole
    /// request.
    async fn send_once(&self, url: &str) -> Result<Response, String> {
        match tokio::time::timeout(self.header_timeout, self.client.get(url).send()).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "no response headers within {:?}",
                self.header_timeout
            )),
        }
    }

    async fn read_ok_body(response: Response) -> Result<Vec<u8>, FetchError> {
        let status = response.status();
        if status != StatusCode::OK {
            return Err(FetchError::Status(status.as_u16()));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::Parse(format!("failed to read body: {}", e)))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl ArticleSource for FeedFetcher {
    async fn fetch_articles(
        &self,
        friend: &Friend,
        max_count: usize,
    ) -> Result<Vec<Article>, FetchError> {
        FeedFetcher::fetch_articles(self, friend, max_count).await
    }
}

/// Normalizes one feed entry. `now` stands in for entries with no date at all.
pub fn article_from_entry(friend: &Friend, entry: Entry, now: DateTime<Utc>) -> Article {
    let published = entry.published.or(entry.updated).unwrap_or(now);

    let author = entry
        .authors
        .iter()
        .map(|person| person.name.trim())
        .find(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| friend.name.clone());

    let raw_content = entry
        .content
        .and_then(|content| content.body)
        .filter(|body| !body.is_empty())
        .or_else(|| {
            entry
                .summary
                .map(|summary| summary.content)
                .filter(|summary| !summary.is_empty())
        })
        .unwrap_or_default();

    Article {
        title: entry.title.map(|t| t.content).unwrap_or_default(),
        link: entry
            .links
            .into_iter()
            .next()
            .map(|l| l.href)
            .unwrap_or_default(),
        published: format_local(published),
        author,
        avatar: friend.avatar_url.clone(),
        content: sanitize(&raw_content, CONTENT_LIMIT),
        source_site_url: friend.site_url.clone(),
    }
}
