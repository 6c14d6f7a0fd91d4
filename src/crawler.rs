//! Fans feed fetches out across the friend list and folds the outcomes into
//! a single [`CrawlResult`].
//!
//! At most `max_concurrency` fetches run at once: a semaphore permit is taken
//! before a task is spawned and released when the task ends. Every outcome is
//! merged under one mutex and the result is only read after all tasks have
//! been joined.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::fetcher::{ArticleSource, FeedFetcher};
use crate::model::{Article, CrawlMeta, CrawlResult, Friend};
use crate::time::{now_local, parse_local};

pub const MAX_CONCURRENT_FETCHES: usize = 10;
pub const MAX_ARTICLES_PER_FRIEND: usize = 10;

/// Process-wide "a crawl is running" flag with try-acquire semantics.
#[derive(Debug, Clone, Default)]
pub struct CrawlGuard {
    running: Arc<AtomicBool>,
}

impl CrawlGuard {
    /// Returns `None` immediately if a run is already in progress.
    pub fn try_acquire(&self) -> Option<CrawlPermit> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CrawlPermit {
                running: self.running.clone(),
            })
    }

    pub fn is_held(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Held for the duration of a run; dropping it clears the flag.
#[derive(Debug)]
pub struct CrawlPermit {
    running: Arc<AtomicBool>,
}

impl Drop for CrawlPermit {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

#[derive(Default)]
struct Tally {
    success: usize,
    fail: usize,
    /// (friend index, articles) so the merge can be put back in input order.
    batches: Vec<(usize, Vec<Article>)>,
}

pub struct Crawler<S = FeedFetcher> {
    source: Arc<S>,
    guard: CrawlGuard,
    max_concurrency: usize,
    per_friend: usize,
}

impl<S: ArticleSource> Crawler<S> {
    pub fn new(source: Arc<S>) -> Self {
        Self {
            source,
            guard: CrawlGuard::default(),
            max_concurrency: MAX_CONCURRENT_FETCHES,
            per_friend: MAX_ARTICLES_PER_FRIEND,
        }
    }

    pub fn with_limits(mut self, max_concurrency: usize, per_friend: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self.per_friend = per_friend;
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn try_begin(&self) -> Option<CrawlPermit> {
        self.guard.try_acquire()
    }

    pub fn is_crawling(&self) -> bool {
        self.guard.is_held()
    }

    /// Fetches every friend and returns once all of them have finished.
    /// Individual failures are counted, never propagated.
    pub async fn crawl(&self, friends: &[Friend]) -> CrawlResult {
        info!("Crawling {} friends", friends.len());

        let gate = Arc::new(Semaphore::new(self.max_concurrency));
        let tally = Arc::new(Mutex::new(Tally::default()));
        let mut tasks = JoinSet::new();

        for (index, friend) in friends.iter().cloned().enumerate() {
            let permit = match gate.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!("Admission gate closed before '{}': {}", friend.name, e);
                    lock(&tally).fail += 1;
                    continue;
                }
            };

            let source = self.source.clone();
            let tally = tally.clone();
            let per_friend = self.per_friend;

            tasks.spawn(async move {
                let outcome = source.fetch_articles(&friend, per_friend).await;
                drop(permit);

                let mut tally = lock(&tally);
                match outcome {
                    Ok(articles) => {
                        info!("Fetched '{}': {} articles", friend.name, articles.len());
                        tally.success += 1;
                        tally.batches.push((index, articles));
                    }
                    Err(e) => {
                        warn!("Failed to fetch '{}': {}", friend.name, e);
                        tally.fail += 1;
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Fetch task aborted: {}", e);
                lock(&tally).fail += 1;
            }
        }

        let (success, fail, mut batches) = {
            let mut tally = lock(&tally);
            (
                tally.success,
                tally.fail,
                std::mem::take(&mut tally.batches),
            )
        };

        batches.sort_by_key(|(index, _)| *index);
        let mut items: Vec<Article> = batches
            .into_iter()
            .flat_map(|(_, articles)| articles)
            .collect();
        sort_articles(&mut items);

        info!(
            "Crawl complete: {} succeeded, {} failed, {} articles",
            success,
            fail,
            items.len()
        );

        CrawlResult {
            meta: CrawlMeta {
                fetch_time: now_local(),
                friend_count: friends.len(),
                success_count: success,
                fail_count: fail,
                article_count: items.len(),
            },
            items,
        }
    }
}

fn lock(tally: &Mutex<Tally>) -> std::sync::MutexGuard<'_, Tally> {
    tally.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Stable sort, newest first. Timestamps that fail to parse sort after every
/// parsable one and keep their relative order.
pub fn sort_articles(articles: &mut Vec<Article>) {
    let mut keyed: Vec<_> = articles
        .drain(..)
        .map(|article| (parse_local(&article.published), article))
        .collect();

    keyed.sort_by(|(a, _), (b, _)| match (a, b) {
        (Some(a), Some(b)) => b.cmp(a),
        (Some(_), None) => CmpOrdering::Less,
        (None, Some(_)) => CmpOrdering::Greater,
        (None, None) => CmpOrdering::Equal,
    });

    articles.extend(keyed.into_iter().map(|(_, article)| article));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn create_test_friend(name: &str) -> Friend {
        Friend {
            name: name.to_string(),
            site_url: format!("https://{}.example", name),
            avatar_url: format!("https://{}.example/avatar.png", name),
            feed_url: format!("https://{}.example/rss.xml", name),
        }
    }

    fn create_test_article(title: &str, published: &str) -> Article {
        Article {
            title: title.to_string(),
            link: format!("https://example.com/{}", title),
            published: published.to_string(),
            author: "someone".to_string(),
            avatar: String::new(),
            content: String::new(),
            source_site_url: String::new(),
        }
    }

    fn titles(articles: &[Article]) -> Vec<&str> {
        articles.iter().map(|a| a.title.as_str()).collect()
    }

    /// Serves canned outcomes per friend name and records peak concurrency.
    #[derive(Default)]
    struct MockSource {
        outcomes: HashMap<String, Vec<Article>>,
        panics_for: Option<String>,
        delay: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    impl MockSource {
        fn with_feed(mut self, friend: &str, articles: Vec<Article>) -> Self {
            self.outcomes.insert(friend.to_string(), articles);
            self
        }

        fn panicking_for(mut self, friend: &str) -> Self {
            self.panics_for = Some(friend.to_string());
            self
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl ArticleSource for MockSource {
        async fn fetch_articles(
            &self,
            friend: &Friend,
            max_count: usize,
        ) -> Result<Vec<Article>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.panics_for.as_deref() == Some(friend.name.as_str()) {
                panic!("feed handler crashed for {}", friend.name);
            }
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            tokio::time::sleep(self.delay).await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            match self.outcomes.get(&friend.name) {
                Some(articles) => Ok(articles.iter().take(max_count).cloned().collect()),
                None => Err(FetchError::Status(404)),
            }
        }
    }

    mod sort_tests {
        use super::*;

        #[test]
        fn test_sorts_newest_first() {
            let mut articles = vec![
                create_test_article("old", "2024-01-01 09:00:00"),
                create_test_article("new", "2024-01-02 10:00:00"),
                create_test_article("mid", "2024-01-01 23:59:59"),
            ];
            sort_articles(&mut articles);
            assert_eq!(titles(&articles), vec!["new", "mid", "old"]);
        }

        #[test]
        fn test_ties_keep_input_order() {
            let mut articles = vec![
                create_test_article("first", "2024-01-01 09:00:00"),
                create_test_article("second", "2024-01-01 09:00:00"),
                create_test_article("newer", "2024-01-03 09:00:00"),
                create_test_article("third", "2024-01-01 09:00:00"),
            ];
            sort_articles(&mut articles);
            assert_eq!(titles(&articles), vec!["newer", "first", "second", "third"]);
        }

        #[test]
        fn test_unparsable_timestamps_sink_to_end() {
            let mut articles = vec![
                create_test_article("broken-a", "not a date"),
                create_test_article("old", "2023-05-01 00:00:00"),
                create_test_article("broken-b", ""),
                create_test_article("new", "2024-05-01 00:00:00"),
            ];
            sort_articles(&mut articles);
            assert_eq!(titles(&articles), vec!["new", "old", "broken-a", "broken-b"]);
        }
    }

    mod crawl_tests {
        use super::*;

        #[tokio::test]
        async fn test_counts_and_ordering() {
            let source = MockSource::default()
                .with_feed(
                    "alice",
                    vec![
                        create_test_article("a-old", "2024-01-01 09:00:00"),
                        create_test_article("a-new", "2024-01-03 09:00:00"),
                    ],
                )
                .with_feed("bob", vec![create_test_article("b-mid", "2024-01-02 09:00:00")]);
            let crawler = Crawler::new(Arc::new(source));
            let friends = vec![
                create_test_friend("alice"),
                create_test_friend("bob"),
                create_test_friend("carol"),
            ];

            let result = crawler.crawl(&friends).await;

            assert_eq!(result.meta.friend_count, 3);
            assert_eq!(result.meta.success_count, 2);
            assert_eq!(result.meta.fail_count, 1);
            assert_eq!(result.meta.article_count, 3);
            assert_eq!(result.items.len(), result.meta.article_count);
            assert_eq!(titles(&result.items), vec!["a-new", "b-mid", "a-old"]);
            assert!(parse_local(&result.meta.fetch_time).is_some());
        }

        #[tokio::test]
        async fn test_per_friend_cap_is_applied() {
            let articles = (0..25)
                .map(|i| create_test_article(&format!("post-{}", i), "2024-01-01 09:00:00"))
                .collect();
            let source = MockSource::default().with_feed("alice", articles);
            let crawler = Crawler::new(Arc::new(source));

            let result = crawler.crawl(&[create_test_friend("alice")]).await;

            assert_eq!(result.meta.article_count, MAX_ARTICLES_PER_FRIEND);
        }

        #[tokio::test]
        async fn test_all_failures_still_complete() {
            let crawler = Crawler::new(Arc::new(MockSource::default()));
            let friends: Vec<Friend> = (0..5)
                .map(|i| create_test_friend(&format!("f{}", i)))
                .collect();

            let result = crawler.crawl(&friends).await;

            assert_eq!(result.meta.friend_count, 5);
            assert_eq!(result.meta.success_count, 0);
            assert_eq!(result.meta.fail_count, 5);
            assert!(result.items.is_empty());
        }

        #[tokio::test]
        async fn test_panicking_fetch_counts_as_failure() {
            let source = MockSource::default()
                .with_feed("alice", vec![create_test_article("a", "2024-01-01 09:00:00")])
                .with_feed("carol", vec![create_test_article("c", "2024-01-02 09:00:00")])
                .panicking_for("bob");
            let crawler = Crawler::new(Arc::new(source));
            let friends = vec![
                create_test_friend("alice"),
                create_test_friend("bob"),
                create_test_friend("carol"),
            ];

            let result = crawler.crawl(&friends).await;

            assert_eq!(result.meta.fail_count, 1);
            assert_eq!(result.meta.success_count, 2);
            assert_eq!(
                result.meta.success_count + result.meta.fail_count,
                result.meta.friend_count
            );
            assert_eq!(titles(&result.items), vec!["c", "a"]);
        }

        #[tokio::test]
        async fn test_empty_friend_list() {
            let crawler = Crawler::new(Arc::new(MockSource::default()));
            let result = crawler.crawl(&[]).await;

            assert_eq!(result.meta, CrawlMeta {
                fetch_time: result.meta.fetch_time.clone(),
                ..CrawlMeta::default()
            });
        }

        #[tokio::test]
        async fn test_concurrency_never_exceeds_cap() {
            let mut source = MockSource::default().with_delay(Duration::from_millis(20));
            for i in 0..60 {
                source = source.with_feed(
                    &format!("f{}", i),
                    vec![create_test_article(&format!("p{}", i), "2024-01-01 09:00:00")],
                );
            }
            let source = Arc::new(source);
            let crawler = Crawler::new(source.clone());
            let friends: Vec<Friend> = (0..60)
                .map(|i| create_test_friend(&format!("f{}", i)))
                .collect();

            let result = crawler.crawl(&friends).await;

            assert_eq!(source.calls.load(Ordering::SeqCst), 60);
            assert!(source.peak.load(Ordering::SeqCst) <= MAX_CONCURRENT_FETCHES);
            assert!(source.peak.load(Ordering::SeqCst) > 1);
            assert_eq!(result.meta.success_count, 60);
            assert_eq!(result.meta.article_count, 60);
        }

        #[tokio::test]
        async fn test_custom_concurrency_limit() {
            let mut source = MockSource::default().with_delay(Duration::from_millis(10));
            for i in 0..12 {
                source = source.with_feed(&format!("f{}", i), vec![]);
            }
            let source = Arc::new(source);
            let crawler = Crawler::new(source.clone()).with_limits(3, 10);
            let friends: Vec<Friend> = (0..12)
                .map(|i| create_test_friend(&format!("f{}", i)))
                .collect();

            crawler.crawl(&friends).await;

            assert!(source.peak.load(Ordering::SeqCst) <= 3);
        }
    }

    mod guard_tests {
        use super::*;

        #[test]
        fn test_second_acquire_is_refused() {
            let guard = CrawlGuard::default();

            let permit = guard.try_acquire();
            assert!(permit.is_some());
            assert!(guard.is_held());
            assert!(guard.try_acquire().is_none());

            drop(permit);
            assert!(!guard.is_held());
            assert!(guard.try_acquire().is_some());
        }

        #[tokio::test]
        async fn test_crawler_refuses_overlapping_runs() {
            let crawler = Crawler::new(Arc::new(MockSource::default()));

            let permit = crawler.try_begin().unwrap();
            assert!(crawler.is_crawling());
            assert!(crawler.try_begin().is_none());

            drop(permit);
            assert!(!crawler.is_crawling());
        }
    }
}
