use serde::{Deserialize, Serialize};

/// A configured peer whose feed gets crawled. Field names on the wire follow
/// the remote friend-list document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Friend {
    pub name: String,
    #[serde(rename = "url", default)]
    pub site_url: String,
    #[serde(rename = "avatar", default)]
    pub avatar_url: String,
    #[serde(rename = "RSS")]
    pub feed_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub title: String,
    pub link: String,
    /// `YYYY-MM-DD HH:MM:SS` in UTC+8
    pub published: String,
    pub author: String,
    pub avatar: String,
    pub content: String,
    pub source_site_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlMeta {
    pub fetch_time: String,
    pub friend_count: usize,
    pub success_count: usize,
    pub fail_count: usize,
    pub article_count: usize,
}

/// Output of one orchestration run, serialized as the published artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlResult {
    pub meta: CrawlMeta,
    pub items: Vec<Article>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_friend_list_wire_names() {
        let json = r#"[
            {"name": "Alice", "url": "https://alice.example", "avatar": "https://alice.example/a.png", "RSS": "https://alice.example/rss.xml"},
            {"name": "Bob", "RSS": "https://bob.example/atom.xml"}
        ]"#;

        let friends: Vec<Friend> = serde_json::from_str(json).unwrap();

        assert_eq!(friends.len(), 2);
        assert_eq!(friends[0].site_url, "https://alice.example");
        assert_eq!(friends[0].avatar_url, "https://alice.example/a.png");
        assert_eq!(friends[0].feed_url, "https://alice.example/rss.xml");
        assert_eq!(friends[1].site_url, "");
        assert_eq!(friends[1].avatar_url, "");
    }

    #[test]
    fn test_friend_without_feed_is_rejected() {
        let json = r#"{"name": "Carol", "url": "https://carol.example"}"#;
        assert!(serde_json::from_str::<Friend>(json).is_err());
    }

    #[test]
    fn test_result_serializes_meta_and_items() {
        let result = CrawlResult {
            meta: CrawlMeta {
                fetch_time: "2024-01-02 10:00:00".to_string(),
                friend_count: 1,
                success_count: 1,
                fail_count: 0,
                article_count: 0,
            },
            items: vec![],
        };

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["meta"]["friend_count"], 1);
        assert_eq!(value["meta"]["fetch_time"], "2024-01-02 10:00:00");
        assert!(value["items"].as_array().unwrap().is_empty());
    }
}
