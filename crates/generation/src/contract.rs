//! Inter-stage payloads
//!
//! Version 1 of the data exchanged between stages:
//! - scrape prints a JSON array of [`SearchHit`]
//! - analyze reads that array and prints an [`AnalysisReport`] object
//! - build-prompt reads the report and prints free text
//! - synthesize-article reads the prompt and prints the article body
//!
//! The raw stdout of a stage, not a re-serialization, is what the next stage
//! receives. Parsing here only checks the shape.

use serde::{Deserialize, Serialize};

pub const CONTRACT_VERSION: u32 = 1;

/// One search result produced by the scrape stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    #[serde(rename = "Keyword")]
    pub keyword: String,

    #[serde(rename = "Rank")]
    pub rank: i64,

    #[serde(rename = "Title", default)]
    pub title: Option<String>,

    /// Links without an href come through as null
    #[serde(rename = "URL", default)]
    pub url: Option<String>,
}

/// Aggregate statistics produced by the analyze stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub target_keyword: String,

    #[serde(default)]
    pub average_word_count: Option<f64>,

    #[serde(default)]
    pub average_heading_length: Option<f64>,

    #[serde(default)]
    pub average_num_headings: Option<f64>,

    #[serde(default)]
    pub keyword_density: Option<f64>,

    #[serde(default)]
    pub average_sentiment: Option<f64>,

    /// Word/frequency pairs; the exact shape is owned by the analyzer
    #[serde(default)]
    pub top_30_words: Vec<serde_json::Value>,

    #[serde(default)]
    pub word2vec_heading: Vec<serde_json::Value>,

    #[serde(default)]
    pub word2vec_body: Vec<serde_json::Value>,
}

pub fn parse_search_hits(raw: &str) -> Result<Vec<SearchHit>, serde_json::Error> {
    serde_json::from_str(raw)
}

pub fn parse_analysis(raw: &str) -> Result<AnalysisReport, serde_json::Error> {
    serde_json::from_str(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_hits() {
        let raw = r#"[
            {"Keyword": "rust", "Rank": 1, "Title": "The Rust Book", "URL": "https://doc.rust-lang.org/book/"},
            {"Keyword": "rust", "Rank": 2, "URL": "https://example.com"}
        ]"#;

        let hits = parse_search_hits(raw).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].title.as_deref(), Some("The Rust Book"));
        assert_eq!(hits[1].title, None);
        assert_eq!(hits[1].rank, 2);
        assert_eq!(hits[1].url.as_deref(), Some("https://example.com"));
    }

    #[test]
    fn test_search_hit_without_url() {
        let raw = r#"[
            {"Keyword": "rust", "Rank": 1, "Title": "No link", "URL": null},
            {"Keyword": "rust", "Rank": 2}
        ]"#;

        let hits = parse_search_hits(raw).unwrap();
        assert_eq!(hits[0].url, None);
        assert_eq!(hits[1].url, None);
    }

    #[test]
    fn test_empty_hit_list_is_valid() {
        assert!(parse_search_hits("[]").unwrap().is_empty());
    }

    #[test]
    fn test_search_hits_reject_object() {
        assert!(parse_search_hits(r#"{"Keyword": "rust"}"#).is_err());
        assert!(parse_search_hits("not json").is_err());
    }

    #[test]
    fn test_analysis_minimal_and_full() {
        let minimal = parse_analysis(r#"{"target_keyword": "rust"}"#).unwrap();
        assert_eq!(minimal.target_keyword, "rust");
        assert!(minimal.top_30_words.is_empty());

        let full = parse_analysis(
            r#"{
                "target_keyword": "rust",
                "average_word_count": 1800.5,
                "average_heading_length": 22,
                "average_num_headings": 9.3,
                "keyword_density": 0.012,
                "average_sentiment": 0.2,
                "top_30_words": [["rust", 120], ["memory", 80]],
                "word2vec_heading": ["borrow", "lifetime"],
                "word2vec_body": [],
                "extra_field": true
            }"#,
        )
        .unwrap();
        assert_eq!(full.average_word_count, Some(1800.5));
        assert_eq!(full.top_30_words.len(), 2);
    }

    #[test]
    fn test_analysis_requires_keyword() {
        assert!(parse_analysis(r#"{"average_word_count": 10}"#).is_err());
    }
}
