//! Core listing model and the port traits shared by every watcher crate.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub const CRATE_NAME: &str = "cw-core";

/// One classified entry discovered on a source.
///
/// Built fresh on every fetch. Only the `id` outlives a run, through the
/// dedup store. Field aliases accept seen-item files written by the earlier
/// Go watcher, which used exported field names as keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    #[serde(alias = "ID")]
    pub id: String,
    #[serde(alias = "Title")]
    pub title: String,
    #[serde(default, alias = "Description")]
    pub description: String,
    /// `0.0` means the source has no price for this kind of entry.
    #[serde(default, alias = "Price")]
    pub price: f64,
    #[serde(default, alias = "Currency")]
    pub currency: String,
    #[serde(alias = "Url")]
    pub url: String,
    #[serde(alias = "PublishedAt")]
    pub published_at: DateTime<Utc>,
    #[serde(
        default,
        alias = "Metadata",
        deserialize_with = "null_as_empty_map",
        skip_serializing_if = "Map::is_empty"
    )]
    pub metadata: Map<String, JsonValue>,
}

fn null_as_empty_map<'de, D>(deserializer: D) -> Result<Map<String, JsonValue>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, JsonValue>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Listing {
    /// Minimal constructor: description and metadata empty, price not
    /// applicable, `published_at` set to now.
    pub fn new(id: impl Into<String>, title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            price: 0.0,
            currency: String::new(),
            url: url.into(),
            published_at: Utc::now(),
            metadata: Map::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_price(mut self, price: f64, currency: impl Into<String>) -> Self {
        self.price = price.max(0.0);
        self.currency = currency.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// A listing is processable only when it carries an id, a title and a url.
    pub fn is_valid(&self) -> bool {
        !self.id.is_empty() && !self.title.is_empty() && !self.url.is_empty()
    }

    pub fn has_price(&self) -> bool {
        self.price > 0.0
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("decoding {what}: {message}")]
    Decode { what: String, message: String },
    #[error("fetch cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding store document: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification cancelled")]
    Cancelled,
    #[error("{channel} delivery failed for listing {listing_id}: {source}")]
    Delivery {
        channel: &'static str,
        listing_id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("notification errors: {}", .0.join("; "))]
    Aggregate(Vec<String>),
}

/// Produces the full set of listings currently published by one source.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_listings(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<Listing>, ProviderError>;
}

/// Durable record of listing ids that have already been notified.
///
/// `save` of an id that is already present must succeed without effect.
#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn exists(&self, id: &str) -> Result<bool, StoreError>;

    async fn save(&self, listing: &Listing) -> Result<(), StoreError>;
}

/// One delivery channel for new-listing alerts.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, listing: &Listing, cancel: &CancellationToken) -> Result<(), NotifyError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_validity_requires_id_title_and_url() {
        let valid = Listing::new("123", "Super Chien", "https://example.com/dog");
        assert!(valid.is_valid());

        let cases = [
            Listing::new("", "Super Chien", "https://example.com/dog"),
            Listing::new("123", "", "https://example.com/dog"),
            Listing::new("123", "Super Chien", ""),
        ];
        for listing in cases {
            assert!(!listing.is_valid(), "{listing:?} should be invalid");
        }
    }

    #[test]
    fn negative_prices_clamp_to_not_applicable() {
        let listing = Listing::new("1", "t", "u").with_price(-5.0, "EUR");
        assert_eq!(listing.price, 0.0);
        assert!(!listing.has_price());
    }

    #[test]
    fn serde_roundtrip_omits_empty_metadata_and_defaults_optional_fields() {
        let listing = Listing::new("1", "Flat", "https://example.com/1");
        let json = serde_json::to_value(&listing).unwrap();
        assert!(json.get("metadata").is_none());

        let minimal = serde_json::json!({
            "id": "2",
            "title": "Dog",
            "url": "https://example.com/2",
            "published_at": "2026-02-24T12:00:00Z"
        });
        let parsed: Listing = serde_json::from_value(minimal).unwrap();
        assert_eq!(parsed.price, 0.0);
        assert!(parsed.description.is_empty());
        assert!(parsed.is_valid());
    }

    #[test]
    fn go_style_keys_and_null_metadata_are_accepted() {
        let legacy = serde_json::json!({
            "ID": "xyz-123",
            "Title": "Test Item",
            "Description": "",
            "Price": 640.0,
            "Currency": "EUR",
            "Url": "https://example.com/1",
            "PublishedAt": "2026-01-01T00:00:00.123456789+01:00",
            "Metadata": null
        });
        let parsed: Listing = serde_json::from_value(legacy).unwrap();
        assert_eq!(parsed.id, "xyz-123");
        assert_eq!(parsed.url, "https://example.com/1");
        assert_eq!(parsed.price, 640.0);
        assert!(parsed.metadata.is_empty());
        assert!(parsed.is_valid());

        let with_metadata = serde_json::json!({
            "ID": "1", "Title": "t", "Url": "u",
            "PublishedAt": "0001-01-01T00:00:00Z",
            "Metadata": { "city": "Strasbourg" }
        });
        let parsed: Listing = serde_json::from_value(with_metadata).unwrap();
        assert_eq!(parsed.metadata["city"], "Strasbourg");
    }

    #[test]
    fn aggregate_error_lists_every_failure() {
        let err = NotifyError::Aggregate(vec!["smtp down".into(), "webhook 500".into()]);
        assert_eq!(err.to_string(), "notification errors: smtp down; webhook 500");
    }
}
