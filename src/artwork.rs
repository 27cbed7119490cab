use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

const SEARCH_URL: &str = "https://itunes.apple.com/search";

/// Result of an artwork lookup; both parts are optional
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Artwork {
    pub thumbnail_url: Option<String>,
    pub page_url: Option<String>,
}

/// Looks up album artwork. Failures are reported as "nothing found".
pub trait ArtworkResolver: Send + Sync {
    fn resolve(&self, artist: &str, album: &str) -> Artwork;
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(rename = "resultCount", default)]
    result_count: u32,
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(rename = "artworkUrl100")]
    artwork_url: Option<String>,
    #[serde(rename = "collectionViewUrl")]
    collection_url: Option<String>,
}

/// iTunes search API lookup by "artist album"
pub struct ItunesArtwork {
    client: reqwest::blocking::Client,
    endpoint: String,
}

impl ItunesArtwork {
    pub fn new() -> Result<Self> {
        Self::with_endpoint(SEARCH_URL)
    }

    pub fn with_endpoint(endpoint: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("nowplaying-presence/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }

    fn lookup(&self, artist: &str, album: &str) -> Result<Artwork> {
        let term = format!("{} {}", artist, album);
        log::debug!("Looking up artwork for: {}", term);

        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("term", term.as_str()), ("entity", "album"), ("limit", "1")])
            .send()
            .context("Artwork search request failed")?
            .error_for_status()
            .context("Artwork search returned an error status")?;

        let body: SearchResponse = response
            .json()
            .context("Failed to parse artwork search response")?;
        Ok(artwork_from_response(body))
    }
}

impl ArtworkResolver for ItunesArtwork {
    fn resolve(&self, artist: &str, album: &str) -> Artwork {
        match self.lookup(artist, album) {
            Ok(artwork) => artwork,
            Err(e) => {
                log::warn!("Artwork lookup for {} - {} failed: {:#}", artist, album, e);
                Artwork::default()
            }
        }
    }
}

fn artwork_from_response(body: SearchResponse) -> Artwork {
    if body.result_count == 0 {
        return Artwork::default();
    }

    match body.results.into_iter().next() {
        Some(first) => Artwork {
            thumbnail_url: first.artwork_url.filter(|u| !u.is_empty()),
            page_url: first.collection_url.filter(|u| !u.is_empty()),
        },
        None => Artwork::default(),
    }
}
