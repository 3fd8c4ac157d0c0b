//! The daily arXiv listing, pulled from the public RSS feed of a section.

use std::path::{Path, PathBuf};

use rss::{Channel, Item};
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc2822;
use time::macros::format_description;
use time::{Date, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::AppResult;
use crate::corpus::write_json_file;

/// Base URL of the per-section feeds; the section name is appended as the last path segment.
pub const DEFAULT_FEED_URL: &str = "https://rss.arxiv.org/rss";

const ABSTRACT_MARKER: &str = "\nAbstract:";

/// One day's listing of a section, as documents ready to be embedded.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyFeed {
    pub section: String,
    pub published: Date,
    pub documents: Vec<Map<String, Value>>,
}

/// Text after the `Abstract:` line of an item summary, or nothing.
fn abstract_of(summary: Option<&str>) -> String {
    summary
        .and_then(|s| s.split_once(ABSTRACT_MARKER))
        .map(|(_, abs)| abs.trim().to_string())
        .unwrap_or_default()
}

fn document(item: &Item) -> Map<String, Value> {
    let dc = item.dublin_core_ext();
    let category = item
        .categories()
        .iter()
        .map(|c| c.name())
        .collect::<Vec<_>>()
        .join(",");
    let rights = dc.map(|dc| dc.rights().join(", ")).unwrap_or_default();
    let creator = dc.map(|dc| dc.creators().join(", ")).unwrap_or_default();

    let mut doc = Map::new();
    doc.insert("title".into(), item.title().unwrap_or_default().trim().into());
    doc.insert("abstract".into(), abstract_of(item.description()).into());
    doc.insert(
        "guid".into(),
        item.guid().map(|g| g.value()).unwrap_or_default().into(),
    );
    doc.insert("category".into(), category.into());
    doc.insert("link".into(), item.link().unwrap_or_default().into());
    doc.insert("rights".into(), rights.into());
    doc.insert("creator".into(), creator.into());
    doc
}

/// Date the channel was published, in the feed's own offset.
fn published_date(channel: &Channel) -> Date {
    let raw = channel.pub_date().or(channel.last_build_date());
    match raw.map(|s| OffsetDateTime::parse(s.trim(), &Rfc2822)) {
        Some(Ok(dt)) => dt.date(),
        Some(Err(e)) => {
            warn!("Unreadable feed date {:?} ({e}); using today", raw);
            OffsetDateTime::now_utc().date()
        }
        None => {
            warn!("Feed carries no publication date; using today");
            OffsetDateTime::now_utc().date()
        }
    }
}

impl DailyFeed {
    /// Parse an RSS document of `section`.
    pub fn parse(bytes: &[u8], section: &str) -> AppResult<Self> {
        let channel = Channel::read_from(bytes)?;
        let documents: Vec<_> = channel.items().iter().map(document).collect();
        debug!("Parsed {} items from the {section} feed", documents.len());
        Ok(Self {
            section: section.to_string(),
            published: published_date(&channel),
            documents,
        })
    }

    /// `<YYYY_MM_DD>_<section>.json.gz`
    pub fn file_name(&self) -> AppResult<String> {
        let date = self
            .published
            .format(format_description!("[year]_[month]_[day]"))?;
        Ok(format!("{date}_{}.json.gz", self.section))
    }

    /// Write the documents as a gzip JSON array into `data_dir`.
    pub fn write_to(&self, data_dir: &Path) -> AppResult<PathBuf> {
        let path = data_dir.join(self.file_name()?);
        write_json_file(&path, &self.documents)?;
        info!("Wrote {} articles to {}", self.documents.len(), path.display());
        Ok(path)
    }
}

/// Download and parse the current listing of `section`.
#[tracing::instrument(name = "Fetching feed", level = "info", skip(client))]
pub async fn fetch_feed(
    client: &reqwest::Client,
    base_url: &str,
    section: &str,
) -> AppResult<DailyFeed> {
    let url = format!("{}/{section}", base_url.trim_end_matches('/'));
    let bytes = client.get(&url).send().await?.error_for_status()?.bytes().await?;
    let feed = DailyFeed::parse(&bytes, section)?;
    if feed.documents.is_empty() {
        warn!("{url} lists no articles for {}", feed.published);
    }
    Ok(feed)
}
