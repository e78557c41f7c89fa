//! Stats API contract + bitly v4 client.

use async_trait::async_trait;
use bitstats_core::{ClickSample, GroupId, Link};
use bitstats_storage::{FetchError, HttpFetcher};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "bitstats-adapters";

pub const DEFAULT_API_BASE_URL: &str = "https://api-ssl.bitly.com";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Remote(#[from] FetchError),
    #[error("{0}")]
    NoData(String),
}

/// Read-only view of the link-shortening service used by the sync driver.
#[async_trait]
pub trait StatsApi: Send + Sync {
    async fn list_group_id(&self, token: &str) -> Result<GroupId, AdapterError>;

    /// First page of links only.
    async fn list_links(&self, token: &str, group: &GroupId) -> Result<Vec<Link>, AdapterError>;

    async fn get_click_samples(
        &self,
        token: &str,
        link_id: &str,
    ) -> Result<Vec<ClickSample>, AdapterError>;
}

#[derive(Debug, Deserialize)]
struct GroupsResponse {
    groups: Vec<GroupEntry>,
}

#[derive(Debug, Deserialize)]
struct GroupEntry {
    guid: String,
}

#[derive(Debug, Deserialize)]
struct BitlinksResponse {
    links: Vec<BitlinkEntry>,
}

#[derive(Debug, Deserialize)]
struct BitlinkEntry {
    id: String,
    link: String,
    long_url: String,
}

impl From<BitlinkEntry> for Link {
    fn from(entry: BitlinkEntry) -> Self {
        Link {
            id: entry.id,
            short_url: entry.link,
            long_url: entry.long_url,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ClicksResponse {
    link_clicks: Vec<ClickSample>,
}

pub struct BitlyClient {
    http: HttpFetcher,
    base_url: String,
}

impl BitlyClient {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn groups_url(&self) -> String {
        format!("{}/v4/groups", self.base_url)
    }

    pub fn bitlinks_url(&self, group: &GroupId) -> String {
        format!("{}/v4/groups/{}/bitlinks", self.base_url, group)
    }

    pub fn clicks_url(&self, link_id: &str) -> String {
        format!(
            "{}/v4/bitlinks/{}/clicks?unit=day",
            self.base_url,
            link_id.replace('/', "%2F")
        )
    }
}

#[async_trait]
impl StatsApi for BitlyClient {
    async fn list_group_id(&self, token: &str) -> Result<GroupId, AdapterError> {
        let response: GroupsResponse = self.http.get_json(&self.groups_url(), token).await?;
        let group = response
            .groups
            .into_iter()
            .next()
            .ok_or_else(|| AdapterError::NoData("no groups found".to_string()))?;
        Ok(GroupId(group.guid))
    }

    async fn list_links(&self, token: &str, group: &GroupId) -> Result<Vec<Link>, AdapterError> {
        let response: BitlinksResponse = self.http.get_json(&self.bitlinks_url(group), token).await?;
        debug!(%group, links = response.links.len(), "bitlinks listed");
        Ok(response.links.into_iter().map(Link::from).collect())
    }

    async fn get_click_samples(
        &self,
        token: &str,
        link_id: &str,
    ) -> Result<Vec<ClickSample>, AdapterError> {
        let response: ClicksResponse = self.http.get_json(&self.clicks_url(link_id), token).await?;
        Ok(response.link_clicks)
    }
}
