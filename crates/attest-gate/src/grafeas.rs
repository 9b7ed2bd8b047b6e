//! Grafeas-backed occurrence store
//!
//! Talks to the Grafeas v1beta1 REST API: occurrences are created with
//! `batchCreate` and listed per resource with a `resource.uri` filter,
//! following `nextPageToken` until the listing is exhausted.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use attest_core::{Occurrence, OccurrenceStore, StoreError};

#[derive(Debug, Serialize)]
struct BatchCreateRequest<'a> {
    parent: &'a str,
    occurrences: &'a [Occurrence],
}

#[derive(Debug, Deserialize)]
struct BatchCreateResponse {
    #[serde(default)]
    occurrences: Vec<Occurrence>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    occurrences: Vec<Occurrence>,
    #[serde(default)]
    next_page_token: String,
}

/// Occurrence store over a Grafeas server
#[derive(Debug, Clone)]
pub struct GrafeasStore {
    base_url: String,
    project: String,
    http_client: reqwest::Client,
}

impl GrafeasStore {
    pub fn new(base_url: impl Into<String>, project: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            project: project.into(),
            http_client: reqwest::Client::new(),
        }
    }

    fn parent(&self) -> String {
        format!("projects/{}", self.project)
    }

    fn occurrences_url(&self) -> String {
        format!("{}/v1beta1/{}/occurrences", self.base_url, self.parent())
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(StoreError::Backend(format!("Grafeas returned {}: {}", status, body)))
    }
}

/// List filter matching exactly `resource_uri`
fn resource_filter(resource_uri: &str) -> String {
    let mut escaped = String::with_capacity(resource_uri.len());
    for c in resource_uri.chars() {
        if matches!(c, '"' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    format!("resource.uri=\"{}\"", escaped)
}

fn connection(err: reqwest::Error) -> StoreError {
    StoreError::Connection(err.to_string())
}

fn serialization(err: reqwest::Error) -> StoreError {
    StoreError::Serialization(err.to_string())
}

#[async_trait]
impl OccurrenceStore for GrafeasStore {
    async fn create_occurrences(
        &self,
        occurrences: Vec<Occurrence>,
    ) -> Result<Vec<Occurrence>, StoreError> {
        if occurrences.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(missing) = occurrences.iter().find(|o| o.resource.uri.is_empty()) {
            return Err(StoreError::InvalidOccurrence(format!(
                "occurrence '{}' has no resource URI",
                missing.note_name
            )));
        }

        let parent = self.parent();
        let request = BatchCreateRequest {
            parent: &parent,
            occurrences: &occurrences,
        };

        let response = self
            .http_client
            .post(format!("{}:batchCreate", self.occurrences_url()))
            .json(&request)
            .send()
            .await
            .map_err(connection)?;
        let created: BatchCreateResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(serialization)?;

        info!(
            project = %self.project,
            count = created.occurrences.len(),
            "Created occurrences in Grafeas"
        );
        Ok(created.occurrences)
    }

    async fn list_occurrences(&self, resource_uri: &str) -> Result<Vec<Occurrence>, StoreError> {
        let filter = resource_filter(resource_uri);
        let mut occurrences = Vec::new();
        let mut page_token = String::new();

        loop {
            let mut query = vec![("filter", filter.as_str())];
            if !page_token.is_empty() {
                query.push(("pageToken", page_token.as_str()));
            }

            let response = self
                .http_client
                .get(self.occurrences_url())
                .query(&query)
                .send()
                .await
                .map_err(connection)?;
            let page: ListResponse = Self::check(response)
                .await?
                .json()
                .await
                .map_err(serialization)?;

            occurrences.extend(page.occurrences);
            if page.next_page_token.is_empty() {
                break;
            }
            page_token = page.next_page_token;
        }

        debug!(resource = %resource_uri, count = occurrences.len(), "Listed occurrences from Grafeas");
        Ok(occurrences)
    }
}
