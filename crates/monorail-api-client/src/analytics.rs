use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};

use crate::{retry, ApiAuth, ApiClient, Error};

/// Where a cache query was answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheSource {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheEvent {
    Hit,
    Miss,
}

/// One cache query outcome, as reported to the events endpoint. Not part of
/// the cache's functional contract; the sink may drop these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub source: CacheSource,
    pub event: CacheEvent,
    pub hash: String,
    pub duration: u64,
}

impl AnalyticsEvent {
    pub fn set_session_id(&mut self, id: String) {
        self.session_id = Some(id);
    }
}

#[async_trait]
pub trait AnalyticsClient {
    async fn record_analytics(
        &self,
        api_auth: &ApiAuth,
        events: Vec<AnalyticsEvent>,
    ) -> Result<(), Error>;
}

#[async_trait]
impl AnalyticsClient for ApiClient {
    #[tracing::instrument(skip_all)]
    async fn record_analytics(
        &self,
        api_auth: &ApiAuth,
        events: Vec<AnalyticsEvent>,
    ) -> Result<(), Error> {
        let request_builder = self
            .client
            .request(Method::POST, self.make_url("/v1/artifacts/events")?)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", api_auth.token))
            .json(&events);
        let request_builder = Self::add_team_params(
            request_builder,
            api_auth.team_id.as_deref(),
            api_auth.team_slug.as_deref(),
        );

        retry::make_retryable_request(request_builder)
            .await?
            .error_for_status()?;

        Ok(())
    }
}
