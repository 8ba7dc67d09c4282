//! Primary write path: the external persistence service.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use tokuten_core::StoredMovie;
use tracing::debug;

use crate::gateway::{PathError, WritePath};

#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    pub endpoint: String,
    pub token: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    endpoint: String,
    token: String,
}

impl HttpBackend {
    pub fn new(config: HttpBackendConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building persistence backend client")?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            token: config.token,
        })
    }

    pub fn movie_url(&self, external_id: &str) -> String {
        format!("{}/movies/{}", self.endpoint, external_id)
    }
}

#[async_trait]
impl WritePath for HttpBackend {
    fn name(&self) -> &'static str {
        "backend"
    }

    async fn load(&self, external_id: &str) -> Result<Option<StoredMovie>, PathError> {
        let url = self.movie_url(external_id);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        let status = resp.status();
        debug!(%url, status = status.as_u16(), "backend load");
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(PathError::Status {
                status: status.as_u16(),
                external_id: external_id.to_string(),
            });
        }
        Ok(Some(resp.json::<StoredMovie>().await?))
    }

    async fn store(&self, movie: &StoredMovie) -> Result<(), PathError> {
        let resp = self
            .client
            .put(self.movie_url(&movie.external_id))
            .bearer_auth(&self.token)
            .json(movie)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(PathError::Status {
                status: status.as_u16(),
                external_id: movie.external_id.clone(),
            });
        }
        Ok(())
    }
}
