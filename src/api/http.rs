use async_trait::async_trait;
use reqwest::{header, Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

use super::types::{Broker, BrokerCid, BundleCid, Check, CheckBundle, CheckCid};
use super::{BundleQuery, CheckApi};
use crate::config::ApiConfig;
use crate::error::{Error, Result};

const AUTH_TOKEN_HEADER: &str = "X-Circonus-Auth-Token";
const APP_NAME_HEADER: &str = "X-Circonus-App-Name";

/// [`CheckApi`] over the backend's REST interface.
pub struct HttpApi {
    base_url: String,
    token_key: String,
    token_app: String,
    client: Client,
}

impl HttpApi {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms.max(1)))
            .build()?;
        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            token_key: config.token_key.clone(),
            token_app: config.token_app.clone(),
            client,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .header(AUTH_TOKEN_HEADER, &self.token_key)
            .header(APP_NAME_HEADER, &self.token_app)
            .header(header::ACCEPT, "application/json")
    }

    async fn send<T: DeserializeOwned>(&self, path: &str, builder: RequestBuilder) -> Result<T> {
        debug!(path = %path, "Sending backend request.");
        let response = builder.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(path.to_string()));
        }
        if !status.is_success() {
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            return Err(Error::Backend(format!(
                "{path} returned non-success status: {status}. Body: {error_body}"
            )));
        }

        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl CheckApi for HttpApi {
    async fn get_check(&self, id: u64) -> Result<Check> {
        let cid = CheckCid::from_id(id);
        self.send(cid.as_str(), self.request(Method::GET, cid.as_str()))
            .await
    }

    async fn get_check_bundle(&self, cid: &BundleCid) -> Result<CheckBundle> {
        self.send(cid.as_str(), self.request(Method::GET, cid.as_str()))
            .await
    }

    async fn search_check_bundles(&self, query: &BundleQuery) -> Result<Vec<CheckBundle>> {
        let builder = self
            .request(Method::GET, BundleCid::PREFIX)
            .query(&[("search", query.to_search_string())]);
        match self.send(BundleCid::PREFIX, builder).await {
            // A search miss is an empty result, not an error.
            Err(Error::NotFound(_)) => Ok(Vec::new()),
            other => other,
        }
    }

    async fn create_check_bundle(&self, bundle: &CheckBundle) -> Result<CheckBundle> {
        let builder = self.request(Method::POST, BundleCid::PREFIX).json(bundle);
        self.send(BundleCid::PREFIX, builder).await
    }

    async fn update_check_bundle(
        &self,
        cid: &BundleCid,
        bundle: &CheckBundle,
    ) -> Result<CheckBundle> {
        let builder = self.request(Method::PUT, cid.as_str()).json(bundle);
        self.send(cid.as_str(), builder).await
    }

    async fn list_brokers(&self, select_tags: &[String]) -> Result<Vec<Broker>> {
        let filters: Vec<(&str, &str)> = select_tags
            .iter()
            .map(|tag| ("f__tags_has", tag.as_str()))
            .collect();
        let builder = self.request(Method::GET, BrokerCid::PREFIX).query(&filters);
        self.send(BrokerCid::PREFIX, builder).await
    }

    async fn get_broker(&self, cid: &BrokerCid) -> Result<Broker> {
        self.send(cid.as_str(), self.request(Method::GET, cid.as_str()))
            .await
    }
}
