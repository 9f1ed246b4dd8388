//! REST-style HTTP transport.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use super::Transport;
use crate::codec::{Id, encode_id, encode_query, id_path_segment};
use crate::error::TransportError;
use crate::types::{ListResponse, Resource};

/// [`Transport`] over JSON HTTP.
///
/// Lists are read from `GET {base}/{model}` with the query object flattened
/// into URL parameters: string values are sent as-is, anything else as its
/// canonical JSON. A query that is not an object is sent as `q`. Items are
/// read from `GET {base}/{model}/{id}`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: Client,
    base_url: Url,
}

impl HttpTransport {
    pub fn new(base_url: impl AsRef<str>) -> Result<Self, TransportError> {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: impl AsRef<str>) -> Result<Self, TransportError> {
        let base_url = Url::parse(base_url.as_ref())
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {e}", base_url.as_ref())))?;
        if base_url.cannot_be_a_base() {
            return Err(TransportError::InvalidUrl(base_url.to_string()));
        }
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, segments: &[&str]) -> Result<Url, TransportError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| TransportError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        url: Url,
        model: &str,
        key: String,
    ) -> Result<T, TransportError> {
        debug!(%url, "GET");
        let response = self.http.get(url).send().await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(TransportError::NotFound {
                model: model.to_string(),
                key,
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Flatten a list query into URL parameters.
fn query_pairs(query: &Value) -> Vec<(String, String)> {
    match query {
        Value::Null => Vec::new(),
        Value::Object(map) => {
            let mut pairs: Vec<(String, String)> = map
                .iter()
                .map(|(name, value)| {
                    let value = match value {
                        Value::String(s) => s.clone(),
                        other => encode_query(other),
                    };
                    (name.clone(), value)
                })
                .collect();
            pairs.sort();
            pairs
        }
        other => vec![("q".to_string(), encode_query(other))],
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn read_list(&self, model: &str, query: &Value) -> Result<ListResponse, TransportError> {
        let mut url = self.url(&[model])?;
        let pairs = query_pairs(query);
        if !pairs.is_empty() {
            url.query_pairs_mut().extend_pairs(pairs);
        }
        self.get(url, model, encode_query(query)).await
    }

    async fn read_item(&self, model: &str, id: &Id) -> Result<Resource, TransportError> {
        let segment = id_path_segment(id);
        let url = self.url(&[model, &segment])?;
        self.get(url, model, encode_id(id)).await
    }
}
