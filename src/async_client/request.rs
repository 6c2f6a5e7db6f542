use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::PoolOverrides;
use crate::error::Error;
use crate::execution::RequestOptions;
use crate::response::Response;
use crate::util::{parse_header_name, parse_header_value};

use super::client::AsyncClient;

pub struct AsyncRequestBuilder<'a> {
    client: &'a AsyncClient,
    method: Method,
    url: String,
    options: RequestOptions,
}

impl<'a> AsyncRequestBuilder<'a> {
    pub(crate) fn new(client: &'a AsyncClient, method: Method, url: String) -> Self {
        Self {
            client,
            method,
            url,
            options: RequestOptions::default(),
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.options.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.options.headers.extend(headers);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.options.body = Some(body.into());
        self
    }

    pub fn json<T>(mut self, value: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(value).map_err(|source| Error::Serialize { source })?;
        self.options.body = Some(Bytes::from(body));
        self.options
            .headers
            .entry(CONTENT_TYPE)
            .or_insert(HeaderValue::from_static("application/json"));
        Ok(self)
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.options.max_attempts = Some(max_attempts);
        self
    }

    pub fn ai_optimize(mut self, enabled: bool) -> Self {
        self.options.ai_optimize = Some(enabled);
        self
    }

    pub fn learn_from_outcome(mut self, enabled: bool) -> Self {
        self.options.learn_from_outcome = Some(enabled);
        self
    }

    pub fn pool_overrides(mut self, pool_overrides: PoolOverrides) -> Self {
        self.options.pool_overrides = pool_overrides;
        self
    }

    pub async fn send(self) -> crate::Result<Response> {
        self.client
            .execute(self.method, &self.url, self.options)
            .await
    }

    pub async fn send_json<T>(self) -> crate::Result<T>
    where
        T: DeserializeOwned,
    {
        self.send().await?.json()
    }
}
