use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;

use crate::classify::{AnomalyReport, Classification, detect_anomaly};
use crate::error::Error;
use crate::util::truncate_body;

/// Final outcome of a logical request: the last response observed, whatever
/// its status.
#[derive(Clone, Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    url: String,
    attempts: usize,
    classification: Classification,
}

impl Response {
    pub(crate) fn new(
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        url: String,
        attempts: usize,
        classification: Classification,
    ) -> Self {
        Self {
            status,
            headers,
            body,
            url,
            attempts,
            classification,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// URL the last attempt was sent to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Dispatches performed, the first one included.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn classification(&self) -> Classification {
        self.classification
    }

    pub fn anomaly(&self) -> AnomalyReport {
        detect_anomaly(self.status)
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T>(&self) -> crate::Result<T>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.body).map_err(|source| Error::Deserialize {
            source,
            body: truncate_body(&self.body),
        })
    }
}
