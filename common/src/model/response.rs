use std::collections::HashMap;

use bytes::Bytes;
use errors::{Error, Result};
use serde::de::DeserializeOwned;

/// HTTP response flowing back through the middleware chain.
///
/// The body starts out streaming; the first consumer that needs the whole
/// payload buffers it, after which it can be read any number of times.
/// Middleware that inspects the body should buffer and hand the response
/// back rather than consuming it.
#[derive(Debug)]
pub struct Response {
    status: u16,
    headers: HashMap<String, String>,
    url: String,
    body: ResponseBody,
}

#[derive(Debug)]
enum ResponseBody {
    Streaming(Box<reqwest::Response>),
    Buffered(Bytes),
}

impl Response {
    pub fn from_reqwest(response: reqwest::Response) -> Self {
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        Response {
            status: response.status().as_u16(),
            url: response.url().to_string(),
            headers,
            body: ResponseBody::Streaming(Box::new(response)),
        }
    }

    /// Builds an already-buffered response; used by tests and middleware
    /// that synthesize responses.
    pub fn from_parts(
        status: u16,
        headers: HashMap<String, String>,
        url: impl Into<String>,
        body: Bytes,
    ) -> Self {
        Response {
            status,
            headers,
            url: url.into(),
            body: ResponseBody::Buffered(body),
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Pulls the next chunk of a streaming body; `None` once exhausted or
    /// after the body was buffered.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        match &mut self.body {
            ResponseBody::Streaming(response) => response.chunk().await.map_err(Error::http),
            ResponseBody::Buffered(_) => Ok(None),
        }
    }

    /// Reads the remaining body into memory. Idempotent.
    pub async fn buffer(&mut self) -> Result<()> {
        if matches!(self.body, ResponseBody::Streaming(_)) {
            let previous = std::mem::replace(&mut self.body, ResponseBody::Buffered(Bytes::new()));
            if let ResponseBody::Streaming(response) = previous {
                let bytes = response.bytes().await.map_err(Error::http)?;
                self.body = ResponseBody::Buffered(bytes);
            }
        }
        Ok(())
    }

    pub async fn bytes(&mut self) -> Result<Bytes> {
        self.buffer().await?;
        match &self.body {
            ResponseBody::Buffered(bytes) => Ok(bytes.clone()),
            ResponseBody::Streaming(_) => Err(Error::http("response body was not buffered")),
        }
    }

    pub async fn text(&mut self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| Error::http(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffered(status: u16, body: &str) -> Response {
        Response::from_parts(
            status,
            HashMap::new(),
            "https://example.com",
            Bytes::copy_from_slice(body.as_bytes()),
        )
    }

    #[tokio::test]
    async fn test_text_reads_repeatedly() {
        let mut response = buffered(200, "hello");
        assert_eq!(response.text().await.unwrap(), "hello");
        assert_eq!(response.text().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_json() {
        let mut response = buffered(200, r#"{"count": 3}"#);
        let value: serde_json::Value = response.json().await.unwrap();
        assert_eq!(value["count"], 3);
    }

    #[test]
    fn test_status_helpers() {
        let response = buffered(503, "");
        assert!(!response.is_success());
        assert_eq!(response.status(), 503);
    }
}
