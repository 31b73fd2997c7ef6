use reqwest::Method;
use serde::{de::DeserializeOwned, Serialize};

use crate::{Error, Result};

/// Utility trait for making HTTP requests.
#[async_trait::async_trait]
pub(crate) trait Http {
    /// Returns a reference to the `reqwest::Client` used to make HTTP requests.
    fn inner(&self) -> (&reqwest::Client, &crate::Config);

    /// Builds a request for the given API path, applying basic auth when
    /// configured.
    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let (client, config) = self.inner();
        let url = format!("{}/v1/{}", config.address.trim_end_matches('/'), path);
        let builder = client.request(method, url);
        match &config.auth {
            Some((username, password)) => builder.basic_auth(username, Some(password)),
            None => builder,
        }
    }

    /// Makes a GET request to the given path and returns the decoded
    /// response.
    async fn get<T: DeserializeOwned + Send>(&self, path: &str) -> Result<T> {
        let response = self.request(Method::GET, path).send().await?;
        let response = require_ok(response).await?;
        Ok(response.json().await?)
    }

    /// Makes a GET request to the given path, discarding the response
    /// body. Used for probes where only success matters.
    async fn get_discard(&self, path: &str) -> Result<()> {
        let response = self.request(Method::GET, path).send().await?;
        require_ok(response).await?;
        Ok(())
    }

    /// Makes a PUT request with the given JSON body.
    async fn put<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<()> {
        let response = self.request(Method::PUT, path).json(body).send().await?;
        require_ok(response).await?;
        Ok(())
    }

    /// Makes a PUT request with no body. The agent's deregister endpoints
    /// take the record ID in the path and nothing else.
    async fn put_empty(&self, path: &str) -> Result<()> {
        let response = self.request(Method::PUT, path).send().await?;
        require_ok(response).await?;
        Ok(())
    }
}

/// Rejects non-2xx responses, capturing the body text for the error.
async fn require_ok(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(Error::UnexpectedStatus { status, body })
    }
}
