use anyhow::{anyhow, Result};
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Client, Method,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error};

use shared_config::AppConfig;

/// Thin PostgREST client. Every read and write in the scheduling engine
/// goes through here; callers pass the bearer token of the acting user
/// (or the service-role key for the background worker).
pub struct SupabaseClient {
    client: Client,
    base_url: String,
    anon_key: String,
}

impl SupabaseClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.supabase_url.clone(),
            anon_key: config.supabase_anon_key.clone(),
        }
    }

    fn get_headers(&self, auth_token: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();

        headers.insert("apikey", HeaderValue::from_str(&self.anon_key).unwrap_or_else(|_| HeaderValue::from_static("")));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(token) = auth_token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                headers.insert(AUTHORIZATION, value);
            }
        }

        headers
    }

    pub async fn request<T>(
        &self,
        method: Method,
        path: &str,
        auth_token: Option<&str>,
        body: Option<Value>,
    ) -> Result<T>
    where
        T: DeserializeOwned,
    {
        self.request_with_headers(method, path, auth_token, body, None).await
    }

    pub async fn request_with_headers<T>(
        &self,
        method: Method,
        path: &str,
        auth_token: Option<&str>,
        body: Option<Value>,
        extra_headers: Option<HeaderMap>,
    ) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!("Making request to {}", url);

        let mut headers = self.get_headers(auth_token);
        if let Some(extra) = extra_headers {
            headers.extend(extra);
        }

        let mut req = self.client.request(method, &url).headers(headers);

        if let Some(body_data) = body {
            req = req.json(&body_data);
        }

        let response = req.send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await?;
            error!("API error ({}): {}", status, error_text);

            return Err(match status.as_u16() {
                401 | 403 => anyhow!("Authentication error: {}", error_text),
                404 => anyhow!("Resource not found: {}", error_text),
                409 => anyhow!("Conflict: {}", error_text),
                _ => anyhow!("API error ({}): {}", status, error_text),
            });
        }

        // PostgREST returns an empty body for writes without a Prefer header
        let text = response.text().await?;
        if text.is_empty() {
            return serde_json::from_str("null").map_err(Into::into);
        }
        let data = serde_json::from_str::<T>(&text)?;
        Ok(data)
    }

    /// Insert a row and return the created representation.
    pub async fn insert_returning(
        &self,
        table_path: &str,
        auth_token: Option<&str>,
        body: Value,
    ) -> Result<Vec<Value>> {
        let mut headers = HeaderMap::new();
        headers.insert("Prefer", HeaderValue::from_static("return=representation"));

        self.request_with_headers(Method::POST, table_path, auth_token, Some(body), Some(headers))
            .await
    }

    /// Patch rows matching the filter path and return the updated representations.
    pub async fn patch_returning(
        &self,
        filter_path: &str,
        auth_token: Option<&str>,
        body: Value,
    ) -> Result<Vec<Value>> {
        let mut headers = HeaderMap::new();
        headers.insert("Prefer", HeaderValue::from_static("return=representation"));

        self.request_with_headers(Method::PATCH, filter_path, auth_token, Some(body), Some(headers))
            .await
    }

    pub fn get_base_url(&self) -> &str {
        &self.base_url
    }
}
