use anyhow::{Context, Result, anyhow};
use reqwest::Method;
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use serde::de::DeserializeOwned;
use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "https://www.googleapis.com/";

#[derive(Debug)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

pub struct GoogleClient {
    client: Client,
    endpoint: String,
}

impl GoogleClient {
    pub fn new(endpoint: String, timeout: Option<u64>) -> Result<Self> {
        let mut builder = Client::builder().user_agent(concat!("gapi/", env!("CARGO_PKG_VERSION")));
        // reqwest's blocking client defaults to 30s; the CLI waits indefinitely unless asked.
        builder = match timeout {
            Some(seconds) => builder.timeout(Duration::from_secs(seconds)),
            None => builder.timeout(None),
        };
        let client = builder.build().context("build http client")?;
        Ok(Self { client, endpoint })
    }

    /// Joins a discovery-relative path onto the configured endpoint.
    pub fn build_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = self.endpoint.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            return base.to_string();
        }
        format!("{}/{}", base, path)
    }

    pub fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.build_url(path);
        log::debug!("fetch {}", url);
        let resp = self
            .client
            .get(&url)
            .send()
            .with_context(|| format!("error getting {url}"))?;
        decode_json(resp)
    }

    pub fn post_form<T: DeserializeOwned>(&self, url: &str, fields: &[(&str, &str)]) -> Result<T> {
        log::debug!("post form {}", url);
        let resp = self
            .client
            .post(url)
            .form(fields)
            .send()
            .with_context(|| format!("error posting to {url}"))?;
        decode_json(resp)
    }

    pub fn post_empty<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        log::debug!("post {}", url);
        let resp = self
            .client
            .post(url)
            .send()
            .with_context(|| format!("error posting to {url}"))?;
        decode_json(resp)
    }

    pub fn get_status(&self, url: &str) -> Result<StatusCode> {
        log::debug!("get {}", url);
        let resp = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("error getting {url}"))?;
        Ok(resp.status())
    }

    /// Sends the bound API request and returns the raw response regardless of status.
    pub fn execute(
        &self,
        method: &str,
        url: &str,
        token: Option<&str>,
        body: Option<Vec<u8>>,
    ) -> Result<ApiResponse> {
        let method: Method = method
            .to_ascii_uppercase()
            .parse()
            .map_err(|_| anyhow!("unsupported method {method}"))?;

        let mut request = self.client.request(method.clone(), url);
        if let Some(token) = token {
            request = apply_bearer(request, token)?;
        }
        if let Some(body) = body {
            request = request
                .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
                .body(body);
        }

        log::debug!("request {} {}", method, url);
        let resp = request.send().context("error making request")?;
        let status = resp.status();
        let body = resp.bytes().context("read response body")?.to_vec();
        log::debug!("response {} ({} bytes)", status, body.len());
        Ok(ApiResponse { status, body })
    }
}

fn apply_bearer(req: RequestBuilder, token: &str) -> Result<RequestBuilder> {
    let value =
        HeaderValue::from_str(&format!("Bearer {}", token)).context("invalid bearer token")?;
    Ok(req.header(AUTHORIZATION, value))
}

fn decode_json<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    let text = resp.text().context("read response body")?;
    if !status.is_success() {
        return Err(anyhow!("http {}: {}", status, text.trim()));
    }
    serde_json::from_str(&text).context("error decoding JSON")
}
