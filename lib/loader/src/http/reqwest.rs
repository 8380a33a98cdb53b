use std::{env, time::Duration};

use anyhow::Context;

use super::{HttpClient, HttpRequest, HttpResponse, USER_AGENT};

/// The [`HttpClient`] used outside of tests.
///
/// One connection pool is shared by every request so that the metadata query
/// and the artifact download can reuse a kept-alive connection.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: reqwest::blocking::Client,
}

impl ReqwestHttpClient {
    pub fn new(connect_timeout: Duration) -> Result<Self, anyhow::Error> {
        let builder = reqwest::blocking::Client::builder()
            .connect_timeout(connect_timeout)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .user_agent(USER_AGENT);

        let builder = match proxy_from_env().context("Invalid proxy settings")? {
            Some(proxy) => builder.proxy(proxy),
            None => builder,
        };

        let client = builder
            .build()
            .context("Could not create reqwest client")?;

        Ok(ReqwestHttpClient { client })
    }

    /// Wrap a client that was configured elsewhere.
    pub fn from_client(client: reqwest::blocking::Client) -> Self {
        ReqwestHttpClient { client }
    }
}

impl HttpClient for ReqwestHttpClient {
    fn request(&self, request: HttpRequest) -> Result<HttpResponse, anyhow::Error> {
        let method = reqwest::Method::try_from(request.method.as_str())
            .with_context(|| format!("Invalid http method {}", request.method))?;

        let mut builder = self.client.request(method, request.url.as_str());
        for (header, val) in &request.headers {
            builder = builder.header(header, val);
        }
        if let Some(timeout) = request.options.read_timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder
            .send()
            .with_context(|| format!("{} {} failed", request.method, request.url))?;

        let status = response.status();

        Ok(HttpResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            body: Box::new(response),
        })
    }
}

/// Pick up a proxy from `ALL_PROXY`, `HTTPS_PROXY` or `HTTP_PROXY` (upper or
/// lower case, in that order). Hosts listed in `NO_PROXY` bypass it.
fn proxy_from_env() -> Result<Option<reqwest::Proxy>, reqwest::Error> {
    let lookup = |name: &str| {
        env::var(name)
            .or_else(|_| env::var(name.to_lowercase()))
            .ok()
            .filter(|v| !v.trim().is_empty())
    };

    if let Some(url) = lookup("ALL_PROXY") {
        tracing::debug!(proxy.url = %url, "Using ALL_PROXY");
        return reqwest::Proxy::all(url).map(|p| Some(p.no_proxy(reqwest::NoProxy::from_env())));
    }
    if let Some(url) = lookup("HTTPS_PROXY") {
        tracing::debug!(proxy.url = %url, "Using HTTPS_PROXY");
        return reqwest::Proxy::https(url).map(|p| Some(p.no_proxy(reqwest::NoProxy::from_env())));
    }
    if let Some(url) = lookup("HTTP_PROXY") {
        tracing::debug!(proxy.url = %url, "Using HTTP_PROXY");
        return reqwest::Proxy::http(url).map(|p| Some(p.no_proxy(reqwest::NoProxy::from_env())));
    }

    Ok(None)
}
