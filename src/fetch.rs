use crate::config::{LoadedConfig, RenderMode, Secrets, resolve_path};
use anyhow::{Context, Result};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use scraper::{Html, Selector};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

const SERVICE_SLACK: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timed out after {waited_ms} ms waiting for `{selector}` on {url}")]
    Timeout {
        url: String,
        selector: String,
        waited_ms: u64,
    },
    #[error("{url} returned HTTP {status}")]
    Http { url: String, status: u16 },
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("invalid ready selector `{0}`")]
    InvalidSelector(String),
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Timeout { .. })
    }
}

/// Source of rendered pages. Each call is an independent session.
pub trait PageFetcher {
    fn fetch_rendered(
        &self,
        url: &str,
        ready_selector: &str,
        timeout: Duration,
    ) -> Result<String, FetchError>;

    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

pub fn html_has_selector(html: &str, selector: &str) -> Result<bool, FetchError> {
    let parsed = Selector::parse(selector)
        .map_err(|_| FetchError::InvalidSelector(selector.to_string()))?;
    let document = Html::parse_document(html);
    Ok(document.select(&parsed).next().is_some())
}

pub fn build_fetcher(loaded: &LoadedConfig, secrets: &Secrets) -> Result<Box<dyn PageFetcher>> {
    let render = &loaded.config.render;
    let fetcher: Box<dyn PageFetcher> = match render.mode {
        RenderMode::Service => {
            let endpoint = render
                .endpoint
                .as_deref()
                .context("render.endpoint missing for service mode")?;
            Box::new(ServiceRenderer::new(
                endpoint,
                secrets.render_token.clone(),
                render.user_agent.as_deref(),
            )?)
        }
        RenderMode::Direct => Box::new(DirectFetcher::new(
            Duration::from_millis(render.poll_interval_ms),
            render.user_agent.as_deref(),
        )?),
        RenderMode::File => Box::new(FileFetcher::new(&loaded.path)),
    };
    info!(mode = ?render.mode, "page fetcher ready");
    Ok(fetcher)
}

fn build_client(timeout: Option<Duration>, user_agent: Option<&str>) -> Result<Client> {
    let mut headers = HeaderMap::new();
    if let Some(user_agent) = user_agent {
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(user_agent).context("invalid render.user_agent")?,
        );
    }
    let mut builder = Client::builder().default_headers(headers);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder.build().context("failed to build reqwest client")
}

fn download(client: &Client, url: &str) -> Result<Vec<u8>, FetchError> {
    let response = client.get(url).send().map_err(|source| FetchError::Request {
        url: url.to_string(),
        source,
    })?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Http {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    let bytes = response.bytes().map_err(|source| FetchError::Request {
        url: url.to_string(),
        source,
    })?;
    debug!(%url, bytes = bytes.len(), "downloaded bytes");
    Ok(bytes.to_vec())
}

fn ensure_ready(
    html: String,
    url: &str,
    selector: &str,
    started: Instant,
) -> Result<String, FetchError> {
    if html_has_selector(&html, selector)? {
        Ok(html)
    } else {
        Err(FetchError::Timeout {
            url: url.to_string(),
            selector: selector.to_string(),
            waited_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// Headless render service that accepts `{url, waitForSelector}` and
/// answers with the rendered document.
pub struct ServiceRenderer {
    client: Client,
    endpoint: String,
    token: Option<String>,
}

impl ServiceRenderer {
    pub fn new(endpoint: &str, token: Option<String>, user_agent: Option<&str>) -> Result<Self> {
        Ok(Self {
            client: build_client(None, user_agent)?,
            endpoint: endpoint.to_string(),
            token,
        })
    }
}

impl PageFetcher for ServiceRenderer {
    fn fetch_rendered(
        &self,
        url: &str,
        ready_selector: &str,
        timeout: Duration,
    ) -> Result<String, FetchError> {
        let started = Instant::now();
        let timeout_err = || FetchError::Timeout {
            url: url.to_string(),
            selector: ready_selector.to_string(),
            waited_ms: started.elapsed().as_millis() as u64,
        };

        let body = json!({
            "url": url,
            "waitForSelector": {
                "selector": ready_selector,
                "timeout": timeout.as_millis() as u64,
            },
        });
        let mut request = self
            .client
            .post(&self.endpoint)
            .timeout(timeout + SERVICE_SLACK)
            .json(&body);
        if let Some(token) = &self.token {
            request = request.query(&[("token", token)]);
        }

        let response = match request.send() {
            Ok(response) => response,
            Err(err) if err.is_timeout() => return Err(timeout_err()),
            Err(source) => {
                return Err(FetchError::Request {
                    url: url.to_string(),
                    source,
                });
            }
        };

        let status = response.status();
        if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
            return Err(timeout_err());
        }
        if !status.is_success() {
            return Err(FetchError::Http {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let html = response.text().map_err(|source| FetchError::Request {
            url: url.to_string(),
            source,
        })?;
        info!(%url, bytes = html.len(), elapsed_ms = started.elapsed().as_millis() as u64, "rendered page");
        ensure_ready(html, url, ready_selector, started)
    }

    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        download(&self.client, url)
    }
}

/// Plain GET polled until the ready selector shows up in the markup.
pub struct DirectFetcher {
    client: Client,
    poll_interval: Duration,
}

impl DirectFetcher {
    pub fn new(poll_interval: Duration, user_agent: Option<&str>) -> Result<Self> {
        Ok(Self {
            client: build_client(Some(Duration::from_secs(30)), user_agent)?,
            poll_interval,
        })
    }
}

impl PageFetcher for DirectFetcher {
    fn fetch_rendered(
        &self,
        url: &str,
        ready_selector: &str,
        timeout: Duration,
    ) -> Result<String, FetchError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.client.get(url).send() {
                Ok(response) => {
                    let status = response.status();
                    if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
                        return Err(FetchError::Http {
                            url: url.to_string(),
                            status: status.as_u16(),
                        });
                    }
                    if status.is_success() {
                        let html = response.text().map_err(|source| FetchError::Request {
                            url: url.to_string(),
                            source,
                        })?;
                        if html_has_selector(&html, ready_selector)? {
                            info!(%url, attempt, bytes = html.len(), "fetched page");
                            return Ok(html);
                        }
                        debug!(%url, attempt, selector = %ready_selector, "ready selector not present yet");
                    } else {
                        warn!(%url, %status, attempt, "page request failed; polling again");
                    }
                }
                Err(err) => {
                    warn!(%url, attempt, error = %err, "page request errored; polling again");
                }
            }

            if Instant::now() + self.poll_interval >= deadline {
                return Err(FetchError::Timeout {
                    url: url.to_string(),
                    selector: ready_selector.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        download(&self.client, url)
    }
}

/// Reads pages from disk, resolving relative paths against the config file.
pub struct FileFetcher {
    config_path: PathBuf,
}

impl FileFetcher {
    pub fn new(config_path: &Path) -> Self {
        Self {
            config_path: config_path.to_path_buf(),
        }
    }

    fn read(&self, location: &str) -> Result<Vec<u8>, FetchError> {
        let raw = location.strip_prefix("file://").unwrap_or(location);
        let resolved = resolve_path(&self.config_path, Path::new(raw)).map_err(|err| {
            FetchError::Io {
                path: raw.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, err.to_string()),
            }
        })?;
        std::fs::read(&resolved).map_err(|source| FetchError::Io {
            path: resolved.display().to_string(),
            source,
        })
    }
}

impl PageFetcher for FileFetcher {
    fn fetch_rendered(
        &self,
        url: &str,
        ready_selector: &str,
        _timeout: Duration,
    ) -> Result<String, FetchError> {
        let started = Instant::now();
        let bytes = self.read(url)?;
        let html = String::from_utf8_lossy(&bytes).into_owned();
        info!(file = %url, bytes = html.len(), "loaded page from file");
        ensure_ready(html, url, ready_selector, started)
    }

    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.read(url)
    }
}
