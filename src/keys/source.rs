//! Certificate sources

use super::{KeyFetchError, KeySource};
use crate::constants::CONTROLLER_CERT_PATH;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Certificate location selected by `--cert`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertLocation {
    /// The controller Service, reached through the API server proxy
    Controller,
    File(PathBuf),
    Url(String),
}

impl CertLocation {
    /// Interpret a `--cert` value; unset or blank means the controller Service
    pub fn from_arg(cert: Option<&str>) -> Self {
        match cert.map(str::trim).filter(|c| !c.is_empty()) {
            None => CertLocation::Controller,
            Some(url) if url.starts_with("http://") || url.starts_with("https://") => {
                CertLocation::Url(url.to_string())
            }
            Some(path) => CertLocation::File(PathBuf::from(path)),
        }
    }
}

/// Fetches `/v1/cert.pem` from the sealed-secrets controller Service
#[derive(Clone)]
pub struct ControllerServiceSource {
    client: kube::Client,
    service_name: String,
}

impl std::fmt::Debug for ControllerServiceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerServiceSource")
            .field("service_name", &self.service_name)
            .finish_non_exhaustive()
    }
}

impl ControllerServiceSource {
    pub fn new(client: kube::Client, service_name: impl Into<String>) -> Self {
        Self {
            client,
            service_name: service_name.into(),
        }
    }

    fn proxy_path(&self, controller_namespace: &str) -> String {
        service_proxy_path(controller_namespace, &self.service_name)
    }
}

/// API server proxy path of the controller certificate endpoint
pub(crate) fn service_proxy_path(controller_namespace: &str, service_name: &str) -> String {
    format!(
        "/api/v1/namespaces/{controller_namespace}/services/http:{service_name}:/proxy{CONTROLLER_CERT_PATH}"
    )
}

#[async_trait]
impl KeySource for ControllerServiceSource {
    async fn fetch_pem(&self, controller_namespace: &str) -> Result<Vec<u8>, KeyFetchError> {
        let path = self.proxy_path(controller_namespace);
        debug!(path = %path, "Fetching controller certificate through service proxy");
        let request = http::Request::get(&path)
            .body(Vec::new())
            .map_err(|e| KeyFetchError::Unreachable {
                source_desc: self.describe(controller_namespace),
                message: e.to_string(),
            })?;
        self.client
            .request_text(request)
            .await
            .map(String::into_bytes)
            .map_err(|e| KeyFetchError::Unreachable {
                source_desc: self.describe(controller_namespace),
                message: e.to_string(),
            })
    }

    fn describe(&self, controller_namespace: &str) -> String {
        format!("service {controller_namespace}/{}", self.service_name)
    }
}

/// Reads a PEM certificate from disk
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl KeySource for FileSource {
    async fn fetch_pem(&self, _controller_namespace: &str) -> Result<Vec<u8>, KeyFetchError> {
        tokio::fs::read(&self.path)
            .await
            .map_err(|e| KeyFetchError::Io {
                path: self.path.display().to_string(),
                message: e.to_string(),
            })
    }

    fn describe(&self, _controller_namespace: &str) -> String {
        format!("file {}", self.path.display())
    }
}

/// Downloads a PEM certificate over HTTP(S)
#[derive(Debug, Clone)]
pub struct UrlSource {
    url: String,
    timeout: Duration,
}

impl UrlSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }

    fn unreachable(&self, message: impl ToString) -> KeyFetchError {
        KeyFetchError::Unreachable {
            source_desc: format!("url {}", self.url),
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl KeySource for UrlSource {
    async fn fetch_pem(&self, _controller_namespace: &str) -> Result<Vec<u8>, KeyFetchError> {
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| self.unreachable(e))?;
        let response = client
            .get(&self.url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| self.unreachable(e))?;
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| self.unreachable(e))
    }

    fn describe(&self, _controller_namespace: &str) -> String {
        format!("url {}", self.url)
    }
}
