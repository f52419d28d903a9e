//! Thin REST client for the Endpoints API.
//!
//! Exactly two requests are spoken:
//!
//! - `GET /api/v1/namespaces/{ns}/endpoints/{name}` — one-shot snapshot
//! - `GET /api/v1/watch/namespaces/{ns}/endpoints/{name}` — newline-delimited
//!   JSON stream of `{type, object}` frames
//!
//! Authentication is an in-cluster service-account bearer token; trust is the
//! service-account CA bundle with TLS 1.2 as the floor.

use super::token::BearerToken;
use super::{Endpoints, EndpointsApi, EndpointsEvent, OnEvent};
use crate::errors::StatusError;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use reqwest::StatusCode;
use serde::Deserialize;
use std::env;
use std::fs;
use tracing::debug;

const SERVICE_HOST_VAR: &str = "KUBERNETES_SERVICE_HOST";
const SERVICE_PORT_VAR: &str = "KUBERNETES_SERVICE_PORT";
const TOKEN_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const CA_CERT_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";
const NAMESPACE_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// In-cluster Kubernetes API client scoped to the Endpoints resource.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    namespace: String,
    token: BearerToken,
}

// === impl ApiClient ===

impl ApiClient {
    /// Builds a client from the conventional in-cluster environment: API
    /// server address from `KUBERNETES_SERVICE_HOST`/`KUBERNETES_SERVICE_PORT`
    /// and credentials from the mounted service-account files.
    ///
    /// Fails fast on a missing environment variable or an unreadable
    /// service-account file; none of these are retried.
    pub fn in_cluster() -> Result<Self> {
        let host = env::var(SERVICE_HOST_VAR)
            .with_context(|| format!("environment variable {SERVICE_HOST_VAR} is not set"))?;
        let port = env::var(SERVICE_PORT_VAR)
            .with_context(|| format!("environment variable {SERVICE_PORT_VAR} is not set"))?;
        let base_url = if host.contains(':') {
            format!("https://[{host}]:{port}")
        } else {
            format!("https://{host}:{port}")
        };

        let ca_cert = fs::read(CA_CERT_FILE)
            .with_context(|| format!("read ca certificate file; filePath={CA_CERT_FILE:?}"))?;
        let ca_cert = reqwest::Certificate::from_pem(&ca_cert).context("parse ca certificate")?;
        let http = reqwest::Client::builder()
            .add_root_certificate(ca_cert)
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .build()
            .context("build http client")?;

        let namespace = fs::read_to_string(NAMESPACE_FILE)
            .with_context(|| format!("read namespace file; filePath={NAMESPACE_FILE:?}"))?
            .trim()
            .to_string();

        let token = BearerToken::new(TOKEN_FILE.into());
        token.get()?;

        Ok(Self {
            http,
            base_url,
            namespace,
            token,
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests(
        base_url: String,
        namespace: String,
        token_file: std::path::PathBuf,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            namespace,
            token: BearerToken::new(token_file),
        }
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        let token = self.token.get().context("get token")?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .with_context(|| format!("http get {url:?}"))?;
        if response.status() == StatusCode::UNAUTHORIZED {
            // The token may have been rotated out from under us.
            self.token.invalidate();
        }
        Ok(response)
    }

    async fn watch_once(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        on_event: OnEvent<'_>,
    ) -> Result<()> {
        let mut url = format!(
            "{}/api/v1/watch/namespaces/{namespace}/endpoints/{name}",
            self.base_url
        );
        if !resource_version.is_empty() {
            url.push_str("?resourceVersion=");
            url.push_str(resource_version);
        }

        let response = self.get(&url).await?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(StatusError {
                code: status.as_u16(),
                message: format!("http get {url:?}; statusCode={}", status.as_u16()),
            }
            .into());
        }

        let mut body = response.bytes_stream();
        let mut buffer = BytesMut::new();
        loop {
            while let Some(newline) = buffer.iter().position(|&byte| byte == b'\n') {
                let line = buffer.split_to(newline + 1);
                let line = &line[..line.len() - 1];
                if line.is_empty() {
                    continue;
                }
                match decode_frame(line)? {
                    Frame::Event(event) => {
                        if !on_event(event) {
                            return Ok(());
                        }
                    }
                    Frame::Error(status) => return Err(status.into()),
                }
            }
            match body.next().await {
                Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                Some(Err(error)) => {
                    return Err(anyhow::Error::new(error).context("read watch stream"))
                }
                None => bail!("watch stream closed; url={url:?}"),
            }
        }
    }
}

#[async_trait]
impl EndpointsApi for ApiClient {
    fn default_namespace(&self) -> &str {
        &self.namespace
    }

    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>> {
        let url = format!(
            "{}/api/v1/namespaces/{namespace}/endpoints/{name}",
            self.base_url
        );
        let response = self.get(&url).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status != StatusCode::OK {
            return Err(StatusError {
                code: status.as_u16(),
                message: format!("http get {url:?}; statusCode={}", status.as_u16()),
            }
            .into());
        }
        let body = response
            .bytes()
            .await
            .with_context(|| format!("read response body; url={url:?}"))?;
        let endpoints = serde_json::from_slice(&body).context("decode endpoints json")?;
        Ok(Some(endpoints))
    }

    async fn watch_endpoints(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        on_event: OnEvent<'_>,
    ) -> Result<()> {
        let result = self
            .watch_once(namespace, name, resource_version, on_event)
            .await;
        if resource_version.is_empty() {
            return result;
        }
        match result {
            Err(error) if is_gone(&error) => {
                debug!(
                    %namespace,
                    %name,
                    %resource_version,
                    "watch cursor expired, restarting from scratch"
                );
                // The fresh stream replays the current state, which may
                // include the exact snapshot the caller already observed.
                let mut deduplicated = |event: EndpointsEvent| {
                    if event.endpoints().metadata.resource_version.as_deref()
                        == Some(resource_version)
                    {
                        return true;
                    }
                    on_event(event)
                };
                self.watch_once(namespace, name, "", &mut deduplicated).await
            }
            result => result,
        }
    }
}

fn is_gone(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<StatusError>()
        .is_some_and(|status| status.code == StatusCode::GONE.as_u16())
}

enum Frame {
    Event(EndpointsEvent),
    Error(StatusError),
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    object: serde_json::Value,
}

fn decode_frame(line: &[u8]) -> Result<Frame> {
    let frame: RawFrame = serde_json::from_slice(line).context("decode event json")?;
    let frame = match frame.kind.as_str() {
        "ADDED" => Frame::Event(EndpointsEvent::Added(decode_endpoints(frame.object)?)),
        "MODIFIED" => Frame::Event(EndpointsEvent::Modified(decode_endpoints(frame.object)?)),
        "DELETED" => Frame::Event(EndpointsEvent::Deleted(decode_endpoints(frame.object)?)),
        "ERROR" => {
            let status: Status =
                serde_json::from_value(frame.object).context("decode status json")?;
            Frame::Error(StatusError {
                code: status
                    .code
                    .and_then(|code| u16::try_from(code).ok())
                    .unwrap_or_default(),
                message: status.message.unwrap_or_default(),
            })
        }
        kind => bail!("unexpected event type {kind:?}"),
    };
    Ok(frame)
}

fn decode_endpoints(object: serde_json::Value) -> Result<Endpoints> {
    serde_json::from_value(object).context("decode endpoints json")
}
