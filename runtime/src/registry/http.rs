//! OCI distribution v2 over HTTP.
//!
//! Anonymous requests first; on a 401 the `WWW-Authenticate` challenge is
//! answered with a bearer token (fetched with basic credentials when
//! available) or with basic auth, and the request is sent once more.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dockling_core::error::{DocklingError, Result};
use dockling_core::EngineConfig;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;

use super::credentials::{Credential, CredentialStore};
use super::manifest::ACCEPTED_MANIFESTS;
use super::transport::{ManifestResponse, RegistryTransport};
use crate::digest::Digest;
use crate::image::ImageReference;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Challenge {
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
    Basic,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

#[derive(Debug, Clone)]
enum Authorization {
    Bearer(String),
    Basic(Credential),
}

/// HTTP(S) registry transport.
pub struct HttpTransport {
    client: Client,
    config: EngineConfig,
    credentials: CredentialStore,
    /// `registry/repository` -> authorization that last worked
    auth: DashMap<String, Authorization>,
}

impl HttpTransport {
    pub fn new(config: &EngineConfig, credentials: CredentialStore) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("dockling/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| DocklingError::Other(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            config: config.clone(),
            credentials,
            auth: DashMap::new(),
        })
    }

    fn base_url(&self, image: &ImageReference) -> String {
        let host = image.api_host();
        let scheme = if self.config.is_insecure(&image.registry) {
            "http"
        } else {
            "https"
        };
        format!("{}://{}/v2/{}", scheme, host, image.repository)
    }

    fn network_error(image: &ImageReference, e: reqwest::Error) -> DocklingError {
        DocklingError::NetworkError {
            registry: image.registry.clone(),
            message: e.to_string(),
        }
    }

    /// Send a request, answering one authentication challenge if needed.
    async fn send<F>(&self, image: &ImageReference, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let key = format!("{}/{}", image.registry, image.repository);
        let cached = self.auth.get(&key).map(|a| a.value().clone());

        let response = authorize(build(&self.client), cached.as_ref())
            .send()
            .await
            .map_err(|e| Self::network_error(image, e))?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(challenge) = parse_challenge(response.headers()) else {
            return Err(auth_error(image, "registry requires authentication"));
        };
        let credential = self.credentials.resolve(&image.registry);
        let authorization = match challenge {
            Challenge::Basic => Authorization::Basic(
                credential.ok_or_else(|| auth_error(image, "credentials required"))?,
            ),
            Challenge::Bearer {
                realm,
                service,
                scope,
            } => {
                let scope = scope.unwrap_or_else(|| {
                    format!("repository:{}:pull,push", image.repository)
                });
                let token = self
                    .fetch_token(image, &realm, service.as_deref(), &scope, credential.as_ref())
                    .await?;
                Authorization::Bearer(token)
            }
        };

        tracing::debug!(registry = %image.registry, repository = %image.repository, "Retrying request with credentials");
        let response = authorize(build(&self.client), Some(&authorization))
            .send()
            .await
            .map_err(|e| Self::network_error(image, e))?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(auth_error(image, "credentials rejected"));
        }
        self.auth.insert(key, authorization);
        Ok(response)
    }

    async fn fetch_token(
        &self,
        image: &ImageReference,
        realm: &str,
        service: Option<&str>,
        scope: &str,
        credential: Option<&Credential>,
    ) -> Result<String> {
        let mut query: Vec<(&str, &str)> = vec![("scope", scope)];
        if let Some(service) = service {
            query.push(("service", service));
        }
        let mut request = self.client.get(realm).query(&query);
        if let Some(credential) = credential {
            request = request.basic_auth(&credential.username, Some(&credential.password));
        }

        let response = request
            .send()
            .await
            .map_err(|e| Self::network_error(image, e))?;
        let status = response.status();
        if status.is_server_error() {
            return Err(DocklingError::NetworkError {
                registry: image.registry.clone(),
                message: format!("token service returned {}", status),
            });
        }
        if !status.is_success() {
            return Err(auth_error(image, &format!("token request failed with {}", status)));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| auth_error(image, &format!("malformed token response: {}", e)))?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| auth_error(image, "token response carried no token"))
    }
}

fn authorize(request: RequestBuilder, authorization: Option<&Authorization>) -> RequestBuilder {
    match authorization {
        Some(Authorization::Bearer(token)) => request.bearer_auth(token),
        Some(Authorization::Basic(c)) => request.basic_auth(&c.username, Some(&c.password)),
        None => request,
    }
}

fn auth_error(image: &ImageReference, message: &str) -> DocklingError {
    DocklingError::AuthError {
        registry: image.registry.clone(),
        message: message.to_string(),
    }
}

/// Parse `Bearer realm="...",service="...",scope="..."` or `Basic ...`.
fn parse_challenge(headers: &HeaderMap) -> Option<Challenge> {
    let header = headers.get(WWW_AUTHENTICATE)?.to_str().ok()?.trim();
    let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));

    if scheme.eq_ignore_ascii_case("basic") {
        return Some(Challenge::Basic);
    }
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let mut values = HashMap::new();
    let mut rest = params;
    while let Some((key, tail)) = rest.split_once('=') {
        let key = key.trim().trim_start_matches(',').trim();
        let tail = tail.trim_start();
        let (value, next) = match tail.strip_prefix('"') {
            Some(quoted) => match quoted.split_once('"') {
                Some((value, next)) => (value, next),
                None => (quoted, ""),
            },
            None => tail.split_once(',').unwrap_or((tail, "")),
        };
        values.insert(key.to_ascii_lowercase(), value.to_string());
        rest = next;
    }

    Some(Challenge::Bearer {
        realm: values.remove("realm")?,
        service: values.remove("service"),
        scope: values.remove("scope"),
    })
}

/// Map a response status to the error taxonomy.
async fn check(image: &ImageReference, response: Response, kind: &'static str, id: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let detail = format!("{} {}: {}", status, id, body.trim());
    Err(match status {
        StatusCode::NOT_FOUND => DocklingError::not_found(kind, id),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => auth_error(image, &detail),
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::REQUEST_TIMEOUT
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT
        | StatusCode::INTERNAL_SERVER_ERROR => DocklingError::NetworkError {
            registry: image.registry.clone(),
            message: detail,
        },
        _ => DocklingError::RegistryError {
            registry: image.registry.clone(),
            message: detail,
        },
    })
}

/// Resolve an upload `Location` against the registry and add the digest.
fn upload_url(base: &str, location: &str, digest: &Digest) -> String {
    let absolute = if location.starts_with("http://") || location.starts_with("https://") {
        location.to_string()
    } else {
        // base is scheme://host/v2/<repo>; keep scheme://host
        let origin_end = base
            .find("://")
            .and_then(|i| base[i + 3..].find('/').map(|j| i + 3 + j))
            .unwrap_or(base.len());
        format!("{}{}", &base[..origin_end], location)
    };
    let separator = if absolute.contains('?') { '&' } else { '?' };
    format!("{}{}digest={}", absolute, separator, digest)
}

#[async_trait]
impl RegistryTransport for HttpTransport {
    async fn blob_exists(&self, image: &ImageReference, digest: &Digest) -> Result<bool> {
        let url = format!("{}/blobs/{}", self.base_url(image), digest);
        let response = self.send(image, |c| c.head(&url)).await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => check(image, response, "blob", digest.as_str()).await.map(|_| true),
        }
    }

    async fn get_blob(&self, image: &ImageReference, digest: &Digest) -> Result<Vec<u8>> {
        let url = format!("{}/blobs/{}", self.base_url(image), digest);
        let response = self.send(image, |c| c.get(&url)).await?;
        let response = check(image, response, "blob", digest.as_str()).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Self::network_error(image, e))?;
        Ok(bytes.to_vec())
    }

    async fn put_blob(&self, image: &ImageReference, digest: &Digest, data: Vec<u8>) -> Result<()> {
        let base = self.base_url(image);
        let start = format!("{}/blobs/uploads/", base);
        let response = self
            .send(image, |c| c.post(&start).header(CONTENT_LENGTH, 0))
            .await?;
        let response = check(image, response, "upload", digest.as_str()).await?;
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| DocklingError::RegistryError {
                registry: image.registry.clone(),
                message: "upload response has no Location header".to_string(),
            })?
            .to_string();

        let url = upload_url(&base, &location, digest);
        let size = data.len();
        let response = self
            .send(image, |c| {
                c.put(&url)
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .header(CONTENT_LENGTH, size)
                    .body(data.clone())
            })
            .await?;
        check(image, response, "upload", digest.as_str()).await?;
        tracing::debug!(digest = %digest, size, "Uploaded blob");
        Ok(())
    }

    async fn get_manifest(&self, image: &ImageReference, reference: &str) -> Result<ManifestResponse> {
        let url = format!("{}/manifests/{}", self.base_url(image), reference);
        let accept = ACCEPTED_MANIFESTS.join(", ");
        let response = self
            .send(image, |c| c.get(&url).header(ACCEPT, accept.as_str()))
            .await?;
        let response = check(image, response, "manifest", &format!("{}:{}", image.repository, reference)).await?;
        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .unwrap_or_default();
        let body = response
            .bytes()
            .await
            .map_err(|e| Self::network_error(image, e))?
            .to_vec();
        Ok(ManifestResponse { media_type, body })
    }

    async fn put_manifest(
        &self,
        image: &ImageReference,
        reference: &str,
        media_type: &str,
        body: Vec<u8>,
    ) -> Result<()> {
        let url = format!("{}/manifests/{}", self.base_url(image), reference);
        let response = self
            .send(image, |c| {
                c.put(&url)
                    .header(CONTENT_TYPE, media_type)
                    .body(body.clone())
            })
            .await?;
        check(image, response, "manifest", reference).await?;
        Ok(())
    }
}
