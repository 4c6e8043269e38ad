//! Authenticated HTTP access to Elastic APIs.
//!
//! Providers talk to Elasticsearch, Kibana, Fleet Server, Elastic Cloud and
//! the serverless control plane through [`ResourceClient`], which returns the
//! raw status and body. Interpreting status codes is up to the caller.

use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::{Certificate, Client, Method};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// One API call, relative to the client's base address.
#[derive(Debug, Clone)]
pub struct ResourceRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
    pub headers: Vec<(String, String)>,
    /// Sent as `multipart/form-data` instead of the JSON body.
    pub file: Option<FilePart>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    pub field: String,
    pub file_name: String,
    pub content: Vec<u8>,
}

impl ResourceRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        ResourceRequest {
            method,
            path: path.into(),
            body: None,
            headers: Vec::new(),
            file: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn file(mut self, field: impl Into<String>, file_name: impl Into<String>, content: Vec<u8>) -> Self {
        self.file = Some(FilePart {
            field: field.into(),
            file_name: file_name.into(),
            content,
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl ResourceResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        ResourceResponse {
            status,
            body: body.into(),
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Fails with [`Error::Api`] unless the status is one of `accepted`.
    pub fn expect(self, accepted: &[u16], context: &str) -> Result<Self> {
        if accepted.contains(&self.status) {
            Ok(self)
        } else {
            Err(Error::Api {
                context: context.to_string(),
                status: self.status,
                body: self.text(),
            })
        }
    }
}

#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Base address requests are resolved against.
    fn address(&self) -> &str;

    async fn send(&self, ctx: &CancellationToken, request: ResourceRequest) -> Result<ResourceResponse>;
}

/// Everything needed to open a client to one service.
#[derive(Debug, Clone, Default)]
pub struct ClientSpec {
    pub address: String,
    pub auth: Auth,
    pub ca_cert: Option<PathBuf>,
    pub headers: Vec<(String, String)>,
}

impl ClientSpec {
    pub fn new(address: impl Into<String>) -> Self {
        ClientSpec {
            address: address.into(),
            ..Default::default()
        }
    }

    /// API key wins over username and password when both are set.
    pub fn credentials(mut self, api_key: &str, username: &str, password: &str) -> Self {
        self.auth = if !api_key.is_empty() {
            Auth::ApiKey(api_key.to_string())
        } else if !username.is_empty() {
            Auth::Basic {
                username: username.to_string(),
                password: password.to_string(),
            }
        } else {
            Auth::None
        };
        self
    }

    pub fn api_key(mut self, api_key: &str) -> Self {
        self.auth = Auth::ApiKey(api_key.to_string());
        self
    }

    pub fn ca_cert(mut self, path: Option<PathBuf>) -> Self {
        self.ca_cert = path.filter(|p| !p.as_os_str().is_empty());
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// Opens resource clients; lets callers swap the network for a fake.
pub trait ClientFactory: Send + Sync {
    fn client(&self, spec: ClientSpec) -> Result<Arc<dyn ResourceClient>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HttpClientFactory;

impl ClientFactory for HttpClientFactory {
    fn client(&self, spec: ClientSpec) -> Result<Arc<dyn ResourceClient>> {
        let mut builder = HttpResourceClient::builder(spec.address).ca_cert(spec.ca_cert.as_deref());
        builder.auth = spec.auth;
        for (name, value) in &spec.headers {
            builder = builder.header(name, value);
        }
        Ok(Arc::new(builder.build()?))
    }
}

#[derive(Debug, Clone, Default)]
pub enum Auth {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
    ApiKey(String),
}

/// [`ResourceClient`] backed by reqwest.
#[derive(Debug, Clone)]
pub struct HttpResourceClient {
    address: String,
    base: Url,
    client: Client,
    auth: Auth,
    default_headers: Vec<(String, String)>,
}

impl HttpResourceClient {
    pub fn builder(address: impl Into<String>) -> HttpResourceClientBuilder {
        HttpResourceClientBuilder {
            address: address.into(),
            auth: Auth::None,
            ca_cert: None,
            skip_tls_verify: false,
            default_headers: Vec::new(),
        }
    }

    fn url_for(&self, path: &str) -> Result<Url> {
        let (path, query) = match path.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (path, None),
        };
        let mut url = self.base.clone();
        let joined = format!(
            "{}/{}",
            url.path().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        url.set_path(&joined);
        url.set_query(query);
        Ok(url)
    }
}

pub struct HttpResourceClientBuilder {
    address: String,
    auth: Auth,
    ca_cert: Option<PathBuf>,
    skip_tls_verify: bool,
    default_headers: Vec<(String, String)>,
}

impl HttpResourceClientBuilder {
    pub fn basic_auth(mut self, username: &str, password: &str) -> Self {
        if !username.is_empty() {
            self.auth = Auth::Basic {
                username: username.to_string(),
                password: password.to_string(),
            };
        }
        self
    }

    pub fn api_key(mut self, api_key: &str) -> Self {
        if !api_key.is_empty() {
            self.auth = Auth::ApiKey(api_key.to_string());
        }
        self
    }

    /// Credentials with API key precedence, as the stack config stores both.
    pub fn credentials(self, api_key: &str, username: &str, password: &str) -> Self {
        if !api_key.is_empty() {
            self.api_key(api_key)
        } else {
            self.basic_auth(username, password)
        }
    }

    pub fn ca_cert(mut self, path: Option<&Path>) -> Self {
        self.ca_cert = path.filter(|p| !p.as_os_str().is_empty()).map(Path::to_path_buf);
        self
    }

    pub fn skip_tls_verify(mut self, skip: bool) -> Self {
        self.skip_tls_verify = skip;
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.default_headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn build(self) -> Result<HttpResourceClient> {
        let base = Url::parse(&self.address)
            .map_err(|e| Error::Config(format!("invalid address '{}': {}", self.address, e)))?;
        match base.scheme() {
            "http" | "https" => {}
            other => {
                return Err(Error::Config(format!(
                    "unsupported scheme '{}' in address '{}'",
                    other, self.address
                )))
            }
        }

        let mut builder = Client::builder().timeout(REQUEST_TIMEOUT);
        if let Some(path) = &self.ca_cert {
            let pem = std::fs::read(path).map_err(|e| {
                Error::Certificate(format!("reading CA certificate {}: {}", path.display(), e))
            })?;
            builder = builder.add_root_certificate(Certificate::from_pem(&pem)?);
        }
        if self.skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        Ok(HttpResourceClient {
            address: self.address,
            base,
            client: builder.build()?,
            auth: self.auth,
            default_headers: self.default_headers,
        })
    }
}

#[async_trait]
impl ResourceClient for HttpResourceClient {
    fn address(&self) -> &str {
        &self.address
    }

    async fn send(&self, ctx: &CancellationToken, request: ResourceRequest) -> Result<ResourceResponse> {
        let url = self.url_for(&request.path)?;
        tracing::trace!(method = %request.method, url = %url, "sending request");

        let mut builder = self.client.request(request.method, url);
        builder = match &self.auth {
            Auth::None => builder,
            Auth::Basic { username, password } => builder.basic_auth(username, Some(password)),
            Auth::ApiKey(key) => builder.header("Authorization", format!("ApiKey {}", key)),
        };
        for (name, value) in self.default_headers.iter().chain(request.headers.iter()) {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(file) = request.file {
            let part = reqwest::multipart::Part::bytes(file.content).file_name(file.file_name);
            builder = builder.multipart(reqwest::multipart::Form::new().part(file.field, part));
        } else if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let exchange = async {
            let response = builder.send().await?;
            let status = response.status().as_u16();
            let body = response.bytes().await?.to_vec();
            Ok::<_, reqwest::Error>(ResourceResponse { status, body })
        };
        tokio::select! {
            _ = ctx.cancelled() => Err(Error::Cancelled),
            response = exchange => Ok(response?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_join_base_path_and_keep_query() {
        let client = HttpResourceClient::builder("https://kibana:5601/base/")
            .build()
            .unwrap();
        let url = client
            .url_for("/api/fleet/agents?kuery=policy_id: x")
            .unwrap();
        assert_eq!(url.path(), "/base/api/fleet/agents");
        assert!(url.query().unwrap().starts_with("kuery=policy_id"));
    }

    #[test]
    fn rejects_non_http_addresses() {
        assert!(HttpResourceClient::builder("ftp://host").build().is_err());
        assert!(HttpResourceClient::builder("not a url").build().is_err());
    }

    #[test]
    fn expect_maps_unexpected_status() {
        let resp = ResourceResponse::new(404, "missing");
        let err = resp.expect(&[200], "could not get project").unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(
            err.to_string(),
            "could not get project: unexpected status code 404: missing"
        );
        assert!(ResourceResponse::new(201, "").expect(&[200, 201], "x").is_ok());
    }
}
