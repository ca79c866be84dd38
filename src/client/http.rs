//! `reqwest` backed member connections

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{Connection, ConnectionError, ConnectionFactory, JwtAuthentication, Request, Response};

#[derive(Debug)]
struct CachedToken {
    value: String,
    renew_at: Instant,
}

/// Connection to one member endpoint
#[derive(Debug)]
pub struct HttpConnection {
    endpoint: String,
    client: reqwest::Client,
    timeout: Duration,
    auth: Option<JwtAuthentication>,
    token: Mutex<Option<CachedToken>>,
}

impl HttpConnection {
    pub fn new(
        endpoint: impl Into<String>,
        client: reqwest::Client,
        timeout: Duration,
        auth: Option<JwtAuthentication>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            client,
            timeout,
            auth,
            token: Mutex::new(None),
        }
    }

    /// Current bearer token, signing a new one when missing, expiring or forced
    fn bearer(&self, force: bool) -> Result<Option<String>, ConnectionError> {
        let Some(auth) = &self.auth else {
            return Ok(None);
        };
        let mut token = self.token.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match token.as_ref() {
            Some(cached) if !force && now < cached.renew_at => Ok(Some(cached.value.clone())),
            _ => {
                let value = auth.sign()?;
                // renewed halfway through the token lifetime
                *token = Some(CachedToken {
                    value: value.clone(),
                    renew_at: now + auth.ttl() / 2,
                });
                Ok(Some(value))
            }
        }
    }

    async fn send(&self, request: &Request, force_token: bool) -> Result<Response, ConnectionError> {
        let url = format!("{}{}", self.endpoint, request.path);
        let mut builder = self.client.request(request.method.clone(), &url);
        if let Some(token) = self.bearer(force_token)? {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = tokio::time::timeout(self.timeout, builder.send()).await??;
        let status = response.status().as_u16();
        let bytes = tokio::time::timeout(self.timeout, response.bytes()).await??;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        Ok(Response { status, body })
    }
}

#[async_trait]
impl Connection for HttpConnection {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn request(&self, request: Request) -> Result<Response, ConnectionError> {
        let response = self.send(&request, false).await?;
        if response.status != 401 || self.auth.is_none() {
            return Ok(response);
        }

        debug!(endpoint = %self.endpoint, path = %request.path, "Token rejected, signing a new one");
        let response = self.send(&request, true).await?;
        if response.status == 401 {
            return Err(ConnectionError::Unauthorized(format!(
                "{}{}",
                self.endpoint, request.path
            )));
        }
        Ok(response)
    }
}

/// Builds [`HttpConnection`]s sharing one connection pool
pub struct HttpConnectionFactory {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpConnectionFactory {
    pub fn new(timeout: Duration) -> Result<Self, ConnectionError> {
        // Member certificates are signed by the deployment's own CA
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self { client, timeout })
    }
}

impl ConnectionFactory for HttpConnectionFactory {
    fn connect(
        &self,
        endpoint: &str,
        auth: Option<JwtAuthentication>,
    ) -> Result<Arc<dyn Connection>, ConnectionError> {
        Ok(Arc::new(HttpConnection::new(
            endpoint,
            self.client.clone(),
            self.timeout,
            auth,
        )))
    }
}
