//! HTTP connections to deployment members
//!
//! The controller talks to agents, dbservers and coordinators through the
//! [`Connection`] trait. Connections are created lazily by the
//! [`ClientCache`] and shared for the lifetime of the deployment handle.

mod auth;
mod cache;
mod http;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use rand::seq::SliceRandom;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

pub use auth::JwtAuthentication;
pub use cache::ClientCache;
pub use http::{HttpConnection, HttpConnectionFactory};

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("transport: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{path} returned status {status}: {message}")]
    Status {
        status: u16,
        path: String,
        message: String,
    },

    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("request timeout")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("token signing failed: {0}")]
    Auth(#[from] jsonwebtoken::errors::Error),
}

impl ConnectionError {
    /// The member may answer differently when asked again
    pub fn is_transient(&self) -> bool {
        match self {
            ConnectionError::Http(_) | ConnectionError::Timeout(_) => true,
            ConnectionError::Status { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            ConnectionError::Decode(_)
            | ConnectionError::Unauthorized(_)
            | ConnectionError::Auth(_) => false,
        }
    }
}

/// Request sent to a member
#[derive(Clone, Debug)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

impl Request {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            body: Some(body),
        }
    }

    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::PUT,
            path: path.into(),
            body: Some(body),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            method: Method::DELETE,
            path: path.into(),
            body: None,
        }
    }
}

/// Raw member response. `body` is `Null` when the response was empty.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Value,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    /// Base URL requests are sent to
    fn endpoint(&self) -> &str;

    async fn request(&self, request: Request) -> Result<Response, ConnectionError>;
}

/// Creates connections for member endpoints
pub trait ConnectionFactory: Send + Sync {
    fn connect(
        &self,
        endpoint: &str,
        auth: Option<JwtAuthentication>,
    ) -> Result<Arc<dyn Connection>, ConnectionError>;
}

fn check_status(path: &str, response: Response) -> Result<Value, ConnectionError> {
    if response.is_success() {
        return Ok(response.body);
    }
    let message = response
        .body
        .get("errorMessage")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| response.body.to_string());
    Err(ConnectionError::Status {
        status: response.status,
        path: path.to_string(),
        message,
    })
}

/// Send a request and decode a successful JSON response
pub async fn send_json<T: DeserializeOwned>(
    connection: &dyn Connection,
    request: Request,
) -> Result<T, ConnectionError> {
    let path = request.path.clone();
    let response = connection.request(request).await?;
    Ok(serde_json::from_value(check_status(&path, response)?)?)
}

pub async fn get_json<T: DeserializeOwned>(
    connection: &dyn Connection,
    path: &str,
) -> Result<T, ConnectionError> {
    send_json(connection, Request::get(path)).await
}

pub async fn post_json<T: DeserializeOwned>(
    connection: &dyn Connection,
    path: &str,
    body: Value,
) -> Result<T, ConnectionError> {
    send_json(connection, Request::post(path, body)).await
}

/// Set of member connections keyed by member ID
#[derive(Clone, Debug, Default)]
pub struct Connections(Vec<(String, Arc<dyn Connection>)>);

impl Connections {
    pub fn new(connections: Vec<(String, Arc<dyn Connection>)>) -> Self {
        Self(connections)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(id, _)| id.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, Arc<dyn Connection>)> {
        self.0.iter()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn Connection>> {
        self.0.iter().find(|(i, _)| i == id).map(|(_, c)| c)
    }

    /// Keep the connections for which `predicate` holds, evaluating every
    /// predicate concurrently and waiting for all of them.
    pub async fn filter<F, Fut>(&self, predicate: F) -> Connections
    where
        F: Fn(Arc<dyn Connection>) -> Fut,
        Fut: Future<Output = bool>,
    {
        let checks = self
            .0
            .iter()
            .map(|(_, connection)| predicate(connection.clone()));
        let keep = join_all(checks).await;
        Connections(
            self.0
                .iter()
                .zip(keep)
                .filter_map(|(entry, keep)| keep.then(|| entry.clone()))
                .collect(),
        )
    }

    /// Any one of the connections
    pub fn random(&self) -> Option<Arc<dyn Connection>> {
        self.0
            .choose(&mut rand::thread_rng())
            .map(|(_, connection)| connection.clone())
    }
}
