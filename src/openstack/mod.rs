//! OpenStack implementation of the control-plane contract.
//!
//! Authenticates against Keystone v3 and talks to Nova, Cinder, Glance and
//! Neutron over their REST APIs with `reqwest`. Tokens are cached and
//! renewed shortly before they expire.

mod auth;
mod compute;
mod error;
mod storage;
mod wire;

use std::fmt;
use std::time::Duration;

use chrono::Utc;
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::config::OpenStackConfig;
use auth::{AuthSession, SUBJECT_TOKEN_HEADER, Service};

pub use error::OpenStackError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";

/// Tokens this close to expiry are renewed before use.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

/// Backend that drives an OpenStack cloud.
pub struct OpenStackBackend {
    http: reqwest::Client,
    config: OpenStackConfig,
    session: Mutex<Option<AuthSession>>,
}

impl fmt::Debug for OpenStackBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenStackBackend")
            .field("auth_url", &self.config.auth_url)
            .field("username", &self.config.username)
            .field("project_name", &self.config.project_name)
            .finish_non_exhaustive()
    }
}

/// One API call: where it goes and what it carries.
#[derive(Clone, Debug)]
struct Call<'a> {
    action: &'static str,
    service: Service,
    method: Method,
    path: &'a str,
    query: &'a [(&'a str, &'a str)],
    body: Option<&'a Value>,
}

impl<'a> Call<'a> {
    const fn get(action: &'static str, service: Service, path: &'a str) -> Self {
        Self {
            action,
            service,
            method: Method::GET,
            path,
            query: &[],
            body: None,
        }
    }

    const fn delete(action: &'static str, service: Service, path: &'a str) -> Self {
        Self {
            action,
            service,
            method: Method::DELETE,
            path,
            query: &[],
            body: None,
        }
    }

    const fn post(action: &'static str, service: Service, path: &'a str, body: &'a Value) -> Self {
        Self {
            action,
            service,
            method: Method::POST,
            path,
            query: &[],
            body: Some(body),
        }
    }

    const fn with_query(mut self, query: &'a [(&'a str, &'a str)]) -> Self {
        self.query = query;
        self
    }
}

impl OpenStackBackend {
    /// Constructs a backend from credentials. No request is made until the
    /// first call.
    ///
    /// # Errors
    ///
    /// Returns [`OpenStackError::Config`] when the credentials fail
    /// validation and [`OpenStackError::Transport`] when the HTTP client
    /// cannot be built.
    pub fn new(config: OpenStackConfig) -> Result<Self, OpenStackError> {
        config.validate()?;
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            http,
            config,
            session: Mutex::new(None),
        })
    }

    async fn session(&self) -> Result<AuthSession, OpenStackError> {
        let mut cached = self.session.lock().await;
        let margin = chrono::Duration::seconds(TOKEN_REFRESH_MARGIN_SECS);
        let now = Utc::now();
        if let Some(session) = cached
            .as_ref()
            .filter(|session| !session.expires_within(now, margin))
        {
            return Ok(session.clone());
        }
        let fresh = self.authenticate().await?;
        *cached = Some(fresh.clone());
        Ok(fresh)
    }

    async fn authenticate(&self) -> Result<AuthSession, OpenStackError> {
        let url = auth::tokens_url(&self.config.auth_url);
        tracing::debug!(%url, user = %self.config.username, "requesting keystone token");
        let response = self
            .http
            .post(&url)
            .json(&auth::password_request(&self.config))
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(OpenStackError::Auth(format!(
                "Keystone rejected the credentials for {}",
                self.config.username
            )));
        }
        let response = check_status("authenticate", response).await?;
        let token = response
            .headers()
            .get(SUBJECT_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| {
                OpenStackError::Auth(format!("response carried no {SUBJECT_TOKEN_HEADER} header"))
            })?;
        let body = response.text().await?;
        auth::session_from_response(
            token,
            &body,
            &self.config.interface,
            self.config.region_name.as_deref(),
        )
    }

    async fn send(&self, call: Call<'_>) -> Result<Response, OpenStackError> {
        let session = self.session().await?;
        let url = session.endpoints.url(call.service, call.path);
        tracing::debug!(action = call.action, method = %call.method, %url, "openstack request");
        let mut builder = self
            .http
            .request(call.method, &url)
            .header(AUTH_TOKEN_HEADER, &session.token);
        if !call.query.is_empty() {
            builder = builder.query(call.query);
        }
        if let Some(body) = call.body {
            builder = builder.json(body);
        }
        let response = builder.send().await?;
        check_status(call.action, response).await
    }

    async fn send_json<T: DeserializeOwned>(&self, call: Call<'_>) -> Result<T, OpenStackError> {
        let action = call.action;
        let response = self.send(call).await?;
        decode(action, response).await
    }

    /// Sends a removal request; a 404 means the resource is already gone.
    async fn remove(&self, call: Call<'_>) -> Result<(), OpenStackError> {
        error::removed(self.send(call).await)
    }

    /// Like [`Self::send_json`], mapping a 404 to `None`.
    async fn find_json<T: DeserializeOwned>(
        &self,
        call: Call<'_>,
    ) -> Result<Option<T>, OpenStackError> {
        match self.send_json(call).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }
}

async fn check_status(action: &str, response: Response) -> Result<Response, OpenStackError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(OpenStackError::Http {
        action: action.to_owned(),
        status: status.as_u16(),
        body,
    })
}

async fn decode<T: DeserializeOwned>(action: &str, response: Response) -> Result<T, OpenStackError> {
    let text = response.text().await?;
    serde_json::from_str(&text).map_err(|err| OpenStackError::Decode {
        action: action.to_owned(),
        message: err.to_string(),
    })
}
