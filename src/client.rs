use crate::config::REQUEST_TIMEOUT;
use crate::error::{GatewayError, Result};
use crate::protocol::{
    UnitCommand, PATH_GET_UNIT_BY_ID, PATH_LIST_UNITS, PATH_LOGIN, PATH_UNIT_ACTION, UNAUTHORIZED_MARKER,
};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::Mutex;
use url::Url;

/// Session state shared by all calls
#[derive(Default)]
struct Session {
    base_url: Option<Url>,
    connected: bool,
}

/// REST command client for a TouchWand controller
///
/// Every call carries a fixed timeout and reports failure as an `Err`
/// instead of panicking, so callers can treat the controller as unreachable
/// and try again later. Calls are serialized: the session lock is held for
/// the whole request, matching the controller's single-session model.
///
/// # Example
///
/// ```no_run
/// use touchwand::{RestClient, UnitCommand};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = RestClient::new()?;
///     if client.connect("admin", "secret", "192.168.1.20", 80).await {
///         let units = client.list_units().await?;
///         println!("{}", units);
///         client.send_command("7", UnitCommand::SwitchOn).await?;
///     }
///     Ok(())
/// }
/// ```
pub struct RestClient {
    http: reqwest::Client,
    session: Mutex<Session>,
}

impl RestClient {
    /// Create a client with the default 10 second request timeout
    pub fn new() -> Result<Self> {
        Self::with_timeout(REQUEST_TIMEOUT)
    }

    /// Create a client with a custom request timeout
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            http,
            session: Mutex::new(Session::default()),
        })
    }

    /// Log in to the controller at `host:port`.
    ///
    /// Returns whether the controller accepted the credentials. The session
    /// cookie it hands out is kept for every later call.
    pub async fn connect(&self, user: &str, pass: &str, host: &str, port: u16) -> bool {
        let mut session = self.session.lock().await;
        session.connected = false;

        let base_url = match Url::parse(&format!("http://{}:{}", host, port)) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!("Error building URL for {}:{} : {}", host, port, e);
                session.base_url = None;
                return false;
            }
        };
        session.base_url = Some(base_url.clone());

        let mut url = match base_url.join(PATH_LOGIN) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!("Error building login URL for {} : {}", host, e);
                return false;
            }
        };
        url.query_pairs_mut().append_pair("user", user).append_pair("psw", pass);

        let response = match self.http.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Error opening connection to {} : {}", host, e);
                return false;
            }
        };

        if response.status() == StatusCode::UNAUTHORIZED {
            tracing::warn!("Login to {} rejected", host);
            return false;
        }

        match response.text().await {
            Ok(body) if body.trim() != UNAUTHORIZED_MARKER => {
                tracing::info!("Logged in to TouchWand controller at {}:{}", host, port);
                session.connected = true;
                true
            }
            Ok(_) => {
                tracing::warn!("Login to {} rejected", host);
                false
            }
            Err(e) => {
                tracing::warn!("Error reading login response from {} : {}", host, e);
                false
            }
        }
    }

    /// Whether the last login succeeded
    pub async fn is_connected(&self) -> bool {
        self.session.lock().await.connected
    }

    /// Fetch the raw unit inventory
    pub async fn list_units(&self) -> Result<String> {
        self.send(Method::GET, PATH_LIST_UNITS, &[], None).await
    }

    /// Fetch the raw detail payload of one unit
    pub async fn get_unit_by_id(&self, id: &str) -> Result<String> {
        self.send(Method::GET, PATH_GET_UNIT_BY_ID, &[("id", id)], None).await
    }

    /// POST a JSON action body to the action endpoint
    pub async fn send_action(&self, payload: &Value) -> Result<String> {
        self.send(Method::POST, PATH_UNIT_ACTION, &[], Some(payload)).await
    }

    /// Render a device command for `id` and send it
    pub async fn send_command(&self, id: &str, command: UnitCommand) -> Result<String> {
        let payload = command.payload(id);
        tracing::debug!(unit_id = %id, "Sending action {}", payload);
        self.send_action(&payload).await
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<String> {
        let session = self.session.lock().await;
        let base_url = session.base_url.as_ref().ok_or(GatewayError::NotConnected)?;

        let mut url = base_url.join(path)?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }

        let mut request = self.http.request(method, url.clone());
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            tracing::warn!("Error sending request to {} : {}", url, e);
            transport_error(e)
        })?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!("Controller answered {} for {}", status, url);
            return Err(GatewayError::InvalidResponse(format!("HTTP {} for {}", status, path)));
        }

        let text = response.text().await.map_err(transport_error)?;
        tracing::debug!("Response from {}: {}", path, text);
        Ok(text)
    }
}

fn transport_error(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Timeout
    } else {
        GatewayError::Http(e)
    }
}
