//! W3C WebDriver client, one session per screen.

use crate::{DriverError, DriverFactory, RendererDriver, WindowPosition, WindowSize};
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct WebDriverFactory {
    client: Client,
    endpoint: String,
    browser: String,
}

impl WebDriverFactory {
    pub fn new(endpoint: &str, browser: &str) -> Result<Self, DriverError> {
        Self::with_timeout(endpoint, browser, DEFAULT_COMMAND_TIMEOUT)
    }

    pub fn with_timeout(
        endpoint: &str,
        browser: &str,
        timeout: Duration,
    ) -> Result<Self, DriverError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| DriverError::Http(err.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            browser: browser.to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl DriverFactory for WebDriverFactory {
    async fn create(&self) -> Result<Box<dyn RendererDriver>, DriverError> {
        let body = json!({
            "capabilities": { "alwaysMatch": { "browserName": self.browser } }
        });
        let value = send(
            &self.client,
            Method::POST,
            &format!("{}/session", self.endpoint),
            Some(body),
        )
        .await?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| DriverError::Protocol("new session without sessionId".to_string()))?;
        debug!(event = "webdriver_session", endpoint = %self.endpoint, session_id = session_id);
        Ok(Box::new(WebDriverSession {
            client: self.client.clone(),
            base: format!("{}/session/{session_id}", self.endpoint),
            session_id: session_id.to_string(),
        }))
    }
}

#[derive(Debug)]
pub struct WebDriverSession {
    client: Client,
    base: String,
    session_id: String,
}

impl WebDriverSession {
    async fn command(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, DriverError> {
        send(&self.client, method, &format!("{}{path}", self.base), body).await
    }

    async fn window_rect(&self) -> Result<Value, DriverError> {
        self.command(Method::GET, "/window/rect", None).await
    }
}

#[async_trait]
impl RendererDriver for WebDriverSession {
    async fn is_alive(&mut self) -> bool {
        self.command(Method::GET, "/window", None).await.is_ok()
    }

    async fn navigate(&mut self, url: &str) -> Result<(), DriverError> {
        self.command(Method::POST, "/url", Some(json!({ "url": url })))
            .await
            .map(|_| ())
    }

    async fn current_url(&mut self) -> Result<String, DriverError> {
        let value = self.command(Method::GET, "/url", None).await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| DriverError::Protocol("current url is not a string".to_string()))
    }

    async fn window_position(&mut self) -> Result<WindowPosition, DriverError> {
        let rect = self.window_rect().await?;
        Ok(WindowPosition::new(
            rect_field(&rect, "x")? as i32,
            rect_field(&rect, "y")? as i32,
        ))
    }

    async fn set_window_position(&mut self, position: WindowPosition) -> Result<(), DriverError> {
        self.command(
            Method::POST,
            "/window/rect",
            Some(json!({ "x": position.x, "y": position.y })),
        )
        .await
        .map(|_| ())
    }

    async fn window_size(&mut self) -> Result<WindowSize, DriverError> {
        let rect = self.window_rect().await?;
        Ok(WindowSize::new(
            rect_field(&rect, "width")?.max(0.0) as u32,
            rect_field(&rect, "height")?.max(0.0) as u32,
        ))
    }

    async fn maximize(&mut self) -> Result<(), DriverError> {
        self.command(Method::POST, "/window/maximize", Some(json!({})))
            .await
            .map(|_| ())
    }

    async fn fullscreen(&mut self) -> Result<(), DriverError> {
        self.command(Method::POST, "/window/fullscreen", Some(json!({})))
            .await
            .map(|_| ())
    }

    async fn clear_cookies(&mut self) -> Result<(), DriverError> {
        self.command(Method::DELETE, "/cookie", None)
            .await
            .map(|_| ())
    }

    async fn add_cookie(&mut self, name: &str, value: &str) -> Result<(), DriverError> {
        self.command(
            Method::POST,
            "/cookie",
            Some(json!({ "cookie": { "name": name, "value": value } })),
        )
        .await
        .map(|_| ())
    }

    async fn refresh(&mut self) -> Result<(), DriverError> {
        self.command(Method::POST, "/refresh", Some(json!({})))
            .await
            .map(|_| ())
    }

    async fn quit(&mut self) -> Result<(), DriverError> {
        debug!(event = "webdriver_quit", session_id = %self.session_id);
        self.command(Method::DELETE, "", None).await.map(|_| ())
    }
}

async fn send(
    client: &Client,
    method: Method,
    url: &str,
    body: Option<Value>,
) -> Result<Value, DriverError> {
    let mut request = client.request(method, url);
    if let Some(body) = body {
        request = request.json(&body);
    }
    let response = request
        .send()
        .await
        .map_err(|err| DriverError::Http(err.to_string()))?;
    let status = response.status();
    let body: Value = response
        .json()
        .await
        .map_err(|err| DriverError::Protocol(format!("status {status}: {err}")))?;
    let value = body.get("value").cloned().unwrap_or(Value::Null);
    if !status.is_success() {
        let error = value
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Err(DriverError::WebDriver { error, message });
    }
    Ok(value)
}

fn rect_field(rect: &Value, key: &str) -> Result<f64, DriverError> {
    rect.get(key)
        .and_then(Value::as_f64)
        .map(f64::round)
        .ok_or_else(|| DriverError::Protocol(format!("window rect without {key}")))
}
