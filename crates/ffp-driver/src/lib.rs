//! Control surface for one on-screen browser window.
//!
//! The reconciler only talks to [`RendererDriver`] and [`DriverFactory`]; the
//! [`webdriver`] module provides the implementation used in production.

use async_trait::async_trait;
use thiserror::Error;

pub mod webdriver;

pub use webdriver::{WebDriverFactory, WebDriverSession};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("driver transport error: {0}")]
    Http(String),
    #[error("webdriver error {error}: {message}")]
    WebDriver { error: String, message: String },
    #[error("driver protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowPosition {
    pub x: i32,
    pub y: i32,
}

impl WindowPosition {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowSize {
    pub width: u32,
    pub height: u32,
}

impl WindowSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// One live browser instance.
#[async_trait]
pub trait RendererDriver: Send {
    /// Liveness probe; any failure means the instance must be recreated.
    async fn is_alive(&mut self) -> bool;
    async fn navigate(&mut self, url: &str) -> Result<(), DriverError>;
    async fn current_url(&mut self) -> Result<String, DriverError>;
    async fn window_position(&mut self) -> Result<WindowPosition, DriverError>;
    async fn set_window_position(&mut self, position: WindowPosition) -> Result<(), DriverError>;
    async fn window_size(&mut self) -> Result<WindowSize, DriverError>;
    async fn maximize(&mut self) -> Result<(), DriverError>;
    async fn fullscreen(&mut self) -> Result<(), DriverError>;
    async fn clear_cookies(&mut self) -> Result<(), DriverError>;
    async fn add_cookie(&mut self, name: &str, value: &str) -> Result<(), DriverError>;
    async fn refresh(&mut self) -> Result<(), DriverError>;
    /// Releases the instance. Callers treat failures as best effort.
    async fn quit(&mut self) -> Result<(), DriverError>;
}

/// Creates fresh driver instances for one screen.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn RendererDriver>, DriverError>;
}
