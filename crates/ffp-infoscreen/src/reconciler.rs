//! Per-screen control loop: converge one browser window onto the desired content and geometry.

use crate::distributor::{Distributor, Inbox};
use ffp_core::{OperationalCode, ReloadPolicy, ScreenConfig};
use ffp_driver::{DriverError, DriverFactory, RendererDriver, WindowPosition, WindowSize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Windows targeting (0,0) closer than this on both axes are left alone; the
/// primary screen usually reserves a taskbar strip.
const TASKBAR_TOLERANCE_PX: i32 = 60;

/// Facts about the current driver instance, reset whenever it is recreated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScreenRuntimeState {
    pub maximized: WindowSize,
    pub fullscreen_asserted: bool,
    pub cookies_applied: bool,
    pub reload_counter: u32,
}

impl ScreenRuntimeState {
    /// Advances the reload schedule and reports whether this pass must reload.
    pub fn reload_due(&mut self, policy: ReloadPolicy) -> bool {
        match policy {
            ReloadPolicy::Always => true,
            ReloadPolicy::Periodic { cycles } => {
                if self.reload_counter >= cycles {
                    self.reload_counter = 0;
                    true
                } else {
                    self.reload_counter += 1;
                    false
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Url,
    Cookies,
    Position,
    Size,
    Fullscreen,
    Measure,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Url => "url",
            Step::Cookies => "cookies",
            Step::Position => "position",
            Step::Size => "size",
            Step::Fullscreen => "fullscreen",
            Step::Measure => "measure",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    Converged,
    /// No driver could be created; retried on the next update.
    DriverUnavailable,
    /// A step failed and the driver was released.
    Aborted(Step),
}

struct StepFailure {
    step: Step,
    error: DriverError,
}

fn at(step: Step) -> impl FnOnce(DriverError) -> StepFailure {
    move |error| StepFailure { step, error }
}

pub struct ScreenReconciler {
    config: ScreenConfig,
    fallback_url: String,
    settle_delay: Duration,
    factory: Arc<dyn DriverFactory>,
    driver: Option<Box<dyn RendererDriver>>,
    state: ScreenRuntimeState,
}

impl ScreenReconciler {
    pub fn new(
        config: ScreenConfig,
        fallback_url: impl Into<String>,
        settle_delay: Duration,
        factory: Arc<dyn DriverFactory>,
    ) -> Self {
        Self {
            config,
            fallback_url: fallback_url.into(),
            settle_delay,
            factory,
            driver: None,
            state: ScreenRuntimeState::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> &ScreenRuntimeState {
        &self.state
    }

    pub fn has_driver(&self) -> bool {
        self.driver.is_some()
    }

    /// Runs one pass per inbox update until the distributor goes away.
    pub async fn run(mut self, mut inbox: Inbox) {
        info!(event = "screen_start", screen = %self.config.name);
        while let Some(code) = inbox.recv().await {
            debug!(event = "status_update", screen = %self.config.name, code = %code);
            let outcome = self.reconcile(code).await;
            debug!(event = "pass_done", screen = %self.config.name, outcome = ?outcome);
        }
        if let Some(mut driver) = self.driver.take() {
            let _ = driver.quit().await;
        }
        info!(event = "screen_stop", screen = %self.config.name);
    }

    pub async fn reconcile(&mut self, code: OperationalCode) -> PassOutcome {
        if !self.ensure_live().await {
            return PassOutcome::DriverUnavailable;
        }
        let Some(mut driver) = self.driver.take() else {
            return PassOutcome::DriverUnavailable;
        };
        match self.converge(driver.as_mut(), code).await {
            Ok(()) => {
                self.driver = Some(driver);
                PassOutcome::Converged
            }
            Err(failure) => {
                warn!(
                    event = "browser_unreachable",
                    screen = %self.config.name,
                    code = %code,
                    step = failure.step.as_str(),
                    error = %failure.error,
                    "closing instance, restarted on next update"
                );
                let _ = driver.quit().await;
                self.state.fullscreen_asserted = false;
                PassOutcome::Aborted(failure.step)
            }
        }
    }

    /// Replaces a missing or unresponsive driver with a fresh instance.
    pub async fn ensure_live(&mut self) -> bool {
        if let Some(driver) = self.driver.as_mut() {
            if driver.is_alive().await {
                return true;
            }
            warn!(event = "driver_unresponsive", screen = %self.config.name);
            if let Err(err) = driver.quit().await {
                debug!(event = "driver_quit_failed", screen = %self.config.name, error = %err);
            }
            self.driver = None;
        }

        self.state = ScreenRuntimeState::default();
        match self.factory.create().await {
            Ok(driver) => {
                info!(event = "driver_created", screen = %self.config.name);
                self.driver = Some(driver);
                true
            }
            Err(err) => {
                error!(event = "driver_create_failed", screen = %self.config.name, error = %err);
                false
            }
        }
    }

    async fn converge(
        &mut self,
        driver: &mut dyn RendererDriver,
        code: OperationalCode,
    ) -> Result<(), StepFailure> {
        let (url, cookies) = self.config.target_for(code, &self.fallback_url);
        let url = url.to_string();
        let cookies = cookies.to_vec();
        let screen = self.config.name.clone();

        let reload_due = self.state.reload_due(self.config.reload);
        let current = driver.current_url().await.map_err(at(Step::Url))?;
        if !same_url(&current, &url) {
            debug!(event = "url_change", screen = %screen, from = %current, to = %url);
            driver.navigate(&url).await.map_err(at(Step::Url))?;
            self.state.cookies_applied = false;
        } else if reload_due {
            debug!(event = "forced_reload", screen = %screen, url = %url);
            driver.navigate(&url).await.map_err(at(Step::Url))?;
            self.state.cookies_applied = false;
        }

        if !self.state.cookies_applied && !cookies.is_empty() {
            driver.clear_cookies().await.map_err(at(Step::Cookies))?;
            for (nr, cookie) in cookies.iter().enumerate() {
                debug!(event = "add_cookie", screen = %screen, nr = nr, name = %cookie.name);
                driver
                    .add_cookie(&cookie.name, &cookie.value)
                    .await
                    .map_err(at(Step::Cookies))?;
            }
            self.state.cookies_applied = true;
            driver.refresh().await.map_err(at(Step::Cookies))?;
        }

        let (x, y) = self.config.position();
        let target = WindowPosition::new(x, y);
        let observed = driver.window_position().await.map_err(at(Step::Position))?;
        if observed != target {
            if target == WindowPosition::default() && within_taskbar_band(observed) {
                debug!(event = "taskbar_offset", screen = %screen, x = observed.x, y = observed.y);
            } else {
                debug!(
                    event = "move_window",
                    screen = %screen,
                    from_x = observed.x,
                    from_y = observed.y,
                    to_x = target.x,
                    to_y = target.y
                );
                driver
                    .set_window_position(target)
                    .await
                    .map_err(at(Step::Position))?;
            }
        }

        let size = driver.window_size().await.map_err(at(Step::Size))?;
        if size != self.state.maximized {
            debug!(
                event = "maximize",
                screen = %screen,
                width = size.width,
                height = size.height,
                expected_width = self.state.maximized.width,
                expected_height = self.state.maximized.height
            );
            driver.maximize().await.map_err(at(Step::Size))?;
            self.state.fullscreen_asserted = false;
        }

        if !self.state.fullscreen_asserted {
            debug!(event = "fullscreen", screen = %screen);
            driver.fullscreen().await.map_err(at(Step::Fullscreen))?;
            self.state.fullscreen_asserted = true;
        }

        tokio::time::sleep(self.settle_delay).await;
        self.state.maximized = driver.window_size().await.map_err(at(Step::Measure))?;
        Ok(())
    }
}

/// Keeps one screen's reconciler alive: a pass that panics is logged and the
/// screen starts over with a fresh inbox, driver and runtime state.
pub async fn supervise(
    config: ScreenConfig,
    fallback_url: String,
    settle_delay: Duration,
    factory: Arc<dyn DriverFactory>,
    distributor: Distributor,
) {
    let mut restarts: u32 = 0;
    loop {
        let inbox = distributor.register(&config.name);
        let reconciler = ScreenReconciler::new(
            config.clone(),
            fallback_url.clone(),
            settle_delay,
            Arc::clone(&factory),
        );
        match tokio::spawn(reconciler.run(inbox)).await {
            Ok(()) => return,
            Err(err) if err.is_panic() => {
                restarts += 1;
                error!(
                    event = "screen_restart",
                    screen = %config.name,
                    restarts = restarts,
                    error = %err
                );
            }
            Err(_) => return,
        }
    }
}

fn within_taskbar_band(position: WindowPosition) -> bool {
    position.x.abs() < TASKBAR_TOLERANCE_PX && position.y.abs() < TASKBAR_TOLERANCE_PX
}

fn same_url(current: &str, desired: &str) -> bool {
    current.trim_end_matches('/') == desired.trim_end_matches('/')
}
