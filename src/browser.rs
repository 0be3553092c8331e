use anyhow::Result;
use async_trait::async_trait;
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchMouseEventParams, DispatchMouseEventType, InsertTextParams, MouseButton as CdpButton,
};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::layout::Point as CdpPoint;
use chromiumoxide::page::{Page, ScreenshotParamsBuilder};
use futures::StreamExt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::debug;

use crate::agent::{Computer, ComputerError, MouseButton, Point};

pub const VIEWPORT: (i64, i64) = (1280, 800);

#[derive(Clone)]
pub struct BrowserConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            user_agent: None,
        }
    }
}

/// One live Chromium page driven over CDP. This is the capability handle:
/// exactly one per session, released by `close`.
pub struct Browser {
    page: Page,
    browser: Mutex<Option<OxideBrowser>>,
}

impl Browser {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // Unique user data dir per run to avoid ProcessSingleton profile lock
        // conflicts when Chromium is restarted rapidly.
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis();
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("webpilot-profile-{}-{}", std::process::id(), ts));
        let _ = std::fs::create_dir_all(&profile_dir);
        builder = builder.user_data_dir(profile_dir.clone());
        builder = builder
            .arg(format!("--user-data-dir={}", profile_dir.display()))
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let bcfg = builder.build().map_err(|e| anyhow::anyhow!(e))?;
        let (browser, mut handler) = OxideBrowser::launch(bcfg).await?;
        tokio::spawn(async move {
            while let Some(_ev) = handler.next().await {}
        });
        let page = browser.new_page("about:blank").await?;
        if let Some(ua) = cfg.user_agent {
            page.set_user_agent(ua).await?;
        }
        Self::force_viewport(&page).await;
        Ok(Self {
            page,
            browser: Mutex::new(Some(browser)),
        })
    }

    /// Attach to an already-running Chromium over its devtools websocket.
    pub async fn connect(ws_url: &str) -> Result<Self> {
        let (browser, mut handler) = OxideBrowser::connect(ws_url).await?;
        tokio::spawn(async move {
            while let Some(_ev) = handler.next().await {}
        });
        let page = browser.new_page("about:blank").await?;
        Self::force_viewport(&page).await;
        Ok(Self {
            page,
            browser: Mutex::new(Some(browser)),
        })
    }

    // Screenshots of a zero-sized viewport fail outright, so pin the metrics.
    async fn force_viewport(page: &Page) {
        let _ = page
            .execute(
                SetDeviceMetricsOverrideParams::builder()
                    .width(VIEWPORT.0)
                    .height(VIEWPORT.1)
                    .device_scale_factor(1.0)
                    .mobile(false)
                    .build()
                    .unwrap(),
            )
            .await;
    }

    pub async fn goto(&self, url: &str) -> Result<()> {
        self.page.goto(url).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    pub async fn url(&self) -> Result<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    async fn screenshot_png(&self) -> Result<Vec<u8>> {
        let take = || async {
            self.page
                .screenshot(
                    ScreenshotParamsBuilder::default()
                        .format(CaptureScreenshotFormat::Png)
                        .build(),
                )
                .await
        };
        match take().await {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                let msg = format!("{}", e);
                if msg.contains("0 width") || msg.contains("0 height") {
                    // Viewport collapsed; pin it again and retry once.
                    Self::force_viewport(&self.page).await;
                    sleep(Duration::from_millis(50)).await;
                    Ok(take().await?)
                } else {
                    Err(anyhow::anyhow!(e))
                }
            }
        }
    }

    async fn mouse_press_release(&self, x: i64, y: i64, button: CdpButton, clicks: i64) -> Result<()> {
        let cmd = DispatchMouseEventParams::builder()
            .x(x as f64)
            .y(y as f64)
            .button(button)
            .click_count(clicks);
        self.page
            .move_mouse(CdpPoint {
                x: x as f64,
                y: y as f64,
            })
            .await?
            .execute(
                cmd.clone()
                    .r#type(DispatchMouseEventType::MousePressed)
                    .build()
                    .unwrap(),
            )
            .await?;
        self.page
            .execute(
                cmd.r#type(DispatchMouseEventType::MouseReleased)
                    .build()
                    .unwrap(),
            )
            .await?;
        Ok(())
    }

    async fn wheel(&self, x: i64, y: i64, dx: i64, dy: i64) -> Result<()> {
        self.page
            .move_mouse(CdpPoint {
                x: x as f64,
                y: y as f64,
            })
            .await?
            .execute(
                DispatchMouseEventParams::builder()
                    .x(x as f64)
                    .y(y as f64)
                    .delta_x(dx as f64)
                    .delta_y(dy as f64)
                    .r#type(DispatchMouseEventType::MouseWheel)
                    .build()
                    .unwrap(),
            )
            .await?;
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<()> {
        // Quoted through serde_json so arbitrary key names cannot break the script.
        let k = serde_json::to_string(key)?;
        let js = format!(
            r#"
            (function() {{
              const el = document.activeElement || document.body;
              const opts = {{key: {k}, code: {k}, bubbles: true}};
              el.dispatchEvent(new KeyboardEvent("keydown", opts));
              el.dispatchEvent(new KeyboardEvent("keyup", opts));
            }})()
        "#
        );
        let eval = EvaluateParams::builder()
            .expression(js)
            .build()
            .map_err(|e| anyhow::anyhow!(e))?;
        self.page.execute(eval).await?;
        Ok(())
    }

    async fn drag_path(&self, path: &[Point]) -> Result<()> {
        if path.len() < 2 {
            return Ok(());
        }
        let start = path[0];
        let down = DispatchMouseEventParams::builder()
            .x(start.x as f64)
            .y(start.y as f64)
            .button(CdpButton::Left);
        self.page
            .move_mouse(CdpPoint {
                x: start.x as f64,
                y: start.y as f64,
            })
            .await?
            .execute(
                down.clone()
                    .r#type(DispatchMouseEventType::MousePressed)
                    .build()
                    .unwrap(),
            )
            .await?;
        for p in &path[1..] {
            self.page
                .move_mouse(CdpPoint {
                    x: p.x as f64,
                    y: p.y as f64,
                })
                .await?;
        }
        self.page
            .execute(
                down.r#type(DispatchMouseEventType::MouseReleased)
                    .build()
                    .unwrap(),
            )
            .await?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let mut guard = self.browser.lock().await;
        if let Some(mut browser) = guard.take() {
            debug!("closing browser");
            browser.close().await?;
        }
        Ok(())
    }
}

fn cdp_button(button: MouseButton) -> CdpButton {
    match button {
        MouseButton::Left => CdpButton::Left,
        MouseButton::Right => CdpButton::Right,
        MouseButton::Middle => CdpButton::Middle,
    }
}

#[async_trait]
impl Computer for Browser {
    async fn screenshot(&self) -> Result<Vec<u8>, ComputerError> {
        self.screenshot_png().await.map_err(ComputerError::new)
    }

    async fn click(&self, x: i64, y: i64, button: MouseButton) -> Result<(), ComputerError> {
        self.mouse_press_release(x, y, cdp_button(button), 1)
            .await
            .map_err(ComputerError::new)
    }

    async fn double_click(&self, x: i64, y: i64) -> Result<(), ComputerError> {
        self.mouse_press_release(x, y, CdpButton::Left, 2)
            .await
            .map_err(ComputerError::new)
    }

    async fn type_text(&self, text: &str) -> Result<(), ComputerError> {
        // Input.insertText feeds whatever currently holds focus.
        self.page
            .execute(InsertTextParams {
                text: text.to_string(),
            })
            .await
            .map_err(ComputerError::new)?;
        Ok(())
    }

    async fn scroll(&self, x: i64, y: i64, dx: i64, dy: i64) -> Result<(), ComputerError> {
        self.wheel(x, y, dx, dy).await.map_err(ComputerError::new)
    }

    async fn wait(&self, ms: u64) -> Result<(), ComputerError> {
        sleep(Duration::from_millis(ms)).await;
        Ok(())
    }

    async fn move_cursor(&self, x: i64, y: i64) -> Result<(), ComputerError> {
        self.page
            .move_mouse(CdpPoint {
                x: x as f64,
                y: y as f64,
            })
            .await
            .map_err(ComputerError::new)?;
        Ok(())
    }

    async fn keypress(&self, keys: &[String]) -> Result<(), ComputerError> {
        // Discrete press-and-release per key, in order. No chord semantics.
        for key in keys {
            self.press_key(key).await.map_err(ComputerError::new)?;
        }
        Ok(())
    }

    async fn drag(&self, path: &[Point]) -> Result<(), ComputerError> {
        self.drag_path(path).await.map_err(ComputerError::new)
    }

    async fn close(&self) -> Result<(), ComputerError> {
        self.shutdown().await.map_err(ComputerError::new)
    }
}
