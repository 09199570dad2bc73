use crate::config::Config;
use crate::platform::Notifier;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationContent {
    pub title: String,
    pub body: String,
    pub updated_at: String,
}

/// Keeps the "foreground notification" as a JSON file that `status` reads.
pub struct StatusFileNotifier {
    path: PathBuf,
}

impl StatusFileNotifier {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub async fn read(&self) -> Option<NotificationContent> {
        let raw = tokio::fs::read_to_string(&self.path).await.ok()?;
        serde_json::from_str(&raw).ok()
    }
}

#[async_trait]
impl Notifier for StatusFileNotifier {
    async fn set_foreground_content(&self, title: &str, body: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = NotificationContent {
            title: title.to_string(),
            body: body.to_string(),
            updated_at: Local::now().to_rfc3339(),
        };
        tokio::fs::write(&self.path, serde_json::to_string_pretty(&content)?).await?;
        Ok(())
    }
}

#[cfg(feature = "desktop-notifications")]
pub struct DesktopNotifier {
    status: StatusFileNotifier,
}

#[cfg(feature = "desktop-notifications")]
#[async_trait]
impl Notifier for DesktopNotifier {
    async fn set_foreground_content(&self, title: &str, body: &str) -> Result<()> {
        self.status.set_foreground_content(title, body).await?;
        let (title, body) = (title.to_string(), body.to_string());
        tokio::task::spawn_blocking(move || {
            notify_rust::Notification::new()
                .summary(&title)
                .body(&body)
                .icon("preferences-system-time")
                .timeout(5000)
                .show()
                .map(|_| ())
        })
        .await??;
        Ok(())
    }
}

pub fn build_notifier(config: &Config) -> Result<Arc<dyn Notifier>> {
    let status = StatusFileNotifier::new(config.notification_path()?);
    #[cfg(feature = "desktop-notifications")]
    if config.notification.desktop {
        return Ok(Arc::new(DesktopNotifier { status }));
    }
    #[cfg(not(feature = "desktop-notifications"))]
    if config.notification.desktop {
        tracing::warn!("Desktop notifications requested but not compiled in");
    }
    Ok(Arc::new(status))
}
