use crate::trigger::{EnsureOutcome, TriggerLoop};
use chrono::Local;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Periodic self-check that keeps the schedule consistent and writes the
/// heartbeat the backup alarm relies on.
pub struct HealthMonitor {
    trigger: Arc<TriggerLoop>,
    interval: Duration,
    running: Arc<AtomicBool>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl HealthMonitor {
    pub fn new(trigger: Arc<TriggerLoop>, interval: Duration) -> Self {
        Self {
            trigger,
            interval,
            running: Arc::new(AtomicBool::new(false)),
            task: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub async fn start(&self) {
        if self.running.swap(true, Ordering::Relaxed) {
            return;
        }
        let running = self.running.clone();
        let trigger = self.trigger.clone();
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            while running.load(Ordering::Relaxed) {
                tokio::time::sleep(interval).await;
                if !running.load(Ordering::Relaxed) {
                    break;
                }
                match trigger.health_check(Local::now()).await {
                    EnsureOutcome::Rescheduled { next_ms, .. } => {
                        info!("Health check repaired schedule, next at {next_ms}")
                    }
                    outcome => debug!("Health check: {outcome:?}"),
                }
            }
        });

        let mut slot = self.task.lock().await;
        *slot = Some(handle);
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
    }

    pub async fn check_now(&self) -> EnsureOutcome {
        self.trigger.health_check(Local::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnnouncerConfig, RuntimeConfig};
    use crate::executor::AnnouncementExecutor;
    use crate::platform::testing::{
        RecordingAlarm, RecordingNotifier, RecordingSpeech, RecordingVibrator,
    };
    use crate::store::{PrefKey, Preferences};
    use crate::utils::now_ms;
    use serde_json::Value;

    fn trigger(prefs: &Preferences) -> Arc<TriggerLoop> {
        let executor = Arc::new(AnnouncementExecutor::new(
            &AnnouncerConfig::default(),
            "en",
            Arc::new(RecordingSpeech::default()),
            Arc::new(RecordingVibrator::new(false)),
            Arc::new(RecordingNotifier::default()),
            prefs.clone(),
        ));
        Arc::new(TriggerLoop::new(
            &RuntimeConfig::default(),
            prefs.clone(),
            executor,
            Arc::new(RecordingAlarm::default()),
        ))
    }

    fn stale_prefs() -> anyhow::Result<Preferences> {
        let prefs = Preferences::in_memory();
        prefs.write(&[
            (PrefKey::IntervalMinutes, Value::from(15)),
            (PrefKey::ServiceRunning, Value::from(true)),
            (
                PrefKey::NextAnnouncementTime,
                Value::from(now_ms() - 40 * 60_000),
            ),
        ])?;
        Ok(prefs)
    }

    #[tokio::test]
    async fn check_now_repairs_and_beats() -> anyhow::Result<()> {
        let prefs = stale_prefs()?;
        let monitor = HealthMonitor::new(trigger(&prefs), Duration::from_secs(300));
        let outcome = monitor.check_now().await;
        assert!(matches!(outcome, EnsureOutcome::Rescheduled { .. }));

        let state = prefs.schedule_state();
        assert!(state.next_announcement_ms.unwrap_or_default() > now_ms());
        assert!(state.last_heartbeat_ms.is_some());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_task_runs_health_check() -> anyhow::Result<()> {
        let prefs = stale_prefs()?;
        let monitor = HealthMonitor::new(trigger(&prefs), Duration::from_secs(300));
        monitor.start().await;
        assert!(monitor.is_running());

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert!(prefs.schedule_state().last_heartbeat_ms.is_some());

        monitor.stop().await;
        assert!(!monitor.is_running());
        Ok(())
    }
}
