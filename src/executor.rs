//! Side-effecting announcement sequence: vibrate once, speak N times,
//! refresh the notification.

use crate::config::AnnouncerConfig;
use crate::formatter::TimeText;
use crate::model::{MAX_REPEAT_COUNT, MIN_REPEAT_COUNT, VoiceSettings};
use crate::platform::{Notifier, SpeechEngine, Vibrator};
use crate::store::{PrefKey, Preferences};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct AnnouncementRequest {
    pub text: TimeText,
    pub repeat_count: u32,
    pub vibrate: bool,
    pub voice: VoiceSettings,
    pub next_display: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceOutcome {
    Completed { spoken: u32, failed: u32 },
    /// Another announcement was still running.
    Busy,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct AnnouncementExecutor {
    speech: Arc<dyn SpeechEngine>,
    vibrator: Arc<dyn Vibrator>,
    notifier: Arc<dyn Notifier>,
    prefs: Preferences,
    repeat_delay: Duration,
    vibration: Duration,
    notification_title: String,
    fallback_language: String,
    busy: AtomicBool,
}

impl AnnouncementExecutor {
    pub fn new(
        config: &AnnouncerConfig,
        fallback_language: &str,
        speech: Arc<dyn SpeechEngine>,
        vibrator: Arc<dyn Vibrator>,
        notifier: Arc<dyn Notifier>,
        prefs: Preferences,
    ) -> Self {
        Self {
            speech,
            vibrator,
            notifier,
            prefs,
            repeat_delay: Duration::from_millis(config.repeat_delay_ms),
            vibration: Duration::from_millis(config.vibration_ms),
            notification_title: config.notification_title.clone(),
            fallback_language: fallback_language.to_string(),
            busy: AtomicBool::new(false),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn speech_backend(&self) -> &str {
        self.speech.name()
    }

    pub async fn announce(&self, request: &AnnouncementRequest) -> AnnounceOutcome {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Announcement already in progress, skipping");
            return AnnounceOutcome::Busy;
        }
        let _guard = BusyGuard(&self.busy);

        if request.vibrate && self.vibrator.has_vibrator() {
            if let Err(err) = self.vibrator.vibrate(self.vibration) {
                debug!("Vibration failed: {err:#}");
            }
        }

        let repeats = request.repeat_count.clamp(MIN_REPEAT_COUNT, MAX_REPEAT_COUNT);
        let mut voice = request.voice.clone();
        let (mut spoken, mut failed) = (0, 0);
        for i in 0..repeats {
            if i > 0 && !self.speech.awaits_completion() {
                tokio::time::sleep(self.repeat_delay).await;
            }
            if self.speak_with_fallback(&request.text.spoken, &mut voice).await {
                spoken += 1;
            } else {
                failed += 1;
            }
        }
        info!(
            "Announced {:?} ({spoken}/{repeats} utterances)",
            request.text.spoken
        );

        let body = match &request.next_display {
            Some(next) => format!("Last: {} | Next: {next}", request.text.display),
            None => format!("Last: {}", request.text.display),
        };
        if let Err(err) = self
            .notifier
            .set_foreground_content(&self.notification_title, &body)
            .await
        {
            warn!("Failed to update notification: {err:#}");
        }
        if let Err(err) = self.prefs.write(&[(
            PrefKey::LastSpokenText,
            Value::from(request.text.spoken.clone()),
        )]) {
            warn!("Failed to persist last spoken text: {err:#}");
        }

        AnnounceOutcome::Completed { spoken, failed }
    }

    /// Tries the requested language, then its primary subtag, then the
    /// configured fallback. A language that worked sticks for later repeats.
    async fn speak_with_fallback(&self, text: &str, voice: &mut VoiceSettings) -> bool {
        let first_err = match self.speech.speak(text, voice).await {
            Ok(()) => return true,
            Err(err) => err,
        };
        warn!("Speech failed for {}: {first_err:#}", voice.language);

        for candidate in self.fallback_languages(&voice.language) {
            let attempt = VoiceSettings {
                language: candidate,
                ..voice.clone()
            };
            match self.speech.speak(text, &attempt).await {
                Ok(()) => {
                    info!("Speech fell back to {}", attempt.language);
                    *voice = attempt;
                    return true;
                }
                Err(err) => warn!("Speech failed for {}: {err:#}", attempt.language),
            }
        }
        false
    }

    fn fallback_languages(&self, language: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        if let Some((primary, _)) = language.split_once(['-', '_']) {
            out.push(primary.to_string());
        }
        let fallback = self.fallback_language.trim();
        if !fallback.is_empty()
            && !fallback.eq_ignore_ascii_case(language)
            && !out.iter().any(|l| l.eq_ignore_ascii_case(fallback))
        {
            out.push(fallback.to_string());
        }
        out
    }
}
