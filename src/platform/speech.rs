use crate::config::SpeechConfig;
use crate::model::VoiceSettings;
use crate::platform::SpeechEngine;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::time::{Duration, timeout};
use tracing::{info, warn};
use which::which;

/// Runs an external synthesizer (espeak-ng, say, ...) once per utterance and
/// waits for it to exit.
pub struct CommandSpeech {
    program: PathBuf,
    args: Vec<String>,
    timeout_s: u64,
}

impl CommandSpeech {
    pub fn new(program: PathBuf, args: Vec<String>, timeout_s: u64) -> Self {
        Self {
            program,
            args,
            timeout_s,
        }
    }

    pub fn render_args(&self, text: &str, voice: &VoiceSettings) -> Vec<String> {
        render_args(&self.args, text, voice)
    }
}

pub fn render_args(template: &[String], text: &str, voice: &VoiceSettings) -> Vec<String> {
    let volume = voice.volume.clamp(0.0, 1.0);
    let rate = voice.rate.clamp(0.0, 1.0);
    let amplitude = (volume * 200.0).round() as u32;
    let wpm = (80.0 + rate * 190.0).round() as u32;
    let language = voice.language.to_ascii_lowercase();
    template
        .iter()
        .map(|arg| {
            arg.replace("{language}", &language)
                .replace("{volume}", &format!("{volume:.2}"))
                .replace("{rate}", &format!("{rate:.2}"))
                .replace("{amplitude}", &amplitude.to_string())
                .replace("{wpm}", &wpm.to_string())
                .replace("{text}", text)
        })
        .collect()
}

#[async_trait]
impl SpeechEngine for CommandSpeech {
    fn name(&self) -> &str {
        "command"
    }

    fn awaits_completion(&self) -> bool {
        true
    }

    async fn speak(&self, text: &str, voice: &VoiceSettings) -> Result<()> {
        let mut process = Command::new(&self.program);
        process
            .args(self.render_args(text, voice))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let output = timeout(Duration::from_secs(self.timeout_s), process.output())
            .await
            .map_err(|_| anyhow!("speech timed out after {} seconds", self.timeout_s))??;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status.code().unwrap_or(-1),
                stderr.trim()
            ));
        }
        Ok(())
    }
}

/// Writes utterances to the log. Used when no synthesizer is installed.
pub struct LogSpeech;

#[async_trait]
impl SpeechEngine for LogSpeech {
    fn name(&self) -> &str {
        "log"
    }

    fn awaits_completion(&self) -> bool {
        true
    }

    async fn speak(&self, text: &str, voice: &VoiceSettings) -> Result<()> {
        info!("[{}] {text}", voice.language);
        Ok(())
    }
}

pub fn build_speech(config: &SpeechConfig) -> Arc<dyn SpeechEngine> {
    let command = config.command.trim();
    if command.is_empty() || command.eq_ignore_ascii_case("log") {
        return Arc::new(LogSpeech);
    }
    match which(command) {
        Ok(program) => {
            info!("Speech backend: {}", program.display());
            Arc::new(CommandSpeech::new(
                program,
                config.args.clone(),
                config.timeout_secs.max(1),
            ))
        }
        Err(err) => {
            warn!("Speech command {command:?} not found ({err}), announcements go to the log");
            Arc::new(LogSpeech)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_substituted() {
        let template: Vec<String> = SpeechConfig::default().args;
        let voice = VoiceSettings {
            language: "en-US".to_string(),
            volume: 0.5,
            rate: 0.5,
        };
        let args = render_args(&template, "It's 10:15 AM", &voice);
        assert_eq!(
            args,
            vec!["-v", "en-us", "-a", "100", "-s", "175", "It's 10:15 AM"]
        );
    }

    #[test]
    fn out_of_range_voice_values_are_clamped() {
        let template = vec!["{volume}".to_string(), "{rate}".to_string()];
        let voice = VoiceSettings {
            language: "en".to_string(),
            volume: 4.0,
            rate: -1.0,
        };
        assert_eq!(render_args(&template, "", &voice), vec!["1.00", "0.00"]);
    }

    #[test]
    fn missing_command_falls_back_to_log() {
        let config = SpeechConfig {
            command: "definitely-not-a-speech-engine-xyz".to_string(),
            ..SpeechConfig::default()
        };
        assert_eq!(build_speech(&config).name(), "log");
        let config = SpeechConfig {
            command: "log".to_string(),
            ..SpeechConfig::default()
        };
        assert_eq!(build_speech(&config).name(), "log");
    }

    #[tokio::test]
    async fn log_speech_always_succeeds() {
        assert!(LogSpeech.speak("hello", &VoiceSettings::default()).await.is_ok());
    }
}
