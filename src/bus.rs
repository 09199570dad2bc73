use crate::model::{QuietWindow, VoiceSettings};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, mpsc};

/// Immediate setting changes pushed from the foreground to the loop.
///
/// Foreground commands deliver these over the local control socket (see
/// [`crate::control`]), one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum ControlMessage {
    SetInterval(u32),
    SetQuietWindow(QuietWindow),
    SetVoice(VoiceSettings),
    SetRepeatCount(u32),
    SetVibration(bool),
    SetClockFormat(Option<bool>),
    Start,
    Stop,
    /// Speak the current time right away without touching the schedule.
    AnnounceNow,
}

pub struct ControlBus {
    tx: mpsc::Sender<ControlMessage>,
    rx: Mutex<mpsc::Receiver<ControlMessage>>,
    pending: AtomicUsize,
}

impl ControlBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
            pending: AtomicUsize::new(0),
        }
    }

    pub async fn publish(&self, msg: ControlMessage) -> anyhow::Result<()> {
        self.pending.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = self.tx.send(msg).await {
            self.pending.fetch_sub(1, Ordering::Relaxed);
            return Err(anyhow::anyhow!("failed to publish control message: {err}"));
        }
        Ok(())
    }

    pub async fn consume(&self) -> Option<ControlMessage> {
        let mut rx = self.rx.lock().await;
        let msg = rx.recv().await;
        if msg.is_some() {
            self.pending.fetch_sub(1, Ordering::Relaxed);
        }
        msg
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_arrive_in_order() -> anyhow::Result<()> {
        let bus = ControlBus::new(8);
        bus.publish(ControlMessage::SetInterval(15)).await?;
        bus.publish(ControlMessage::Stop).await?;
        assert_eq!(bus.pending(), 2);

        assert_eq!(bus.consume().await, Some(ControlMessage::SetInterval(15)));
        assert_eq!(bus.consume().await, Some(ControlMessage::Stop));
        assert_eq!(bus.pending(), 0);
        Ok(())
    }

    #[test]
    fn messages_have_a_stable_wire_form() -> anyhow::Result<()> {
        let line = serde_json::to_string(&ControlMessage::SetInterval(15))?;
        assert_eq!(line, r#"{"type":"setInterval","value":15}"#);
        assert_eq!(
            serde_json::from_str::<ControlMessage>(r#"{"type":"announceNow"}"#)?,
            ControlMessage::AnnounceNow
        );
        assert_eq!(
            serde_json::from_str::<ControlMessage>(r#"{"type":"setClockFormat","value":null}"#)?,
            ControlMessage::SetClockFormat(None)
        );
        Ok(())
    }
}
