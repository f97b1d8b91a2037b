//! Mixer and encoder interfaces the control loops act through.
//!
//! Real clients (OBS websocket, encoder HTTP APIs) live outside this crate.
//! [`RecordingMixer`] and [`RecordingEncoder`] keep state in process and
//! record every call; the CLI's dry-run mode and the tests use them.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::CollaboratorError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamStatus {
    pub streaming: bool,
    pub recording: bool,
}

/// Scene mixer remote control.
#[async_trait]
pub trait Mixer: Send + Sync {
    async fn current_scene(&self) -> Result<String, CollaboratorError>;
    async fn switch_to_scene(&self, scene: &str) -> Result<(), CollaboratorError>;
    async fn start_stream(&self) -> Result<(), CollaboratorError>;
    async fn stop_stream(&self) -> Result<(), CollaboratorError>;
    async fn stream_status(&self) -> Result<StreamStatus, CollaboratorError>;
    /// Hide and re-show a media source so it resumes rendering.
    async fn toggle_source(&self, source: &str) -> Result<(), CollaboratorError>;
}

/// Encoder bitrate control.
#[async_trait]
pub trait Encoder: Send + Sync {
    async fn set_bitrate(&self, bits_per_second: u32) -> Result<(), CollaboratorError>;
    /// Rungs from preferred to most conservative.
    fn bitrate_ladder(&self) -> Vec<u32>;
    fn preferred_bitrate(&self) -> u32;
}

/// Run a collaborator call under a deadline.
pub async fn call_with_timeout<T, F>(
    operation: &'static str,
    limit: Duration,
    call: F,
) -> Result<T, CollaboratorError>
where
    F: Future<Output = Result<T, CollaboratorError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(CollaboratorError::Timeout {
            operation,
            timeout_ms: limit.as_millis() as u64,
        }),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// =============================================================================
// RecordingMixer
// =============================================================================

#[derive(Debug, Default)]
struct MixerState {
    scene: String,
    status: StreamStatus,
    switches: Vec<String>,
    toggles: Vec<String>,
    failing: bool,
    delay: Option<Duration>,
}

/// In-process mixer that records scene switches.
#[derive(Debug, Default)]
pub struct RecordingMixer {
    state: Mutex<MixerState>,
}

impl RecordingMixer {
    pub fn new(initial_scene: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(MixerState {
                scene: initial_scene.into(),
                ..MixerState::default()
            }),
        }
    }

    /// Every scene passed to `switch_to_scene`, in order.
    pub fn switches(&self) -> Vec<String> {
        lock(&self.state).switches.clone()
    }

    pub fn toggles(&self) -> Vec<String> {
        lock(&self.state).toggles.clone()
    }

    pub fn scene(&self) -> String {
        lock(&self.state).scene.clone()
    }

    /// Change the scene out-of-band, as an operator would.
    pub fn set_scene(&self, scene: impl Into<String>) {
        lock(&self.state).scene = scene.into();
    }

    /// Make every call fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        lock(&self.state).failing = failing;
    }

    /// Delay every call, to exercise timeouts.
    pub fn set_delay(&self, delay: Option<Duration>) {
        lock(&self.state).delay = delay;
    }

    async fn enter(&self, operation: &'static str) -> Result<(), CollaboratorError> {
        let (failing, delay) = {
            let state = lock(&self.state);
            (state.failing, state.delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if failing {
            return Err(CollaboratorError::failed(operation, "mixer unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl Mixer for RecordingMixer {
    async fn current_scene(&self) -> Result<String, CollaboratorError> {
        self.enter("current_scene").await?;
        Ok(self.scene())
    }

    async fn switch_to_scene(&self, scene: &str) -> Result<(), CollaboratorError> {
        self.enter("switch_to_scene").await?;
        let mut state = lock(&self.state);
        state.scene = scene.to_string();
        state.switches.push(scene.to_string());
        Ok(())
    }

    async fn start_stream(&self) -> Result<(), CollaboratorError> {
        self.enter("start_stream").await?;
        lock(&self.state).status.streaming = true;
        Ok(())
    }

    async fn stop_stream(&self) -> Result<(), CollaboratorError> {
        self.enter("stop_stream").await?;
        lock(&self.state).status.streaming = false;
        Ok(())
    }

    async fn stream_status(&self) -> Result<StreamStatus, CollaboratorError> {
        self.enter("stream_status").await?;
        Ok(lock(&self.state).status)
    }

    async fn toggle_source(&self, source: &str) -> Result<(), CollaboratorError> {
        self.enter("toggle_source").await?;
        lock(&self.state).toggles.push(source.to_string());
        Ok(())
    }
}

// =============================================================================
// RecordingEncoder
// =============================================================================

#[derive(Debug, Default)]
struct EncoderState {
    current: u32,
    history: Vec<u32>,
    failing: bool,
}

/// In-process encoder that records bitrate changes.
#[derive(Debug)]
pub struct RecordingEncoder {
    ladder: Vec<u32>,
    state: Mutex<EncoderState>,
}

impl RecordingEncoder {
    /// `ladder[0]` is the preferred bitrate.
    pub fn new(ladder: Vec<u32>) -> Self {
        let current = ladder.first().copied().unwrap_or(0);
        Self {
            ladder,
            state: Mutex::new(EncoderState {
                current,
                ..EncoderState::default()
            }),
        }
    }

    pub fn current(&self) -> u32 {
        lock(&self.state).current
    }

    /// Every bitrate passed to `set_bitrate`, in order.
    pub fn history(&self) -> Vec<u32> {
        lock(&self.state).history.clone()
    }

    pub fn set_failing(&self, failing: bool) {
        lock(&self.state).failing = failing;
    }
}

#[async_trait]
impl Encoder for RecordingEncoder {
    async fn set_bitrate(&self, bits_per_second: u32) -> Result<(), CollaboratorError> {
        let mut state = lock(&self.state);
        if state.failing {
            return Err(CollaboratorError::failed("set_bitrate", "encoder unavailable"));
        }
        state.current = bits_per_second;
        state.history.push(bits_per_second);
        Ok(())
    }

    fn bitrate_ladder(&self) -> Vec<u32> {
        self.ladder.clone()
    }

    fn preferred_bitrate(&self) -> u32 {
        self.ladder.first().copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mixer_records_switches_and_toggles() {
        let mixer = RecordingMixer::new("Live");
        mixer.switch_to_scene("BRB").await.unwrap();
        mixer.toggle_source("camera").await.unwrap();
        assert_eq!(mixer.current_scene().await.unwrap(), "BRB");
        assert_eq!(mixer.switches(), vec!["BRB"]);
        assert_eq!(mixer.toggles(), vec!["camera"]);
    }

    #[tokio::test]
    async fn mixer_stream_controls() {
        let mixer = RecordingMixer::new("Live");
        mixer.start_stream().await.unwrap();
        assert!(mixer.stream_status().await.unwrap().streaming);
        mixer.stop_stream().await.unwrap();
        assert!(!mixer.stream_status().await.unwrap().streaming);
    }

    #[tokio::test]
    async fn failing_mixer_reports_operation() {
        let mixer = RecordingMixer::new("Live");
        mixer.set_failing(true);
        let err = mixer.switch_to_scene("BRB").await.unwrap_err();
        assert_eq!(err.operation(), "switch_to_scene");
        assert!(mixer.switches().is_empty());
    }

    #[tokio::test]
    async fn slow_call_times_out() {
        let mixer = RecordingMixer::new("Live");
        mixer.set_delay(Some(Duration::from_millis(200)));
        let err = call_with_timeout(
            "current_scene",
            Duration::from_millis(10),
            mixer.current_scene(),
        )
        .await
        .unwrap_err();
        assert_eq!(
            err,
            CollaboratorError::Timeout {
                operation: "current_scene",
                timeout_ms: 10
            }
        );
    }

    #[tokio::test]
    async fn encoder_records_history() {
        let encoder = RecordingEncoder::new(vec![6000, 3000]);
        assert_eq!(encoder.preferred_bitrate(), 6000);
        assert_eq!(encoder.current(), 6000);
        encoder.set_bitrate(3000).await.unwrap();
        assert_eq!(encoder.history(), vec![3000]);
        encoder.set_failing(true);
        assert!(encoder.set_bitrate(6000).await.is_err());
        assert_eq!(encoder.current(), 3000);
    }
}
