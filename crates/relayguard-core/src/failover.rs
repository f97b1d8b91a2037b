//! Scene failover: live scene when the link is healthy, standby when not.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::collaborator::Mixer;
use crate::config::FailoverConfig;
use crate::control_loop::{AppliedSide, ControlBinding};
use crate::error::CollaboratorError;
use crate::lock::SharedLockFlag;

/// [`ControlBinding`] over a scene [`Mixer`].
///
/// The applied side comes from the mixer's current scene on every call,
/// so an operator switching scenes by hand is picked up on the next tick.
#[derive(Clone)]
pub struct FailoverBinding {
    mixer: Arc<dyn Mixer>,
    live_scene: String,
    standby_scene: String,
    media_source: Option<String>,
}

impl FailoverBinding {
    pub fn new(mixer: Arc<dyn Mixer>, config: &FailoverConfig) -> Self {
        Self {
            mixer,
            live_scene: config.live_scene.clone(),
            standby_scene: config.standby_scene.clone(),
            media_source: config.media_source.clone(),
        }
    }

    pub fn live_scene(&self) -> &str {
        &self.live_scene
    }

    pub fn standby_scene(&self) -> &str {
        &self.standby_scene
    }

    /// Operator override: lock the loop and show the standby scene.
    pub async fn go_standby(&self, lock: &SharedLockFlag) -> Result<(), CollaboratorError> {
        lock.lock();
        self.mixer.switch_to_scene(&self.standby_scene).await?;
        info!(scene = %self.standby_scene, "manual switch to standby");
        Ok(())
    }

    /// Operator override: back to live and hand control to the loop again.
    pub async fn go_live(&self, lock: &SharedLockFlag) -> Result<(), CollaboratorError> {
        self.switch_to_live().await?;
        lock.unlock();
        info!(scene = %self.live_scene, "manual switch to live");
        Ok(())
    }

    async fn switch_to_live(&self) -> Result<(), CollaboratorError> {
        self.mixer.switch_to_scene(&self.live_scene).await?;
        if let Some(source) = &self.media_source {
            self.mixer.toggle_source(source).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ControlBinding for FailoverBinding {
    fn name(&self) -> &'static str {
        "failover"
    }

    async fn applied_side(&self) -> Result<AppliedSide, CollaboratorError> {
        let scene = self.mixer.current_scene().await?;
        Ok(if scene == self.standby_scene {
            AppliedSide::Floor
        } else {
            AppliedSide::Nominal
        })
    }

    async fn degrade(&self) -> Result<(), CollaboratorError> {
        self.mixer.switch_to_scene(&self.standby_scene).await
    }

    async fn recover(&self) -> Result<(), CollaboratorError> {
        self.switch_to_live().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::RecordingMixer;

    fn binding(mixer: &Arc<RecordingMixer>, media_source: Option<&str>) -> FailoverBinding {
        let config = FailoverConfig {
            media_source: media_source.map(str::to_string),
            ..FailoverConfig::default()
        };
        FailoverBinding::new(Arc::clone(mixer) as Arc<dyn Mixer>, &config)
    }

    #[tokio::test]
    async fn side_follows_mixer_scene() {
        let mixer = Arc::new(RecordingMixer::new("Live"));
        let failover = binding(&mixer, None);
        assert_eq!(failover.applied_side().await.unwrap(), AppliedSide::Nominal);
        mixer.set_scene("BRB");
        assert_eq!(failover.applied_side().await.unwrap(), AppliedSide::Floor);
        mixer.set_scene("Intermission");
        assert_eq!(failover.applied_side().await.unwrap(), AppliedSide::Nominal);
    }

    #[tokio::test]
    async fn recover_switches_live_and_toggles_media_source() {
        let mixer = Arc::new(RecordingMixer::new("Live"));
        let failover = binding(&mixer, Some("Camera Feed"));
        failover.degrade().await.unwrap();
        failover.recover().await.unwrap();
        assert_eq!(mixer.switches(), vec!["BRB", "Live"]);
        assert_eq!(mixer.toggles(), vec!["Camera Feed"]);
    }

    #[tokio::test]
    async fn manual_overrides_set_and_clear_lock() {
        let mixer = Arc::new(RecordingMixer::new("Live"));
        let failover = binding(&mixer, None);
        let lock = SharedLockFlag::in_memory("scene_lock");

        failover.go_standby(&lock).await.unwrap();
        assert!(lock.get());
        assert_eq!(mixer.scene(), "BRB");

        failover.go_live(&lock).await.unwrap();
        assert!(!lock.get());
        assert_eq!(mixer.scene(), "Live");
    }

    #[tokio::test]
    async fn failed_go_live_keeps_lock() {
        let mixer = Arc::new(RecordingMixer::new("BRB"));
        let failover = binding(&mixer, None);
        let lock = SharedLockFlag::in_memory("scene_lock");
        lock.lock();
        mixer.set_failing(true);
        assert!(failover.go_live(&lock).await.is_err());
        assert!(lock.get());
    }
}
