//! Bitrate backoff: step the encoder down the ladder when the link is
//! unhealthy, back up one rung at a time once it recovers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::collaborator::Encoder;
use crate::control_loop::{AppliedSide, ControlBinding};
use crate::error::CollaboratorError;
use crate::lock::SharedLockFlag;

/// [`ControlBinding`] over an [`Encoder`] and its bitrate ladder.
///
/// Index 0 is the preferred bitrate; the last index is the floor. The
/// index only moves after the encoder accepted the new rate, and never
/// leaves `0..ladder.len()`.
#[derive(Clone)]
pub struct BitrateBinding {
    encoder: Arc<dyn Encoder>,
    ladder: Arc<[u32]>,
    index: Arc<AtomicUsize>,
}

impl BitrateBinding {
    pub fn new(encoder: Arc<dyn Encoder>) -> Self {
        let preferred = encoder.preferred_bitrate();
        let mut ladder = encoder.bitrate_ladder();
        if ladder.first() != Some(&preferred) {
            ladder.retain(|rate| *rate != preferred);
            ladder.insert(0, preferred);
        }
        Self {
            encoder,
            ladder: ladder.into(),
            index: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn ladder(&self) -> &[u32] {
        &self.ladder
    }

    pub fn index(&self) -> usize {
        self.index.load(Ordering::SeqCst)
    }

    pub fn current_bitrate(&self) -> u32 {
        self.ladder[self.index()]
    }

    fn last_index(&self) -> usize {
        self.ladder.len() - 1
    }

    fn side_of(&self, index: usize) -> AppliedSide {
        if index == 0 {
            AppliedSide::Nominal
        } else if index >= self.last_index() {
            AppliedSide::Floor
        } else {
            AppliedSide::Partial
        }
    }

    async fn move_to(&self, target: usize) -> Result<(), CollaboratorError> {
        let current = self.index();
        if target == current {
            debug!(index = current, bitrate = self.ladder[current], "bitrate already at bound");
            return Ok(());
        }
        let bitrate = self.ladder[target];
        self.encoder.set_bitrate(bitrate).await?;
        self.index.store(target, Ordering::SeqCst);
        info!(
            from = self.ladder[current],
            to = bitrate,
            index = target,
            "bitrate changed"
        );
        Ok(())
    }

    // Operator overrides. Every manual move locks the loop so it stays put;
    // only `reset` hands control back.

    /// One rung down, clamped at the floor.
    pub async fn step_down(&self, lock: &SharedLockFlag) -> Result<(), CollaboratorError> {
        lock.lock();
        let next = (self.index() + 1).min(self.last_index());
        self.move_to(next).await
    }

    /// One rung up, clamped at the preferred bitrate.
    pub async fn step_up(&self, lock: &SharedLockFlag) -> Result<(), CollaboratorError> {
        lock.lock();
        let next = self.index().saturating_sub(1);
        self.move_to(next).await
    }

    /// Jump straight to `bitrate`, which must be one of the ladder rungs.
    pub async fn set_bitrate(
        &self,
        lock: &SharedLockFlag,
        bitrate: u32,
    ) -> Result<(), CollaboratorError> {
        let Some(target) = self.ladder.iter().position(|rate| *rate == bitrate) else {
            return Err(CollaboratorError::failed(
                "set_bitrate",
                format!("{bitrate} bit/s is not on the ladder {:?}", &*self.ladder),
            ));
        };
        lock.lock();
        self.move_to(target).await
    }

    /// Back to the preferred bitrate and unlock the loop.
    pub async fn reset(&self, lock: &SharedLockFlag) -> Result<(), CollaboratorError> {
        self.move_to(0).await?;
        lock.unlock();
        Ok(())
    }
}

#[async_trait]
impl ControlBinding for BitrateBinding {
    fn name(&self) -> &'static str {
        "bitrate"
    }

    async fn applied_side(&self) -> Result<AppliedSide, CollaboratorError> {
        Ok(self.side_of(self.index()))
    }

    async fn degrade(&self) -> Result<(), CollaboratorError> {
        let next = (self.index() + 1).min(self.last_index());
        self.move_to(next).await
    }

    async fn recover(&self) -> Result<(), CollaboratorError> {
        let next = self.index().saturating_sub(1);
        self.move_to(next).await
    }
}
