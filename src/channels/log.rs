//! Dry-run channel
//!
//! Writes each publication to the log instead of a remote endpoint.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{ChannelResult, DeliveryStatus, Emitter};
use crate::pipeline::Publication;

/// Channel that only logs
#[derive(Debug, Default)]
pub struct LogChannel {
    emitted: AtomicU64,
}

impl LogChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of publications logged so far
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Emitter for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn emit(&self, publication: &Publication) -> ChannelResult<DeliveryStatus> {
        let sequence = self.emitted.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(
            sequence = sequence,
            fingerprint = %publication.fingerprint,
            title = %publication.title,
            link = %publication.link,
            image = ?publication.image_path,
            chars = publication.description.chars().count(),
            "Dry run: publication not sent"
        );
        Ok(DeliveryStatus::success_with_message("log", "dry run").with_remote_id(sequence.to_string()))
    }
}
