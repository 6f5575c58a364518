//! Control messages from the page to the engine.

use serde::{Deserialize, Serialize};

use crate::engine::{CacheEngine, Phase};

/// A message posted to the engine.
///
/// ```json
/// {"type": "SKIP_WAITING"}
/// {"type": "precacheAssets", "assets": ["/icons/192.png"]}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Activate a waiting generation now.
    #[serde(rename = "SKIP_WAITING")]
    SkipWaiting,
    /// Delete every generation other than the current one.
    #[serde(rename = "CLEAR_OLD_CACHES")]
    ClearOldCaches,
    /// Fetch the listed URLs into the current generation.
    #[serde(rename = "precacheAssets")]
    PrecacheAssets {
        /// Absolute URLs or origin paths.
        assets: Vec<String>,
    },
    /// Liveness probe.
    #[serde(rename = "PING")]
    Ping,
}

/// Reply to a [`ControlMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlReply {
    /// Generations removed by activation or cleanup.
    Cleared {
        /// Deleted generation names.
        deleted: Vec<String>,
    },
    /// Precache outcome.
    Precached {
        /// URLs stored.
        cached: Vec<String>,
        /// URLs that failed.
        failed: Vec<String>,
    },
    /// Answer to a ping.
    Pong {
        /// Current generation name.
        generation: String,
        /// Lifecycle phase.
        phase: Phase,
    },
}

impl CacheEngine {
    /// Apply a control message.
    pub async fn handle_message(&self, message: ControlMessage) -> ControlReply {
        tracing::debug!(?message, "Control message");
        match message {
            ControlMessage::SkipWaiting => ControlReply::Cleared {
                deleted: self.skip_waiting().await,
            },
            ControlMessage::ClearOldCaches => ControlReply::Cleared {
                deleted: self.clear_old_caches().await,
            },
            ControlMessage::PrecacheAssets { assets } => {
                let report = self.precache(&assets).await;
                ControlReply::Precached {
                    cached: report.cached,
                    failed: report.failed,
                }
            }
            ControlMessage::Ping => ControlReply::Pong {
                generation: self.generation().to_string(),
                phase: self.phase(),
            },
        }
    }
}
