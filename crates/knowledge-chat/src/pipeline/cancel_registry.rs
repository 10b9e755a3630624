//! Stop handles for in-flight answers, keyed by assistant turn id.
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Default)]
pub struct CancelRegistry {
    tokens: DashMap<String, CancellationToken>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stop handle for `turn_id`; it is removed when the returned
    /// registration drops.
    pub fn register(self: &Arc<Self>, turn_id: &str) -> CancelRegistration {
        let token = CancellationToken::new();
        self.tokens.insert(turn_id.to_string(), token.clone());
        debug!("Registered stop handle for turn {}", turn_id);
        CancelRegistration {
            registry: Arc::clone(self),
            turn_id: turn_id.to_string(),
            token,
        }
    }

    /// Trip the stop handle of `turn_id`. False when nothing is running under it.
    pub fn cancel(&self, turn_id: &str) -> bool {
        match self.tokens.get(turn_id) {
            Some(token) => {
                info!("Stopping turn {}", turn_id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active(&self) -> usize {
        self.tokens.len()
    }
}

pub struct CancelRegistration {
    registry: Arc<CancelRegistry>,
    turn_id: String,
    token: CancellationToken,
}

impl CancelRegistration {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        self.registry.tokens.remove(&self.turn_id);
    }
}
