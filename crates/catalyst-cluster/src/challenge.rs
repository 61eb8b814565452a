//! Self-identification challenge.
//!
//! Each process generates one random challenge text at startup. A node asks
//! every registry member for its current challenge; the member that echoes
//! ours back is this node, as addressed from outside.

use rand::distributions::Alphanumeric;
use rand::Rng;

const CHALLENGE_LENGTH: usize = 32;

/// Holds this process's challenge text.
#[derive(Debug, Clone)]
pub struct ChallengeSupervisor {
    challenge: String,
}

impl Default for ChallengeSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ChallengeSupervisor {
    /// Generate a fresh random challenge.
    pub fn new() -> Self {
        let challenge = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(CHALLENGE_LENGTH)
            .map(char::from)
            .collect();
        Self { challenge }
    }

    /// The challenge text, fixed for the lifetime of this supervisor.
    pub fn challenge_text(&self) -> &str {
        &self.challenge
    }

    /// Exact match against our challenge.
    pub fn is_challenge_ok(&self, candidate: &str) -> bool {
        self.challenge == candidate
    }
}
