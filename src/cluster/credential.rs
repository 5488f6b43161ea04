//! Replication Credential
//!
//! Inter-node requests carry a token derived from a shared secret and the
//! current hour: `hex(sha256("<secret>:<hour>"))`. Receivers accept the
//! current and previous hour so a request straddling the boundary passes.

use chrono::Utc;
use sha2::{Digest, Sha256};

/// Header carrying the token on peer requests.
pub const REPLICATION_HEADER: &str = "x-replication-secret";

const WINDOW_SECS: i64 = 3600;

#[derive(Clone)]
pub struct ReplicationCredential {
    secret: String,
}

impl std::fmt::Debug for ReplicationCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ReplicationCredential(..)")
    }
}

impl ReplicationCredential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn current_window() -> i64 {
        Utc::now().timestamp() / WINDOW_SECS
    }

    fn token_for_window(&self, window: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b":");
        hasher.update(window.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Token to attach to outgoing requests.
    pub fn token(&self) -> String {
        self.token_for_window(Self::current_window())
    }

    /// Checks a presented token against the current and previous window.
    pub fn verify(&self, presented: &str) -> bool {
        let window = Self::current_window();
        [window, window - 1]
            .iter()
            .any(|w| constant_time_eq(self.token_for_window(*w).as_bytes(), presented.as_bytes()))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_roundtrip() {
        let credential = ReplicationCredential::new("s3cret");
        assert!(credential.verify(&credential.token()));
    }

    #[test]
    fn test_previous_window_accepted() {
        let credential = ReplicationCredential::new("s3cret");
        let previous = credential.token_for_window(ReplicationCredential::current_window() - 1);
        assert!(credential.verify(&previous));

        let stale = credential.token_for_window(ReplicationCredential::current_window() - 2);
        assert!(!credential.verify(&stale));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let ours = ReplicationCredential::new("s3cret");
        let theirs = ReplicationCredential::new("other");
        assert!(!ours.verify(&theirs.token()));
        assert!(!ours.verify(""));
    }

    #[test]
    fn test_debug_hides_secret() {
        let credential = ReplicationCredential::new("s3cret");
        assert!(!format!("{:?}", credential).contains("s3cret"));
    }
}
