//! Status fingerprints for conditional reads.
//!
//! A fingerprint is a digest of `(status, updated_at)`. It is never stored:
//! any holder of a job record can derive it. Because every transition strictly
//! advances `updated_at`, every transition yields a new fingerprint.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::job::JobStatus;

/// Hex characters kept from the digest.
const FINGERPRINT_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(status: JobStatus, updated_at: DateTime<Utc>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(status.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(
            updated_at
                .to_rfc3339_opts(SecondsFormat::Micros, true)
                .as_bytes(),
        );
        let digest = hasher.finalize();

        let mut hex = String::with_capacity(FINGERPRINT_LEN);
        for byte in digest.iter().take(FINGERPRINT_LEN / 2) {
            hex.push_str(&format!("{byte:02x}"));
        }
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Render as a strong HTTP entity tag (quoted).
    pub fn to_etag(&self) -> String {
        format!("\"{}\"", self.0)
    }

    /// Whether a conditional token (an `If-None-Match` value or a bare
    /// fingerprint) names this fingerprint.
    ///
    /// Accepts quoted or bare tags, weak tags (`W/"…"`), comma-separated lists
    /// and `*`.
    pub fn matches(&self, token: &str) -> bool {
        token.split(',').map(str::trim).any(|candidate| {
            if candidate == "*" {
                return true;
            }
            let candidate = candidate.strip_prefix("W/").unwrap_or(candidate);
            let candidate = candidate
                .strip_prefix('"')
                .and_then(|c| c.strip_suffix('"'))
                .unwrap_or(candidate);
            candidate == self.0
        })
    }
}

impl core::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    #[test]
    fn stable_for_the_same_state() {
        let at = Utc::now();
        assert_eq!(
            Fingerprint::of(JobStatus::Queued, at),
            Fingerprint::of(JobStatus::Queued, at)
        );
    }

    #[test]
    fn matches_quoted_weak_and_listed_tags() {
        let fp = Fingerprint::of(JobStatus::Processing, Utc::now());
        assert!(fp.matches(fp.as_str()));
        assert!(fp.matches(&fp.to_etag()));
        assert!(fp.matches(&format!("W/{}", fp.to_etag())));
        assert!(fp.matches(&format!("\"other\", {}", fp.to_etag())));
        assert!(fp.matches("*"));
        assert!(!fp.matches("\"other\""));
    }

    proptest! {
        #[test]
        fn differs_when_status_or_time_differs(offset_us in 1i64..1_000_000, a in 0usize..5, b in 0usize..5) {
            let at = Utc::now();
            let later = at + Duration::microseconds(offset_us);
            let (sa, sb) = (JobStatus::ALL[a], JobStatus::ALL[b]);

            prop_assert_ne!(Fingerprint::of(sa, at), Fingerprint::of(sb, later));
            if sa != sb {
                prop_assert_ne!(Fingerprint::of(sa, at), Fingerprint::of(sb, at));
            }
        }
    }
}
