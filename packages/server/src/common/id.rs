//! Job identifier generation.
//!
//! Job ids are opaque, URL-safe and greppable: a `j_` prefix followed by
//! 12 characters of URL-safe base64 over 9 random bytes.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;

/// Number of random bytes behind each job id (9 bytes -> 12 base64 chars).
const JOB_ID_RAW_LEN: usize = 9;

/// Generate a fresh job id, e.g. `j_mGx4Qc9vT2-A`.
pub fn new_job_id() -> String {
    let mut raw = [0u8; JOB_ID_RAW_LEN];
    rand::thread_rng().fill_bytes(&mut raw);
    format!("j_{}", URL_SAFE_NO_PAD.encode(raw))
}

/// Check that a string has the shape of a job id.
///
/// Used by routes to reject garbage path parameters before touching the
/// state store.
pub fn is_valid_job_id(candidate: &str) -> bool {
    let Some(body) = candidate.strip_prefix("j_") else {
        return false;
    };
    body.len() == 12
        && body
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_match_the_public_format() {
        for _ in 0..64 {
            let id = new_job_id();
            assert!(is_valid_job_id(&id), "bad id: {id}");
        }
    }

    #[test]
    fn generated_ids_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(new_job_id()));
        }
    }

    #[test]
    fn rejects_wrong_prefix() {
        assert!(!is_valid_job_id("x_abcdefghijkl"));
        assert!(!is_valid_job_id("abcdefghijkl"));
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(!is_valid_job_id("j_short"));
        assert!(!is_valid_job_id("j_waytoolongforajobid"));
    }

    #[test]
    fn rejects_non_urlsafe_characters() {
        assert!(!is_valid_job_id("j_abc/defghij"));
        assert!(!is_valid_job_id("j_abc+defghij"));
    }
}
