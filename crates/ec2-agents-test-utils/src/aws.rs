//! Helpers for the `#[ignore]`d tests that talk to a real AWS account

use chrono::Utc;
use std::sync::atomic::{AtomicU32, Ordering};

const FALLBACK_REGION: &str = "us-east-1";

/// Region for live tests: `AWS_REGION`, then `AWS_DEFAULT_REGION`.
pub fn get_test_region() -> String {
    ["AWS_REGION", "AWS_DEFAULT_REGION"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| FALLBACK_REGION.to_string())
}

/// Identifier unique within the process and across runs.
///
/// ```
/// use ec2_agents_test_utils::aws::test_run_id;
///
/// assert!(test_run_id().starts_with("it-"));
/// ```
pub fn test_run_id() -> String {
    static SEQ: AtomicU32 = AtomicU32::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("it-{}-{seq}", Utc::now().timestamp_millis())
}

/// Controller URL that no real controller uses, so its owner tag matches
/// nothing already running in the account.
pub fn test_controller_url() -> String {
    format!("https://{}.ci.invalid/", test_run_id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_carries_timestamp_and_sequence() {
        let id = test_run_id();
        let (millis, seq) = id
            .strip_prefix("it-")
            .and_then(|rest| rest.split_once('-'))
            .expect("it-<millis>-<seq>");
        millis.parse::<i64>().expect("timestamp");
        seq.parse::<u32>().expect("sequence");
    }

    #[test]
    fn controller_urls_never_repeat() {
        let url = test_controller_url();
        assert!(url.starts_with("https://it-"));
        assert!(url.ends_with(".ci.invalid/"));
        assert_ne!(url, test_controller_url());
    }
}
