#![no_main]

use chrono::DateTime;
use issue_timeline::normalize::{EventNormalizer, IssueContext, AzureDevopsNormalizer};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(record) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };
    let normalizer = AzureDevopsNormalizer::new("Microsoft.VSTS.Scheduling.StoryPoints", "UNASSIGNED");
    let issue = IssueContext {
        issue_id: "WI-1".to_string(),
        created_at: DateTime::UNIX_EPOCH,
    };
    // Must never panic, and blank values never become timeline values.
    if let Ok(events) = normalizer.normalize(&record, &issue) {
        for event in events {
            assert!(event.new_value.as_deref().is_none_or(|v| !v.trim().is_empty()));
        }
    }
});
