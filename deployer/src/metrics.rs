//! Metrics contains the counter bundle for the executors.

use metrics::{counter, describe_counter};

/// Describe registers metric descriptions with the installed recorder.
pub fn describe() {
    describe_counter!("krograph_applies", "Manifests applied to the cluster");
    describe_counter!("krograph_apply_failures", "Manifest applies that failed");
    describe_counter!(
        "krograph_readiness_polls",
        "Readiness poll attempts against live objects"
    );
    describe_counter!("krograph_rollback_deletions", "Objects deleted during rollback");
}

pub(crate) fn apply() {
    counter!("krograph_applies").increment(1);
}

pub(crate) fn apply_failure() {
    counter!("krograph_apply_failures").increment(1);
}

pub(crate) fn readiness_poll() {
    counter!("krograph_readiness_polls").increment(1);
}

pub(crate) fn rollback_deletion() {
    counter!("krograph_rollback_deletions").increment(1);
}
