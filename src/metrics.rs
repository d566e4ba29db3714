use crate::models::JobState;
use metrics::{counter, gauge};
use tracing::trace;

pub fn inc_requests(route: &'static str) {
    trace!(target = "bulk.metrics", route = route, "requests_total_inc");
    counter!("bulk_import_requests_total", "route" => route).increment(1);
}

pub fn job_transition(target: &str, from: JobState, to: JobState) {
    trace!(
        target = "bulk.metrics",
        shop = target,
        from = from.as_str(),
        to = to.as_str(),
        "job_transition"
    );
    counter!(
        "bulk_import_transitions_total",
        "target" => target.to_string(),
        "to" => to.as_str()
    )
    .increment(1);
    if from.is_terminal() != to.is_terminal() {
        let delta = if to.is_terminal() { -1.0 } else { 1.0 };
        gauge!("bulk_import_open_jobs", "target" => target.to_string()).increment(delta);
    }
}

pub fn job_created(target: &str) {
    gauge!("bulk_import_open_jobs", "target" => target.to_string()).increment(1.0);
}

pub fn open_jobs(target: &str, count: usize) {
    trace!(target = "bulk.metrics", shop = target, count, "open_jobs_set");
    gauge!("bulk_import_open_jobs", "target" => target.to_string()).set(count as f64);
}

pub fn records_applied(target: &str, applied: u64, conflicts: u64) {
    trace!(
        target = "bulk.metrics",
        shop = target,
        applied,
        conflicts,
        "records_applied"
    );
    counter!("bulk_import_records_applied_total", "target" => target.to_string())
        .increment(applied);
    counter!("bulk_import_records_conflicted_total", "target" => target.to_string())
        .increment(conflicts);
}

pub fn retry_scheduled(target: &str, stage: &'static str) {
    counter!(
        "bulk_import_retries_total",
        "target" => target.to_string(),
        "stage" => stage
    )
    .increment(1);
}
