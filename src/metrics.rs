use tracing::trace;

// Trace-level counters; the Prometheus recorder picks these up only once
// metrics macros are wired in.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "salesignal.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "salesignal.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn dispatch_result(path: &'static str, success: bool) {
    trace!(
        target = "salesignal.metrics",
        path = path,
        success = success,
        "dispatch_attempts_total_inc"
    );
}
