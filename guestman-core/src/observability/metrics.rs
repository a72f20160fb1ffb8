//! Core metrics definitions.
//!
//! All metrics follow Prometheus naming conventions:
//! - `_total` suffix for counters
//! - `_seconds` suffix for histograms measuring duration

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Register all core metrics with descriptions.
pub fn register_core_metrics() {
    // Guest lifecycle
    describe_counter!("guestman_guest_start_total", "Guest start attempts (by result)");
    describe_histogram!(
        "guestman_guest_start_duration_seconds",
        "Time from start request until the emulator process is up"
    );
    describe_counter!("guestman_guest_stop_total", "Guest stops (by mode: graceful, forced)");
    describe_gauge!("guestman_guest_count", "Guests registered with the manager");

    // Tasks
    describe_counter!("guestman_task_total", "Finished tasks (by task, result)");
    describe_histogram!("guestman_task_duration_seconds", "Task run time (by task)");
    describe_gauge!("guestman_worker_active", "Running jobs per worker pool");

    // Monitor / agent
    describe_counter!("guestman_monitor_commands_total", "QMP commands issued (by result)");
    describe_counter!("guestman_monitor_disconnects_total", "Monitor disconnects observed");
    describe_counter!("guestman_qga_commands_total", "Guest agent commands (by result)");

    // Host
    describe_counter!("guestman_cpuset_balance_total", "Cpuset balancer passes (by result)");
    describe_counter!("guestman_pod_container_restarts_total", "Containers restarted by reconcile");
    describe_gauge!("guestman_ports_allocated", "Host ports held by guests (by allocator)");
}

pub fn record_guest_start(result: &str) {
    counter!("guestman_guest_start_total", "result" => result.to_string()).increment(1);
}

pub fn record_guest_start_duration(duration_secs: f64) {
    histogram!("guestman_guest_start_duration_seconds").record(duration_secs);
}

pub fn record_guest_stop(mode: &str) {
    counter!("guestman_guest_stop_total", "mode" => mode.to_string()).increment(1);
}

pub fn set_guest_count(count: usize) {
    gauge!("guestman_guest_count").set(count as f64);
}

pub fn record_task(task: &str, result: &str, duration_secs: f64) {
    counter!("guestman_task_total", "task" => task.to_string(), "result" => result.to_string())
        .increment(1);
    histogram!("guestman_task_duration_seconds", "task" => task.to_string()).record(duration_secs);
}

pub fn set_worker_active(worker: &str, active: usize) {
    gauge!("guestman_worker_active", "worker" => worker.to_string()).set(active as f64);
}

pub fn record_monitor_command(result: &str) {
    counter!("guestman_monitor_commands_total", "result" => result.to_string()).increment(1);
}

pub fn record_monitor_disconnect() {
    counter!("guestman_monitor_disconnects_total").increment(1);
}

pub fn record_qga_command(result: &str) {
    counter!("guestman_qga_commands_total", "result" => result.to_string()).increment(1);
}

pub fn record_cpuset_balance(result: &str) {
    counter!("guestman_cpuset_balance_total", "result" => result.to_string()).increment(1);
}

pub fn record_container_restart() {
    counter!("guestman_pod_container_restarts_total").increment(1);
}
