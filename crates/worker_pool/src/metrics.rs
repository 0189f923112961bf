use metrics::{
    log_counter,
    log_gauge,
    register_convex_counter,
    register_convex_gauge,
};

register_convex_counter!(
    WORKER_POOL_TASKS_COMPLETED_TOTAL,
    "Number of tasks a worker pool completed successfully"
);
register_convex_counter!(
    WORKER_POOL_TASKS_FAILED_TOTAL,
    "Number of tasks a worker pool gave up on"
);
register_convex_gauge!(
    WORKER_POOL_WORKERS_INFO,
    "Number of workers spawned for the most recently started pool"
);

pub fn log_task_completed() {
    log_counter(&WORKER_POOL_TASKS_COMPLETED_TOTAL, 1);
}

pub fn log_task_failed() {
    log_counter(&WORKER_POOL_TASKS_FAILED_TOTAL, 1);
}

pub fn set_worker_count(count: usize) {
    log_gauge(&WORKER_POOL_WORKERS_INFO, count as f64);
}
