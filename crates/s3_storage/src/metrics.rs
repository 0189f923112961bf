use metrics::{
    register_convex_histogram,
    StatusTimer,
};

register_convex_histogram!(
    S3_STORAGE_PUT_OBJECT_SECONDS,
    "Time to PutObject to S3",
    &["status"]
);
pub fn put_object_timer() -> StatusTimer {
    StatusTimer::new(&S3_STORAGE_PUT_OBJECT_SECONDS)
}
