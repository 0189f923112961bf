use metrics::{
    register_convex_histogram,
    StatusTimer,
};

register_convex_histogram!(
    FETCHER_FETCH_SECONDS,
    "Time to stage a source archive to the scratch file",
    &["status"]
);

pub fn fetch_timer() -> StatusTimer {
    StatusTimer::new(&FETCHER_FETCH_SECONDS)
}
