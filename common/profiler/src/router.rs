use axum::{routing::get, Router};

use crate::pprof::{
    handle_cmdline, handle_flamegraph, handle_heap, handle_heap_flamegraph, handle_index,
    handle_profile,
};

/// Path prefix shared by every profiling route.
pub const PPROF_PREFIX: &str = "/debug/pprof";

// Call this when building the axum::Router of your service
pub fn apply_pprof_routes(router: Router) -> Router {
    router
        .route("/debug/pprof/", get(handle_index))
        .route("/debug/pprof/cmdline", get(handle_cmdline))
        .route("/debug/pprof/profile", get(handle_profile))
        .route("/debug/pprof/flamegraph", get(handle_flamegraph))
        .route("/debug/pprof/heap", get(handle_heap))
        .route("/debug/pprof/allocs", get(handle_heap))
        .route("/debug/pprof/heap/flamegraph", get(handle_heap_flamegraph))
}
