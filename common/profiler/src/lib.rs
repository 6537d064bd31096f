//! CPU and heap profiling endpoints served under [`PPROF_PREFIX`](router::PPROF_PREFIX).
//!
//! Use `apply_pprof_routes` when building the axum::Router of your service.

#[cfg(target_env = "msvc")]
pub use std::alloc::System as DefaultAllocator;
#[cfg(not(target_env = "msvc"))]
pub use tikv_jemallocator::Jemalloc as DefaultAllocator;

pub mod claim;
pub mod pprof;
pub mod router;

pub use claim::CpuProfilerClaim;
pub use router::{apply_pprof_routes, PPROF_PREFIX};

// Install jemalloc with heap sampling enabled in a binary crate. Without it the
// heap routes answer 403.
#[macro_export]
macro_rules! used_with_profiling {
    () => {
        #[global_allocator]
        static GLOBAL: $crate::DefaultAllocator = $crate::DefaultAllocator;

        #[allow(non_upper_case_globals)]
        #[export_name = "malloc_conf"]
        static malloc_conf: &[u8] = b"prof:true,prof_active:true,lg_prof_sample:19\0";
    };
}
