use std::sync::atomic::{AtomicBool, Ordering};

// The CPU sampler owns the process-wide SIGPROF handler, so only one
// sampling session may run at a time.
static CPU_PROFILER_BUSY: AtomicBool = AtomicBool::new(false);

/// Exclusive hold on the process CPU sampler, released on drop.
///
/// Taken by the `/debug/pprof/profile` and `/debug/pprof/flamegraph`
/// handlers for the length of a sampling window, and by the continuous
/// profiling agent for as long as it runs.
#[derive(Debug)]
pub struct CpuProfilerClaim(());

impl CpuProfilerClaim {
    /// `None` while another claim is held.
    pub fn acquire() -> Option<Self> {
        CPU_PROFILER_BUSY
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CpuProfilerClaim(()))
    }

    pub fn is_held() -> bool {
        CPU_PROFILER_BUSY.load(Ordering::Acquire)
    }
}

impl Drop for CpuProfilerClaim {
    fn drop(&mut self) {
        CPU_PROFILER_BUSY.store(false, Ordering::Release);
    }
}
