//! Push-mode Pyroscope agent.

use std::panic;
use std::sync::Once;

use envconfig::Envconfig;
use profiler::CpuProfilerClaim;
use pyroscope::pyroscope::PyroscopeAgentRunning;
use pyroscope::PyroscopeAgent;
use pyroscope_pprofrs::{pprof_backend, PprofConfig};

static PANIC_HOOK_INSTALLED: Once = Once::new();

pub const DEFAULT_SERVER_ADDRESS: &str = "http://localhost:4040";
pub const DEFAULT_APPLICATION_NAME: &str = "diag-server";

#[derive(Envconfig, Clone, Debug, PartialEq, Eq)]
pub struct ContinuousProfilingConfig {
    #[envconfig(default = "http://localhost:4040")]
    pub pyroscope_server_address: String,

    #[envconfig(default = "diag-server")]
    pub pyroscope_application_name: String,

    #[envconfig(default = "100")]
    pub pyroscope_sample_rate: u32,
}

/// A running Pyroscope agent. Profiling stops when it is dropped.
///
/// Holds the process CPU sampler for its whole life, so on-demand CPU
/// profiles are refused while it runs.
pub struct RunningAgent {
    agent: Option<PyroscopeAgent<PyroscopeAgentRunning>>,
    _cpu: CpuProfilerClaim,
}

impl Drop for RunningAgent {
    fn drop(&mut self) {
        // The claim is released only after the agent has let go of SIGPROF
        if let Some(agent) = self.agent.take() {
            match agent.stop() {
                Ok(ready) => ready.shutdown(),
                Err(e) => tracing::warn!(error = %e, "Stopping pyroscope agent"),
            }
        }
    }
}

impl Default for ContinuousProfilingConfig {
    fn default() -> Self {
        Self {
            pyroscope_server_address: DEFAULT_SERVER_ADDRESS.to_string(),
            pyroscope_application_name: DEFAULT_APPLICATION_NAME.to_string(),
            pyroscope_sample_rate: 100,
        }
    }
}

/// Log panics from pyroscope's internal threads instead of letting them
/// surface through the default hook; other threads keep the default behavior.
fn install_panic_safe_hook() {
    PANIC_HOOK_INSTALLED.call_once(|| {
        let default_hook = panic::take_hook();
        panic::set_hook(Box::new(move |panic_info| {
            let thread = std::thread::current();
            let thread_name = thread.name().unwrap_or("<unnamed>");

            if thread_name.to_lowercase().contains("pyroscope") {
                tracing::error!(
                    thread = %thread_name,
                    panic = %panic_info,
                    "Pyroscope thread panicked, profiling degraded"
                );
            } else {
                default_hook(panic_info);
            }
        }));
    });
}

impl ContinuousProfilingConfig {
    /// Start pushing CPU samples to the configured collector.
    ///
    /// The returned agent must be kept alive for as long as profiling should run.
    pub fn start_agent(&self) -> Result<RunningAgent, ContinuousProfilingError> {
        if self.pyroscope_server_address.is_empty() {
            return Err(ContinuousProfilingError::MissingServerAddress);
        }

        let cpu = CpuProfilerClaim::acquire().ok_or(ContinuousProfilingError::CpuProfilerBusy)?;

        install_panic_safe_hook();

        tracing::info!(
            server_address = %self.pyroscope_server_address,
            app_name = %self.pyroscope_application_name,
            sample_rate = %self.pyroscope_sample_rate,
            "Starting pyroscope agent"
        );

        let agent = PyroscopeAgent::builder(
            &self.pyroscope_server_address,
            &self.pyroscope_application_name,
        )
        .backend(pprof_backend(
            PprofConfig::new().sample_rate(self.pyroscope_sample_rate),
        ))
        .build()
        .map_err(ContinuousProfilingError::Build)?;

        let agent = agent.start().map_err(ContinuousProfilingError::Start)?;

        tracing::info!("Pyroscope agent started");

        Ok(RunningAgent {
            agent: Some(agent),
            _cpu: cpu,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ContinuousProfilingError {
    #[error("pyroscope server address is empty")]
    MissingServerAddress,

    #[error("CPU profiler already in use")]
    CpuProfilerBusy,

    #[error("failed to build pyroscope agent: {0}")]
    Build(pyroscope::error::PyroscopeError),

    #[error("failed to start pyroscope agent: {0}")]
    Start(pyroscope::error::PyroscopeError),
}
