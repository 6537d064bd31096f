use std::str::FromStr;
use std::time::Duration;

use continuous_profiling::ContinuousProfilingConfig;
use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3366")]
    pub port: u16,

    #[envconfig(default = "true")]
    pub enable_metrics: bool,

    #[envconfig(default = "true")]
    pub enable_healthz: bool,

    #[envconfig(default = "false")]
    pub enable_pprof: bool,

    #[envconfig(default = "false")]
    pub enable_pyroscope: bool,

    #[envconfig(default = "1000")]
    pub heartbeat_signal_interval_ms: EnvMsDuration,

    #[envconfig(default = "2000")]
    pub heartbeat_ack_timeout_ms: EnvMsDuration,

    #[envconfig(default = "10000")]
    pub shutdown_timeout_ms: EnvMsDuration,

    #[envconfig(nested = true)]
    pub profiling: ContinuousProfilingConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl std::fmt::Display for ParseEnvMsDurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("expected a duration in milliseconds")
    }
}

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(Duration::from_millis(ms)))
    }
}
