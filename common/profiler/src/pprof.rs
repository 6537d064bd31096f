use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::Query,
    http::{
        header::{CONTENT_ENCODING, CONTENT_TYPE},
        StatusCode,
    },
    response::{IntoResponse, Response},
};
use flate2::write::GzEncoder;
use flate2::Compression;
use pprof::{flamegraph::Options, protos::Message, Report};
use serde::Deserialize;
use tokio::time::sleep;
use tracing::warn;

use crate::claim::CpuProfilerClaim;

const DEFAULT_SECONDS: u64 = 30;
const MAX_SECONDS: u64 = 300;
const DEFAULT_FREQUENCY: i32 = 100;
const DEFAULT_IMAGE_WIDTH: usize = 2500;

#[derive(Deserialize, Default)]
pub struct ProfileQueryParams {
    // seconds to sample before taking the snapshot
    pub seconds: Option<u64>,
    // sampling frequency in Hz
    pub frequency: Option<i32>,

    // flamegraph SVG width
    pub image_width: Option<usize>,
}

impl ProfileQueryParams {
    fn seconds(&self) -> u64 {
        self.seconds.unwrap_or(DEFAULT_SECONDS).clamp(1, MAX_SECONDS)
    }

    fn frequency(&self) -> i32 {
        self.frequency.unwrap_or(DEFAULT_FREQUENCY).max(1)
    }
}

//
// curl -sSL "http://<HOST>:<PORT>/debug/pprof/profile?seconds=10&frequency=200" > profile.pb.gz
//
// curl -sSL "http://<HOST>:<PORT>/debug/pprof/flamegraph?seconds=10&image_width=2500" > flamegraph.svg.gz
//
// curl -sSL "http://<HOST>:<PORT>/debug/pprof/heap" > heap.pb.gz
//
// curl -sSL "http://<HOST>:<PORT>/debug/pprof/heap/flamegraph" > heap.svg
//
// Heap profiles need the allocator installed with `used_with_profiling!()`.
//

pub async fn handle_index() -> &'static str {
    "Types of profiles available:\n\
     cmdline     The command line invocation of the current program\n\
     profile     CPU profile in gzipped pprof format, ?seconds=N&frequency=HZ\n\
     flamegraph  CPU profile rendered as a gzipped SVG flamegraph, ?seconds=N&image_width=PX\n\
     heap        Sampled live allocations in gzipped pprof format\n\
     allocs      Same as heap\n\
     heap/flamegraph  Sampled live allocations rendered as an SVG flamegraph\n"
}

/// NUL-separated command line of the running process.
pub async fn handle_cmdline() -> String {
    std::env::args().collect::<Vec<_>>().join("\0")
}

pub async fn handle_profile(Query(params): Query<ProfileQueryParams>) -> Response {
    let Some(_claim) = CpuProfilerClaim::acquire() else {
        return cpu_profiler_busy();
    };
    let result = async {
        let report = sample(params.frequency(), params.seconds()).await?;
        let profile = report.pprof().context("Failed to build pprof profile")?;
        let mut raw = Vec::new();
        profile
            .encode(&mut raw)
            .context("Failed to encode pprof profile")?;
        gzip(&raw)
    }
    .await;

    into_gzip_response(result, "application/octet-stream")
}

pub async fn handle_flamegraph(Query(params): Query<ProfileQueryParams>) -> Response {
    let Some(_claim) = CpuProfilerClaim::acquire() else {
        return cpu_profiler_busy();
    };
    let image_width = params.image_width.unwrap_or(DEFAULT_IMAGE_WIDTH);
    let result = async {
        let report = sample(params.frequency(), params.seconds()).await?;
        let mut options = Options::default();
        options.image_width = Some(image_width);
        let mut svg = Vec::new();
        report
            .flamegraph_with_options(&mut svg, &mut options)
            .context("Failed to render flamegraph")?;
        gzip(&svg)
    }
    .await;

    into_gzip_response(result, "image/svg+xml")
}

pub async fn handle_heap() -> Result<impl IntoResponse, (StatusCode, String)> {
    let mut prof_ctl = jemalloc_pprof::PROF_CTL
        .as_ref()
        .ok_or_else(heap_profiling_disabled)?
        .lock()
        .await;
    require_profiling_activated(&prof_ctl)?;

    let pprof = prof_ctl
        .dump_pprof()
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok(([(CONTENT_TYPE, "application/octet-stream")], pprof))
}

pub async fn handle_heap_flamegraph() -> Result<impl IntoResponse, (StatusCode, String)> {
    let mut prof_ctl = jemalloc_pprof::PROF_CTL
        .as_ref()
        .ok_or_else(heap_profiling_disabled)?
        .lock()
        .await;
    require_profiling_activated(&prof_ctl)?;

    let svg = prof_ctl
        .dump_flamegraph()
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Response::builder()
        .header(CONTENT_TYPE, "image/svg+xml")
        .body(Body::from(svg))
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
}

fn heap_profiling_disabled() -> (StatusCode, String) {
    (
        StatusCode::FORBIDDEN,
        "jemalloc profiling not activated".into(),
    )
}

fn require_profiling_activated(
    prof_ctl: &jemalloc_pprof::JemallocProfCtl,
) -> Result<(), (StatusCode, String)> {
    if prof_ctl.activated() {
        Ok(())
    } else {
        Err((StatusCode::FORBIDDEN, "heap profiling not activated".into()))
    }
}

fn cpu_profiler_busy() -> Response {
    (
        StatusCode::CONFLICT,
        [(CONTENT_TYPE, "text/plain")],
        "CPU profiler already in use (profiling session or continuous profiling agent)",
    )
        .into_response()
}

async fn sample(frequency: i32, seconds: u64) -> Result<Report> {
    let guard = pprof::ProfilerGuardBuilder::default()
        .frequency(frequency)
        .blocklist(&["libc", "libgcc", "pthread", "vdso"])
        .build()
        .context("Failed to start CPU profiler")?;

    sleep(Duration::from_secs(seconds)).await;

    guard
        .report()
        .build()
        .context("Failed to build profiler report")
}

fn gzip(raw: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(raw).context("Failed to compress profile")?;
    encoder.finish().context("Failed to finish compressing profile")
}

fn into_gzip_response(result: Result<Vec<u8>>, content_type: &'static str) -> Response {
    match result {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, content_type), (CONTENT_ENCODING, "gzip")],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "pprof: profile collection failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(CONTENT_TYPE, "text/plain")],
                format!("{e:#}"),
            )
                .into_response()
        }
    }
}
