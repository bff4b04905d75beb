//! Dripway server entry point
//!
//! Serves:
//! - Sequence management API at /api/sequences/*
//! - Enrollment operator API at /api/enrollments/*
//! - Trigger intake at /api/events and /webhook/{sequence_id}
//! - Job-runner callbacks at /api/jobs/results
//! - Health check at /healthz

use dripway::{config::Config, server::start_server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // DRIPWAY_* environment variables over defaults
    let config = Config::default();

    start_server(config).await
}
