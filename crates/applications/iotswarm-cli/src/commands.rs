//! The `simulate` and `send-live-data` commands

use crate::context::{AppContext, LiveOptions, SimulateOptions};
use anyhow::{Context, Result};
use iotswarm_core::CancellationToken;
use iotswarm_live::{PairOutcome, Selection, UploadReport};
use iotswarm_swarm::SwarmReport;
use std::future::Future;
use tracing::warn;

/// Build the swarm and run it until every device stopped
///
/// `shutdown` resolving (Ctrl-C in the binary) cancels the swarm; the
/// report still covers every device.
pub async fn simulate<F>(ctx: &AppContext, options: &SimulateOptions, shutdown: F) -> Result<SwarmReport>
where
    F: Future<Output = ()> + Send + 'static,
{
    let swarm = ctx
        .build_swarm(options)
        .await
        .context("failed to build swarm")?;

    let watcher = tokio::spawn(cancel_on(shutdown, swarm.cancellation_token()));
    let report = swarm.run().await;
    watcher.abort();

    Ok(report)
}

/// One live upload pass over the selected tables and sites
pub async fn send_live_data<F>(ctx: &AppContext, options: &LiveOptions, shutdown: F) -> Result<UploadReport>
where
    F: Future<Output = ()> + Send + 'static,
{
    let store = ctx
        .open_store()
        .await
        .context("failed to open checkpoint store")?;
    let (uploader, tables, fallback_hours) = ctx
        .live_uploader(store, options)
        .context("invalid live upload options")?;
    let sites = Selection::from_args(options.sites.iter().cloned());

    let watcher = tokio::spawn(cancel_on(shutdown, uploader.cancellation_token()));
    let report = uploader.run(&tables, &sites, fallback_hours).await;
    watcher.abort();

    report.context("live upload failed")
}

async fn cancel_on<F: Future<Output = ()>>(shutdown: F, cancel: CancellationToken) {
    shutdown.await;
    warn!("Interrupted, stopping");
    cancel.cancel();
}

/// Human readable summary of a swarm run
pub fn render_swarm_report(report: &SwarmReport) -> String {
    let mut out = format!(
        "swarm {}: {} devices, {} stopped, {} failed, {} messages sent in {:.1}s{}\n",
        report.swarm_name,
        report.devices.len(),
        report.stopped,
        report.failed,
        report.messages_sent(),
        report.elapsed.as_secs_f64(),
        if report.timed_out { " (timed out)" } else { "" },
    );
    for device in &report.devices {
        out.push_str(&format!(
            "  {:<12} {:<8} cycles={} sent={} skipped={} empty={}\n",
            device.site_id,
            device.state.to_string(),
            device.cycles,
            device.messages_sent,
            device.skipped_sends,
            device.empty_queries,
        ));
    }
    for (site_id, error) in &report.errors {
        out.push_str(&format!("  error {site_id}: {error}\n"));
    }
    out
}

/// Human readable summary of a live upload pass
pub fn render_upload_report(report: &UploadReport) -> String {
    let mut out = format!(
        "live upload: {} pairs, {} records forwarded, {} skipped, {} failed in {:.1}s\n",
        report.pairs.len(),
        report.forwarded_records(),
        report.skipped(),
        report.failed(),
        report.elapsed.as_secs_f64(),
    );
    for pair in &report.pairs {
        let outcome = match &pair.outcome {
            PairOutcome::Forwarded {
                records,
                payloads,
                checkpoint,
            } => format!("forwarded {records} records in {payloads} payloads, checkpoint {checkpoint}"),
            PairOutcome::Skipped => "no new records".to_string(),
            PairOutcome::Failed { records, .. } => format!("failed after {records} records"),
            PairOutcome::DryRun { records, payloads } => {
                format!("dry run: {records} records in {payloads} payloads")
            }
        };
        out.push_str(&format!("  {}/{}: {outcome}\n", pair.table, pair.site_id));
    }
    for (label, error) in report.errors() {
        out.push_str(&format!("  error {label}: {error}\n"));
    }
    out
}
