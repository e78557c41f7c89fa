//! Link-statistics reconciliation: discover links, keep yesterday's bucket, persist.

use bitstats_adapters::StatsApi;
use bitstats_core::{decompose, GroupId, Link, StatsRecord};
use bitstats_storage::RecordSink;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{LinkFailurePolicy, SyncError};

/// Index of the prior day's bucket in the service's click sequence.
const YESTERDAY_INDEX: usize = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    TooFewSamples(usize),
    NotYesterday { date: String },
}

#[derive(Debug)]
pub enum LinkOutcome {
    Skipped(SkipReason),
    Persisted(StatsRecord),
    /// Only produced under `LinkFailurePolicy::Continue`.
    Failed(LinkFailure),
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkFailure {
    pub link_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub group: GroupId,
    pub links_total: usize,
    pub persisted: usize,
    pub skipped: usize,
    pub failures: Vec<LinkFailure>,
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcileOptions {
    pub policy: LinkFailurePolicy,
    pub channel_capacity: usize,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            policy: LinkFailurePolicy::Abort,
            channel_capacity: 16,
        }
    }
}

/// Run one reconciliation pass against `api`, writing qualifying records to `sink`.
///
/// `yesterday` is the `YYYY-MM-DD` cutoff computed once by the caller. Group and
/// link discovery failures are always fatal; per-link failures follow
/// `options.policy`.
pub async fn reconcile(
    api: &dyn StatsApi,
    sink: &dyn RecordSink,
    token: &str,
    yesterday: &str,
    options: ReconcileOptions,
) -> Result<ReconcileReport, SyncError> {
    let group = api.list_group_id(token).await?;
    let links = api.list_links(token, &group).await?;
    let links_total = links.len();
    info!(%group, links = links_total, yesterday, "links discovered");

    let (tx, mut rx) = mpsc::channel::<Link>(options.channel_capacity.max(1));
    let producer = tokio::spawn(async move {
        for link in links {
            if tx.send(link).await.is_err() {
                break;
            }
        }
    });

    let mut report = ReconcileReport {
        group,
        links_total,
        persisted: 0,
        skipped: 0,
        failures: Vec::new(),
    };
    let mut remaining = links_total;

    while remaining > 0 {
        let Some(link) = rx.recv().await else {
            break;
        };
        remaining -= 1;

        let outcome = match process_link(api, sink, token, yesterday, &link).await {
            Ok(outcome) => outcome,
            Err(err) if options.policy == LinkFailurePolicy::Abort => {
                drop(rx);
                if let Err(join_err) = producer.await {
                    warn!(error = %join_err, "link producer task failed");
                }
                return Err(err);
            }
            Err(err) => {
                warn!(link_id = %link.id, error = %err, "link failed, continuing");
                LinkOutcome::Failed(LinkFailure {
                    link_id: link.id.clone(),
                    error: err.to_string(),
                })
            }
        };

        match outcome {
            LinkOutcome::Persisted(record) => {
                debug!(link = %record.link, date = %record.date, clicks = record.clicks, "link persisted");
                report.persisted += 1;
            }
            LinkOutcome::Skipped(reason) => {
                debug!(link_id = %link.id, ?reason, "link skipped");
                report.skipped += 1;
            }
            LinkOutcome::Failed(failure) => report.failures.push(failure),
        }
    }

    drop(rx);
    producer
        .await
        .map_err(|err| anyhow::anyhow!("link producer task failed: {err}"))?;

    info!(
        persisted = report.persisted,
        skipped = report.skipped,
        failed = report.failures.len(),
        "reconciliation finished"
    );
    Ok(report)
}

/// Fetch clicks for one link and persist yesterday's bucket if present.
pub async fn process_link(
    api: &dyn StatsApi,
    sink: &dyn RecordSink,
    token: &str,
    yesterday: &str,
    link: &Link,
) -> Result<LinkOutcome, SyncError> {
    let samples = api.get_click_samples(token, &link.id).await?;

    let Some(sample) = samples.get(YESTERDAY_INDEX) else {
        return Ok(LinkOutcome::Skipped(SkipReason::TooFewSamples(samples.len())));
    };
    if !sample.is_for_day(yesterday) {
        return Ok(LinkOutcome::Skipped(SkipReason::NotYesterday {
            date: sample.date.clone(),
        }));
    }

    let parts = decompose(&link.long_url).map_err(|source| SyncError::MalformedUrl {
        link_id: link.id.clone(),
        source,
    })?;
    let record = StatsRecord::new(link, sample, parts);
    sink.insert(&record).await?;
    Ok(LinkOutcome::Persisted(record))
}
