//! Failed-job reconciliation.
//!
//! A process that dies between failing a job and refunding it leaves a
//! dangling reservation. The sweep walks every failed job, a page at a time,
//! and posts the missing refunds.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::credits::{CreditReservationService, Settlement};
use crate::jobs::{JobStore, JobStoreError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub scanned: usize,
    pub refunded: usize,
    pub errors: usize,
}

pub struct Reconciler {
    jobs: Arc<dyn JobStore>,
    credits: CreditReservationService,
}

impl Reconciler {
    pub fn new(jobs: Arc<dyn JobStore>, credits: CreditReservationService) -> Self {
        Self { jobs, credits }
    }

    /// Settle every failed job, reading `page_size` jobs per store call.
    /// Per-job errors are logged and counted.
    #[instrument(skip(self), err)]
    pub async fn run_once(&self, page_size: usize) -> Result<ReconcileReport, JobStoreError> {
        let page_size = page_size.max(1);
        let mut report = ReconcileReport::default();
        let mut cursor = None;

        loop {
            let page = self.jobs.list_failed(cursor, page_size).await?;
            let Some(last) = page.last() else { break };
            cursor = Some(last.id);
            let full = page.len() == page_size;

            for job in page {
                report.scanned += 1;
                match self.credits.settle_failed_job(&job).await {
                    Ok(Settlement::Refunded(entry)) => {
                        report.refunded += 1;
                        info!(job_id = %job.id, amount = entry.amount, "settled dangling reservation");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        report.errors += 1;
                        warn!(job_id = %job.id, error = %e, "failed to settle job");
                    }
                }
            }

            if !full {
                break;
            }
        }

        info!(
            scanned = report.scanned,
            refunded = report.refunded,
            errors = report.errors,
            "reconciliation finished"
        );
        Ok(report)
    }
}
