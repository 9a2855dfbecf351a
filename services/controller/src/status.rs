//! ScanJob status computation.
//!
//! Pure functions from the observed state of a job to its next status.
//! Both reconcilers write status only through these.

use std::time::Duration;

use chrono::{DateTime, Utc};
use vscan_api::{
    condition_reasons as reasons, condition_types as types, Condition, ConditionStatus,
    ScanJobPhase, ScanJobStatus,
};

/// Observed SBOM and report counts of one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub sboms: u32,
    /// Reports that match one of the job's SBOMs.
    pub reports: u32,
}

/// Bound on how often scan tasks of a running job are dispatched.
#[derive(Debug, Clone)]
pub struct DispatchBudget {
    /// Dispatch rounds, the initial one included.
    pub max_task_attempts: u32,
    /// Time allowed for reports to appear after each round.
    pub redispatch_interval: Duration,
}

impl DispatchBudget {
    /// When the round started at `last_dispatch` is considered over.
    pub fn round_deadline(&self, last_dispatch: DateTime<Utc>) -> DateTime<Utc> {
        let interval = chrono::Duration::from_std(self.redispatch_interval)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        last_dispatch.checked_add_signed(interval).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether another dispatch round is due.
    pub fn redispatch_due(&self, status: &ScanJobStatus, now: DateTime<Utc>) -> bool {
        match status.last_dispatch_time {
            None => true,
            Some(last) => {
                status.dispatch_attempts < self.max_task_attempts && now >= self.round_deadline(last)
            }
        }
    }

    /// Whether the last allowed round has run out of time.
    pub fn exhausted(&self, status: &ScanJobStatus, now: DateTime<Utc>) -> bool {
        status.dispatch_attempts >= self.max_task_attempts
            && status
                .last_dispatch_time
                .is_some_and(|last| now >= self.round_deadline(last))
    }
}

/// Recompute the status of a job from its progress.
///
/// Pending jobs are left alone: leaving Pending is the job reconciler's
/// decision. Terminal jobs only get their scanned count refreshed.
pub fn aggregate(
    status: &ScanJobStatus,
    progress: Progress,
    budget: &DispatchBudget,
    now: DateTime<Utc>,
) -> ScanJobStatus {
    let mut next = status.clone();
    match status.phase {
        ScanJobPhase::Pending => {}
        phase if phase.is_terminal() => {
            next.scanned_images_count = progress.reports;
        }
        _ => {
            next.scanned_images_count = progress.reports;
            let all_present = progress.sboms >= status.images_count;
            let all_scanned = progress.reports >= status.images_count;

            if all_present && all_scanned {
                succeed(&mut next, reasons::ALL_SCANNED, "all images scanned", now);
            } else if budget.exhausted(status, now) {
                let message = format!(
                    "{}/{} images scanned after {} dispatch rounds",
                    progress.reports, status.images_count, status.dispatch_attempts
                );
                if progress.reports > 0 {
                    finish(
                        &mut next,
                        ScanJobPhase::PartialFailure,
                        reasons::RETRIES_EXHAUSTED,
                        &message,
                        now,
                    );
                } else {
                    finish(&mut next, ScanJobPhase::Failed, reasons::NO_REPORTS, &message, now);
                }
            } else {
                next.set_condition(
                    Condition::new(
                        types::IN_PROGRESS,
                        ConditionStatus::True,
                        reasons::DISPATCHED,
                        format!("{}/{} images scanned", progress.reports, status.images_count),
                    ),
                    now,
                );
            }
        }
    }
    next
}

/// Pending to Running, with `images` SBOMs to scan.
pub fn running(status: &ScanJobStatus, images: u32, now: DateTime<Utc>) -> ScanJobStatus {
    let mut next = status.clone();
    next.phase = ScanJobPhase::Running;
    next.images_count = images;
    next.scanned_images_count = 0;
    next.start_time.get_or_insert(now);
    next.set_condition(
        Condition::new(
            types::SCHEDULED,
            ConditionStatus::True,
            reasons::DISPATCHED,
            format!("{images} images discovered"),
        ),
        now,
    );
    next.set_condition(
        Condition::new(
            types::IN_PROGRESS,
            ConditionStatus::True,
            reasons::DISPATCHED,
            format!("0/{images} images scanned"),
        ),
        now,
    );
    next
}

/// Record one more dispatch round.
pub fn dispatched(status: &ScanJobStatus, attempts: u32, now: DateTime<Utc>) -> ScanJobStatus {
    let mut next = status.clone();
    if next.phase == ScanJobPhase::Running && next.dispatch_attempts < attempts {
        next.dispatch_attempts = attempts;
        next.last_dispatch_time = Some(now);
    }
    next
}

/// A registry with nothing to scan.
pub fn empty(status: &ScanJobStatus, fail: bool, now: DateTime<Utc>) -> ScanJobStatus {
    let mut next = status.clone();
    next.images_count = 0;
    next.scanned_images_count = 0;
    next.start_time.get_or_insert(now);
    if fail {
        finish(
            &mut next,
            ScanJobPhase::Failed,
            reasons::NO_IMAGES,
            "registry has no eligible images",
            now,
        );
    } else {
        succeed(&mut next, reasons::NO_IMAGES, "registry has no eligible images", now);
    }
    next
}

/// Any non-terminal phase to Failed.
pub fn failed(status: &ScanJobStatus, reason: &str, message: &str, now: DateTime<Utc>) -> ScanJobStatus {
    let mut next = status.clone();
    if !next.phase.is_terminal() {
        finish(&mut next, ScanJobPhase::Failed, reason, message, now);
    }
    next
}

fn succeed(status: &mut ScanJobStatus, reason: &str, message: &str, now: DateTime<Utc>) {
    status.phase = ScanJobPhase::Succeeded;
    status.completion_time = Some(now);
    status.set_condition(
        Condition::new(types::IN_PROGRESS, ConditionStatus::False, reason, message),
        now,
    );
    status.set_condition(
        Condition::new(types::COMPLETE, ConditionStatus::True, reason, message),
        now,
    );
}

fn finish(
    status: &mut ScanJobStatus,
    phase: ScanJobPhase,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) {
    status.phase = phase;
    status.completion_time = Some(now);
    status.set_condition(
        Condition::new(types::IN_PROGRESS, ConditionStatus::False, reason, message),
        now,
    );
    let complete = if phase == ScanJobPhase::PartialFailure {
        ConditionStatus::True
    } else {
        ConditionStatus::False
    };
    status.set_condition(Condition::new(types::COMPLETE, complete, reason, message), now);
    status.set_condition(
        Condition::new(types::FAILED, ConditionStatus::True, reason, message),
        now,
    );
}
