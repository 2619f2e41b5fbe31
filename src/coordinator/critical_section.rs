//! All-or-nothing critical section acquisition across donors
//!
//! Donors are visited in shard id order, the same order for every
//! operation, so two operations sharing donors cannot each hold a guard the
//! other is waiting for. Acquisition is try-only on each donor. On the
//! first refusal every guard already granted is released in reverse order.

use crate::common::utils::retry_with_backoff;
use crate::coordinator::document::{OperationId, ShardId};
use crate::shard::client::ShardDirectory;
use crate::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Retry policy for release calls
#[derive(Debug, Clone, Copy)]
pub struct ReleasePolicy {
    pub retries: usize,
    pub backoff: Duration,
}

/// Enter the critical section on every donor with `fence_token`.
///
/// Returns each donor's fence point: the last change-log sequence number
/// written before its guard took effect.
pub async fn acquire_all(
    directory: &ShardDirectory,
    operation_id: OperationId,
    donors: &BTreeSet<ShardId>,
    fence_token: u64,
    policy: ReleasePolicy,
) -> Result<BTreeMap<ShardId, u64>> {
    let mut fence_points = BTreeMap::new();
    let mut acquired: Vec<&ShardId> = Vec::with_capacity(donors.len());

    for donor in donors {
        let attempt = match directory.get(donor) {
            Ok(client) => client.enter_critical_section(operation_id, fence_token).await,
            Err(e) => Err(e),
        };
        match attempt {
            Ok(final_seq) => {
                fence_points.insert(donor.clone(), final_seq);
                acquired.push(donor);
            }
            Err(e) => {
                tracing::warn!(
                    %operation_id,
                    donor = %donor,
                    fence_token,
                    error = %e,
                    "critical section refused, releasing acquired guards"
                );
                for held in acquired.into_iter().rev() {
                    if let Err(release_err) = release_one(directory, operation_id, held, policy).await {
                        tracing::warn!(
                            %operation_id,
                            donor = %held,
                            error = %release_err,
                            "failed to release critical section"
                        );
                    }
                }
                return Err(e);
            }
        }
    }

    Ok(fence_points)
}

/// Release every donor's guard without committing, in reverse order.
/// Safe when no guard was ever granted.
pub async fn release_all(
    directory: &ShardDirectory,
    operation_id: OperationId,
    donors: &BTreeSet<ShardId>,
    policy: ReleasePolicy,
) -> Result<()> {
    for donor in donors.iter().rev() {
        release_one(directory, operation_id, donor, policy).await?;
    }
    Ok(())
}

async fn release_one(
    directory: &ShardDirectory,
    operation_id: OperationId,
    donor: &str,
    policy: ReleasePolicy,
) -> Result<()> {
    retry_with_backoff(
        || async move {
            directory
                .get(donor)?
                .exit_critical_section(operation_id)
                .await
        },
        policy.retries,
        policy.backoff,
    )
    .await
}
