//! Per-flow aggregates, computed from the ledger on every read.
//!
//! The Postgres store aggregates in SQL; [`compute_flow_stats`] is the
//! in-process fold used by the memory store.

use std::collections::{BTreeMap, HashSet};

use uuid::Uuid;

use crate::errors::AppError;
pub use crate::models::flow::FlowStats;
use crate::models::flow::EmailFlow;
use crate::models::scheduled::{EmailStatus, ScheduledEmail};
use crate::models::suppression::normalize_address;
use crate::store::{EmailStore, LedgerStore};

impl FlowStats {
    fn count(&mut self, status: EmailStatus) {
        let slot = match status {
            EmailStatus::Pending => &mut self.pending,
            EmailStatus::Scheduled => &mut self.scheduled,
            EmailStatus::Sending => &mut self.sending,
            EmailStatus::Sent => &mut self.sent,
            EmailStatus::Cancelled => &mut self.cancelled,
            EmailStatus::Failed => &mut self.failed,
            EmailStatus::Suppressed => &mut self.suppressed,
        };
        *slot += 1;
        self.total += 1;
    }
}

#[derive(Hash, PartialEq, Eq)]
enum Recipient {
    User(Uuid),
    Address(String),
}

fn still_live(row: &ScheduledEmail) -> bool {
    row.status.is_open()
        || row.status == EmailStatus::Sending
        || (row.status == EmailStatus::Failed && row.next_retry_at.is_some())
}

/// Folds ledger rows into stats for each flow. Flows without rows get zeroes;
/// rows of unknown flows are ignored.
pub fn compute_flow_stats(
    flows: &[EmailFlow],
    rows: &[ScheduledEmail],
) -> BTreeMap<Uuid, FlowStats> {
    let mut stats: BTreeMap<Uuid, FlowStats> =
        flows.iter().map(|f| (f.id, FlowStats::default())).collect();
    let mut recipients: BTreeMap<Uuid, HashSet<Recipient>> = BTreeMap::new();
    let mut live: BTreeMap<Uuid, HashSet<Uuid>> = BTreeMap::new();

    for row in rows {
        let Some(flow_id) = row.flow_id else { continue };
        let Some(entry) = stats.get_mut(&flow_id) else { continue };

        entry.count(row.status);
        if row.is_test {
            entry.test_count += 1;
        } else {
            entry.production_count += 1;
        }

        let recipient = match row.user_id {
            Some(user_id) => Recipient::User(user_id),
            None => Recipient::Address(normalize_address(&row.email_address)),
        };
        recipients.entry(flow_id).or_default().insert(recipient);

        if let Some(instance) = row.flow_trigger_id.filter(|_| still_live(row)) {
            live.entry(flow_id).or_default().insert(instance);
        }
    }

    for (flow_id, entry) in stats.iter_mut() {
        entry.unique_users = recipients.get(flow_id).map_or(0, |s| s.len() as u64);
        entry.active_instances = live.get(flow_id).map_or(0, |s| s.len() as u64);
    }
    stats
}

pub async fn flow_stats(store: &dyn EmailStore) -> Result<BTreeMap<Uuid, FlowStats>, AppError> {
    store.flow_stats().await
}
