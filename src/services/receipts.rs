//! Background reconciliation of push delivery receipts.
//!
//! The push provider acknowledges sends with tickets; actual delivery is
//! resolved later through the receipt endpoint. This loop runs on its own
//! thread, independent of evaluation passes, and flips `pending` push
//! attempts to `delivered` or `delivery_error`. Best-effort only: it is not
//! part of the alerting decision path, and a failed poll just waits for the
//! next tick.

use chrono::{Duration as ChronoDuration, Utc};
use diesel::prelude::*;
use diesel::PgConnection;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::db::models::{attempt_status, channel};
use crate::push::{PushClient, PushReceipt, MAX_RECEIPT_BATCH};
use crate::schema;
use crate::utils::Shutdown;

pub const POLL_INTERVAL: Duration = Duration::from_secs(15 * 60);
/// Attempts older than this are left alone; the provider expires receipts
/// after roughly a day anyway.
pub const LOOKBACK_HOURS: i64 = 24;

pub fn run_loop(conn: &mut PgConnection, push: &PushClient, shutdown: &Arc<Shutdown>) {
    loop {
        if let Err(e) = reconcile_once(conn, push) {
            warn!("Receipt reconciliation pass failed: {}", e);
        }
        if shutdown.sleep(POLL_INTERVAL) {
            info!("Receipt reconciliation loop stopping");
            return;
        }
    }
}

/// One reconciliation pass over the lookback window.
pub fn reconcile_once(conn: &mut PgConnection, push: &PushClient) -> Result<(), String> {
    use schema::notification_attempts::dsl as NA;

    let cutoff = Utc::now() - ChronoDuration::hours(LOOKBACK_HOURS);
    let pending: Vec<(i64, Option<String>)> = NA::notification_attempts
        .filter(NA::channel.eq(channel::PUSH))
        .filter(NA::status.eq(attempt_status::PENDING))
        .filter(NA::push_ticket_id.is_not_null())
        .filter(NA::created_at.gt(cutoff))
        .select((NA::id, NA::push_ticket_id))
        .load(conn)
        .map_err(|e| format!("pending attempt lookup failed: {}", e))?;

    if pending.is_empty() {
        debug!("No pending push receipts to reconcile");
        return Ok(());
    }

    // ticket id -> row ids; duplicates are possible if a ticket was ever
    // recorded twice, resolve them all the same way.
    let mut rows_by_ticket: BTreeMap<String, Vec<i64>> = BTreeMap::new();
    for (row_id, ticket) in pending {
        if let Some(ticket) = ticket {
            rows_by_ticket.entry(ticket).or_default().push(row_id);
        }
    }

    let ticket_ids: Vec<String> = rows_by_ticket.keys().cloned().collect();
    info!("Reconciling {} pending push receipt(s)", ticket_ids.len());

    let mut resolved = 0usize;
    for chunk in ticket_ids.chunks(MAX_RECEIPT_BATCH) {
        let receipts = push
            .get_receipts(chunk)
            .map_err(|e| format!("receipt lookup failed: {}", e))?;
        for (ticket_id, receipt) in receipts {
            let Some(row_ids) = rows_by_ticket.get(&ticket_id) else {
                continue;
            };
            let (status, error) = receipt_outcome(&receipt);
            diesel::update(NA::notification_attempts.filter(NA::id.eq_any(row_ids)))
                .set((NA::status.eq(status), NA::error.eq(error), NA::updated_at.eq(Utc::now())))
                .execute(conn)
                .map_err(|e| format!("receipt status update failed: {}", e))?;
            resolved += row_ids.len();
        }
    }

    info!("Receipt reconciliation resolved {} attempt(s)", resolved);
    Ok(())
}

fn receipt_outcome(receipt: &PushReceipt) -> (&'static str, Option<String>) {
    if receipt.is_ok() {
        (attempt_status::DELIVERED, None)
    } else {
        let detail = receipt
            .message
            .clone()
            .unwrap_or_else(|| format!("provider receipt status: {}", receipt.status));
        (attempt_status::DELIVERY_ERROR, Some(detail))
    }
}

pub fn pending_receipt_count(conn: &mut PgConnection) -> Result<i64, String> {
    use schema::notification_attempts::dsl as NA;

    NA::notification_attempts
        .filter(NA::channel.eq(channel::PUSH))
        .filter(NA::status.eq(attempt_status::PENDING))
        .filter(NA::push_ticket_id.is_not_null())
        .count()
        .get_result(conn)
        .map_err(|e| format!("pending receipt count failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_receipt_marks_delivered() {
        let receipt = PushReceipt {
            status: "ok".to_string(),
            message: None,
        };
        assert_eq!(receipt_outcome(&receipt), (attempt_status::DELIVERED, None));
    }

    #[test]
    fn error_receipt_carries_provider_detail() {
        let receipt = PushReceipt {
            status: "error".to_string(),
            message: Some("DeviceNotRegistered".to_string()),
        };
        let (status, error) = receipt_outcome(&receipt);
        assert_eq!(status, attempt_status::DELIVERY_ERROR);
        assert_eq!(error.as_deref(), Some("DeviceNotRegistered"));
    }

    #[test]
    fn error_receipt_without_message_still_explains() {
        let receipt = PushReceipt {
            status: "error".to_string(),
            message: None,
        };
        let (status, error) = receipt_outcome(&receipt);
        assert_eq!(status, attempt_status::DELIVERY_ERROR);
        assert!(error.unwrap().contains("error"));
    }
}
