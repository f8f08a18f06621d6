//! One evaluation pass: weather lookup per location, anomaly decision,
//! notification fan-out, and the append-only run record.
//!
//! The pass is deliberately sequential (location by location, subscriber by
//! subscriber) and tolerates concurrent invocation from multiple triggers:
//! each pass writes an independent run row and there is no cross-run
//! suppression, so two racing triggers may both dispatch. That is accepted
//! behavior, not something this module tries to prevent.

use diesel::prelude::*;
use diesel::PgConnection;
use log::{error, info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use crate::anomaly;
use crate::config::Settings;
use crate::db::models::{run_status, Device, EvaluationRun, NewEvaluationRun, NewNotificationAttempt, Subscriber};
use crate::mailer::{self, Mailer};
use crate::push::{PushClient, PushMessage, MAX_SEND_BATCH};
use crate::schema;
use crate::services::registry;
use crate::weather::{WeatherClient, WeatherError};

/// Where `"auto"` and blank locations resolve to.
pub const FALLBACK_LOCATION: &str = "New York";

/// Outcome of a single pass; also the HTTP trigger's response body.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub trigger_type: String,
    pub locations_checked: Vec<String>,
    pub temperatures_found: BTreeMap<String, f64>,
    pub alerts_triggered: i32,
    pub threshold_used: f64,
    pub status: String,
    pub error_message: Option<String>,
    pub duration_ms: i64,
}

pub fn resolve_location(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("auto") {
        FALLBACK_LOCATION.to_string()
    } else {
        trimmed.to_string()
    }
}

fn group_by_resolved_location<T>(items: Vec<T>, location_of: impl Fn(&T) -> &str) -> BTreeMap<String, Vec<T>> {
    let mut grouped: BTreeMap<String, Vec<T>> = BTreeMap::new();
    for item in items {
        let key = resolve_location(location_of(&item));
        grouped.entry(key).or_default().push(item);
    }
    grouped
}

/// Per-location decision, separated from the I/O that feeds it. A failed
/// forecast fetch skips the location; anything else goes through the
/// anomaly evaluator.
enum LocationAssessment {
    Skipped { error: String },
    Checked { current_f: f64, evaluation: anomaly::Evaluation },
}

fn assess_location(
    location: &str,
    forecast: Result<f64, WeatherError>,
    history: &[f64],
    threshold_f: f64,
) -> LocationAssessment {
    match forecast {
        Err(e) => LocationAssessment::Skipped {
            error: format!("forecast fetch failed for {}: {}", location, e),
        },
        Ok(current_f) => LocationAssessment::Checked {
            current_f,
            evaluation: anomaly::evaluate(current_f, history, threshold_f),
        },
    }
}

fn final_status(persistence_failed: bool, degraded: bool) -> &'static str {
    if persistence_failed {
        run_status::ERROR
    } else if degraded {
        run_status::PARTIAL
    } else {
        run_status::SUCCESS
    }
}

/// Run one full evaluation pass and record it. Never fails outright: every
/// error is folded into the returned report and the run row.
pub fn run_pass(
    conn: &mut PgConnection,
    weather: &WeatherClient,
    mailer: &Mailer,
    push: &PushClient,
    settings: Settings,
    historical_years: u32,
    trigger: &str,
) -> RunReport {
    let started = Instant::now();
    info!(
        "Evaluation pass starting (trigger={}, threshold={}°F)",
        trigger, settings.threshold_f
    );

    let mut temperatures = BTreeMap::new();
    let mut alerts_triggered = 0i32;
    let mut degraded = false;
    let mut persistence_failed = false;
    let mut first_error: Option<String> = None;
    let mut locations_checked: Vec<String> = Vec::new();

    let registry_load = match registry::list_subscribers(conn) {
        Ok(subs) => registry::list_active_devices(conn).map(|devs| (subs, devs)),
        Err(e) => Err(e),
    };

    match registry_load {
        Err(e) => {
            error!("Evaluation aborted, registry unavailable: {}", e);
            persistence_failed = true;
            first_error = Some(e);
        }
        Ok((subscribers, devices)) => {
            let subscribers_by_location = group_by_resolved_location(subscribers, |s: &Subscriber| s.location.as_str());
            let devices_by_location = group_by_resolved_location(devices, |d: &Device| d.location.as_str());

            let locations: BTreeSet<String> = subscribers_by_location
                .keys()
                .chain(devices_by_location.keys())
                .cloned()
                .collect();

            for location in &locations {
                locations_checked.push(location.clone());

                let forecast = weather.get_forecast_high(location);
                let history = match forecast {
                    Ok(_) => weather.get_historical_highs(location, historical_years),
                    Err(_) => Vec::new(),
                };
                let (current_f, eval) = match assess_location(location, forecast, &history, settings.threshold_f) {
                    LocationAssessment::Skipped { error } => {
                        warn!("{}; skipping location", error);
                        degraded = true;
                        if first_error.is_none() {
                            first_error = Some(error);
                        }
                        continue;
                    }
                    LocationAssessment::Checked { current_f, evaluation } => (current_f, evaluation),
                };
                temperatures.insert(location.clone(), current_f);

                if eval.used_fallback {
                    // Degraded data, not real history; say so loudly.
                    warn!(
                        "No historical data for {}; using fallback average {}°F",
                        location,
                        anomaly::FALLBACK_AVERAGE_F
                    );
                    degraded = true;
                }

                if !eval.is_anomalous {
                    info!(
                        "{}: forecast {:.1}°F vs avg {:.1}°F, no anomaly",
                        location, current_f, eval.average_f
                    );
                    continue;
                }

                alerts_triggered += 1;
                info!(
                    "{}: forecast {:.1}°F vs avg {:.1}°F (+{:.1}°F), firing alerts",
                    location,
                    current_f,
                    eval.average_f,
                    current_f - eval.average_f
                );

                let subs_here = subscribers_by_location.get(location).map(Vec::as_slice).unwrap_or(&[]);
                let devices_here = devices_by_location.get(location).map(Vec::as_slice).unwrap_or(&[]);

                match dispatch_for_location(
                    conn,
                    mailer,
                    push,
                    location,
                    current_f,
                    eval.average_f,
                    settings.threshold_f,
                    subs_here,
                    devices_here,
                ) {
                    Ok(failures) if failures > 0 => degraded = true,
                    Ok(_) => {}
                    Err(e) => {
                        // Store write failed: abandon the rest of this
                        // location, keep what prior locations already did.
                        error!("Persistence failure while alerting {}: {}", location, e);
                        persistence_failed = true;
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                }
            }
        }
    }

    let report = RunReport {
        trigger_type: trigger.to_string(),
        locations_checked,
        temperatures_found: temperatures,
        alerts_triggered,
        threshold_used: settings.threshold_f,
        status: final_status(persistence_failed, degraded).to_string(),
        error_message: first_error,
        duration_ms: started.elapsed().as_millis() as i64,
    };

    if let Err(e) = log_run(conn, &report) {
        error!("Failed to record evaluation run: {}", e);
    }
    info!(
        "Evaluation pass done: {} location(s), {} alert(s), status={}, {}ms",
        report.locations_checked.len(),
        report.alerts_triggered,
        report.status,
        report.duration_ms
    );
    report
}

/// Email every subscriber at the location, then send exactly one push batch
/// set covering its active devices. Every attempt is written before this
/// returns. Returns the number of dispatch failures; a persistence error
/// aborts the location.
#[allow(clippy::too_many_arguments)]
fn dispatch_for_location(
    conn: &mut PgConnection,
    mailer: &Mailer,
    push: &PushClient,
    location: &str,
    current_f: f64,
    average_f: f64,
    threshold_f: f64,
    subscribers: &[Subscriber],
    devices: &[Device],
) -> Result<usize, String> {
    let mut failures = 0usize;

    let subject = mailer::alert_subject(location);
    let body = mailer::alert_body(location, current_f, average_f, threshold_f);
    let summary = format!(
        "climate alert for {} ({:.1}°F vs {:.1}°F avg)",
        location, current_f, average_f
    );

    for subscriber in subscribers {
        let attempt = match mailer.send(&subscriber.email, &subject, &body) {
            Ok(()) => NewNotificationAttempt::email(&subscriber.email, &summary).succeeded(),
            Err(e) => {
                warn!("Alert email to {} failed: {}", subscriber.email, e);
                failures += 1;
                NewNotificationAttempt::email(&subscriber.email, &summary).failed(e.to_string())
            }
        };
        insert_attempt(conn, &attempt)?;
    }

    let messages = build_push_messages(devices, location, current_f, average_f);
    for chunk in messages.chunks(MAX_SEND_BATCH) {
        match push.send_batch(chunk) {
            Ok(tickets) => {
                let mut tickets = tickets.into_iter();
                for message in chunk {
                    let base = NewNotificationAttempt::push(&message.to, &summary);
                    let attempt = match tickets.next() {
                        Some(ticket) if ticket.is_ok() => match ticket.id {
                            Some(id) => base.with_ticket(id),
                            None => base.failed("ok ticket without id"),
                        },
                        Some(ticket) => {
                            failures += 1;
                            base.failed(ticket.message.unwrap_or_else(|| "provider rejected message".to_string()))
                        }
                        None => {
                            failures += 1;
                            base.failed("no ticket returned for message")
                        }
                    };
                    insert_attempt(conn, &attempt)?;
                }
            }
            Err(e) => {
                // One bad chunk does not block the others.
                warn!("Push batch for {} failed ({} message(s)): {}", location, chunk.len(), e);
                failures += 1;
                for message in chunk {
                    let attempt = NewNotificationAttempt::push(&message.to, &summary).failed(e.to_string());
                    insert_attempt(conn, &attempt)?;
                }
            }
        }
    }

    Ok(failures)
}

fn build_push_messages(devices: &[Device], location: &str, current_f: f64, average_f: f64) -> Vec<PushMessage> {
    devices
        .iter()
        .map(|device| PushMessage {
            to: device.push_token.clone(),
            title: format!("IT'S TOO HOT in {}!", location),
            body: format!(
                "Forecast high {:.0}°F, {:.0}°F above the historical average. Wear the shirt.",
                current_f,
                current_f - average_f
            ),
            data: Some(serde_json::json!({
                "location": location,
                "current_f": current_f,
                "average_f": average_f,
            })),
        })
        .collect()
}

fn insert_attempt(conn: &mut PgConnection, attempt: &NewNotificationAttempt) -> Result<(), String> {
    use schema::notification_attempts::dsl as NA;

    diesel::insert_into(NA::notification_attempts)
        .values(attempt)
        .execute(conn)
        .map_err(|e| format!("notification attempt insert failed: {}", e))?;
    Ok(())
}

fn run_row(report: &RunReport) -> Result<NewEvaluationRun, String> {
    Ok(NewEvaluationRun {
        trigger_type: report.trigger_type.clone(),
        locations_checked: serde_json::to_value(&report.locations_checked)
            .map_err(|e| format!("locations serialization failed: {}", e))?,
        temperatures_found: serde_json::to_value(&report.temperatures_found)
            .map_err(|e| format!("temperatures serialization failed: {}", e))?,
        alerts_triggered: report.alerts_triggered,
        threshold_used: report.threshold_used,
        status: report.status.clone(),
        error_message: report.error_message.clone(),
        duration_ms: report.duration_ms,
    })
}

/// Append one run row. Append-only: the row carries no identity or conflict
/// target, so calling this twice writes two independent rows.
pub fn log_run(conn: &mut PgConnection, report: &RunReport) -> Result<(), String> {
    use schema::evaluation_runs::dsl as ER;

    diesel::insert_into(ER::evaluation_runs)
        .values(&run_row(report)?)
        .execute(conn)
        .map_err(|e| format!("evaluation run insert failed: {}", e))?;
    Ok(())
}

pub fn latest_run(conn: &mut PgConnection) -> Result<Option<EvaluationRun>, String> {
    use schema::evaluation_runs::dsl as ER;

    ER::evaluation_runs
        .order(ER::created_at.desc())
        .first(conn)
        .optional()
        .map_err(|e| format!("latest run lookup failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn subscriber(email: &str, location: &str) -> Subscriber {
        Subscriber {
            id: 0,
            email: email.to_string(),
            location: location.to_string(),
            subscribed_at: Utc::now(),
        }
    }

    fn device(token: &str, location: &str) -> Device {
        Device {
            id: 0,
            push_token: token.to_string(),
            platform: Some("ios".to_string()),
            device_type: None,
            location: location.to_string(),
            is_active: true,
            registered_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn auto_and_blank_locations_resolve_to_fallback() {
        assert_eq!(resolve_location("auto"), FALLBACK_LOCATION);
        assert_eq!(resolve_location("AUTO"), FALLBACK_LOCATION);
        assert_eq!(resolve_location("  "), FALLBACK_LOCATION);
        assert_eq!(resolve_location(""), FALLBACK_LOCATION);
        assert_eq!(resolve_location(" Boston "), "Boston");
    }

    #[test]
    fn shared_locations_collapse_to_one_group() {
        // Three subscribers in New York (one via "auto") -> a single
        // location, i.e. a single push batch set for the whole group.
        let subs = vec![
            subscriber("a@example.com", "New York"),
            subscriber("b@example.com", "auto"),
            subscriber("c@example.com", " New York "),
        ];
        let grouped = group_by_resolved_location(subs, |s: &Subscriber| s.location.as_str());
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[FALLBACK_LOCATION].len(), 3);
    }

    #[test]
    fn distinct_locations_stay_distinct() {
        let subs = vec![
            subscriber("a@example.com", "New York"),
            subscriber("b@example.com", "Boston"),
            subscriber("c@example.com", "auto"),
        ];
        let grouped = group_by_resolved_location(subs, |s: &Subscriber| s.location.as_str());
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped["New York"].len(), 2);
        assert_eq!(grouped["Boston"].len(), 1);
    }

    #[test]
    fn push_messages_cover_every_device_and_chunk_under_limit() {
        let devices: Vec<Device> = (0..MAX_SEND_BATCH + 5)
            .map(|i| device(&format!("token-{}", i), "New York"))
            .collect();
        let messages = build_push_messages(&devices, "New York", 104.0, 90.0);
        assert_eq!(messages.len(), MAX_SEND_BATCH + 5);

        let chunks: Vec<_> = messages.chunks(MAX_SEND_BATCH).collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), MAX_SEND_BATCH);
        assert_eq!(chunks[1].len(), 5);
        assert_eq!(messages[0].to, "token-0");
        assert!(messages[0].body.contains("104"));
    }

    #[test]
    fn failed_forecast_skips_location_and_run_goes_partial() {
        // Provider 500 for one location must not take down the pass: that
        // location is skipped, the rest are still evaluated, and the run
        // degrades to partial rather than error.
        let history = [90.0, 92.0, 88.0];
        let plan: Vec<(&str, Result<f64, WeatherError>)> = vec![
            (
                "Boston",
                Err(WeatherError::Http {
                    status: 500,
                    message: "internal server error".to_string(),
                }),
            ),
            ("New York", Ok(104.0)),
        ];

        let mut degraded = false;
        let mut temperatures: BTreeMap<String, f64> = BTreeMap::new();
        let mut alerts_triggered = 0;
        for (location, forecast) in plan {
            match assess_location(location, forecast, &history, 1.0) {
                LocationAssessment::Skipped { error } => {
                    degraded = true;
                    assert!(error.contains("Boston"));
                    assert!(error.contains("500"));
                }
                LocationAssessment::Checked { current_f, evaluation } => {
                    temperatures.insert(location.to_string(), current_f);
                    if evaluation.is_anomalous {
                        alerts_triggered += 1;
                    }
                }
            }
        }

        assert!(!temperatures.contains_key("Boston"));
        assert_eq!(temperatures["New York"], 104.0);
        assert_eq!(alerts_triggered, 1);
        assert_eq!(final_status(false, degraded), run_status::PARTIAL);
    }

    #[test]
    fn logging_a_report_twice_builds_two_fresh_rows() {
        let report = RunReport {
            trigger_type: "test".to_string(),
            locations_checked: vec!["New York".to_string()],
            temperatures_found: BTreeMap::from([("New York".to_string(), 104.0)]),
            alerts_triggered: 1,
            threshold_used: 1.0,
            status: run_status::SUCCESS.to_string(),
            error_message: None,
            duration_ms: 12,
        };

        let first = run_row(&report).unwrap();
        let second = run_row(&report).unwrap();

        // No identity or conflict target on the row: the same report logged
        // twice produces two equal, independent inserts.
        assert_eq!(first.trigger_type, second.trigger_type);
        assert_eq!(first.locations_checked, serde_json::json!(["New York"]));
        assert_eq!(second.temperatures_found, serde_json::json!({"New York": 104.0}));
        assert_eq!(first.alerts_triggered, 1);
        assert_eq!(first.status, run_status::SUCCESS);
        assert!(first.error_message.is_none());
    }

    #[test]
    fn status_prefers_error_over_partial() {
        assert_eq!(final_status(false, false), run_status::SUCCESS);
        assert_eq!(final_status(false, true), run_status::PARTIAL);
        assert_eq!(final_status(true, false), run_status::ERROR);
        assert_eq!(final_status(true, true), run_status::ERROR);
    }
}
