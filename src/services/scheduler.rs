//! Steady-cadence evaluation loop (the "cron" trigger).

use diesel::PgConnection;
use log::info;
use std::sync::Arc;
use std::time::Instant;

use crate::config::SharedSettings;
use crate::db::models::trigger_type;
use crate::mailer::Mailer;
use crate::push::PushClient;
use crate::services::evaluation;
use crate::utils::Shutdown;
use crate::weather::WeatherClient;

/// Run evaluation passes until shutdown. The check interval is re-read from
/// the shared settings every tick, so operator changes take effect on the
/// next cycle without a restart. There is no mutex against manually
/// triggered passes; racing runs are tolerated.
pub fn run_loop(
    conn: &mut PgConnection,
    weather: &WeatherClient,
    mailer: &Mailer,
    push: &PushClient,
    settings: &SharedSettings,
    historical_years: u32,
    shutdown: &Arc<Shutdown>,
) {
    loop {
        let tick_start = Instant::now();
        let snapshot = settings.snapshot();

        evaluation::run_pass(
            conn,
            weather,
            mailer,
            push,
            snapshot,
            historical_years,
            trigger_type::SCHEDULED,
        );

        // Maintain steady cadence, but wake immediately on shutdown.
        let elapsed = tick_start.elapsed();
        let interval = settings.snapshot().check_interval;
        let remaining = interval.saturating_sub(elapsed);
        if shutdown.sleep(remaining) {
            info!("Scheduler loop stopping");
            return;
        }
    }
}
