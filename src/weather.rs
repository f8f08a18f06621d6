//! Blocking HTTP client for a WeatherAPI.com-compatible provider.
//!
//! Two operations feed the anomaly decision:
//! - forecast high for today (`/forecast.json`)
//! - one historical high per prior year, same calendar day (`/history.json`)
//!
//! Historical fetches are best-effort: a failed year is logged and skipped,
//! never retried. Nothing is cached beyond the life of one call.

use chrono::{Datelike, NaiveDate, Utc};
use log::warn;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

const CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum WeatherError {
    Transport(String),
    Http { status: u16, message: String },
    Json(String),
    MissingData(&'static str),
}

impl core::fmt::Display for WeatherError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            WeatherError::Transport(s) => write!(f, "transport error: {}", s),
            WeatherError::Http { status, message } => write!(f, "http {}: {}", status, message),
            WeatherError::Json(e) => write!(f, "json error: {}", e),
            WeatherError::MissingData(what) => write!(f, "response missing {}", what),
        }
    }
}

impl std::error::Error for WeatherError {}

// Just enough of the provider responses to pull out the daily high.

#[derive(Debug, Clone, Deserialize)]
pub struct ForecastResponse {
    pub forecast: Forecast,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Forecast {
    #[serde(default)]
    pub forecastday: Vec<ForecastDay>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForecastDay {
    pub day: Day,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Day {
    pub maxtemp_f: Option<f64>,
}

pub struct WeatherClient {
    agent: ureq::Agent,
    base_url: String,
    api_key: String,
}

impl WeatherClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(CALL_TIMEOUT).build();
        WeatherClient {
            agent,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T, WeatherError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path);
        let mut req = self.agent.get(&url).query("key", &self.api_key);
        for (k, v) in query {
            req = req.query(k, v);
        }

        match req.call() {
            Ok(res) => {
                let mut de = serde_json::Deserializer::from_reader(res.into_reader());
                serde_path_to_error::deserialize(&mut de).map_err(|e| WeatherError::Json(e.to_string()))
            }
            Err(ureq::Error::Transport(t)) => Err(WeatherError::Transport(t.to_string())),
            Err(ureq::Error::Status(status, res)) => {
                let body = res.into_string().unwrap_or_else(|_| String::from("<no body>"));
                Err(WeatherError::Http { status, message: body })
            }
        }
    }

    /// Today's forecast daily high in Fahrenheit.
    pub fn get_forecast_high(&self, location: &str) -> Result<f64, WeatherError> {
        let resp: ForecastResponse =
            self.get_json("forecast.json", &[("q", location), ("days", "1"), ("aqi", "no"), ("alerts", "no")])?;
        extract_daily_high(&resp)
    }

    /// Daily high for one historical date in Fahrenheit.
    pub fn get_historical_high(&self, location: &str, date: NaiveDate) -> Result<f64, WeatherError> {
        let dt = date.format("%Y-%m-%d").to_string();
        let resp: ForecastResponse = self.get_json("history.json", &[("q", location), ("dt", dt.as_str())])?;
        extract_daily_high(&resp)
    }

    /// Daily highs for the same calendar day over the past `years` years.
    /// Best-effort: failed years are skipped, the list may come back short
    /// or even empty.
    pub fn get_historical_highs(&self, location: &str, years: u32) -> Vec<f64> {
        let today = Utc::now().date_naive();
        let mut highs = Vec::with_capacity(years as usize);
        for offset in 1..=years {
            let Some(date) = same_day_years_back(today, offset) else {
                continue;
            };
            match self.get_historical_high(location, date) {
                Ok(high) => highs.push(high),
                Err(e) => warn!("History fetch skipped for {} on {}: {}", location, date, e),
            }
        }
        highs
    }
}

fn extract_daily_high(resp: &ForecastResponse) -> Result<f64, WeatherError> {
    resp.forecast
        .forecastday
        .first()
        .ok_or(WeatherError::MissingData("forecast.forecastday[0]"))?
        .day
        .maxtemp_f
        .ok_or(WeatherError::MissingData("day.maxtemp_f"))
}

/// Same month/day `offset` years earlier; Feb 29 maps to Feb 28 when the
/// target year is not a leap year.
fn same_day_years_back(today: NaiveDate, offset: u32) -> Option<NaiveDate> {
    let year = today.year() - offset as i32;
    NaiveDate::from_ymd_opt(year, today.month(), today.day())
        .or_else(|| NaiveDate::from_ymd_opt(year, 2, 28))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_daily_high_from_forecast_payload() {
        let json = r#"{
            "location": {"name": "New York"},
            "forecast": {
                "forecastday": [
                    {"date": "2026-08-30", "day": {"maxtemp_f": 97.3, "mintemp_f": 78.1}}
                ]
            }
        }"#;
        let resp: ForecastResponse = serde_json::from_str(json).unwrap();
        assert_eq!(extract_daily_high(&resp).unwrap(), 97.3);
    }

    #[test]
    fn missing_forecast_day_is_an_error_not_a_default() {
        let json = r#"{"forecast": {"forecastday": []}}"#;
        let resp: ForecastResponse = serde_json::from_str(json).unwrap();
        assert!(extract_daily_high(&resp).is_err());

        let json = r#"{"forecast": {"forecastday": [{"day": {}}]}}"#;
        let resp: ForecastResponse = serde_json::from_str(json).unwrap();
        assert!(extract_daily_high(&resp).is_err());
    }

    #[test]
    fn historical_dates_keep_month_and_day() {
        let today = NaiveDate::from_ymd_opt(2026, 8, 30).unwrap();
        assert_eq!(same_day_years_back(today, 1), NaiveDate::from_ymd_opt(2025, 8, 30));
        assert_eq!(same_day_years_back(today, 3), NaiveDate::from_ymd_opt(2023, 8, 30));
    }

    #[test]
    fn leap_day_falls_back_to_feb_28() {
        let leap = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        assert_eq!(same_day_years_back(leap, 1), NaiveDate::from_ymd_opt(2023, 2, 28));
        assert_eq!(same_day_years_back(leap, 4), NaiveDate::from_ymd_opt(2020, 2, 29));
    }
}
