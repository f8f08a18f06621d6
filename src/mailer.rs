//! Transactional email over blocking SMTP, plus the campaign message bodies.

use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};

#[derive(Debug)]
pub enum MailError {
    Address(String),
    Build(String),
    Smtp(String),
}

impl core::fmt::Display for MailError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MailError::Address(s) => write!(f, "bad address: {}", s),
            MailError::Build(s) => write!(f, "message build failed: {}", s),
            MailError::Smtp(s) => write!(f, "smtp error: {}", s),
        }
    }
}

impl std::error::Error for MailError {}

pub struct Mailer {
    transport: SmtpTransport,
    from: Mailbox,
}

impl Mailer {
    pub fn new(host: &str, port: u16, username: &str, password: &str) -> Result<Self, MailError> {
        let from: Mailbox = username.parse().map_err(|e| MailError::Address(format!("{}", e)))?;
        let transport = SmtpTransport::starttls_relay(host)
            .map_err(|e| MailError::Smtp(e.to_string()))?
            .port(port)
            .credentials(Credentials::new(username.to_string(), password.to_string()))
            .build();
        Ok(Mailer { transport, from })
    }

    pub fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
        let to: Mailbox = to.parse().map_err(|e| MailError::Address(format!("{}", e)))?;
        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .body(body.to_string())
            .map_err(|e| MailError::Build(e.to_string()))?;
        self.transport.send(&message).map_err(|e| MailError::Smtp(e.to_string()))?;
        Ok(())
    }
}

pub fn alert_subject(location: &str) -> String {
    format!("Climate Alert - {} - IT'S TOO HOT!", location)
}

pub fn alert_body(location: &str, current_f: f64, average_f: f64, threshold_f: f64) -> String {
    format!(
        "CLIMATE ALERT - Time to Take Action!\n\
         \n\
         Location: {location}\n\
         Today's Forecast High: {current_f:.1}°F\n\
         Historical Average: {average_f:.1}°F\n\
         Climate Anomaly: +{anomaly:.1}°F above normal\n\
         \n\
         Temperatures are {threshold_f:.0}°F+ higher than historical averages for this\n\
         time of year. This is not just hot weather.\n\
         \n\
         ACTION:\n\
         - Wear your \"IT'S TOO HOT!\" shirt today\n\
         - Start conversations about climate change\n\
         - Share this alert\n\
         \n\
         #TooHot #ClimateAction #ClimateChange\n",
        location = location,
        current_f = current_f,
        average_f = average_f,
        anomaly = current_f - average_f,
        threshold_f = threshold_f,
    )
}

pub fn welcome_subject() -> String {
    "Welcome to the Climate Movement - IT'S TOO HOT!".to_string()
}

pub fn welcome_body(location: &str, threshold_f: f64) -> String {
    format!(
        "Welcome to the Climate Movement!\n\
         \n\
         Thank you for joining the \"IT'S TOO HOT!\" climate awareness campaign.\n\
         \n\
         What happens next:\n\
         - We'll monitor temperatures in your area ({location})\n\
         - When temperatures are {threshold_f:.0}°F+ hotter than historical averages,\n\
           you'll get an alert\n\
         - Wear your \"IT'S TOO HOT!\" shirt on those days to raise awareness\n\
         \n\
         #TooHot #ClimateAction #ClimateChange\n\
         \n\
         ---\n\
         To unsubscribe, reply to this email with \"unsubscribe\"\n",
        location = location,
        threshold_f = threshold_f,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_body_reports_the_anomaly_delta() {
        let body = alert_body("New York", 104.0, 90.0, 1.0);
        assert!(body.contains("New York"));
        assert!(body.contains("104.0°F"));
        assert!(body.contains("90.0°F"));
        assert!(body.contains("+14.0°F"));
    }

    #[test]
    fn welcome_body_names_location_and_threshold() {
        let body = welcome_body("Boston", 10.0);
        assert!(body.contains("Boston"));
        assert!(body.contains("10°F+"));
    }
}
