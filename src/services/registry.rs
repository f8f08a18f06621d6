//! Durable store of email subscribers and push-capable devices.
//!
//! Subscribers are created on subscribe and deleted on unsubscribe, never
//! mutated. Devices are upserted by push token, soft-deactivated on
//! unregistration and hard-deleted only through the admin endpoint.

use chrono::Utc;
use diesel::prelude::*;
use diesel::PgConnection;

use crate::db::models::{Device, NewDevice, NewSubscriber, Subscriber};
use crate::schema;

#[derive(Debug)]
pub enum RegistryError {
    InvalidEmail(String),
    DuplicateEmail(String),
    Db(String),
}

impl core::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RegistryError::InvalidEmail(e) => write!(f, "invalid email format: {}", e),
            RegistryError::DuplicateEmail(e) => write!(f, "email already subscribed: {}", e),
            RegistryError::Db(e) => write!(f, "database error: {}", e),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Same lax check the original sign-up form used; real validation happens
/// when the welcome email bounces.
pub fn email_looks_valid(email: &str) -> bool {
    email.contains('@') && email.contains('.') && !email.contains(char::is_whitespace) && email.len() >= 5
}

pub fn subscribe(conn: &mut PgConnection, email: &str, location: Option<&str>) -> Result<Subscriber, RegistryError> {
    use schema::subscribers::dsl as S;

    let email = email.trim().to_string();
    if !email_looks_valid(&email) {
        return Err(RegistryError::InvalidEmail(email));
    }

    let already: i64 = S::subscribers
        .filter(S::email.eq(&email))
        .count()
        .get_result(conn)
        .map_err(|e| RegistryError::Db(format!("subscriber lookup failed: {}", e)))?;
    if already > 0 {
        return Err(RegistryError::DuplicateEmail(email));
    }

    let row = NewSubscriber {
        email,
        location: location.map(str::trim).filter(|l| !l.is_empty()).unwrap_or("auto").to_string(),
    };
    diesel::insert_into(S::subscribers)
        .values(&row)
        .get_result(conn)
        .map_err(|e| RegistryError::Db(format!("subscriber insert failed: {}", e)))
}

/// Returns the number of rows removed (0 when the email was unknown, which
/// is not an error: unsubscribing twice is fine).
pub fn unsubscribe(conn: &mut PgConnection, email: &str) -> Result<usize, RegistryError> {
    use schema::subscribers::dsl as S;

    diesel::delete(S::subscribers.filter(S::email.eq(email.trim())))
        .execute(conn)
        .map_err(|e| RegistryError::Db(format!("subscriber delete failed: {}", e)))
}

pub fn list_subscribers(conn: &mut PgConnection) -> Result<Vec<Subscriber>, String> {
    use schema::subscribers::dsl as S;

    S::subscribers
        .order(S::subscribed_at.asc())
        .load(conn)
        .map_err(|e| format!("subscriber list failed: {}", e))
}

/// Upsert by push token; re-registering always reactivates the device.
pub fn register_device(conn: &mut PgConnection, row: NewDevice) -> Result<Device, RegistryError> {
    use schema::devices::dsl as D;

    diesel::insert_into(D::devices)
        .values(&row)
        .on_conflict(D::push_token)
        .do_update()
        .set((
            D::platform.eq(row.platform.clone()),
            D::device_type.eq(row.device_type.clone()),
            D::location.eq(row.location.clone()),
            D::is_active.eq(true),
            D::updated_at.eq(Utc::now()),
        ))
        .get_result(conn)
        .map_err(|e| RegistryError::Db(format!("device upsert failed: {}", e)))
}

pub fn unregister_device(conn: &mut PgConnection, push_token: &str) -> Result<usize, RegistryError> {
    use schema::devices::dsl as D;

    diesel::update(D::devices.filter(D::push_token.eq(push_token)))
        .set((D::is_active.eq(false), D::updated_at.eq(Utc::now())))
        .execute(conn)
        .map_err(|e| RegistryError::Db(format!("device deactivation failed: {}", e)))
}

/// Admin-only hard delete; the regular unregistration path keeps the row.
pub fn delete_device(conn: &mut PgConnection, push_token: &str) -> Result<usize, RegistryError> {
    use schema::devices::dsl as D;

    diesel::delete(D::devices.filter(D::push_token.eq(push_token)))
        .execute(conn)
        .map_err(|e| RegistryError::Db(format!("device delete failed: {}", e)))
}

pub fn list_active_devices(conn: &mut PgConnection) -> Result<Vec<Device>, String> {
    use schema::devices::dsl as D;

    D::devices
        .filter(D::is_active.eq(true))
        .order(D::registered_at.asc())
        .load(conn)
        .map_err(|e| format!("device list failed: {}", e))
}

pub fn subscriber_count(conn: &mut PgConnection) -> Result<i64, String> {
    use schema::subscribers::dsl as S;

    S::subscribers
        .count()
        .get_result(conn)
        .map_err(|e| format!("subscriber count failed: {}", e))
}

pub fn active_device_count(conn: &mut PgConnection) -> Result<i64, String> {
    use schema::devices::dsl as D;

    D::devices
        .filter(D::is_active.eq(true))
        .count()
        .get_result(conn)
        .map_err(|e| format!("device count failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plausible_addresses() {
        assert!(email_looks_valid("activist@example.com"));
        assert!(email_looks_valid("a.b+tag@mail.co"));
    }

    #[test]
    fn rejects_obviously_broken_addresses() {
        assert!(!email_looks_valid("no-at-sign.example.com"));
        assert!(!email_looks_valid("nodot@examplecom"));
        assert!(!email_looks_valid("has space@example.com"));
        assert!(!email_looks_valid("a@b"));
        assert!(!email_looks_valid(""));
    }
}
