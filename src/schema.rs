//! Handwritten Diesel schema declarations used by model structs.
//!
//! Migrations define the actual tables and constraints. This module only
//! provides `diesel::table!` declarations so we can derive Insertable/Queryable
//! in a type-safe way without running `diesel print-schema`.

diesel::table! {
    subscribers (id) {
        id -> BigInt,
        email -> Text,
        location -> Text,
        subscribed_at -> Timestamptz,
    }
}

diesel::table! {
    devices (id) {
        id -> BigInt,
        push_token -> Text,
        platform -> Nullable<Text>,
        device_type -> Nullable<Text>,
        location -> Text,
        is_active -> Bool,
        registered_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

// Append-only: one row per evaluation pass, never updated.
diesel::table! {
    evaluation_runs (id) {
        id -> BigInt,
        trigger_type -> Text,
        locations_checked -> Jsonb,
        temperatures_found -> Jsonb,
        alerts_triggered -> Integer,
        threshold_used -> Double,
        status -> Text,
        error_message -> Nullable<Text>,
        duration_ms -> BigInt,
        created_at -> Timestamptz,
    }
}

// One row per dispatch attempt. Push rows start as `pending` with a
// provider ticket id and are resolved later by the receipt loop.
diesel::table! {
    notification_attempts (id) {
        id -> BigInt,
        recipient -> Text,
        channel -> Text,
        payload_summary -> Nullable<Text>,
        status -> Text,
        error -> Nullable<Text>,
        push_ticket_id -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    subscribers,
    devices,
    evaluation_runs,
    notification_attempts,
);
