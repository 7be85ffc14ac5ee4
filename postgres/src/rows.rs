//! Row decoding and error mapping.

use queueline_core::error::StoreError;
use queueline_core::schedule::{HourWindow, OperatingHours};
use queueline_core::types::{
    CancellationRecord, ContactInfo, Feedback, Rating, Service, ServiceId, Ticket, TicketId, TicketReference,
};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::Row;
use std::str::FromStr;

/// Column list for `queue_services` selects and `RETURNING` clauses.
pub const SERVICE_COLUMNS: &str = "id, name, ticket_prefix, is_open, open_start, open_end, \
    break_start, break_end, lunch_start, lunch_end, estimated_service_minutes, \
    max_tickets_per_day, last_issued_number, issued_today, issued_on, current_ticket_number";

/// Column list for `queue_tickets` selects and `RETURNING` clauses.
pub const TICKET_COLUMNS: &str = "id, service_id, ticket_number, reference_prefix, reference_year, \
    reference_seq, reference_suffix, short_code, security_token, priority, state, contact, \
    created_at, called_at, served_at, completed_at, cancelled_at, cancelled_by, \
    cancellation_reason, rating, feedback_comment, feedback_at";

/// Map a sqlx failure onto the store taxonomy.
///
/// Pool exhaustion, I/O failures and serialization conflicts are transient.
/// Unique violations name the clashing field from the constraint.
pub fn map_err(operation: &'static str, error: sqlx::Error) -> StoreError {
    let mapped = match &error {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => StoreError::Duplicate {
            field: duplicate_field(db_err.constraint()),
        },
        sqlx::Error::Database(db_err)
            if matches!(db_err.code().as_deref(), Some("40001" | "40P01" | "57P01")) =>
        {
            StoreError::Unavailable(error.to_string())
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(error.to_string())
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            StoreError::Corrupt(error.to_string())
        }
        _ => StoreError::Database(error.to_string()),
    };
    metrics::counter!("queue_store_errors_total", "operation" => operation, "kind" => error_kind(&mapped))
        .increment(1);
    tracing::debug!(operation, error = %error, "store_query_failed");
    mapped
}

const fn error_kind(error: &StoreError) -> &'static str {
    match error {
        StoreError::Duplicate { .. } => "duplicate",
        StoreError::Unavailable(_) => "unavailable",
        StoreError::Corrupt(_) => "corrupt",
        _ => "database",
    }
}

fn duplicate_field(constraint: Option<&str>) -> &'static str {
    match constraint {
        Some("queue_tickets_number_key") => "ticket_number",
        Some("queue_tickets_reference_key") => "reference",
        Some("queue_tickets_short_code_key") => "short_code",
        Some("queue_tickets_security_token_key") => "security_token",
        _ => "id",
    }
}

fn corrupt(column: &str, value: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("{column}: {value}"))
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column).map_err(|e| corrupt(column, e))
}

fn unsigned<T: TryFrom<i64>>(row: &PgRow, column: &str) -> Result<T, StoreError> {
    let value: i64 = get(row, column)?;
    T::try_from(value).map_err(|_| corrupt(column, value))
}

fn parsed<T: FromStr>(row: &PgRow, column: &str) -> Result<T, StoreError>
where
    T::Err: std::fmt::Display,
{
    let value: String = get(row, column)?;
    value.parse().map_err(|e| corrupt(column, e))
}

fn window(row: &PgRow, start: &str, end: &str) -> Result<Option<HourWindow>, StoreError> {
    let start: Option<f64> = get(row, start)?;
    let end: Option<f64> = get(row, end)?;
    Ok(start.zip(end).map(|(start, end)| HourWindow { start, end }))
}

/// Decode a `queue_services` row.
///
/// # Errors
///
/// `Corrupt` when a column is missing or out of range.
pub fn service(row: &PgRow) -> Result<Service, StoreError> {
    let minutes: i32 = get(row, "estimated_service_minutes")?;
    let limit: i32 = get(row, "max_tickets_per_day")?;
    let issued: i32 = get(row, "issued_today")?;
    Ok(Service {
        id: ServiceId::from_uuid(get(row, "id")?),
        name: get(row, "name")?,
        ticket_prefix: get(row, "ticket_prefix")?,
        is_open: get(row, "is_open")?,
        hours: OperatingHours {
            open: HourWindow {
                start: get(row, "open_start")?,
                end: get(row, "open_end")?,
            },
            break_window: window(row, "break_start", "break_end")?,
            lunch_window: window(row, "lunch_start", "lunch_end")?,
        },
        estimated_service_minutes: u32::try_from(minutes).map_err(|_| corrupt("estimated_service_minutes", minutes))?,
        max_tickets_per_day: u32::try_from(limit).map_err(|_| corrupt("max_tickets_per_day", limit))?,
        last_issued_number: unsigned(row, "last_issued_number")?,
        issued_today: u32::try_from(issued).map_err(|_| corrupt("issued_today", issued))?,
        issued_on: get(row, "issued_on")?,
        current_ticket_number: unsigned(row, "current_ticket_number")?,
    })
}

/// Decode a `queue_tickets` row.
///
/// # Errors
///
/// `Corrupt` when a column is missing, out of range or unparseable.
pub fn ticket(row: &PgRow) -> Result<Ticket, StoreError> {
    let seq: i32 = get(row, "reference_seq")?;
    let suffix: Option<i16> = get(row, "reference_suffix")?;
    let mut reference = TicketReference::new(
        get::<String>(row, "reference_prefix")?,
        get(row, "reference_year")?,
        u32::try_from(seq).map_err(|_| corrupt("reference_seq", seq))?,
    );
    if let Some(suffix) = suffix {
        reference = reference.with_suffix(u8::try_from(suffix).map_err(|_| corrupt("reference_suffix", suffix))?);
    }

    let cancellation = match get(row, "cancelled_at")? {
        Some(at) => Some(CancellationRecord {
            by: get::<Option<String>>(row, "cancelled_by")?
                .ok_or_else(|| corrupt("cancelled_by", "missing"))?
                .parse()
                .map_err(|e| corrupt("cancelled_by", e))?,
            reason: get(row, "cancellation_reason")?,
            at,
        }),
        None => None,
    };

    let feedback = match (get::<Option<i16>>(row, "rating")?, get(row, "feedback_at")?) {
        (Some(value), Some(submitted_at)) => Some(Feedback {
            rating: u8::try_from(value)
                .ok()
                .and_then(Rating::new)
                .ok_or_else(|| corrupt("rating", value))?,
            comment: get(row, "feedback_comment")?,
            submitted_at,
        }),
        _ => None,
    };

    let Json(contact): Json<ContactInfo> = get(row, "contact")?;

    Ok(Ticket {
        id: TicketId::from_uuid(get(row, "id")?),
        service_id: ServiceId::from_uuid(get(row, "service_id")?),
        ticket_number: unsigned(row, "ticket_number")?,
        reference,
        short_code: get(row, "short_code")?,
        security_token: get(row, "security_token")?,
        priority: parsed(row, "priority")?,
        state: parsed(row, "state")?,
        contact,
        created_at: get(row, "created_at")?,
        called_at: get(row, "called_at")?,
        served_at: get(row, "served_at")?,
        completed_at: get(row, "completed_at")?,
        cancellation,
        feedback,
    })
}

/// Store a `u64` counter in a `BIGINT` column.
///
/// # Errors
///
/// `Corrupt` above `i64::MAX`.
pub fn to_bigint(column: &str, value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| corrupt(column, value))
}

/// Store a `u32` in an `INTEGER` column.
///
/// # Errors
///
/// `Corrupt` above `i32::MAX`.
pub fn to_integer(column: &str, value: u32) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| corrupt(column, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_names_map_to_fields() {
        assert_eq!(duplicate_field(Some("queue_tickets_short_code_key")), "short_code");
        assert_eq!(duplicate_field(Some("queue_tickets_reference_key")), "reference");
        assert_eq!(duplicate_field(Some("queue_tickets_security_token_key")), "security_token");
        assert_eq!(duplicate_field(Some("queue_tickets_number_key")), "ticket_number");
        assert_eq!(duplicate_field(Some("queue_services_pkey")), "id");
        assert_eq!(duplicate_field(None), "id");
    }

    #[test]
    fn pool_failures_are_transient() {
        assert!(map_err("test", sqlx::Error::PoolTimedOut).is_transient());
        assert!(map_err("test", sqlx::Error::PoolClosed).is_transient());
        assert!(!map_err("test", sqlx::Error::RowNotFound).is_transient());
    }

    #[test]
    fn counters_outside_column_range_are_rejected() {
        assert_eq!(to_bigint("n", 42), Ok(42));
        assert!(matches!(to_bigint("n", u64::MAX), Err(StoreError::Corrupt(_))));
        assert!(matches!(to_integer("n", u32::MAX), Err(StoreError::Corrupt(_))));
    }
}
