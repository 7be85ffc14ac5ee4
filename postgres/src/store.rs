//! [`QueueStore`] over a `PostgreSQL` pool.

use crate::rows::{self, map_err, to_bigint, to_integer, SERVICE_COLUMNS, TICKET_COLUMNS};
use chrono::{DateTime, NaiveDate, Utc};
use queueline_core::error::StoreError;
use queueline_core::store::{Allocation, QueueStore, StoreFuture};
use queueline_core::transition::Transition;
use queueline_core::types::{
    CancellationRecord, Feedback, Service, ServiceId, Ticket, TicketId, TicketState,
};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Row;
use std::time::Duration;
use uuid::Uuid;

/// `PostgreSQL`-backed queue store.
///
/// Tickets and services live in `queue_tickets` and `queue_services` (see
/// `migrations/`). Every trait method is one statement or one transaction:
///
/// - allocation is a single conditional `UPDATE ... RETURNING`, so the row lock
///   serializes concurrent callers per service
/// - staff transitions lock the ticket with `SELECT ... FOR UPDATE`, apply the
///   shared transition table and write back in the same transaction
/// - the cancellation lease is a token column taken with a conditional `UPDATE`
///
/// # Example
///
/// ```ignore
/// use queueline_postgres::PostgresQueueStore;
///
/// let store = PostgresQueueStore::new("postgres://localhost/queueline").await?;
/// store.migrate().await?;
/// ```
#[derive(Clone, Debug)]
pub struct PostgresQueueStore {
    pool: PgPool,
}

impl PostgresQueueStore {
    /// Connect with a default pool.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the database cannot be reached.
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        Self::with_max_connections(database_url, 10).await
    }

    /// Connect with at most `max_connections` pooled connections.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the database cannot be reached.
    pub async fn with_max_connections(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Unavailable(format!("failed to connect: {e}")))?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("migration failed: {e}")))?;
        tracing::info!("queue_schema_migrated");
        Ok(())
    }

    async fn fetch_tickets(
        &self,
        operation: &'static str,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<Ticket>, StoreError> {
        let records = query.fetch_all(&self.pool).await.map_err(|e| map_err(operation, e))?;
        records.iter().map(rows::ticket).collect()
    }

    /// State and lease token of a ticket, used to explain a refused update.
    async fn ticket_probe(&self, id: TicketId) -> Result<(TicketState, Option<Uuid>), StoreError> {
        let row = sqlx::query("SELECT state, cancel_lock_token FROM queue_tickets WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_err("ticket_probe", e))?
            .ok_or(StoreError::TicketNotFound(id))?;
        let state: String = row.try_get("state").map_err(|e| map_err("ticket_probe", e))?;
        let token: Option<Uuid> = row.try_get("cancel_lock_token").map_err(|e| map_err("ticket_probe", e))?;
        let state = state
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("state: {e}")))?;
        Ok((state, token))
    }
}

impl QueueStore for PostgresQueueStore {
    fn insert_service(&self, service: Service) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let hours = &service.hours;
            sqlx::query(
                r"
                INSERT INTO queue_services (
                    id, name, ticket_prefix, is_open, open_start, open_end,
                    break_start, break_end, lunch_start, lunch_end,
                    estimated_service_minutes, max_tickets_per_day,
                    last_issued_number, issued_today, issued_on, current_ticket_number
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                ",
            )
            .bind(service.id.as_uuid())
            .bind(&service.name)
            .bind(&service.ticket_prefix)
            .bind(service.is_open)
            .bind(hours.open.start)
            .bind(hours.open.end)
            .bind(hours.break_window.map(|w| w.start))
            .bind(hours.break_window.map(|w| w.end))
            .bind(hours.lunch_window.map(|w| w.start))
            .bind(hours.lunch_window.map(|w| w.end))
            .bind(to_integer("estimated_service_minutes", service.estimated_service_minutes)?)
            .bind(to_integer("max_tickets_per_day", service.max_tickets_per_day)?)
            .bind(to_bigint("last_issued_number", service.last_issued_number)?)
            .bind(to_integer("issued_today", service.issued_today)?)
            .bind(service.issued_on)
            .bind(to_bigint("current_ticket_number", service.current_ticket_number)?)
            .execute(&self.pool)
            .await
            .map_err(|e| map_err("insert_service", e))?;
            Ok(())
        })
    }

    fn service(&self, id: ServiceId) -> StoreFuture<'_, Option<Service>> {
        Box::pin(async move {
            let row = sqlx::query(&format!("SELECT {SERVICE_COLUMNS} FROM queue_services WHERE id = $1"))
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_err("service", e))?;
            row.as_ref().map(rows::service).transpose()
        })
    }

    fn services(&self) -> StoreFuture<'_, Vec<Service>> {
        Box::pin(async move {
            let records = sqlx::query(&format!("SELECT {SERVICE_COLUMNS} FROM queue_services ORDER BY name"))
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_err("services", e))?;
            records.iter().map(rows::service).collect()
        })
    }

    fn set_service_open(&self, id: ServiceId, open: bool) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let result = sqlx::query("UPDATE queue_services SET is_open = $2 WHERE id = $1")
                .bind(id.as_uuid())
                .bind(open)
                .execute(&self.pool)
                .await
                .map_err(|e| map_err("set_service_open", e))?;
            if result.rows_affected() == 0 {
                return Err(StoreError::ServiceNotFound(id));
            }
            Ok(())
        })
    }

    fn reset_current_ticket_numbers(&self) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let result = sqlx::query("UPDATE queue_services SET current_ticket_number = 0")
                .execute(&self.pool)
                .await
                .map_err(|e| map_err("reset_current_ticket_numbers", e))?;
            Ok(result.rows_affected())
        })
    }

    fn allocate_ticket_number(&self, id: ServiceId, day: NaiveDate) -> StoreFuture<'_, Allocation> {
        Box::pin(async move {
            // The capacity check and the increment share one row lock.
            let row = sqlx::query(
                r"
                UPDATE queue_services
                SET last_issued_number = last_issued_number + 1,
                    issued_today = CASE WHEN issued_on = $2 THEN issued_today + 1 ELSE 1 END,
                    issued_on = $2
                WHERE id = $1
                  AND (CASE WHEN issued_on = $2 THEN issued_today ELSE 0 END) < max_tickets_per_day
                RETURNING last_issued_number, issued_today
                ",
            )
            .bind(id.as_uuid())
            .bind(day)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_err("allocate_ticket_number", e))?;

            if let Some(row) = row {
                let number: i64 = row.try_get("last_issued_number").map_err(|e| map_err("allocate_ticket_number", e))?;
                let issued: i32 = row.try_get("issued_today").map_err(|e| map_err("allocate_ticket_number", e))?;
                return Ok(Allocation {
                    ticket_number: u64::try_from(number)
                        .map_err(|_| StoreError::Corrupt(format!("last_issued_number: {number}")))?,
                    issued_today: u32::try_from(issued)
                        .map_err(|_| StoreError::Corrupt(format!("issued_today: {issued}")))?,
                });
            }

            let limit: Option<(i32,)> = sqlx::query_as("SELECT max_tickets_per_day FROM queue_services WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_err("allocate_ticket_number", e))?;
            match limit {
                Some((limit,)) => Err(StoreError::CapacityReached {
                    limit: u32::try_from(limit).unwrap_or(0),
                }),
                None => Err(StoreError::ServiceNotFound(id)),
            }
        })
    }

    fn resync_ticket_number(&self, id: ServiceId) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let row: Option<(i64,)> = sqlx::query_as(
                r"
                UPDATE queue_services
                SET last_issued_number = GREATEST(
                    last_issued_number,
                    COALESCE((SELECT MAX(ticket_number) FROM queue_tickets WHERE service_id = $1), 0)
                )
                WHERE id = $1
                RETURNING last_issued_number
                ",
            )
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_err("resync_ticket_number", e))?;
            let (number,) = row.ok_or(StoreError::ServiceNotFound(id))?;
            u64::try_from(number).map_err(|_| StoreError::Corrupt(format!("last_issued_number: {number}")))
        })
    }

    fn max_reference_sequence<'a>(&'a self, prefix: &'a str, year: i32) -> StoreFuture<'a, u32> {
        Box::pin(async move {
            let (max,): (i32,) = sqlx::query_as(
                "SELECT COALESCE(MAX(reference_seq), 0) FROM queue_tickets \
                 WHERE reference_prefix = $1 AND reference_year = $2",
            )
            .bind(prefix)
            .bind(year)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_err("max_reference_sequence", e))?;
            u32::try_from(max).map_err(|_| StoreError::Corrupt(format!("reference_seq: {max}")))
        })
    }

    fn code_in_use<'a>(&'a self, code: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let (exists,): (bool,) = sqlx::query_as(
                "SELECT EXISTS (SELECT 1 FROM queue_tickets \
                 WHERE reference = $1 OR short_code = $1 OR security_token = $1)",
            )
            .bind(code)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_err("code_in_use", e))?;
            Ok(exists)
        })
    }

    fn insert_ticket(&self, ticket: Ticket) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let seq = to_integer("reference_seq", ticket.reference.sequence)?;
            let result = sqlx::query(
                r"
                INSERT INTO queue_tickets (
                    id, service_id, ticket_number, reference, reference_prefix, reference_year,
                    reference_seq, reference_suffix, short_code, security_token, priority, state,
                    contact, created_at
                )
                SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14
                WHERE EXISTS (SELECT 1 FROM queue_services WHERE id = $2)
                ",
            )
            .bind(ticket.id.as_uuid())
            .bind(ticket.service_id.as_uuid())
            .bind(to_bigint("ticket_number", ticket.ticket_number)?)
            .bind(ticket.reference.to_string())
            .bind(&ticket.reference.prefix)
            .bind(ticket.reference.year)
            .bind(seq)
            .bind(ticket.reference.suffix.map(i16::from))
            .bind(&ticket.short_code)
            .bind(&ticket.security_token)
            .bind(ticket.priority.as_str())
            .bind(ticket.state.as_str())
            .bind(Json(&ticket.contact))
            .bind(ticket.created_at)
            .execute(&self.pool)
            .await
            .map_err(|e| map_err("insert_ticket", e))?;
            if result.rows_affected() == 0 {
                return Err(StoreError::ServiceNotFound(ticket.service_id));
            }
            Ok(())
        })
    }

    fn ticket(&self, id: TicketId) -> StoreFuture<'_, Option<Ticket>> {
        Box::pin(async move {
            let row = sqlx::query(&format!("SELECT {TICKET_COLUMNS} FROM queue_tickets WHERE id = $1"))
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_err("ticket", e))?;
            row.as_ref().map(rows::ticket).transpose()
        })
    }

    fn find_by_code<'a>(&'a self, code: &'a str) -> StoreFuture<'a, Option<Ticket>> {
        Box::pin(async move {
            // Each column has its own unique index; the planner ORs them.
            let row = sqlx::query(&format!(
                "SELECT {TICKET_COLUMNS} FROM queue_tickets \
                 WHERE reference = $1 OR short_code = $1 OR security_token = $1 LIMIT 1"
            ))
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_err("find_by_code", e))?;
            row.as_ref().map(rows::ticket).transpose()
        })
    }

    fn waiting_tickets(&self, service_id: ServiceId) -> StoreFuture<'_, Vec<Ticket>> {
        self.tickets_in_state(service_id, TicketState::Waiting)
    }

    fn tickets_in_state(&self, service_id: ServiceId, state: TicketState) -> StoreFuture<'_, Vec<Ticket>> {
        Box::pin(async move {
            let sql = format!("SELECT {TICKET_COLUMNS} FROM queue_tickets WHERE service_id = $1 AND state = $2");
            let query = sqlx::query(&sql).bind(service_id.as_uuid()).bind(state.as_str());
            self.fetch_tickets("tickets_in_state", query).await
        })
    }

    fn called_before(&self, cutoff: DateTime<Utc>) -> StoreFuture<'_, Vec<Ticket>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {TICKET_COLUMNS} FROM queue_tickets WHERE state = 'called' AND called_at < $1"
            );
            let query = sqlx::query(&sql).bind(cutoff);
            self.fetch_tickets("called_before", query).await
        })
    }

    fn tickets_created_between(
        &self,
        service_id: ServiceId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreFuture<'_, Vec<Ticket>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {TICKET_COLUMNS} FROM queue_tickets \
                 WHERE service_id = $1 AND created_at >= $2 AND created_at < $3"
            );
            let query = sqlx::query(&sql).bind(service_id.as_uuid()).bind(from).bind(to);
            self.fetch_tickets("tickets_created_between", query).await
        })
    }

    fn cancelled_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> StoreFuture<'_, Vec<Ticket>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {TICKET_COLUMNS} FROM queue_tickets WHERE cancelled_at >= $1 AND cancelled_at < $2"
            );
            let query = sqlx::query(&sql).bind(from).bind(to);
            self.fetch_tickets("cancelled_between", query).await
        })
    }

    fn transition_ticket(
        &self,
        id: TicketId,
        expected: TicketState,
        transition: Transition,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, Ticket> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(|e| map_err("transition_ticket", e))?;

            let row = sqlx::query(&format!("SELECT {TICKET_COLUMNS} FROM queue_tickets WHERE id = $1 FOR UPDATE"))
                .bind(id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_err("transition_ticket", e))?
                .ok_or(StoreError::TicketNotFound(id))?;
            let mut ticket = rows::ticket(&row)?;

            let actual = ticket.state;
            if actual != expected {
                return Err(StoreError::StateConflict { ticket_id: id, actual });
            }
            ticket
                .apply(transition, at)
                .map_err(|_| StoreError::StateConflict { ticket_id: id, actual })?;

            sqlx::query(
                r"
                UPDATE queue_tickets
                SET state = $2, called_at = $3, served_at = $4, completed_at = $5
                WHERE id = $1
                ",
            )
            .bind(id.as_uuid())
            .bind(ticket.state.as_str())
            .bind(ticket.called_at)
            .bind(ticket.served_at)
            .bind(ticket.completed_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_err("transition_ticket", e))?;

            if transition == Transition::Call {
                sqlx::query("UPDATE queue_services SET current_ticket_number = $2 WHERE id = $1")
                    .bind(ticket.service_id.as_uuid())
                    .bind(to_bigint("current_ticket_number", ticket.ticket_number)?)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_err("transition_ticket", e))?;
            }

            tx.commit().await.map_err(|e| map_err("transition_ticket", e))?;
            Ok(ticket)
        })
    }

    fn record_feedback(&self, id: TicketId, feedback: Feedback) -> StoreFuture<'_, Ticket> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                r"
                UPDATE queue_tickets
                SET rating = $2, feedback_comment = $3, feedback_at = $4
                WHERE id = $1 AND state = 'served'
                RETURNING {TICKET_COLUMNS}
                "
            ))
            .bind(id.as_uuid())
            .bind(i16::from(feedback.rating.value()))
            .bind(&feedback.comment)
            .bind(feedback.submitted_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_err("record_feedback", e))?;

            match row {
                Some(row) => rows::ticket(&row),
                None => {
                    let (actual, _) = self.ticket_probe(id).await?;
                    Err(StoreError::StateConflict { ticket_id: id, actual })
                }
            }
        })
    }

    fn try_lock_cancellation(
        &self,
        id: TicketId,
        token: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE queue_tickets
                SET cancel_lock_token = $2, cancel_lock_expires_at = $4
                WHERE id = $1
                  AND (cancel_lock_token IS NULL OR cancel_lock_expires_at <= $3)
                ",
            )
            .bind(id.as_uuid())
            .bind(token)
            .bind(now)
            .bind(expires_at)
            .execute(&self.pool)
            .await
            .map_err(|e| map_err("try_lock_cancellation", e))?;

            if result.rows_affected() == 1 {
                return Ok(true);
            }
            // Distinguish a live lease from a missing ticket.
            self.ticket_probe(id).await?;
            Ok(false)
        })
    }

    fn apply_cancellation(&self, id: TicketId, token: Uuid, record: CancellationRecord) -> StoreFuture<'_, Ticket> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                r"
                UPDATE queue_tickets
                SET state = 'cancelled',
                    cancelled_at = $3,
                    cancelled_by = $4,
                    cancellation_reason = $5,
                    cancel_lock_token = NULL,
                    cancel_lock_expires_at = NULL
                WHERE id = $1
                  AND cancel_lock_token = $2
                  AND state IN ('waiting', 'called')
                RETURNING {TICKET_COLUMNS}
                "
            ))
            .bind(id.as_uuid())
            .bind(token)
            .bind(record.at)
            .bind(record.by.to_string())
            .bind(&record.reason)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_err("apply_cancellation", e))?;

            if let Some(row) = row {
                return rows::ticket(&row);
            }
            let (actual, holder) = self.ticket_probe(id).await?;
            if holder != Some(token) {
                return Err(StoreError::LockNotHeld(id));
            }
            Err(StoreError::StateConflict { ticket_id: id, actual })
        })
    }

    fn release_cancellation(&self, id: TicketId, token: Uuid) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                UPDATE queue_tickets
                SET cancel_lock_token = NULL, cancel_lock_expires_at = NULL
                WHERE id = $1 AND cancel_lock_token = $2
                ",
            )
            .bind(id.as_uuid())
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(|e| map_err("release_cancellation", e))?;
            Ok(())
        })
    }
}
