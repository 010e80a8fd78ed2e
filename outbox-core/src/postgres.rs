//! Postgres 事件存储（PgEventStore）
//!
//! 基于 sqlx 的 `EventStore<Event>` 实现，期望的表结构：
//!
//! ```sql
//! CREATE TABLE outbox_events (
//!     id          BIGSERIAL PRIMARY KEY,
//!     sequence    BIGINT UNIQUE,
//!     data        JSONB NOT NULL,
//!     created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//! CREATE TABLE outbox_publishers (
//!     id          BIGINT PRIMARY KEY,
//!     sequence    BIGINT NOT NULL
//! );
//! ```
//!
//! 业务侧在自己的事务里调用 [`PgEventStore::insert_event_in`]，保证事件与业务数据同生共死。
//!
use crate::error::{OutboxError, OutboxResult as Result};
use crate::event::{Event, EventId, PublisherId};
use crate::store::{EventStore, EventWriter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgConnection, PgPool};

#[derive(FromRow)]
struct EventRow {
    id: i64,
    sequence: Option<i64>,
    data: Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for Event {
    type Error = OutboxError;

    fn try_from(row: EventRow) -> Result<Self> {
        Ok(Event::builder()
            .id(EventId(u64::try_from(row.id)?))
            .maybe_sequence(row.sequence.map(u64::try_from).transpose()?)
            .data(row.data)
            .created_at(row.created_at)
            .build())
    }
}

fn into_events(rows: Vec<EventRow>) -> Result<Vec<Event>> {
    rows.into_iter().map(Event::try_from).collect()
}

#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        Ok(Self::new(PgPool::connect(url).await?))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 在调用方的事务连接上插入一条未排序事件
    pub async fn insert_event_in(conn: &mut PgConnection, data: &Value) -> Result<EventId> {
        let (id,): (i64,) =
            sqlx::query_as("INSERT INTO outbox_events (data) VALUES ($1) RETURNING id")
                .bind(data)
                .fetch_one(conn)
                .await?;
        Ok(EventId(u64::try_from(id)?))
    }
}

#[async_trait]
impl EventWriter for PgEventStore {
    async fn insert_event(&self, data: Value) -> Result<EventId> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_event_in(&mut conn, &data).await
    }
}

#[async_trait]
impl EventStore<Event> for PgEventStore {
    async fn get_unprocessed_events(&self, limit: usize) -> Result<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, sequence, data, created_at
            FROM outbox_events
            WHERE sequence IS NULL
            ORDER BY id ASC
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit)?)
        .fetch_all(&self.pool)
        .await?;

        into_events(rows)
    }

    async fn update_sequences(&self, events: &[Event]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let mut ids = Vec::with_capacity(events.len());
        let mut sequences = Vec::with_capacity(events.len());
        for event in events {
            let sequence = event.sequence().ok_or_else(|| {
                OutboxError::invalid_state(format!("event {} has no sequence to persist", event.id()))
            })?;
            ids.push(i64::try_from(event.id().0)?);
            sequences.push(i64::try_from(sequence)?);
        }

        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE outbox_events AS e
            SET sequence = u.sequence
            FROM UNNEST($1::BIGINT[], $2::BIGINT[]) AS u(id, sequence)
            WHERE e.id = u.id AND e.sequence IS NULL
            "#,
        )
        .bind(&ids)
        .bind(&sequences)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated != events.len() as u64 {
            tx.rollback().await?;
            return Err(OutboxError::invalid_state(format!(
                "expected to sequence {} events, matched {updated}",
                events.len()
            )));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_events_from_sequence(&self, from: u64, limit: usize) -> Result<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, sequence, data, created_at
            FROM outbox_events
            WHERE sequence IS NOT NULL AND sequence >= $1
            ORDER BY sequence ASC
            LIMIT $2
            "#,
        )
        .bind(i64::try_from(from)?)
        .bind(i64::try_from(limit)?)
        .fetch_all(&self.pool)
        .await?;

        into_events(rows)
    }

    async fn get_last_events(&self, limit: usize) -> Result<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT e.id, e.sequence, e.data, e.created_at FROM (
                SELECT id, sequence, data, created_at
                FROM outbox_events
                WHERE sequence IS NOT NULL
                ORDER BY sequence DESC
                LIMIT $1
            ) e
            ORDER BY e.sequence ASC
            "#,
        )
        .bind(i64::try_from(limit)?)
        .fetch_all(&self.pool)
        .await?;

        into_events(rows)
    }

    async fn get_last_sequence(&self, publisher: PublisherId) -> Result<u64> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT sequence FROM outbox_publishers WHERE id = $1")
                .bind(i64::try_from(publisher.0)?)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((sequence,)) => Ok(u64::try_from(sequence)?),
            None => Ok(0),
        }
    }

    async fn save_last_sequence(&self, publisher: PublisherId, sequence: u64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_publishers (id, sequence)
            VALUES ($1, $2)
            ON CONFLICT (id)
            DO UPDATE SET sequence = GREATEST(outbox_publishers.sequence, EXCLUDED.sequence)
            "#,
        )
        .bind(i64::try_from(publisher.0)?)
        .bind(i64::try_from(sequence)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
