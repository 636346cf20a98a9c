use async_trait::async_trait;
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;

use crate::error::LedgerError;
use crate::ledger::{DeliveryLedger, LedgerPage, LedgerQuery};
use crate::types::DeliveryAttempt;

type Param = Box<dyn ToSql + Sync + Send>;

/// Ledger stored in a PostgreSQL table.
///
/// Filterable columns are stored alongside the full record as JSONB.
pub struct PostgresLedger {
    client: Client,
}

impl PostgresLedger {
    pub async fn new(client: Client) -> Result<Self, tokio_postgres::Error> {
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS webhook_delivery_attempts (
                    id TEXT PRIMARY KEY,
                    delivery_id TEXT NOT NULL,
                    subscription_id TEXT NOT NULL,
                    event_id TEXT NOT NULL,
                    attempt_number INT NOT NULL,
                    outcome TEXT NOT NULL,
                    attempted_at_ms BIGINT NOT NULL,
                    record JSONB NOT NULL
                );
                CREATE INDEX IF NOT EXISTS webhook_delivery_attempts_delivery
                    ON webhook_delivery_attempts (delivery_id, attempt_number);
                CREATE INDEX IF NOT EXISTS webhook_delivery_attempts_time
                    ON webhook_delivery_attempts (attempted_at_ms, attempt_number);",
            )
            .await?;

        Ok(Self { client })
    }
}

#[async_trait]
impl DeliveryLedger for PostgresLedger {
    async fn record(&self, attempt: &DeliveryAttempt) -> Result<(), LedgerError> {
        let delivery_id = attempt.delivery_id.to_string();

        let row = self
            .client
            .query_one(
                "SELECT MAX(attempt_number) FROM webhook_delivery_attempts WHERE delivery_id = $1",
                &[&delivery_id],
            )
            .await
            .map_err(backend)?;
        let last: Option<i32> = row.try_get(0).map_err(backend)?;
        let last = last.map_or(0, |n| n.max(0) as u32);
        if attempt.attempt_number <= last {
            return Err(LedgerError::NonMonotonicAttempt {
                delivery_id: attempt.delivery_id,
                last,
                attempted: attempt.attempt_number,
            });
        }

        let record = serde_json::to_value(attempt).map_err(|e| LedgerError::Backend {
            message: e.to_string(),
        })?;
        let attempt_number = i32::try_from(attempt.attempt_number).unwrap_or(i32::MAX);

        let inserted = self
            .client
            .execute(
                "INSERT INTO webhook_delivery_attempts
                    (id, delivery_id, subscription_id, event_id, attempt_number, outcome, attempted_at_ms, record)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (id) DO NOTHING",
                &[
                    &attempt.id.to_string(),
                    &delivery_id,
                    &attempt.subscription_id.to_string(),
                    &attempt.event_id.0,
                    &attempt_number,
                    &attempt.outcome.as_str(),
                    &attempt.attempted_at.timestamp_millis(),
                    &record,
                ],
            )
            .await
            .map_err(backend)?;

        if inserted == 0 {
            return Err(LedgerError::DuplicateAttempt { id: attempt.id });
        }
        Ok(())
    }

    async fn query(&self, query: &LedgerQuery) -> Result<LedgerPage, LedgerError> {
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<Param> = Vec::new();
        let mut push = |column: &str, op: &str, value: Param| {
            params.push(value);
            clauses.push(format!("{column} {op} ${}", params.len()));
        };

        if let Some(id) = query.subscription_id {
            push("subscription_id", "=", Box::new(id.to_string()));
        }
        if let Some(id) = &query.event_id {
            push("event_id", "=", Box::new(id.0.clone()));
        }
        if let Some(id) = query.delivery_id {
            push("delivery_id", "=", Box::new(id.to_string()));
        }
        if let Some(outcome) = query.outcome {
            push("outcome", "=", Box::new(outcome.as_str().to_string()));
        }
        if let Some(since) = query.since {
            push("attempted_at_ms", ">=", Box::new(since.timestamp_millis()));
        }
        if let Some(until) = query.until {
            push("attempted_at_ms", "<", Box::new(until.timestamp_millis()));
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        // One extra row tells us whether another page exists.
        let limit = i64::try_from(query.limit.saturating_add(1)).unwrap_or(i64::MAX);
        let offset = i64::try_from(query.offset).unwrap_or(i64::MAX);
        params.push(Box::new(limit));
        params.push(Box::new(offset));

        let sql = format!(
            "SELECT record FROM webhook_delivery_attempts {where_clause}
             ORDER BY attempted_at_ms, attempt_number
             LIMIT ${} OFFSET ${}",
            params.len() - 1,
            params.len(),
        );

        let refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();
        let rows = self.client.query(&sql, &refs).await.map_err(backend)?;

        let mut attempts = rows
            .into_iter()
            .map(|row| {
                let value: serde_json::Value = row.try_get(0).map_err(backend)?;
                serde_json::from_value::<DeliveryAttempt>(value).map_err(|e| LedgerError::Backend {
                    message: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let next_offset = if attempts.len() > query.limit {
            attempts.truncate(query.limit);
            (query.limit > 0).then_some(query.offset + query.limit)
        } else {
            None
        };

        Ok(LedgerPage { attempts, next_offset })
    }
}

fn backend(err: tokio_postgres::Error) -> LedgerError {
    LedgerError::Backend { message: err.to_string() }
}
