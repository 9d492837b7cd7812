//! SQLite-backed claim log, implementing [`faucet_core::FaucetDb`].

use std::collections::VecDeque;
use std::net::Ipv6Addr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use faucet_core::{ClaimLogIter, ClaimLogRecord, FaucetDb, StoreError};
use serde::{Deserialize, Serialize};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{Sqlite, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio_util::sync::CancellationToken;

/// The claims table schema, as a sequence of statements to run in order.
/// Kept as literal SQL (rather than a migrations framework) to mirror the
/// upstream driver-keyed `CreateSQL` table, which this crate has no
/// multi-driver need for since `sqlx`'s sqlite feature is the only backend
/// wired into `faucetd`.
pub const CREATE_SQL: &[&str] = &[
    r#"CREATE TABLE "claims" (
  "id" INTEGER NOT NULL PRIMARY KEY,
  "time" DATETIME NOT NULL,
  "client" BLOB NOT NULL,
  "recipient" VARCHAR(35) NOT NULL,
  "amount" REAL NOT NULL,
  "txid" BLOB NOT NULL
)"#,
    r#"CREATE INDEX "claim_time" ON "claims" ("time")"#,
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbConfig {
    #[serde(default)]
    pub source: String,
}

impl DbConfig {
    pub fn configured(&self) -> bool {
        !self.source.is_empty()
    }
}

pub struct Db {
    pool: SqlitePool,
}

impl Db {
    pub async fn connect(cfg: &DbConfig) -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&format!("sqlite:{}", cfg.source))
            .await?;
        Ok(Db { pool })
    }

    pub async fn create_tables(&self) -> Result<(), sqlx::Error> {
        for stmt in CREATE_SQL {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

fn ipv6_bytes(ip: Ipv6Addr) -> [u8; 16] {
    ip.octets()
}

fn row_to_record(row: sqlx::sqlite::SqliteRow) -> Result<ClaimLogRecord, StoreError> {
    let t: DateTime<Utc> = row
        .try_get("time")
        .map_err(|e| StoreError::from(Box::new(e) as _))?;
    let client: Vec<u8> = row
        .try_get("client")
        .map_err(|e| StoreError::from(Box::new(e) as _))?;
    let amount: f64 = row
        .try_get("amount")
        .map_err(|e| StoreError::from(Box::new(e) as _))?;
    let octets: [u8; 16] = client.try_into().map_err(|_| {
        StoreError::from(Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "claims.client column is not 16 bytes",
        )) as _)
    })?;
    Ok(ClaimLogRecord {
        t,
        client: Ipv6Addr::from(octets),
        amount,
    })
}

/// A scoped cursor over a `claims_since` result set.
///
/// True lazy, row-at-a-time `sqlx` streaming would need the row stream to
/// borrow from a connection stored in the same struct, which isn't
/// expressible without a self-referential type. Instead this holds a
/// connection dedicated to the query (checked out of the pool, not shared)
/// for the cursor's lifetime and pages through an already-fetched result
/// set; the connection is only returned to the pool once [`close`] runs, so
/// the acquire/use/release lifetime is still real even though the rows
/// themselves are materialized up front.
///
/// [`close`]: faucet_core::ClaimLogIter::close
struct SqliteClaimLogIter {
    conn: Option<PoolConnection<Sqlite>>,
    records: VecDeque<ClaimLogRecord>,
}

#[async_trait]
impl ClaimLogIter for SqliteClaimLogIter {
    async fn next(&mut self) -> Result<Option<ClaimLogRecord>, StoreError> {
        Ok(self.records.pop_front())
    }

    async fn close(mut self: Box<Self>) -> Result<(), StoreError> {
        drop(self.conn.take());
        Ok(())
    }
}

#[async_trait]
impl FaucetDb for Db {
    async fn claims_since(&self, since: DateTime<Utc>) -> Result<Box<dyn ClaimLogIter>, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| StoreError::from(Box::new(e) as _))?;

        let rows = sqlx::query(r#"SELECT "time", "client", "amount" FROM "claims" WHERE "time" >= ?"#)
            .bind(since)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| StoreError::from(Box::new(e) as _))?;

        let mut records = VecDeque::with_capacity(rows.len());
        for row in rows {
            records.push_back(row_to_record(row)?);
        }

        Ok(Box::new(SqliteClaimLogIter {
            conn: Some(conn),
            records,
        }))
    }

    async fn log_claim(
        &self,
        t: DateTime<Utc>,
        client: Ipv6Addr,
        recipient: &str,
        amount: f64,
        tx: &[u8],
        // A claim this call logs has already had funds sent; cancellation
        // must never suppress the write, so it's accepted for signature
        // uniformity with the rest of the collaborator traits and ignored.
        _cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO "claims" ("time", "client", "recipient", "amount", "txid") VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(t)
        .bind(ipv6_bytes(client).to_vec())
        .bind(recipient)
        .bind(amount)
        .bind(tx.to_vec())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from(Box::new(e) as _))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_requires_a_nonempty_source() {
        assert!(!DbConfig::default().configured());
        assert!(DbConfig { source: "faucet.db".to_string() }.configured());
    }

    #[test]
    fn ipv6_bytes_round_trips_through_octets() {
        let ip = "203.0.113.9".parse::<std::net::IpAddr>().unwrap();
        let v6 = match ip {
            std::net::IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            std::net::IpAddr::V6(v6) => v6,
        };
        assert_eq!(Ipv6Addr::from(ipv6_bytes(v6)), v6);
    }
}
