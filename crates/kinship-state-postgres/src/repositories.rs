use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::Postgres;
use tracing::{debug, warn};

use kinship_core::{CoreError, FamilyRepository, GroupId, UserId};

use crate::PostgresConnection;

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

/// Ids are unsigned; columns are `BIGINT`. The cast keeps the bit pattern.
fn to_db(id: u64) -> i64 {
    id as i64
}

fn from_db(value: i64) -> UserId {
    UserId(value as u64)
}

fn store_error(action: &str, e: sqlx::Error) -> CoreError {
    CoreError::StateStoreError(format!("Failed to {}: {}", action, e))
}

/// Postgres implementation of the FamilyRepository
#[derive(Clone)]
pub struct PostgresFamilyRepository {
    conn: PostgresConnection,
}

impl PostgresFamilyRepository {
    /// Create a new Postgres family repository
    pub fn new(conn: PostgresConnection) -> Self {
        Self { conn }
    }

    /// Run `insert`; if the row already exists, run `update` instead
    async fn upsert(&self, what: &str, insert: PgQuery<'_>, update: PgQuery<'_>) -> Result<(), CoreError> {
        let pool = self.conn.pool()?;

        match insert.execute(pool).await {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                debug!(what, "Row exists, falling back to update");
                update.execute(pool).await.map(|_| ()).map_err(|e| {
                    warn!(what, error = %e, "Update after duplicate key failed");
                    CoreError::DurableWriteConflict(format!("{}: {}", what, e))
                })
            }
            Err(e) => Err(store_error(&format!("insert {}", what), e)),
        }
    }
}

#[async_trait]
impl FamilyRepository for PostgresFamilyRepository {
    async fn find_parent(&self, child: UserId, group_id: GroupId) -> Result<Option<UserId>, CoreError> {
        let parent: Option<i64> =
            sqlx::query_scalar("SELECT parent_id FROM parents WHERE child_id = $1 AND guild_id = $2")
                .bind(to_db(child.0))
                .bind(to_db(group_id.0))
                .fetch_optional(self.conn.pool()?)
                .await
                .map_err(|e| store_error("read parent", e))?;

        Ok(parent.map(from_db))
    }

    async fn find_children(&self, parent: UserId, group_id: GroupId) -> Result<Vec<UserId>, CoreError> {
        let children: Vec<i64> = sqlx::query_scalar(
            "SELECT child_id FROM parents WHERE parent_id = $1 AND guild_id = $2 ORDER BY child_id",
        )
        .bind(to_db(parent.0))
        .bind(to_db(group_id.0))
        .fetch_all(self.conn.pool()?)
        .await
        .map_err(|e| store_error("read children", e))?;

        Ok(children.into_iter().map(from_db).collect())
    }

    async fn find_partner(&self, user: UserId, group_id: GroupId) -> Result<Option<UserId>, CoreError> {
        let partner: Option<i64> =
            sqlx::query_scalar("SELECT partner_id FROM marriages WHERE user_id = $1 AND guild_id = $2")
                .bind(to_db(user.0))
                .bind(to_db(group_id.0))
                .fetch_optional(self.conn.pool()?)
                .await
                .map_err(|e| store_error("read partner", e))?;

        Ok(partner.map(from_db))
    }

    async fn insert_parent_edge(
        &self,
        parent: UserId,
        child: UserId,
        group_id: GroupId,
    ) -> Result<(), CoreError> {
        let now = Utc::now();
        let insert = sqlx::query(
            "INSERT INTO parents (parent_id, child_id, guild_id, timestamp) VALUES ($1, $2, $3, $4)",
        )
        .bind(to_db(parent.0))
        .bind(to_db(child.0))
        .bind(to_db(group_id.0))
        .bind(now);
        let update = sqlx::query(
            "UPDATE parents SET parent_id = $1, timestamp = $4 WHERE child_id = $2 AND guild_id = $3",
        )
        .bind(to_db(parent.0))
        .bind(to_db(child.0))
        .bind(to_db(group_id.0))
        .bind(now);

        self.upsert("parent edge", insert, update).await?;
        debug!(parent = %parent, child = %child, group_id = %group_id, "Stored parent edge");
        Ok(())
    }

    async fn delete_parent_edge(
        &self,
        parent: UserId,
        child: UserId,
        group_id: GroupId,
    ) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM parents WHERE parent_id = $1 AND child_id = $2 AND guild_id = $3")
            .bind(to_db(parent.0))
            .bind(to_db(child.0))
            .bind(to_db(group_id.0))
            .execute(self.conn.pool()?)
            .await
            .map_err(|e| store_error("delete parent edge", e))?;
        Ok(())
    }

    /// Both rows land in one transaction, or neither does
    async fn insert_partner_edge(&self, a: UserId, b: UserId, group_id: GroupId) -> Result<(), CoreError> {
        let now = Utc::now();
        let mut tx = self
            .conn
            .pool()?
            .begin()
            .await
            .map_err(|e| store_error("begin partner edge transaction", e))?;

        for (user, partner) in [(a, b), (b, a)] {
            sqlx::query(
                "INSERT INTO marriages (user_id, partner_id, guild_id, timestamp) VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (user_id, guild_id) \
                 DO UPDATE SET partner_id = EXCLUDED.partner_id, timestamp = EXCLUDED.timestamp",
            )
            .bind(to_db(user.0))
            .bind(to_db(partner.0))
            .bind(to_db(group_id.0))
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| store_error("store partner edge", e))?;
        }

        tx.commit().await.map_err(|e| {
            warn!(a = %a, b = %b, error = %e, "Partner edge commit failed");
            CoreError::DurableWriteConflict(format!("partner edge: {}", e))
        })?;

        debug!(a = %a, b = %b, group_id = %group_id, "Stored partner edge");
        Ok(())
    }

    async fn delete_partner_edge(&self, a: UserId, b: UserId, group_id: GroupId) -> Result<(), CoreError> {
        sqlx::query(
            "DELETE FROM marriages WHERE guild_id = $3 \
             AND ((user_id = $1 AND partner_id = $2) OR (user_id = $2 AND partner_id = $1))",
        )
        .bind(to_db(a.0))
        .bind(to_db(b.0))
        .bind(to_db(group_id.0))
        .execute(self.conn.pool()?)
        .await
        .map_err(|e| store_error("delete partner edge", e))?;
        Ok(())
    }

    async fn health_check(&self) -> Result<bool, CoreError> {
        let pool = match self.conn.pool() {
            Ok(pool) => pool,
            Err(_) => return Ok(false),
        };
        Ok(sqlx::query("SELECT 1").execute(pool).await.is_ok())
    }
}
