//! Read-only catalog of database configurations, servers, and policies.
//!
//! These entities are owned by the external CRUD API; the engine only reads
//! them. Policy and credential inheritance from a linked server entity is
//! resolved here into concrete values so the evaluator and executor never
//! see the indirection.

use sqlx::Row;

use crate::db::DbPool;
use crate::engine::{DumpTarget, EngineKind};
use crate::error::{Error, Result};
use crate::policy::{BackupPolicy, TierSet};

/// A configured database, as the scheduler sees it.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub id: String,
    pub name: String,
    pub engine: EngineKind,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database_name: String,
    pub server_id: Option<String>,
    pub policy_id: Option<String>,
    pub use_server_policy: bool,
    pub enabled: bool,
}

/// A shared engine/server entity that databases may inherit credentials
/// and a policy from.
#[derive(Debug, Clone)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub engine: EngineKind,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub policy_id: Option<String>,
}

fn database_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<DatabaseConfig> {
    Ok(DatabaseConfig {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        engine: row.try_get::<String, _>("engine")?.parse()?,
        host: row.try_get("host")?,
        port: row
            .try_get::<Option<i64>, _>("port")?
            .map(|p| p as u16),
        username: row.try_get("username")?,
        password: row.try_get("password")?,
        database_name: row.try_get("database_name")?,
        server_id: row.try_get("server_id")?,
        policy_id: row.try_get("policy_id")?,
        use_server_policy: row.try_get("use_server_policy")?,
        enabled: row.try_get("enabled")?,
    })
}

/// List enabled database configurations, paged by (limit, offset).
pub async fn list_enabled_databases(
    pool: &DbPool,
    limit: i64,
    offset: i64,
) -> Result<Vec<DatabaseConfig>> {
    let rows = sqlx::query(
        r#"
        SELECT id, name, engine, host, port, username, password, database_name,
               server_id, policy_id, use_server_policy, enabled
        FROM database_configs
        WHERE enabled = 1
        ORDER BY id
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    rows.iter().map(database_from_row).collect()
}

/// Fetch one database configuration by id.
pub async fn get_database(pool: &DbPool, id: &str) -> Result<Option<DatabaseConfig>> {
    let row = sqlx::query(
        r#"
        SELECT id, name, engine, host, port, username, password, database_name,
               server_id, policy_id, use_server_policy, enabled
        FROM database_configs
        WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(database_from_row).transpose()
}

/// Fetch one server entity by id.
pub async fn get_server(pool: &DbPool, id: &str) -> Result<Option<Server>> {
    let row = sqlx::query(
        r#"
        SELECT id, name, engine, host, port, username, password, policy_id
        FROM servers
        WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => Ok(Some(Server {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            engine: row.try_get::<String, _>("engine")?.parse()?,
            host: row.try_get("host")?,
            port: row.try_get::<i64, _>("port")? as u16,
            username: row.try_get("username")?,
            password: row.try_get("password")?,
            policy_id: row.try_get("policy_id")?,
        })),
        None => Ok(None),
    }
}

/// Fetch a backup policy by id, deserializing its tier configurations.
pub async fn get_policy(pool: &DbPool, id: &str) -> Result<Option<BackupPolicy>> {
    let row = sqlx::query("SELECT id, name, tiers FROM policies WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => {
            let tiers: TierSet = serde_json::from_str(&row.try_get::<String, _>("tiers")?)?;
            Ok(Some(BackupPolicy {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                tiers,
            }))
        }
        None => Ok(None),
    }
}

/// Resolve the effective policy for a database.
///
/// A database flagged with `use_server_policy` takes the linked server's
/// policy; otherwise its own policy reference wins.
pub async fn resolve_policy(pool: &DbPool, db: &DatabaseConfig) -> Result<BackupPolicy> {
    let policy_id = if db.use_server_policy {
        let server_id = db
            .server_id
            .as_deref()
            .ok_or_else(|| Error::Config(format!("database {} inherits a server policy but has no server", db.id)))?;
        let server = get_server(pool, server_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("server {}", server_id)))?;
        server
            .policy_id
            .ok_or_else(|| Error::Config(format!("server {} has no policy", server.id)))?
    } else {
        db.policy_id
            .clone()
            .ok_or_else(|| Error::Config(format!("database {} has no policy", db.id)))?
    };

    get_policy(pool, &policy_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("policy {}", policy_id)))
}

/// Resolve the concrete dump target for a database: its own connection
/// coordinates, or the linked server's when not set locally.
pub async fn resolve_target(pool: &DbPool, db: &DatabaseConfig) -> Result<DumpTarget> {
    if let (Some(host), Some(port), Some(username), Some(password)) =
        (&db.host, db.port, &db.username, &db.password)
    {
        return Ok(DumpTarget {
            engine: db.engine,
            host: host.clone(),
            port,
            username: username.clone(),
            password: password.clone(),
            database: db.database_name.clone(),
        });
    }

    let server_id = db
        .server_id
        .as_deref()
        .ok_or_else(|| Error::Config(format!("database {} has neither credentials nor a server", db.id)))?;
    let server = get_server(pool, server_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("server {}", server_id)))?;

    Ok(DumpTarget {
        engine: db.engine,
        host: server.host,
        port: server.port,
        username: server.username,
        password: server.password,
        database: db.database_name.clone(),
    })
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::*;
    use super::*;
    use crate::db::test_pool;
    use crate::policy::{ScheduleRule, TierConfig, TierSet, TimeOfDay};

    fn daily_policy(id: &str) -> BackupPolicy {
        let mut tiers = TierSet::all_disabled();
        tiers.daily = TierConfig {
            enabled: true,
            keep_count: 7,
            rule: ScheduleRule::Daily {
                time: TimeOfDay { hour: 2, minute: 0 },
            },
        };
        BackupPolicy {
            id: id.to_string(),
            name: "daily".to_string(),
            tiers,
        }
    }

    #[tokio::test]
    async fn test_list_enabled_databases_skips_disabled() {
        let pool = test_pool().await;
        insert_policy(&pool, &daily_policy("pol-1")).await;

        insert_database(&pool, &simple_database("db-a", "pol-1")).await;
        let mut off = simple_database("db-b", "pol-1");
        off.enabled = false;
        insert_database(&pool, &off).await;

        let dbs = list_enabled_databases(&pool, 100, 0).await.unwrap();
        assert_eq!(dbs.len(), 1);
        assert_eq!(dbs[0].id, "db-a");
    }

    #[tokio::test]
    async fn test_resolve_policy_own_reference_wins() {
        let pool = test_pool().await;
        insert_policy(&pool, &daily_policy("pol-own")).await;
        insert_policy(&pool, &daily_policy("pol-server")).await;
        insert_server(
            &pool,
            &Server {
                id: "srv-1".to_string(),
                name: "shared".to_string(),
                engine: EngineKind::Postgres,
                host: "pg.internal".to_string(),
                port: 5432,
                username: "root".to_string(),
                password: "pw".to_string(),
                policy_id: Some("pol-server".to_string()),
            },
        )
        .await;

        let mut db = simple_database("db-1", "pol-own");
        db.server_id = Some("srv-1".to_string());
        insert_database(&pool, &db).await;

        let policy = resolve_policy(&pool, &db).await.unwrap();
        assert_eq!(policy.id, "pol-own");
    }

    #[tokio::test]
    async fn test_resolve_policy_server_flag_inherits() {
        let pool = test_pool().await;
        insert_policy(&pool, &daily_policy("pol-server")).await;
        insert_server(
            &pool,
            &Server {
                id: "srv-1".to_string(),
                name: "shared".to_string(),
                engine: EngineKind::MySql,
                host: "my.internal".to_string(),
                port: 3306,
                username: "root".to_string(),
                password: "pw".to_string(),
                policy_id: Some("pol-server".to_string()),
            },
        )
        .await;

        let mut db = simple_database("db-1", "pol-own-ignored");
        db.server_id = Some("srv-1".to_string());
        db.use_server_policy = true;
        insert_database(&pool, &db).await;

        let policy = resolve_policy(&pool, &db).await.unwrap();
        assert_eq!(policy.id, "pol-server");
    }

    #[tokio::test]
    async fn test_resolve_target_inherits_server_credentials() {
        let pool = test_pool().await;
        insert_server(
            &pool,
            &Server {
                id: "srv-1".to_string(),
                name: "shared".to_string(),
                engine: EngineKind::MySql,
                host: "my.internal".to_string(),
                port: 3306,
                username: "root".to_string(),
                password: "pw".to_string(),
                policy_id: None,
            },
        )
        .await;

        let mut db = simple_database("db-1", "pol-1");
        db.engine = EngineKind::MySql;
        db.host = None;
        db.port = None;
        db.username = None;
        db.password = None;
        db.server_id = Some("srv-1".to_string());
        insert_database(&pool, &db).await;

        let target = resolve_target(&pool, &db).await.unwrap();
        assert_eq!(target.host, "my.internal");
        assert_eq!(target.port, 3306);
        assert_eq!(target.database, "app");
    }

    #[tokio::test]
    async fn test_resolve_policy_missing_reference_errors() {
        let pool = test_pool().await;
        let mut db = simple_database("db-1", "pol-1");
        db.policy_id = None;
        assert!(resolve_policy(&pool, &db).await.is_err());
    }
}
