//! Persistence of the per-administrator domain record
//!
//! One row per administrator, created when the administrator is provisioned and only ever
//! reset afterwards. Each write is a single statement; nothing spans an orchestrator run.

use std::str::FromStr;

use async_trait::async_trait;
use edgeward_protocol::{TlsStatus, UnknownTlsStatus};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;

pub type AdminId = i64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("No domain record for administrator {0}")]
    NotFound(AdminId),

    #[error("Administrator {0} does not exist")]
    UnknownAdministrator(AdminId),

    #[error("Stored TLS status is invalid: {0}")]
    InvalidStatus(#[from] UnknownTlsStatus),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Persisted domain state of one administrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRecord {
    pub admin_id: AdminId,
    /// Empty when no domain is exposed
    pub domain_name: String,
    pub email: String,
    pub tls_status: TlsStatus,
    /// Public IP of the proxy host
    pub proxy_host_ip: Option<String>,
    /// Operator's home IP, always allowlisted
    pub operator_ip: String,
}

impl DomainRecord {
    pub fn has_domain(&self) -> bool {
        !self.domain_name.is_empty()
    }
}

/// Values written by an orchestrator terminal step
///
/// `None` IP fields keep the stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordUpdate {
    pub domain_name: String,
    pub email: String,
    pub tls_status: TlsStatus,
    pub proxy_host_ip: Option<String>,
    pub operator_ip: Option<String>,
}

impl RecordUpdate {
    /// Back to plain HTTP with no domain
    pub fn reset() -> Self {
        Self {
            domain_name: String::new(),
            email: String::new(),
            tls_status: TlsStatus::Http,
            proxy_host_ip: None,
            operator_ip: None,
        }
    }
}

/// Trait for domain record storage backends
#[async_trait]
pub trait DomainRecordStore: Send + Sync {
    async fn get(&self, admin_id: AdminId) -> Result<DomainRecord, StoreError>;

    /// Create or overwrite the administrator's record in one statement
    async fn upsert(&self, admin_id: AdminId, update: RecordUpdate) -> Result<(), StoreError>;

    /// Administrator holding `domain` in an HTTPS or PENDING state
    async fn find_active_owner(&self, domain: &str) -> Result<Option<AdminId>, StoreError>;
}

/// SQLite-backed record store
#[derive(Clone)]
pub struct SqliteDomainStore {
    pool: SqlitePool,
}

impl SqliteDomainStore {
    /// Open (creating if missing) the database at `url` and ensure the schema exists
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Private in-memory database, kept alive on a single connection
    pub async fn connect_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS administrator (
                id INTEGER PRIMARY KEY,
                credential_hash TEXT NOT NULL,
                agreement_flag INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS domain_record (
                admin_id INTEGER PRIMARY KEY REFERENCES administrator(id),
                domain_name TEXT NOT NULL DEFAULT '',
                email TEXT NOT NULL DEFAULT '',
                tls_status TEXT NOT NULL DEFAULT 'HTTP'
                    CHECK (tls_status IN ('HTTP', 'HTTPS', 'PENDING', 'FAILED')),
                proxy_host_ip TEXT,
                operator_ip TEXT NOT NULL DEFAULT ''
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_domain_record_domain ON domain_record(domain_name)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Create an administrator together with its default HTTP record
    ///
    /// Re-provisioning an existing administrator updates the credential and operator IP and
    /// leaves the domain state alone.
    pub async fn provision_admin(
        &self,
        admin_id: AdminId,
        credential_hash: &str,
        operator_ip: &str,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO administrator (id, credential_hash)
            VALUES (?, ?)
            ON CONFLICT(id) DO UPDATE SET credential_hash = excluded.credential_hash
            "#,
        )
        .bind(admin_id)
        .bind(credential_hash)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO domain_record (admin_id, operator_ip)
            VALUES (?, ?)
            ON CONFLICT(admin_id) DO UPDATE SET operator_ip = excluded.operator_ip
            "#,
        )
        .bind(admin_id)
        .bind(operator_ip)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::info!(admin_id, "Provisioned administrator");
        Ok(())
    }

    /// Record the administrator's acceptance of the usage terms
    pub async fn set_agreement(&self, admin_id: AdminId, agreed: bool) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE administrator SET agreement_flag = ? WHERE id = ?")
            .bind(agreed)
            .bind(admin_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::UnknownAdministrator(admin_id));
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn record_from_row(row: &SqliteRow) -> Result<DomainRecord, StoreError> {
    let status: String = row.try_get("tls_status")?;
    Ok(DomainRecord {
        admin_id: row.try_get("admin_id")?,
        domain_name: row.try_get("domain_name")?,
        email: row.try_get("email")?,
        tls_status: TlsStatus::from_str(&status)?,
        proxy_host_ip: row.try_get("proxy_host_ip")?,
        operator_ip: row.try_get("operator_ip")?,
    })
}

#[async_trait]
impl DomainRecordStore for SqliteDomainStore {
    async fn get(&self, admin_id: AdminId) -> Result<DomainRecord, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT admin_id, domain_name, email, tls_status, proxy_host_ip, operator_ip
            FROM domain_record
            WHERE admin_id = ?
            "#,
        )
        .bind(admin_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => record_from_row(&row),
            None => Err(StoreError::NotFound(admin_id)),
        }
    }

    async fn upsert(&self, admin_id: AdminId, update: RecordUpdate) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO domain_record
                (admin_id, domain_name, email, tls_status, proxy_host_ip, operator_ip)
            VALUES (?, ?, ?, ?, ?, COALESCE(?, ''))
            ON CONFLICT(admin_id) DO UPDATE SET
                domain_name = excluded.domain_name,
                email = excluded.email,
                tls_status = excluded.tls_status,
                proxy_host_ip = COALESCE(?, domain_record.proxy_host_ip),
                operator_ip = COALESCE(?, domain_record.operator_ip)
            "#,
        )
        .bind(admin_id)
        .bind(&update.domain_name)
        .bind(&update.email)
        .bind(update.tls_status.as_str())
        .bind(&update.proxy_host_ip)
        .bind(&update.operator_ip)
        .bind(&update.proxy_host_ip)
        .bind(&update.operator_ip)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                tracing::debug!(admin_id, status = %update.tls_status, "Updated domain record");
                Ok(())
            }
            Err(e)
                if e
                    .as_database_error()
                    .is_some_and(|db| db.is_foreign_key_violation()) =>
            {
                Err(StoreError::UnknownAdministrator(admin_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find_active_owner(&self, domain: &str) -> Result<Option<AdminId>, StoreError> {
        let owner = sqlx::query(
            r#"
            SELECT admin_id FROM domain_record
            WHERE domain_name = ? AND tls_status IN ('HTTPS', 'PENDING')
            ORDER BY admin_id
            LIMIT 1
            "#,
        )
        .bind(domain)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| row.try_get::<AdminId, _>("admin_id"))
        .transpose()?;

        Ok(owner)
    }
}
