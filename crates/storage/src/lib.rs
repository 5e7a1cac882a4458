use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sqlx::{migrate::MigrateError, sqlite::SqlitePoolOptions, Executor, Row, SqlitePool};
use thiserror::Error;

use agency_core::store::{PolicyStore, ReminderStore, StoreError};
use agency_core::types::{ExpiringPolicy, NewReminder, Reminder, ReminderKey};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    conn.execute("PRAGMA foreign_keys = ON;").await?;
                    conn.execute("PRAGMA journal_mode = WAL;").await?;
                    conn.execute("PRAGMA synchronous = NORMAL;").await?;
                    conn.execute("PRAGMA busy_timeout = 5000;").await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle for client records.
    pub fn clients(&self) -> ClientRepository {
        ClientRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for policy records.
    pub fn policies(&self) -> PolicyRepository {
        PolicyRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for generated reminders.
    pub fn reminders(&self) -> ReminderRepository {
        ReminderRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for the `clients` table.
#[derive(Clone)]
pub struct ClientRepository {
    pool: SqlitePool,
}

impl ClientRepository {
    /// Inserts a client and returns its id.
    pub async fn insert(&self, client: NewClient<'_>) -> Result<i64, ClientError> {
        let row = sqlx::query("INSERT INTO clients (name, email, phone) VALUES (?, ?, ?) RETURNING id")
            .bind(client.name)
            .bind(client.email)
            .bind(client.phone)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| match err {
                sqlx::Error::Database(db_err) => {
                    if db_err.code().as_deref() == Some("2067") {
                        ClientError::DuplicateEmail
                    } else {
                        ClientError::Database(sqlx::Error::Database(db_err))
                    }
                }
                other => ClientError::Database(other),
            })?;

        Ok(row.get("id"))
    }

    pub async fn count(&self) -> Result<i64, ClientError> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(id) FROM clients")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }
}

/// Data required to create a client.
pub struct NewClient<'a> {
    pub name: &'a str,
    pub email: &'a str,
    pub phone: Option<&'a str>,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("a client with the same email already exists")]
    DuplicateEmail,
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for ClientError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err)
    }
}

/// Repository for the `policies` table.
#[derive(Clone)]
pub struct PolicyRepository {
    pool: SqlitePool,
}

impl PolicyRepository {
    /// Inserts a policy and returns its id.
    pub async fn insert(&self, policy: NewPolicy<'_>) -> Result<i64, PolicyError> {
        let row = sqlx::query(
            "INSERT INTO policies (client_id, policy_number, insurer, policy_type, expiry_date) \
             VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(policy.client_id)
        .bind(policy.policy_number)
        .bind(policy.insurer)
        .bind(policy.policy_type)
        .bind(policy.expiry_date)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db_err) => {
                if db_err.code().as_deref() == Some("787") {
                    PolicyError::MissingClient
                } else {
                    PolicyError::Database(sqlx::Error::Database(db_err))
                }
            }
            other => PolicyError::Database(other),
        })?;

        Ok(row.get("id"))
    }

    pub async fn count(&self) -> Result<i64, PolicyError> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(id) FROM policies")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }

    /// Counts policies expiring in `[start, end]`, including those whose client is gone.
    pub async fn count_expiring(&self, start: NaiveDate, end: NaiveDate) -> Result<i64, PolicyError> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(id) FROM policies WHERE expiry_date BETWEEN ? AND ?")
                .bind(start)
                .bind(end)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.0)
    }

    /// Lists policies expiring in `[start, end]` left-joined to their client.
    pub async fn list_expiring(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ExpiringPolicyRow>, PolicyError> {
        let rows = sqlx::query_as::<_, ExpiringPolicyRow>(
            r#"
SELECT p.id AS policy_id,
       p.policy_number,
       p.client_id,
       c.name AS client_name,
       p.expiry_date
  FROM policies AS p
  LEFT JOIN clients AS c
    ON c.id = p.client_id
 WHERE p.expiry_date BETWEEN ? AND ?
 ORDER BY p.expiry_date ASC, p.policy_number ASC
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

/// Data required to create a policy.
pub struct NewPolicy<'a> {
    pub client_id: i64,
    pub policy_number: &'a str,
    pub insurer: &'a str,
    pub policy_type: Option<&'a str>,
    pub expiry_date: NaiveDate,
}

/// Policy joined with its (possibly missing) client.
#[derive(Debug, sqlx::FromRow)]
pub struct ExpiringPolicyRow {
    pub policy_id: i64,
    pub policy_number: String,
    pub client_id: i64,
    pub client_name: Option<String>,
    pub expiry_date: NaiveDate,
}

impl ExpiringPolicyRow {
    pub fn into_domain(self) -> ExpiringPolicy {
        ExpiringPolicy {
            policy_id: self.policy_id,
            policy_number: self.policy_number,
            client_id: self.client_id,
            client_name: self.client_name,
            expiry_date: self.expiry_date,
        }
    }
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy references a client that does not exist")]
    MissingClient,
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for PolicyError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err)
    }
}

/// Repository for the append-only `reminders` table.
#[derive(Clone)]
pub struct ReminderRepository {
    pool: SqlitePool,
}

impl ReminderRepository {
    /// Appends a reminder.
    ///
    /// `created_at` is raised to the newest stored value when the supplied
    /// timestamp is older, keeping insertion order and creation order aligned.
    pub async fn insert(&self, reminder: NewReminder<'_>) -> Result<Reminder, ReminderError> {
        let row = sqlx::query(
            "INSERT INTO reminders (message, created_at, policy_number, expiry_date) \
             VALUES (?, MAX(?, COALESCE((SELECT MAX(created_at) FROM reminders), '')), ?, ?) \
             RETURNING id, created_at",
        )
        .bind(reminder.message)
        .bind(to_rfc3339(reminder.created_at))
        .bind(reminder.policy_number)
        .bind(reminder.expiry_date)
        .fetch_one(&self.pool)
        .await?;

        Ok(Reminder {
            id: row.try_get("id")?,
            message: reminder.message.to_string(),
            created_at: row.try_get("created_at")?,
            policy_number: Some(reminder.policy_number.to_string()),
            expiry_date: Some(reminder.expiry_date),
        })
    }

    /// Returns the newest `created_at` recorded for the policy expiry.
    pub async fn latest_for(
        &self,
        policy_number: &str,
        expiry_date: NaiveDate,
    ) -> Result<Option<DateTime<Utc>>, ReminderError> {
        let row = sqlx::query(
            "SELECT MAX(created_at) AS latest FROM reminders WHERE policy_number = ? AND expiry_date = ?",
        )
        .bind(policy_number)
        .bind(expiry_date)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get::<Option<DateTime<Utc>>, _>("latest")?)
    }

    /// Lists the newest reminders first.
    pub async fn list_recent(&self, limit: u32) -> Result<Vec<Reminder>, ReminderError> {
        let rows = sqlx::query_as::<_, ReminderRow>(
            "SELECT id, message, created_at, policy_number, expiry_date \
             FROM reminders ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ReminderRow::into_domain).collect())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ReminderRow {
    id: i64,
    message: String,
    created_at: DateTime<Utc>,
    policy_number: Option<String>,
    expiry_date: Option<NaiveDate>,
}

impl ReminderRow {
    fn into_domain(self) -> Reminder {
        Reminder {
            id: self.id,
            message: self.message,
            created_at: self.created_at,
            policy_number: self.policy_number,
            expiry_date: self.expiry_date,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReminderError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
impl PolicyStore for Database {
    async fn expiring_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ExpiringPolicy>, StoreError> {
        let rows = self
            .policies()
            .list_expiring(start, end)
            .await
            .map_err(StoreError::unavailable)?;
        Ok(rows.into_iter().map(ExpiringPolicyRow::into_domain).collect())
    }
}

#[async_trait]
impl ReminderStore for Database {
    async fn insert_reminder(&self, reminder: NewReminder<'_>) -> Result<Reminder, StoreError> {
        self.reminders()
            .insert(reminder)
            .await
            .map_err(StoreError::write_rejected)
    }

    async fn latest_for(&self, key: ReminderKey<'_>) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.reminders()
            .latest_for(key.policy_number, key.expiry_date)
            .await
            .map_err(StoreError::unavailable)
    }

    async fn list_recent(&self, limit: u32) -> Result<Vec<Reminder>, StoreError> {
        self.reminders()
            .list_recent(limit)
            .await
            .map_err(StoreError::unavailable)
    }
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
