use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    FromRow, Pool, QueryBuilder, Sqlite,
};
use std::str::FromStr;

use crate::error::{AppError, AppResult};
use crate::models::{Application, ApplicationStatus, ObjectKey, Template};

pub type DbPool = Pool<Sqlite>;

#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

#[derive(FromRow)]
struct TemplateRow {
    owner: String,
    name: String,
    created_time: String,
    updated_time: String,
    display_name: String,
    description: String,
    version: String,
    manifest: String,
}

#[derive(FromRow)]
struct ApplicationRow {
    owner: String,
    name: String,
    created_time: String,
    updated_time: String,
    display_name: String,
    description: String,
    template: String,
    parameters: String,
    namespace: Option<String>,
    status: String,
    message: Option<String>,
}

const TEMPLATE_COLUMNS: &str =
    "owner, name, created_time, updated_time, display_name, description, version, manifest";

const APPLICATION_COLUMNS: &str = "owner, name, created_time, updated_time, display_name, description, template, parameters, namespace, status, message";

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let in_memory = database_url.contains(":memory:");

        if !in_memory {
            let db_path = database_url
                .trim_start_matches("sqlite://")
                .trim_start_matches("sqlite:");
            if let Some(parent) = std::path::Path::new(db_path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        // Every in-memory connection is its own database
        let max_connections = if in_memory { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    // ==================== Templates ====================

    /// Get a template by owner/name
    pub async fn get_template(&self, key: &ObjectKey) -> Result<Option<Template>, sqlx::Error> {
        let row: Option<TemplateRow> = sqlx::query_as(&format!(
            "SELECT {} FROM templates WHERE owner = ? AND name = ?",
            TEMPLATE_COLUMNS
        ))
        .bind(&key.owner)
        .bind(&key.name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_template).transpose()
    }

    /// List the templates of an owner
    pub async fn list_templates(&self, owner: &str) -> Result<Vec<Template>, sqlx::Error> {
        let rows: Vec<TemplateRow> = sqlx::query_as(&format!(
            "SELECT {} FROM templates WHERE owner = ? ORDER BY created_time DESC",
            TEMPLATE_COLUMNS
        ))
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_template).collect()
    }

    /// Insert a template, failing with Conflict when the key is taken
    pub async fn add_template(&self, template: &Template) -> AppResult<()> {
        sqlx::query(&format!(
            "INSERT INTO templates ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            TEMPLATE_COLUMNS
        ))
        .bind(&template.owner)
        .bind(&template.name)
        .bind(template.created_time.to_rfc3339())
        .bind(template.updated_time.to_rfc3339())
        .bind(&template.display_name)
        .bind(&template.description)
        .bind(&template.version)
        .bind(&template.manifest)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_on_duplicate(e, "template", &template.key()))?;

        Ok(())
    }

    /// Update the editable fields of a template
    pub async fn update_template(&self, template: &Template) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE templates SET
                display_name = ?,
                description = ?,
                version = ?,
                manifest = ?,
                updated_time = ?
             WHERE owner = ? AND name = ?",
        )
        .bind(&template.display_name)
        .bind(&template.description)
        .bind(&template.version)
        .bind(&template.manifest)
        .bind(Utc::now().to_rfc3339())
        .bind(&template.owner)
        .bind(&template.name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("template {}", template.key())));
        }
        Ok(())
    }

    /// Delete a template
    pub async fn delete_template(&self, key: &ObjectKey) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM templates WHERE owner = ? AND name = ?")
            .bind(&key.owner)
            .bind(&key.name)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // ==================== Applications ====================

    /// Get an application by owner/name
    pub async fn get_application(
        &self,
        key: &ObjectKey,
    ) -> Result<Option<Application>, sqlx::Error> {
        let row: Option<ApplicationRow> = sqlx::query_as(&format!(
            "SELECT {} FROM applications WHERE owner = ? AND name = ?",
            APPLICATION_COLUMNS
        ))
        .bind(&key.owner)
        .bind(&key.name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_application).transpose()
    }

    /// List the applications of an owner
    pub async fn list_applications(&self, owner: &str) -> Result<Vec<Application>, sqlx::Error> {
        let rows: Vec<ApplicationRow> = sqlx::query_as(&format!(
            "SELECT {} FROM applications WHERE owner = ? ORDER BY created_time DESC",
            APPLICATION_COLUMNS
        ))
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_application).collect()
    }

    /// List applications (any owner) currently in one of the given statuses
    pub async fn list_applications_in_status(
        &self,
        statuses: &[ApplicationStatus],
    ) -> Result<Vec<Application>, sqlx::Error> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM applications WHERE status IN (",
            APPLICATION_COLUMNS
        ));
        let mut separated = builder.separated(", ");
        for status in statuses {
            separated.push_bind(status.to_string());
        }
        separated.push_unseparated(") ORDER BY owner, name");

        let rows: Vec<ApplicationRow> = builder.build_query_as().fetch_all(&self.pool).await?;

        rows.into_iter().map(Self::row_to_application).collect()
    }

    /// Insert an application, failing with Conflict when the key is taken
    pub async fn add_application(&self, app: &Application) -> AppResult<()> {
        sqlx::query(&format!(
            "INSERT INTO applications ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            APPLICATION_COLUMNS
        ))
        .bind(&app.owner)
        .bind(&app.name)
        .bind(app.created_time.to_rfc3339())
        .bind(app.updated_time.to_rfc3339())
        .bind(&app.display_name)
        .bind(&app.description)
        .bind(&app.template)
        .bind(&app.parameters)
        .bind(&app.namespace)
        .bind(app.status.to_string())
        .bind(&app.message)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_on_duplicate(e, "application", &app.key()))?;

        Ok(())
    }

    /// Update an application (all mutable fields)
    pub async fn update_application(&self, app: &Application) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE applications SET
                display_name = ?,
                description = ?,
                template = ?,
                parameters = ?,
                namespace = ?,
                status = ?,
                message = ?,
                updated_time = ?
             WHERE owner = ? AND name = ?",
        )
        .bind(&app.display_name)
        .bind(&app.description)
        .bind(&app.template)
        .bind(&app.parameters)
        .bind(&app.namespace)
        .bind(app.status.to_string())
        .bind(&app.message)
        .bind(Utc::now().to_rfc3339())
        .bind(&app.owner)
        .bind(&app.name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("application {}", app.key())));
        }
        Ok(())
    }

    /// Update application status and message
    pub async fn update_application_status(
        &self,
        key: &ObjectKey,
        status: ApplicationStatus,
        message: Option<&str>,
    ) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE applications SET status = ?, message = ?, updated_time = ? WHERE owner = ? AND name = ?",
        )
        .bind(status.to_string())
        .bind(message)
        .bind(Utc::now().to_rfc3339())
        .bind(&key.owner)
        .bind(&key.name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("application {}", key)));
        }
        Ok(())
    }

    /// Update status and message only while the stored status is still
    /// `expected`; returns false when another writer got there first
    pub async fn update_application_status_from(
        &self,
        key: &ObjectKey,
        expected: ApplicationStatus,
        status: ApplicationStatus,
        message: Option<&str>,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE applications SET status = ?, message = ?, updated_time = ? WHERE owner = ? AND name = ? AND status = ?",
        )
        .bind(status.to_string())
        .bind(message)
        .bind(Utc::now().to_rfc3339())
        .bind(&key.owner)
        .bind(&key.name)
        .bind(expected.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete an application
    pub async fn delete_application(&self, key: &ObjectKey) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM applications WHERE owner = ? AND name = ?")
            .bind(&key.owner)
            .bind(&key.name)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Helper to convert row to Template
    fn row_to_template(row: TemplateRow) -> Result<Template, sqlx::Error> {
        Ok(Template {
            owner: row.owner,
            name: row.name,
            created_time: parse_time(&row.created_time)?,
            updated_time: parse_time(&row.updated_time)?,
            display_name: row.display_name,
            description: row.description,
            version: row.version,
            manifest: row.manifest,
        })
    }

    /// Helper to convert row to Application
    fn row_to_application(row: ApplicationRow) -> Result<Application, sqlx::Error> {
        let status = row
            .status
            .parse::<ApplicationStatus>()
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

        Ok(Application {
            owner: row.owner,
            name: row.name,
            created_time: parse_time(&row.created_time)?,
            updated_time: parse_time(&row.updated_time)?,
            display_name: row.display_name,
            description: row.description,
            template: row.template,
            parameters: row.parameters,
            namespace: row.namespace,
            status,
            message: row.message,
        })
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    value
        .parse::<DateTime<Utc>>()
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn conflict_on_duplicate(err: sqlx::Error, entity: &str, key: &ObjectKey) -> AppError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            AppError::Conflict(format!("{} {} already exists", entity, key))
        }
        _ => AppError::Database(err),
    }
}
