//! Email-to-case assignment records.
//!
//! Assignments live in the tenant database; the bulk-assignment worker
//! inserts them idempotently (duplicate inserts are skipped, not errors).

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailAssignment {
    pub tenant: String,
    pub email_id: String,
    pub case_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl EmailAssignment {
    pub fn new(
        tenant: impl Into<String>,
        email_id: impl Into<String>,
        case_id: impl Into<String>,
        assigned_by: Option<String>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            email_id: email_id.into(),
            case_id: case_id.into(),
            assigned_by,
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait AssignmentStore: Send + Sync {
    async fn exists(&self, tenant: &str, email_id: &str, case_id: &str) -> Result<bool>;

    /// Insert an assignment. Returns `false` when the `(email, case)` pair
    /// already exists for the tenant.
    async fn insert(&self, assignment: EmailAssignment) -> Result<bool>;

    async fn for_case(&self, tenant: &str, case_id: &str) -> Result<Vec<EmailAssignment>>;
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Default)]
pub struct MemoryAssignmentStore {
    rows: RwLock<HashMap<(String, String, String), EmailAssignment>>,
}

impl MemoryAssignmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AssignmentStore for MemoryAssignmentStore {
    async fn exists(&self, tenant: &str, email_id: &str, case_id: &str) -> Result<bool> {
        Ok(self
            .rows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&(
                tenant.to_string(),
                email_id.to_string(),
                case_id.to_string(),
            )))
    }

    async fn insert(&self, assignment: EmailAssignment) -> Result<bool> {
        let key = (
            assignment.tenant.clone(),
            assignment.email_id.clone(),
            assignment.case_id.clone(),
        );
        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
        if rows.contains_key(&key) {
            return Ok(false);
        }
        rows.insert(key, assignment);
        Ok(true)
    }

    async fn for_case(&self, tenant: &str, case_id: &str) -> Result<Vec<EmailAssignment>> {
        let mut assignments: Vec<EmailAssignment> = self
            .rows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|a| a.tenant == tenant && a.case_id == case_id)
            .cloned()
            .collect();
        assignments.sort_by(|a, b| a.email_id.cmp(&b.email_id));
        Ok(assignments)
    }
}

// ============================================================================
// PostgreSQL implementation
// ============================================================================

pub struct PgAssignmentStore {
    pool: PgPool,
}

impl PgAssignmentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AssignmentStore for PgAssignmentStore {
    async fn exists(&self, tenant: &str, email_id: &str, case_id: &str) -> Result<bool> {
        let found: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT 1 FROM email_assignments
            WHERE tenant = $1 AND email_id = $2 AND case_id = $3
            "#,
        )
        .bind(tenant)
        .bind(email_id)
        .bind(case_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    async fn insert(&self, assignment: EmailAssignment) -> Result<bool> {
        let outcome = sqlx::query(
            r#"
            INSERT INTO email_assignments (tenant, email_id, case_id, assigned_by, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (tenant, email_id, case_id) DO NOTHING
            "#,
        )
        .bind(&assignment.tenant)
        .bind(&assignment.email_id)
        .bind(&assignment.case_id)
        .bind(&assignment.assigned_by)
        .bind(assignment.created_at)
        .execute(&self.pool)
        .await?;
        Ok(outcome.rows_affected() > 0)
    }

    async fn for_case(&self, tenant: &str, case_id: &str) -> Result<Vec<EmailAssignment>> {
        let rows = sqlx::query_as::<_, (String, String, String, Option<String>, DateTime<Utc>)>(
            r#"
            SELECT tenant, email_id, case_id, assigned_by, created_at
            FROM email_assignments
            WHERE tenant = $1 AND case_id = $2
            ORDER BY email_id
            "#,
        )
        .bind(tenant)
        .bind(case_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(tenant, email_id, case_id, assigned_by, created_at)| EmailAssignment {
                    tenant,
                    email_id,
                    case_id,
                    assigned_by,
                    created_at,
                },
            )
            .collect())
    }
}
