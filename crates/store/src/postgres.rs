use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::{
    AnalysisStatus, CasOutcome, NewAnalysisStatus, NewOrgSub, NewRepo, OrgId, OrgSub, OrgSubId,
    OrgSubStore, Repo, RepoCommitState, RepoId, RepoStore, RepoTransition, Result, StoreError,
    SubCommitState, SubTransition, Version,
};

const REPO_COLUMNS: &str = "id, full_name, hook_secret, commit_state, provider_hook_id, \
     create_fail_reason, created_at, deleted_at";

const ORG_SUB_COLUMNS: &str = "id, org_id, billing_email, seats_count, card_token, \
     payment_gateway_customer_id, payment_gateway_subscription_id, commit_state, version, \
     created_at, deleted_at";

const ANALYSIS_STATUS_COLUMNS: &str =
    "repo_id, default_branch, head_commit_sha, last_analyzed_commit_sha, created_at";

/// PostgreSQL-backed store implementation.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a new PostgreSQL store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        tracing::info!("database migrations applied");
        Ok(())
    }

    fn row_to_repo(row: PgRow) -> Result<Repo> {
        let commit_state: String = row.try_get("commit_state")?;
        Ok(Repo {
            id: RepoId::new(row.try_get("id")?),
            full_name: row.try_get("full_name")?,
            hook_secret: row.try_get("hook_secret")?,
            commit_state: commit_state.parse()?,
            provider_hook_id: row.try_get("provider_hook_id")?,
            create_fail_reason: row.try_get("create_fail_reason")?,
            created_at: row.try_get("created_at")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }

    fn row_to_org_sub(row: PgRow) -> Result<OrgSub> {
        let commit_state: String = row.try_get("commit_state")?;
        Ok(OrgSub {
            id: OrgSubId::new(row.try_get("id")?),
            org_id: OrgId::new(row.try_get("org_id")?),
            billing_email: row.try_get("billing_email")?,
            seats_count: row.try_get("seats_count")?,
            card_token: row.try_get("card_token")?,
            payment_gateway_customer_id: row.try_get("payment_gateway_customer_id")?,
            payment_gateway_subscription_id: row.try_get("payment_gateway_subscription_id")?,
            commit_state: commit_state.parse()?,
            version: Version::new(row.try_get("version")?),
            created_at: row.try_get("created_at")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }

    fn row_to_analysis_status(row: PgRow) -> Result<AnalysisStatus> {
        Ok(AnalysisStatus {
            repo_id: RepoId::new(row.try_get("repo_id")?),
            default_branch: row.try_get("default_branch")?,
            head_commit_sha: row.try_get("head_commit_sha")?,
            last_analyzed_commit_sha: row.try_get("last_analyzed_commit_sha")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn current_repo_state(&self, id: RepoId) -> Result<Option<RepoCommitState>> {
        let state: Option<String> =
            sqlx::query_scalar("SELECT commit_state FROM repos WHERE id = $1")
                .bind(id.as_i64())
                .fetch_optional(&self.pool)
                .await?;
        Ok(state.map(|s| s.parse::<RepoCommitState>()).transpose()?)
    }

    async fn current_org_sub_state(&self, id: OrgSubId) -> Result<Option<SubCommitState>> {
        let state: Option<String> =
            sqlx::query_scalar("SELECT commit_state FROM org_subs WHERE id = $1")
                .bind(id.as_i64())
                .fetch_optional(&self.pool)
                .await?;
        Ok(state.map(|s| s.parse::<SubCommitState>()).transpose()?)
    }
}

#[async_trait]
impl RepoStore for PostgresStore {
    async fn create_repo(&self, repo: NewRepo) -> Result<Repo> {
        let row = sqlx::query(&format!(
            "INSERT INTO repos (full_name, hook_secret, commit_state) VALUES ($1, $2, $3) \
             RETURNING {REPO_COLUMNS}"
        ))
        .bind(&repo.full_name)
        .bind(&repo.hook_secret)
        .bind(RepoCommitState::CreateInit.as_str())
        .fetch_one(&self.pool)
        .await?;

        Self::row_to_repo(row)
    }

    async fn get_repo(&self, id: RepoId) -> Result<Option<Repo>> {
        let row = sqlx::query(&format!("SELECT {REPO_COLUMNS} FROM repos WHERE id = $1"))
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_repo).transpose()
    }

    async fn find_live_repo(&self, full_name: &str) -> Result<Option<Repo>> {
        let row = sqlx::query(&format!(
            "SELECT {REPO_COLUMNS} FROM repos WHERE full_name = $1 AND deleted_at IS NULL"
        ))
        .bind(full_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_repo).transpose()
    }

    async fn transition_repo(
        &self,
        id: RepoId,
        transition: RepoTransition,
    ) -> Result<CasOutcome<RepoCommitState>> {
        transition.check()?;
        let changes = transition.changes;
        let result = sqlx::query(
            r#"
            UPDATE repos
            SET commit_state = $3,
                provider_hook_id = COALESCE($4, provider_hook_id),
                create_fail_reason = COALESCE($5, create_fail_reason),
                deleted_at = COALESCE($6, deleted_at)
            WHERE id = $1 AND commit_state = $2
            "#,
        )
        .bind(id.as_i64())
        .bind(transition.from.as_str())
        .bind(transition.to.as_str())
        .bind(changes.provider_hook_id)
        .bind(changes.create_fail_reason)
        .bind(changes.deleted_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(CasOutcome::Applied);
        }
        Ok(CasOutcome::Stale {
            current: self.current_repo_state(id).await?,
        })
    }

    async fn get_or_create_analysis_status(
        &self,
        repo_id: RepoId,
        status: NewAnalysisStatus,
    ) -> Result<(AnalysisStatus, bool)> {
        let inserted = sqlx::query(&format!(
            "INSERT INTO repo_analysis_statuses (repo_id, default_branch, head_commit_sha) \
             VALUES ($1, $2, $3) ON CONFLICT (repo_id) DO NOTHING \
             RETURNING {ANALYSIS_STATUS_COLUMNS}"
        ))
        .bind(repo_id.as_i64())
        .bind(&status.default_branch)
        .bind(&status.head_commit_sha)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((Self::row_to_analysis_status(row)?, true));
        }

        // A previous, partially completed run already inserted it.
        let existing = sqlx::query(&format!(
            "SELECT {ANALYSIS_STATUS_COLUMNS} FROM repo_analysis_statuses WHERE repo_id = $1"
        ))
        .bind(repo_id.as_i64())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::RowVanished(format!("analysis status of repo {repo_id}")))?;

        Ok((Self::row_to_analysis_status(existing)?, false))
    }
}

#[async_trait]
impl OrgSubStore for PostgresStore {
    async fn create_org_sub(&self, sub: NewOrgSub) -> Result<OrgSub> {
        let row = sqlx::query(&format!(
            "INSERT INTO org_subs (org_id, billing_email, seats_count, card_token, commit_state, version) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {ORG_SUB_COLUMNS}"
        ))
        .bind(sub.org_id.as_i64())
        .bind(&sub.billing_email)
        .bind(sub.seats_count)
        .bind(&sub.card_token)
        .bind(SubCommitState::CreateInit.as_str())
        .bind(Version::initial().as_i64())
        .fetch_one(&self.pool)
        .await?;

        Self::row_to_org_sub(row)
    }

    async fn get_org_sub(&self, id: OrgSubId) -> Result<Option<OrgSub>> {
        let row = sqlx::query(&format!("SELECT {ORG_SUB_COLUMNS} FROM org_subs WHERE id = $1"))
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_org_sub).transpose()
    }

    async fn find_live_org_sub(&self, org_id: OrgId) -> Result<Option<OrgSub>> {
        let row = sqlx::query(&format!(
            "SELECT {ORG_SUB_COLUMNS} FROM org_subs WHERE org_id = $1 AND deleted_at IS NULL"
        ))
        .bind(org_id.as_i64())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_org_sub).transpose()
    }

    async fn transition_org_sub(
        &self,
        id: OrgSubId,
        transition: SubTransition,
    ) -> Result<CasOutcome<SubCommitState>> {
        transition.check()?;
        let changes = transition.changes;
        let result = sqlx::query(
            r#"
            UPDATE org_subs
            SET commit_state = $3,
                version = CASE WHEN $5 THEN version + 1 ELSE version END,
                payment_gateway_customer_id = COALESCE($6, payment_gateway_customer_id),
                payment_gateway_subscription_id = COALESCE($7, payment_gateway_subscription_id),
                seats_count = COALESCE($8, seats_count),
                card_token = COALESCE($9, card_token),
                deleted_at = COALESCE($10, deleted_at)
            WHERE id = $1 AND commit_state = $2
              AND ($4::BIGINT IS NULL OR version = $4)
            "#,
        )
        .bind(id.as_i64())
        .bind(transition.from.as_str())
        .bind(transition.to.as_str())
        .bind(transition.expected_version.map(|v| v.as_i64()))
        .bind(transition.bump_version)
        .bind(changes.payment_gateway_customer_id)
        .bind(changes.payment_gateway_subscription_id)
        .bind(changes.seats_count)
        .bind(changes.card_token)
        .bind(changes.deleted_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(CasOutcome::Applied);
        }
        Ok(CasOutcome::Stale {
            current: self.current_org_sub_state(id).await?,
        })
    }

    async fn delete_org_sub(
        &self,
        id: OrgSubId,
        expected: SubCommitState,
    ) -> Result<CasOutcome<SubCommitState>> {
        let result = sqlx::query("DELETE FROM org_subs WHERE id = $1 AND commit_state = $2")
            .bind(id.as_i64())
            .bind(expected.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 1 {
            return Ok(CasOutcome::Applied);
        }
        Ok(CasOutcome::Stale {
            current: self.current_org_sub_state(id).await?,
        })
    }
}
