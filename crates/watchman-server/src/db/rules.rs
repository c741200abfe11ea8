//! Notification rule storage.
//!
//! A rule binds an inbound webhook token to a target channel identifier.
//! Tokens are generated server-side at creation time and never change; they
//! are the only lookup key the webhook dispatcher uses.

use super::DbError;
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::instrument;
use uuid::Uuid;

/// A notification rule as stored.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Rule {
    pub id: String,
    pub rule_name: String,
    pub target_id: String,
    pub webhook_token: String,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields required to create a rule.
#[derive(Debug, Clone)]
pub struct NewRule {
    pub rule_name: String,
    pub target_id: String,
}

/// Partial update; `None` leaves the field unchanged.
#[derive(Debug, Clone, Default)]
pub struct RuleUpdate {
    pub rule_name: Option<String>,
    pub target_id: Option<String>,
    pub is_active: Option<bool>,
}

impl RuleUpdate {
    pub fn is_empty(&self) -> bool {
        self.rule_name.is_none() && self.target_id.is_none() && self.is_active.is_none()
    }
}

/// Rule CRUD over the shared pool.
#[derive(Clone)]
pub struct RuleStore {
    pool: SqlitePool,
}

impl RuleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[instrument(skip_all, fields(rule_name = %new_rule.rule_name))]
    pub async fn create(&self, new_rule: NewRule) -> Result<Rule, DbError> {
        let now = Utc::now().to_rfc3339();
        let rule = Rule {
            id: Uuid::new_v4().to_string(),
            rule_name: new_rule.rule_name,
            target_id: new_rule.target_id,
            webhook_token: Uuid::new_v4().simple().to_string(),
            is_active: true,
            created_at: now.clone(),
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO rules (id, rule_name, target_id, webhook_token, is_active, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&rule.id)
        .bind(&rule.rule_name)
        .bind(&rule.target_id)
        .bind(&rule.webhook_token)
        .bind(rule.is_active)
        .bind(&rule.created_at)
        .bind(&rule.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(rule)
    }

    pub async fn list(&self) -> Result<Vec<Rule>, DbError> {
        let rules = sqlx::query_as::<_, Rule>("SELECT * FROM rules ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rules)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Rule>, DbError> {
        let rule = sqlx::query_as::<_, Rule>("SELECT * FROM rules WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(rule)
    }

    /// Look up the rule behind a webhook token. The dispatcher's hot path.
    pub async fn find_by_token(&self, token: &str) -> Result<Option<Rule>, DbError> {
        let rule = sqlx::query_as::<_, Rule>("SELECT * FROM rules WHERE webhook_token = ?")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        Ok(rule)
    }

    /// Apply a partial update. Returns the updated rule, or `None` when the
    /// id does not exist.
    #[instrument(skip_all, fields(rule_id = %id))]
    pub async fn update(&self, id: &str, update: RuleUpdate) -> Result<Option<Rule>, DbError> {
        let Some(mut rule) = self.get(id).await? else {
            return Ok(None);
        };

        if let Some(rule_name) = update.rule_name {
            rule.rule_name = rule_name;
        }
        if let Some(target_id) = update.target_id {
            rule.target_id = target_id;
        }
        if let Some(is_active) = update.is_active {
            rule.is_active = is_active;
        }
        rule.updated_at = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            UPDATE rules
            SET rule_name = ?, target_id = ?, is_active = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&rule.rule_name)
        .bind(&rule.target_id)
        .bind(rule.is_active)
        .bind(&rule.updated_at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(Some(rule))
    }

    /// Delete a rule. Returns whether a row was removed.
    #[instrument(skip_all, fields(rule_id = %id))]
    pub async fn delete(&self, id: &str) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM rules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    fn new_rule(name: &str, target: &str) -> NewRule {
        NewRule {
            rule_name: name.to_string(),
            target_id: target.to_string(),
        }
    }

    #[tokio::test]
    async fn create_generates_id_and_token() {
        let store = RuleStore::new(test_pool().await);

        let rule = store
            .create(new_rule("Argus", "12345@group"))
            .await
            .unwrap();
        assert_eq!(rule.rule_name, "Argus");
        assert_eq!(rule.target_id, "12345@group");
        assert!(rule.is_active);
        assert_eq!(rule.webhook_token.len(), 32);
        assert!(!rule.webhook_token.contains('-'));
    }

    #[tokio::test]
    async fn find_by_token_matches_exactly() {
        let store = RuleStore::new(test_pool().await);
        let rule = store
            .create(new_rule("Argus", "12345@group"))
            .await
            .unwrap();

        let found = store.find_by_token(&rule.webhook_token).await.unwrap();
        assert_eq!(found, Some(rule));

        let missing = store.find_by_token("not-a-token").await.unwrap();
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn update_changes_only_provided_fields() {
        let store = RuleStore::new(test_pool().await);
        let rule = store
            .create(new_rule("Argus", "12345@group"))
            .await
            .unwrap();

        let updated = store
            .update(
                &rule.id,
                RuleUpdate {
                    is_active: Some(false),
                    ..RuleUpdate::default()
                },
            )
            .await
            .unwrap()
            .unwrap();

        assert!(!updated.is_active);
        assert_eq!(updated.rule_name, "Argus");
        assert_eq!(updated.target_id, "12345@group");
        // Token never changes.
        assert_eq!(updated.webhook_token, rule.webhook_token);
    }

    #[tokio::test]
    async fn update_missing_rule_returns_none() {
        let store = RuleStore::new(test_pool().await);
        let result = store
            .update("no-such-id", RuleUpdate::default())
            .await
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn delete_removes_rule() {
        let store = RuleStore::new(test_pool().await);
        let rule = store
            .create(new_rule("Argus", "12345@group"))
            .await
            .unwrap();

        assert!(store.delete(&rule.id).await.unwrap());
        assert!(!store.delete(&rule.id).await.unwrap());
        assert_eq!(store.list().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn list_orders_by_creation() {
        let store = RuleStore::new(test_pool().await);
        store.create(new_rule("first", "a@group")).await.unwrap();
        store.create(new_rule("second", "b@group")).await.unwrap();

        let rules = store.list().await.unwrap();
        assert_eq!(rules.len(), 2);
    }
}
