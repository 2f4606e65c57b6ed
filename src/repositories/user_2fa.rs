use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::User2faSecret;

/// 2FAシークレットの永続化
///
/// ユーザーごとに最大1件（user_id が主キー）
#[async_trait]
pub trait User2faSecretStore: Send + Sync {
    /// ユーザーIDで2FAシークレットを検索
    async fn find_by_user_id(&self, user_id: Uuid) -> Result<Option<User2faSecret>, sqlx::Error>;

    /// 未検証の2FAシークレットを作成、または既存の未検証レコードを上書き
    ///
    /// # Note
    /// 検証済みレコードは上書きしない（None を返す）
    /// 同一ユーザーの並行登録は最後の書き込みが勝つ
    async fn upsert_unverified(
        &self,
        user_id: Uuid,
        secret_encrypted: &[u8],
        backup_code_hashes: &[String],
    ) -> Result<Option<User2faSecret>, sqlx::Error>;

    /// 検証済みにする
    ///
    /// # Returns
    /// 未検証→検証済みに遷移した場合のみ true
    async fn mark_verified(&self, user_id: Uuid) -> Result<bool, sqlx::Error>;

    /// 受理したタイムステップを記録
    ///
    /// # Returns
    /// 記録済みステップより新しい場合のみ true（同一ステップの再利用は false）
    async fn record_used_step(&self, user_id: Uuid, step: i64) -> Result<bool, sqlx::Error>;

    /// バックアップコードのハッシュを1件消費
    ///
    /// # Returns
    /// 消費できた場合は残り件数
    async fn consume_backup_code(
        &self,
        user_id: Uuid,
        code_hash: &str,
    ) -> Result<Option<usize>, sqlx::Error>;

    /// 2FAシークレットを削除
    ///
    /// # Returns
    /// 削除された場合 true
    async fn delete(&self, user_id: Uuid) -> Result<bool, sqlx::Error>;
}

#[derive(Clone)]
pub struct User2faSecretRepository {
    pool: PgPool,
}

impl User2faSecretRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl User2faSecretStore for User2faSecretRepository {
    async fn find_by_user_id(&self, user_id: Uuid) -> Result<Option<User2faSecret>, sqlx::Error> {
        sqlx::query_as::<_, User2faSecret>(
            r#"
            SELECT user_id, secret_encrypted, backup_codes, verified, last_used_step,
                   created_at, updated_at
            FROM user_2fa_secrets
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn upsert_unverified(
        &self,
        user_id: Uuid,
        secret_encrypted: &[u8],
        backup_code_hashes: &[String],
    ) -> Result<Option<User2faSecret>, sqlx::Error> {
        sqlx::query_as::<_, User2faSecret>(
            r#"
            INSERT INTO user_2fa_secrets (user_id, secret_encrypted, backup_codes)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE
            SET secret_encrypted = EXCLUDED.secret_encrypted,
                backup_codes = EXCLUDED.backup_codes,
                verified = false,
                last_used_step = NULL,
                created_at = NOW(),
                updated_at = NOW()
            WHERE user_2fa_secrets.verified = false
            RETURNING user_id, secret_encrypted, backup_codes, verified, last_used_step,
                      created_at, updated_at
            "#,
        )
        .bind(user_id)
        .bind(secret_encrypted)
        .bind(backup_code_hashes)
        .fetch_optional(&self.pool)
        .await
    }

    async fn mark_verified(&self, user_id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE user_2fa_secrets
            SET verified = true, updated_at = NOW()
            WHERE user_id = $1 AND verified = false
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_used_step(&self, user_id: Uuid, step: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE user_2fa_secrets
            SET last_used_step = $2, updated_at = NOW()
            WHERE user_id = $1
              AND (last_used_step IS NULL OR last_used_step < $2)
            "#,
        )
        .bind(user_id)
        .bind(step)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn consume_backup_code(
        &self,
        user_id: Uuid,
        code_hash: &str,
    ) -> Result<Option<usize>, sqlx::Error> {
        // array_remove は一致する全要素を消すが、同一バッチ内でコードは重複しない
        let remaining: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE user_2fa_secrets
            SET backup_codes = array_remove(backup_codes, $2), updated_at = NOW()
            WHERE user_id = $1
              AND verified = true
              AND $2 = ANY(backup_codes)
            RETURNING COALESCE(array_length(backup_codes, 1), 0)
            "#,
        )
        .bind(user_id)
        .bind(code_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(remaining.map(|n| n.max(0) as usize))
    }

    async fn delete(&self, user_id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM user_2fa_secrets
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
