//! テスト用のインメモリ実装
//!
//! 障害注入（`fail_*` フラグ）で永続化エラー時の挙動を検証する

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use sqlx::types::Json;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{AuditLogStore, User2faSecretStore};
use crate::models::{AuditLogEntry, NewAuditLogEntry, User2faSecret};

fn simulated_failure() -> sqlx::Error {
    sqlx::Error::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "simulated network error",
    ))
}

#[derive(Default)]
pub struct InMemory2faStore {
    records: Mutex<HashMap<Uuid, User2faSecret>>,
    pub fail_writes: AtomicBool,
}

impl InMemory2faStore {
    pub fn get(&self, user_id: Uuid) -> Option<User2faSecret> {
        self.records.lock().unwrap().get(&user_id).cloned()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), sqlx::Error> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(simulated_failure());
        }
        Ok(())
    }
}

#[async_trait]
impl User2faSecretStore for InMemory2faStore {
    async fn find_by_user_id(&self, user_id: Uuid) -> Result<Option<User2faSecret>, sqlx::Error> {
        Ok(self.get(user_id))
    }

    async fn upsert_unverified(
        &self,
        user_id: Uuid,
        secret_encrypted: &[u8],
        backup_code_hashes: &[String],
    ) -> Result<Option<User2faSecret>, sqlx::Error> {
        self.check_writable()?;
        let mut records = self.records.lock().unwrap();
        if records.get(&user_id).is_some_and(|r| r.verified) {
            return Ok(None);
        }

        let now = OffsetDateTime::now_utc();
        let record = User2faSecret {
            user_id,
            secret_encrypted: secret_encrypted.to_vec(),
            backup_codes: backup_code_hashes.to_vec(),
            verified: false,
            last_used_step: None,
            created_at: now,
            updated_at: now,
        };
        records.insert(user_id, record.clone());
        Ok(Some(record))
    }

    async fn mark_verified(&self, user_id: Uuid) -> Result<bool, sqlx::Error> {
        self.check_writable()?;
        let mut records = self.records.lock().unwrap();
        match records.get_mut(&user_id) {
            Some(record) if !record.verified => {
                record.verified = true;
                record.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_used_step(&self, user_id: Uuid, step: i64) -> Result<bool, sqlx::Error> {
        self.check_writable()?;
        let mut records = self.records.lock().unwrap();
        match records.get_mut(&user_id) {
            Some(record) if record.last_used_step.is_none_or(|last| last < step) => {
                record.last_used_step = Some(step);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn consume_backup_code(
        &self,
        user_id: Uuid,
        code_hash: &str,
    ) -> Result<Option<usize>, sqlx::Error> {
        self.check_writable()?;
        let mut records = self.records.lock().unwrap();
        let Some(record) = records.get_mut(&user_id).filter(|r| r.verified) else {
            return Ok(None);
        };
        let Some(index) = record.backup_codes.iter().position(|h| h == code_hash) else {
            return Ok(None);
        };
        record.backup_codes.remove(index);
        Ok(Some(record.backup_codes.len()))
    }

    async fn delete(&self, user_id: Uuid) -> Result<bool, sqlx::Error> {
        self.check_writable()?;
        Ok(self.records.lock().unwrap().remove(&user_id).is_some())
    }
}

#[derive(Default)]
pub struct InMemoryAuditLogStore {
    entries: Mutex<Vec<AuditLogEntry>>,
    pub fail_inserts: AtomicBool,
}

impl InMemoryAuditLogStore {
    pub fn entries(&self) -> Vec<AuditLogEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn set_fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl AuditLogStore for InMemoryAuditLogStore {
    async fn insert(&self, entry: NewAuditLogEntry) -> Result<AuditLogEntry, sqlx::Error> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(simulated_failure());
        }

        let row = AuditLogEntry {
            id: Uuid::new_v4(),
            user_id: entry.user_id,
            action: entry.action.as_str().to_string(),
            resource_type: entry.resource_type,
            resource_id: entry.resource_id,
            ip_address: entry.ip_address,
            user_agent: entry.user_agent,
            metadata: Json(entry.metadata),
            created_at: OffsetDateTime::now_utc(),
        };
        self.entries.lock().unwrap().push(row.clone());
        Ok(row)
    }

    async fn list_by_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<AuditLogEntry>, sqlx::Error> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .iter()
            .rev()
            .filter(|e| e.user_id == user_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}
