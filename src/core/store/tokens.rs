use rusqlite::params;
use sha2::{Digest, Sha256};

use super::Database;
use super::types::ApiTokenRecord;
use crate::core::error::EngineResult;

const TOKEN_PREFIX: &str = "sdk_";

fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn generate_raw_token() -> String {
    let bytes: [u8; 16] = rand::random();
    format!("{TOKEN_PREFIX}{}", hex::encode(bytes))
}

/// API bearer tokens. Only the SHA-256 of a token is stored; the raw value
/// is returned once, at creation.
#[derive(Clone)]
pub struct AccessTokens {
    db: Database,
}

impl AccessTokens {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn issue(&self, name: &str) -> EngineResult<(String, ApiTokenRecord)> {
        let raw_token = generate_raw_token();
        let token_hash = hash_token(&raw_token);
        let id = uuid::Uuid::new_v4().to_string();

        let db = self.db.conn().lock().await;
        db.execute(
            "INSERT INTO api_tokens (id, name, token_hash) VALUES (?1, ?2, ?3)",
            params![id, name, token_hash],
        )?;

        let created_at = db.query_row(
            "SELECT created_at FROM api_tokens WHERE id = ?1",
            params![id],
            |row| row.get::<_, String>(0),
        )?;

        Ok((
            raw_token,
            ApiTokenRecord {
                id,
                name: name.to_string(),
                created_at,
            },
        ))
    }

    pub async fn list(&self) -> EngineResult<Vec<ApiTokenRecord>> {
        let db = self.db.conn().lock().await;
        let mut stmt =
            db.prepare("SELECT id, name, created_at FROM api_tokens ORDER BY created_at DESC")?;
        let rows = stmt.query_map([], |row| {
            Ok(ApiTokenRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                created_at: row.get(2)?,
            })
        })?;
        let mut tokens = Vec::new();
        for row in rows {
            tokens.push(row?);
        }
        Ok(tokens)
    }

    pub async fn revoke(&self, id: &str) -> EngineResult<bool> {
        let db = self.db.conn().lock().await;
        let rows = db.execute("DELETE FROM api_tokens WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    pub async fn verify(&self, raw_token: &str) -> EngineResult<bool> {
        let token_hash = hash_token(raw_token);
        let db = self.db.conn().lock().await;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM api_tokens WHERE token_hash = ?1",
            params![token_hash],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub async fn is_empty(&self) -> EngineResult<bool> {
        let db = self.db.conn().lock().await;
        let count: i64 = db.query_row("SELECT COUNT(*) FROM api_tokens", [], |row| row.get(0))?;
        Ok(count == 0)
    }
}
