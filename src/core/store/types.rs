use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::core::history::RunRecord;

#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub id: i64,
    pub account_name: String,
    pub created_at: String,
}

/// A relational task row joined with its owning account.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: i64,
    pub name: String,
    pub cron: String,
    pub enabled: bool,
    pub account_id: i64,
    pub account_name: String,
    pub last_run_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    pub name: String,
    pub cron: String,
    pub account_id: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskPatch {
    pub name: Option<String>,
    pub cron: Option<String>,
    pub enabled: Option<bool>,
    pub account_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskLog {
    pub id: i64,
    pub task_id: i64,
    pub status: String,
    pub message: String,
    pub log_path: Option<String>,
    pub output: String,
    pub started_at: String,
    pub finished_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiTokenRecord {
    pub id: String,
    pub name: String,
    pub created_at: String,
}

/// One chat step of a sign task. `actions` stays opaque; the signer binary
/// interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatConfig {
    pub chat_id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub actions: Vec<serde_json::Value>,
    #[serde(default)]
    pub delete_after: Option<i64>,
    #[serde(default = "default_action_interval")]
    pub action_interval: u64,
}

pub const SIGN_CONFIG_VERSION: u32 = 3;

/// On-disk `config.json` of a sign task. Keys this crate does not know about
/// are carried through unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignTaskFile {
    #[serde(rename = "_version", default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub account_name: Option<String>,
    pub sign_at: String,
    #[serde(default)]
    pub random_seconds: u64,
    #[serde(default = "default_sign_interval")]
    pub sign_interval: u64,
    #[serde(default)]
    pub chats: Vec<ChatConfig>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<RunRecord>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignTask {
    pub name: String,
    pub account_name: String,
    pub sign_at: String,
    pub enabled: bool,
    pub random_seconds: u64,
    pub sign_interval: u64,
    pub chats: Vec<ChatConfig>,
    pub last_run: Option<RunRecord>,
    /// True when the task lives in the flat pre-account layout.
    pub legacy: bool,
    #[serde(skip)]
    pub dir: PathBuf,
}

impl SignTask {
    pub fn trigger(&self) -> &str {
        &self.sign_at
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignTaskDraft {
    pub name: String,
    pub account_name: String,
    pub sign_at: String,
    #[serde(default)]
    pub random_seconds: u64,
    #[serde(default = "default_sign_interval")]
    pub sign_interval: u64,
    #[serde(default)]
    pub chats: Vec<ChatConfig>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignTaskPatch {
    pub sign_at: Option<String>,
    pub random_seconds: Option<u64>,
    pub sign_interval: Option<u64>,
    pub chats: Option<Vec<ChatConfig>>,
    pub enabled: Option<bool>,
}

fn default_true() -> bool {
    true
}
fn default_version() -> u32 {
    SIGN_CONFIG_VERSION
}
fn default_sign_interval() -> u64 {
    1
}
fn default_action_interval() -> u64 {
    1
}
