//! Presence registry: user identity → online status and live connection
//! handle.
//!
//! The registry is an external key-value dependency so that several server
//! processes can share it. Each user's entry is only written by that user's
//! own connection, so no transactions are needed. Handles are only valid
//! within the process lifetime that issued them, which is why
//! [`PresenceStore::purge`] runs on every boot.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;
use uuid::Uuid;

use parley_shared::{PresenceStatus, UserId};

use crate::error::PresenceError;
use crate::hub::HandleId;

pub type Result<T> = std::result::Result<T, PresenceError>;

#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Mark `user` online with the handle of its live connection.
    async fn set_online(&self, user: &UserId, handle: HandleId) -> Result<()>;

    /// Clear `user`'s entry if it still points at `handle`. Returns `false`
    /// when a newer connection owns the entry and it was kept.
    async fn set_offline(&self, user: &UserId, handle: HandleId) -> Result<bool>;

    async fn lookup(&self, user: &UserId) -> Result<Option<HandleId>>;

    async fn lookup_status(&self, user: &UserId) -> Result<PresenceStatus>;

    /// Batch status lookup. Every requested user is present in the result.
    async fn lookup_statuses(&self, users: &[UserId]) -> Result<HashMap<UserId, PresenceStatus>>;

    /// Extend the liveness lease of `user`'s entry, if leases are enabled.
    async fn refresh(&self, user: &UserId) -> Result<()>;

    /// Drop every presence entry. Returns the number of keys removed.
    async fn purge(&self) -> Result<usize>;
}

// ---------------------------------------------------------------------------
// In-process registry
// ---------------------------------------------------------------------------

/// Registry for single-process deployments and tests.
#[derive(Default)]
pub struct MemoryPresence {
    entries: Mutex<HashMap<UserId, HandleId>>,
}

impl MemoryPresence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresence {
    async fn set_online(&self, user: &UserId, handle: HandleId) -> Result<()> {
        self.entries.lock().await.insert(user.clone(), handle);
        Ok(())
    }

    async fn set_offline(&self, user: &UserId, handle: HandleId) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        if entries.get(user) != Some(&handle) {
            return Ok(false);
        }
        entries.remove(user);
        Ok(true)
    }

    async fn lookup(&self, user: &UserId) -> Result<Option<HandleId>> {
        Ok(self.entries.lock().await.get(user).copied())
    }

    async fn lookup_status(&self, user: &UserId) -> Result<PresenceStatus> {
        Ok(status_of(self.entries.lock().await.contains_key(user)))
    }

    async fn lookup_statuses(&self, users: &[UserId]) -> Result<HashMap<UserId, PresenceStatus>> {
        let entries = self.entries.lock().await;
        Ok(users
            .iter()
            .map(|u| (u.clone(), status_of(entries.contains_key(u))))
            .collect())
    }

    async fn refresh(&self, _user: &UserId) -> Result<()> {
        Ok(())
    }

    async fn purge(&self) -> Result<usize> {
        let mut entries = self.entries.lock().await;
        let count = entries.len();
        entries.clear();
        Ok(count)
    }
}

fn status_of(online: bool) -> PresenceStatus {
    if online {
        PresenceStatus::Online
    } else {
        PresenceStatus::Offline
    }
}

// ---------------------------------------------------------------------------
// Redis registry
// ---------------------------------------------------------------------------

const KEY_PREFIX: &str = "presence";
const SCAN_BATCH: usize = 500;

/// Delete both keys only while the handle key still holds ARGV[1].
/// KEYS[1] is the handle key, KEYS[2] the status key.
const CLEAR_IF_OWNER: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1], KEYS[2])
end
return 0
"#;

/// Registry shared by every server process through Redis.
///
/// Two keys per user: `presence:status:<user>` and `presence:handle:<user>`.
pub struct RedisPresence {
    conn: ConnectionManager,
    ttl: Option<Duration>,
}

impl RedisPresence {
    pub async fn connect(url: &str, ttl: Option<Duration>) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn, ttl })
    }

    fn status_key(user: &UserId) -> String {
        format!("{KEY_PREFIX}:status:{user}")
    }

    fn handle_key(user: &UserId) -> String {
        format!("{KEY_PREFIX}:handle:{user}")
    }

    fn set_cmd(&self, key: &str, value: &str) -> redis::Cmd {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = self.ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        cmd
    }
}

#[async_trait]
impl PresenceStore for RedisPresence {
    async fn set_online(&self, user: &UserId, handle: HandleId) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .add_command(self.set_cmd(&Self::status_key(user), PresenceStatus::Online.as_str()))
            .ignore()
            .add_command(self.set_cmd(&Self::handle_key(user), &handle.to_string()))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_offline(&self, user: &UserId, handle: HandleId) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::Script::new(CLEAR_IF_OWNER)
            .key(Self::handle_key(user))
            .key(Self::status_key(user))
            .arg(handle.to_string())
            .invoke_async(&mut conn)
            .await?;
        if removed == 0 {
            tracing::debug!(user = %user, "presence entry owned by a newer connection, keeping it");
        }
        Ok(removed > 0)
    }

    async fn lookup(&self, user: &UserId) -> Result<Option<HandleId>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::handle_key(user))
            .query_async(&mut conn)
            .await?;
        raw.map(|s| {
            Uuid::parse_str(&s)
                .map(HandleId)
                .map_err(|_| PresenceError::InvalidHandle(s))
        })
        .transpose()
    }

    async fn lookup_status(&self, user: &UserId) -> Result<PresenceStatus> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::status_key(user))
            .query_async(&mut conn)
            .await?;
        Ok(status_of(raw.as_deref() == Some(PresenceStatus::Online.as_str())))
    }

    async fn lookup_statuses(&self, users: &[UserId]) -> Result<HashMap<UserId, PresenceStatus>> {
        if users.is_empty() {
            return Ok(HashMap::new());
        }
        let keys: Vec<String> = users.iter().map(Self::status_key).collect();
        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        Ok(users
            .iter()
            .cloned()
            .zip(values.into_iter().chain(std::iter::repeat(None)))
            .map(|(user, raw)| {
                let online = raw.as_deref() == Some(PresenceStatus::Online.as_str());
                (user, status_of(online))
            })
            .collect())
    }

    async fn refresh(&self, user: &UserId) -> Result<()> {
        let Some(ttl) = self.ttl else {
            return Ok(());
        };
        let secs = ttl.as_secs().max(1);
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .cmd("EXPIRE")
            .arg(Self::status_key(user))
            .arg(secs)
            .ignore()
            .cmd("EXPIRE")
            .arg(Self::handle_key(user))
            .arg(secs)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn purge(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let pattern = format!("{KEY_PREFIX}:*");
        let mut cursor: u64 = 0;
        let mut removed = 0usize;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let deleted: usize = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;
                removed += deleted;
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(removed)
    }
}
