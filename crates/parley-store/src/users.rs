//! Registration of connecting identities.

use rusqlite::{params, OptionalExtension};

use parley_shared::UserId;

use crate::database::{column_ts, column_user, format_ts, now, Database};
use crate::error::{not_found, Result};
use crate::models::User;

impl Database {
    /// Register `id` if it is not known yet and return the stored record.
    pub fn ensure_user(&self, id: &UserId) -> Result<User> {
        self.conn().execute(
            "INSERT OR IGNORE INTO users (id, created_at) VALUES (?1, ?2)",
            params![id.as_str(), format_ts(now())],
        )?;
        self.get_user(id)
    }

    pub fn get_user(&self, id: &UserId) -> Result<User> {
        self.conn()
            .query_row(
                "SELECT id, created_at FROM users WHERE id = ?1",
                params![id.as_str()],
                |row| {
                    Ok(User {
                        id: column_user(row, 0)?,
                        created_at: column_ts(row, 1)?,
                    })
                },
            )
            .map_err(not_found)
    }

    pub fn user_exists(&self, id: &UserId) -> Result<bool> {
        let found = self
            .conn()
            .query_row(
                "SELECT 1 FROM users WHERE id = ?1",
                params![id.as_str()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }
}
