use rusqlite::{params, Connection};
use std::sync::Mutex;

use crate::error::BridgeResult;
use crate::layers::base::Account;
use crate::layers::messages::{Destination, OfflineMessage};

/// Owns the single SQLite connection used by the bridge.
///
/// Unlike the HTTP-facing `Db` this module is modeled after, this `Db` is
/// never touched from more than one task: it is owned by `Backend`, which
/// lives entirely on the main-loop task, so no internal locking is needed
/// around the connection itself.
pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    pub fn new(path: &str) -> BridgeResult<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).ok();
            }
        }
        let conn = Connection::open(path)?;
        let db = Db {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    #[cfg(test)]
    pub fn in_memory() -> BridgeResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Db {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> BridgeResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS account (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user TEXT NOT NULL,
                network TEXT NOT NULL,
                ext_user TEXT NOT NULL,
                password TEXT NOT NULL,
                auth_token TEXT,
                UNIQUE(network, ext_user)
            )",
            [],
        )?;
        // Idempotent column additions, ignoring "duplicate column" for DBs
        // created before a given field existed.
        conn.execute("ALTER TABLE account ADD COLUMN auth_token TEXT", [])
            .ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS message (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                network TEXT,
                ext_user TEXT,
                room_id TEXT,
                sender TEXT NOT NULL,
                recipient TEXT,
                destination TEXT NOT NULL CHECK(destination IN ('client', 'matrix')),
                time TEXT NOT NULL,
                payload TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_message_destination ON message(destination)",
            [],
        )?;
        Ok(())
    }

    // --- accounts ---

    pub fn insert_account(&self, account: &Account) -> BridgeResult<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO account (user, network, ext_user, password, auth_token)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                account.user,
                account.network,
                account.ext_user,
                account.password,
                account.auth_token
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn delete_account(&self, network: &str, ext_user: &str) -> BridgeResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM account WHERE network = ?1 AND ext_user = ?2",
            params![network, ext_user],
        )?;
        Ok(())
    }

    pub fn update_auth_token(
        &self,
        network: &str,
        ext_user: &str,
        auth_token: &str,
    ) -> BridgeResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE account SET auth_token = ?1 WHERE network = ?2 AND ext_user = ?3",
            params![auth_token, network, ext_user],
        )?;
        Ok(())
    }

    pub fn load_accounts(&self) -> BridgeResult<Vec<Account>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT user, network, ext_user, password, auth_token FROM account")?;
        let rows = stmt.query_map([], |row| {
            Ok(Account {
                user: row.get(0)?,
                network: row.get(1)?,
                ext_user: row.get(2)?,
                password: row.get(3)?,
                auth_token: row.get(4)?,
                contacts: Default::default(),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // --- offline messages ---

    pub fn store_offline_message(&self, msg: &OfflineMessage) -> BridgeResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO message (network, ext_user, room_id, sender, recipient, destination, time, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                msg.network,
                msg.ext_user,
                msg.room_id,
                msg.sender,
                msg.recipient,
                destination_str(msg.destination),
                msg.time.to_rfc3339(),
                serde_json::to_string(&msg.payload).unwrap_or_default(),
            ],
        )?;
        Ok(())
    }

    pub fn load_offline_messages(
        &self,
        destination: Destination,
    ) -> BridgeResult<Vec<(i64, OfflineMessage)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, network, ext_user, room_id, sender, recipient, time, payload
             FROM message WHERE destination = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![destination_str(destination)], |row| {
            let time_str: String = row.get(6)?;
            let payload_str: String = row.get(7)?;
            Ok((
                row.get::<_, i64>(0)?,
                OfflineMessage {
                    network: row.get(1)?,
                    ext_user: row.get(2)?,
                    room_id: row.get(3)?,
                    sender: row.get(4)?,
                    recipient: row.get(5)?,
                    destination,
                    time: chrono::DateTime::parse_from_rfc3339(&time_str)
                        .map(|dt| dt.with_timezone(&chrono::Utc))
                        .unwrap_or_else(|_| chrono::Utc::now()),
                    payload: serde_json::from_str(&payload_str).unwrap_or_default(),
                },
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn delete_offline_message(&self, id: i64) -> BridgeResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM message WHERE id = ?1", params![id])?;
        Ok(())
    }
}

fn destination_str(destination: Destination) -> &'static str {
    match destination {
        Destination::Client => "client",
        Destination::Matrix => "matrix",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn round_trips_account() {
        let db = Db::in_memory().unwrap();
        let account = Account {
            user: "@alice:example.org".to_string(),
            network: "jabber".to_string(),
            ext_user: "alice@jabber.example".to_string(),
            password: "hunter2".to_string(),
            auth_token: None,
            contacts: HashSet::new(),
        };
        db.insert_account(&account).unwrap();
        let loaded = db.load_accounts().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].user, account.user);

        db.update_auth_token("jabber", "alice@jabber.example", "tok123")
            .unwrap();
        let loaded = db.load_accounts().unwrap();
        assert_eq!(loaded[0].auth_token.as_deref(), Some("tok123"));

        db.delete_account("jabber", "alice@jabber.example").unwrap();
        assert!(db.load_accounts().unwrap().is_empty());
    }

    #[test]
    fn round_trips_offline_message() {
        let db = Db::in_memory().unwrap();
        let msg = OfflineMessage {
            network: Some("jabber".to_string()),
            ext_user: Some("alice@jabber.example".to_string()),
            room_id: None,
            sender: "@bob:example.org".to_string(),
            recipient: None,
            destination: Destination::Matrix,
            time: chrono::Utc::now(),
            payload: serde_json::json!({"msgtype": "m.text", "body": "hi"}),
        };
        db.store_offline_message(&msg).unwrap();
        let loaded = db.load_offline_messages(Destination::Matrix).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].1.sender, msg.sender);
        db.delete_offline_message(loaded[0].0).unwrap();
        assert!(db
            .load_offline_messages(Destination::Matrix)
            .unwrap()
            .is_empty());
    }
}
