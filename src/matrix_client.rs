//! Thin client for the home server's client-server and admin APIs, used
//! internally by the layers.

use std::collections::HashMap;

use serde_json::{json, Value};

use crate::error::{BridgeError, BridgeResult};

pub trait MatrixClient: Send + Sync {
    fn has_user(&self, mxid: &str) -> BridgeResult<bool>;
    fn register_user(&self, mxid: &str) -> BridgeResult<()>;
    fn get_user_profile(&self, mxid: &str) -> BridgeResult<Option<Value>>;
    fn set_user_display_name(&self, mxid: &str, name: &str) -> BridgeResult<()>;
    fn set_user_avatar_url(&self, mxid: &str, avatar_url: &str) -> BridgeResult<()>;

    fn upload_content(&self, data: &[u8], content_type: &str) -> BridgeResult<String>;
    fn download_content(&self, mxc_url: &str) -> BridgeResult<Vec<u8>>;

    fn get_presence_list(&self, user: &str) -> BridgeResult<Vec<String>>;
    fn add_to_presence_list(&self, user: &str, other_users: &[String]) -> BridgeResult<()>;
    fn get_non_managed_user_presence(&self, mxid: &str) -> BridgeResult<Option<String>>;
    fn set_user_presence(&self, mxid: &str, presence: &str) -> BridgeResult<()>;

    fn set_user_typing(&self, mxid: &str, room_id: &str, typing: bool) -> BridgeResult<()>;

    fn send_message(&self, room_id: &str, sender: &str, content: &Value) -> BridgeResult<String>;

    fn create_room(&self, creator: &str, invitees: &[String]) -> BridgeResult<String>;
    fn join_room(&self, mxid: &str, room_id: &str) -> BridgeResult<()>;

    fn sync_with_filter(&self, user: &str, filter: &Value) -> BridgeResult<Value>;
    fn redact_event(&self, room_id: &str, event_id: &str, sender: &str) -> BridgeResult<()>;
    fn set_users_power_levels(
        &self,
        room_id: &str,
        levels: &HashMap<String, i64>,
    ) -> BridgeResult<()>;
}

/// Production implementation talking to a real home server over HTTP.
pub struct HttpMatrixClient {
    base_url: String,
    as_token: String,
    http: reqwest::blocking::Client,
}

impl HttpMatrixClient {
    pub fn new(base_url: impl Into<String>, as_token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            as_token: as_token.into(),
            http: reqwest::blocking::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}{}{}access_token={}",
            self.base_url.trim_end_matches('/'),
            path,
            if path.contains('?') { "&" } else { "?" },
            self.as_token
        )
    }

    fn local_username(mxid: &str) -> BridgeResult<&str> {
        mxid.strip_prefix('@')
            .and_then(|rest| rest.split(':').next())
            .ok_or_else(|| BridgeError::bad_argument(format!("not a valid mxid: {mxid}")))
    }
}

impl MatrixClient for HttpMatrixClient {
    fn has_user(&self, mxid: &str) -> BridgeResult<bool> {
        Ok(self.get_user_profile(mxid)?.is_some())
    }

    fn register_user(&self, mxid: &str) -> BridgeResult<()> {
        let username = Self::local_username(mxid)?;
        let resp = self
            .http
            .post(self.url("/_matrix/client/r0/register"))
            .json(&json!({"type": "m.login.application_service", "username": username}))
            .send()?;
        if !resp.status().is_success() {
            return Err(BridgeError::client_failure(format!(
                "register_user({mxid}) failed: {}",
                resp.status()
            )));
        }
        Ok(())
    }

    fn get_user_profile(&self, mxid: &str) -> BridgeResult<Option<Value>> {
        let resp = self
            .http
            .get(self.url(&format!("/_matrix/client/r0/profile/{mxid}")))
            .send()?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(BridgeError::transport_failure(format!(
                "get_user_profile({mxid}) failed: {}",
                resp.status()
            )));
        }
        Ok(Some(resp.json()?))
    }

    fn set_user_display_name(&self, mxid: &str, name: &str) -> BridgeResult<()> {
        self.http
            .put(self.url(&format!("/_matrix/client/r0/profile/{mxid}/displayname")))
            .json(&json!({"displayname": name}))
            .send()?;
        Ok(())
    }

    fn set_user_avatar_url(&self, mxid: &str, avatar_url: &str) -> BridgeResult<()> {
        self.http
            .put(self.url(&format!("/_matrix/client/r0/profile/{mxid}/avatar_url")))
            .json(&json!({"avatar_url": avatar_url}))
            .send()?;
        Ok(())
    }

    fn upload_content(&self, data: &[u8], content_type: &str) -> BridgeResult<String> {
        let resp = self
            .http
            .post(self.url("/_matrix/media/r0/upload"))
            .header("Content-Type", content_type)
            .body(data.to_vec())
            .send()?;
        let body: Value = resp.json()?;
        body.get("content_uri")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| BridgeError::transport_failure("upload_content: no content_uri in response"))
    }

    fn download_content(&self, mxc_url: &str) -> BridgeResult<Vec<u8>> {
        let rest = mxc_url
            .strip_prefix("mxc://")
            .ok_or_else(|| BridgeError::bad_argument(format!("not an mxc url: {mxc_url}")))?;
        let resp = self
            .http
            .get(self.url(&format!("/_matrix/media/r0/download/{rest}")))
            .send()?;
        Ok(resp.bytes()?.to_vec())
    }

    fn get_presence_list(&self, user: &str) -> BridgeResult<Vec<String>> {
        let username = Self::local_username(user)?;
        let resp = self
            .http
            .get(self.url(&format!(
                "/_matrix/client/r0/presence/list/{username}"
            )))
            .send()?;
        let body: Value = resp.json().unwrap_or(json!([]));
        Ok(body
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.get("user_id").and_then(|u| u.as_str()).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn add_to_presence_list(&self, user: &str, other_users: &[String]) -> BridgeResult<()> {
        let username = Self::local_username(user)?;
        self.http
            .post(self.url(&format!(
                "/_matrix/client/r0/presence/list/{username}"
            )))
            .json(&json!({"invite": other_users}))
            .send()?;
        Ok(())
    }

    fn get_non_managed_user_presence(&self, mxid: &str) -> BridgeResult<Option<String>> {
        let resp = self
            .http
            .get(self.url(&format!("/_matrix/client/r0/presence/{mxid}/status")))
            .send()?;
        if !resp.status().is_success() {
            return Ok(None);
        }
        let body: Value = resp.json()?;
        Ok(body
            .get("presence")
            .and_then(|v| v.as_str())
            .map(str::to_string))
    }

    fn set_user_presence(&self, mxid: &str, presence: &str) -> BridgeResult<()> {
        self.http
            .put(self.url(&format!("/_matrix/client/r0/presence/{mxid}/status")))
            .json(&json!({"presence": presence}))
            .send()?;
        Ok(())
    }

    fn set_user_typing(&self, mxid: &str, room_id: &str, typing: bool) -> BridgeResult<()> {
        self.http
            .put(self.url(&format!(
                "/_matrix/client/r0/rooms/{room_id}/typing/{mxid}"
            )))
            .json(&json!({"typing": typing, "timeout": 20000}))
            .send()?;
        Ok(())
    }

    fn send_message(&self, room_id: &str, sender: &str, content: &Value) -> BridgeResult<String> {
        let resp = self
            .http
            .post(self.url(&format!(
                "/_matrix/client/r0/rooms/{room_id}/send/m.room.message?user_id={sender}"
            )))
            .json(content)
            .send()?;
        let body: Value = resp.json()?;
        body.get("event_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| BridgeError::transport_failure("send_message: no event_id in response"))
    }

    fn create_room(&self, creator: &str, invitees: &[String]) -> BridgeResult<String> {
        let resp = self
            .http
            .post(self.url(&format!(
                "/_matrix/client/r0/createRoom?user_id={creator}"
            )))
            .json(&json!({"invite": invitees, "preset": "trusted_private_chat", "is_direct": true}))
            .send()?;
        let body: Value = resp.json()?;
        body.get("room_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| BridgeError::transport_failure("create_room: no room_id in response"))
    }

    fn join_room(&self, mxid: &str, room_id: &str) -> BridgeResult<()> {
        self.http
            .post(self.url(&format!(
                "/_matrix/client/r0/rooms/{room_id}/join?user_id={mxid}"
            )))
            .send()?;
        Ok(())
    }

    fn sync_with_filter(&self, user: &str, filter: &Value) -> BridgeResult<Value> {
        let resp = self
            .http
            .get(self.url(&format!(
                "/_matrix/client/r0/sync?user_id={user}&filter={filter}",
                filter = urlencode_json(filter)
            )))
            .send()?;
        Ok(resp.json()?)
    }

    fn redact_event(&self, room_id: &str, event_id: &str, sender: &str) -> BridgeResult<()> {
        self.http
            .post(self.url(&format!(
                "/_matrix/client/r0/rooms/{room_id}/redact/{event_id}?user_id={sender}"
            )))
            .json(&json!({}))
            .send()?;
        Ok(())
    }

    fn set_users_power_levels(
        &self,
        room_id: &str,
        levels: &HashMap<String, i64>,
    ) -> BridgeResult<()> {
        self.http
            .put(self.url(&format!(
                "/_matrix/client/r0/rooms/{room_id}/state/m.room.power_levels"
            )))
            .json(&json!({"users": levels}))
            .send()?;
        Ok(())
    }
}

fn urlencode_json(value: &Value) -> String {
    let raw = value.to_string();
    raw.chars()
        .flat_map(|c| {
            if c.is_ascii_alphanumeric() {
                vec![c]
            } else {
                format!("%{:02X}", c as u32).chars().collect()
            }
        })
        .collect()
}

pub mod fake {
    use super::*;
    use std::collections::HashMap as Map;
    use std::sync::RwLock;

    /// In-memory fake used by layer tests in place of a real home server.
    #[derive(Default)]
    pub struct FakeMatrixClient {
        pub profiles: RwLock<Map<String, Value>>,
        pub rooms: RwLock<Vec<(String, Vec<String>)>>,
        pub sent: RwLock<Vec<(String, Value)>>,
        pub next_room_id: RwLock<u64>,
    }

    impl MatrixClient for FakeMatrixClient {
        fn has_user(&self, mxid: &str) -> BridgeResult<bool> {
            Ok(self.profiles.read().unwrap().contains_key(mxid))
        }
        fn register_user(&self, mxid: &str) -> BridgeResult<()> {
            self.profiles
                .write()
                .unwrap()
                .entry(mxid.to_string())
                .or_insert(json!({}));
            Ok(())
        }
        fn get_user_profile(&self, mxid: &str) -> BridgeResult<Option<Value>> {
            Ok(self.profiles.read().unwrap().get(mxid).cloned())
        }
        fn set_user_display_name(&self, mxid: &str, name: &str) -> BridgeResult<()> {
            self.profiles
                .write()
                .unwrap()
                .entry(mxid.to_string())
                .or_insert(json!({}))["displayname"] = json!(name);
            Ok(())
        }
        fn set_user_avatar_url(&self, mxid: &str, avatar_url: &str) -> BridgeResult<()> {
            self.profiles
                .write()
                .unwrap()
                .entry(mxid.to_string())
                .or_insert(json!({}))["avatar_url"] = json!(avatar_url);
            Ok(())
        }
        fn upload_content(&self, _data: &[u8], _content_type: &str) -> BridgeResult<String> {
            Ok("mxc://example.org/fake".to_string())
        }
        fn download_content(&self, _mxc_url: &str) -> BridgeResult<Vec<u8>> {
            Ok(vec![])
        }
        fn get_presence_list(&self, _user: &str) -> BridgeResult<Vec<String>> {
            Ok(vec![])
        }
        fn add_to_presence_list(&self, _user: &str, _other_users: &[String]) -> BridgeResult<()> {
            Ok(())
        }
        fn get_non_managed_user_presence(&self, _mxid: &str) -> BridgeResult<Option<String>> {
            Ok(None)
        }
        fn set_user_presence(&self, _mxid: &str, _presence: &str) -> BridgeResult<()> {
            Ok(())
        }
        fn set_user_typing(&self, _mxid: &str, _room_id: &str, _typing: bool) -> BridgeResult<()> {
            Ok(())
        }
        fn send_message(&self, room_id: &str, _sender: &str, content: &Value) -> BridgeResult<String> {
            self.sent
                .write()
                .unwrap()
                .push((room_id.to_string(), content.clone()));
            Ok(format!("$event-{}", self.sent.read().unwrap().len()))
        }
        fn create_room(&self, creator: &str, invitees: &[String]) -> BridgeResult<String> {
            let mut n = self.next_room_id.write().unwrap();
            *n += 1;
            let room_id = format!("!room{n}:example.org");
            let mut members = vec![creator.to_string()];
            members.extend(invitees.iter().cloned());
            self.rooms.write().unwrap().push((room_id.clone(), members));
            Ok(room_id)
        }
        fn join_room(&self, _mxid: &str, _room_id: &str) -> BridgeResult<()> {
            Ok(())
        }
        fn sync_with_filter(&self, _user: &str, _filter: &Value) -> BridgeResult<Value> {
            Ok(json!({"next_batch": "s0", "rooms": {"join": {}}}))
        }
        fn redact_event(&self, _room_id: &str, _event_id: &str, _sender: &str) -> BridgeResult<()> {
            Ok(())
        }
        fn set_users_power_levels(
            &self,
            _room_id: &str,
            _levels: &Map<String, i64>,
        ) -> BridgeResult<()> {
            Ok(())
        }
    }
}
