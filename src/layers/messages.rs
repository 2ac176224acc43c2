//! Text/image/file delivery in both directions, with durable offline
//! queuing and echo-loop suppression.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::db::Db;
use crate::error::BridgeResult;
use crate::layers::base::BaseLayer;
use crate::models::RoomEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Destination {
    Client,
    Matrix,
}

#[derive(Debug, Clone)]
pub struct OfflineMessage {
    pub network: Option<String>,
    pub ext_user: Option<String>,
    pub room_id: Option<String>,
    pub sender: String,
    pub recipient: Option<String>,
    pub destination: Destination,
    pub time: DateTime<Utc>,
    pub payload: Value,
}

pub struct MessagesLayer {
    base: Rc<RefCell<BaseLayer>>,
    db: Rc<Db>,
    /// Event ids we generated ourselves on the home server, to recognize
    /// and drop the transaction echo of our own sends instead of
    /// re-delivering them back to the IM back-end.
    sent_ids: HashSet<String>,
}

impl MessagesLayer {
    pub fn new(base: Rc<RefCell<BaseLayer>>, db: Rc<Db>) -> Self {
        MessagesLayer {
            base,
            db,
            sent_ids: HashSet::new(),
        }
    }

    pub fn on_connection_error(&mut self) {}

    /// Called when the back-end reports a new text message from a contact.
    pub fn on_new_message(
        &mut self,
        network: &str,
        ext_user: &str,
        ext_contact: &str,
        conv_id: Option<&str>,
        text: &str,
        time: DateTime<Utc>,
    ) -> BridgeResult<()> {
        let content = self.build_text_payload(network, text);
        self.route_client_message(network, ext_user, ext_contact, conv_id, time, content)
    }

    /// Builds the `m.text` payload sent to Matrix for a client-originated
    /// message: the network's `convert_to_text` hook produces the plain
    /// `body`, and a configured `format` additionally carries the original
    /// `body` through as `formatted_body`.
    fn build_text_payload(&self, network: &str, body: &str) -> Value {
        let net_conf = self.base.borrow().networks.get(network).cloned();
        let mut text_body = body.to_string();
        let mut format_tag = None;
        if let Some(net_conf) = net_conf {
            match net_conf.convert_to_text.as_deref() {
                Some("html2text") => text_body = convert_to_text(body),
                Some(other) => {
                    tracing::error!(network, converter = other, "unknown convert_to_text converter");
                }
                None => {}
            }
            format_tag = net_conf.format;
        }
        let mut payload = json!({"msgtype": "m.text", "body": text_body});
        if let Some(fmt) = format_tag {
            payload["format"] = json!(fmt);
            payload["formatted_body"] = json!(body);
        }
        payload
    }

    pub fn on_new_image(
        &mut self,
        network: &str,
        ext_user: &str,
        ext_contact: &str,
        conv_id: Option<&str>,
        data: &[u8],
        filename: &str,
        time: DateTime<Utc>,
    ) -> BridgeResult<()> {
        self.send_file_to_matrix(network, ext_user, ext_contact, conv_id, data, filename, time, "m.image")
    }

    pub fn on_new_file(
        &mut self,
        network: &str,
        ext_user: &str,
        ext_contact: &str,
        conv_id: Option<&str>,
        data: &[u8],
        filename: &str,
        time: DateTime<Utc>,
    ) -> BridgeResult<()> {
        self.send_file_to_matrix(network, ext_user, ext_contact, conv_id, data, filename, time, "m.file")
    }

    fn send_file_to_matrix(
        &mut self,
        network: &str,
        ext_user: &str,
        ext_contact: &str,
        conv_id: Option<&str>,
        data: &[u8],
        filename: &str,
        time: DateTime<Utc>,
        msgtype: &str,
    ) -> BridgeResult<()> {
        let content_type = infer::get(data)
            .map(|kind| kind.mime_type().to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let (mxc_url, body) = {
            let base = self.base.borrow();
            match base.matrix.upload_content(data, &content_type) {
                Ok(url) => (Some(url), filename.to_string()),
                Err(_) => (
                    None,
                    format!(
                        "{filename} (base64): {}",
                        base64::Engine::encode(&base64::engine::general_purpose::STANDARD, data)
                    ),
                ),
            }
        };
        let content = match mxc_url {
            Some(url) => json!({"msgtype": msgtype, "body": body, "url": url}),
            None => json!({"msgtype": "m.text", "body": body}),
        };
        self.route_client_message(network, ext_user, ext_contact, conv_id, time, content)
    }

    fn route_client_message(
        &mut self,
        network: &str,
        ext_user: &str,
        ext_contact: &str,
        conv_id: Option<&str>,
        time: DateTime<Utc>,
        content: Value,
    ) -> BridgeResult<()> {
        let room_id = self
            .base
            .borrow_mut()
            .ensure_room(network, ext_user, ext_contact, conv_id);
        let (sender_mxid, recipient_mxid) = {
            let mut base = self.base.borrow_mut();
            let Some(sender) = base.ext_contact_to_mxid(network, ext_contact) else {
                return Err(crate::error::BridgeError::bad_argument(format!(
                    "cannot map contact '{ext_contact}' on network '{network}' to an mxid"
                )));
            };
            let recipient = base
                .find_account(network, ext_user)
                .map(|acc| acc.borrow().user.clone());
            (sender, recipient)
        };
        match recipient_mxid {
            Some(recipient) => {
                self.send_message_to_matrix(conv_id, &room_id, &sender_mxid, &recipient, time, content)
            }
            None => self.store_offline_message_to_matrix(
                network, ext_user, &room_id, &sender_mxid, time, content,
            ),
        }
    }

    /// Sends (or queues, on failure) a message from `sender` to `recipient`
    /// on the home server.
    pub fn send_message_to_matrix(
        &mut self,
        _conv_id: Option<&str>,
        room_id: &str,
        sender: &str,
        recipient: &str,
        time: DateTime<Utc>,
        content: Value,
    ) -> BridgeResult<()> {
        let result = self.base.borrow().matrix.send_message(room_id, sender, &content);
        match result {
            Ok(event_id) => {
                self.sent_ids.insert(event_id);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "send_message_to_matrix failed, queuing offline");
                self.store_offline_message(OfflineMessage {
                    network: None,
                    ext_user: None,
                    room_id: Some(room_id.to_string()),
                    sender: sender.to_string(),
                    recipient: Some(recipient.to_string()),
                    destination: Destination::Matrix,
                    time,
                    payload: content,
                })
            }
        }
    }

    /// Sends (or queues) a message to an external contact via the IM
    /// back-end for `network`.
    pub fn send_message_to_client(
        &mut self,
        network: &str,
        ext_user: &str,
        ext_contact: &str,
        conv_id: &str,
        text: &str,
    ) -> BridgeResult<()> {
        let client = {
            let base = self.base.borrow();
            base.networks
                .get(network)
                .and_then(|conf| base.clients.get(&conf.client))
                .cloned()
        };
        let Some(client) = client else {
            return self.store_offline_message(OfflineMessage {
                network: Some(network.to_string()),
                ext_user: Some(ext_user.to_string()),
                room_id: None,
                sender: ext_user.to_string(),
                recipient: Some(ext_contact.to_string()),
                destination: Destination::Client,
                time: Utc::now(),
                payload: json!({"msgtype": "m.text", "body": text}),
            });
        };
        match client.send_message(network, ext_user, conv_id, text) {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, "send_message_to_client failed, queuing offline");
                self.store_offline_message(OfflineMessage {
                    network: Some(network.to_string()),
                    ext_user: Some(ext_user.to_string()),
                    room_id: None,
                    sender: ext_user.to_string(),
                    recipient: Some(ext_contact.to_string()),
                    destination: Destination::Client,
                    time: Utc::now(),
                    payload: json!({"msgtype": "m.text", "body": text}),
                })
            }
        }
    }

    /// Routes an incoming `m.room.message` event from a non-service room:
    /// translates and forwards it to the contact's IM back-end, or queues
    /// it when the room isn't (yet) bound to an account.
    pub fn process_transaction_message(&mut self, _txn_id: &str, event: &RoomEvent) {
        if let Some(event_id) = event_id_of(event) {
            if self.sent_ids.remove(&event_id) {
                return;
            }
        }
        let room = self.base.borrow().rooms.get(&event.room_id).cloned();
        let Some(room) = room else {
            tracing::warn!(room_id = %event.room_id, "message in unknown room, dropping");
            return;
        };
        match (room.network, room.ext_user) {
            (Some(network), Some(ext_user)) => {
                let text = self.render_for_client(&network, &event.content);
                let ext_contact = room
                    .members
                    .iter()
                    .find(|m| m.as_str() != event.sender)
                    .cloned();
                let Some(ext_contact) = ext_contact else {
                    return;
                };
                let conv_id = room.conv_id.clone().unwrap_or_else(|| ext_contact.clone());
                let _ = self.send_message_to_client(&network, &ext_user, &ext_contact, &conv_id, &text);
            }
            _ => {
                let body = event
                    .content
                    .get("body")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                self.store_offline_message_to_clients_without_account(event, body);
            }
        }
    }

    /// Renders a home-server message payload for delivery to `network`'s IM
    /// back-end: uses `formatted_body` verbatim when its `format` tag
    /// matches the network's configured `format`, otherwise renders the
    /// plain `body` through the network's `convert_from_text` hook (falling
    /// back to the plain body for an unconfigured or unknown hook).
    fn render_for_client(&self, network: &str, content: &Value) -> String {
        let body = content.get("body").and_then(Value::as_str).unwrap_or_default();
        let format = content.get("format").and_then(Value::as_str);
        let formatted_body = content.get("formatted_body").and_then(Value::as_str);

        let net_conf = self.base.borrow().networks.get(network).cloned();
        let Some(net_conf) = net_conf else {
            return body.to_string();
        };

        if let (Some(configured_format), Some(fmt), Some(formatted_body)) =
            (net_conf.format.as_deref(), format, formatted_body)
        {
            if configured_format == fmt {
                return formatted_body.to_string();
            }
        }

        match net_conf.convert_from_text.as_deref() {
            Some("markdown") => convert_from_text(body),
            Some(other) => {
                tracing::error!(network, converter = other, "unknown convert_from_text converter");
                body.to_string()
            }
            None => body.to_string(),
        }
    }

    fn store_offline_message(&mut self, msg: OfflineMessage) -> BridgeResult<()> {
        self.db.store_offline_message(&msg)
    }

    fn store_offline_message_to_matrix(
        &mut self,
        network: &str,
        ext_user: &str,
        room_id: &str,
        sender: &str,
        time: DateTime<Utc>,
        content: Value,
    ) -> BridgeResult<()> {
        self.store_offline_message(OfflineMessage {
            network: Some(network.to_string()),
            ext_user: Some(ext_user.to_string()),
            room_id: Some(room_id.to_string()),
            sender: sender.to_string(),
            recipient: None,
            destination: Destination::Matrix,
            time,
            payload: content,
        })
    }

    fn store_offline_message_to_clients_without_account(&mut self, event: &RoomEvent, text: &str) {
        let _ = self.store_offline_message(OfflineMessage {
            network: None,
            ext_user: None,
            room_id: Some(event.room_id.clone()),
            sender: event.sender.clone(),
            recipient: None,
            destination: Destination::Client,
            time: Utc::now(),
            payload: json!({"msgtype": "m.text", "body": text}),
        });
    }

    /// One retry sweep over queued matrix-bound messages; called off a
    /// periodic timer. The timer itself runs unconditionally (a simpler,
    /// behaviorally-equivalent rendering of "armed only while non-empty"
    /// since each tick is a cheap no-op when the queue has drained).
    pub fn on_attempt_delivery_to_matrix(&mut self) {
        let pending = match self.db.load_offline_messages(Destination::Matrix) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "failed to load offline matrix messages");
                return;
            }
        };
        for (id, msg) in pending {
            if self.attempt_delivery_to_matrix(&msg).is_ok() {
                let _ = self.db.delete_offline_message(id);
            }
        }
    }

    pub fn on_attempt_delivery_to_clients(&mut self) {
        let pending = match self.db.load_offline_messages(Destination::Client) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "failed to load offline client messages");
                return;
            }
        };
        for (id, msg) in pending {
            if self.attempt_delivery_to_client(&msg).is_ok() {
                let _ = self.db.delete_offline_message(id);
            }
        }
    }

    fn attempt_delivery_to_matrix(&mut self, msg: &OfflineMessage) -> BridgeResult<()> {
        let (Some(room_id), Some(recipient)) = (&msg.room_id, &msg.recipient) else {
            return Err(crate::error::BridgeError::internal(
                "offline matrix message missing recipient/room_id",
            ));
        };
        self.base
            .borrow()
            .matrix
            .send_message(room_id, &msg.sender, &msg.payload)
            .map(|event_id| {
                self.sent_ids.insert(event_id);
            })
            .map_err(|e| {
                let _ = recipient;
                e
            })
    }

    fn attempt_delivery_to_client(&mut self, msg: &OfflineMessage) -> BridgeResult<()> {
        let (Some(network), Some(ext_user), Some(recipient)) =
            (&msg.network, &msg.ext_user, &msg.recipient)
        else {
            return Err(crate::error::BridgeError::internal(
                "offline client message missing network/ext_user/recipient",
            ));
        };
        let text = msg
            .payload
            .get("body")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let conv_id = recipient.clone();
        self.send_message_to_client(network, ext_user, recipient, &conv_id, text)
    }
}

fn event_id_of(event: &RoomEvent) -> Option<String> {
    Some(event.event_id.clone())
}

/// HTML to plaintext, used when rendering a Matrix `formatted_body` for an
/// IM back-end that only understands plain text.
pub fn convert_to_text(html: &str) -> String {
    match html2text::from_read(html.as_bytes(), usize::MAX) {
        text => text.trim_end_matches("\n\n").to_string(),
    }
}

/// Plaintext/markdown to HTML, used when rendering a client-origin message
/// for Matrix's `formatted_body`.
pub fn convert_from_text(text: &str) -> String {
    let parser = pulldown_cmark::Parser::new(text);
    let mut html = String::new();
    pulldown_cmark::html::push_html(&mut html, parser);
    html
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_roundtrip_strips_trailing_blank_line() {
        let text = convert_to_text("<p>hello <b>world</b></p>");
        assert!(text.contains("hello"));
        assert!(!text.ends_with("\n\n"));
    }

    #[test]
    fn markdown_renders_basic_emphasis() {
        let html = convert_from_text("**bold**");
        assert!(html.contains("<strong>bold</strong>"));
    }
}
