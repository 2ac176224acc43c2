//! The service user: the bot every bridge user talks to for registration,
//! account management, and other commands that aren't ordinary messages.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use chrono::Utc;

use crate::layers::base::BaseLayer;
use crate::layers::messages::MessagesLayer;
use crate::models::RoomEvent;

pub type ServiceCallback = Box<dyn FnMut(&str, &RoomEvent, &[String]) -> bool>;

pub struct ServiceCallbackConfig {
    pub callback: ServiceCallback,
    pub description: String,
}

#[derive(Default)]
pub struct ServiceRoom {
    pub user: Option<String>,
    pub data: HashMap<&'static str, crate::layers::input::ScratchValue>,
}

pub struct ServiceLayer {
    base: Rc<RefCell<BaseLayer>>,
    messages: Rc<RefCell<MessagesLayer>>,
    pub rooms: HashMap<String, ServiceRoom>,
    callbacks: HashMap<String, Vec<ServiceCallbackConfig>>,
    pub user: String,
    display_name: String,
}

impl ServiceLayer {
    pub fn new(
        base: Rc<RefCell<BaseLayer>>,
        messages: Rc<RefCell<MessagesLayer>>,
        service_localpart: &str,
        display_name: &str,
    ) -> Self {
        let hs_host = base.borrow().hs_host.clone();
        ServiceLayer {
            base,
            messages,
            rooms: HashMap::new(),
            callbacks: HashMap::new(),
            user: format!("@{service_localpart}:{hs_host}"),
            display_name: display_name.to_string(),
        }
    }

    /// Registers the service user on first run (an empty profile is the
    /// signal that it doesn't exist yet — Matrix-style home servers may
    /// answer presence queries for unregistered users, so profile emptiness
    /// is the only reliable existence check).
    pub fn start(&mut self) {
        let base = self.base.borrow();
        let profile = base.matrix.get_user_profile(&self.user).ok().flatten();
        let needs_register = profile
            .as_ref()
            .map(|p| p.get("displayname").is_none())
            .unwrap_or(true);
        if needs_register {
            let _ = base.matrix.register_user(&self.user);
            let _ = base.matrix.set_user_display_name(&self.user, &self.display_name);
        }
    }

    pub fn add_service_callback(&mut self, cmd_id: &str, description: &str, callback: ServiceCallback) {
        self.callbacks
            .entry(cmd_id.to_string())
            .or_default()
            .push(ServiceCallbackConfig {
                callback,
                description: description.to_string(),
            });
    }

    pub fn ensure_room(&mut self, user: &str) -> String {
        if let Some((room_id, _)) = self.rooms.iter().find(|(_, r)| r.user.as_deref() == Some(user)) {
            return room_id.clone();
        }
        let room_id = self
            .base
            .borrow()
            .matrix
            .create_room(&self.user, &[user.to_string()])
            .unwrap_or_else(|_| format!("!service-{}:{}", self.rooms.len(), self.base.borrow().hs_host));
        self.rooms.insert(
            room_id.clone(),
            ServiceRoom {
                user: Some(user.to_string()),
                data: HashMap::new(),
            },
        );
        room_id
    }

    pub fn send_message(&mut self, room_id: &str, user: &str, text: &str) {
        let _ = self.messages.borrow_mut().send_message_to_matrix(
            None,
            room_id,
            &self.user,
            user,
            Utc::now(),
            serde_json::json!({"msgtype": "m.text", "body": text}),
        );
    }

    /// Routes a Matrix message either to service command handlers, or to
    /// the ordinary messages pipeline when the room isn't a service room.
    pub fn on_transaction_message(&mut self, txn_id: &str, event: &RoomEvent) {
        if !self.rooms.contains_key(&event.room_id) {
            self.messages.borrow_mut().process_transaction_message(txn_id, event);
            return;
        }
        if event.sender == self.user {
            return;
        }
        let message = event
            .content
            .get("body")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();

        if let Some(full_message_cbs) = self.callbacks.get_mut("full-message") {
            for cb_config in full_message_cbs.iter_mut() {
                if (cb_config.callback)(txn_id, event, &[]) {
                    return;
                }
            }
        }

        for cmd in message.split('\n') {
            let args = match shell_words::split(cmd) {
                Ok(args) if !args.is_empty() => args,
                _ => continue,
            };
            if args[0] == "help" {
                let usage = self.get_service_usage();
                self.send_message(&event.room_id, &event.sender, &usage);
                continue;
            }
            if let Some(cbs) = self.callbacks.get_mut(&args[0]) {
                for cb_config in cbs.iter_mut() {
                    (cb_config.callback)(txn_id, event, &args);
                }
                continue;
            }
            let usage = self.get_service_usage();
            self.send_message(
                &event.room_id,
                &event.sender,
                &format!("Unknown command: '{cmd}'\n{usage}"),
            );
            return;
        }
    }

    fn get_service_usage(&self) -> String {
        let mut descrs: Vec<&str> = self
            .callbacks
            .iter()
            .filter(|(cmd_id, _)| cmd_id.as_str() != "full-message")
            .flat_map(|(_, cbs)| cbs.iter().map(|c| c.description.as_str()))
            .collect();
        descrs.sort_unstable();
        format!("Usage:\n{}\nhelp - this help", descrs.join("\n"))
    }
}
