//! Typing notifications, 1:1 rooms only — a known limitation shared with
//! presence, see the multi-user-rooms note in the design docs.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use crate::layers::base::BaseLayer;
use crate::models::RoomEvent;

pub struct TypingLayer {
    base: Rc<RefCell<BaseLayer>>,
    /// Per-room set of mxids the home server currently shows as typing,
    /// used to detect and correct echo loops from our own typing pushes.
    typing_state: std::collections::HashMap<String, HashSet<String>>,
}

impl TypingLayer {
    pub fn new(base: Rc<RefCell<BaseLayer>>) -> Self {
        TypingLayer {
            base,
            typing_state: std::collections::HashMap::new(),
        }
    }

    pub fn on_contact_typing(&mut self, network: &str, ext_user: &str, ext_contact: &str) {
        let room_id = self
            .base
            .borrow_mut()
            .ensure_room(network, ext_user, ext_contact, None);
        let Some(mxid_contact) = self.base.borrow_mut().ext_contact_to_mxid(network, ext_contact) else {
            return;
        };
        let _ = self.base.borrow().matrix.set_user_typing(&mxid_contact, &room_id, true);
    }

    pub fn on_transaction_typing(&mut self, _txn_id: &str, event: &RoomEvent) {
        let typing_user_ids: HashSet<String> = event
            .content
            .get("user_ids")
            .and_then(serde_json::Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let room = self.base.borrow().rooms.get(&event.room_id).cloned();
        let Some(room) = room else { return };
        let Some(user) = room.members.iter().next().cloned() else { return };

        let (network, ext_user) = match (&room.network, &room.ext_user) {
            (Some(n), Some(u)) => (n.clone(), u.clone()),
            _ => return,
        };
        let conv_id = match &room.conv_id {
            Some(id) => id.clone(),
            None => {
                let client = {
                    let base = self.base.borrow();
                    base.networks
                        .get(&network)
                        .and_then(|n| base.clients.get(&n.client))
                        .cloned()
                };
                let ext_contact = room.members.iter().find(|m| m.as_str() != user).cloned();
                match (client, ext_contact) {
                    (Some(client), Some(ext_contact)) => client
                        .create_conversation(&network, &ext_user, &ext_contact)
                        .unwrap_or(ext_contact),
                    _ => return,
                }
            }
        };

        let was_typing = self
            .typing_state
            .get(&event.room_id)
            .map(|s| s.contains(&user))
            .unwrap_or(false);
        let now_typing = typing_user_ids.contains(&user);
        // Self-correct: if our own earlier typing push didn't match what
        // the server now reports, trust the server's state rather than our
        // local guess — prevents the two from drifting apart forever.
        self.typing_state
            .entry(event.room_id.clone())
            .or_default()
            .clone_from(&typing_user_ids);

        if now_typing && !was_typing {
            let client = {
                let base = self.base.borrow();
                base.networks
                    .get(&network)
                    .and_then(|n| base.clients.get(&n.client))
                    .cloned()
            };
            if let Some(client) = client {
                let _ = client.set_typing(&network, &ext_user, &conv_id);
            }
        }
    }
}
