//! Keeps the bridge's view of room membership consistent with the home
//! server: populating rooms for newly-seen contacts/service users and
//! reacting to invite/join/leave events.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use serde_json::json;

use crate::layers::base::{Account, BaseLayer};
use crate::layers::service::ServiceLayer;
use crate::models::RoomEvent;

pub struct RoomStateLayer {
    base: Rc<RefCell<BaseLayer>>,
    service: Rc<RefCell<ServiceLayer>>,
    contact_rooms_populated: HashSet<(String, String)>,
}

impl RoomStateLayer {
    pub fn new(base: Rc<RefCell<BaseLayer>>, service: Rc<RefCell<ServiceLayer>>) -> Self {
        RoomStateLayer {
            base,
            service,
            contact_rooms_populated: HashSet::new(),
        }
    }

    pub fn start(&mut self) {
        self.populate_service_rooms();
    }

    pub fn on_user_signed_on(&mut self, network: &str, ext_user: &str, account: &Rc<RefCell<Account>>) {
        let key = (network.to_string(), ext_user.to_string());
        if self.contact_rooms_populated.contains(&key) {
            return;
        }
        self.contact_rooms_populated.insert(key);
        self.populate_contact_rooms(network, ext_user, account);
    }

    pub fn on_contact_updated(&mut self, network: &str, ext_user: &str, ext_contact: &str) {
        let Some(mxid_contact) = self.base.borrow_mut().ext_contact_to_mxid(network, ext_contact) else {
            return;
        };
        let user_mxid = self
            .base
            .borrow()
            .find_account(network, ext_user)
            .map(|a| a.borrow().user.clone());
        let Some(user_mxid) = user_mxid else { return };
        if let Some(room) = self
            .base
            .borrow_mut()
            .rooms
            .values_mut()
            .find(|r| r.network.as_deref() == Some(network) && r.ext_user.as_deref() == Some(ext_user) && r.members.contains(&mxid_contact))
        {
            room.members.insert(user_mxid);
        }
    }

    /// Dispatches an `m.room.member` event to the invite/leave/join handler.
    pub fn on_transaction_membership(&mut self, _txn_id: &str, event: &RoomEvent) {
        match event.content.get("membership").and_then(serde_json::Value::as_str) {
            Some("invite") => self.handle_invite_event(event),
            Some("leave") => self.handle_leave_event(event),
            Some("join") => self.handle_join_event(event),
            _ => {}
        }
    }

    fn handle_invite_event(&mut self, event: &RoomEvent) {
        let Some(state_key) = event.state_key.clone() else { return };
        if state_key == self.service.borrow().user || state_key.starts_with('@') {
            let _ = self.base.borrow().matrix.join_room(&state_key, &event.room_id);
        }
    }

    fn handle_leave_event(&mut self, event: &RoomEvent) {
        if let Some(room) = self.base.borrow_mut().rooms.get_mut(&event.room_id) {
            if let Some(state_key) = &event.state_key {
                room.members.remove(state_key);
            }
        }
    }

    fn handle_join_event(&mut self, event: &RoomEvent) {
        // Sanity-check only: membership bookkeeping already happened when
        // the room was created or the invite was accepted.
        tracing::debug!(room_id = %event.room_id, sender = %event.sender, "observed join");
    }

    fn populate_service_rooms(&mut self) {
        let service_user = self.service.borrow().user.clone();
        let filter = json!({
            "room": {
                "state": {
                    "types": ["m.room.member"],
                    "lazy_load_members": true
                },
                "timeline": {"limit": 0},
                "ephemeral": {"types": []},
                "account_data": {"types": []}
            },
            "event_fields": ["type", "content.membership", "state_key"]
        });
        let joined = self.get_rooms_state(&filter);
        for (room_id, members) in joined {
            if members.contains(&service_user) {
                self.service
                    .borrow_mut()
                    .rooms
                    .entry(room_id.clone())
                    .or_default()
                    .user = members.iter().find(|m| m.as_str() != service_user).cloned();
                self.base.borrow_mut().rooms.entry(room_id).or_default().members = members;
            }
        }
    }

    fn populate_contact_rooms(&mut self, network: &str, ext_user: &str, account: &Rc<RefCell<Account>>) {
        for ext_contact in account.borrow().contacts.clone() {
            self.on_contact_updated(network, ext_user, &ext_contact);
        }
    }

    /// Repeatedly fetches filtered sync state until `next_batch` stops
    /// advancing, accumulating joined-room membership.
    fn get_rooms_state(&self, filter: &serde_json::Value) -> Vec<(String, HashSet<String>)> {
        let mut out = Vec::new();
        let mut last_batch: Option<String> = None;
        let service_user = self.service.borrow().user.clone();
        for _ in 0..8 {
            let state = match self.base.borrow().matrix.sync_with_filter(&service_user, filter) {
                Ok(s) => s,
                Err(_) => break,
            };
            let next_batch = state.get("next_batch").and_then(|v| v.as_str()).map(str::to_string);
            if let Some(join) = state.get("rooms").and_then(|r| r.get("join")).and_then(|j| j.as_object()) {
                for (room_id, room_body) in join {
                    out.push((room_id.clone(), Self::members_from_room_state(room_body)));
                }
            }
            if next_batch.is_none() || next_batch == last_batch {
                break;
            }
            last_batch = next_batch;
        }
        out
    }

    /// Pulls joined-member mxids out of a sync response room body's
    /// `state.events` array by filtering for `m.room.member` events whose
    /// content reports `membership: "join"`.
    fn members_from_room_state(room_body: &serde_json::Value) -> HashSet<String> {
        room_body
            .get("state")
            .and_then(|s| s.get("events"))
            .and_then(|e| e.as_array())
            .map(|events| {
                events
                    .iter()
                    .filter(|ev| ev.get("type").and_then(|t| t.as_str()) == Some("m.room.member"))
                    .filter(|ev| {
                        ev.get("content")
                            .and_then(|c| c.get("membership"))
                            .and_then(|m| m.as_str())
                            == Some("join")
                    })
                    .filter_map(|ev| ev.get("state_key").and_then(|k| k.as_str()).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}
