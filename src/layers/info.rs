//! The `accounts` and `contacts` service commands: read-only introspection
//! of what the bridge currently has registered.

use std::cell::RefCell;
use std::rc::Rc;

use crate::db::Db;
use crate::layers::base::BaseLayer;
use crate::layers::messages::Destination;
use crate::layers::service::ServiceLayer;
use crate::models::RoomEvent;

pub struct InfoLayer {
    base: Rc<RefCell<BaseLayer>>,
    service: Rc<RefCell<ServiceLayer>>,
    db: Rc<Db>,
}

impl InfoLayer {
    pub fn new(base: Rc<RefCell<BaseLayer>>, service: Rc<RefCell<ServiceLayer>>, db: Rc<Db>) -> Self {
        InfoLayer { base, service, db }
    }

    /// No-op: the "accounts"/"contacts" service callbacks are registered by
    /// the backend wiring once this layer already lives behind an `Rc`.
    pub fn start(&mut self) {}

    pub fn on_service_accounts(&mut self, _txn_id: &str, event: &RoomEvent, _args: &[String]) -> bool {
        let offline_to_clients = self
            .db
            .load_offline_messages(Destination::Client)
            .map(|v| v.len())
            .unwrap_or(0);

        let base = self.base.borrow();
        let mut lines = Vec::new();
        for account in base.accounts.values() {
            let account = account.borrow();
            let client = base
                .networks
                .get(&account.network)
                .and_then(|n| base.clients.get(&n.client));
            let status = client
                .map(|_| "connected")
                .unwrap_or("unconfigured");
            lines.push(format!(
                "* Network: '{}', user: '{}', status: '{}', contacts: {}, offline messages: {}",
                account.network,
                account.ext_user,
                status,
                account.contacts.len(),
                offline_to_clients
            ));
        }
        drop(base);
        let text = if lines.is_empty() {
            "No accounts registered.".to_string()
        } else {
            lines.join("\n")
        };
        self.service.borrow_mut().send_message(&event.room_id, &event.sender, &text);
        true
    }

    pub fn on_service_contacts(&mut self, _txn_id: &str, event: &RoomEvent, args: &[String]) -> bool {
        if args.len() != 3 {
            self.service
                .borrow_mut()
                .send_message(&event.room_id, &event.sender, "Usage: contacts <network> <user>");
            return true;
        }
        let network = &args[1];
        let ext_user = &args[2];
        let base = self.base.borrow();
        let Some(account) = base.find_account(network, ext_user) else {
            drop(base);
            self.service.borrow_mut().send_message(
                &event.room_id,
                &event.sender,
                &format!("No such account: '{ext_user}' on '{network}'"),
            );
            return true;
        };
        let client = base
            .networks
            .get(network)
            .and_then(|n| base.clients.get(&n.client))
            .cloned();
        let account = account.borrow();
        let mut lines = Vec::new();
        for ext_contact in &account.contacts {
            let displayname = client
                .as_ref()
                .and_then(|c| c.get_contact_displayname(network, ext_user, ext_contact).ok().flatten())
                .unwrap_or_else(|| ext_contact.clone());
            let status = client
                .as_ref()
                .and_then(|c| c.get_contact_status(network, ext_user, ext_contact).ok())
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            lines.push(format!(
                "* Contact: '{ext_contact}', displayname: '{displayname}', status: '{status}'"
            ));
        }
        drop(account);
        drop(base);
        let text = if lines.is_empty() {
            "No contacts.".to_string()
        } else {
            lines.join("\n")
        };
        self.service.borrow_mut().send_message(&event.room_id, &event.sender, &text);
        true
    }
}
