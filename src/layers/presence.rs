//! Mirrors presence between the home server and the external networks: the
//! service user's own presence, and each contact's status.

use std::cell::RefCell;
use std::rc::Rc;

use crate::im_client::ContactStatus;
use crate::layers::base::{Account, BaseLayer};
use crate::layers::service::ServiceLayer;
use crate::models::RoomEvent;

pub struct PresenceLayer {
    base: Rc<RefCell<BaseLayer>>,
    service: Rc<RefCell<ServiceLayer>>,
}

impl PresenceLayer {
    pub fn new(base: Rc<RefCell<BaseLayer>>, service: Rc<RefCell<ServiceLayer>>) -> Self {
        PresenceLayer { base, service }
    }

    pub fn start(&mut self) {
        let service_user = self.service.borrow().user.clone();
        let base = self.base.borrow();
        let list = base.matrix.get_presence_list(&service_user).unwrap_or_default();
        let missing: Vec<String> = base
            .accounts
            .values()
            .map(|a| a.borrow().user.clone())
            .filter(|u| !list.contains(u))
            .collect();
        if !missing.is_empty() {
            let _ = base.matrix.add_to_presence_list(&service_user, &missing);
        }
        let _ = base.matrix.set_user_presence(&service_user, "online");
    }

    pub fn on_user_signed_on(&mut self, network: &str, ext_user: &str, account: &Rc<RefCell<Account>>) {
        let user_mxid = account.borrow().user.clone();
        let service_user = self.service.borrow().user.clone();
        {
            let base = self.base.borrow();
            let list = base.matrix.get_presence_list(&service_user).unwrap_or_default();
            if !list.contains(&user_mxid) {
                let _ = base.matrix.add_to_presence_list(&service_user, &[user_mxid.clone()]);
            }
        }
        let client = {
            let base = self.base.borrow();
            base.networks
                .get(network)
                .and_then(|n| base.clients.get(&n.client))
                .cloned()
        };
        let contacts = account.borrow().contacts.clone();
        if let Some(client) = client {
            for ext_contact in contacts {
                if let Ok(status) = client.get_contact_status(network, ext_user, &ext_contact) {
                    self.on_contact_status_changed(network, ext_user, &ext_contact, status);
                }
            }
        }
    }

    pub fn on_user_signed_off(&mut self, network: &str, ext_user: &str, account: &Rc<RefCell<Account>>) {
        self.set_contacts_offline(network, ext_user, account);
    }

    pub fn on_connection_error(&mut self, network: &str, ext_user: &str, account: &Rc<RefCell<Account>>) {
        self.set_contacts_offline(network, ext_user, account);
    }

    fn set_contacts_offline(&mut self, network: &str, ext_user: &str, account: &Rc<RefCell<Account>>) {
        let contacts = account.borrow().contacts.clone();
        for ext_contact in contacts {
            self.on_contact_status_changed(network, ext_user, &ext_contact, ContactStatus::Offline);
        }
    }

    pub fn on_contact_status_changed(
        &mut self,
        network: &str,
        _ext_user: &str,
        ext_contact: &str,
        status: ContactStatus,
    ) {
        let Some(mxid_contact) = self.base.borrow_mut().ext_contact_to_mxid(network, ext_contact) else {
            return;
        };
        let presence = match status {
            ContactStatus::Available => "online",
            ContactStatus::Away => "unavailable",
            ContactStatus::Offline => "offline",
        };
        let _ = self.base.borrow().matrix.set_user_presence(&mxid_contact, presence);
    }

    /// Periodic full refresh of every account's contact statuses. Returns
    /// whether the timer should keep firing — always true, since presence
    /// refresh runs for the lifetime of the process.
    pub fn on_presence_refresh(&mut self) -> bool {
        let accounts: Vec<_> = self.base.borrow().accounts.values().cloned().collect();
        for account in accounts {
            let (network, ext_user) = {
                let a = account.borrow();
                (a.network.clone(), a.ext_user.clone())
            };
            self.on_user_signed_on(&network, &ext_user, &account);
        }
        true
    }

    pub fn on_transaction_presence(&mut self, _txn_id: &str, _event: &RoomEvent) {
        // Matrix-originated presence changes for bridge-managed users are
        // ignored: the bridge is the source of truth for those, not the
        // home server.
    }
}
