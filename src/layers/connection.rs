//! Account lifecycle against the IM back-ends: logging accounts in at
//! startup, mirroring profile changes, and tracking the contact list.

use std::cell::RefCell;
use std::rc::Rc;

use crate::db::Db;
use crate::layers::base::{Account, BaseLayer};
use crate::matrix_client::MatrixClient;

pub struct ConnectionLayer {
    base: Rc<RefCell<BaseLayer>>,
    db: Rc<Db>,
}

impl ConnectionLayer {
    pub fn new(base: Rc<RefCell<BaseLayer>>, db: Rc<Db>) -> Self {
        ConnectionLayer { base, db }
    }

    /// Loads persisted accounts for enabled networks into `BaseLayer`.
    pub fn load_accounts(&mut self) {
        let accounts = match self.db.load_accounts() {
            Ok(accounts) => accounts,
            Err(e) => {
                tracing::error!(error = %e, "failed to load persisted accounts");
                return;
            }
        };
        let mut base = self.base.borrow_mut();
        for account in accounts {
            let enabled = base
                .networks
                .get(&account.network)
                .map(|n| n.enabled)
                .unwrap_or(false);
            if enabled {
                base.register_account(account);
            }
        }
    }

    /// Logs every known account in.
    pub fn start(&mut self) {
        let base = self.base.borrow();
        for account in base.accounts.values() {
            let account = account.borrow();
            if let Some(client) = base
                .networks
                .get(&account.network)
                .and_then(|n| base.clients.get(&n.client))
            {
                if let Err(e) = client.login(&account.network, &account.ext_user, &account.password) {
                    tracing::warn!(network = %account.network, ext_user = %account.ext_user, error = %e, "login failed");
                }
            }
        }
    }

    pub fn on_user_signed_on(&mut self, network: &str, ext_user: &str, account: &Rc<RefCell<Account>>) {
        let (use_auth_token, sync_profiles) = {
            let base = self.base.borrow();
            base.networks
                .get(network)
                .map(|n| (n.use_auth_token, n.sync_contacts_profiles_changes))
                .unwrap_or((false, false))
        };
        let client = {
            let base = self.base.borrow();
            base.networks
                .get(network)
                .and_then(|n| base.clients.get(&n.client))
                .cloned()
        };
        let Some(client) = client else { return };

        if use_auth_token {
            if let Ok(Some(token)) = client.get_auth_token(network, ext_user) {
                account.borrow_mut().auth_token = Some(token.clone());
                let _ = self.db.update_auth_token(network, ext_user, &token);
            }
        }

        // First-write-wins profile sync: only push a displayname/avatar the
        // home server doesn't already have, unless the network overrides
        // that conservatism.
        let user_mxid = account.borrow().user.clone();
        if let Ok(Some(displayname)) = client.get_account_displayname(network, ext_user) {
            let base = self.base.borrow();
            let has_name = base
                .matrix
                .get_user_profile(&user_mxid)
                .ok()
                .flatten()
                .and_then(|p| p.get("displayname").cloned())
                .is_some();
            if sync_profiles || !has_name {
                let _ = base.matrix.set_user_display_name(&user_mxid, &displayname);
            }
        }

        let contacts = client.get_contacts(network, ext_user).unwrap_or_default();
        for ext_contact in contacts {
            self.on_contact_updated(network, ext_user, account, &ext_contact);
        }
    }

    pub fn on_user_signed_off(&mut self, _network: &str, _ext_user: &str) {}

    pub fn on_new_auth_token(&mut self, network: &str, ext_user: &str, token: &str) {
        let _ = self.db.update_auth_token(network, ext_user, token);
    }

    /// Returns whether the backend should allow a reconnect attempt: always
    /// true here since the bridge itself doesn't classify connection errors
    /// as fatal (only registration failures are).
    pub fn on_connection_error(&mut self, _network: &str, _ext_user: &str, message: &str) -> bool {
        tracing::warn!(message, "connection error, will retry");
        true
    }

    pub fn on_contact_updated(
        &mut self,
        network: &str,
        ext_user: &str,
        account: &Rc<RefCell<Account>>,
        ext_contact: &str,
    ) {
        let already_known = account.borrow().contacts.contains(ext_contact);
        if already_known {
            return;
        }
        account.borrow_mut().contacts.insert(ext_contact.to_string());

        let Some(mxid_contact) = self.base.borrow_mut().ext_contact_to_mxid(network, ext_contact) else {
            return;
        };
        let matrix: Rc<dyn MatrixClient> = self.base.borrow().matrix.clone();
        if !matrix.has_user(&mxid_contact).unwrap_or(false) {
            let _ = matrix.register_user(&mxid_contact);
        }

        let client = {
            let base = self.base.borrow();
            base.networks
                .get(network)
                .and_then(|n| base.clients.get(&n.client))
                .cloned()
        };
        if let Some(client) = client {
            if let Ok(Some(displayname)) = client.get_contact_displayname(network, ext_user, ext_contact) {
                let _ = matrix.set_user_display_name(&mxid_contact, &displayname);
            }
        }
    }
}
