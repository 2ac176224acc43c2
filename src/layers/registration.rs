//! Service commands that create and remove IM-network accounts, and the
//! login-callback routing that depends on whether an account exists yet.

use std::cell::RefCell;
use std::rc::Rc;

use once_cell::sync::Lazy;

use crate::db::Db;
use crate::layers::base::{Account, BaseLayer};
use crate::layers::connection::ConnectionLayer;
use crate::layers::presence::PresenceLayer;
use crate::layers::room_state::RoomStateLayer;
use crate::layers::service::ServiceLayer;
use crate::models::RoomEvent;

/// Substrings of a login failure message that mean "retrying will never
/// succeed" rather than "the network hiccuped" — these abandon the pending
/// registration instead of leaving it to retry forever.
static FATAL_REGISTRATION_ERRORS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "invalid username",
        "authentication failed",
        "authentication impossible",
        "name in use",
        "invalid settings",
    ]
});

struct Registration {
    network: String,
    ext_user: String,
    password: String,
    room_id: String,
    user: String,
}

pub struct RegistrationLayer {
    base: Rc<RefCell<BaseLayer>>,
    service: Rc<RefCell<ServiceLayer>>,
    connection: Rc<RefCell<ConnectionLayer>>,
    presence: Rc<RefCell<PresenceLayer>>,
    room_state: Rc<RefCell<RoomStateLayer>>,
    db: Rc<Db>,
    pending: std::collections::HashMap<(String, String), Registration>,
}

impl RegistrationLayer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        base: Rc<RefCell<BaseLayer>>,
        service: Rc<RefCell<ServiceLayer>>,
        connection: Rc<RefCell<ConnectionLayer>>,
        presence: Rc<RefCell<PresenceLayer>>,
        room_state: Rc<RefCell<RoomStateLayer>>,
        db: Rc<Db>,
    ) -> Self {
        RegistrationLayer {
            base,
            service,
            connection,
            presence,
            room_state,
            db,
            pending: std::collections::HashMap::new(),
        }
    }

    /// No-op: the "register"/"unregister" service callbacks are registered
    /// by the backend wiring once this layer already lives behind an `Rc`,
    /// since the closures need to capture a handle back to `self`.
    pub fn start(&mut self) {}

    pub fn on_service_register(&mut self, _txn_id: &str, event: &RoomEvent, args: &[String]) -> bool {
        if args.len() != 4 {
            self.service
                .borrow_mut()
                .send_message(&event.room_id, &event.sender, "Usage: register <network> <user> <password>");
            return true;
        }
        let network = args[1].clone();
        let ext_user = args[2].clone();
        let password = args[3].clone();

        let (configured, enabled, already) = {
            let base = self.base.borrow();
            let net_conf = base.networks.get(&network);
            (
                net_conf.is_some(),
                net_conf.map(|n| n.enabled).unwrap_or(false),
                base.find_account(&network, &ext_user).is_some(),
            )
        };
        if !configured {
            self.service.borrow_mut().send_message(
                &event.room_id,
                &event.sender,
                &format!("Unknown network: '{network}'"),
            );
            return true;
        }
        if !enabled {
            self.service.borrow_mut().send_message(
                &event.room_id,
                &event.sender,
                &format!("Network '{network}' is disabled"),
            );
            return true;
        }
        if already {
            self.service.borrow_mut().send_message(
                &event.room_id,
                &event.sender,
                &format!("Already registered on '{network}' as '{ext_user}'"),
            );
            return true;
        }

        self.pending.insert(
            (network.clone(), ext_user.clone()),
            Registration {
                network: network.clone(),
                ext_user: ext_user.clone(),
                password: password.clone(),
                room_id: event.room_id.clone(),
                user: event.sender.clone(),
            },
        );

        let client = {
            let base = self.base.borrow();
            base.networks
                .get(&network)
                .and_then(|n| base.clients.get(&n.client))
                .cloned()
        };
        match client {
            Some(client) => {
                if let Err(e) = client.login(&network, &ext_user, &password) {
                    self.service.borrow_mut().send_message(
                        &event.room_id,
                        &event.sender,
                        &format!("Login failed: {e}"),
                    );
                    self.pending.remove(&(network, ext_user));
                }
            }
            None => {
                self.service.borrow_mut().send_message(
                    &event.room_id,
                    &event.sender,
                    &format!("No client configured for network '{network}'"),
                );
                self.pending.remove(&(network, ext_user));
            }
        }
        true
    }

    pub fn on_service_unregister(&mut self, _txn_id: &str, event: &RoomEvent, args: &[String]) -> bool {
        if args.len() != 3 {
            self.service
                .borrow_mut()
                .send_message(&event.room_id, &event.sender, "Usage: unregister <network> <user>");
            return true;
        }
        let network = &args[1];
        let ext_user = &args[2];
        let _ = self.db.delete_account(network, ext_user);
        self.base.borrow_mut().remove_account(network, ext_user);
        self.pending.remove(&(network.clone(), ext_user.clone()));
        self.service.borrow_mut().send_message(
            &event.room_id,
            &event.sender,
            &format!("Unregistered '{ext_user}' on '{network}'"),
        );
        true
    }

    /// An account doesn't exist yet for this (network, ext_user) pair: this
    /// must be the first sign-on after a `register` command. Creates and
    /// persists the account, then re-runs the normal sign-on handling now
    /// that one exists.
    pub fn on_user_signed_on_without_account(&mut self, network: &str, ext_user: &str) {
        let Some(pending) = self.pending.remove(&(network.to_string(), ext_user.to_string())) else {
            tracing::warn!(network, ext_user, "signed on without a pending registration");
            return;
        };
        let account = Account {
            user: pending.user.clone(),
            network: network.to_string(),
            ext_user: ext_user.to_string(),
            password: pending.password.clone(),
            auth_token: None,
            contacts: Default::default(),
        };
        if let Err(e) = self.db.insert_account(&account) {
            tracing::error!(error = %e, "failed to persist new account");
            return;
        }
        let account = self.base.borrow_mut().register_account(account);
        self.service.borrow_mut().send_message(
            &pending.room_id,
            &pending.user,
            &format!("Registered '{ext_user}' on '{network}'"),
        );

        self.connection.borrow_mut().on_user_signed_on(network, ext_user, &account);
        self.presence.borrow_mut().on_user_signed_on(network, ext_user, &account);
        self.room_state.borrow_mut().on_user_signed_on(network, ext_user, &account);
    }

    pub fn on_connection_error_without_account(&mut self, network: &str, ext_user: &str, message: &str) -> bool {
        let fatal = FATAL_REGISTRATION_ERRORS
            .iter()
            .any(|needle| message.to_lowercase().contains(needle));
        if !fatal {
            return true;
        }
        if let Some(pending) = self.pending.remove(&(network.to_string(), ext_user.to_string())) {
            self.service.borrow_mut().send_message(
                &pending.room_id,
                &pending.user,
                &format!("Registration failed: {message}"),
            );
        }
        false
    }
}
