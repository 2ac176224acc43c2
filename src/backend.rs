//! Constructs every layer in dependency order and wires their callbacks
//! together, and exposes the handful of entry points the main loop, the
//! HTTP frontend, and the IM back-ends call into.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::config::Config;
use crate::db::Db;
use crate::im_client::{ClientEvent, ImClient};
use crate::layers::base::BaseLayer;
use crate::layers::connection::ConnectionLayer;
use crate::layers::info::InfoLayer;
use crate::layers::input::InputLayer;
use crate::layers::messages::MessagesLayer;
use crate::layers::presence::PresenceLayer;
use crate::layers::registration::RegistrationLayer;
use crate::layers::room_state::RoomStateLayer;
use crate::layers::service::ServiceLayer;
use crate::layers::typing::TypingLayer;
use crate::mainloop::MainLoopHandle;
use crate::matrix_client::MatrixClient;
use crate::models::Transaction;

pub struct Backend {
    pub base: Rc<RefCell<BaseLayer>>,
    pub connection: Rc<RefCell<ConnectionLayer>>,
    pub messages: Rc<RefCell<MessagesLayer>>,
    pub typing: Rc<RefCell<TypingLayer>>,
    pub service: Rc<RefCell<ServiceLayer>>,
    pub room_state: Rc<RefCell<RoomStateLayer>>,
    pub presence: Rc<RefCell<PresenceLayer>>,
    pub registration: Rc<RefCell<RegistrationLayer>>,
    pub input: Rc<RefCell<InputLayer>>,
    pub info: Rc<RefCell<InfoLayer>>,
    #[allow(dead_code)]
    handle: MainLoopHandle,
    exit: bool,
}

impl Backend {
    pub fn new(
        config: &Config,
        matrix: Rc<dyn MatrixClient>,
        clients: HashMap<String, Rc<dyn ImClient>>,
        db: Rc<Db>,
        handle: MainLoopHandle,
    ) -> Self {
        let base = Rc::new(RefCell::new(BaseLayer::new(config, matrix, clients)));
        let connection = Rc::new(RefCell::new(ConnectionLayer::new(base.clone(), db.clone())));
        let messages = Rc::new(RefCell::new(MessagesLayer::new(base.clone(), db.clone())));
        let typing = Rc::new(RefCell::new(TypingLayer::new(base.clone())));
        let service = Rc::new(RefCell::new(ServiceLayer::new(
            base.clone(),
            messages.clone(),
            &config.service_localpart,
            &config.service_display_name,
        )));
        let room_state = Rc::new(RefCell::new(RoomStateLayer::new(base.clone(), service.clone())));
        let presence = Rc::new(RefCell::new(PresenceLayer::new(base.clone(), service.clone())));
        let registration = Rc::new(RefCell::new(RegistrationLayer::new(
            base.clone(),
            service.clone(),
            connection.clone(),
            presence.clone(),
            room_state.clone(),
            db.clone(),
        )));
        let input = Rc::new(RefCell::new(InputLayer::new(service.clone())));
        let info = Rc::new(RefCell::new(InfoLayer::new(base.clone(), service.clone(), db.clone())));

        let backend = Backend {
            base,
            connection,
            messages,
            typing,
            service,
            room_state,
            presence,
            registration,
            input,
            info,
            handle,
            exit: false,
        };
        backend.wire_callbacks();
        backend
    }

    /// Registers every transaction and client-event subscriber each layer
    /// needs.
    fn wire_callbacks(&self) {
        {
            let service = self.service.clone();
            self.base
                .borrow_mut()
                .add_transaction_callback("m.room.message", Box::new(move |txn_id, event| {
                    service.borrow_mut().on_transaction_message(txn_id, event);
                }));
        }
        {
            let room_state = self.room_state.clone();
            self.base
                .borrow_mut()
                .add_transaction_callback("m.room.member", Box::new(move |txn_id, event| {
                    room_state.borrow_mut().on_transaction_membership(txn_id, event);
                }));
        }
        {
            let typing = self.typing.clone();
            self.base
                .borrow_mut()
                .add_transaction_callback("m.typing", Box::new(move |txn_id, event| {
                    typing.borrow_mut().on_transaction_typing(txn_id, event);
                }));
        }
        {
            let presence = self.presence.clone();
            self.base
                .borrow_mut()
                .add_transaction_callback("m.presence", Box::new(move |txn_id, event| {
                    presence.borrow_mut().on_transaction_presence(txn_id, event);
                }));
        }

        self.registration.borrow_mut().start();
        self.input.borrow_mut().start();
        self.info.borrow_mut().start();
        {
            let registration = self.registration.clone();
            self.service.borrow_mut().add_service_callback(
                "register",
                "register <network> <user> <password> - register an account on a network",
                Box::new(move |txn_id, event, args| {
                    registration.borrow_mut().on_service_register(txn_id, event, args)
                }),
            );
        }
        {
            let registration = self.registration.clone();
            self.service.borrow_mut().add_service_callback(
                "unregister",
                "unregister <network> <user> - remove a registered account",
                Box::new(move |txn_id, event, args| {
                    registration.borrow_mut().on_service_unregister(txn_id, event, args)
                }),
            );
        }
        {
            let info = self.info.clone();
            self.service.borrow_mut().add_service_callback(
                "accounts",
                "accounts - list registered accounts",
                Box::new(move |txn_id, event, args| info.borrow_mut().on_service_accounts(txn_id, event, args)),
            );
        }
        {
            let info = self.info.clone();
            self.service.borrow_mut().add_service_callback(
                "contacts",
                "contacts <network> <user> - list an account's contacts",
                Box::new(move |txn_id, event, args| info.borrow_mut().on_service_contacts(txn_id, event, args)),
            );
        }

        self.wire_client_callbacks();
    }

    fn wire_client_callbacks(&self) {
        let connection = self.connection.clone();
        let presence = self.presence.clone();
        let room_state = self.room_state.clone();
        let registration = self.registration.clone();
        self.base.borrow_mut().add_client_callback(
            "user-signed-on",
            true,
            Box::new(move |event, account| {
                let ClientEvent::UserSignedOn { network, ext_user } = event else {
                    return true;
                };
                let Some(account) = account else { return true };
                connection.borrow_mut().on_user_signed_on(network, ext_user, &account);
                presence.borrow_mut().on_user_signed_on(network, ext_user, &account);
                room_state.borrow_mut().on_user_signed_on(network, ext_user, &account);
                true
            }),
        );
        self.base.borrow_mut().add_client_callback(
            "user-signed-on-without-account",
            false,
            Box::new({
                let registration = registration.clone();
                move |event, _| {
                    if let ClientEvent::UserSignedOn { network, ext_user } = event {
                        registration.borrow_mut().on_user_signed_on_without_account(network, ext_user);
                    }
                    true
                }
            }),
        );

        let connection = self.connection.clone();
        let presence = self.presence.clone();
        self.base.borrow_mut().add_client_callback(
            "user-signed-off",
            true,
            Box::new(move |event, account| {
                let ClientEvent::UserSignedOff { network, ext_user } = event else {
                    return true;
                };
                connection.borrow_mut().on_user_signed_off(network, ext_user);
                if let Some(account) = account {
                    presence.borrow_mut().on_user_signed_off(network, ext_user, &account);
                }
                true
            }),
        );

        let connection = self.connection.clone();
        let presence = self.presence.clone();
        self.base.borrow_mut().add_client_callback(
            "connection-error",
            true,
            Box::new(move |event, account| {
                let ClientEvent::ConnectionError { network, ext_user, message } = event else {
                    return true;
                };
                if let Some(account) = account {
                    let keep = connection.borrow_mut().on_connection_error(network, ext_user, message);
                    presence.borrow_mut().on_connection_error(network, ext_user, &account);
                    keep
                } else {
                    true
                }
            }),
        );
        self.base.borrow_mut().add_client_callback(
            "connection-error-without-account",
            false,
            Box::new(move |event, _| {
                let ClientEvent::ConnectionError { network, ext_user, message } = event else {
                    return true;
                };
                registration
                    .borrow_mut()
                    .on_connection_error_without_account(network, ext_user, message)
            }),
        );

        let connection = self.connection.clone();
        self.base.borrow_mut().add_client_callback(
            "new-auth-token",
            true,
            Box::new(move |event, _| {
                if let ClientEvent::NewAuthToken { network, ext_user, token } = event {
                    connection.borrow_mut().on_new_auth_token(network, ext_user, token);
                }
                true
            }),
        );

        let connection = self.connection.clone();
        let room_state = self.room_state.clone();
        self.base.borrow_mut().add_client_callback(
            "contact-updated",
            true,
            Box::new(move |event, account| {
                let ClientEvent::ContactUpdated { network, ext_user, ext_contact } = event else {
                    return true;
                };
                if let Some(account) = account {
                    connection
                        .borrow_mut()
                        .on_contact_updated(network, ext_user, &account, ext_contact);
                }
                room_state.borrow_mut().on_contact_updated(network, ext_user, ext_contact);
                true
            }),
        );

        let presence = self.presence.clone();
        self.base.borrow_mut().add_client_callback(
            "contact-status-changed",
            true,
            Box::new(move |event, _| {
                if let ClientEvent::ContactStatusChanged { network, ext_user, ext_contact, status } = event {
                    presence.borrow_mut().on_contact_status_changed(network, ext_user, ext_contact, status.clone());
                }
                true
            }),
        );

        let messages = self.messages.clone();
        self.base.borrow_mut().add_client_callback(
            "new-message",
            true,
            Box::new(move |event, _| {
                if let ClientEvent::NewMessage { network, ext_user, ext_contact, conv_id, text, time } = event {
                    let _ = messages.borrow_mut().on_new_message(
                        network,
                        ext_user,
                        ext_contact,
                        conv_id.as_deref(),
                        text,
                        *time,
                    );
                }
                true
            }),
        );

        let messages = self.messages.clone();
        self.base.borrow_mut().add_client_callback(
            "new-image",
            true,
            Box::new(move |event, _| {
                if let ClientEvent::NewImage { network, ext_user, ext_contact, conv_id, data, filename, time } = event {
                    let _ = messages.borrow_mut().on_new_image(
                        network,
                        ext_user,
                        ext_contact,
                        conv_id.as_deref(),
                        data,
                        filename,
                        *time,
                    );
                }
                true
            }),
        );

        let messages = self.messages.clone();
        self.base.borrow_mut().add_client_callback(
            "new-file",
            true,
            Box::new(move |event, _| {
                if let ClientEvent::NewFile { network, ext_user, ext_contact, conv_id, data, filename, time } = event {
                    let _ = messages.borrow_mut().on_new_file(
                        network,
                        ext_user,
                        ext_contact,
                        conv_id.as_deref(),
                        data,
                        filename,
                        *time,
                    );
                }
                true
            }),
        );

        let typing = self.typing.clone();
        self.base.borrow_mut().add_client_callback(
            "contact-typing",
            true,
            Box::new(move |event, _| {
                if let ClientEvent::ContactTyping { network, ext_user, ext_contact } = event {
                    typing.borrow_mut().on_contact_typing(network, ext_user, ext_contact);
                }
                true
            }),
        );

        let presence = self.presence.clone();
        self.base.borrow_mut().add_client_callback(
            "presence-refresh",
            false,
            Box::new(move |_event, _| presence.borrow_mut().on_presence_refresh()),
        );
    }

    /// Starts every layer in wiring order.
    pub fn start(&mut self) {
        self.connection.borrow_mut().load_accounts();
        self.service.borrow_mut().start();
        self.connection.borrow_mut().start();
        self.room_state.borrow_mut().start();
        self.presence.borrow_mut().start();
    }

    pub fn process_transaction(&mut self, txn_id: &str, transaction: Transaction) {
        self.base.borrow_mut().process_transaction(txn_id, &transaction.events);
    }

    pub fn has_contact(&self, network: &str, ext_user: &str, ext_contact: &str) -> bool {
        self.base.borrow().has_contact(network, ext_user, ext_contact)
    }

    pub fn dispatch_client_event(&mut self, event: ClientEvent) {
        self.base.borrow_mut().dispatch_client_event(event);
    }

    pub fn on_retry_tick(&mut self) {
        self.messages.borrow_mut().on_attempt_delivery_to_matrix();
        self.messages.borrow_mut().on_attempt_delivery_to_clients();
    }

    pub fn on_presence_refresh_tick(&mut self) {
        self.dispatch_client_event(ClientEvent::PresenceRefreshTick);
    }

    pub fn request_stop(&mut self) {
        self.exit = true;
    }

    pub fn should_exit(&self) -> bool {
        self.exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::im_client::mock::MockImClient;
    use crate::mainloop::MainLoop;
    use crate::matrix_client::fake::FakeMatrixClient;

    fn test_config() -> Config {
        let yaml = r#"
hs_server: "https://example.org"
hs_host: "example.org"
hs_access_token: "tok"
service_localpart: "pumaduct"
service_display_name: "PuMaDuct"
http_frontend:
  hs_as_token: "hstok"
networks:
  jabber:
    client: purple
    prefix: jabber
    ext_pattern: "^((?P<user>[^@]+)@)?(?P<host>[^/@]+)(/(?P<resource>.*))?$"
    ext_format: "{user}@{host}"
"#;
        Config::from_yaml(yaml).unwrap()
    }

    #[test]
    fn registration_flow_creates_account_on_sign_on() {
        let main_loop = MainLoop::new();
        let handle = main_loop.handle();
        let config = test_config();
        let db = Rc::new(Db::in_memory().unwrap());
        let matrix: Rc<dyn MatrixClient> = Rc::new(FakeMatrixClient::default());
        let mut clients: HashMap<String, Rc<dyn ImClient>> = HashMap::new();
        clients.insert("purple".to_string(), Rc::new(MockImClient::default()));

        let mut backend = Backend::new(&config, matrix, clients, db, handle);
        backend.start();

        let room_id = backend.service.borrow_mut().ensure_room("@alice:example.org");
        let event = RoomEvent {
            event_id: "$1".to_string(),
            event_type: "m.room.message".to_string(),
            room_id,
            sender: "@alice:example.org".to_string(),
            state_key: None,
            content: serde_json::json!({"body": "register jabber alice@jabber.example hunter2"}),
            origin_server_ts: 0,
        };
        backend
            .service
            .borrow_mut()
            .on_transaction_message("txn1", &event);

        assert!(backend.base.borrow().find_account("jabber", "alice@jabber.example").is_none());

        backend.dispatch_client_event(ClientEvent::UserSignedOn {
            network: "jabber".to_string(),
            ext_user: "alice@jabber.example".to_string(),
        });

        assert!(backend.has_contact("jabber", "alice@jabber.example", "nonexistent") == false);
        assert!(backend.base.borrow().find_account("jabber", "alice@jabber.example").is_some());
    }
}
