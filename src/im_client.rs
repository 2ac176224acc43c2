//! The IM back-end contract: every pluggable network integration implements
//! `ImClient`. One instance is registered per `client` key named in the
//! configuration's `networks` map and may be shared by several networks.

use chrono::{DateTime, Utc};

use crate::error::BridgeResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactStatus {
    Available,
    Away,
    Offline,
}

impl ContactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactStatus::Available => "available",
            ContactStatus::Away => "away",
            ContactStatus::Offline => "offline",
        }
    }
}

/// The subset of back-end operations the layers invoke directly (as opposed
/// to the asynchronous callbacks a back-end fires into the bridge, modeled
/// by `ClientEvent` below).
pub trait ImClient {
    fn login(&self, network: &str, ext_user: &str, password: &str) -> BridgeResult<()>;
    fn logout(&self, network: &str, ext_user: &str) -> BridgeResult<()>;
    fn get_auth_token(&self, network: &str, ext_user: &str) -> BridgeResult<Option<String>>;

    fn create_conversation(&self, network: &str, ext_user: &str, ext_contact: &str) -> BridgeResult<String>;

    fn send_message(
        &self,
        network: &str,
        ext_user: &str,
        conv_id: &str,
        text: &str,
    ) -> BridgeResult<()>;
    fn send_image(
        &self,
        network: &str,
        ext_user: &str,
        conv_id: &str,
        data: &[u8],
        filename: &str,
    ) -> BridgeResult<()>;
    fn send_file(
        &self,
        network: &str,
        ext_user: &str,
        conv_id: &str,
        data: &[u8],
        filename: &str,
    ) -> BridgeResult<()>;

    fn set_typing(&self, network: &str, ext_user: &str, conv_id: &str) -> BridgeResult<()>;

    fn get_contacts(&self, network: &str, ext_user: &str) -> BridgeResult<Vec<String>>;
    fn get_contact_status(
        &self,
        network: &str,
        ext_user: &str,
        ext_contact: &str,
    ) -> BridgeResult<ContactStatus>;
    fn get_contact_displayname(
        &self,
        network: &str,
        ext_user: &str,
        ext_contact: &str,
    ) -> BridgeResult<Option<String>>;
    fn get_contact_icon(
        &self,
        network: &str,
        ext_user: &str,
        ext_contact: &str,
    ) -> BridgeResult<Option<Vec<u8>>>;

    fn set_account_status(&self, network: &str, ext_user: &str, status: ContactStatus) -> BridgeResult<()>;
    fn get_account_displayname(&self, network: &str, ext_user: &str) -> BridgeResult<Option<String>>;
    fn set_account_displayname(&self, network: &str, ext_user: &str, name: &str) -> BridgeResult<()>;
    fn get_account_icon(&self, network: &str, ext_user: &str) -> BridgeResult<Option<Vec<u8>>>;
    fn set_account_icon(&self, network: &str, ext_user: &str, data: &[u8]) -> BridgeResult<()>;

    fn provide_input(&self, network: &str, ext_user: &str, text: &str) -> BridgeResult<()>;
}

/// Events an `ImClient` fires asynchronously, posted through a
/// `MainLoopHandle` so they execute serialized with everything else.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    UserSignedOn {
        network: String,
        ext_user: String,
    },
    UserSignedOff {
        network: String,
        ext_user: String,
    },
    ConnectionError {
        network: String,
        ext_user: String,
        message: String,
    },
    NewAuthToken {
        network: String,
        ext_user: String,
        token: String,
    },
    ContactUpdated {
        network: String,
        ext_user: String,
        ext_contact: String,
    },
    ContactStatusChanged {
        network: String,
        ext_user: String,
        ext_contact: String,
        status: ContactStatus,
    },
    NewMessage {
        network: String,
        ext_user: String,
        ext_contact: String,
        conv_id: Option<String>,
        text: String,
        time: DateTime<Utc>,
    },
    NewImage {
        network: String,
        ext_user: String,
        ext_contact: String,
        conv_id: Option<String>,
        data: Vec<u8>,
        filename: String,
        time: DateTime<Utc>,
    },
    NewFile {
        network: String,
        ext_user: String,
        ext_contact: String,
        conv_id: Option<String>,
        data: Vec<u8>,
        filename: String,
        time: DateTime<Utc>,
    },
    ConversationDestroyed {
        network: String,
        ext_user: String,
        conv_id: String,
    },
    ContactTyping {
        network: String,
        ext_user: String,
        ext_contact: String,
    },
    /// Fired on a timer by the bridge itself, not by a back-end; reuses the
    /// client-callback dispatch path since every network needs the same tick.
    PresenceRefreshTick,
}

impl ClientEvent {
    /// Callback vocabulary key used to look up subscribers.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::UserSignedOn { .. } => "user-signed-on",
            ClientEvent::UserSignedOff { .. } => "user-signed-off",
            ClientEvent::ConnectionError { .. } => "connection-error",
            ClientEvent::NewAuthToken { .. } => "new-auth-token",
            ClientEvent::ContactUpdated { .. } => "contact-updated",
            ClientEvent::ContactStatusChanged { .. } => "contact-status-changed",
            ClientEvent::NewMessage { .. } => "new-message",
            ClientEvent::NewImage { .. } => "new-image",
            ClientEvent::NewFile { .. } => "new-file",
            ClientEvent::ConversationDestroyed { .. } => "conversation-destroyed",
            ClientEvent::ContactTyping { .. } => "contact-typing",
            ClientEvent::PresenceRefreshTick => "presence-refresh",
        }
    }

    pub fn network_ext_user(&self) -> Option<(&str, &str)> {
        match self {
            ClientEvent::UserSignedOn { network, ext_user }
            | ClientEvent::UserSignedOff { network, ext_user }
            | ClientEvent::ConnectionError { network, ext_user, .. }
            | ClientEvent::NewAuthToken { network, ext_user, .. }
            | ClientEvent::ContactUpdated { network, ext_user, .. }
            | ClientEvent::ContactStatusChanged { network, ext_user, .. }
            | ClientEvent::NewMessage { network, ext_user, .. }
            | ClientEvent::NewImage { network, ext_user, .. }
            | ClientEvent::NewFile { network, ext_user, .. }
            | ClientEvent::ConversationDestroyed { network, ext_user, .. }
            | ClientEvent::ContactTyping { network, ext_user, .. } => Some((network, ext_user)),
            ClientEvent::PresenceRefreshTick => None,
        }
    }
}

/// Stands in for a network's back-end when no concrete protocol plugin is
/// compiled in for its `client` key. Concrete back-ends (XMPP, IRC, ...) are
/// out of scope for this crate — they are separate implementations of
/// `ImClient` wired in by whoever assembles a deployment — so an
/// unconfigured network simply fails every call with `ClientFailure` rather
/// than the process refusing to start.
#[derive(Default)]
pub struct UnconfiguredClient {
    client_key: String,
}

impl UnconfiguredClient {
    pub fn new(client_key: impl Into<String>) -> Self {
        UnconfiguredClient { client_key: client_key.into() }
    }

    fn err<T>(&self) -> BridgeResult<T> {
        Err(crate::error::BridgeError::client_failure(format!(
            "no back-end compiled in for client '{}'",
            self.client_key
        )))
    }
}

impl ImClient for UnconfiguredClient {
    fn login(&self, _network: &str, _ext_user: &str, _password: &str) -> BridgeResult<()> {
        self.err()
    }
    fn logout(&self, _network: &str, _ext_user: &str) -> BridgeResult<()> {
        self.err()
    }
    fn get_auth_token(&self, _network: &str, _ext_user: &str) -> BridgeResult<Option<String>> {
        self.err()
    }
    fn create_conversation(&self, _network: &str, _ext_user: &str, _ext_contact: &str) -> BridgeResult<String> {
        self.err()
    }
    fn send_message(&self, _network: &str, _ext_user: &str, _conv_id: &str, _text: &str) -> BridgeResult<()> {
        self.err()
    }
    fn send_image(
        &self,
        _network: &str,
        _ext_user: &str,
        _conv_id: &str,
        _data: &[u8],
        _filename: &str,
    ) -> BridgeResult<()> {
        self.err()
    }
    fn send_file(
        &self,
        _network: &str,
        _ext_user: &str,
        _conv_id: &str,
        _data: &[u8],
        _filename: &str,
    ) -> BridgeResult<()> {
        self.err()
    }
    fn set_typing(&self, _network: &str, _ext_user: &str, _conv_id: &str) -> BridgeResult<()> {
        self.err()
    }
    fn get_contacts(&self, _network: &str, _ext_user: &str) -> BridgeResult<Vec<String>> {
        self.err()
    }
    fn get_contact_status(&self, _network: &str, _ext_user: &str, _ext_contact: &str) -> BridgeResult<ContactStatus> {
        self.err()
    }
    fn get_contact_displayname(
        &self,
        _network: &str,
        _ext_user: &str,
        _ext_contact: &str,
    ) -> BridgeResult<Option<String>> {
        self.err()
    }
    fn get_contact_icon(&self, _network: &str, _ext_user: &str, _ext_contact: &str) -> BridgeResult<Option<Vec<u8>>> {
        self.err()
    }
    fn set_account_status(&self, _network: &str, _ext_user: &str, _status: ContactStatus) -> BridgeResult<()> {
        self.err()
    }
    fn get_account_displayname(&self, _network: &str, _ext_user: &str) -> BridgeResult<Option<String>> {
        self.err()
    }
    fn set_account_displayname(&self, _network: &str, _ext_user: &str, _name: &str) -> BridgeResult<()> {
        self.err()
    }
    fn get_account_icon(&self, _network: &str, _ext_user: &str) -> BridgeResult<Option<Vec<u8>>> {
        self.err()
    }
    fn set_account_icon(&self, _network: &str, _ext_user: &str, _data: &[u8]) -> BridgeResult<()> {
        self.err()
    }
    fn provide_input(&self, _network: &str, _ext_user: &str, _text: &str) -> BridgeResult<()> {
        self.err()
    }
}

/// An in-memory `ImClient` test double, usable from unit tests and from
/// integration tests alike.
pub mod mock {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// A test double standing in for a real back-end, recording every call
    /// so tests can assert on what the layers asked of it.
    #[derive(Default)]
    pub struct MockImClient {
        pub sent_messages: RefCell<Vec<(String, String)>>,
        pub contacts: RefCell<HashMap<String, Vec<String>>>,
        pub logged_in: RefCell<Vec<(String, String)>>,
        pub conversations_created: RefCell<Vec<(String, String, String)>>,
        pub typing_calls: RefCell<Vec<(String, String, String)>>,
    }

    impl ImClient for MockImClient {
        fn login(&self, network: &str, ext_user: &str, _password: &str) -> BridgeResult<()> {
            self.logged_in
                .borrow_mut()
                .push((network.to_string(), ext_user.to_string()));
            Ok(())
        }
        fn logout(&self, _network: &str, _ext_user: &str) -> BridgeResult<()> {
            Ok(())
        }
        fn get_auth_token(&self, _network: &str, _ext_user: &str) -> BridgeResult<Option<String>> {
            Ok(None)
        }
        fn create_conversation(
            &self,
            network: &str,
            ext_user: &str,
            ext_contact: &str,
        ) -> BridgeResult<String> {
            self.conversations_created.borrow_mut().push((
                network.to_string(),
                ext_user.to_string(),
                ext_contact.to_string(),
            ));
            Ok(format!("conv-{ext_contact}"))
        }
        fn send_message(
            &self,
            _network: &str,
            _ext_user: &str,
            conv_id: &str,
            text: &str,
        ) -> BridgeResult<()> {
            self.sent_messages
                .borrow_mut()
                .push((conv_id.to_string(), text.to_string()));
            Ok(())
        }
        fn send_image(
            &self,
            _network: &str,
            _ext_user: &str,
            _conv_id: &str,
            _data: &[u8],
            _filename: &str,
        ) -> BridgeResult<()> {
            Ok(())
        }
        fn send_file(
            &self,
            _network: &str,
            _ext_user: &str,
            _conv_id: &str,
            _data: &[u8],
            _filename: &str,
        ) -> BridgeResult<()> {
            Ok(())
        }
        fn set_typing(&self, network: &str, ext_user: &str, conv_id: &str) -> BridgeResult<()> {
            self.typing_calls.borrow_mut().push((
                network.to_string(),
                ext_user.to_string(),
                conv_id.to_string(),
            ));
            Ok(())
        }
        fn get_contacts(&self, _network: &str, ext_user: &str) -> BridgeResult<Vec<String>> {
            Ok(self
                .contacts
                .borrow()
                .get(ext_user)
                .cloned()
                .unwrap_or_default())
        }
        fn get_contact_status(
            &self,
            _network: &str,
            _ext_user: &str,
            _ext_contact: &str,
        ) -> BridgeResult<ContactStatus> {
            Ok(ContactStatus::Available)
        }
        fn get_contact_displayname(
            &self,
            _network: &str,
            _ext_user: &str,
            ext_contact: &str,
        ) -> BridgeResult<Option<String>> {
            Ok(Some(ext_contact.to_string()))
        }
        fn get_contact_icon(
            &self,
            _network: &str,
            _ext_user: &str,
            _ext_contact: &str,
        ) -> BridgeResult<Option<Vec<u8>>> {
            Ok(None)
        }
        fn set_account_status(
            &self,
            _network: &str,
            _ext_user: &str,
            _status: ContactStatus,
        ) -> BridgeResult<()> {
            Ok(())
        }
        fn get_account_displayname(
            &self,
            _network: &str,
            _ext_user: &str,
        ) -> BridgeResult<Option<String>> {
            Ok(None)
        }
        fn set_account_displayname(
            &self,
            _network: &str,
            _ext_user: &str,
            _name: &str,
        ) -> BridgeResult<()> {
            Ok(())
        }
        fn get_account_icon(&self, _network: &str, _ext_user: &str) -> BridgeResult<Option<Vec<u8>>> {
            Ok(None)
        }
        fn set_account_icon(&self, _network: &str, _ext_user: &str, _data: &[u8]) -> BridgeResult<()> {
            Ok(())
        }
        fn provide_input(&self, _network: &str, _ext_user: &str, _text: &str) -> BridgeResult<()> {
            Ok(())
        }
    }
}
