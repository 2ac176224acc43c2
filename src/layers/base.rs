//! Identity translation, room bookkeeping, ACL, and the two callback
//! registries every other layer hangs off of.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::cell::RefCell;

use lru::LruCache;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::Config;
use crate::im_client::{ClientEvent, ImClient};
use crate::matrix_client::MatrixClient;
use crate::models::RoomEvent;

pub const ADMIN_POWER_LEVEL: i64 = 100;

/// Characters that cannot appear verbatim in an mxid local part and their
/// stand-ins when embedding an external contact string into one.
pub const USER_CHARS_REMAP: &[(char, char)] = &[(':', '#')];

static RE_CONTACT_MXID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^@(?P<prefix>[^-%:]+)(-(?P<user>[^%:]+))?(%(?P<host>[^:]+))?:(?P<hs_host>.+)$")
        .expect("static mxid regex is valid")
});

/// Matches a `{field}` placeholder inside a network's `ext_format` template.
static RE_TEMPLATE_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{(\w+)\}").expect("static template regex is valid"));

fn render_template(template: &str, fields: &HashMap<&str, String>) -> String {
    RE_TEMPLATE_FIELD
        .replace_all(template, |caps: &regex::Captures| {
            fields.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned()
}

fn remap_chars(s: &str, forward: bool) -> String {
    let mut out = s.to_string();
    for (from, to) in USER_CHARS_REMAP {
        out = if forward {
            out.replace(*from, &to.to_string())
        } else {
            out.replace(*to, &from.to_string())
        };
    }
    out
}

fn default_cache_size() -> std::num::NonZeroUsize {
    std::num::NonZeroUsize::new(4096).unwrap()
}

/// A registered IM account: one (network, external user) pair logged in
/// under a given home server user.
#[derive(Debug, Clone)]
pub struct Account {
    pub user: String,
    pub network: String,
    pub ext_user: String,
    pub password: String,
    pub auth_token: Option<String>,
    /// External contacts this account has already been told about, to avoid
    /// re-registering the same contact's room/state machinery twice.
    pub contacts: HashSet<String>,
}

/// A Matrix room the bridge knows the membership and (if any) external
/// conversation binding of.
#[derive(Debug, Clone, Default)]
pub struct Room {
    pub members: HashSet<String>,
    pub network: Option<String>,
    pub ext_user: Option<String>,
    pub conv_id: Option<String>,
}

pub type TransactionCallback = Box<dyn FnMut(&str, &RoomEvent) + 'static>;

pub struct ClientCallbackEntry {
    pub map_account: bool,
    pub callback: Box<dyn FnMut(&ClientEvent, Option<Rc<RefCell<Account>>>) -> bool>,
}

pub struct BaseLayer {
    pub hs_server: String,
    pub hs_host: String,
    pub matrix: Rc<dyn MatrixClient>,
    pub clients: HashMap<String, Rc<dyn ImClient>>,
    pub networks: HashMap<String, crate::config::NetworkConfig>,
    users_blacklist: Vec<String>,
    users_whitelist: Vec<String>,

    pub rooms: HashMap<String, Room>,
    pub accounts: HashMap<(String, String), Rc<RefCell<Account>>>,

    ext_to_mxid: LruCache<String, String>,
    mxid_to_ext: LruCache<String, String>,
    senders_access: LruCache<String, bool>,

    transaction_callbacks: HashMap<String, Vec<TransactionCallback>>,
    client_callbacks: HashMap<String, Vec<ClientCallbackEntry>>,
}

impl BaseLayer {
    pub fn new(config: &Config, matrix: Rc<dyn MatrixClient>, clients: HashMap<String, Rc<dyn ImClient>>) -> Self {
        BaseLayer {
            hs_server: config.hs_server.clone(),
            hs_host: config.hs_host.clone(),
            matrix,
            clients,
            networks: config.networks.clone(),
            users_blacklist: config.users_blacklist.clone(),
            users_whitelist: config.users_whitelist.clone(),
            rooms: HashMap::new(),
            accounts: HashMap::new(),
            ext_to_mxid: LruCache::new(default_cache_size()),
            mxid_to_ext: LruCache::new(default_cache_size()),
            senders_access: LruCache::new(default_cache_size()),
            transaction_callbacks: HashMap::new(),
            client_callbacks: HashMap::new(),
        }
    }

    // --- callback registration ---

    pub fn add_transaction_callback(&mut self, event_type: &str, callback: TransactionCallback) {
        self.transaction_callbacks
            .entry(event_type.to_string())
            .or_default()
            .push(callback);
    }

    pub fn add_client_callback(
        &mut self,
        event_kind: &str,
        map_account: bool,
        callback: Box<dyn FnMut(&ClientEvent, Option<Rc<RefCell<Account>>>) -> bool>,
    ) {
        self.client_callbacks
            .entry(event_kind.to_string())
            .or_default()
            .push(ClientCallbackEntry {
                map_account,
                callback,
            });
    }

    /// Processes one Application Service transaction. Always "handled" from
    /// the home server's point of view: per-event errors are logged and
    /// swallowed rather than failing the whole transaction.
    pub fn process_transaction(&mut self, txn_id: &str, events: &[RoomEvent]) {
        for event in events {
            if crate::models::IGNORED_EVENTS.contains(&event.event_type.as_str()) {
                continue;
            }
            if !self.is_sender_allowed(&event.sender) {
                tracing::warn!(sender = %event.sender, "sender rejected by access control");
                continue;
            }
            if let Some(callbacks) = self.transaction_callbacks.get_mut(&event.event_type) {
                for callback in callbacks.iter_mut() {
                    callback(txn_id, event);
                }
            }
        }
    }

    /// Dispatches one back-end callback event, resolving the account (and
    /// rewriting to a `-without-account` subscriber set when none is
    /// found). Returns each invoked callback's result for call sites that
    /// need it (reconnect / re-arm decisions).
    pub fn dispatch_client_event(&mut self, event: ClientEvent) -> Vec<bool> {
        let kind = event.kind();
        let (account, kind_key) = match event.network_ext_user() {
            Some((network, ext_user)) => match self.find_account(network, ext_user) {
                Some(account) => (Some(account), kind.to_string()),
                None => {
                    let without = format!("{kind}-without-account");
                    if self.client_callbacks.contains_key(&without) {
                        (None, without)
                    } else {
                        (None, kind.to_string())
                    }
                }
            },
            None => (None, kind.to_string()),
        };

        let Some(entries) = self.client_callbacks.get_mut(&kind_key) else {
            return Vec::new();
        };
        entries
            .iter_mut()
            .map(|entry| (entry.callback)(&event, account.clone()))
            .collect()
    }

    pub fn find_account(&self, network: &str, ext_user: &str) -> Option<Rc<RefCell<Account>>> {
        self.accounts
            .get(&(network.to_string(), ext_user.to_string()))
            .cloned()
    }

    pub fn register_account(&mut self, account: Account) -> Rc<RefCell<Account>> {
        let key = (account.network.clone(), account.ext_user.clone());
        let rc = Rc::new(RefCell::new(account));
        self.accounts.insert(key, rc.clone());
        rc
    }

    pub fn remove_account(&mut self, network: &str, ext_user: &str) {
        self.accounts
            .remove(&(network.to_string(), ext_user.to_string()));
    }

    pub fn has_contact(&self, network: &str, ext_user: &str, ext_contact: &str) -> bool {
        self.find_account(network, ext_user)
            .map(|acc| acc.borrow().contacts.contains(ext_contact))
            .unwrap_or(false)
    }

    /// Finds the one account that already knows `ext_contact` on `network`,
    /// mirroring `find_account_for_contact`'s "search every account on this
    /// network for one that has registered this contact" behavior.
    pub fn find_account_for_contact(&self, network: &str, ext_contact: &str) -> Option<Rc<RefCell<Account>>> {
        self.accounts
            .values()
            .find(|acc| {
                let acc = acc.borrow();
                acc.network == network && acc.contacts.contains(ext_contact)
            })
            .cloned()
    }

    // --- identity mapping ---

    /// Converts an external contact string into an mxid on this home
    /// server, caching both directions. Parses `ext_contact` with the
    /// network's `ext_pattern`, then renders `@<prefix>-<user>[%<host>]:<hs_host>`,
    /// omitting the host segment when it equals `hs_host`. Returns `None`
    /// for an unknown network or a string `ext_pattern` doesn't match.
    pub fn ext_contact_to_mxid(&mut self, network: &str, ext_contact: &str) -> Option<String> {
        let cache_key = format!("{network}\u{0}{ext_contact}");
        if let Some(mxid) = self.ext_to_mxid.get(&cache_key) {
            return Some(mxid.clone());
        }
        let net_conf = self.networks.get(network)?;
        let prefix = net_conf.prefix.clone();
        let pattern = Regex::new(&net_conf.ext_pattern).ok()?;
        let caps = pattern.captures(ext_contact)?;
        let user = caps.name("user").map(|m| m.as_str()).unwrap_or_default();
        let host = caps.name("host").map(|m| m.as_str());

        let local = remap_chars(&format!("{prefix}-{user}"), true);
        let mxid = match host {
            Some(host) if host != self.hs_host => {
                format!("@{local}%{}:{}", remap_chars(host, true), self.hs_host)
            }
            _ => format!("@{local}:{}", self.hs_host),
        };
        self.ext_to_mxid.put(cache_key, mxid.clone());
        self.mxid_to_ext.put(mxid.clone(), format!("{network}\u{0}{ext_contact}"));
        Some(mxid)
    }

    /// Splits an mxid into `(network, ext_contact)`, the inverse of
    /// `ext_contact_to_mxid`. Resolves the network by matching the mxid's
    /// prefix segment against each configured network's `prefix`, then
    /// rebuilds the external string via that network's `ext_format`.
    pub fn mxid_to_ext_contact(&mut self, mxid: &str) -> Option<(String, String)> {
        if let Some(cached) = self.mxid_to_ext.get(mxid) {
            if let Some((network, ext_contact)) = cached.split_once('\u{0}') {
                return Some((network.to_string(), ext_contact.to_string()));
            }
        }
        let caps = RE_CONTACT_MXID.captures(mxid)?;
        let prefix = caps.name("prefix")?.as_str();
        let (network, ext_format) = self
            .networks
            .iter()
            .find(|(_, conf)| conf.prefix == prefix)
            .map(|(network, conf)| (network.clone(), conf.ext_format.clone()))?;

        let user = caps
            .name("user")
            .map(|m| remap_chars(m.as_str(), false))
            .unwrap_or_default();
        let host = match caps.name("host") {
            Some(host) => remap_chars(host.as_str(), false),
            None => self.hs_host.clone(),
        };

        let mut fields = HashMap::new();
        fields.insert("user", user);
        fields.insert("host", host);
        let ext_contact = render_template(&ext_format, &fields);

        self.mxid_to_ext
            .put(mxid.to_string(), format!("{network}\u{0}{ext_contact}"));
        Some((network, ext_contact))
    }

    pub fn parse_hs_host(hs_server: &str) -> String {
        hs_server
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .split('/')
            .next()
            .unwrap_or(hs_server)
            .split(':')
            .next()
            .unwrap_or(hs_server)
            .to_string()
    }

    // --- rooms ---

    /// Finds or creates the room between `network`/`ext_user`'s account and
    /// `ext_contact`, optionally binding it to an external conversation id.
    /// Two-pass match: first requiring the same `conv_id` (when one is
    /// given), then falling back to any room for the same (network,
    /// ext_user, ext_contact) regardless of `conv_id`.
    pub fn ensure_room(
        &mut self,
        network: &str,
        ext_user: &str,
        ext_contact: &str,
        conv_id: Option<&str>,
    ) -> String {
        let mxid_contact = self
            .ext_contact_to_mxid(network, ext_contact)
            .unwrap_or_else(|| format!("@{network}-{ext_contact}:{}", self.hs_host));

        if let Some(conv_id) = conv_id {
            if let Some((room_id, _)) = self.rooms.iter().find(|(_, room)| {
                room.network.as_deref() == Some(network)
                    && room.ext_user.as_deref() == Some(ext_user)
                    && room.conv_id.as_deref() == Some(conv_id)
            }) {
                return room_id.clone();
            }
        }
        if let Some((room_id, _)) = self.rooms.iter().find(|(_, room)| {
            room.network.as_deref() == Some(network)
                && room.ext_user.as_deref() == Some(ext_user)
                && room.members.contains(&mxid_contact)
        }) {
            return room_id.clone();
        }

        let user_mxid = self
            .find_account(network, ext_user)
            .map(|acc| acc.borrow().user.clone())
            .unwrap_or_else(|| format!("@{ext_user}:{}", self.hs_host));
        let room_id = self
            .matrix
            .create_room(&user_mxid, &[mxid_contact.clone()])
            .unwrap_or_else(|_| format!("!generated-{}:{}", self.rooms.len(), self.hs_host));

        let mut members = HashSet::new();
        members.insert(user_mxid);
        members.insert(mxid_contact);
        self.rooms.insert(
            room_id.clone(),
            Room {
                members,
                network: Some(network.to_string()),
                ext_user: Some(ext_user.to_string()),
                conv_id: conv_id.map(str::to_string),
            },
        );
        room_id
    }

    // --- access control ---

    /// Evaluates a sender mxid against the configured ACL: a blacklist
    /// (deny if matched) followed by a whitelist (allow only if matched, or
    /// allow-all when the whitelist is empty), cached per sender. Blacklist
    /// overrides whitelist.
    pub fn is_sender_allowed(&mut self, sender: &str) -> bool {
        if let Some(cached) = self.senders_access.get(sender) {
            return *cached;
        }
        let allowed = if Self::matches_any(&self.users_blacklist, &self.hs_host, sender) {
            false
        } else if self.users_whitelist.is_empty() {
            true
        } else {
            Self::matches_any(&self.users_whitelist, &self.hs_host, sender)
        };
        self.senders_access.put(sender.to_string(), allowed);
        allowed
    }

    fn matches_any(patterns: &[String], hs_host: &str, sender: &str) -> bool {
        patterns.iter().any(|pattern| {
            let substituted = pattern.replace("{hs_host}", hs_host);
            Regex::new(&substituted)
                .map(|re| re.is_match(sender))
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix_client::fake::FakeMatrixClient;

    fn test_base() -> BaseLayer {
        test_base_with_yaml(
            r#"
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
"#,
        )
    }

    fn test_base_with_yaml(config_yaml: &str) -> BaseLayer {
        let config = Config::from_yaml(config_yaml).unwrap();
        let matrix: Rc<dyn MatrixClient> = Rc::new(FakeMatrixClient::default());
        BaseLayer::new(&config, matrix, HashMap::new())
    }

    #[test]
    fn ext_contact_mxid_round_trips() {
        let mut base = test_base();
        let mxid = base.ext_contact_to_mxid("jabber", "alice@jabber.example").unwrap();
        assert_eq!(mxid, "@jabber-alice%jabber.example:example.org");
        let (network, ext_contact) = base.mxid_to_ext_contact(&mxid).unwrap();
        assert_eq!(network, "jabber");
        assert_eq!(ext_contact, "alice@jabber.example");
    }

    #[test]
    fn ext_contact_to_mxid_omits_host_matching_hs_host() {
        let mut base = test_base();
        let mxid = base.ext_contact_to_mxid("jabber", "alice@example.org").unwrap();
        assert_eq!(mxid, "@jabber-alice:example.org");
    }

    #[test]
    fn ext_contact_to_mxid_is_none_for_unknown_network() {
        let mut base = test_base();
        assert!(base.ext_contact_to_mxid("icq", "alice@icq.example").is_none());
    }

    #[test]
    fn blacklist_overrides_whitelist() {
        let mut base = test_base_with_yaml(
            r#"
hs_server: "https://example.org"
hs_host: "example.org"
hs_access_token: "tok"
service_localpart: "pumaduct"
service_display_name: "PuMaDuct"
http_frontend:
  hs_as_token: "hstok"
users_blacklist:
  - "^@evil:{hs_host}$"
users_whitelist:
  - "^@.*:{hs_host}$"
"#,
        );
        assert!(base.is_sender_allowed("@alice:example.org"));
        assert!(!base.is_sender_allowed("@evil:example.org"));
    }

    #[test]
    fn empty_whitelist_allows_everyone_not_blacklisted() {
        let mut base = test_base();
        assert!(base.is_sender_allowed("@anyone:example.org"));
    }

    #[test]
    fn ensure_room_reuses_existing_room_for_same_contact() {
        let mut base = test_base();
        let room1 = base.ensure_room("jabber", "alice", "bob@jabber.example", None);
        let room2 = base.ensure_room("jabber", "alice", "bob@jabber.example", None);
        assert_eq!(room1, room2);
    }

    #[test]
    fn parse_hs_host_strips_scheme_and_port() {
        assert_eq!(BaseLayer::parse_hs_host("https://example.org:8448"), "example.org");
    }
}
