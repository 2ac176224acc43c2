use std::collections::HashMap;
use std::rc::Rc;

use pumaduct::config::Config;
use pumaduct::layers::base::BaseLayer;
use pumaduct::matrix_client::fake::FakeMatrixClient;
use pumaduct::matrix_client::MatrixClient;

use super::common::test_backend;

/// Seed scenario: network `prpl-jabber` with `prefix=xmpp`,
/// `ext_pattern=^((?P<user>[^@]+)@)?(?P<host>[^/@]+)(/(?P<resource>.*))?$`,
/// `ext_format={user}@{host}`, `hs_host=localhost`.
fn xmpp_base() -> BaseLayer {
    let config_yaml = r#"
hs_server: "https://localhost"
hs_host: "localhost"
hs_access_token: "tok"
service_localpart: "pumaduct"
service_display_name: "PuMaDuct"
http_frontend:
  hs_as_token: "hstok"
networks:
  prpl-jabber:
    client: purple
    prefix: xmpp
    ext_pattern: "^((?P<user>[^@]+)@)?(?P<host>[^/@]+)(/(?P<resource>.*))?$"
    ext_format: "{user}@{host}"
"#;
    let config = Config::from_yaml(config_yaml).unwrap();
    let matrix: Rc<dyn MatrixClient> = Rc::new(FakeMatrixClient::default());
    BaseLayer::new(&config, matrix, HashMap::new())
}

#[test]
fn ext_to_mxid_includes_host_when_it_differs_from_hs_host() {
    let mut base = xmpp_base();
    let mxid = base.ext_contact_to_mxid("prpl-jabber", "test@example.com").unwrap();
    assert_eq!(mxid, "@xmpp-test%example.com:localhost");
}

#[test]
fn ext_to_mxid_omits_host_matching_hs_host() {
    let mut base = xmpp_base();
    let mxid = base.ext_contact_to_mxid("prpl-jabber", "test@localhost").unwrap();
    assert_eq!(mxid, "@xmpp-test:localhost");
}

#[test]
fn ext_to_mxid_remaps_reserved_characters() {
    let mut base = xmpp_base();
    let mxid = base.ext_contact_to_mxid("prpl-jabber", "user:with:col@localhost").unwrap();
    assert_eq!(mxid, "@xmpp-user#with#col:localhost");
}

#[test]
fn ext_to_mxid_and_back_is_the_identity() {
    let mut base = xmpp_base();
    let mxid = base.ext_contact_to_mxid("prpl-jabber", "test@example.com").unwrap();
    let (network, ext_contact) = base.mxid_to_ext_contact(&mxid).unwrap();
    assert_eq!(network, "prpl-jabber");
    assert_eq!(ext_contact, "test@example.com");
}

#[test]
fn reserved_characters_are_remapped_in_both_directions() {
    let mut base = xmpp_base();
    let mxid = base
        .ext_contact_to_mxid("prpl-jabber", "user:with:colons@localhost")
        .unwrap();
    assert_eq!(mxid.matches(':').count(), 1, "colons in the local part must be remapped");
    let (_, ext_contact) = base.mxid_to_ext_contact(&mxid).unwrap();
    assert_eq!(ext_contact, "user:with:colons@localhost");
}

#[test]
fn unknown_network_yields_no_mxid() {
    let mut base = xmpp_base();
    assert!(base.ext_contact_to_mxid("icq", "test@example.com").is_none());
}

#[test]
fn shared_fixture_round_trips_through_jabber_network() {
    let (backend, _client) = test_backend();
    let mxid = backend
        .base
        .borrow_mut()
        .ext_contact_to_mxid("jabber", "test@jabber.example")
        .unwrap();
    assert_eq!(mxid, "@jabber-test%jabber.example:example.org");
    let (network, ext_contact) = backend.base.borrow_mut().mxid_to_ext_contact(&mxid).unwrap();
    assert_eq!(network, "jabber");
    assert_eq!(ext_contact, "test@jabber.example");
}
