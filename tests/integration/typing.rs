use pumaduct::layers::base::Account;
use pumaduct::models::RoomEvent;

use super::common::test_backend;

fn typing_event(room_id: &str, user_ids: &[&str]) -> RoomEvent {
    RoomEvent {
        event_id: "$typing1".to_string(),
        event_type: "m.typing".to_string(),
        room_id: room_id.to_string(),
        sender: "example.org".to_string(),
        state_key: None,
        content: serde_json::json!({"user_ids": user_ids}),
        origin_server_ts: 0,
    }
}

#[test]
fn typing_with_no_bound_conversation_creates_one_lazily() {
    let (mut backend, client) = test_backend();

    backend.base.borrow_mut().register_account(Account {
        user: "@alice:example.org".to_string(),
        network: "jabber".to_string(),
        ext_user: "alice@jabber.example".to_string(),
        password: "hunter2".to_string(),
        auth_token: None,
        contacts: Default::default(),
    });
    let room_id = backend.base.borrow_mut().ensure_room(
        "jabber",
        "alice@jabber.example",
        "bob@jabber.example",
        None,
    );
    let contact_mxid = backend
        .base
        .borrow_mut()
        .ext_contact_to_mxid("jabber", "bob@jabber.example")
        .unwrap();

    let event = typing_event(&room_id, &["@alice:example.org", contact_mxid.as_str()]);
    backend.typing.borrow_mut().on_transaction_typing("txn-typing", &event);

    assert_eq!(client.conversations_created.borrow().len(), 1);
    let (network, ext_user, _contact) = client.conversations_created.borrow()[0].clone();
    assert_eq!(network, "jabber");
    assert_eq!(ext_user, "alice@jabber.example");
    assert_eq!(client.typing_calls.borrow().len(), 1);
}

#[test]
fn typing_clearing_to_an_absent_user_does_not_notify_the_client() {
    let (mut backend, client) = test_backend();

    backend.base.borrow_mut().register_account(Account {
        user: "@alice:example.org".to_string(),
        network: "jabber".to_string(),
        ext_user: "alice@jabber.example".to_string(),
        password: "hunter2".to_string(),
        auth_token: None,
        contacts: Default::default(),
    });
    let room_id = backend.base.borrow_mut().ensure_room(
        "jabber",
        "alice@jabber.example",
        "bob@jabber.example",
        None,
    );

    let event = typing_event(&room_id, &[]);
    backend.typing.borrow_mut().on_transaction_typing("txn-typing", &event);

    assert!(client.conversations_created.borrow().is_empty());
    assert!(client.typing_calls.borrow().is_empty());
}
