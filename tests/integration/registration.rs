use pumaduct::im_client::ClientEvent;
use pumaduct::models::RoomEvent;

use super::common::test_backend;

#[test]
fn register_then_sign_on_creates_exactly_one_account() {
    let (mut backend, client) = test_backend();

    let room_id = backend.service.borrow_mut().ensure_room("@alice:example.org");
    let register_event = RoomEvent {
        event_id: "$register1".to_string(),
        event_type: "m.room.message".to_string(),
        room_id: room_id.clone(),
        sender: "@alice:example.org".to_string(),
        state_key: None,
        content: serde_json::json!({
            "msgtype": "m.text",
            "body": "register jabber test@localhost 'password with spaces'"
        }),
        origin_server_ts: 0,
    };
    backend.service.borrow_mut().on_transaction_message("txn1", &register_event);

    assert_eq!(client.logged_in.borrow().len(), 1);
    assert!(backend.base.borrow().find_account("jabber", "test@localhost").is_none());

    backend.dispatch_client_event(ClientEvent::UserSignedOn {
        network: "jabber".to_string(),
        ext_user: "test@localhost".to_string(),
    });

    let account = backend
        .base
        .borrow()
        .find_account("jabber", "test@localhost")
        .expect("account must exist after sign-on");
    assert_eq!(account.borrow().password, "password with spaces");

    // A second sign-on for the same pair must not create a duplicate: the
    // pending registration was already consumed, so this is a no-op.
    backend.dispatch_client_event(ClientEvent::UserSignedOn {
        network: "jabber".to_string(),
        ext_user: "test@localhost".to_string(),
    });
    assert!(backend.base.borrow().find_account("jabber", "test@localhost").is_some());
}

#[test]
fn registering_an_unknown_network_sends_an_error_without_logging_in() {
    let (mut backend, client) = test_backend();
    let room_id = backend.service.borrow_mut().ensure_room("@bob:example.org");
    let event = RoomEvent {
        event_id: "$register2".to_string(),
        event_type: "m.room.message".to_string(),
        room_id,
        sender: "@bob:example.org".to_string(),
        state_key: None,
        content: serde_json::json!({"msgtype": "m.text", "body": "register icq bob secret"}),
        origin_server_ts: 0,
    };
    backend.service.borrow_mut().on_transaction_message("txn2", &event);
    assert!(client.logged_in.borrow().is_empty());
}
