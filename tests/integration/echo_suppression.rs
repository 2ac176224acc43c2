use pumaduct::models::RoomEvent;

use super::common::test_backend;

#[test]
fn transaction_echo_of_our_own_send_is_not_forwarded_to_the_client() {
    let (mut backend, client) = test_backend();

    backend
        .base
        .borrow_mut()
        .register_account(pumaduct::layers::base::Account {
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

    let event_id = {
        let mut messages = backend.messages.borrow_mut();
        let sender = backend
            .base
            .borrow_mut()
            .ext_contact_to_mxid("jabber", "bob@jabber.example")
            .unwrap();
        messages
            .send_message_to_matrix(
                None,
                &room_id,
                &sender,
                "@alice:example.org",
                chrono::Utc::now(),
                serde_json::json!({"msgtype": "m.text", "body": "hi alice"}),
            )
            .unwrap();
        "$event-1".to_string()
    };

    let echoed = RoomEvent {
        event_id,
        event_type: "m.room.message".to_string(),
        room_id,
        sender: "@alice:example.org".to_string(),
        state_key: None,
        content: serde_json::json!({"msgtype": "m.text", "body": "hi alice"}),
        origin_server_ts: 0,
    };
    backend.messages.borrow_mut().process_transaction_message("txn-echo", &echoed);

    assert!(client.sent_messages.borrow().is_empty());
}
