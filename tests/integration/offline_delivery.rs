use pumaduct::layers::messages::{Destination, OfflineMessage};

use super::common::test_backend_with_db;

#[test]
fn queued_client_message_is_delivered_on_retry_and_removed() {
    let (mut backend, client, db) = test_backend_with_db();

    let msg = OfflineMessage {
        network: Some("jabber".to_string()),
        ext_user: Some("alice@jabber.example".to_string()),
        room_id: None,
        sender: "alice@jabber.example".to_string(),
        recipient: Some("bob@jabber.example".to_string()),
        destination: Destination::Client,
        time: chrono::Utc::now(),
        payload: serde_json::json!({"msgtype": "m.text", "body": "hello while you were away"}),
    };
    db.store_offline_message(&msg).unwrap();
    assert_eq!(db.load_offline_messages(Destination::Client).unwrap().len(), 1);

    backend.on_retry_tick();

    assert!(db.load_offline_messages(Destination::Client).unwrap().is_empty());
    let sent = client.sent_messages.borrow();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "bob@jabber.example");
    assert_eq!(sent[0].1, "hello while you were away");
}

#[test]
fn queued_matrix_message_is_delivered_on_retry_and_removed() {
    let (mut backend, _client, db) = test_backend_with_db();

    let msg = OfflineMessage {
        network: None,
        ext_user: None,
        room_id: Some("!room:example.org".to_string()),
        sender: "@jabber-bob#jabber.example:example.org".to_string(),
        recipient: Some("@alice:example.org".to_string()),
        destination: Destination::Matrix,
        time: chrono::Utc::now(),
        payload: serde_json::json!({"msgtype": "m.text", "body": "hi from the other side"}),
    };
    db.store_offline_message(&msg).unwrap();

    backend.on_retry_tick();

    assert!(db.load_offline_messages(Destination::Matrix).unwrap().is_empty());
}
