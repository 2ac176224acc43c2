//! Out-of-band input requests: a back-end asking the user for something
//! (a 2FA code, a CAPTCHA answer) mid-login, relayed through the service
//! room as a prompt-and-reply exchange.

use std::cell::RefCell;
use std::rc::Rc;

use regex::Regex;

use crate::config::NetworkConfig;
use crate::layers::service::ServiceLayer;

/// One outstanding input request, stashed in a `ServiceRoom`'s scratch data
/// keyed by `"pending-input"` until the user replies.
pub struct PendingInput {
    pub network: String,
    pub ext_user: String,
    pub ok_cb: Option<Box<dyn FnOnce(&str)>>,
    pub cancel_cb: Option<Box<dyn FnOnce()>>,
}

pub enum ScratchValue {
    PendingInput(PendingInput),
}

pub struct InputLayer {
    service: Rc<RefCell<ServiceLayer>>,
}

impl InputLayer {
    pub fn new(service: Rc<RefCell<ServiceLayer>>) -> Self {
        InputLayer { service }
    }

    pub fn start(&mut self) {
        self.service.borrow_mut().add_service_callback(
            "input",
            "input <text> - answer a pending input request",
            Box::new({
                let this_service = self.service.clone();
                move |_txn_id, event, args| {
                    Self::handle_service_input(&this_service, event, args)
                }
            }),
        );
    }

    /// A back-end wants the user to supply `primary` matching one of the
    /// network's configured input patterns. Finds (or creates) the service
    /// room for the user and stores the pending request there.
    pub fn on_request_input(
        &mut self,
        net_conf: &NetworkConfig,
        network: &str,
        ext_user: &str,
        user: &str,
        primary: &str,
        ok_cb: Box<dyn FnOnce(&str)>,
        cancel_cb: Box<dyn FnOnce()>,
    ) -> bool {
        let matched = net_conf
            .inputs
            .iter()
            .find(|input| Regex::new(&input.pattern).map(|re| re.is_match(primary)).unwrap_or(false));
        let Some(input_conf) = matched else {
            return false;
        };
        let room_id = self.service.borrow_mut().ensure_room(user);
        let prompt = input_conf.prompt.clone();
        {
            let mut service = self.service.borrow_mut();
            if let Some(room) = service.rooms.get_mut(&room_id) {
                room.data.insert(
                    "pending-input",
                    ScratchValue::PendingInput(PendingInput {
                        network: network.to_string(),
                        ext_user: ext_user.to_string(),
                        ok_cb: Some(ok_cb),
                        cancel_cb: Some(cancel_cb),
                    }),
                );
            }
            service.send_message(&room_id, user, &prompt);
        }
        true
    }

    fn handle_service_input(
        service: &Rc<RefCell<ServiceLayer>>,
        event: &crate::models::RoomEvent,
        args: &[String],
    ) -> bool {
        let text = event
            .content
            .get("body")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let answer = if args.is_empty() {
            text.to_string()
        } else {
            args.join(" ")
        };
        let mut service_mut = service.borrow_mut();
        let Some(room) = service_mut.rooms.get_mut(&event.room_id) else {
            return false;
        };
        let Some(ScratchValue::PendingInput(mut pending)) = room.data.remove("pending-input") else {
            return false;
        };
        if let Some(ok_cb) = pending.ok_cb.take() {
            ok_cb(&answer);
        }
        true
    }

    /// Cancels a pending input request for a room (e.g. the account it was
    /// registering was unregistered before the user replied).
    pub fn cancel_pending(&mut self, room_id: &str) {
        let mut service = self.service.borrow_mut();
        let Some(room) = service.rooms.get_mut(room_id) else {
            return;
        };
        if let Some(ScratchValue::PendingInput(mut pending)) = room.data.remove("pending-input") {
            if let Some(cancel_cb) = pending.cancel_cb.take() {
                cancel_cb();
            }
        }
    }
}
