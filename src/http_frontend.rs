//! The Application-Service-facing HTTP surface: the two routes the home
//! server calls to push transactions in and query user existence.

use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use rocket::serde::json::Json;
use rocket::State;
use serde::Serialize;
use serde_json::Value;

use crate::config::Config;
use crate::mainloop::MainLoopHandle;
use crate::models::Transaction;

#[derive(Serialize)]
pub struct ErrorBody {
    pub errcode: &'static str,
    pub error: String,
}

impl ErrorBody {
    fn new(errcode: &'static str, error: impl Into<String>) -> Self {
        ErrorBody { errcode, error: error.into() }
    }
}

/// Verifies `?access_token=` against the configured `hs_as_token` before a
/// route body runs.
pub struct AsToken;

#[derive(Debug)]
pub enum AsTokenError {
    Missing,
    Incorrect,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AsToken {
    type Error = AsTokenError;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let config = req.rocket().state::<Config>();
        let Some(config) = config else {
            return Outcome::Error((Status::InternalServerError, AsTokenError::Missing));
        };
        let token = req
            .query_value::<String>("access_token")
            .and_then(|r| r.ok());
        match token {
            None => Outcome::Error((Status::Unauthorized, AsTokenError::Missing)),
            Some(t) if t == config.http_frontend.hs_as_token => Outcome::Success(AsToken),
            Some(_) => Outcome::Error((Status::Forbidden, AsTokenError::Incorrect)),
        }
    }
}

/// A request that satisfied `AsToken` but whose route handler still needs to
/// produce the 401/403 body; Rocket's guard failure path doesn't let us
/// attach a JSON body directly, so routes re-check and the catchers below
/// cover the plain-guard-rejection case.
#[rocket::catch(401)]
pub fn unauthorized() -> Json<ErrorBody> {
    Json(ErrorBody::new("CH.ENDL.PUMADUCT_UNAUTHORIZED", "missing access_token"))
}

#[rocket::catch(403)]
pub fn forbidden() -> Json<ErrorBody> {
    Json(ErrorBody::new("CH.ENDL.PUMADUCT_FORBIDDEN", "incorrect access_token"))
}

#[rocket::catch(404)]
pub fn not_found() -> Json<ErrorBody> {
    Json(ErrorBody::new("CH.ENDL.PUMADUCT_NOT_FOUND", "no such route"))
}

#[rocket::catch(400)]
pub fn bad_request() -> Json<ErrorBody> {
    Json(ErrorBody::new("CH.ENDL.PUMADUCT_BAD_REQUEST", "malformed request"))
}

/// `GET /users/<user_id>`: 200 `{}` iff the bridge currently has a contact
/// for that mxid, else 404.
#[rocket::get("/users/<user_id>")]
pub fn query_user(
    user_id: &str,
    _token: AsToken,
    handle: &State<MainLoopHandle>,
) -> (Status, Json<Value>) {
    let user_id = match urlencoding_decode(user_id) {
        Some(decoded) => decoded,
        None => {
            return (
                Status::NotFound,
                Json(serde_json::json!({
                    "errcode": "CH.ENDL.PUMADUCT_NOT_FOUND",
                    "error": "malformed user id"
                })),
            );
        }
    };

    let (tx, rx) = std::sync::mpsc::channel();
    handle.post(Box::new(move |backend: &mut crate::backend::Backend| {
        let found = backend
            .base
            .borrow_mut()
            .mxid_to_ext_contact(&user_id)
            .map(|(network, ext_contact)| {
                backend
                    .base
                    .borrow()
                    .find_account_for_contact(&network, &ext_contact)
                    .is_some()
            })
            .unwrap_or(false);
        let _ = tx.send(found);
    }));

    match rx.recv_timeout(std::time::Duration::from_secs(10)) {
        Ok(true) => (Status::Ok, Json(serde_json::json!({}))),
        _ => (
            Status::NotFound,
            Json(serde_json::json!({
                "errcode": "CH.ENDL.PUMADUCT_NOT_FOUND",
                "error": "no such user"
            })),
        ),
    }
}

/// `PUT /transactions/<transaction_id>`: parses the body, posts it to the
/// main loop, and replies 200 immediately — processing is asynchronous from
/// the home server's point of view, matching an Application Service's
/// fire-and-forget transaction semantics.
#[rocket::put("/transactions/<transaction_id>", data = "<body>")]
pub fn push_transaction(
    transaction_id: &str,
    body: Json<Transaction>,
    _token: AsToken,
    handle: &State<MainLoopHandle>,
) -> (Status, Json<Value>) {
    let transaction_id = transaction_id.to_string();
    let transaction = body.into_inner();
    handle.post(Box::new(move |backend: &mut crate::backend::Backend| {
        backend.process_transaction(&transaction_id, transaction);
    }));
    (Status::Ok, Json(serde_json::json!({})))
}

fn urlencoding_decode(s: &str) -> Option<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '%' {
            let hi = chars.next()?;
            let lo = chars.next()?;
            let byte = u8::from_str_radix(&format!("{hi}{lo}"), 16).ok()?;
            out.push(byte as char);
        } else if c == '+' {
            out.push(' ');
        } else {
            out.push(c);
        }
    }
    Some(out)
}
