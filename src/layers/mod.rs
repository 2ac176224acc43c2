pub mod base;
pub mod connection;
pub mod info;
pub mod input;
pub mod messages;
pub mod presence;
pub mod registration;
pub mod room_state;
pub mod service;
pub mod typing;
