pub mod chat;
pub mod status;
pub mod verify;
