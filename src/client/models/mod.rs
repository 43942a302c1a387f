pub mod app_state;
pub mod conversation;
pub mod messages;
