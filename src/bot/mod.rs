/// Command and message handlers
pub mod handlers;
