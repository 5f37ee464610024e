pub mod cart;
pub mod catalog;
pub mod confirmation;
pub mod conversation;
pub mod inbound;
pub mod message;
pub mod reply;
pub mod session;
