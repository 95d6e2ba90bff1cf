pub mod canonical;
pub mod chat;
pub mod choice;
pub mod decorate;
pub mod messages;
pub mod responses;
