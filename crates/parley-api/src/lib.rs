pub mod auth;
pub mod conversations;
pub mod messages;
pub mod middleware;
pub mod users;
