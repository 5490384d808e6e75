pub mod config;
pub mod exec;
pub mod gateway;
pub mod oneshot;
pub mod registry;
pub mod routes;
pub mod session;
pub mod source;
pub mod web_server;

pub fn create_timestamp() -> String {
    use chrono::{SecondsFormat, Utc};
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
