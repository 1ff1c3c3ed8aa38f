pub mod auth;
pub mod calendar;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod ics;
pub mod limits;
pub mod mailer;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod session;
pub mod sql;
pub mod store;
pub mod tls;
pub mod wal;
pub mod wire;
