pub mod config;
pub mod http_server;
pub mod poller;
