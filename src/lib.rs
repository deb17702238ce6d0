pub mod cfg;
pub mod cmd;
pub mod conn;
pub mod engine;
pub mod logging;
pub mod mcg;
pub mod request;
pub mod resolve;
pub mod response;
pub mod stat;
pub mod tls;
pub mod transport;
pub mod worker;
