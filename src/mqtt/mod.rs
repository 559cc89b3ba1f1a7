pub mod client;
pub mod discovery;
