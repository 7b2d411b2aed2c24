pub mod bootstrap;
pub mod config;
pub mod credential_store;
pub mod dispatch;
pub mod pid_lock;

pub use bootstrap::{Gateway, GatewayConfig, bootstrap};
pub use credential_store::FileCredentialStore;
pub use dispatch::{DispatchOutcome, Dispatcher};
