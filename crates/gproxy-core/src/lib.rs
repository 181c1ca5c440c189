pub mod auth;
pub mod bootstrap;
pub mod classify;
pub mod core;
pub mod error;
pub mod handler;
pub mod proxy_engine;
pub mod state;
pub mod upstream_client;

pub use auth::{
    AuthContext, AuthError, AuthKeyEntry, AuthProvider, AuthSnapshot, MemoryAuth, NoopAuth,
    UserEntry,
};
pub use classify::ProxyClassified;
pub use core::{Core, CoreState, ProviderLookup};
