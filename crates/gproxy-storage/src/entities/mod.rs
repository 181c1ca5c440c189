pub mod api_keys;
pub mod credential_disallow;
pub mod credentials;
pub mod downstream_traffic;
pub mod global_config;
pub mod providers;
pub mod upstream_traffic;
pub mod users;

pub use api_keys::Entity as ApiKeys;
pub use credential_disallow::Entity as CredentialDisallow;
pub use credentials::Entity as Credentials;
pub use downstream_traffic::Entity as DownstreamTraffic;
pub use global_config::Entity as GlobalConfig;
pub use providers::Entity as Providers;
pub use upstream_traffic::Entity as UpstreamTraffic;
pub use users::Entity as Users;
