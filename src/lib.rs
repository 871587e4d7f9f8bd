// Session Client - Library root

pub mod auth;
pub mod config;
pub mod error;
pub mod http_client;
pub mod middleware;
pub mod store;

pub use auth::{CredentialRecord, RefreshCoordinator, RefreshExchange, ResultCodes};
pub use error::{ClientError, RefreshError};
pub use http_client::{ApiResponse, ClientOptions, SessionClient};
pub use middleware::LoginRedirect;
pub use store::{CredentialStore, Lookup};
