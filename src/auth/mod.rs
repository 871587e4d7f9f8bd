// Authentication module
// Credential refresh: the exchange call and its single-flight coordinator

mod coordinator;
mod refresh;
mod types;

pub use coordinator::{Phase, RefreshCoordinator};
pub use refresh::{interpret, HttpRefreshExchange, RefreshExchange, REFRESH_PATH};
pub use types::{CredentialRecord, Envelope, RefreshPayload, ResultCodes, TokenGrant};
