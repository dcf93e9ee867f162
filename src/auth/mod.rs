// Authentication module.
// Credential store boundary and the coalescing refresh coordinator.

pub mod credentials;
pub mod refresh;

pub use credentials::{CredentialStore, Credentials, InMemoryCredentials, Refresher};
pub use refresh::{AuthRefreshCoordinator, RefreshPhase};
