//! Client for the course enrollment portal.
//!
//! [`SessionManager`] owns the bearer-token session: it persists the token
//! pair through a [`SessionStore`], stamps every request sent through it, and
//! turns a burst of 401 responses into a single token refresh followed by one
//! retry per request. [`PortalApi`] is the registration/enrollment client
//! built on top of it.

pub mod api;
pub mod config;
pub mod error;
pub mod manager;
pub mod session;
pub mod storage;
pub mod transport;

pub use api::{PortalApi, Registration, RegistrationRecord};
pub use config::PortalConfig;
pub use error::{AccessError, AuthError, PortalError, RefreshError, StorageError, TransportError};
pub use manager::SessionManager;
pub use session::{Credentials, Role, Session};
pub use storage::{FileStore, MemoryStore, SessionStore, StorageKey};
pub use transport::{ApiRequest, ApiResponse, ReqwestTransport, Transport};
