//! Client-side identity session.
//!
//! Keeps a short-lived access token alive with a longer-lived refresh token:
//!
//! - `codec`: decodes access-token claims
//! - `session`: the session record and its validity/expiry queries
//! - `scheduler`: single-slot renewal timer
//! - `gateway`: the authenticate/login/refresh exchanges
//! - `authorizer`: stamps outgoing requests with the current access token
//! - `manager`: `SessionManager`, which ties the above together
//! - `store`: durable homes for the refresh token (keychain, file, memory)
//!
//! Tokens are renewed `refresh_margin` before they expire; hosts should also
//! call `SessionManager::on_focus` when the application returns to the
//! foreground, since timers may not fire while suspended.

pub mod authorizer;
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod gateway;
pub mod manager;
pub mod scheduler;
pub mod session;
pub mod store;

pub use authorizer::{AuthorizedClient, RequestAuthorizer};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{decode, Claims};
pub use config::{Endpoint, IdentityConfig};
pub use error::{AuthError, DecodeError, StoreError, REDIRECT_HEADER};
pub use gateway::{AuthGateway, FlowKind, TokenGrant};
pub use manager::{Navigation, Renewal, SessionManager};
pub use scheduler::RefreshScheduler;
pub use session::{AccessCredential, Session, SessionSnapshot, SharedSession};
pub use store::{FileStore, KeyringStore, MemoryStore, TokenStore};
