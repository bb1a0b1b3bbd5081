//! Session material: gateway clearance, stored credentials, and request
//! decoration.

pub mod bypass;
pub mod credentials;
pub mod decorator;

pub use bypass::{
    AccessToken, BypassError, BypassSettings, ChallengeBypassClient, CredentialSource,
    GatewayCookies,
};
pub use credentials::{Credential, CredentialFlags, CredentialSet, CredentialStore};
pub use decorator::{
    ClientIdentity, ConnectionContext, DecoratableRequest, DecorateError, ProxySettings,
    RequestDecorator, UpgradeRequest,
};
