pub mod arm;
pub mod credential;
pub mod memory;
pub mod registration;
pub mod types;
pub mod wire;

pub use arm::ArmControlPlane;
pub use credential::{
    probe, resolve_credential, AccessToken, CredentialError, TokenCredential, ARM_SCOPE,
    IDENTITY_CLIENT_ID_ENV,
};
pub use memory::MemoryControlPlane;
pub use registration::{register_model, resolve_latest_model};
pub use types::{ControlPlane, ControlPlaneError, Operation, Result};
