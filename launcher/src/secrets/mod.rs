//! Credential handling

pub mod env_file;

use std::collections::HashMap;

use secrecy::SecretString;

/// Field id to secret value, as submitted with a deploy request
pub type CredentialSet = HashMap<String, SecretString>;

/// Fixed-width mask used everywhere a credential value would otherwise appear
pub const SECRET_MASK: &str = "********";
