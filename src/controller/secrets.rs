//! Fingerprints of the secrets a deployment depends on
//!
//! The JWT secret, TLS CA and encryption key are baked into running members.
//! Their hashes are recorded the first time each secret is seen; a later
//! mismatch raises `SecretsChanged` and stops inspection until the secret is
//! restored.

use k8s_openapi::api::core::v1::Secret;
use sha2::{Digest, Sha256};

use crate::crd::{ArangoDeploymentSpec, SecretHashes};
use crate::inspector::Snapshot;

/// Key in the JWT secret holding the signing token
pub const JWT_TOKEN_KEY: &str = "token";

/// Hex SHA-256 over the sorted keys and values of a secret
pub fn secret_hash(secret: &Secret) -> String {
    let mut hasher = Sha256::new();
    if let Some(data) = &secret.data {
        for (key, value) in data {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(&value.0);
            hasher.update([0u8]);
        }
    }
    if let Some(data) = &secret.string_data {
        for (key, value) in data {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.as_bytes());
            hasher.update([0u8]);
        }
    }
    hex::encode(hasher.finalize())
}

fn hash_of(snapshot: &Snapshot, name: Option<&str>) -> Option<String> {
    name.and_then(|n| snapshot.secret(n)).map(secret_hash)
}

/// Hashes of the referenced secrets that currently exist
pub fn current_hashes(spec: &ArangoDeploymentSpec, snapshot: &Snapshot) -> SecretHashes {
    SecretHashes {
        auth_jwt: hash_of(snapshot, spec.jwt_secret_name()),
        tls_ca: hash_of(snapshot, spec.tls_ca_secret_name()),
        rocksdb_encryption_key: hash_of(snapshot, spec.encryption_key_secret_name()),
    }
}

/// Outcome of comparing recorded and current hashes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretCheck {
    /// Recorded hashes with newly seen secrets filled in
    pub hashes: SecretHashes,
    /// Secrets whose content differs from the recorded hash
    pub changed: Vec<&'static str>,
}

/// Compare current hashes with the recorded ones. A recorded secret that
/// disappeared counts as changed; a secret seen for the first time is
/// recorded.
pub fn check_hashes(recorded: Option<&SecretHashes>, current: &SecretHashes) -> SecretCheck {
    let recorded = recorded.cloned().unwrap_or_default();
    let mut changed = Vec::new();

    let mut merge = |name: &'static str, recorded: Option<String>, current: &Option<String>| {
        match (recorded, current) {
            (Some(old), Some(new)) if &old != new => {
                changed.push(name);
                Some(old)
            }
            (Some(old), None) => {
                changed.push(name);
                Some(old)
            }
            (Some(old), Some(_)) => Some(old),
            (None, new) => new.clone(),
        }
    };

    let hashes = SecretHashes {
        auth_jwt: merge("jwt", recorded.auth_jwt, &current.auth_jwt),
        tls_ca: merge("tls-ca", recorded.tls_ca, &current.tls_ca),
        rocksdb_encryption_key: merge(
            "encryption-key",
            recorded.rocksdb_encryption_key,
            &current.rocksdb_encryption_key,
        ),
    };
    SecretCheck { hashes, changed }
}

/// JWT signing token of the deployment, if authentication is enabled and
/// the secret exists
pub fn jwt_token(spec: &ArangoDeploymentSpec, snapshot: &Snapshot) -> Option<String> {
    let secret = snapshot.secret(spec.jwt_secret_name()?)?;
    if let Some(value) = secret.data.as_ref().and_then(|d| d.get(JWT_TOKEN_KEY)) {
        return String::from_utf8(value.0.clone()).ok();
    }
    secret
        .string_data
        .as_ref()
        .and_then(|d| d.get(JWT_TOKEN_KEY))
        .cloned()
}
