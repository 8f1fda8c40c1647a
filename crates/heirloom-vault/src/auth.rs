//! Caller authentication for mutating requests.
//!
//! A mutation arrives as a [`SignedRequest`]: the request body, the caller's
//! account id, a per-caller nonce and a BIP-340 Schnorr signature over
//!
//! ```text
//! SHA-256("heirloom/request/v1" || json({caller, nonce, request}))
//! ```
//!
//! [`authenticate`] is the only way to obtain an [`AuthenticatedCaller`], and
//! every engine mutation takes one. Nonce freshness is checked by the engine
//! inside the mutation's own transaction.

use crate::api::Request;
use crate::error::VaultError;
use crate::types::AccountId;
use secp256k1::{schnorr, Keypair, Message, Secp256k1};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::str::FromStr;

/// Domain separation prefix for request signatures.
pub const DOMAIN_TAG: &[u8] = b"heirloom/request/v1";

/// A request plus proof that `caller` sent it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedRequest {
    pub caller: AccountId,
    pub nonce: u64,
    pub request: Request,
    /// Hex-encoded 64-byte Schnorr signature.
    pub signature: String,
}

#[derive(Serialize)]
struct SigningPayload<'a> {
    caller: &'a AccountId,
    nonce: u64,
    request: &'a Request,
}

/// Digest that the caller signs.
pub fn signing_digest(
    caller: &AccountId,
    nonce: u64,
    request: &Request,
) -> Result<[u8; 32], serde_json::Error> {
    let payload = serde_json::to_vec(&SigningPayload {
        caller,
        nonce,
        request,
    })?;
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_TAG);
    hasher.update(&payload);
    Ok(hasher.finalize().into())
}

impl SignedRequest {
    /// Sign `request` with `keypair`. The caller id is the keypair's x-only key.
    pub fn sign(keypair: &Keypair, nonce: u64, request: Request) -> Result<Self, serde_json::Error> {
        let secp = Secp256k1::signing_only();
        let caller = AccountId::from_xonly(keypair.x_only_public_key().0);
        let digest = signing_digest(&caller, nonce, &request)?;
        let signature = secp.sign_schnorr_no_aux_rand(&Message::from_digest(digest), keypair);
        Ok(Self {
            caller,
            nonce,
            request,
            signature: signature.to_string(),
        })
    }
}

/// Identity proven by a verified signature. Cannot be built from outside the
/// crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedCaller {
    account: AccountId,
    nonce: u64,
}

impl AuthenticatedCaller {
    pub(crate) fn verified(account: AccountId, nonce: u64) -> Self {
        Self { account, nonce }
    }

    pub fn account(&self) -> &AccountId {
        &self.account
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }
}

/// Verify a signed request and return the caller it proves.
pub fn authenticate(signed: &SignedRequest) -> Result<AuthenticatedCaller, VaultError> {
    let signature = schnorr::Signature::from_str(signed.signature.trim())
        .map_err(|e| VaultError::Authentication(format!("malformed signature: {}", e)))?;
    let digest = signing_digest(&signed.caller, signed.nonce, &signed.request)
        .map_err(|e| VaultError::Authentication(format!("unencodable request: {}", e)))?;

    let secp = Secp256k1::verification_only();
    secp.verify_schnorr(
        &signature,
        &Message::from_digest(digest),
        signed.caller.as_xonly(),
    )
    .map_err(|_| {
        VaultError::Authentication(format!("signature does not verify for {}", signed.caller))
    })?;

    Ok(AuthenticatedCaller::verified(signed.caller, signed.nonce))
}
