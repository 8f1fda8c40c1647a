//! Shared test utilities for heirloom-vault tests.
//!
//! Provides deterministic keypairs, signing accounts with their own nonce
//! counter, and an engine wired to an in-memory store, ledger and manual
//! clock.

use crate::api::Request;
use crate::auth::{AuthenticatedCaller, SignedRequest};
use crate::clock::ManualClock;
use crate::engine::{EngineConfig, VaultEngine};
use crate::ledger::MemoryLedger;
use crate::store;
use crate::types::{AccountId, SetupPolicy};
use secp256k1::{Keypair, Secp256k1, SecretKey};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Generate a deterministic keypair from a seed byte.
///
/// The secret key is `[0x01, 0x00, ..., 0x00, seed]` (32 bytes).
/// Different seed bytes produce different keys.
pub fn test_keypair(seed_byte: u8) -> Keypair {
    let secp = Secp256k1::new();
    let mut secret_bytes = [0u8; 32];
    secret_bytes[31] = seed_byte;
    secret_bytes[0] = 0x01;
    let sk = SecretKey::from_slice(&secret_bytes).unwrap();
    Keypair::from_secret_key(&secp, &sk)
}

/// A signing identity with its own monotonically increasing nonce.
pub struct TestAccount {
    keypair: Keypair,
    id: AccountId,
    nonce: AtomicU64,
}

impl TestAccount {
    pub fn new(seed: u8) -> Self {
        let keypair = test_keypair(seed);
        let id = AccountId::from_xonly(keypair.x_only_public_key().0);
        Self {
            keypair,
            id,
            nonce: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> AccountId {
        self.id
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    fn next_nonce(&self) -> u64 {
        self.nonce.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// A pre-authenticated caller with a fresh nonce.
    pub fn caller(&self) -> AuthenticatedCaller {
        AuthenticatedCaller::verified(self.id, self.next_nonce())
    }

    /// Sign `request` with a fresh nonce.
    pub fn sign(&self, request: Request) -> SignedRequest {
        SignedRequest::sign(&self.keypair, self.next_nonce(), request).unwrap()
    }
}

/// Engine plus handles on its collaborators.
pub struct Fixture {
    pub engine: VaultEngine,
    pub ledger: Arc<MemoryLedger>,
    pub clock: Arc<ManualClock>,
    pub custody: TestAccount,
}

/// Custody account seed used by [`fixture`].
pub const CUSTODY_SEED: u8 = 200;

/// In-memory engine starting at t=0 with an empty ledger.
pub fn fixture(policy: SetupPolicy) -> Fixture {
    fixture_with_reserve(policy, 0)
}

pub fn fixture_with_reserve(policy: SetupPolicy, reserve: u64) -> Fixture {
    let ledger = Arc::new(MemoryLedger::with_reserve(reserve));
    let clock = Arc::new(ManualClock::new(0));
    let custody = TestAccount::new(CUSTODY_SEED);
    let engine = VaultEngine::new(
        store::open_in_memory().unwrap(),
        ledger.clone(),
        clock.clone(),
        EngineConfig {
            custody: custody.id(),
            setup_policy: policy,
        },
    );
    Fixture {
        engine,
        ledger,
        clock,
        custody,
    }
}
