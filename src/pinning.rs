//! Certificate and public-key pinning.
//!
//! The host TLS stack calls [`SecurityPolicy::evaluate`] from its handshake
//! challenge hook with the presented chain; the policy answers accept or
//! reject. Pins are SHA-256 digests of either the certificate DER or its
//! public key, depending on the configured mode.

use std::collections::HashSet;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// What gets hashed and compared against the pin set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinningMode {
    /// Pin the SHA-256 of the certificate's `SubjectPublicKeyInfo`.
    /// Survives certificate rotation as long as the key is kept.
    PublicKey,
    /// Pin the SHA-256 of the full certificate DER.
    Certificate,
}

/// Which hosts the policy applies to.
#[derive(Debug, Clone)]
pub enum PinnedHosts {
    /// Every host this client talks to.
    All,
    /// Only the named hosts; others follow system trust.
    Hosts(HashSet<String>),
}

impl PinnedHosts {
    /// Builds a host set from names.
    #[must_use]
    pub fn hosts<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Hosts(names.into_iter().map(Into::into).collect())
    }

    fn contains(&self, host: &str) -> bool {
        match self {
            Self::All => true,
            Self::Hosts(hosts) => hosts.contains(host),
        }
    }
}

/// What to do when no pin matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinFailureAction {
    /// Fail the handshake.
    Reject,
    /// Log and proceed; for staged rollouts of new pin sets.
    Warn,
}

/// The policy's answer to one TLS challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeDisposition {
    /// Proceed with the handshake.
    Accept,
    /// Abort the handshake.
    Reject,
}

/// One certificate presented during the handshake, in the forms the
/// verifier hashes. The host TLS stack extracts both.
#[derive(Debug, Clone)]
pub struct ServerCertificate {
    /// The full certificate, DER-encoded.
    pub der: Vec<u8>,
    /// The certificate's `SubjectPublicKeyInfo`, DER-encoded.
    pub public_key_der: Vec<u8>,
}

/// One TLS challenge as handed over by the host TLS stack.
#[derive(Debug, Clone)]
pub struct TlsChallenge<'a> {
    /// The host being connected to.
    pub host: &'a str,
    /// The presented certificate chain, leaf first.
    pub chain: &'a [ServerCertificate],
    /// The system trust evaluation result for the chain.
    pub chain_trusted: bool,
}

/// A policy with no primary pins would reject every pinned host; the
/// constructor refuses it.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("a security policy requires at least one primary pin")]
pub struct EmptyPinSet;

/// Pin configuration for TLS challenges.
#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    mode: PinningMode,
    pinned_hosts: PinnedHosts,
    primary_pins: Vec<[u8; 32]>,
    fallback_pins: Vec<[u8; 32]>,
    failure_action: PinFailureAction,
    validate_chain: bool,
}

impl SecurityPolicy {
    /// Creates a policy; `primary_pins` must not be empty.
    ///
    /// Defaults: all hosts pinned, no fallback pins, reject on failure,
    /// system chain validation on.
    pub fn new(
        mode: PinningMode,
        primary_pins: Vec<[u8; 32]>,
    ) -> Result<Self, EmptyPinSet> {
        if primary_pins.is_empty() {
            return Err(EmptyPinSet);
        }
        Ok(Self {
            mode,
            pinned_hosts: PinnedHosts::All,
            primary_pins,
            fallback_pins: Vec::new(),
            failure_action: PinFailureAction::Reject,
            validate_chain: true,
        })
    }

    /// Restricts pinning to specific hosts.
    #[must_use]
    pub fn pinned_hosts(mut self, hosts: PinnedHosts) -> Self {
        self.pinned_hosts = hosts;
        self
    }

    /// Adds backup pins honored alongside the primary set.
    #[must_use]
    pub fn fallback_pins(mut self, pins: Vec<[u8; 32]>) -> Self {
        self.fallback_pins = pins;
        self
    }

    /// Sets the reaction to a pin mismatch.
    #[must_use]
    pub fn failure_action(mut self, action: PinFailureAction) -> Self {
        self.failure_action = action;
        self
    }

    /// Controls whether system chain validation gates the pin check.
    #[must_use]
    pub fn validate_chain(mut self, validate: bool) -> Self {
        self.validate_chain = validate;
        self
    }

    /// Decodes a hex-rendered SHA-256 pin.
    pub fn pin_from_hex(hex_digest: &str) -> Result<[u8; 32], hex::FromHexError> {
        let raw = hex::decode(hex_digest)?;
        raw.try_into().map_err(|_| hex::FromHexError::InvalidStringLength)
    }

    /// Computes the pin a given certificate would need, under `mode`.
    #[must_use]
    pub fn pin_for(mode: PinningMode, certificate: &ServerCertificate) -> [u8; 32] {
        let input = match mode {
            PinningMode::PublicKey => &certificate.public_key_der,
            PinningMode::Certificate => &certificate.der,
        };
        Sha256::digest(input).into()
    }

    /// Evaluates one TLS challenge.
    ///
    /// Unpinned hosts follow system policy and are accepted here. For
    /// pinned hosts: an untrusted chain is rejected outright when chain
    /// validation is on; otherwise the handshake is accepted iff any
    /// presented certificate hashes to any pin in the primary or fallback
    /// set, with [`PinFailureAction::Warn`] downgrading a mismatch to a
    /// logged acceptance.
    #[must_use]
    pub fn evaluate(&self, challenge: &TlsChallenge<'_>) -> ChallengeDisposition {
        if !self.pinned_hosts.contains(challenge.host) {
            return ChallengeDisposition::Accept;
        }
        if self.validate_chain && !challenge.chain_trusted {
            log::warn!(
                "rejecting {}: system chain validation failed",
                challenge.host
            );
            return ChallengeDisposition::Reject;
        }

        let matched = challenge.chain.iter().any(|certificate| {
            let digest = Self::pin_for(self.mode, certificate);
            self.primary_pins.contains(&digest)
                || self.fallback_pins.contains(&digest)
        });
        if matched {
            return ChallengeDisposition::Accept;
        }

        match self.failure_action {
            PinFailureAction::Reject => {
                log::warn!("rejecting {}: no pin matched", challenge.host);
                ChallengeDisposition::Reject
            }
            PinFailureAction::Warn => {
                log::warn!(
                    "accepting {} despite pin mismatch (warn mode)",
                    challenge.host
                );
                ChallengeDisposition::Accept
            }
        }
    }
}
