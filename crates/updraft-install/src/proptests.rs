//! Property-based tests for updraft-install.
//!
//! # Properties Tested
//!
//! - Signed candidates verify; any single-byte mutation of the signed payload
//!   makes verification fail
//! - Version ordering is antisymmetric and treats numeric extensions as newer
//! - Semver ordering agrees with the `semver` crate for valid versions
//! - Repeating a copy yields a byte-identical destination

#![cfg(test)]

use std::cmp::Ordering;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use ed25519_dalek::SigningKey;
use proptest::prelude::*;
use semver::Version;
use tempfile::TempDir;

use crate::authority::NoAuthority;
use crate::bundle::{BundleInfo, BundleMetadata, BundleReference};
use crate::error::VerificationFailure;
use crate::fileops::FileOperations;
use crate::trash::{Trash, TrashLayout};
use crate::verify::{bundle_digest, write_bundle_signature, NoCodeSigning, SignatureVerifier, VerificationOutcome};
use crate::version::{SemverComparator, StandardVersionComparator, VersionComparator};

// =============================================================================
// Generators
// =============================================================================

/// Generate a random Ed25519 signing key from 32 random bytes.
fn arb_signing_key() -> impl Strategy<Value = SigningKey> {
    prop::array::uniform32(any::<u8>()).prop_map(|bytes| SigningKey::from_bytes(&bytes))
}

/// Generate random payload content (1 byte to 4KB).
fn arb_payload() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..4096)
}

/// Generate a version-like string.
fn arb_version_string() -> impl Strategy<Value = String> {
    "[0-9a-c.]{0,10}"
}

/// Generate a dotted numeric version.
fn arb_numeric_version() -> impl Strategy<Value = String> {
    prop::collection::vec(0u32..1000, 1..5).prop_map(|parts| {
        parts
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(".")
    })
}

/// Generate a semantic version, optionally with a pre-release.
fn arb_semver() -> impl Strategy<Value = Version> {
    (0u64..20, 0u64..20, 0u64..20, prop::option::of("(alpha|beta|rc)\\.[0-9]"))
        .prop_map(|(major, minor, patch, pre)| {
            let mut version = Version::new(major, minor, patch);
            if let Some(pre) = pre {
                version.pre = semver::Prerelease::new(&pre).unwrap();
            }
            version
        })
}

fn create_bundle(dir: &Path, name: &str, key: Option<&SigningKey>, payload: &[u8]) -> BundleReference {
    let path = dir.join(name);
    let mut info = BundleInfo::new("com.example.app", "1.0");
    info.public_ed_key = key.map(|k| hex::encode(k.verifying_key().to_bytes()));
    info.write_to(&path).unwrap();
    fs::write(path.join("Contents").join("payload.bin"), payload).unwrap();
    BundleReference::load(&path).unwrap()
}

// =============================================================================
// Signature verification
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// A correctly signed candidate verifies against the signer's key.
    #[test]
    fn prop_signed_candidate_verifies(key in arb_signing_key(), payload in arb_payload()) {
        let temp = TempDir::new().unwrap();
        let host = create_bundle(temp.path(), "Host.app", Some(&key), b"host");
        let candidate = create_bundle(temp.path(), "Update.app", None, &payload);
        write_bundle_signature(&key, candidate.path()).unwrap();

        let verifier = SignatureVerifier::with_platform(Arc::new(NoCodeSigning));
        prop_assert!(verifier.verify(&candidate, &host).is_verified());
    }

    /// Flipping any single byte of the signed payload breaks verification.
    #[test]
    fn prop_single_byte_mutation_fails(
        key in arb_signing_key(),
        payload in arb_payload(),
        index in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let temp = TempDir::new().unwrap();
        let host = create_bundle(temp.path(), "Host.app", Some(&key), b"host");
        let candidate = create_bundle(temp.path(), "Update.app", None, &payload);
        write_bundle_signature(&key, candidate.path()).unwrap();

        let mut mutated = payload.clone();
        let i = index.index(mutated.len());
        mutated[i] ^= flip;
        fs::write(candidate.path().join("Contents").join("payload.bin"), &mutated).unwrap();

        let verifier = SignatureVerifier::with_platform(Arc::new(NoCodeSigning));
        let outcome = verifier.verify(&candidate, &host);
        prop_assert!(
            matches!(outcome, VerificationOutcome::Failed(VerificationFailure::SignatureInvalid(_))),
            "mutated candidate must fail verification, got {:?}",
            outcome
        );
    }

    /// Repeating a copy gives a byte-identical destination.
    #[test]
    fn prop_copy_is_idempotent(payload in arb_payload()) {
        let temp = TempDir::new().unwrap();
        let source = create_bundle(temp.path(), "Update.app", None, &payload);
        let ops = FileOperations::new(
            Arc::new(NoAuthority),
            Trash::new(temp.path().join("trash"), TrashLayout::Holding),
        );
        let destination = temp.path().join("Installed.app");

        ops.copy(source.path(), &destination).unwrap();
        let first = bundle_digest(&destination).unwrap();
        ops.copy(source.path(), &destination).unwrap();
        let second = bundle_digest(&destination).unwrap();

        prop_assert_eq!(first, second);
        prop_assert_eq!(first, bundle_digest(source.path()).unwrap());
    }
}

// =============================================================================
// Version ordering
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// compare(a, b) is the reverse of compare(b, a).
    #[test]
    fn prop_standard_comparator_antisymmetric(a in arb_version_string(), b in arb_version_string()) {
        let comparator = StandardVersionComparator;
        prop_assert_eq!(
            comparator.compare_versions(&a, &b),
            comparator.compare_versions(&b, &a).reverse()
        );
    }

    /// Every version equals itself.
    #[test]
    fn prop_standard_comparator_reflexive(a in arb_version_string()) {
        prop_assert_eq!(StandardVersionComparator.compare_versions(&a, &a), Ordering::Equal);
    }

    /// Appending a numeric component makes a version newer.
    #[test]
    fn prop_numeric_extension_is_newer(base in arb_numeric_version(), extra in 0u32..100) {
        let extended = format!("{}.{}", base, extra);
        prop_assert_eq!(
            StandardVersionComparator.compare_versions(&base, &extended),
            Ordering::Less
        );
    }

    /// Appending a pre-release suffix makes a version older.
    #[test]
    fn prop_prerelease_suffix_is_older(base in arb_numeric_version(), tag in "(a|b|rc|beta)", n in 0u32..10) {
        let prerelease = format!("{}{}{}", base, tag, n);
        prop_assert_eq!(
            StandardVersionComparator.compare_versions(&prerelease, &base),
            Ordering::Less
        );
    }

    /// A pre-release stays older than its base written with a trailing
    /// separator, which compares equal to the base.
    #[test]
    fn prop_prerelease_older_than_trailing_separator(base in arb_numeric_version(), tag in "(a|b|rc|beta)", n in 0u32..10) {
        let prerelease = format!("{}{}{}", base, tag, n);
        let trailing = format!("{}.", base);
        prop_assert_eq!(
            StandardVersionComparator.compare_versions(&trailing, &base),
            Ordering::Equal
        );
        prop_assert_eq!(
            StandardVersionComparator.compare_versions(&prerelease, &trailing),
            Ordering::Less
        );
    }

    /// The semver comparator agrees with semver precedence.
    #[test]
    fn prop_semver_comparator_matches_semver(a in arb_semver(), b in arb_semver()) {
        prop_assert_eq!(
            SemverComparator.compare_versions(&a.to_string(), &b.to_string()),
            a.cmp(&b)
        );
    }
}
