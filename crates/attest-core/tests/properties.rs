//! Property-Based Tests for signing and attestation transport
//!
//! These tests check laws that must hold for arbitrary inputs:
//! 1. A signature verifies under its own key and yields the signed message
//! 2. Flipping any single bit of a signature makes verification fail
//! 3. Decomposing an attestation and reassembling it is byte-identical
//! 4. An attester's verdict is a pure function of the facts it is shown

use std::sync::Arc;

use proptest::prelude::*;

use attest_core::occurrence::attester_note_name;
use attest_core::{
    AnalysisStatus, AttestRequest, AttestationMessage, Attester, Occurrence, RegoPolicy, Signer,
};

// =============================================================================
// SIGNATURES
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Every message signs and verifies back to itself
    #[test]
    fn prop_sign_verify_round_trip(message in prop::collection::vec(any::<u8>(), 0..512)) {
        let signer = Signer::generate("prop");
        let signed = signer.sign(&message).unwrap();

        prop_assert_eq!(signer.verify(&signed).unwrap(), message);
    }

    /// Any single-bit corruption of the encoded signature is rejected
    #[test]
    fn prop_single_bit_flip_fails(
        message in "[a-z0-9./:@-]{1,64}",
        position in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let signer = Signer::generate("prop");
        let mut signed = signer.sign(message.as_bytes()).unwrap();

        let index = position.index(signed.len());
        signed[index] ^= 1 << bit;

        prop_assert!(
            signer.verify(&signed).is_err(),
            "flipping bit {} of byte {} still verified",
            bit,
            index
        );
    }

    /// Key IDs depend only on key material
    #[test]
    fn prop_restored_signer_keeps_identity(name in "[a-z]{1,16}") {
        let signer = Signer::generate(name.clone());
        let restored = Signer::from_serialized(&signer.serialize_keys().unwrap()).unwrap();

        prop_assert_eq!(restored.key_id(), signer.key_id());
        prop_assert_eq!(restored.name(), name.as_str());
    }
}

// =============================================================================
// ATTESTATION MESSAGES
// =============================================================================

proptest! {
    /// Reassembly reproduces the persisted occurrence exactly
    #[test]
    fn prop_decomposition_round_trip(
        uri in "[a-z0-9./-]{1,40}@sha256:[0-9a-f]{64}",
        attester in "[a-z][a-z0-9-]{0,20}",
        signature in prop::collection::vec(any::<u8>(), 1..128),
        key_id in "[0-9A-F]{40}",
        name in prop::option::of("[a-z0-9-]{1,36}"),
    ) {
        let mut occurrence =
            Occurrence::attestation(uri, attester_note_name(&attester), signature, key_id);
        if let Some(name) = name {
            occurrence.name = format!("projects/attest-gate/occurrences/{}", name);
        }
        let original = occurrence.to_bytes().unwrap();

        let wire = AttestationMessage::from_occurrence(&occurrence)
            .unwrap()
            .to_bytes()
            .unwrap();
        let restored = AttestationMessage::from_bytes(&wire)
            .unwrap()
            .into_occurrence()
            .unwrap();

        prop_assert_eq!(restored.to_bytes().unwrap(), original);
        prop_assert_eq!(restored, occurrence);
    }
}

// =============================================================================
// ATTESTER VERDICTS
// =============================================================================

const SCAN_POLICY: &str = r#"
package scan

import rego.v1

violation contains result if {
	not analysis_succeeded
	result := {"msg": "image analysis did not succeed"}
}

analysis_succeeded if {
	some occurrence in input.occurrences
	occurrence.discovered.discovered.analysisStatus == "FINISHED_SUCCESS"
}
"#;

fn status_strategy() -> impl Strategy<Value = AnalysisStatus> {
    prop_oneof![
        Just(AnalysisStatus::Pending),
        Just(AnalysisStatus::Scanning),
        Just(AnalysisStatus::FinishedSuccess),
        Just(AnalysisStatus::FinishedFailed),
        Just(AnalysisStatus::FinishedUnsupported),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Attestation succeeds iff some scan finished successfully, and
    /// repeating the request gives the same verdict
    #[test]
    fn prop_verdict_follows_facts(statuses in prop::collection::vec(status_strategy(), 0..6)) {
        let policy = RegoPolicy::new("scan", SCAN_POLICY, false).unwrap();
        let attester = Attester::new("scan", Box::new(policy), Arc::new(Signer::generate("scan")));

        let uri = "repo/img@sha256:abc";
        let request = AttestRequest {
            resource_uri: uri.into(),
            occurrences: statuses
                .iter()
                .map(|status| Occurrence::discovery(uri, "notes/scan", *status))
                .collect(),
        };
        let expect_clean = statuses.contains(&AnalysisStatus::FinishedSuccess);

        for _ in 0..2 {
            match attester.attest(&request) {
                Ok(response) => {
                    prop_assert!(expect_clean);
                    prop_assert_eq!(response.attestation.resource_uri(), uri);
                    prop_assert!(attester.verify(&response.attestation).is_ok());
                }
                Err(err) => {
                    prop_assert!(!expect_clean);
                    prop_assert!(err.is_violation());
                }
            }
        }
    }
}
