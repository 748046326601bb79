//! Property-based tests for the delta protocol.
//!
//!  - apply(old, generate(old, new)) == new
//!  - optimizing a patch list never changes its effect and never grows it
//!  - compression round-trips exactly and passes small payloads through

use causeway_delta::{
    CompressionConfig, JsonPatch, PatchApplier, PatchCompressor, PatchGenerator, PatchOptimizer,
};
use proptest::prelude::*;
use serde_json::{json, Map, Value};

fn leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        (-50i64..50).prop_map(Value::from),
        "[a-z]{0,6}".prop_map(Value::from),
    ]
}

fn document() -> impl Strategy<Value = Value> {
    leaf().prop_recursive(4, 32, 5, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..5).prop_map(Value::Array),
            prop::collection::btree_map("[a-c~/]{1,2}", inner, 0..5)
                .prop_map(|entries| Value::Object(entries.into_iter().collect::<Map<_, _>>())),
        ]
    })
}

fn object_document() -> impl Strategy<Value = Value> {
    prop::collection::btree_map("[a-e]", document(), 0..5)
        .prop_map(|entries| Value::Object(entries.into_iter().collect()))
}

proptest! {
    #[test]
    fn diff_round_trips(old in document(), new in document()) {
        let patches = PatchGenerator::new().generate(&old, &new);
        let result = PatchApplier::new().apply(&old, &patches);
        prop_assert!(result.is_success(), "failed: {:?}", result.failed);
        prop_assert_eq!(result.state, new);
    }

    #[test]
    fn equal_documents_produce_no_patches(doc in document()) {
        prop_assert!(PatchGenerator::new().generate(&doc, &doc).is_empty());
    }

    #[test]
    fn optimize_preserves_effect(
        d0 in object_document(),
        d1 in object_document(),
        d2 in object_document(),
    ) {
        let generator = PatchGenerator::new();
        let mut patches = generator.generate(&d0, &d1);
        patches.extend(generator.generate(&d1, &d2));

        let optimized = PatchOptimizer::new().optimize(&patches);
        prop_assert!(optimized.len() <= patches.len());

        let applier = PatchApplier::new();
        let original = applier.apply(&d0, &patches);
        let folded = applier.apply(&d0, &optimized);
        prop_assert!(original.is_success());
        prop_assert!(folded.is_success(), "failed: {:?}", folded.failed);
        prop_assert_eq!(folded.state, original.state);
    }

    #[test]
    fn compression_round_trips(old in object_document(), new in object_document()) {
        let patches = PatchGenerator::new().generate(&old, &new);
        let compressor = PatchCompressor::with_config(CompressionConfig { threshold: 64, level: 6 });
        let packed = compressor.compress_patches(&patches).unwrap();
        prop_assert_eq!(compressor.decompress_patches(&packed).unwrap(), patches.clone());

        let text = serde_json::to_string(&patches).unwrap();
        if text.len() <= 64 {
            prop_assert!(!packed.compressed);
            prop_assert_eq!(packed.data, text);
        }
    }
}

#[test]
fn redundant_sequence_optimizes_to_net_effect() {
    let patches = vec![
        JsonPatch::add("/draft", json!("x")),
        JsonPatch::replace("/title", json!("one")),
        JsonPatch::replace("/draft", json!("y")),
        JsonPatch::replace("/title", json!("two")),
        JsonPatch::remove("/draft"),
        JsonPatch::replace("/title", json!("three")),
    ];
    let optimized = PatchOptimizer::new().optimize(&patches);
    // The draft add may overwrite a member, so it survives with its remove.
    assert_eq!(
        optimized,
        vec![
            JsonPatch::add("/draft", json!("y")),
            JsonPatch::remove("/draft"),
            JsonPatch::replace("/title", json!("three")),
        ]
    );

    let applier = PatchApplier::new();
    for doc in [json!({"title": "zero"}), json!({"title": "zero", "draft": "w"})] {
        assert_eq!(
            applier.apply(&doc, &patches).state,
            applier.apply(&doc, &optimized).state
        );
    }
}

#[test]
fn large_patch_list_is_compressed_and_restored() {
    let patches: Vec<JsonPatch> = (0..40)
        .map(|i| JsonPatch::add(format!("/records/{i}"), json!({"id": i, "status": "pending"})))
        .collect();
    let text = serde_json::to_string(&patches).unwrap();
    assert!(text.len() > 1024);

    let compressor = PatchCompressor::new();
    let packed = compressor.compress_patches(&patches).unwrap();
    assert!(packed.compressed);
    assert_eq!(compressor.decompress_patches(&packed).unwrap(), patches);
}
