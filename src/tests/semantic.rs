//! Tests against the real embedding model.
//!
//! These need the model download and are marked #[ignore] by default.
//! Run with: cargo test semantic -- --ignored

use std::sync::Arc;

use crate::profile::ProfileLocator;
use crate::semantic::{Embedder, FastEmbedder, SearchPipeline, DEFAULT_MODEL};
use crate::tests::fixtures::create_places_db;

#[test]
#[ignore = "requires model download (~23MB)"]
fn test_related_titles_rank_first_with_real_model() {
    let tmp = tempfile::tempdir().unwrap();
    let places = tmp.path().join("places.sqlite");
    create_places_db(
        &places,
        &[
            (1, Some("Learn Rust"), "https://rust-lang.org/learn"),
            (2, Some("Cooking recipes"), "https://food.example/recipes"),
            (3, Some("Systems programming"), "https://systems.example"),
        ],
    );

    let embedder = FastEmbedder::new(DEFAULT_MODEL, tmp.path().to_path_buf()).unwrap();
    let mut pipeline = SearchPipeline::new(
        Arc::new(embedder),
        ProfileLocator::from_roots(vec![]).with_override(Some(places)),
        tmp.path().join("data"),
    );

    pipeline.ensure_index_fresh().unwrap();

    let hits = pipeline.search("programming languages", 2).unwrap();
    let ids: Vec<u64> = hits.iter().map(|h| h.id).collect();
    assert!(ids.contains(&1));
    assert!(ids.contains(&3));
    assert!(!ids.contains(&2));
}

#[test]
#[ignore = "requires model download (~23MB)"]
fn test_embeddings_are_deterministic() {
    let tmp = tempfile::tempdir().unwrap();
    let embedder = FastEmbedder::new(DEFAULT_MODEL, tmp.path().to_path_buf()).unwrap();

    let first = embedder.embed("Rust programming guide").unwrap();
    let second = embedder.embed("Rust programming guide").unwrap();

    assert_eq!(first.len(), 384);
    assert_eq!(first, second);
    assert!(embedder.is_loaded());
}
