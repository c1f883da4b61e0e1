use proptest::prelude::*;
use sparsectr::config::{
    Combiner, ConfigWarning, EmbeddingType, SolverConfig, SparseEmbedding,
};
use sparsectr::ErrorKind;

fn embedding(vec_size: usize) -> SparseEmbedding {
    SparseEmbedding::new(
        EmbeddingType::DistributedSlotSparseEmbeddingHash,
        "data",
        "emb",
        vec_size,
        Combiner::Sum,
    )
    .with_slot_size_array(vec![10])
}

proptest! {
    #[test]
    fn valid_vec_sizes_are_accepted(vec_size in 1usize..=1024) {
        let warnings = embedding(vec_size).validate().unwrap();
        if vec_size % 32 == 0 {
            prop_assert!(warnings.is_empty());
        } else {
            prop_assert_eq!(warnings, vec![ConfigWarning::VecSizeNotAligned { embedding_vec_size: vec_size }]);
        }
    }

    #[test]
    fn oversized_vec_sizes_are_rejected(vec_size in 1025usize..100_000) {
        let err = embedding(vec_size).validate().unwrap_err();
        prop_assert_eq!(err.kind(), ErrorKind::WrongInput);
    }

    #[test]
    fn batch_splits_evenly_or_fails(batch in 1usize..512, gpus in 1usize..9) {
        let solver = SolverConfig { batch_size: batch, batch_size_eval: batch, ..SolverConfig::default() };
        match solver.batch_size_per_gpu(gpus) {
            Ok((train, eval)) => {
                prop_assert_eq!(batch % gpus, 0);
                prop_assert_eq!(train * gpus, batch);
                prop_assert_eq!(eval * gpus, batch);
            }
            Err(e) => {
                prop_assert!(batch % gpus != 0);
                prop_assert_eq!(e.kind(), ErrorKind::WrongInput);
            }
        }
    }
}

#[test]
fn test_zero_vec_size_rejected() {
    let err = embedding(0).validate().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WrongInput);
}

#[test]
fn test_parse_hybrid_model_entry() {
    let e = SparseEmbedding::from_json_str(
        r#"{
            "type": "HybridSparseEmbedding",
            "bottom": "data",
            "top": "hybrid",
            "sparse_embedding_hparam": {
                "slot_size_array": [100, 200],
                "embedding_vec_size": 128,
                "combiner": "sum",
                "max_num_frequent_categories": 16,
                "communication_type": "NVLink_SingleNode"
            }
        }"#,
    )
    .unwrap();
    assert_eq!(e.embedding_type, EmbeddingType::HybridSparseEmbedding);
    assert_eq!(e.slot_size_array, vec![100, 200]);
    assert_eq!(e.hybrid_embedding_param.max_num_frequent_categories, 16);
}
