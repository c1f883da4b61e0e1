use serde_json::json;
use sparsectr::config::{Combiner, EmbeddingType, SolverConfig, SparseEmbedding};
use sparsectr::input::SlotEncoder;
use sparsectr::model::EmbeddingGraph;
use sparsectr::optim::{OptHyperParams, OptParams};
use sparsectr::resource::ResourceManager;
use sparsectr::ErrorKind;

fn sgd() -> OptParams {
    OptParams::new(OptHyperParams::Sgd { atomic_update: false }, 1.0)
}

fn graph(num_gpus: usize, batch_size: usize) -> EmbeddingGraph<u64> {
    let resource = ResourceManager::single_node(num_gpus, 2024).unwrap();
    let solver = SolverConfig {
        batch_size,
        batch_size_eval: batch_size,
        ..SolverConfig::default()
    };
    EmbeddingGraph::new(resource, solver, sgd()).unwrap()
}

#[test]
fn test_distributed_lookup_and_gradient() {
    let mut g = graph(4, 4);
    let input = g.add_sparse_input("data", 1, 4).unwrap();
    g.add_sparse_embedding(
        SparseEmbedding::new(
            EmbeddingType::DistributedSlotSparseEmbeddingHash,
            "data",
            "emb",
            64,
            Combiner::Sum,
        )
        .with_slot_size_array(vec![1000]),
    )
    .unwrap();

    SlotEncoder::new(4, 1, 4)
        .encode_into(
            &[vec![vec![5, 5, 9]], vec![vec![]], vec![vec![]], vec![vec![]]],
            &input.train,
        )
        .unwrap();

    let emb = g.embedding_mut("emb").unwrap();
    emb.forward(true).unwrap();
    let row5 = emb.read_row(5).unwrap();
    let row9 = emb.read_row(9).unwrap();
    {
        let out = emb.train_output_tensors()[0].read();
        assert_eq!(out.shape(), &[1, 1, 64]);
        for i in 0..64 {
            assert!((out.data()[i] - (2.0 * row5[i] + row9[i])).abs() < 1e-6);
        }
    }

    let top: Vec<f32> = (0..64).map(|i| i as f32 * 0.01).collect();
    for (gpu, t) in emb.train_output_tensors().iter().enumerate() {
        let mut t = t.write();
        if gpu == 0 {
            t.data_mut().copy_from_slice(&top);
        } else {
            t.data_mut().fill(0.0);
        }
    }
    emb.backward().unwrap();
    let wgrad = emb.accumulated_wgrad().unwrap();
    assert_eq!(wgrad.len(), 2);
    assert_eq!(wgrad[0].0, 5);
    assert_eq!(wgrad[1].0, 9);
    for i in 0..64 {
        assert!((wgrad[0].1[i] - 2.0 * top[i]).abs() < 1e-6);
        assert!((wgrad[1].1[i] - top[i]).abs() < 1e-6);
    }
}

#[test]
fn test_unknown_embedding_type_from_json() {
    let mut g = graph(2, 2);
    g.add_sparse_input("data", 1, 2).unwrap();
    let err = g
        .add_sparse_embedding_json(&json!({
            "type": "FooEmbedding",
            "bottom": "data",
            "top": "emb",
            "sparse_embedding_hparam": {
                "slot_size_array": [10],
                "embedding_vec_size": 16,
                "combiner": "mean"
            }
        }))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WrongInput);
    assert!(err.to_string().contains("FooEmbedding"));
    assert!(g.embeddings().is_empty());
}

#[test]
fn test_evaluation_reads_trained_rows() {
    let mut g = graph(2, 2);
    let input = g.add_sparse_input("data", 1, 2).unwrap();
    g.add_sparse_embedding(
        SparseEmbedding::new(
            EmbeddingType::DistributedSlotSparseEmbeddingHash,
            "data",
            "emb",
            8,
            Combiner::Mean,
        )
        .with_slot_size_array(vec![100]),
    )
    .unwrap();

    let encoder = SlotEncoder::new(2, 1, 2);
    encoder
        .encode_into(&[vec![vec![1]], vec![vec![2]]], &input.train)
        .unwrap();
    g.train_step(|_, _, grad| grad.data_mut().fill(0.5)).unwrap();

    encoder
        .encode_into(&[vec![vec![1]], vec![vec![42]]], &input.evaluate)
        .unwrap();
    g.evaluate().unwrap();
    let emb = g.embedding("emb").unwrap();
    let row1 = emb.read_row(1).unwrap();
    assert_eq!(emb.evaluate_output_tensors()[0].read().data(), row1.as_slice());
    // unseen key reads zeros and is not inserted
    assert_eq!(emb.evaluate_output_tensors()[1].read().data(), &[0.0; 8]);
    assert_eq!(emb.vocabulary_size(), 2);
}

#[test]
fn test_localized_hash_through_graph() {
    let mut g = graph(2, 2);
    let input = g.add_sparse_input("data", 3, 4).unwrap();
    g.add_sparse_embedding(
        SparseEmbedding::new(
            EmbeddingType::LocalizedSlotSparseEmbeddingHash,
            "data",
            "loc",
            4,
            Combiner::Sum,
        )
        .with_slot_size_array(vec![10, 20, 30]),
    )
    .unwrap();

    SlotEncoder::new(2, 3, 4)
        .encode_into(
            &[
                vec![vec![1, 2], vec![3], vec![4]],
                vec![vec![1], vec![], vec![5, 6]],
            ],
            &input.train,
        )
        .unwrap();
    let emb = g.embedding_mut("loc").unwrap();
    emb.forward(true).unwrap();
    let expect: Vec<f32> = {
        let r1 = emb.read_row(1).unwrap();
        let r2 = emb.read_row(2).unwrap();
        r1.iter().zip(&r2).map(|(a, b)| a + b).collect()
    };
    {
        let out = emb.train_output_tensors()[0].read();
        assert_eq!(out.shape(), &[1, 3, 4]);
        for (o, e) in out.data()[..4].iter().zip(&expect) {
            assert!((o - e).abs() < 1e-6);
        }
        // sample 1 slot 1 is empty
        assert_eq!(&emb.train_output_tensors()[1].read().data()[4..8], &[0.0; 4]);
    }
    assert_eq!(emb.vocabulary_size(), 6);

    for t in emb.train_output_tensors() {
        t.write().data_mut().fill(1.0);
    }
    emb.backward().unwrap();
    let wgrad = emb.accumulated_wgrad().unwrap();
    // key 1 is used once on each GPU
    assert_eq!(wgrad[0], (1, vec![2.0; 4]));
    assert_eq!(wgrad.len(), 6);
}

#[test]
fn test_one_hot_through_graph() {
    let mut g = graph(2, 2);
    let input = g.add_sparse_input("data", 2, 4).unwrap();
    g.add_sparse_embedding(
        SparseEmbedding::new(
            EmbeddingType::LocalizedSlotSparseEmbeddingOneHot,
            "data",
            "onehot",
            4,
            Combiner::Sum,
        )
        .with_slot_size_array(vec![5, 5]),
    )
    .unwrap();
    assert_eq!(g.embedding("onehot").unwrap().vocabulary_size(), 10);

    let encoder = SlotEncoder::new(2, 2, 4).with_slot_offsets(&[5, 5]).unwrap();
    encoder
        .encode_into(&[vec![vec![0], vec![4]], vec![vec![3], vec![0]]], &input.train)
        .unwrap();
    // slot 1 key 4 lands on global key 9
    let before = g.embedding("onehot").unwrap().read_row(9).unwrap();
    g.train_step(|_, _, grad| grad.data_mut().fill(1.0)).unwrap();
    let after = g.embedding("onehot").unwrap().read_row(9).unwrap();
    for (b, a) in before.iter().zip(&after) {
        assert!((b - 1.0 - a).abs() < 1e-6);
    }

    // two keys in one one-hot segment
    encoder
        .encode_into(&[vec![vec![0, 1], vec![4]], vec![vec![3], vec![0]]], &input.train)
        .unwrap();
    let err = g.train_step(|_, _, _| {}).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DataCheck);
}
