use super::{
    parse_combiner, vocabulary_from_workspace, EmbeddingType, HybridEmbeddingParam,
    SparseEmbedding,
};
use crate::error::{EmbeddingError, Result};
use crate::optim::{OptHyperParams, OptParams, OptimizerType, UpdateType};
use serde::de::DeserializeOwned;
use serde_json::Value;

fn has_key(j: &Value, key: &str) -> bool {
    j.get(key).is_some()
}

fn get_json<'a>(j: &'a Value, key: &str) -> Result<&'a Value> {
    j.get(key)
        .ok_or_else(|| EmbeddingError::wrong_input(format!("Cannot find key: {key}")))
}

fn get_value<T: DeserializeOwned>(j: &Value, key: &str) -> Result<T> {
    let value = get_json(j, key)?;
    serde_json::from_value(value.clone())
        .map_err(|e| EmbeddingError::wrong_input(format!("Invalid value for {key}: {e}")))
}

fn get_value_soft<T: DeserializeOwned>(j: &Value, key: &str, default: T) -> Result<T> {
    if has_key(j, key) {
        get_value(j, key)
    } else {
        Ok(default)
    }
}

fn optimizer_from_json(j_optimizer: &Value) -> Result<OptParams> {
    let optimizer_type: OptimizerType = get_value::<String>(j_optimizer, "type")?.parse()?;
    let update_type: UpdateType = get_value::<String>(j_optimizer, "update_type")?.parse()?;
    let learning_rate = get_value_soft(j_optimizer, "learning_rate", OptParams::DEFAULT_LR)?;

    let hyperparams = match optimizer_type {
        OptimizerType::Ftrl => {
            let h = get_json(j_optimizer, "ftrl_hparam")?;
            OptHyperParams::Ftrl {
                beta: get_value(h, "beta")?,
                lambda1: get_value(h, "lambda1")?,
                lambda2: get_value(h, "lambda2")?,
            }
        }
        OptimizerType::Adam => {
            let h = get_json(j_optimizer, "adam_hparam")?;
            OptHyperParams::Adam {
                beta1: get_value(h, "beta1")?,
                beta2: get_value(h, "beta2")?,
                epsilon: get_value(h, "epsilon")?,
            }
        }
        OptimizerType::AdaGrad => {
            let h = get_json(j_optimizer, "adagrad_hparam")?;
            OptHyperParams::AdaGrad {
                initial_accu_value: get_value(h, "initial_accu_value")?,
                epsilon: get_value(h, "epsilon")?,
            }
        }
        OptimizerType::MomentumSgd => {
            let h = get_json(j_optimizer, "momentum_sgd_hparam")?;
            OptHyperParams::MomentumSgd {
                factor: get_value(h, "momentum_factor")?,
            }
        }
        OptimizerType::Nesterov => {
            let h = get_json(j_optimizer, "nesterov_hparam")?;
            OptHyperParams::Nesterov {
                mu: get_value(h, "momentum_factor")?,
            }
        }
        OptimizerType::Sgd => {
            let h = get_json(j_optimizer, "sgd_hparam")?;
            OptHyperParams::Sgd {
                atomic_update: get_value(h, "atomic_update")?,
            }
        }
    };

    OptParams::from_parts(optimizer_type, hyperparams, learning_rate, update_type)
}

fn hybrid_param_from_json(j_hparam: &Value) -> Result<HybridEmbeddingParam> {
    let defaults = HybridEmbeddingParam::default();
    let communication_type = get_value_soft(
        j_hparam,
        "communication_type",
        defaults.communication_type.as_str().to_string(),
    )?
    .parse()?;
    let hybrid_embedding_type =
        get_value_soft(j_hparam, "hybrid_embedding_type", "Distributed".to_string())?.parse()?;

    Ok(HybridEmbeddingParam {
        max_num_frequent_categories: get_value_soft(
            j_hparam,
            "max_num_frequent_categories",
            defaults.max_num_frequent_categories,
        )?,
        max_num_infrequent_samples: get_value_soft(
            j_hparam,
            "max_num_infrequent_samples",
            defaults.max_num_infrequent_samples,
        )?,
        p_dup_max: get_value_soft(j_hparam, "p_dup_max", defaults.p_dup_max)?,
        max_all_reduce_bandwidth: get_value_soft(
            j_hparam,
            "max_all_reduce_bandwidth",
            defaults.max_all_reduce_bandwidth,
        )?,
        max_all_to_all_bandwidth: get_value_soft(
            j_hparam,
            "max_all_to_all_bandwidth",
            defaults.max_all_to_all_bandwidth,
        )?,
        efficiency_bandwidth_ratio: get_value_soft(
            j_hparam,
            "efficiency_bandwidth_ratio",
            defaults.efficiency_bandwidth_ratio,
        )?,
        communication_type,
        hybrid_embedding_type,
    })
}

pub(super) fn sparse_embedding_from_json(j: &Value) -> Result<SparseEmbedding> {
    let bottom_name: String = get_value(j, "bottom")?;
    let top_name: String = get_value(j, "top")?;
    let embedding_type: EmbeddingType = get_value::<String>(j, "type")?.parse()?;
    let j_hparam = get_json(j, "sparse_embedding_hparam")?;

    if !has_key(j_hparam, "workspace_size_per_gpu_in_mb") && !has_key(j_hparam, "slot_size_array")
    {
        return Err(EmbeddingError::wrong_input(
            "need workspace_size_per_gpu_in_mb or slot_size_array",
        ));
    }
    let workspace_size_per_gpu_in_mb: usize =
        get_value_soft(j_hparam, "workspace_size_per_gpu_in_mb", 0)?;
    let embedding_vec_size: usize = get_value(j_hparam, "embedding_vec_size")?;
    let combiner = parse_combiner(&get_value::<String>(j_hparam, "combiner")?)?;
    let slot_size_array: Vec<usize> = get_value_soft(j_hparam, "slot_size_array", Vec::new())?;

    let embedding_opt_params = match j.get("optimizer") {
        Some(j_optimizer) => Some(optimizer_from_json(j_optimizer)?),
        None => None,
    };
    let hybrid_embedding_param = hybrid_param_from_json(j_hparam)?;

    let embedding = SparseEmbedding {
        embedding_type,
        workspace_size_per_gpu_in_mb,
        max_vocabulary_size_per_gpu: vocabulary_from_workspace(
            workspace_size_per_gpu_in_mb,
            embedding_vec_size,
        )?,
        embedding_vec_size,
        combiner,
        sparse_embedding_name: top_name,
        bottom_name,
        slot_size_array,
        embedding_opt_params,
        hybrid_embedding_param,
    };
    embedding.validate()?;
    Ok(embedding)
}

#[cfg(test)]
mod tests {
    use crate::config::{Combiner, CommunicationType, EmbeddingType, SparseEmbedding};
    use crate::error::ErrorKind;
    use crate::optim::{OptHyperParams, UpdateType};
    use serde_json::json;

    fn entry() -> serde_json::Value {
        json!({
            "type": "DistributedSlotSparseEmbeddingHash",
            "bottom": "data1",
            "top": "sparse_embedding1",
            "sparse_embedding_hparam": {
                "workspace_size_per_gpu_in_mb": 2,
                "embedding_vec_size": 64,
                "combiner": "sum"
            }
        })
    }

    #[test]
    fn test_parse_minimal() {
        let e = SparseEmbedding::from_json(&entry()).unwrap();
        assert_eq!(
            e.embedding_type,
            EmbeddingType::DistributedSlotSparseEmbeddingHash
        );
        assert_eq!(e.bottom_name, "data1");
        assert_eq!(e.sparse_embedding_name, "sparse_embedding1");
        assert_eq!(e.max_vocabulary_size_per_gpu, 8192);
        assert_eq!(e.combiner, Combiner::Sum);
        assert!(e.embedding_opt_params.is_none());
    }

    #[test]
    fn test_unknown_type_names_offender() {
        let mut j = entry();
        j["type"] = json!("FooEmbedding");
        let err = SparseEmbedding::from_json(&j).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WrongInput);
        assert!(err.to_string().contains("FooEmbedding"));
    }

    #[test]
    fn test_missing_required_key() {
        let mut j = entry();
        j.as_object_mut().unwrap().remove("bottom");
        let err = SparseEmbedding::from_json(&j).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WrongInput);
        assert!(err.to_string().contains("bottom"));
    }

    #[test]
    fn test_missing_capacity() {
        let mut j = entry();
        j["sparse_embedding_hparam"]
            .as_object_mut()
            .unwrap()
            .remove("workspace_size_per_gpu_in_mb");
        let err = SparseEmbedding::from_json(&j).unwrap_err();
        assert!(err.to_string().contains("workspace_size_per_gpu_in_mb"));
    }

    #[test]
    fn test_bad_combiner() {
        let mut j = entry();
        j["sparse_embedding_hparam"]["combiner"] = json!("max");
        assert_eq!(
            SparseEmbedding::from_json(&j).unwrap_err().kind(),
            ErrorKind::WrongInput
        );
    }

    #[test]
    fn test_optimizer_block() {
        let mut j = entry();
        j["optimizer"] = json!({
            "type": "Adam",
            "update_type": "Global",
            "learning_rate": 0.01,
            "adam_hparam": { "beta1": 0.9, "beta2": 0.999, "epsilon": 1e-7 }
        });
        let e = SparseEmbedding::from_json(&j).unwrap();
        let opt = e.embedding_opt_params.unwrap();
        assert_eq!(opt.update_type, UpdateType::Global);
        assert!((opt.learning_rate - 0.01).abs() < 1e-9);
        assert!(matches!(opt.hyperparams, OptHyperParams::Adam { .. }));
    }

    #[test]
    fn test_optimizer_unknown_names() {
        let mut j = entry();
        j["optimizer"] = json!({ "type": "Lion", "update_type": "Local" });
        let err = SparseEmbedding::from_json(&j).unwrap_err();
        assert!(err.to_string().contains("Lion"));

        j["optimizer"] = json!({
            "type": "SGD",
            "update_type": "Sometimes",
            "sgd_hparam": { "atomic_update": true }
        });
        let err = SparseEmbedding::from_json(&j).unwrap_err();
        assert!(err.to_string().contains("Sometimes"));
    }

    #[test]
    fn test_optimizer_missing_hparam_block() {
        let mut j = entry();
        j["optimizer"] = json!({ "type": "Ftrl", "update_type": "Local" });
        let err = SparseEmbedding::from_json(&j).unwrap_err();
        assert!(err.to_string().contains("ftrl_hparam"));
    }

    #[test]
    fn test_hybrid_defaults_and_overrides() {
        let mut j = entry();
        j["type"] = json!("HybridSparseEmbedding");
        j["sparse_embedding_hparam"]["max_num_frequent_categories"] = json!(16);
        j["sparse_embedding_hparam"]["communication_type"] = json!("NVLink_SingleNode");
        let e = SparseEmbedding::from_json(&j).unwrap();
        let h = &e.hybrid_embedding_param;
        assert_eq!(h.max_num_frequent_categories, 16);
        assert_eq!(h.max_num_infrequent_samples, -1);
        assert_eq!(h.communication_type, CommunicationType::NvlinkSingleNode);
        assert!((h.p_dup_max - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_unknown_communication_type() {
        let mut j = entry();
        j["sparse_embedding_hparam"]["communication_type"] = json!("Carrier_Pigeon");
        let err = SparseEmbedding::from_json(&j).unwrap_err();
        assert!(err.to_string().contains("Carrier_Pigeon"));
    }

    #[test]
    fn test_slot_size_array_only() {
        let j = json!({
            "type": "LocalizedSlotSparseEmbeddingOneHot",
            "bottom": "data1",
            "top": "emb",
            "sparse_embedding_hparam": {
                "slot_size_array": [10, 20, 30],
                "embedding_vec_size": 16,
                "combiner": "mean"
            }
        });
        let e = SparseEmbedding::from_json(&j).unwrap();
        assert_eq!(e.slot_size_array, vec![10, 20, 30]);
        assert_eq!(e.workspace_size_per_gpu_in_mb, 0);
        assert_eq!(e.combiner, Combiner::Mean);
    }
}
