use crate::error::{EmbeddingError, Result};

/// Global agreement on an iteration count.
///
/// Every GPU reports the iteration it has observed; a state transition that changes key
/// ownership may only happen when all of them agree. Returns the agreed iteration.
pub fn agree_on_iteration(observed: &[u64]) -> Result<u64> {
    let Some(&first) = observed.first() else {
        return Err(EmbeddingError::UnspecificError(
            "rendezvous without participants".to_string(),
        ));
    };
    if let Some((gpu, &other)) = observed.iter().enumerate().find(|(_, &it)| it != first) {
        return Err(EmbeddingError::UnspecificError(format!(
            "GPU {gpu} observed iteration {other} while GPU 0 observed {first}"
        )));
    }
    Ok(first)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agreement() {
        assert_eq!(agree_on_iteration(&[4, 4, 4]).unwrap(), 4);
    }

    #[test]
    fn test_divergence_is_fatal() {
        let err = agree_on_iteration(&[4, 5, 4]).unwrap_err();
        assert!(err.to_string().contains("GPU 1"));
        assert!(agree_on_iteration(&[]).is_err());
    }
}
