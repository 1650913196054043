/// Failure taxonomy shared by every stage.
///
/// Pure stages return this type directly; the I/O layers wrap it in
/// `anyhow::Error`, from which callers can recover it with
/// `downcast_ref::<PipelineError>()`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    /// Malformed or unexpected input rows (unknown trade side, duplicate or
    /// out-of-order bars, non-positive prices).
    #[error("data error: {0}")]
    Data(String),

    /// Invalid stage parameters.
    #[error("config error: {0}")]
    Config(String),

    /// A required upstream table or column is absent.
    #[error("missing dependency: {artifact} (run the `{stage}` stage first)")]
    MissingDependency { artifact: String, stage: &'static str },
}

impl PipelineError {
    pub fn data(message: impl Into<String>) -> Self {
        Self::Data(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn missing(artifact: impl Into<String>, stage: &'static str) -> Self {
        Self::MissingDependency {
            artifact: artifact.into(),
            stage,
        }
    }
}

pub type StageResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_dependency_names_artifact_and_stage() {
        let err = PipelineError::missing("fut_max_ret_4h", "label");
        let msg = err.to_string();
        assert!(msg.contains("fut_max_ret_4h"));
        assert!(msg.contains("`label`"));
    }

    #[test]
    fn errors_survive_an_anyhow_round_trip() {
        let wrapped: anyhow::Error = PipelineError::config("empty imbalance grid").into();
        let recovered = wrapped
            .downcast_ref::<PipelineError>()
            .expect("pipeline error should downcast");
        assert!(matches!(recovered, PipelineError::Config(_)));
    }
}
