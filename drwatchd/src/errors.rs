use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {

    /* encapsulate a kube-rust error, the API server refusing a patch included */
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),

    #[error("unable to load kubeconfig: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error("unable to infer kube config: {0}")]
    InferConfig(#[from] kube::config::InferConfigError),

    /* one side of a diff could not be turned into a document */
    #[error("failed to marshal {side} object: {source}")]
    Serialization {
	side: &'static str,
	source: serde_json::Error,
    },

    #[error("failed to create patch: {0}")]
    Patch(#[from] PatchError),

    #[error("object cannot be addressed: {0}")]
    Unaddressable(String),
}

/*
 * Failures of the two-way merge patch engine, keyed by the dotted path of the
 * field where the documents stopped making sense.
 */
#[derive(Error, Debug, PartialEq)]
pub enum PatchError {

    #[error("{path}: expected {expected}, found {found}")]
    TypeMismatch {
	path: String,
	expected: &'static str,
	found: &'static str,
    },

    #[error("{path}: list element has no merge key `{key}`")]
    MissingMergeKey {
	path: String,
	key: String,
    },

    #[error("{path}: merge key `{key}` = {value} appears more than once")]
    DuplicateMergeKey {
	path: String,
	key: String,
	value: String,
    },

    #[error("{path}: expected a list of scalars")]
    NonPrimitive {
	path: String,
    },

    #[error("invalid patch at {path}: {reason}")]
    InvalidPatch {
	path: String,
	reason: String,
    },
}
