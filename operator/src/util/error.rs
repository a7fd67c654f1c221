#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("Json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("Parse duration: {source}")]
    ParseDuration {
        #[from]
        source: parse_duration::parse::Error,
    },

    #[error("Invalid user input: {0}")]
    UserInput(String),

    #[error("Terminal failure: {0}")]
    Terminal(String),

    #[error("Exec failure: {0}")]
    Exec(String),
}

impl Error {
    /// True for failures that should not be retried automatically — the
    /// caller is expected to surface them as a `Results[]` entry instead.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::Terminal(_) | Error::Exec(_))
    }
}
