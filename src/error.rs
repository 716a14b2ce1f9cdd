use thiserror::Error;

/// Failures the front end reports as input errors rather than crashes.
#[derive(Debug, Error)]
pub enum GapiError {
    #[error("could not find API {0}")]
    ApiNotFound(String),

    #[error("couldn't load API {0}")]
    EmptyApi(String),

    #[error("could not find requested method {0}")]
    MethodNotFound(String),

    #[error("missing required parameter {0}")]
    MissingParameter(String),

    #[error("unable to convert {value} to type {kind}")]
    Conversion { value: String, kind: String },

    #[error("method {0} doesn't require auth")]
    NoAuthRequired(String),
}
