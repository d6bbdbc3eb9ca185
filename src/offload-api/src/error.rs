use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum Error {
    #[error("unknown procedure: {0}")]
    UnknownProcedure(String),
    #[error("the default manager handle has been released")]
    DefaultManagerReleased,
    #[error("no default manager has been set")]
    DefaultManagerUnset,
    #[error("job descriptor pool exhausted")]
    PoolExhausted,
    #[error("{0}")]
    Generic(String),
}
