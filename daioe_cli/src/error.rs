use daioe::error::DaioeError;

#[derive(thiserror::Error, Debug)]
pub enum DaioeCliError {
    #[error("{0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("{0}")]
    DaioeError(#[from] DaioeError),
}

pub type DaioeCliResult<T> = Result<T, DaioeCliError>;
