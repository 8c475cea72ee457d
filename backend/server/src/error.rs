use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::{error, warn};

use crate::{
    checkpoint::ToggleError,
    page::{NOBODY, render},
    store::StoreError,
};

/// Failure of one scan. Always answered with a rendered page.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Whoa...couldn't process {nfcid}. Please try again.")]
    Backend {
        nfcid: String,
        #[source]
        source: StoreError,
    },

    #[error("Whoa...stored status for {nfcid} is corrupted, please ask staff for help. ({reason})")]
    Invariant { nfcid: String, reason: String },

    #[error("Whoa...your stay for {nfcid} came out negative, please ask staff for help.")]
    NegativeDuration { nfcid: String },
}

impl AppError {
    pub fn from_toggle(nfcid: &str, e: ToggleError) -> Self {
        match e {
            ToggleError::Store(source) => AppError::Backend {
                nfcid: nfcid.to_string(),
                source,
            },
            ToggleError::Invariant { nfcid, reason } => AppError::Invariant { nfcid, reason },
            ToggleError::NegativeDuration { nfcid, .. } => AppError::NegativeDuration { nfcid },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::Backend { ref nfcid, ref source } => {
                warn!("Couldn't process {nfcid}: {source}");
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Invariant { .. } | AppError::NegativeDuration { .. } => {
                error!("{self}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, render(NOBODY, &self.to_string())).into_response()
    }
}


/// Reasons the process can't start or keep serving.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error("Store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}
