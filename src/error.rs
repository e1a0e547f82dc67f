use elgamal_shuffle_lib::ShuffleError;
use thiserror::Error;
use tonic::Status;

#[derive(Debug, Error)]
pub enum MixError {
    #[error("transport failure: {0}")]
    Transport(#[from] Status),

    #[error("connect failure: {0}")]
    Connect(#[from] tonic::transport::Error),

    #[error("authenticated open failed at round {round}, position {position}")]
    CryptoOpen { round: u64, position: usize },

    #[error("shuffle proof from server {sid} rejected")]
    ShuffleProof { sid: usize },

    #[error("client {0} already registered")]
    RegistrationCollision(u32),

    #[error("protocol sequence violation: {0}")]
    ProtocolSequence(String),

    #[error("rendezvous deadline exceeded")]
    Deadline,

    #[error(transparent)]
    Shuffle(#[from] ShuffleError),
}

impl MixError {
    pub(crate) fn closed() -> MixError {
        MixError::ProtocolSequence("pipeline channel closed".into())
    }
}

impl From<MixError> for Status {
    fn from(err: MixError) -> Status {
        match err {
            MixError::Transport(status) => status,
            MixError::Connect(e) => Status::unavailable(e.to_string()),
            MixError::CryptoOpen { .. } => Status::invalid_argument(err.to_string()),
            MixError::ShuffleProof { .. } => Status::failed_precondition(err.to_string()),
            MixError::RegistrationCollision(_) => Status::already_exists(err.to_string()),
            MixError::ProtocolSequence(_) => Status::failed_precondition(err.to_string()),
            MixError::Deadline => Status::deadline_exceeded(err.to_string()),
            MixError::Shuffle(_) => Status::invalid_argument(err.to_string()),
        }
    }
}
