use thiserror::Error;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("BSON encode error: {0}")]
    BsonEncode(#[from] bson::ser::Error),

    #[error("BSON decode error: {0}")]
    BsonDecode(#[from] bson::de::Error),

    #[error("invalid reply: {0}")]
    InvalidReply(String),

    #[error("command failed with code {code}: {message}")]
    Command { code: i32, message: String },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("authentication error: {0}")]
    Auth(String),
}

pub type Result<T> = std::result::Result<T, WireError>;
