use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostSyncError {
    #[error("store error: {0}")]
    Store(String),

    #[error("changeset not found: {0}")]
    ChangesetNotFound(i64),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
