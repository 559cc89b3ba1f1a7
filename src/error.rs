use thiserror::Error;

/// Failures while loading or validating the bridge configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    MissingEnv(String),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Entry {entry}: {reason}")]
    InvalidEntry { entry: String, reason: String },

    #[error("{0}")]
    Invalid(String),
}

/// The session task behind a device is gone.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("Device {0} is not running")]
    Closed(String),
}

/// Failures turning a host command into a dps write.
#[derive(Error, Debug, PartialEq)]
pub enum CommandError {
    #[error("Entity {0} does not accept commands")]
    NotWritable(String),

    #[error("DP {0} is read only")]
    ReadOnly(String),

    #[error("Invalid value '{value}' for {dp}")]
    InvalidValue { dp: String, value: String },

    #[error(transparent)]
    Device(#[from] DeviceError),
}
