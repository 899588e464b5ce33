use thiserror::Error;

/// Fatal problems with an input record.
///
/// Any of these stops the conversion. The one recoverable case, a track event
/// naming an undeclared track, is not an error and is reported through
/// [`crate::encoder::Encoded::Skipped`] instead.
#[derive(Debug, Error, PartialEq)]
pub enum EncodeError {
    #[error("record must be a JSON array, got {0}")]
    NotAnArray(String),

    #[error(
        "expected a name and a value for every entry after the record type, got {0} trailing fields"
    )]
    UnpairedFields(usize),

    #[error("'{0}' is not a valid record type, valid types are: track_descriptor, track_event, call_stack")]
    UnknownRecordKind(String),

    #[error("unexpected track descriptor type '{0}', valid types are: name, thread_name, counter")]
    UnknownDescriptorKind(String),

    #[error("expected {expected} fields for {record}, got {got}")]
    FieldCount {
        record: &'static str,
        expected: &'static str,
        got: usize,
    },

    #[error("expected field {position} of {record} to be '{expected}', got '{got}'")]
    UnexpectedKey {
        record: &'static str,
        position: usize,
        expected: &'static str,
        got: String,
    },

    #[error("{record} must have a '{key}'")]
    MissingKey {
        record: &'static str,
        key: &'static str,
    },

    #[error("invalid value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    #[error("{key} must be one of: {valid}, got '{value}'")]
    InvalidEnum {
        key: &'static str,
        value: String,
        valid: &'static str,
    },

    #[error("can't find parent track descriptor with name '{0}'")]
    UnknownParent(String),

    #[error("track event must have either a pid and tid or a track_name")]
    NoTrack,
}

pub type Result<T> = std::result::Result<T, EncodeError>;
