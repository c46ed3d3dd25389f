/// Errors produced by the tag database and its collaborators.
///
/// Every failure is reported to the caller; no operation leaves the
/// store partially mutated. Event delivery failures are the one
/// exception to propagation: the write that triggered the event still
/// succeeds and the `MsgSend` condition is only logged.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid argument: bad index, zero count, malformed name, or an
    /// event kind that does not apply to the datatype.
    #[error("invalid argument: {0}")]
    Arg(&'static str),
    /// A byte range falls outside the tag, or a name exceeds the limit.
    #[error("out of range: {0}")]
    TooBig(&'static str),
    /// The name is already in use with an incompatible definition.
    #[error("duplicate name {0:?}")]
    Duplicate(String),
    /// A tag, type, or subscription lookup failed.
    #[error("{0} not found")]
    NotFound(String),
    /// The type identifier does not resolve to a base type or a
    /// registered compound type.
    #[error("type {0:#010x} does not resolve")]
    BadType(u32),
    /// A fallible allocation was refused.
    #[error("allocation failure while growing {0}")]
    Alloc(&'static str),
    /// The caller does not own the subscription it tried to delete.
    #[error("caller does not own the subscription")]
    Auth,
    /// An event notification could not be delivered.
    #[error("event notification failed: {0}")]
    MsgSend(&'static str),
}

impl Error {
    /// Stable negative status code carried in wire replies.
    pub fn status_code(&self) -> i32 {
        match self {
            Error::Arg(_) => -1,
            Error::TooBig(_) => -2,
            Error::Duplicate(_) => -3,
            Error::NotFound(_) => -4,
            Error::BadType(_) => -5,
            Error::Alloc(_) => -6,
            Error::Auth => -7,
            Error::MsgSend(_) => -8,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
