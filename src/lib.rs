#![forbid(unsafe_code)]
pub mod error;
pub mod message;
pub mod module;
pub(crate) mod scalar;
pub mod tagbase;
pub mod types;


pub use error::{Error, Result};
pub use tagbase::{TagDatabase, TagIndex};
pub use types::{BaseType, TagType, TypeRegistry};

/// Longest allowed tag, datatype, or member name.
pub const TAGNAME_SIZE: usize = 32;

/// Checks a tag or datatype name: ASCII, at most [`TAGNAME_SIZE`]
/// characters, a letter or underscore first, letters, digits, and
/// underscores after that.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.len() > TAGNAME_SIZE {
        log::error!("{name:?} is longer than {TAGNAME_SIZE} characters");
        return Err(Error::TooBig("name is too long"));
    }
    let mut bytes = name.bytes();
    let valid_first =
        matches!(bytes.next(), Some(c) if c.is_ascii_alphabetic() || c == b'_');
    let valid_rest = bytes.all(|c| c.is_ascii_alphanumeric() || c == b'_');
    if !valid_first || !valid_rest {
        log::error!("{name:?} is not a valid name");
        return Err(Error::Arg("malformed name"));
    }
    Ok(())
}
