//! The box wire protocol shared by the host and its workers.
//!
//! Messages travel as *boxes*: ordered key/value string pairs with 2-byte
//! big-endian length prefixes, terminated by a zero-length key. Requests
//! carry a command name and, when an answer is required, a correlation id;
//! responses echo the correlation id with either the declared response
//! fields or an error kind and message.
//!
//! ## Components
//!
//! - [`boxes`]: framing — encoder and the incremental [`boxes::BoxParser`]
//! - [`command`]: typed command descriptors and field encoding
//! - [`builtin`]: the commands every worker answers

pub mod boxes;
pub mod builtin;
pub mod command;

pub use boxes::{BoxFields, BoxParser, MAX_BOX_SIZE, MAX_KEY_LEN, encode_box, write_box};
pub use command::{Command, Field, FieldKind, FieldValue, FieldValues};
