//! Wire format for the memcached meta text protocol: request encoding and
//! streaming response parsing.

pub mod parser;
pub mod request;

pub use parser::{Flag, Response, Status};
pub use request::{Command, Key, Request, MAX_KEY_LEN, MAX_OPAQUE_LEN};
