//! Quill Core: leaf building blocks of the Quill scripting language
//!
//! This crate has no knowledge of script values or evaluation. It provides:
//! - `codec`: little-endian binary `Writer`/`Reader` with protocol versions
//! - `time`: UTC date-times with an optional high-resolution component
//! - `audience`: ordered observer lists with synchronous delivery
//! - `token`/`lex`: the pooled token buffer and the source tokenizer

pub mod audience;
pub mod codec;
pub mod lex;
pub mod time;
pub mod token;

pub use audience::{Audience, ObserverId};
pub use codec::{CodecError, ProtocolVersion, Reader, Writer};
pub use lex::{is_keyword, tokenize, tokenize_into};
pub use time::Time;
pub use token::{Token, TokenBuffer, TokenKind, TokenRange};
