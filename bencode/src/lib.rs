#![allow(unused)]

// Convention from https://serde.rs/conventions.html
mod encode;
mod decode;
mod error;
mod token;

pub use decode::{decode_bytes, decode_str};
pub use encode::{encode_to_raw, encode_to_string};
pub use error::{Error, Result};
pub use token::Token;
