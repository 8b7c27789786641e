//! Parser and serializer for the D-Bus wire format.
//!
//! This crate transforms between an in-memory tree of typed values
//! ([`Value`], described by [`Type`]) and the byte layout of the
//! D-Bus specification: aligned, length-prefixed, recursively typed,
//! in either little- or big-endian form. It is a wire codec only —
//! the authentication handshake, socket I/O and file-descriptor
//! transport, bus policy and message routing all live outside this
//! crate.
//!
//! Parsing is incremental and bounded-memory: the parser is a chain
//! of heap-allocated continuations driven through
//! [`parse::Parser`], so it can be fed straight from a socket in
//! chunks (a stationary 255-byte buffer is always sufficient) and a
//! malicious input cannot exhaust the host call stack however deeply
//! it nests. Serialization runs in two passes: a size pass resolves
//! the length prefix of every array, and an emit pass writes the
//! bytes.
//!
//! ```
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use dbus_wire::{decode, encode, Endianness, Type, Value};
//!
//! let v = Value::array(
//!     Type::Uint16,
//!     vec![1u16.into(), 2u16.into(), 3u16.into()],
//! )?;
//! let bytes = encode::value_to_bytes(Endianness::Little, &v)?;
//! assert_eq!(bytes, [6, 0, 0, 0, 1, 0, 2, 0, 3, 0]);
//!
//! let back = decode::value_from_bytes(Endianness::Little, &v.ty(), &bytes)?;
//! assert_eq!(back, v);
//! # Ok(())
//! # }
//! ```
//!
//! Whole messages carry a fixed header struct plus a body whose
//! element types come from the header's signature field:
//!
//! ```
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use dbus_wire::{Message, Value};
//!
//! let msg = Message::method_call(
//!     0x1001,
//!     "/org/freedesktop/DBus",
//!     "org.freedesktop.DBus",
//!     "org.freedesktop.DBus",
//!     "Hello",
//!     vec![],
//! )?;
//! let bytes = msg.to_bytes()?;
//! assert_eq!(Message::from_bytes(&bytes)?, msg);
//! # Ok(())
//! # }
//! ```

pub mod decode;
pub mod encode;
pub mod endian;
pub mod error;
pub mod message;
pub mod parse;
pub mod signature;
pub mod types;
pub mod value;

pub use crate::endian::Endianness;
pub use crate::error::{InvariantError, ParseError, ParseErrorKind};
pub use crate::message::{Message, MessageType};
pub use crate::signature::Signature;
pub use crate::types::Type;
pub use crate::value::Value;
