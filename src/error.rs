use std::fmt;

use thiserror::Error;

/// Structural failure while reading wire bytes.
///
/// Carries the absolute byte offset at which the failure was
/// detected. A parse error is not recoverable within a message;
/// callers should discard the parser instance.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("parse error at byte {pos}: {kind}")]
pub struct ParseError {
    /// Absolute byte offset of the failure.
    pub pos: usize,
    pub kind: ParseErrorKind,
}

impl ParseError {
    pub(crate) fn new(pos: usize, kind: ParseErrorKind) -> Self {
        ParseError { pos, kind }
    }

    /// Shift the error position by `base` bytes. Used when a parse
    /// ran over an embedded buffer (a signature string) whose start
    /// sits at `base` in the enclosing stream.
    pub(crate) fn offset(mut self, base: usize) -> Self {
        self.pos += base;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseErrorKind {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("leftover data: {0} bytes after the parsed value")]
    TrailingData(usize),

    #[error("byte position overflow")]
    PositionOverflow,

    #[error("Unexpected non-zero padding byte: {0:#04x}")]
    NonZeroPadding(u8),

    #[error("Boolean value that is not 0 or 1: {0}")]
    InvalidBoolean(u32),

    #[error("Array length integer overflow")]
    ArrayLengthOverflow,

    #[error("Incorrect array length")]
    IncorrectArrayLength,

    #[error("Signature length mismatch")]
    SignatureLengthMismatch,

    #[error("Invalid type character: {0:#04x}")]
    InvalidTypeChar(u8),

    #[error("Expected `}}`")]
    ExpectedCloseBrace,

    #[error("Unexpected `)`")]
    UnexpectedCloseParen,

    #[error("Unexpected `}}`")]
    UnexpectedCloseBrace,

    #[error("dict entry must contain exactly two types")]
    DictEntryArity,

    #[error("dict entry key must be a basic type")]
    NonBasicDictKey,

    #[error("empty struct type")]
    EmptyStruct,

    #[error("signature ends inside a container type")]
    UnterminatedContainer,

    #[error("invalid UTF-8 in string")]
    InvalidUtf8,

    #[error("string payload contains a NUL byte")]
    NulInString,

    #[error("invalid endianness marker: {0:#04x}")]
    InvalidEndianMarker(u8),

    #[error("invalid message type code: {0}")]
    InvalidMessageType(u8),

    #[error("message serial number must not be zero")]
    ZeroSerial,

    #[error("malformed message header")]
    MalformedHeader,

    #[error("body length is non-zero but the header has no signature field")]
    MissingBodySignature,

    #[error("Incorrect body length")]
    IncorrectBodyLength,
}

/// Construction-time violation of a value invariant.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum InvariantError {
    #[error("string length {0} does not fit in a 32-bit length field")]
    StringTooLong(usize),

    #[error("string contains an embedded NUL byte")]
    EmbeddedNul,

    #[error("signature length {0} exceeds 255 bytes")]
    SignatureTooLong(usize),

    #[error("malformed signature: {0}")]
    MalformedSignature(ParseError),

    #[error("array element type `{found}` does not match element type `{expected}`")]
    ElementTypeMismatch { expected: TypeName, found: TypeName },

    #[error("dict entry key type `{0}` is not a basic type")]
    DictKeyNotBasic(TypeName),

    #[error("struct must have at least one field")]
    EmptyStruct,

    #[error("array payload length {0} does not fit in a 32-bit length field")]
    ArrayTooLarge(usize),

    #[error("message body length {0} does not fit in a 32-bit length field")]
    BodyTooLarge(usize),
}

/// A type rendered as its signature text, for error messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeName(pub(crate) String);

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
