//! Message framing: a fixed-shape header struct followed by a body
//! whose element types are discovered from the header's signature
//! field.
//!
//! The wire header is the struct `(yyyyuua(yv))`: endianness marker,
//! message type, flags, protocol version, body length, serial, and
//! an array of `(field-code, variant)` pairs. [`Message`] keeps
//! those parts as plain typed fields and converts to and from the
//! header [`Value`] at the parse/serialize boundary.

use std::cell::RefCell;
use std::rc::Rc;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use log::trace;

use crate::decode::{value_parser, ValueCont};
use crate::encode::{write_value, Encoder, EmitEncoder, SizeEncoder};
use crate::endian::Endianness;
use crate::error::{InvariantError, ParseError, ParseErrorKind};
use crate::parse::{run_complete, stop, take_zeros, Fed, Parser};
use crate::signature::Signature;
use crate::types::{padding, Type};
use crate::value::Value;

/// The major protocol version this crate speaks.
pub const PROTOCOL_VERSION: u8 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    MethodCall = 1,
    MethodReturn = 2,
    Error = 3,
    Signal = 4,
}

impl MessageType {
    pub fn from_code(code: u8) -> Option<MessageType> {
        match code {
            1 => Some(MessageType::MethodCall),
            2 => Some(MessageType::MethodReturn),
            3 => Some(MessageType::Error),
            4 => Some(MessageType::Signal),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Header flag bits.
pub mod flags {
    pub const NO_REPLY_EXPECTED: u8 = 0x1;
    pub const NO_AUTO_START: u8 = 0x2;
    pub const ALLOW_INTERACTIVE_AUTHORIZATION: u8 = 0x4;
}

/// Well-known header-field codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FieldCode {
    Path = 1,
    Interface = 2,
    Member = 3,
    ErrorName = 4,
    ReplySerial = 5,
    Destination = 6,
    Sender = 7,
    Signature = 8,
    UnixFds = 9,
}

/// One `(field-code, variant)` pair from the header. The code is
/// kept raw so that unknown fields survive a round trip.
#[derive(Clone, Debug, PartialEq)]
pub struct HeaderField {
    pub code: u8,
    /// The variant's payload.
    pub value: Value,
}

/// One D-Bus message: header fields plus body values.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub endianness: Endianness,
    pub message_type: MessageType,
    pub flags: u8,
    pub protocol_version: u8,
    /// Nonzero, per message.
    pub serial: u32,
    pub fields: Vec<HeaderField>,
    pub body: Vec<Value>,
}

/// The wire type of the message header.
pub fn header_type() -> Type {
    Type::Struct(Rc::from(vec![
        Type::Byte,
        Type::Byte,
        Type::Byte,
        Type::Byte,
        Type::Uint32,
        Type::Uint32,
        Type::array(header_field_type()),
    ]))
}

fn header_field_type() -> Type {
    Type::Struct(Rc::from(vec![Type::Byte, Type::Variant]))
}

impl Message {
    /// Build a method call with the conventional header fields.
    /// Flags default to zero; set [`Message::flags`] afterwards if
    /// needed.
    pub fn method_call(
        serial: u32,
        path: &str,
        interface: &str,
        destination: &str,
        member: &str,
        body: Vec<Value>,
    ) -> Result<Message, InvariantError> {
        let mut msg = Message {
            endianness: Endianness::Little,
            message_type: MessageType::MethodCall,
            flags: 0,
            protocol_version: PROTOCOL_VERSION,
            serial,
            fields: Vec::new(),
            body,
        };
        let signature = msg.body_signature()?;
        msg.fields = vec![
            HeaderField {
                code: FieldCode::Path as u8,
                value: Value::path(path)?,
            },
            HeaderField {
                code: FieldCode::Interface as u8,
                value: Value::string(interface)?,
            },
            HeaderField {
                code: FieldCode::Destination as u8,
                value: Value::string(destination)?,
            },
            HeaderField {
                code: FieldCode::Member as u8,
                value: Value::string(member)?,
            },
            HeaderField {
                code: FieldCode::Signature as u8,
                value: Value::Signature(signature),
            },
        ];
        Ok(msg)
    }

    /// Build a reply to the message with serial `reply_serial`.
    pub fn method_return(
        serial: u32,
        reply_serial: u32,
        destination: &str,
        body: Vec<Value>,
    ) -> Result<Message, InvariantError> {
        let mut msg = Message {
            endianness: Endianness::Little,
            message_type: MessageType::MethodReturn,
            flags: 0,
            protocol_version: PROTOCOL_VERSION,
            serial,
            fields: Vec::new(),
            body,
        };
        let signature = msg.body_signature()?;
        msg.fields = vec![
            HeaderField {
                code: FieldCode::Destination as u8,
                value: Value::string(destination)?,
            },
            HeaderField {
                code: FieldCode::Signature as u8,
                value: Value::Signature(signature),
            },
            HeaderField {
                code: FieldCode::ReplySerial as u8,
                value: Value::Uint32(reply_serial),
            },
        ];
        Ok(msg)
    }

    /// The first field with the given code, if present.
    pub fn lookup_field(&self, code: FieldCode) -> Option<&Value> {
        self.fields
            .iter()
            .find(|f| f.code == code as u8)
            .map(|f| &f.value)
    }

    pub fn path(&self) -> Option<&str> {
        self.lookup_field(FieldCode::Path).and_then(Value::as_path)
    }

    pub fn interface(&self) -> Option<&str> {
        self.lookup_field(FieldCode::Interface)
            .and_then(Value::as_str)
    }

    pub fn member(&self) -> Option<&str> {
        self.lookup_field(FieldCode::Member).and_then(Value::as_str)
    }

    pub fn error_name(&self) -> Option<&str> {
        self.lookup_field(FieldCode::ErrorName)
            .and_then(Value::as_str)
    }

    pub fn destination(&self) -> Option<&str> {
        self.lookup_field(FieldCode::Destination)
            .and_then(Value::as_str)
    }

    pub fn sender(&self) -> Option<&str> {
        self.lookup_field(FieldCode::Sender).and_then(Value::as_str)
    }

    pub fn reply_serial(&self) -> Option<u32> {
        self.lookup_field(FieldCode::ReplySerial)
            .and_then(Value::as_u32)
    }

    pub fn unix_fds(&self) -> Option<u32> {
        self.lookup_field(FieldCode::UnixFds)
            .and_then(Value::as_u32)
    }

    /// The signature of the body: the concatenated signatures of its
    /// elements.
    pub fn body_signature(&self) -> Result<Signature, InvariantError> {
        let mut text = String::new();
        for v in &self.body {
            v.ty().write_letters(&mut text);
        }
        Signature::new(text)
    }

    /// Serialize this message using its own endianness marker.
    pub fn to_bytes(&self) -> Result<Vec<u8>, InvariantError> {
        let header = self.header_value()?;
        let mut sizer = SizeEncoder::new();
        write_message(&header, &self.body, &mut sizer)?;
        let size = sizer.pos();
        let sizes = sizer.into_array_sizes();
        match self.endianness {
            Endianness::Little => {
                let mut emitter = EmitEncoder::<LittleEndian>::new(size, sizes);
                write_message(&header, &self.body, &mut emitter)?;
                Ok(emitter.into_bytes())
            }
            Endianness::Big => {
                let mut emitter = EmitEncoder::<BigEndian>::new(size, sizes);
                write_message(&header, &self.body, &mut emitter)?;
                Ok(emitter.into_bytes())
            }
        }
    }

    /// Parse one complete message from `buf`, choosing the byte
    /// order from the first byte.
    pub fn from_bytes(buf: &[u8]) -> Result<Message, ParseError> {
        let marker = *buf
            .first()
            .ok_or(ParseError::new(0, ParseErrorKind::UnexpectedEof))?;
        let endianness = Endianness::from_marker(marker).ok_or(ParseError::new(
            0,
            ParseErrorKind::InvalidEndianMarker(marker),
        ))?;
        let mut decoder = MessageDecoder::new(endianness)?;
        run_complete(&mut decoder.parser, buf)?;
        decoder.finish()
    }

    /// The header as the wire value `(yyyyuua(yv))`, with the
    /// body-length field filled in from the size pass.
    fn header_value(&self) -> Result<Value, InvariantError> {
        let mut sizer = SizeEncoder::new();
        for v in &self.body {
            write_value(v, &mut sizer)?;
        }
        let body_length =
            u32::try_from(sizer.pos()).map_err(|_| InvariantError::BodyTooLarge(sizer.pos()))?;

        let fields = self
            .fields
            .iter()
            .map(|f| {
                Value::struct_of(vec![
                    Value::Byte(f.code),
                    Value::variant(f.value.clone())?,
                ])
            })
            .collect::<Result<Vec<_>, InvariantError>>()?;

        Value::struct_of(vec![
            Value::Byte(self.endianness.marker()),
            Value::Byte(self.message_type.code()),
            Value::Byte(self.flags),
            Value::Byte(self.protocol_version),
            Value::Uint32(body_length),
            Value::Uint32(self.serial),
            Value::array(header_field_type(), fields)?,
        ])
    }
}

fn write_message(
    header: &Value,
    body: &[Value],
    s: &mut dyn Encoder,
) -> Result<(), InvariantError> {
    write_value(header, s)?;
    // The body is 8-byte aligned.
    s.pad_to(8);
    for v in body {
        write_value(v, s)?;
    }
    Ok(())
}

/// Header contents pulled out of the parsed header value, before the
/// body has arrived.
struct RawHeader {
    endianness: Endianness,
    message_type: MessageType,
    flags: u8,
    protocol_version: u8,
    body_length: u32,
    serial: u32,
    fields: Vec<HeaderField>,
}

fn next_byte(items: &mut impl Iterator<Item = Value>) -> Option<u8> {
    items.next().and_then(|v| v.as_byte())
}

fn next_u32(items: &mut impl Iterator<Item = Value>) -> Option<u32> {
    items.next().and_then(|v| v.as_u32())
}

impl RawHeader {
    fn from_value(expected: Endianness, header: Value, pos: usize) -> Result<RawHeader, ParseError> {
        let malformed = || ParseError::new(pos, ParseErrorKind::MalformedHeader);
        let items = match header {
            Value::Struct(items) if items.len() == 7 => items,
            _ => return Err(malformed()),
        };
        let mut items = items.into_iter();

        let marker = next_byte(&mut items).ok_or_else(malformed)?;
        let type_code = next_byte(&mut items).ok_or_else(malformed)?;
        let flags = next_byte(&mut items).ok_or_else(malformed)?;
        let protocol_version = next_byte(&mut items).ok_or_else(malformed)?;
        let body_length = next_u32(&mut items).ok_or_else(malformed)?;
        let serial = next_u32(&mut items).ok_or_else(malformed)?;

        let endianness = Endianness::from_marker(marker).ok_or(ParseError::new(
            0,
            ParseErrorKind::InvalidEndianMarker(marker),
        ))?;
        if endianness != expected {
            return Err(ParseError::new(
                0,
                ParseErrorKind::InvalidEndianMarker(marker),
            ));
        }
        let message_type = MessageType::from_code(type_code).ok_or(ParseError::new(
            1,
            ParseErrorKind::InvalidMessageType(type_code),
        ))?;
        if serial == 0 {
            return Err(ParseError::new(8, ParseErrorKind::ZeroSerial));
        }

        let raw_fields = match items.next() {
            Some(Value::Array { items, .. }) => items,
            _ => return Err(malformed()),
        };
        let mut fields = Vec::with_capacity(raw_fields.len());
        for field in raw_fields {
            let pair = match field {
                Value::Struct(pair) if pair.len() == 2 => pair,
                _ => return Err(malformed()),
            };
            let mut pair = pair.into_iter();
            let code = next_byte(&mut pair).ok_or_else(malformed)?;
            let value = match pair.next() {
                Some(Value::Variant { value, .. }) => *value,
                _ => return Err(malformed()),
            };
            fields.push(HeaderField { code, value });
        }

        Ok(RawHeader {
            endianness,
            message_type,
            flags,
            protocol_version,
            body_length,
            serial,
            fields,
        })
    }

    fn body_types(&self, pos: usize) -> Result<Vec<Type>, ParseError> {
        if self.body_length == 0 {
            return Ok(Vec::new());
        }
        let signature = self
            .fields
            .iter()
            .find(|f| f.code == FieldCode::Signature as u8)
            .and_then(|f| f.value.as_signature())
            .ok_or(ParseError::new(pos, ParseErrorKind::MissingBodySignature))?;
        // The signature value was validated when it was parsed, so
        // only the kind survives here; offsets inside a header field
        // cannot be mapped back onto the stream.
        signature
            .types()
            .map_err(|e| ParseError::new(pos, e.kind))
    }

    fn into_message(self, body: Vec<Value>) -> Message {
        Message {
            endianness: self.endianness,
            message_type: self.message_type,
            flags: self.flags,
            protocol_version: self.protocol_version,
            serial: self.serial,
            fields: self.fields,
            body,
        }
    }
}

type BodyCont = Box<dyn FnOnce(usize, Vec<Value>) -> Fed>;

fn body_values<B: ByteOrder + 'static>(
    types: Vec<Type>,
    i: usize,
    values: Vec<Value>,
    pos: usize,
    done: BodyCont,
) -> Fed {
    if let Some(ty) = types.get(i).cloned() {
        value_parser::<B>(
            ty,
            pos,
            Box::new(move |pos, v| {
                let mut values = values;
                values.push(v);
                body_values::<B>(types, i + 1, values, pos, done)
            }),
        )
    } else {
        done(pos, values)
    }
}

fn message_parser<B: ByteOrder + 'static>(
    expected: Endianness,
    slot: Rc<RefCell<Option<Message>>>,
) -> Fed {
    let header_done: ValueCont = Box::new(move |pos, header| {
        let header = RawHeader::from_value(expected, header, pos)?;
        trace!(
            "parsed header: type={:?} serial={} body_length={}",
            header.message_type,
            header.serial,
            header.body_length
        );
        let pad = padding(pos, 8);
        take_zeros(pos, pad, move |pos| {
            let types = header.body_types(pos)?;
            let body_end = pos
                .checked_add(header.body_length as usize)
                .ok_or(ParseError::new(pos, ParseErrorKind::PositionOverflow))?;
            body_values::<B>(
                types,
                0,
                Vec::new(),
                pos,
                Box::new(move |pos, body| {
                    if pos != body_end {
                        return Err(ParseError::new(pos, ParseErrorKind::IncorrectBodyLength));
                    }
                    *slot.borrow_mut() = Some(header.into_message(body));
                    stop()
                }),
            )
        })
    });
    value_parser::<B>(header_type(), 0, header_done)
}

/// Incremental decoder for one message whose endianness the caller
/// has already determined from the frame's first byte.
pub struct MessageDecoder {
    parser: Parser,
    slot: Rc<RefCell<Option<Message>>>,
}

impl MessageDecoder {
    pub fn new(endianness: Endianness) -> Result<MessageDecoder, ParseError> {
        let slot = Rc::new(RefCell::new(None));
        let out = Rc::clone(&slot);
        let step = match endianness {
            Endianness::Little => message_parser::<LittleEndian>(endianness, out),
            Endianness::Big => message_parser::<BigEndian>(endianness, out),
        }?;
        Ok(MessageDecoder {
            parser: Parser::new(step),
            slot,
        })
    }

    /// Number of bytes consumed so far.
    pub fn pos(&self) -> usize {
        self.parser.pos()
    }

    pub fn min_required(&self) -> u8 {
        self.parser.min_required()
    }

    pub fn max_required(&self) -> usize {
        self.parser.max_required()
    }

    pub fn is_complete(&self) -> bool {
        self.parser.max_required() == 0
    }

    pub fn feed(&mut self, buf: &[u8]) -> Result<(), ParseError> {
        self.parser.feed(buf)
    }

    pub fn finish(self) -> Result<Message, ParseError> {
        let pos = self.parser.pos();
        self.slot
            .borrow_mut()
            .take()
            .ok_or(ParseError::new(pos, ParseErrorKind::UnexpectedEof))
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::{FieldCode, HeaderField, Message, MessageType};
    use crate::endian::Endianness;
    use crate::error::ParseErrorKind;
    use crate::value::Value;

    fn hello() -> Message {
        Message::method_call(
            0x1001,
            "/org/freedesktop/DBus",
            "org.freedesktop.DBus",
            "org.freedesktop.DBus",
            "Hello",
            vec![],
        )
        .unwrap()
    }

    #[test]
    fn hello_fixed_prefix() {
        let bytes = hello().to_bytes().unwrap();
        assert_eq!(
            bytes[..12],
            [0x6C, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x01, 0x10, 0x00, 0x00]
        );
    }

    #[test]
    fn hello_round_trip() {
        let msg = hello();
        let bytes = msg.to_bytes().unwrap();
        let parsed = Message::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, msg);
        assert_eq!(parsed.path(), Some("/org/freedesktop/DBus"));
        assert_eq!(parsed.member(), Some("Hello"));
        assert_eq!(parsed.destination(), Some("org.freedesktop.DBus"));
        assert_eq!(parsed.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn body_round_trip() {
        let msg = Message::method_call(
            7,
            "/com/example/Thing",
            "com.example.Thing",
            "com.example",
            "Frob",
            vec![
                Value::Uint32(42),
                Value::string("payload").unwrap(),
                Value::variant(Value::Boolean(true)).unwrap(),
            ],
        )
        .unwrap();
        assert_eq!(msg.body_signature().unwrap().as_str(), "usv");
        let bytes = msg.to_bytes().unwrap();
        let parsed = Message::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, msg);
        assert_eq!(parsed.body.len(), 3);
    }

    #[test]
    fn method_return_carries_reply_serial() {
        let msg = Message::method_return(8, 7, ":1.7", vec![Value::Int32(-1)]).unwrap();
        assert_eq!(msg.message_type, MessageType::MethodReturn);
        let parsed = Message::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.reply_serial(), Some(7));
        assert_eq!(parsed.destination(), Some(":1.7"));
    }

    #[test]
    fn big_endian_round_trip() {
        let mut msg = Message::method_call(
            9,
            "/x",
            "x.y",
            "x.y",
            "M",
            vec![Value::Uint32(0xDEADBEEF), Value::Double(1.5)],
        )
        .unwrap();
        msg.endianness = Endianness::Big;
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(bytes[0], b'B');
        let parsed = Message::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, msg);
        assert_eq!(parsed.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn unknown_field_codes_survive() {
        let mut msg = hello();
        msg.fields.push(HeaderField {
            code: 200,
            value: Value::string("mystery").unwrap(),
        });
        let parsed = Message::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, msg);
        assert!(parsed.lookup_field(FieldCode::Signature).is_some());
    }

    #[test]
    fn zero_serial_rejected() {
        let mut msg = hello();
        msg.serial = 0;
        let bytes = msg.to_bytes().unwrap();
        let err = Message::from_bytes(&bytes).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::ZeroSerial);
        assert_eq!(err.pos, 8);
    }

    #[test]
    fn missing_body_signature_rejected() {
        let mut msg = Message::method_call(3, "/a", "a.b", "a.b", "M", vec![Value::Uint32(1)])
            .unwrap();
        msg.fields.retain(|f| f.code != FieldCode::Signature as u8);
        let bytes = msg.to_bytes().unwrap();
        let err = Message::from_bytes(&bytes).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::MissingBodySignature);
    }

    #[test]
    fn tampered_body_length_rejected() {
        let msg = Message::method_call(3, "/a", "a.b", "a.b", "M", vec![Value::Uint32(1)])
            .unwrap();
        let mut bytes = msg.to_bytes().unwrap();
        // Body length lives at offset 4 in the fixed header part.
        bytes[4] = 2;
        let err = Message::from_bytes(&bytes).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::IncorrectBodyLength);
    }

    #[test]
    fn invalid_endian_marker_rejected() {
        let mut bytes = hello().to_bytes().unwrap();
        bytes[0] = b'L';
        let err = Message::from_bytes(&bytes).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::InvalidEndianMarker(b'L'));
        assert_eq!(err.pos, 0);
    }

    #[test]
    fn invalid_message_type_rejected() {
        let mut bytes = hello().to_bytes().unwrap();
        bytes[1] = 9;
        let err = Message::from_bytes(&bytes).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::InvalidMessageType(9));
        assert_eq!(err.pos, 1);
    }
}
