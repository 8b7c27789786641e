//! Type-directed wire parser producing [`Value`] trees.
//!
//! [`value_parser`] builds the continuation chain for one value of a
//! given type: zero padding up to the type's alignment, then the
//! per-type dispatch. Every recursive position produces a new
//! heap-allocated continuation instead of calling back into itself,
//! so deeply nested input cannot exhaust the host stack.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use log::trace;

use crate::endian::Endianness;
use crate::error::{ParseError, ParseErrorKind};
use crate::parse::{
    run_complete, stop, take_byte, take_chars, take_u16, take_u32, take_u64, take_zeros, Fed,
    Parser,
};
use crate::signature::{parse_single, Signature};
use crate::types::{padding, Type};
use crate::value::Value;

/// Completion continuation: receives the position after the value
/// and the owned value node.
pub(crate) type ValueCont = Box<dyn FnOnce(usize, Value) -> Fed>;

type TextCont = Box<dyn FnOnce(usize, String) -> Fed>;

/// Build a parser for one value of type `ty` starting at `pos`.
///
/// On success the continuation is invoked exactly once with a value
/// whose type equals `ty`.
pub(crate) fn value_parser<B: ByteOrder + 'static>(ty: Type, pos: usize, k: ValueCont) -> Fed {
    let pad = padding(pos, ty.alignment());
    take_zeros(pos, pad, move |pos| aligned_value_parser::<B>(ty, pos, k))
}

fn aligned_value_parser<B: ByteOrder + 'static>(ty: Type, pos: usize, k: ValueCont) -> Fed {
    trace!("parse `{}` at {}", ty, pos);
    match ty {
        Type::Byte => take_byte(move |pos, b| k(pos, Value::Byte(b))),
        Type::Boolean => take_u32::<B, _>(move |pos, x| match x {
            0 => k(pos, Value::Boolean(false)),
            1 => k(pos, Value::Boolean(true)),
            other => Err(ParseError::new(pos, ParseErrorKind::InvalidBoolean(other))),
        }),
        Type::Uint16 => take_u16::<B, _>(move |pos, x| k(pos, Value::Uint16(x))),
        Type::Int16 => take_u16::<B, _>(move |pos, x| k(pos, Value::Int16(x as i16))),
        Type::Uint32 => take_u32::<B, _>(move |pos, x| k(pos, Value::Uint32(x))),
        Type::Int32 => take_u32::<B, _>(move |pos, x| k(pos, Value::Int32(x as i32))),
        Type::Uint64 => take_u64::<B, _>(move |pos, x| k(pos, Value::Uint64(x))),
        Type::Int64 => take_u64::<B, _>(move |pos, x| k(pos, Value::Int64(x as i64))),
        Type::Double => take_u64::<B, _>(move |pos, x| k(pos, Value::Double(f64::from_bits(x)))),
        Type::UnixFd => take_u32::<B, _>(move |pos, x| k(pos, Value::UnixFd(x))),
        Type::String => take_u32::<B, _>(move |pos, len| {
            nul_terminated(
                pos,
                len as usize,
                Box::new(move |pos, text| k(pos, Value::String(text))),
            )
        }),
        Type::Path => take_u32::<B, _>(move |pos, len| {
            nul_terminated(
                pos,
                len as usize,
                Box::new(move |pos, text| k(pos, Value::Path(text))),
            )
        }),
        Type::Signature => take_byte(move |pos, len| {
            let len = usize::from(len);
            nul_terminated(
                pos,
                len,
                Box::new(move |pos, text| {
                    let start = pos - 1 - len;
                    let sig = wire_signature(text, start)?;
                    k(pos, Value::Signature(sig))
                }),
            )
        }),
        Type::Variant => take_byte(move |pos, len| {
            let len = usize::from(len);
            nul_terminated(
                pos,
                len,
                Box::new(move |pos, text| {
                    let start = pos - 1 - len;
                    // The declared length is the whole of `text`, so
                    // requiring exactly one complete type doubles as
                    // the length check.
                    let inner = parse_single(&text).map_err(|e| e.offset(start))?;
                    let signature = Signature::from_validated(text);
                    value_parser::<B>(
                        inner,
                        pos,
                        Box::new(move |pos, value| {
                            k(
                                pos,
                                Value::Variant {
                                    signature,
                                    value: Box::new(value),
                                },
                            )
                        }),
                    )
                }),
            )
        }),
        Type::DictEntry(key_ty, value_ty) => {
            let key_ty = key_ty.as_ref().clone();
            let value_ty = value_ty.as_ref().clone();
            value_parser::<B>(
                key_ty,
                pos,
                Box::new(move |pos, key| {
                    value_parser::<B>(
                        value_ty,
                        pos,
                        Box::new(move |pos, value| {
                            k(
                                pos,
                                Value::DictEntry {
                                    key: Box::new(key),
                                    value: Box::new(value),
                                },
                            )
                        }),
                    )
                }),
            )
        }
        Type::Array(elem) => take_u32::<B, _>(move |pos, len| {
            let elem = elem.as_ref().clone();
            let pad = padding(pos, elem.alignment());
            take_zeros(pos, pad, move |pos| {
                // Padding comes before the payload; measurement
                // starts at the first payload byte.
                let end = pos
                    .checked_add(len as usize)
                    .ok_or(ParseError::new(pos, ParseErrorKind::ArrayLengthOverflow))?;
                array_elements::<B>(elem, end, Vec::new(), pos, k)
            })
        }),
        Type::Struct(fields) => {
            // A zero-field struct occupies no bytes, which would let
            // an array of them loop without consuming input.
            if fields.is_empty() {
                return Err(ParseError::new(pos, ParseErrorKind::EmptyStruct));
            }
            struct_fields::<B>(fields, 0, Vec::new(), pos, k)
        }
    }
}

/// `len` payload bytes followed by one NUL terminator. Rejects
/// embedded NUL bytes and invalid UTF-8.
fn nul_terminated(pos: usize, len: usize, k: TextCont) -> Fed {
    take_chars(pos, len, move |pos, bytes| {
        take_zeros(pos, 1, move |pos| {
            let start = pos - 1 - bytes.len();
            if let Some(i) = bytes.iter().position(|&b| b == 0) {
                return Err(ParseError::new(start + i, ParseErrorKind::NulInString));
            }
            match String::from_utf8(bytes) {
                Ok(text) => k(pos, text),
                Err(e) => Err(ParseError::new(
                    start + e.utf8_error().valid_up_to(),
                    ParseErrorKind::InvalidUtf8,
                )),
            }
        })
    })
}

fn wire_signature(text: String, start: usize) -> Result<Signature, ParseError> {
    use crate::signature::parse_signature;
    // A wire length prefix of one byte keeps the text under the
    // 255-byte cap, so only content errors are possible here.
    parse_signature(&text).map_err(|e| e.offset(start))?;
    Ok(Signature::from_validated(text))
}

fn array_elements<B: ByteOrder + 'static>(
    elem: Type,
    end: usize,
    items: Vec<Value>,
    pos: usize,
    k: ValueCont,
) -> Fed {
    match pos.cmp(&end) {
        Ordering::Less => {
            let next_elem = elem.clone();
            value_parser::<B>(
                elem,
                pos,
                Box::new(move |pos, v| {
                    let mut items = items;
                    items.push(v);
                    array_elements::<B>(next_elem, end, items, pos, k)
                }),
            )
        }
        Ordering::Equal => k(pos, Value::Array { elem, items }),
        Ordering::Greater => Err(ParseError::new(pos, ParseErrorKind::IncorrectArrayLength)),
    }
}

fn struct_fields<B: ByteOrder + 'static>(
    fields: Rc<[Type]>,
    i: usize,
    items: Vec<Value>,
    pos: usize,
    k: ValueCont,
) -> Fed {
    if let Some(field_ty) = fields.get(i).cloned() {
        value_parser::<B>(
            field_ty,
            pos,
            Box::new(move |pos, v| {
                let mut items = items;
                items.push(v);
                struct_fields::<B>(fields, i + 1, items, pos, k)
            }),
        )
    } else {
        k(pos, Value::Struct(items))
    }
}

/// Incremental decoder for a single value of a known type.
///
/// Query [`min_required`](ValueDecoder::min_required) and
/// [`max_required`](ValueDecoder::max_required), feed a chunk within
/// that range, and repeat until `max_required` returns 0. A
/// stationary 255-byte buffer is always sufficient.
pub struct ValueDecoder {
    parser: Parser,
    slot: Rc<RefCell<Option<Value>>>,
}

impl ValueDecoder {
    pub fn new(endianness: Endianness, ty: &Type) -> Result<ValueDecoder, ParseError> {
        let slot = Rc::new(RefCell::new(None));
        let out = Rc::clone(&slot);
        let done: ValueCont = Box::new(move |_pos, v| {
            *out.borrow_mut() = Some(v);
            stop()
        });
        let ty = ty.clone();
        let step = match endianness {
            Endianness::Little => value_parser::<LittleEndian>(ty, 0, done),
            Endianness::Big => value_parser::<BigEndian>(ty, 0, done),
        }?;
        Ok(ValueDecoder {
            parser: Parser::new(step),
            slot,
        })
    }

    /// Number of bytes consumed so far.
    pub fn pos(&self) -> usize {
        self.parser.pos()
    }

    /// Minimum number of bytes the next `feed` must supply.
    pub fn min_required(&self) -> u8 {
        self.parser.min_required()
    }

    /// Maximum number of bytes the next `feed` may supply; zero
    /// once the value is complete.
    pub fn max_required(&self) -> usize {
        self.parser.max_required()
    }

    pub fn is_complete(&self) -> bool {
        self.parser.max_required() == 0
    }

    /// Feed a chunk of input; see [`Parser::feed`] for the size
    /// contract.
    pub fn feed(&mut self, buf: &[u8]) -> Result<(), ParseError> {
        self.parser.feed(buf)
    }

    /// Extract the parsed value.
    pub fn finish(self) -> Result<Value, ParseError> {
        let pos = self.parser.pos();
        self.slot
            .borrow_mut()
            .take()
            .ok_or(ParseError::new(pos, ParseErrorKind::UnexpectedEof))
    }
}

/// Parse one value of type `ty` from `buf`, which must contain the
/// value exactly, with no bytes left over.
pub fn value_from_bytes(
    endianness: Endianness,
    ty: &Type,
    buf: &[u8],
) -> Result<Value, ParseError> {
    let mut decoder = ValueDecoder::new(endianness, ty)?;
    run_complete(&mut decoder.parser, buf)?;
    decoder.finish()
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::{value_from_bytes, ValueDecoder};
    use crate::endian::Endianness;
    use crate::error::ParseErrorKind;
    use crate::types::Type;
    use crate::value::Value;

    #[test]
    fn variant_of_u32() {
        let buf = [0x01, 0x75, 0x00, 0x00, 0xEF, 0xBE, 0xAD, 0xDE];
        let v = value_from_bytes(Endianness::Little, &Type::Variant, &buf).unwrap();
        assert_eq!(
            v,
            Value::variant(Value::Uint32(0xDEADBEEF)).unwrap()
        );
    }

    #[test]
    fn array_of_u16() {
        let buf = [0x06, 0, 0, 0, 1, 0, 2, 0, 3, 0];
        let ty = Type::array(Type::Uint16);
        let v = value_from_bytes(Endianness::Little, &ty, &buf).unwrap();
        assert_eq!(
            v,
            Value::array(Type::Uint16, vec![1u16.into(), 2u16.into(), 3u16.into()]).unwrap()
        );
    }

    #[test]
    fn empty_array_of_struct() {
        let buf = [0u8; 8];
        let elem = Type::struct_of(vec![Type::Uint32, Type::String]).unwrap();
        let ty = Type::array(elem.clone());
        let v = value_from_bytes(Endianness::Little, &ty, &buf).unwrap();
        assert_eq!(v, Value::array(elem, vec![]).unwrap());
        assert_eq!(v.ty(), ty);
    }

    #[test]
    fn boolean_must_be_zero_or_one() {
        let buf = [2, 0, 0, 0];
        let err = value_from_bytes(Endianness::Little, &Type::Boolean, &buf).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::InvalidBoolean(2));
        assert_eq!(err.pos, 4);
    }

    #[test]
    fn nonzero_padding_rejected_at_offset() {
        // u16 value, then 5 bytes of "padding" to the u64, one of
        // which is dirty.
        let buf = [7, 0, 0, 0, 0, 9, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0];
        let ty = Type::struct_of(vec![Type::Uint16, Type::Uint64]).unwrap();
        let err = value_from_bytes(Endianness::Little, &ty, &buf).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::NonZeroPadding(9));
        assert_eq!(err.pos, 5);
    }

    #[test]
    fn array_payload_must_match_declared_length() {
        // Declared length 6 cuts the second u32 element in half.
        let buf = [6, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0];
        let ty = Type::array(Type::Uint32);
        let err = value_from_bytes(Endianness::Little, &ty, &buf).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::IncorrectArrayLength);
    }

    #[test]
    fn zero_width_array_elements_rejected() {
        // A hand-built empty struct type must fail cleanly instead
        // of letting the element loop spin without consuming input.
        let ty = Type::array(Type::Struct(Vec::new().into()));
        let buf = [4, 0, 0, 0, 0, 0, 0, 0];
        let err = value_from_bytes(Endianness::Little, &ty, &buf).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::EmptyStruct);
    }

    #[test]
    fn array_longer_than_input_rejected() {
        let buf = [8, 0, 0, 0, 1, 0, 0, 0];
        let ty = Type::array(Type::Uint32);
        let err = value_from_bytes(Endianness::Little, &ty, &buf).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::UnexpectedEof);
    }

    #[test]
    fn variant_signature_length_must_match() {
        // Declared signature length 2 but the text holds two
        // complete types.
        let buf = [0x02, 0x75, 0x75, 0x00, 1, 0, 0, 0];
        let err = value_from_bytes(Endianness::Little, &Type::Variant, &buf).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::SignatureLengthMismatch);
    }

    #[test]
    fn string_with_embedded_nul_rejected() {
        let buf = [3, 0, 0, 0, b'a', 0, b'b', 0];
        let err = value_from_bytes(Endianness::Little, &Type::String, &buf).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::NulInString);
        assert_eq!(err.pos, 5);
    }

    #[test]
    fn big_endian_scalars() {
        let buf = [0xDE, 0xAD, 0xBE, 0xEF];
        let v = value_from_bytes(Endianness::Big, &Type::Uint32, &buf).unwrap();
        assert_eq!(v, Value::Uint32(0xDEADBEEF));
    }

    #[test]
    fn incremental_feeding_with_small_buffer() {
        let buf = [
            0x0C, 0, 0, 0, 1, 0, 2, 0, 3, 0, 4, 0, 5, 0, 6, 0, // a q with 6 elements
        ];
        let ty = Type::array(Type::Uint16);
        let mut decoder = ValueDecoder::new(Endianness::Little, &ty).unwrap();
        let mut ix = 0;
        while !decoder.is_complete() {
            let chunk = usize::from(decoder.min_required())
                .max(3)
                .min(decoder.max_required())
                .min(buf.len() - ix);
            decoder.feed(&buf[ix..ix + chunk]).unwrap();
            ix += chunk;
        }
        assert_eq!(ix, buf.len());
        let v = decoder.finish().unwrap();
        let (elem, items) = v.as_array().unwrap();
        assert_eq!(elem, &Type::Uint16);
        assert_eq!(items.len(), 6);
        assert_eq!(items[5], Value::Uint16(6));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let buf = [1, 0, 0, 0, 0];
        let err = value_from_bytes(Endianness::Little, &Type::Uint32, &buf).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::TrailingData(1));
    }
}
