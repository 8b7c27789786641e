//! Two-pass serializer.
//!
//! The byte length of an array's payload depends on alignment
//! padding inside it, so it cannot be known when the length prefix
//! must be written. The writer therefore runs twice over the value
//! tree: the size pass only advances a byte counter and records each
//! array's payload length in order of occurrence; the emit pass
//! writes real bytes and replays the recorded lengths into the
//! prefixes. Both passes traverse the tree identically, so they
//! observe arrays in the same order.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::endian::Endianness;
use crate::error::InvariantError;
use crate::types::padding;
use crate::value::Value;

pub(crate) trait Encoder {
    fn write_byte(&mut self, b: u8);
    fn write_bytes(&mut self, bytes: &[u8]);
    fn write_u16(&mut self, x: u16);
    fn write_u32(&mut self, x: u32);
    fn write_u64(&mut self, x: u64);

    /// Doubles travel as their IEEE-754 bit pattern; `to_bits`
    /// preserves NaN payloads across the round trip.
    fn write_f64(&mut self, x: f64) {
        self.write_u64(x.to_bits());
    }

    /// Emit zero bytes until the position is a multiple of
    /// `alignment`.
    fn pad_to(&mut self, alignment: usize);

    /// Number of bytes written so far.
    fn pos(&self) -> usize;

    /// Start an array length prefix; the returned token is passed
    /// back to [`end_array`](Encoder::end_array) with the measured
    /// payload length.
    fn begin_array(&mut self) -> usize;

    fn end_array(&mut self, token: usize, payload_len: usize) -> Result<(), InvariantError>;
}

/// First pass: counts bytes and records array payload lengths in
/// order of occurrence.
pub(crate) struct SizeEncoder {
    pos: usize,
    array_sizes: Vec<u32>,
}

impl SizeEncoder {
    pub(crate) fn new() -> SizeEncoder {
        SizeEncoder {
            pos: 0,
            array_sizes: Vec::new(),
        }
    }

    pub(crate) fn into_array_sizes(self) -> Vec<u32> {
        self.array_sizes
    }
}

impl Encoder for SizeEncoder {
    fn write_byte(&mut self, _b: u8) {
        self.pos += 1;
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        self.pos += bytes.len();
    }

    fn write_u16(&mut self, _x: u16) {
        self.pos += 2;
    }

    fn write_u32(&mut self, _x: u32) {
        self.pos += 4;
    }

    fn write_u64(&mut self, _x: u64) {
        self.pos += 8;
    }

    fn pad_to(&mut self, alignment: usize) {
        self.pos += padding(self.pos, alignment);
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn begin_array(&mut self) -> usize {
        let token = self.array_sizes.len();
        self.array_sizes.push(0);
        self.pos += 4;
        token
    }

    fn end_array(&mut self, token: usize, payload_len: usize) -> Result<(), InvariantError> {
        let len =
            u32::try_from(payload_len).map_err(|_| InvariantError::ArrayTooLarge(payload_len))?;
        self.array_sizes[token] = len;
        Ok(())
    }
}

/// Second pass: writes bytes in byte order `B`, replaying the array
/// lengths recorded by the size pass.
pub(crate) struct EmitEncoder<B> {
    buf: Vec<u8>,
    array_sizes: Vec<u32>,
    next_array: usize,
    _endian: std::marker::PhantomData<B>,
}

impl<B: ByteOrder> EmitEncoder<B> {
    pub(crate) fn new(capacity: usize, array_sizes: Vec<u32>) -> EmitEncoder<B> {
        EmitEncoder {
            buf: Vec::with_capacity(capacity),
            array_sizes,
            next_array: 0,
            _endian: std::marker::PhantomData,
        }
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

impl<B: ByteOrder> Encoder for EmitEncoder<B> {
    fn write_byte(&mut self, b: u8) {
        self.buf.push(b);
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn write_u16(&mut self, x: u16) {
        let mut tmp = [0u8; 2];
        B::write_u16(&mut tmp, x);
        self.buf.extend_from_slice(&tmp);
    }

    fn write_u32(&mut self, x: u32) {
        let mut tmp = [0u8; 4];
        B::write_u32(&mut tmp, x);
        self.buf.extend_from_slice(&tmp);
    }

    fn write_u64(&mut self, x: u64) {
        let mut tmp = [0u8; 8];
        B::write_u64(&mut tmp, x);
        self.buf.extend_from_slice(&tmp);
    }

    fn pad_to(&mut self, alignment: usize) {
        let new_len = self.buf.len() + padding(self.buf.len(), alignment);
        self.buf.resize(new_len, 0);
    }

    fn pos(&self) -> usize {
        self.buf.len()
    }

    fn begin_array(&mut self) -> usize {
        let token = self.next_array;
        self.next_array += 1;
        self.write_u32(self.array_sizes[token]);
        token
    }

    fn end_array(&mut self, token: usize, payload_len: usize) -> Result<(), InvariantError> {
        debug_assert_eq!(self.array_sizes[token] as usize, payload_len);
        Ok(())
    }
}

/// Write one value: padding to its alignment, then the payload.
pub(crate) fn write_value(v: &Value, s: &mut dyn Encoder) -> Result<(), InvariantError> {
    s.pad_to(v.ty().alignment());
    write_value_after_padding(v, s)
}

fn write_value_after_padding(v: &Value, s: &mut dyn Encoder) -> Result<(), InvariantError> {
    match v {
        Value::Byte(x) => s.write_byte(*x),
        Value::Boolean(x) => s.write_u32(u32::from(*x)),
        Value::Uint16(x) => s.write_u16(*x),
        Value::Int16(x) => s.write_u16(*x as u16),
        Value::Uint32(x) => s.write_u32(*x),
        Value::Int32(x) => s.write_u32(*x as u32),
        Value::Uint64(x) => s.write_u64(*x),
        Value::Int64(x) => s.write_u64(*x as u64),
        Value::Double(x) => s.write_f64(*x),
        Value::UnixFd(x) => s.write_u32(*x),
        Value::String(text) | Value::Path(text) => {
            s.write_u32(text.len() as u32);
            s.write_bytes(text.as_bytes());
            s.write_byte(0);
        }
        Value::Signature(sig) => {
            s.write_byte(sig.len() as u8);
            s.write_bytes(sig.as_str().as_bytes());
            s.write_byte(0);
        }
        Value::Variant { signature, value } => {
            s.write_byte(signature.len() as u8);
            s.write_bytes(signature.as_str().as_bytes());
            s.write_byte(0);
            // The payload realigns itself.
            write_value(value, s)?;
        }
        Value::Array { elem, items } => {
            let token = s.begin_array();
            s.pad_to(elem.alignment());
            let start = s.pos();
            for item in items {
                write_value(item, s)?;
            }
            let payload_len = s.pos() - start;
            s.end_array(token, payload_len)?;
        }
        Value::Struct(items) => {
            if items.is_empty() {
                return Err(InvariantError::EmptyStruct);
            }
            for item in items {
                write_value(item, s)?;
            }
        }
        Value::DictEntry { key, value } => {
            write_value(key, s)?;
            write_value(value, s)?;
        }
    }
    Ok(())
}

/// The number of bytes [`value_to_bytes`] would produce, assuming
/// the value starts at an offset aligned to its own alignment.
pub fn encoded_size(v: &Value) -> Result<usize, InvariantError> {
    let mut sizer = SizeEncoder::new();
    write_value(v, &mut sizer)?;
    Ok(sizer.pos())
}

/// Serialize one value to a fresh buffer in the given byte order.
pub fn value_to_bytes(endianness: Endianness, v: &Value) -> Result<Vec<u8>, InvariantError> {
    let mut sizer = SizeEncoder::new();
    write_value(v, &mut sizer)?;
    let size = sizer.pos();
    let sizes = sizer.into_array_sizes();
    match endianness {
        Endianness::Little => {
            let mut emitter = EmitEncoder::<LittleEndian>::new(size, sizes);
            write_value(v, &mut emitter)?;
            Ok(emitter.into_bytes())
        }
        Endianness::Big => {
            let mut emitter = EmitEncoder::<BigEndian>::new(size, sizes);
            write_value(v, &mut emitter)?;
            Ok(emitter.into_bytes())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{encoded_size, value_to_bytes};
    use crate::endian::Endianness;
    use crate::error::InvariantError;
    use crate::types::Type;
    use crate::value::Value;

    #[test]
    fn variant_of_u32() {
        let v = Value::variant(Value::Uint32(0xDEADBEEF)).unwrap();
        let bytes = value_to_bytes(Endianness::Little, &v).unwrap();
        assert_eq!(bytes, [0x01, 0x75, 0x00, 0x00, 0xEF, 0xBE, 0xAD, 0xDE]);
    }

    #[test]
    fn variant_of_u32_big_endian() {
        let v = Value::variant(Value::Uint32(0xDEADBEEF)).unwrap();
        let bytes = value_to_bytes(Endianness::Big, &v).unwrap();
        assert_eq!(bytes, [0x01, 0x75, 0x00, 0x00, 0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn array_of_u16() {
        let v = Value::array(Type::Uint16, vec![1u16.into(), 2u16.into(), 3u16.into()]).unwrap();
        let bytes = value_to_bytes(Endianness::Little, &v).unwrap();
        assert_eq!(bytes, [0x06, 0, 0, 0, 1, 0, 2, 0, 3, 0]);
    }

    #[test]
    fn empty_array_of_struct_pads_after_length() {
        let elem = Type::struct_of(vec![Type::Uint32, Type::String]).unwrap();
        let v = Value::array(elem, vec![]).unwrap();
        let bytes = value_to_bytes(Endianness::Little, &v).unwrap();
        // 4 bytes of zero length, then padding to the struct's
        // 8-byte alignment; no payload.
        assert_eq!(bytes, [0u8; 8]);
    }

    #[test]
    fn string_writes_length_payload_nul() {
        let v = Value::string("Hi").unwrap();
        let bytes = value_to_bytes(Endianness::Little, &v).unwrap();
        assert_eq!(bytes, [2, 0, 0, 0, b'H', b'i', 0]);
    }

    #[test]
    fn struct_of_string_and_double() {
        let v = Value::struct_of(vec![
            Value::string("Hi").unwrap(),
            Value::Double(0.2),
        ])
        .unwrap();
        let bytes = value_to_bytes(Endianness::Little, &v).unwrap();
        assert_eq!(
            bytes,
            [
                2, 0, 0, 0, b'H', b'i', 0, 0, 154, 153, 153, 153, 153, 153, 201, 63,
            ]
        );
    }

    #[test]
    fn dict_array_byte_layout() {
        let entry = Value::dict_entry(
            Value::string("x").unwrap(),
            Value::variant(Value::Uint32(5)).unwrap(),
        )
        .unwrap();
        let elem = entry.ty();
        let v = Value::array(elem, vec![entry]).unwrap();
        let bytes = value_to_bytes(Endianness::Little, &v).unwrap();
        assert_eq!(
            bytes,
            [
                16, 0, 0, 0, // payload length
                0, 0, 0, 0, // padding to the entry's 8-byte alignment
                1, 0, 0, 0, b'x', 0, // key "x"
                1, b'u', 0, // signature "u", immediately after the key's NUL
                0, 0, 0, // padding to align the integer
                5, 0, 0, 0, // the integer
            ]
        );
    }

    #[test]
    fn nested_array_lengths_resolve_in_order() {
        let inner1 = Value::array(Type::Uint16, vec![1u16.into()]).unwrap();
        let inner2 = Value::array(Type::Uint16, vec![2u16.into(), 3u16.into()]).unwrap();
        let v = Value::array(Type::array(Type::Uint16), vec![inner1, inner2]).unwrap();
        let bytes = value_to_bytes(Endianness::Little, &v).unwrap();
        assert_eq!(
            bytes,
            [
                16, 0, 0, 0, // outer payload, inter-element padding included
                2, 0, 0, 0, 1, 0, // inner1: length 2, one u16
                0, 0, // padding to inner2's length field
                4, 0, 0, 0, 2, 0, 3, 0, // inner2
            ]
        );
        assert_eq!(encoded_size(&v).unwrap(), bytes.len());
    }

    #[test]
    fn hand_built_empty_struct_refused() {
        let v = Value::Struct(Vec::new());
        let err = value_to_bytes(Endianness::Little, &v).unwrap_err();
        assert_eq!(err, InvariantError::EmptyStruct);
    }

    #[test]
    fn double_bit_pattern_survives() {
        let v = Value::Double(f64::from_bits(0x7FF8_0000_0000_1234));
        let bytes = value_to_bytes(Endianness::Little, &v).unwrap();
        assert_eq!(bytes, 0x7FF8_0000_0000_1234u64.to_le_bytes());
    }
}
