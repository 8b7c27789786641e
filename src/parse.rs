//! Continuation-passing parser framework.
//!
//! A parse in progress is a [`Parser`]: a byte counter plus the
//! current continuation ([`Step`]). Each step declares how many bytes
//! it needs ([`Step::min_required`]) and how many it is prepared to
//! consume ([`Step::max_required`]), and [`Step::feed`] consumes the
//! step and returns the next one. The chain of continuations lives on
//! the heap, so no input — however deeply nested — can grow the host
//! call stack, and the caller can pause between feeds to wait for
//! more data from a socket.
//!
//! `min_required` always fits in a `u8`, so a stationary 255-byte
//! buffer is sufficient to drive any parse to completion.

use std::marker::PhantomData;
use std::mem::size_of;

use byteorder::ByteOrder;

use crate::error::{ParseError, ParseErrorKind};

/// The outcome of running one continuation: the next continuation,
/// or a parse error.
pub(crate) type Fed = Result<Box<dyn Step>, ParseError>;

/// One continuation of a parse in progress.
pub trait Step {
    /// Minimum number of bytes this step must be fed to make
    /// progress. Always at most 255.
    fn min_required(&self) -> u8;

    /// Maximum number of bytes this step is prepared to consume.
    /// Zero means the parse is complete.
    fn max_required(&self) -> usize;

    /// Consume `buf` and return the next step. The driver guarantees
    /// `min_required() <= buf.len() <= max_required()`, and `pos` is
    /// the stream position *after* `buf`.
    fn feed(self: Box<Self>, pos: usize, buf: &[u8]) -> Fed;
}

/// Driver for a chain of [`Step`]s.
pub struct Parser {
    pos: usize,
    step: Box<dyn Step>,
}

impl Parser {
    pub(crate) fn new(step: Box<dyn Step>) -> Self {
        Parser { pos: 0, step }
    }

    /// Number of bytes consumed so far.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Minimum number of bytes the next `feed` must supply.
    pub fn min_required(&self) -> u8 {
        self.step.min_required()
    }

    /// Maximum number of bytes the next `feed` may supply. Zero
    /// means parsing is complete.
    pub fn max_required(&self) -> usize {
        self.step.max_required()
    }

    /// Feed the parser a chunk of input.
    ///
    /// # Panics
    ///
    /// Panics if `buf.len()` is outside the
    /// `min_required()..=max_required()` range.
    pub fn feed(&mut self, buf: &[u8]) -> Result<(), ParseError> {
        assert!(
            usize::from(self.min_required()) <= buf.len() && buf.len() <= self.max_required(),
            "feed of {} bytes outside the required range {}..={}",
            buf.len(),
            self.min_required(),
            self.max_required(),
        );
        if buf.is_empty() {
            return Ok(());
        }
        self.pos = self
            .pos
            .checked_add(buf.len())
            .ok_or(ParseError::new(self.pos, ParseErrorKind::PositionOverflow))?;
        // On error the parser is left in the terminal state; parse
        // errors are not recoverable within a frame.
        let step = std::mem::replace(&mut self.step, Box::new(Stop));
        self.step = step.feed(self.pos, buf)?;
        Ok(())
    }
}

/// Drive `parser` over the whole of `buf`, requiring that it
/// completes exactly at the end of the buffer.
pub(crate) fn run_complete(parser: &mut Parser, buf: &[u8]) -> Result<(), ParseError> {
    let mut ix = 0;
    loop {
        let max = parser.max_required();
        if max == 0 {
            let leftover = buf.len() - ix;
            if leftover != 0 {
                return Err(ParseError::new(
                    parser.pos(),
                    ParseErrorKind::TrailingData(leftover),
                ));
            }
            return Ok(());
        }
        let n = max.min(buf.len() - ix);
        if n < usize::from(parser.min_required()) {
            return Err(ParseError::new(parser.pos(), ParseErrorKind::UnexpectedEof));
        }
        parser.feed(&buf[ix..ix + n])?;
        ix += n;
    }
}

/// Terminal continuation: `min = max = 0`.
pub(crate) struct Stop;

impl Step for Stop {
    fn min_required(&self) -> u8 {
        0
    }

    fn max_required(&self) -> usize {
        0
    }

    fn feed(self: Box<Self>, _pos: usize, _buf: &[u8]) -> Fed {
        unreachable!("the terminal continuation is never fed")
    }
}

pub(crate) fn stop() -> Fed {
    Ok(Box::new(Stop))
}

struct TakeByte<F> {
    cont: F,
}

impl<F> Step for TakeByte<F>
where
    F: FnOnce(usize, u8) -> Fed,
{
    fn min_required(&self) -> u8 {
        1
    }

    fn max_required(&self) -> usize {
        1
    }

    fn feed(self: Box<Self>, pos: usize, buf: &[u8]) -> Fed {
        debug_assert_eq!(buf.len(), 1);
        (self.cont)(pos, buf[0])
    }
}

/// Consume one byte and pass it to the continuation.
pub(crate) fn take_byte<F>(cont: F) -> Fed
where
    F: FnOnce(usize, u8) -> Fed + 'static,
{
    Ok(Box::new(TakeByte { cont }))
}

macro_rules! int_step {
    ($step:ident, $take:ident, $ty:ty, $read:ident) => {
        struct $step<B, F> {
            cont: F,
            _endian: PhantomData<B>,
        }

        impl<B, F> Step for $step<B, F>
        where
            B: ByteOrder,
            F: FnOnce(usize, $ty) -> Fed,
        {
            fn min_required(&self) -> u8 {
                size_of::<$ty>() as u8
            }

            fn max_required(&self) -> usize {
                size_of::<$ty>()
            }

            fn feed(self: Box<Self>, pos: usize, buf: &[u8]) -> Fed {
                debug_assert_eq!(buf.len(), size_of::<$ty>());
                let this = *self;
                (this.cont)(pos, B::$read(buf))
            }
        }

        /// Consume a fixed-width integer in byte order `B` and pass
        /// it to the continuation.
        pub(crate) fn $take<B, F>(cont: F) -> Fed
        where
            B: ByteOrder + 'static,
            F: FnOnce(usize, $ty) -> Fed + 'static,
        {
            Ok(Box::new($step {
                cont,
                _endian: PhantomData::<B>,
            }))
        }
    };
}

int_step!(TakeU16, take_u16, u16, read_u16);
int_step!(TakeU32, take_u32, u32, read_u32);
int_step!(TakeU64, take_u64, u64, read_u64);

struct TakeChars<F> {
    buf: Vec<u8>,
    remaining: usize,
    cont: F,
}

impl<F> Step for TakeChars<F>
where
    F: FnOnce(usize, Vec<u8>) -> Fed + 'static,
{
    fn min_required(&self) -> u8 {
        1
    }

    fn max_required(&self) -> usize {
        self.remaining
    }

    fn feed(self: Box<Self>, pos: usize, buf: &[u8]) -> Fed {
        debug_assert!(buf.len() <= self.remaining);
        let mut this = *self;
        this.buf.extend_from_slice(buf);
        this.remaining -= buf.len();
        if this.remaining == 0 {
            (this.cont)(pos, this.buf)
        } else {
            Ok(Box::new(this))
        }
    }
}

/// Accumulate exactly `n` bytes, possibly across several feeds, and
/// pass the complete buffer to the continuation. When `n == 0` the
/// continuation runs immediately.
pub(crate) fn take_chars<F>(pos: usize, n: usize, cont: F) -> Fed
where
    F: FnOnce(usize, Vec<u8>) -> Fed + 'static,
{
    if n == 0 {
        return cont(pos, Vec::new());
    }
    Ok(Box::new(TakeChars {
        buf: Vec::new(),
        remaining: n,
        cont,
    }))
}

struct TakeZeros<F> {
    remaining: usize,
    cont: F,
}

impl<F> Step for TakeZeros<F>
where
    F: FnOnce(usize) -> Fed + 'static,
{
    fn min_required(&self) -> u8 {
        1
    }

    fn max_required(&self) -> usize {
        self.remaining
    }

    fn feed(self: Box<Self>, pos: usize, buf: &[u8]) -> Fed {
        debug_assert!(buf.len() <= self.remaining);
        for (i, &b) in buf.iter().enumerate() {
            if b != 0 {
                // `pos` is the position after `buf`; point at the
                // offending byte itself.
                return Err(ParseError::new(
                    pos - buf.len() + i,
                    ParseErrorKind::NonZeroPadding(b),
                ));
            }
        }
        let mut this = *self;
        this.remaining -= buf.len();
        if this.remaining == 0 {
            (this.cont)(pos)
        } else {
            Ok(Box::new(this))
        }
    }
}

/// Consume `n` bytes, failing if any of them is non-zero. When
/// `n == 0` the continuation runs immediately.
pub(crate) fn take_zeros<F>(pos: usize, n: usize, cont: F) -> Fed
where
    F: FnOnce(usize) -> Fed + 'static,
{
    if n == 0 {
        return cont(pos);
    }
    Ok(Box::new(TakeZeros { remaining: n, cont }))
}

#[cfg(test)]
mod tests {
    use byteorder::{BigEndian, LittleEndian};

    use super::*;
    use crate::error::ParseErrorKind;
    use std::cell::Cell;
    use std::rc::Rc;

    fn collect_u32<B: ByteOrder + 'static>() -> (Parser, Rc<Cell<Option<u32>>>) {
        let slot = Rc::new(Cell::new(None));
        let out = slot.clone();
        let step = take_u32::<B, _>(move |_pos, x| {
            out.set(Some(x));
            stop()
        })
        .unwrap();
        (Parser::new(step), slot)
    }

    #[test]
    fn u32_little_endian() {
        let (mut p, slot) = collect_u32::<LittleEndian>();
        assert_eq!(p.min_required(), 4);
        p.feed(&[0xEF, 0xBE, 0xAD, 0xDE]).unwrap();
        assert_eq!(slot.get(), Some(0xDEADBEEF));
        assert_eq!(p.max_required(), 0);
        assert_eq!(p.pos(), 4);
    }

    #[test]
    fn u32_big_endian() {
        let (mut p, slot) = collect_u32::<BigEndian>();
        p.feed(&[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
        assert_eq!(slot.get(), Some(0xDEADBEEF));
    }

    #[test]
    fn chars_across_short_feeds() {
        let slot = Rc::new(Cell::new(None));
        let out = slot.clone();
        let step = take_chars(0, 5, move |pos, bytes| {
            assert_eq!(pos, 5);
            out.set(Some(bytes));
            stop()
        })
        .unwrap();
        let mut p = Parser::new(step);
        p.feed(b"he").unwrap();
        assert_eq!(p.max_required(), 3);
        p.feed(b"l").unwrap();
        p.feed(b"lo").unwrap();
        assert_eq!(slot.take(), Some(b"hello".to_vec()));
        assert_eq!(p.max_required(), 0);
    }

    #[test]
    fn zeros_reject_nonzero_at_exact_offset() {
        let step = take_zeros(0, 4, |_pos| stop()).unwrap();
        let mut p = Parser::new(step);
        p.feed(&[0, 0]).unwrap();
        let err = p.feed(&[0, 7]).unwrap_err();
        assert_eq!(err.pos, 3);
        assert_eq!(err.kind, ParseErrorKind::NonZeroPadding(7));
    }

    #[test]
    fn run_complete_rejects_trailing_bytes() {
        let step = take_byte(|_pos, _b| stop()).unwrap();
        let mut p = Parser::new(step);
        let err = run_complete(&mut p, &[1, 2]).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::TrailingData(1));
    }

    #[test]
    fn run_complete_rejects_truncated_input() {
        let step = take_u64::<LittleEndian, _>(|_pos, _x| stop()).unwrap();
        let mut p = Parser::new(step);
        let err = run_complete(&mut p, &[1, 2, 3]).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::UnexpectedEof);
    }
}
