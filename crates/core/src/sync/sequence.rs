//! Modular arithmetic for 16-bit sequence numbers and 32-bit stream timestamps
//!
//! All comparisons interpret the wrapped difference as signed, so ordering
//! holds as long as the two values are within half the counter range.

/// Signed distance `a - b` between two sequence numbers
///
/// # Example
/// ```
/// use multiroom_core::sync::sequence::seq_diff;
///
/// assert_eq!(seq_diff(0, 65535), 1);
/// assert_eq!(seq_diff(65535, 0), -1);
/// assert_eq!(seq_diff(10, 5), 5);
/// ```
#[inline]
pub fn seq_diff(a: u16, b: u16) -> i32 {
    a.wrapping_sub(b) as i16 as i32
}

/// True when `a` comes after `b` in sequence order
#[inline]
pub fn seq_is_after(a: u16, b: u16) -> bool {
    seq_diff(a, b) > 0
}

/// Signed distance `a - b` between two stream timestamps
///
/// # Example
/// ```
/// use multiroom_core::sync::sequence::ts_diff;
///
/// assert_eq!(ts_diff(100, u32::MAX - 99), 200);
/// assert_eq!(ts_diff(u32::MAX - 99, 100), -200);
/// ```
#[inline]
pub fn ts_diff(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

/// True when timestamp `a` comes after `b`
#[inline]
pub fn ts_is_after(a: u32, b: u32) -> bool {
    ts_diff(a, b) > 0
}

/// Timestamp `num/den` of the way from `from` to `to`, wrapping
pub fn ts_lerp(from: u32, to: u32, num: i64, den: i64) -> u32 {
    if den == 0 {
        return from;
    }
    let span = ts_diff(to, from) as i64;
    from.wrapping_add((span * num / den) as i32 as u32)
}

/// Unwraps a 16-bit sequence into a monotonic 64-bit index
///
/// Each value is placed relative to the previous one, so the counter may
/// wrap any number of times.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceUnwrapper {
    last: Option<i64>,
}

impl SequenceUnwrapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extended index of `seq` relative to the last value seen, without updating
    pub fn peek(&self, seq: u16) -> i64 {
        match self.last {
            Some(last) => last + seq_diff(seq, last as u16) as i64,
            None => seq as i64,
        }
    }

    /// Extend `seq` and make it the new reference
    pub fn unwrap(&mut self, seq: u16) -> i64 {
        let ext = self.peek(seq);
        self.last = Some(ext);
        ext
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}
