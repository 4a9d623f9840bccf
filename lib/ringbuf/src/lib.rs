// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ring buffer for tracing firmware update code
//!
//! Every crate in the update path records what it did into a small static
//! ring buffer rather than printing: there is no console to print to during
//! early boot, and a debugger (or a host test) can read the buffer back out
//! after the fact.
//!
//! ## Constraints
//!
//! The type in the ring buffer must implement both `Copy` and `PartialEq`.
//!
//! If you use the variants of the `ringbuf!` macro that leave the name of the
//! data structure implicit, you can only have one per module. (You can lift
//! this constraint by providing a name.)
//!
//! ## Creating a ring buffer
//!
//! Ring buffers are instantiated with the [`ringbuf!`] macro, to which one
//! must provide the type of per-entry payload, the number of entries, and a
//! static initializer:
//!
//! ```ignore
//! #[derive(Copy, Clone, PartialEq)]
//! enum Trace {
//!     None,
//!     Repaired(MdataCopy),
//! }
//!
//! ringbuf!(Trace, 16, Trace::None);
//! ```
//!
//! Entries are generated with [`ringbuf_entry!`]:
//!
//! ```ignore
//! ringbuf_entry!(Trace::Repaired(MdataCopy::Secondary));
//! ```
//!
//! Recording the same payload from the same line twice in a row bumps the
//! `count` of the previous entry instead of consuming a new slot, so a
//! polling loop does not wipe out the history that led up to it.
//!
//! ## Reading a ring buffer back
//!
//! [`Ringbuf::iter`] walks the live entries oldest first. Tests use it (via
//! [`snapshot`]) to assert that a code path left the trace it should have.

#![cfg_attr(not(test), no_std)]

#[cfg(all(feature = "std", not(test)))]
extern crate std;

/// Re-export the lock we use so that code generated by the macros is
/// guaranteed to be able to find it.
pub use spin::Mutex;

/// Declares a ringbuffer in the current module or context.
///
/// `ringbuf!(NAME, Type, N, expr)` makes a ringbuffer named `NAME`,
/// containing entries of type `Type`, with room for `N` such entries, all of
/// which are initialized to `expr`.
///
/// The resulting ringbuffer will be static, so `NAME` should be uppercase.
///
/// The actual type of `name` will be `Mutex<Ringbuf<T, N>>`.
///
/// To support the common case of having one quickly-installed ringbuffer per
/// module, if you omit the name, it will default to `__RINGBUF`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[used]
        static $name: $crate::Mutex<$crate::Ringbuf<$t, $n>> =
            $crate::Mutex::new($crate::Ringbuf {
                last: None,
                buffer: [$crate::RingbufEntry {
                    line: 0,
                    generation: 0,
                    count: 0,
                    payload: $init,
                }; $n],
            });
    };
    ($t:ty, $n:expr, $init:expr) => {
        $crate::ringbuf!(__RINGBUF, $t, $n, $init);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        const _: $t = $init;
    };
    ($t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        const _: $t = $init;
    };
}

/// Inserts data into a named ringbuffer (which should have been declared with
/// the `ringbuf!` macro).
///
/// `ringbuf_entry!(NAME, expr)` will insert `expr` into the ringbuffer called
/// `NAME`.
///
/// If you declared your ringbuffer without a name, you can also use this
/// without a name, and it will default to `__RINGBUF`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        // Evaluate both buf and payload, without letting them access each
        // other, by evaluating them in a tuple where each cannot
        // accidentally use the other's binding.
        let (p, buf) = ($payload, &$buf);
        $crate::Ringbuf::entry(
            &mut *$crate::Mutex::lock(buf),
            line!() as u16,
            p,
        );
    }};
    ($payload:expr) => {
        $crate::ringbuf_entry!(__RINGBUF, $payload);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        let _ = &$buf;
        let _ = &$payload;
    }};
    ($payload:expr) => {{
        let _ = &$payload;
    }};
}

/// Inserts data into a ringbuffer at the root of this crate.
#[cfg(not(feature = "disabled"))]
#[allow(clippy::crate_in_macro_def)]
#[macro_export]
macro_rules! ringbuf_entry_root {
    ($buf:ident, $payload:expr) => {
        $crate::ringbuf_entry!(crate::$buf, $payload);
    };
    ($payload:expr) => {
        $crate::ringbuf_entry!(crate::__RINGBUF, $payload);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf_entry_root {
    ($buf:ident, $payload:expr) => {{
        let _ = &$payload;
    }};
    ($payload:expr) => {{
        let _ = &$payload;
    }};
}

///
/// The structure of a single [`Ringbuf`] entry, carrying a payload of arbitrary
/// type.  When a ring buffer entry is generated with an identical payload to
/// the most recent entry (in terms of both `line` and `payload`), `count` will
/// be incremented rather than generating a new entry.
///
#[derive(Debug, Copy, Clone)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

///
/// A ring buffer of parametrized type and size.  In practice, instantiating
/// this directly is strange -- see the [`ringbuf!`] macro.
///
#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    pub last: Option<usize>,
    pub buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, { N }> {
    pub fn entry(&mut self, line: u16, payload: T) {
        // The first insertion has no previous entry to reuse; treating None
        // as an out-of-range index also lands that entry in slot 0.
        let last = self.last.unwrap_or(usize::MAX);

        // `get_mut` also covers a corrupted `last`, in which case we simply
        // start over at 0.
        if let Some(ent) = self.buffer.get_mut(last) {
            if ent.line == line && ent.payload == payload {
                // Only reuse this entry if we don't overflow the count.
                if let Some(new_count) = ent.count.checked_add(1) {
                    ent.count = new_count;
                    return;
                }
            }
        }

        // Not a remainder: most of our targets have no hardware divide, and
        // this form turns usize::MAX into 0 for the starting condition.
        let ndx = {
            let last_plus_1 = last.wrapping_add(1);
            if last_plus_1 >= self.buffer.len() {
                0
            } else {
                last_plus_1
            }
        };

        let ent = &mut self.buffer[ndx];
        *ent = RingbufEntry {
            line,
            payload,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };

        self.last = Some(ndx);
    }

    /// Iterates over the entries that have actually been written, oldest
    /// first.
    pub fn iter(&self) -> impl Iterator<Item = &RingbufEntry<T>> + '_ {
        let start = match self.last {
            Some(last) if last < N => last + 1,
            _ => 0,
        };
        self.buffer[start..]
            .iter()
            .chain(self.buffer[..start].iter())
            .filter(|ent| ent.count != 0)
    }

    /// Returns the most recently recorded payload, if any.
    pub fn latest(&self) -> Option<T> {
        self.last
            .and_then(|ndx| self.buffer.get(ndx))
            .map(|ent| ent.payload)
    }

    /// Returns `true` if any live entry carries `payload`.
    pub fn contains(&self, payload: T) -> bool {
        self.iter().any(|ent| ent.payload == payload)
    }
}

/// Copies the payloads of a locked ring buffer out, oldest first.
///
/// Only available to host builds, where tests want to look at what a code
/// path recorded.
#[cfg(any(test, feature = "std"))]
pub fn snapshot<T: Copy + PartialEq, const N: usize>(
    buf: &Mutex<Ringbuf<T, N>>,
) -> std::vec::Vec<T> {
    buf.lock().iter().map(|ent| ent.payload).collect()
}
