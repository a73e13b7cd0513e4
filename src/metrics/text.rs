use std::{
    borrow::Borrow,
    fmt,
    hash::{Hash, Hasher},
    ops::Deref,
};

use allocator_api2::{
    alloc::{Allocator, Global},
    vec::Vec,
};

/// A growable UTF-8 string in an arbitrary allocator. Metrics keys and
/// rendered output live in these so that they come out of the metrics block
/// store rather than the heap being measured.
pub struct MetricsString<A: Allocator = Global> {
    bytes: Vec<u8, A>,
}

impl MetricsString<Global> {
    pub fn new() -> Self {
        Self::new_in(Global)
    }
}

impl Default for MetricsString<Global> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Allocator> MetricsString<A> {
    pub fn new_in(alloc: A) -> Self {
        Self {
            bytes: Vec::new_in(alloc),
        }
    }

    pub fn from_str_in(s: &str, alloc: A) -> Self {
        let mut string = Self::new_in(alloc);
        string.push_str(s);
        string
    }

    pub fn as_str(&self) -> &str {
        // SAFETY: Only ever appended to from `&str`s, and only ever truncated
        //         at char boundaries.
        unsafe { std::str::from_utf8_unchecked(&self.bytes) }
    }

    pub fn push_str(&mut self, s: &str) {
        self.bytes.extend_from_slice(s.as_bytes());
    }

    pub fn push(&mut self, c: char) {
        let mut buf = [0; 4];
        self.push_str(c.encode_utf8(&mut buf));
    }

    /// Cut down to at most `len` bytes, backing off to a char boundary
    pub fn truncate(&mut self, len: usize) {
        if len >= self.bytes.len() {
            return;
        }
        let mut len = len;
        while !self.as_str().is_char_boundary(len) {
            len -= 1;
        }
        self.bytes.truncate(len);
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    pub fn allocator(&self) -> &A {
        self.bytes.allocator()
    }
}

impl<A: Allocator + Clone> Clone for MetricsString<A> {
    fn clone(&self) -> Self {
        Self::from_str_in(self.as_str(), self.allocator().clone())
    }
}

impl<A: Allocator> Deref for MetricsString<A> {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl<A: Allocator> Borrow<str> for MetricsString<A> {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

impl<A: Allocator> AsRef<str> for MetricsString<A> {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

// Must hash exactly like `str`, or `Borrow<str>` lookups break
impl<A: Allocator> Hash for MetricsString<A> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_str().hash(state)
    }
}

impl<A: Allocator> PartialEq for MetricsString<A> {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl<A: Allocator> Eq for MetricsString<A> {}

impl<A: Allocator> PartialEq<str> for MetricsString<A> {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl<A: Allocator> PartialEq<&str> for MetricsString<A> {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl<A: Allocator> fmt::Write for MetricsString<A> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push_str(s);
        Ok(())
    }
}

impl<A: Allocator> fmt::Display for MetricsString<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<A: Allocator> fmt::Debug for MetricsString<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}
