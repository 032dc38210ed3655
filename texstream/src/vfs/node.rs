//! File content states.
//!
//! A mounted file is in exactly one of three states, and the state is an
//! explicit variant rather than a sentinel on a byte buffer. `Eager` is
//! terminal; reads promote the other two in place.

/// A byte range inside a named bundle body.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BundleSlice {
    pub bundle: String,
    pub start: u64,
    pub end: u64,
}

impl BundleSlice {
    pub fn new(bundle: &str, start: u64, end: u64) -> Self {
        Self {
            bundle: bundle.to_string(),
            start,
            end,
        }
    }

    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Content of one VFS file.
///
/// - `Eager`: bytes are resident.
/// - `Lazy`: the bundle body is resident; the slice is taken on first read.
/// - `Deferred`: the bundle body is absent; a byte-range fetch is required
///   before the bytes exist anywhere.
#[derive(Debug, Clone)]
pub enum FileContent {
    Eager(Vec<u8>),
    Lazy(BundleSlice),
    Deferred(BundleSlice),
}

impl FileContent {
    pub fn state_name(&self) -> &'static str {
        match self {
            FileContent::Eager(_) => "eager",
            FileContent::Lazy(_) => "lazy",
            FileContent::Deferred(_) => "deferred",
        }
    }

    pub fn is_eager(&self) -> bool {
        matches!(self, FileContent::Eager(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_len() {
        let slice = BundleSlice::new("fonts-cm", 128, 256);
        assert_eq!(slice.len(), 128);
        assert!(!slice.is_empty());
        assert!(BundleSlice::new("fonts-cm", 7, 7).is_empty());
    }

    #[test]
    fn test_state_names() {
        assert_eq!(FileContent::Eager(vec![]).state_name(), "eager");
        assert_eq!(
            FileContent::Lazy(BundleSlice::new("b", 0, 1)).state_name(),
            "lazy"
        );
        assert_eq!(
            FileContent::Deferred(BundleSlice::new("b", 0, 1)).state_name(),
            "deferred"
        );
    }
}
