use std::borrow::Cow;
use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::core::{ArcStr, Hash32};

/// Keys longer than this are abbreviated with a content hash suffix.
pub const ABBREVIATE_LEN: usize = 128;

/// Number of hex digits of the BLAKE3 hash kept in an abbreviated key.
const HASH_DIGITS: usize = 32;

const HASH_MARKER: &str = "..b3/";

/// Shortens `s` to at most [`ABBREVIATE_LEN`] bytes, replacing the tail with
/// a hash of the whole string.
pub fn abbreviate(s: &str) -> Cow<'_, str> {
    if s.len() <= ABBREVIATE_LEN {
        return Cow::Borrowed(s);
    }

    let keep = ABBREVIATE_LEN - HASH_MARKER.len() - HASH_DIGITS;
    let cut = (0..=keep)
        .rev()
        .find(|&i| s.is_char_boundary(i))
        .unwrap_or(0);

    let hash = Hash32::hash(s).to_hex();
    Cow::Owned(format!("{}{HASH_MARKER}{}", &s[..cut], &hash[..HASH_DIGITS]))
}

/// A content fingerprint.
///
/// The key is a deterministic string derived from the fingerprinted value,
/// composite values embed the keys of their parts. Equality, ordering and
/// hashing look at the key only; the three flags are metadata riding on top
/// of it.
#[derive(Clone)]
pub struct Slug {
    key: ArcStr,
    cacheable: bool,
    output: bool,
    dependency: bool,
}

impl Slug {
    pub fn new(key: impl Into<ArcStr>) -> Self {
        Self {
            key: key.into(),
            cacheable: true,
            output: false,
            dependency: false,
        }
    }

    /// Fingerprints an ordered list of parts as `[a,b,c]`.
    pub fn list<I>(parts: I) -> Self
    where
        I: IntoIterator,
        I::Item: Fingerprint,
    {
        let parts: Vec<_> = parts.into_iter().map(|part| part.fingerprint()).collect();
        Self::new(format!("[{}]", join(&parts)))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// `false` means results for this key are never shared: every run
    /// executes afresh.
    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    /// Marks a produced artifact rather than a request.
    pub fn is_output(&self) -> bool {
        self.output
    }

    /// Marks a value whose appearance as an input is a real dependency edge.
    pub fn is_dependency(&self) -> bool {
        self.dependency
    }

    pub fn uncacheable(&self) -> Self {
        Self {
            cacheable: false,
            ..self.clone()
        }
    }

    pub fn as_output(&self) -> Self {
        Self {
            output: true,
            ..self.clone()
        }
    }

    pub fn as_dependency(&self) -> Self {
        Self {
            dependency: true,
            ..self.clone()
        }
    }
}

/// Joins fingerprint keys with commas.
pub(crate) fn join(parts: &[Slug]) -> String {
    let mut acc = String::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            acc.push(',');
        }
        acc.push_str(part.key());
    }
    acc
}

impl PartialEq for Slug {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Slug {}

impl Hash for Slug {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl PartialOrd for Slug {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Slug {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

impl Display for Slug {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

impl Debug for Slug {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Slug({})", self.key)?;
        if !self.cacheable {
            f.write_str(" uncacheable")?;
        }
        if self.output {
            f.write_str(" output")?;
        }
        if self.dependency {
            f.write_str(" dependency")?;
        }
        Ok(())
    }
}

impl From<&str> for Slug {
    fn from(value: &str) -> Self {
        Slug::new(value)
    }
}

impl From<String> for Slug {
    fn from(value: String) -> Self {
        Slug::new(value)
    }
}

/// Anything that can produce a content fingerprint.
pub trait Fingerprint {
    fn fingerprint(&self) -> Slug;
}

impl Fingerprint for Slug {
    fn fingerprint(&self) -> Slug {
        self.clone()
    }
}

impl<T: Fingerprint + ?Sized> Fingerprint for &T {
    fn fingerprint(&self) -> Slug {
        (**self).fingerprint()
    }
}

impl<T: Fingerprint + ?Sized> Fingerprint for Arc<T> {
    fn fingerprint(&self) -> Slug {
        (**self).fingerprint()
    }
}

impl Fingerprint for str {
    fn fingerprint(&self) -> Slug {
        Slug::new(self)
    }
}

impl Fingerprint for String {
    fn fingerprint(&self) -> Slug {
        Slug::new(self.as_str())
    }
}

impl<T: Fingerprint> Fingerprint for [T] {
    fn fingerprint(&self) -> Slug {
        Slug::list(self)
    }
}

impl<T: Fingerprint> Fingerprint for Vec<T> {
    fn fingerprint(&self) -> Slug {
        Slug::list(self)
    }
}

macro_rules! impl_fingerprint_display {
    ($($T:ty),*) => {
        $(
            impl Fingerprint for $T {
                fn fingerprint(&self) -> Slug {
                    Slug::new(self.to_string())
                }
            }
        )*
    };
}

impl_fingerprint_display!(bool, char, i32, i64, u32, u64, usize, f64);

/// Builds a [`Slug`] by interpolating fingerprints into a format string.
///
/// Every positional argument is fingerprinted first, so nested jobs and
/// stamped values contribute their own keys:
///
/// ```
/// use jobslug::slug;
///
/// let key = slug!("square({})", 3);
/// assert_eq!(key.key(), "square(3)");
/// assert_eq!(slug!("pair({},{})", "a", vec![1, 2]).key(), "pair(a,[1,2])");
/// ```
#[macro_export]
macro_rules! slug {
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::Slug::new(::std::format!(
            $fmt
            $(, $crate::Fingerprint::fingerprint(&$arg))*
        ))
    };
}
