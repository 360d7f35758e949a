use arcstr::ArcStr;

/// Strng is a cheaply clonable, immutable string. Hostnames, profile ids and
/// plugin ids are passed around constantly; an Arc-backed string keeps those
/// clones to a refcount bump.
pub type Strng = ArcStr;

pub fn new<A: AsRef<str>>(s: A) -> Strng {
	ArcStr::from(s.as_ref())
}

pub use arcstr::format;
pub use arcstr::literal;
