use std::{borrow::Cow, fmt};

/// Grouping key selecting which timers a run loop pass may fire.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Mode(Cow<'static, str>);

impl Mode {
    /// Mode used by the scheduling helpers.
    pub const DEFAULT: Mode = Mode::from_static("default");

    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Mode {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for Mode {
    fn from(name: &'static str) -> Self {
        Self::from_static(name)
    }
}

impl From<String> for Mode {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_borrowed_equals_owned() {
        assert_eq!(Mode::from_static("tracking"), Mode::new("tracking"));
        assert_eq!(Mode::default(), Mode::DEFAULT);
        assert_eq!(Mode::DEFAULT.as_str(), "default");
    }

    #[test]
    fn test_display() {
        assert_eq!(Mode::from("modal").to_string(), "modal");
    }
}
