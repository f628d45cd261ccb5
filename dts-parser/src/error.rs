use std::{
    fmt,
    path::{Path, PathBuf},
};

/// A position in a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub file: PathBuf,
    pub line: Option<u32>,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}", self.file.display(), line),
            None => write!(f, "{}", self.file.display()),
        }
    }
}

/// Error raised while parsing a devicetree or building a model on top of it.
///
/// Every failure in the devicetree stack is reported through this single type.
/// The message is meant for humans and names the offending entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    location: Option<Location>,
    message: String,
}

impl Error {
    /// Creates an error without a source location.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            location: None,
            message: message.into(),
        }
    }

    /// Creates an error pointing at a line of a source file.
    pub fn at(file: impl AsRef<Path>, line: u32, message: impl Into<String>) -> Self {
        Self {
            location: Some(Location {
                file: file.as_ref().to_path_buf(),
                line: Some(line),
            }),
            message: message.into(),
        }
    }

    /// Creates an error pointing at a whole file.
    pub fn in_file(file: impl AsRef<Path>, message: impl Into<String>) -> Self {
        Self {
            location: Some(Location {
                file: file.as_ref().to_path_buf(),
                line: None,
            }),
            message: message.into(),
        }
    }

    pub fn location(&self) -> Option<&Location> {
        self.location.as_ref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(loc) => write!(f, "{}: {}", loc, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_with_location() {
        for (err, exp) in [
            (Error::new("bad"), "bad"),
            (Error::in_file("a.yaml", "bad"), "a.yaml: bad"),
            (Error::at("b.dts", 12, "missing ';'"), "b.dts:12: missing ';'"),
        ] {
            assert_eq!(err.to_string(), exp);
        }
    }
}
