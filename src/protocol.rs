use std::fmt;

/// Byte that terminates every line in both directions
pub const TERMINATOR: u8 = b'\r';

/// Argument that turns any command family into a query
pub const QUERY: &str = "?";

/// Convert a line to bytes, terminated by `'\r'`
pub fn to_bytes(line: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(TERMINATOR);
    buf
}

/// Command families, identified by their two letter prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// `PW` - main power
    Power,
    /// `SI` - selected input source
    InputSource,
    /// `MS` - surround mode
    SurroundMode,
    /// `MV` - master volume
    MasterVolume,
}

impl Family {
    /// The two letter prefix used on the wire
    pub fn prefix(self) -> &'static str {
        match self {
            Family::Power => "PW",
            Family::InputSource => "SI",
            Family::SurroundMode => "MS",
            Family::MasterVolume => "MV",
        }
    }

    /// Response matcher for this family
    pub fn matcher(self) -> FamilyMatcher {
        FamilyMatcher::new(self)
    }
}

/// A single command, e.g. `MV40` or `SI?`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    family: Family,
    argument: String,
}

impl Command {
    /// Create a command with the argument appended verbatim
    pub fn new(family: Family, argument: impl Into<String>) -> Self {
        Self {
            family,
            argument: argument.into(),
        }
    }

    /// Create a query (`XX?`) for the family
    pub fn query(family: Family) -> Self {
        Self::new(family, QUERY)
    }

    /// Create a command from free text, uppercased the way the receiver expects
    pub fn from_text(family: Family, text: &str) -> Self {
        Self::new(family, text.to_uppercase())
    }

    /// Get the command family
    pub fn family(&self) -> Family {
        self.family
    }

    /// Get the argument following the prefix
    pub fn argument(&self) -> &str {
        &self.argument
    }

    /// Encode the command for the wire, including the terminator
    pub fn encode(&self) -> Vec<u8> {
        to_bytes(&self.to_string())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.family.prefix(), self.argument)
    }
}

/// Decides whether a line from the receiver answers a pending command
///
/// Lines that are not accepted are unsolicited: they are logged and dropped,
/// and never complete the pending command.
pub trait ResponseMatcher: Send + Sync {
    /// Return true if `line` belongs to the pending command
    fn accepts(&self, line: &str) -> bool;
}

impl<F> ResponseMatcher for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn accepts(&self, line: &str) -> bool {
        self(line)
    }
}

/// Accepts every line; used when draining between commands
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyLine;

impl ResponseMatcher for AnyLine {
    fn accepts(&self, _line: &str) -> bool {
        true
    }
}

/// Accepts the lines a command family answers with
///
/// Power, input and mode accept anything carrying their prefix. Volume only
/// accepts the prefix followed by digits, which skips advisories such as
/// `MVMAX 800`.
#[derive(Debug, Clone, Copy)]
pub struct FamilyMatcher {
    family: Family,
}

impl FamilyMatcher {
    pub fn new(family: Family) -> Self {
        Self { family }
    }
}

impl ResponseMatcher for FamilyMatcher {
    fn accepts(&self, line: &str) -> bool {
        let Some(rest) = line.strip_prefix(self.family.prefix()) else {
            return false;
        };

        match self.family {
            Family::MasterVolume => !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()),
            _ => true,
        }
    }
}

/// Split complete `'\r'`-terminated lines off the front of `buf`
///
/// Bytes after the last terminator stay in `buf` for the next read.
pub(crate) fn drain_lines(buf: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();

    while let Some(pos) = buf.iter().position(|&b| b == TERMINATOR) {
        let raw: Vec<u8> = buf.drain(..=pos).collect();
        lines.push(String::from_utf8_lossy(&raw[..pos]).into_owned());
    }

    lines
}

/// Strip the two letter family prefix from a response line
pub(crate) fn strip_prefix(line: &str) -> String {
    line.get(2..).unwrap_or_default().to_string()
}
