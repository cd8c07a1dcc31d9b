use std::fmt;

/// Remote log verbosity. A record of severity `S` is buffered iff the active level is `>= S`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum Verbosity {
    #[default]
    NoLogs = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Verbose = 4,
}

impl Verbosity {
    /// Clamps out-of-range integers: negatives to `NoLogs`, anything above 4 to `Verbose`.
    pub fn from_i64(value: i64) -> Self {
        match value {
            i64::MIN..=0 => Verbosity::NoLogs,
            1 => Verbosity::Warn,
            2 => Verbosity::Info,
            3 => Verbosity::Debug,
            _ => Verbosity::Verbose,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        Self::from_i64(i64::from(value))
    }

    /// Whether a record of `severity` passes this level.
    pub fn permits(self, severity: Verbosity) -> bool {
        severity != Verbosity::NoLogs && self >= severity
    }
}

impl fmt::Display for Verbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Verbosity::NoLogs => "none",
            Verbosity::Warn => "warn",
            Verbosity::Info => "info",
            Verbosity::Debug => "debug",
            Verbosity::Verbose => "verbose",
        };
        f.write_str(name)
    }
}
