use std::{fmt, io};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    Malformed = 1,       // magic/field inconsistency in an input file
    Truncated = 2,       // structural read past end of the input
    Unsupported = 3,     // file type or option we don't handle
    IntegerOverflow = 4,
    Usage = 5,
    NotFound = 6,        // bad data source name or missing file
    Dwarf = 7,
    Format = 8,
    Sanity = 9,
}

#[derive(Debug)]
pub enum ErrorEnum {
    IO(io::Error),
    Code(ErrorCode),
}

#[derive(Clone)]
pub struct Error {
    pub error: ErrorEnum,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(code: ErrorCode, message: String) -> Error {
        Error {error: ErrorEnum::Code(code), message}
    }

    pub fn from_io_error(e: io::Error, message: String) -> Error {
        Error {error: ErrorEnum::IO(e), message}
    }

    pub fn is_usage(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::Usage) => true, _ => false, } }
    pub fn is_unsupported(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::Unsupported) => true, _ => false, } }
    pub fn is_not_found(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::NotFound) => true, _ => false, } }
    pub fn is_integer_overflow(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::IntegerOverflow) => true, _ => false, } }
    pub fn is_io_not_found(&self) -> bool { match &self.error { ErrorEnum::IO(e) if e.kind() == io::ErrorKind::NotFound => true, _ => false, } }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error {error: ErrorEnum::IO(error), message: String::new()}
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(error: std::num::ParseIntError) -> Self {
        Error {error: ErrorEnum::Code(ErrorCode::Format), message: format!("{}", error)}
    }
}

impl From<gimli::Error> for Error {
    fn from(error: gimli::Error) -> Self {
        Error {error: ErrorEnum::Code(ErrorCode::Dwarf), message: format!("{}", error)}
    }
}

impl From<regex::Error> for Error {
    fn from(error: regex::Error) -> Self {
        Error {error: ErrorEnum::Code(ErrorCode::Usage), message: format!("{}", error)}
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(error: std::str::Utf8Error) -> Self {
        Error {error: ErrorEnum::Code(ErrorCode::Format), message: format!("{}", error)}
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(error: std::string::FromUtf8Error) -> Self {
        Error {error: ErrorEnum::Code(ErrorCode::Format), message: format!("{}", error)}
    }
}

impl From<std::fmt::Error> for Error {
    fn from(error: std::fmt::Error) -> Self {
        Error {error: ErrorEnum::Code(ErrorCode::Format), message: format!("{}", error)}
    }
}

// For printing to log.
impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error {
            &ErrorEnum::Code(code) => write!(f, "{}: {}", code as i64, self.message),
            ErrorEnum::IO(error) => write!(f, "{}: {}", self.message, error),
        }
    }
}

// For showing to the user.
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error {
            &ErrorEnum::Code(_) => write!(f, "{}", self.message),
            ErrorEnum::IO(error) if self.message.is_empty() => write!(f, "{}", error),
            ErrorEnum::IO(error) => write!(f, "{}: {}", self.message, error),
        }
    }
}

impl Clone for ErrorEnum {
    fn clone(&self) -> Self {
        match self {
            Self::Code(c) => Self::Code(c.clone()),
            Self::IO(e) => Self::IO(match e.raw_os_error() {
                Some(os) => io::Error::from_raw_os_error(os),
                None => e.kind().into(),
            }),
        }
    }
}

#[macro_export]
macro_rules! error {
    ($code:ident, $($arg:tt)*) => (
        Error {error: ErrorEnum::Code(ErrorCode::$code), message: format!($($arg)*)}
    );
}

#[macro_export]
macro_rules! err {
    ($code:ident, $($arg:tt)*) => (
        Err(error!($code, $($arg)*))
    );
}
