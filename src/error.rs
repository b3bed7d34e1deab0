use std::fmt;

/// A fatal decode error: what went wrong and where in the input.
///
/// Decoding stops at the first error; there is no partial recovery.
#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
    /// Byte offset into the input at which the error was detected.
    pub offset: usize,
}

#[derive(Debug)]
pub enum ErrorKind {
    /// PROTO opcode with a version greater than 5
    UnsupportedProtocol(u8),
    /// An opcode this decoder deliberately rejects (extension
    /// registry, out-of-band buffers)
    UnsupportedFeature(&'static str),
    /// PERSID/BINPERSID seen without a persistent-id resolver
    MissingResolver(String),
    /// A user-supplied resolver reported a failure
    Resolver(String),
    /// A read ran past the end of the input
    Truncated,
    /// An operand that does not parse as its declared type
    MalformedOperand(String),
    /// A byte outside the defined opcode set
    UnknownOpcode(u8),
    /// Pop on an empty stack, pop-to-mark with no mark, or leftover
    /// operands at STOP
    StackUnderflow(&'static str),
    /// A mutator or reduction opcode found an incompatible value at
    /// the top of the stack
    TypeMismatch(String),
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, offset: usize) -> Self {
        Error { kind, offset }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (at offset {})", self.kind, self.offset)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::UnsupportedProtocol(n) => {
                write!(f, "unsupported pickle protocol: {n}")
            }
            ErrorKind::UnsupportedFeature(what) => write!(f, "{what} not supported"),
            ErrorKind::MissingResolver(id) => write!(
                f,
                "encountered persistent id: {id}, but no resolver was specified"
            ),
            ErrorKind::Resolver(msg) => write!(f, "resolver failed: {msg}"),
            ErrorKind::Truncated => write!(f, "unexpected end of pickle stream"),
            ErrorKind::MalformedOperand(msg) => write!(f, "malformed operand: {msg}"),
            ErrorKind::UnknownOpcode(op) => write!(f, "unknown pickle opcode: 0x{op:02x}"),
            ErrorKind::StackUnderflow(ctx) => write!(f, "pickle stack underflow: {ctx}"),
            ErrorKind::TypeMismatch(msg) => write!(f, "type mismatch: {msg}"),
        }
    }
}

impl std::error::Error for Error {}
