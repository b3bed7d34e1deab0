//! Decoder for Python's `pickle` serialization format, protocols 0-5.
//!
//! [`load`] runs the pickle virtual machine over a byte buffer and
//! returns the decoded [`Value`] together with the unconsumed suffix
//! of the input. Python types with a natural host mapping (numbers,
//! strings, bytes, lists, tuples, dicts, sets) come back as plain
//! values; everything else — class references and reconstructed
//! object instances — comes back as [`Value::Global`] and
//! [`ObjectDescriptor`], which callers can rewrite through a resolver:
//!
//! ```
//! use unpickle::{load, Options, Value};
//!
//! // pickle.dumps(1, protocol=4)
//! let (value, rest) = load(b"\x80\x04K\x01.", &Options::new())?;
//! assert_eq!(value, Value::Int(1));
//! assert!(rest.is_empty());
//! # Ok::<(), unpickle::Error>(())
//! ```
//!
//! No Python code is executed, and class references are never resolved
//! to host constructors unless a caller-supplied resolver does so.
//! Self-referential inputs (a container that contains itself through
//! the memo) cannot be represented in a value-oriented result; the
//! inner reference is left as an opaque [`Value::MemoRef`].

mod cursor;
mod decode;
mod error;
mod memo;
mod opcodes;
mod resolve;
mod types;

pub use crate::error::{Error, ErrorKind};
pub use crate::types::{ObjectDescriptor, Value};

use crate::decode::Machine;

/// Rewrites an [`ObjectDescriptor`] into a value. `Ok(None)` means
/// "not applicable, keep the descriptor"; `Err` aborts the decode.
pub type ObjectResolver<'r> =
    dyn Fn(&ObjectDescriptor) -> Result<Option<Value>, String> + 'r;

/// Maps a persistent id (the operand of `PERSID`/`BINPERSID`) to the
/// object it stands for.
pub type PersistentIdResolver<'r> = dyn Fn(&Value) -> Result<Value, String> + 'r;

/// Per-call decode configuration.
#[derive(Default)]
pub struct Options<'r> {
    pub(crate) object_resolver: Option<Box<ObjectResolver<'r>>>,
    pub(crate) persistent_id_resolver: Option<Box<PersistentIdResolver<'r>>>,
}

impl<'r> Options<'r> {
    pub fn new() -> Self {
        Options::default()
    }

    /// Run `resolver` on every object descriptor as it is finalized,
    /// after the built-in rewrites (getattr chains, bytearray, set
    /// reductions).
    pub fn with_object_resolver(
        mut self,
        resolver: impl Fn(&ObjectDescriptor) -> Result<Option<Value>, String> + 'r,
    ) -> Self {
        self.object_resolver = Some(Box::new(resolver));
        self
    }

    /// Resolve persistent ids. Without this, any `PERSID`/`BINPERSID`
    /// opcode fails the decode with [`ErrorKind::MissingResolver`].
    pub fn with_persistent_id_resolver(
        mut self,
        resolver: impl Fn(&Value) -> Result<Value, String> + 'r,
    ) -> Self {
        self.persistent_id_resolver = Some(Box::new(resolver));
        self
    }
}

/// Decode one pickle from the front of `data`.
///
/// Returns the decoded value and the unconsumed suffix after the
/// `STOP` opcode; trailing bytes are tolerated and handed back to the
/// caller. The first malformed opcode or operand aborts with an
/// [`Error`] naming the problem and its byte offset.
pub fn load<'d>(data: &'d [u8], options: &Options<'_>) -> Result<(Value, &'d [u8]), Error> {
    Machine::new(data, options).run()
}
