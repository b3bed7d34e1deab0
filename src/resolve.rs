//! Pop-time finalization.
//!
//! Every value removed from the operand stack passes through here:
//! memo handles are swapped for their stored value (resolved in place,
//! so later GETs of the same slot see the resolved form), and object
//! descriptors go through the built-in resolver and then the caller's
//! resolver. Container builders pop their inputs first, so nested
//! values are always finalized before the container that holds them.

use crate::error::{Error, ErrorKind};
use crate::memo::Memo;
use crate::types::{ObjectDescriptor, Value};
use crate::Options;

pub(crate) struct Finalizer<'a, 'r> {
    pub memo: &'a mut Memo,
    pub options: &'a Options<'r>,
    /// Offset of the opcode that triggered the pop, for errors.
    pub offset: usize,
}

impl Finalizer<'_, '_> {
    pub fn finalize(&mut self, value: Value) -> Result<Value, Error> {
        match value {
            Value::MemoRef(handle) => match self.memo.begin_resolve(handle) {
                // Re-entered while resolving the same slot: the input
                // encodes a value containing itself. Leave the inner
                // handle opaque rather than recurse forever.
                None => Ok(Value::MemoRef(handle)),
                Some(stored) => match self.finalize(stored) {
                    Ok(resolved) => {
                        self.memo.end_resolve(handle, resolved.clone());
                        Ok(resolved)
                    }
                    Err(err) => {
                        self.memo.end_resolve(handle, Value::None);
                        Err(err)
                    }
                },
            },
            Value::Object(desc) => self.resolve_descriptor(*desc),
            other => Ok(other),
        }
    }

    /// Built-in resolver first, then the user resolver. A descriptor
    /// neither one claims passes through unchanged.
    fn resolve_descriptor(&mut self, desc: ObjectDescriptor) -> Result<Value, Error> {
        if let Some(replacement) = builtin_resolve(&desc) {
            return Ok(replacement);
        }
        if let Some(resolver) = &self.options.object_resolver {
            match resolver(&desc) {
                Ok(Some(replacement)) => return Ok(replacement),
                Ok(None) => {}
                Err(msg) => return Err(Error::new(ErrorKind::Resolver(msg), self.offset)),
            }
        }
        Ok(Value::Object(Box::new(desc)))
    }
}

/// Reductions of well-known builtins that have a direct value form.
/// Returns `None` when the descriptor is not recognized.
fn builtin_resolve(desc: &ObjectDescriptor) -> Option<Value> {
    if !desc.is_bare() {
        return None;
    }
    match desc.constructor.as_str() {
        // getattr(cls, name): a reference to a class attribute, kept
        // symbolic as a nested global
        "builtins.getattr" => match desc.args.as_slice() {
            [global @ Value::Global { .. }, Value::Text(name)] => Some(Value::Global {
                scope: Box::new(global.clone()),
                name: name.clone(),
            }),
            _ => None,
        },
        "builtins.bytearray" => match desc.args.as_slice() {
            [] => Some(Value::Bytes(Vec::new())),
            [Value::Bytes(bytes)] => Some(Value::Bytes(bytes.clone())),
            _ => None,
        },
        // Protocols <= 2 spell sets as reductions over an element list
        "builtins.set" => collapse_set_elements(&desc.args).map(Value::Set),
        "builtins.frozenset" => collapse_set_elements(&desc.args).map(Value::FrozenSet),
        _ => None,
    }
}

fn collapse_set_elements(args: &[Value]) -> Option<Vec<Value>> {
    match args {
        [] => Some(Vec::new()),
        [Value::List(items)] | [Value::Tuple(items)] => Some(items.clone()),
        _ => None,
    }
}
