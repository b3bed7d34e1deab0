use num_bigint::BigInt;

/// A decoded pickle value.
///
/// Python types with a natural host mapping become the plain variants;
/// class references become [`Value::Global`] and object
/// reconstructions become [`Value::Object`]. `Int` holds everything
/// that fits an `i64`; wider integers spill into `BigInt`, so a given
/// number always has exactly one representation.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    BigInt(BigInt),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    /// Insertion-ordered pairs. Keys compare by structural equality;
    /// arbitrary decoded values are not hashable in general.
    Dict(Vec<(Value, Value)>),
    Set(Vec<Value>),
    FrozenSet(Vec<Value>),
    /// A reference to a Python class or function. `scope` is `Text`
    /// for a plain module path, or another `Global` for attribute
    /// chains like `A.B.c` produced by `getattr` reductions.
    Global { scope: Box<Value>, name: String },
    Object(Box<ObjectDescriptor>),
    /// Opaque memo handle. Only present in results for
    /// self-referential inputs, which the value model cannot
    /// represent; see the crate docs.
    MemoRef(usize),
}

impl Value {
    /// Dotted path of a `Global`, e.g. `datetime.date` or `A.B.c`.
    /// `None` when the value is not a global or its scope chain
    /// contains something other than `Text`/`Global`.
    pub fn dotted_path(&self) -> Option<String> {
        match self {
            Value::Global { scope, name } => match scope.as_ref() {
                Value::Text(module) => Some(format!("{module}.{name}")),
                nested @ Value::Global { .. } => {
                    Some(format!("{}.{name}", nested.dotted_path()?))
                }
                _ => None,
            },
            _ => None,
        }
    }
}

/// Normalized form of a Python object reconstruction: everything the
/// reduction opcodes (`REDUCE`, `OBJ`, `INST`, `NEWOBJ`, `NEWOBJ_EX`)
/// and their follow-up mutators (`BUILD`, append/setitem families)
/// contributed, flattened into one record.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDescriptor {
    /// Dotted path of the constructor. `NEWOBJ`/`NEWOBJ_EX` append
    /// `.__new__`. Non-empty by construction.
    pub constructor: String,
    /// Positional args. For `NEWOBJ`/`NEWOBJ_EX` the class itself is
    /// the first entry.
    pub args: Vec<Value>,
    pub kwargs: Vec<(String, Value)>,
    /// Payload attached by `BUILD`. `None` means `BUILD` never ran,
    /// which is distinct from a pickled `Value::None` state.
    pub state: Option<Value>,
    /// Items accumulated by `APPEND`/`APPENDS`/`ADDITEMS` when the
    /// target of the mutation is this descriptor.
    pub append_items: Vec<Value>,
    /// Pairs accumulated by `SETITEM`/`SETITEMS` when the target of
    /// the mutation is this descriptor.
    pub set_items: Vec<(Value, Value)>,
}

impl ObjectDescriptor {
    pub(crate) fn new(constructor: String, args: Vec<Value>) -> Self {
        ObjectDescriptor {
            constructor,
            args,
            kwargs: Vec::new(),
            state: None,
            append_items: Vec::new(),
            set_items: Vec::new(),
        }
    }

    /// True when nothing beyond constructor and positional args has
    /// been attached. The built-in resolver only rewrites these.
    pub(crate) fn is_bare(&self) -> bool {
        self.kwargs.is_empty()
            && self.state.is_none()
            && self.append_items.is_empty()
            && self.set_items.is_empty()
    }
}
