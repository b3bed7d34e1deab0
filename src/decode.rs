use num_bigint::BigInt;

use crate::cursor::Cursor;
use crate::error::{Error, ErrorKind};
use crate::memo::Memo;
use crate::opcodes::*;
use crate::resolve::Finalizer;
use crate::types::{ObjectDescriptor, Value};
use crate::Options;

/// The pickle virtual machine.
///
/// Reads one opcode at a time, mutating the operand stack, the mark
/// stack, and the memo. `MARK` saves the whole operand stack and
/// starts a fresh one, so "pop to mark" is draining the current stack
/// and restoring the saved one. Values are finalized (memo handles
/// dereferenced, descriptors run through the resolvers) at the moment
/// they are popped.
pub(crate) struct Machine<'d, 'a, 'r> {
    cursor: Cursor<'d>,
    stack: Vec<Value>,
    metastack: Vec<Vec<Value>>,
    memo: Memo,
    options: &'a Options<'r>,
    /// Offset of the opcode currently executing, for error reports.
    op_offset: usize,
}

impl<'d, 'a, 'r> Machine<'d, 'a, 'r> {
    pub fn new(data: &'d [u8], options: &'a Options<'r>) -> Self {
        Machine {
            cursor: Cursor::new(data),
            stack: Vec::new(),
            metastack: Vec::new(),
            memo: Memo::new(),
            options,
            op_offset: 0,
        }
    }

    pub fn run(mut self) -> Result<(Value, &'d [u8]), Error> {
        loop {
            self.op_offset = self.cursor.offset();
            let op = self.cursor.read_u8()?;
            match op {
                STOP => {
                    let value = self.pop("STOP with empty stack")?;
                    if !self.stack.is_empty() {
                        return Err(self.underflow("operands left on the stack at STOP"));
                    }
                    if !self.metastack.is_empty() {
                        return Err(self.underflow("unconsumed mark at STOP"));
                    }
                    return Ok((value, self.cursor.rest()));
                }
                PROTO => {
                    let version = self.cursor.read_u8()?;
                    if version > 5 {
                        return Err(Error::new(
                            ErrorKind::UnsupportedProtocol(version),
                            self.op_offset,
                        ));
                    }
                }
                // Framing is a hint for streaming consumers; in-memory
                // decoding just steps over it.
                FRAME => {
                    self.cursor.read_bytes(8)?;
                }

                // -- Literals --
                NONE => self.stack.push(Value::None),
                NEWTRUE => self.stack.push(Value::Bool(true)),
                NEWFALSE => self.stack.push(Value::Bool(false)),

                // -- Integers --
                INT => {
                    let line = self.cursor.read_line()?;
                    match line {
                        b"00" => self.stack.push(Value::Bool(false)),
                        b"01" => self.stack.push(Value::Bool(true)),
                        _ => {
                            let text = self.utf8(line)?;
                            let value = text.trim().parse::<BigInt>().map_err(|e| {
                                self.malformed(format!("INT literal: {e}"))
                            })?;
                            self.push_int(value);
                        }
                    }
                }
                BININT => {
                    let value = self.cursor.read_i32_le()?;
                    self.stack.push(Value::Int(value as i64));
                }
                BININT1 => {
                    let value = self.cursor.read_u8()?;
                    self.stack.push(Value::Int(value as i64));
                }
                BININT2 => {
                    let value = self.cursor.read_u16_le()?;
                    self.stack.push(Value::Int(value as i64));
                }
                LONG => {
                    let line = self.cursor.read_line()?;
                    let text = self.utf8(line)?;
                    let digits = text.trim().trim_end_matches('L');
                    let value = digits
                        .parse::<BigInt>()
                        .map_err(|e| self.malformed(format!("LONG literal: {e}")))?;
                    self.push_int(value);
                }
                LONG1 => {
                    let n = self.cursor.read_u8()? as usize;
                    let value = self.cursor.read_signed_little(n)?;
                    self.push_int(value);
                }
                LONG4 => {
                    let n = self.cursor.read_i32_le()?;
                    let n = usize::try_from(n)
                        .map_err(|_| self.malformed(format!("negative LONG4 length: {n}")))?;
                    let value = self.cursor.read_signed_little(n)?;
                    self.push_int(value);
                }

                // -- Floats --
                FLOAT => {
                    let line = self.cursor.read_line()?;
                    let text = self.utf8(line)?;
                    let value = text
                        .trim()
                        .parse::<f64>()
                        .map_err(|e| self.malformed(format!("FLOAT literal: {e}")))?;
                    self.stack.push(Value::Float(value));
                }
                BINFLOAT => {
                    let value = self.cursor.read_f64_be()?;
                    self.stack.push(Value::Float(value));
                }

                // -- Legacy 8-bit strings (decoded to bytes) --
                STRING => {
                    let line = self.cursor.read_line()?;
                    let bytes = self.unescape_string(line)?;
                    self.stack.push(Value::Bytes(bytes));
                }
                BINSTRING => {
                    let n = self.cursor.read_i32_le()?;
                    let n = usize::try_from(n).map_err(|_| {
                        self.malformed(format!("negative BINSTRING length: {n}"))
                    })?;
                    let bytes = self.cursor.read_bytes(n)?.to_vec();
                    self.stack.push(Value::Bytes(bytes));
                }
                SHORT_BINSTRING => {
                    let n = self.cursor.read_u8()? as usize;
                    let bytes = self.cursor.read_bytes(n)?.to_vec();
                    self.stack.push(Value::Bytes(bytes));
                }

                // -- Unicode strings --
                UNICODE => {
                    // Obsolete raw-unicode-escape opcode; the line is
                    // kept verbatim as UTF-8 text.
                    let line = self.cursor.read_line()?;
                    let text = self.utf8(line)?;
                    self.stack.push(Value::Text(text));
                }
                SHORT_BINUNICODE => {
                    let n = self.cursor.read_u8()? as usize;
                    self.push_unicode(n)?;
                }
                BINUNICODE => {
                    let n = self.cursor.read_u32_le()? as usize;
                    self.push_unicode(n)?;
                }
                BINUNICODE8 => {
                    let n = self.len_u64()?;
                    self.push_unicode(n)?;
                }

                // -- Bytes --
                SHORT_BINBYTES => {
                    let n = self.cursor.read_u8()? as usize;
                    let bytes = self.cursor.read_bytes(n)?.to_vec();
                    self.stack.push(Value::Bytes(bytes));
                }
                BINBYTES => {
                    let n = self.cursor.read_u32_le()? as usize;
                    let bytes = self.cursor.read_bytes(n)?.to_vec();
                    self.stack.push(Value::Bytes(bytes));
                }
                BINBYTES8 | BYTEARRAY8 => {
                    let n = self.len_u64()?;
                    let bytes = self.cursor.read_bytes(n)?.to_vec();
                    self.stack.push(Value::Bytes(bytes));
                }

                // -- Mark handling --
                MARK => {
                    let saved = std::mem::take(&mut self.stack);
                    self.metastack.push(saved);
                }
                POP_MARK => {
                    self.pop_mark()?;
                }
                POP => {
                    self.pop("POP with empty stack")?;
                }
                DUP => {
                    let top = self
                        .stack
                        .last()
                        .cloned()
                        .ok_or_else(|| self.underflow("DUP with empty stack"))?;
                    self.stack.push(top);
                }

                // -- Containers --
                EMPTY_LIST => self.stack.push(Value::List(Vec::new())),
                EMPTY_TUPLE => self.stack.push(Value::Tuple(Vec::new())),
                EMPTY_DICT => self.stack.push(Value::Dict(Vec::new())),
                EMPTY_SET => self.stack.push(Value::Set(Vec::new())),
                LIST => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::List(items));
                }
                TUPLE => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::Tuple(items));
                }
                FROZENSET => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::FrozenSet(items));
                }
                DICT => {
                    let items = self.pop_mark()?;
                    let pairs = self.pair_items(items)?;
                    self.stack.push(Value::Dict(pairs));
                }
                TUPLE1 => {
                    let a = self.pop("TUPLE1 with empty stack")?;
                    self.stack.push(Value::Tuple(vec![a]));
                }
                TUPLE2 => {
                    let b = self.pop("TUPLE2 with empty stack")?;
                    let a = self.pop("TUPLE2 with empty stack")?;
                    self.stack.push(Value::Tuple(vec![a, b]));
                }
                TUPLE3 => {
                    let c = self.pop("TUPLE3 with empty stack")?;
                    let b = self.pop("TUPLE3 with empty stack")?;
                    let a = self.pop("TUPLE3 with empty stack")?;
                    self.stack.push(Value::Tuple(vec![a, b, c]));
                }

                // -- Container mutators --
                APPEND => {
                    let value = self.pop("APPEND with empty stack")?;
                    self.append_items(vec![value], "APPEND")?;
                }
                APPENDS => {
                    let items = self.pop_mark()?;
                    self.append_items(items, "APPENDS")?;
                }
                ADDITEMS => {
                    let items = self.pop_mark()?;
                    let offset = self.op_offset;
                    match self.head_target_mut()? {
                        Value::Set(elements) => elements.extend(items),
                        Value::Object(desc) => desc.append_items.extend(items),
                        other => {
                            return Err(Error::new(
                                ErrorKind::TypeMismatch(format!(
                                    "ADDITEMS on {}",
                                    kind_name(other)
                                )),
                                offset,
                            ))
                        }
                    }
                }
                SETITEM => {
                    let value = self.pop("SETITEM with empty stack")?;
                    let key = self.pop("SETITEM with empty stack")?;
                    self.set_pairs(vec![(key, value)], "SETITEM")?;
                }
                SETITEMS => {
                    let items = self.pop_mark()?;
                    let pairs = self.pair_items(items)?;
                    self.set_pairs(pairs, "SETITEMS")?;
                }

                // -- Memo --
                GET => {
                    let index = self.read_line_index("GET")?;
                    self.memo_get(index)?;
                }
                BINGET => {
                    let index = self.cursor.read_u8()? as usize;
                    self.memo_get(index)?;
                }
                LONG_BINGET => {
                    let index = self.cursor.read_u32_le()? as usize;
                    self.memo_get(index)?;
                }
                PUT => {
                    let index = self.read_line_index("PUT")?;
                    self.memo_put(index)?;
                }
                BINPUT => {
                    let index = self.cursor.read_u8()? as usize;
                    self.memo_put(index)?;
                }
                LONG_BINPUT => {
                    let index = self.cursor.read_u32_le()? as usize;
                    self.memo_put(index)?;
                }
                MEMOIZE => {
                    let index = self.memo.next_index();
                    self.memo_put(index)?;
                }

                // -- Globals --
                GLOBAL => {
                    let module = {
                        let line = self.cursor.read_line()?;
                        self.utf8(line)?
                    };
                    let name = {
                        let line = self.cursor.read_line()?;
                        self.utf8(line)?
                    };
                    self.stack.push(Value::Global {
                        scope: Box::new(Value::Text(module)),
                        name,
                    });
                }
                STACK_GLOBAL => {
                    let name = self.pop("STACK_GLOBAL with empty stack")?;
                    let scope = self.pop("STACK_GLOBAL with empty stack")?;
                    let name = match name {
                        Value::Text(name) => name,
                        other => {
                            return Err(self.mismatch(format!(
                                "STACK_GLOBAL name is {}",
                                kind_name(&other)
                            )))
                        }
                    };
                    match scope {
                        scope @ (Value::Text(_) | Value::Global { .. }) => {
                            self.stack.push(Value::Global {
                                scope: Box::new(scope),
                                name,
                            });
                        }
                        other => {
                            return Err(self.mismatch(format!(
                                "STACK_GLOBAL scope is {}",
                                kind_name(&other)
                            )))
                        }
                    }
                }

                // -- Reductions --
                REDUCE => {
                    let args = self.pop("REDUCE with empty stack")?;
                    let callable = self.pop("REDUCE with empty stack")?;
                    let constructor = callable.dotted_path().ok_or_else(|| {
                        self.mismatch(format!("REDUCE callable is {}", kind_name(&callable)))
                    })?;
                    let args = self.tuple_elements(args, "REDUCE args")?;
                    self.stack
                        .push(Value::Object(Box::new(ObjectDescriptor::new(
                            constructor,
                            args,
                        ))));
                }
                BUILD => {
                    let state = self.pop("BUILD with empty stack")?;
                    let offset = self.op_offset;
                    match self.head_target_mut()? {
                        Value::Object(desc) => desc.state = Some(state),
                        other => {
                            return Err(Error::new(
                                ErrorKind::TypeMismatch(format!(
                                    "BUILD on {}",
                                    kind_name(other)
                                )),
                                offset,
                            ))
                        }
                    }
                }
                INST => {
                    let module = {
                        let line = self.cursor.read_line()?;
                        self.utf8(line)?
                    };
                    let name = {
                        let line = self.cursor.read_line()?;
                        self.utf8(line)?
                    };
                    let args = self.pop_mark()?;
                    self.stack
                        .push(Value::Object(Box::new(ObjectDescriptor::new(
                            format!("{module}.{name}"),
                            args,
                        ))));
                }
                OBJ => {
                    let mut items = self.pop_mark()?;
                    if items.is_empty() {
                        return Err(self.underflow("OBJ with no class above the mark"));
                    }
                    let class = items.remove(0);
                    let constructor = class.dotted_path().ok_or_else(|| {
                        self.mismatch(format!("OBJ class is {}", kind_name(&class)))
                    })?;
                    self.stack
                        .push(Value::Object(Box::new(ObjectDescriptor::new(
                            constructor,
                            items,
                        ))));
                }
                NEWOBJ => {
                    let args = self.pop("NEWOBJ with empty stack")?;
                    let class = self.pop("NEWOBJ with empty stack")?;
                    let descriptor = self.newobj_descriptor(class, args, Vec::new())?;
                    self.stack.push(Value::Object(Box::new(descriptor)));
                }
                NEWOBJ_EX => {
                    let kwargs = self.pop("NEWOBJ_EX with empty stack")?;
                    let args = self.pop("NEWOBJ_EX with empty stack")?;
                    let class = self.pop("NEWOBJ_EX with empty stack")?;
                    let kwargs = match kwargs {
                        Value::Dict(pairs) => {
                            let mut named = Vec::with_capacity(pairs.len());
                            for (key, value) in pairs {
                                match key {
                                    Value::Text(key) => named.push((key, value)),
                                    other => {
                                        return Err(self.mismatch(format!(
                                            "NEWOBJ_EX keyword name is {}",
                                            kind_name(&other)
                                        )))
                                    }
                                }
                            }
                            named
                        }
                        other => {
                            return Err(self.mismatch(format!(
                                "NEWOBJ_EX kwargs is {}, expected a dict",
                                kind_name(&other)
                            )))
                        }
                    };
                    let descriptor = self.newobj_descriptor(class, args, kwargs)?;
                    self.stack.push(Value::Object(Box::new(descriptor)));
                }

                // -- Persistent ids --
                PERSID => {
                    let line = self.cursor.read_line()?;
                    let id = Value::Text(self.utf8(line)?);
                    self.resolve_persistent(id)?;
                }
                BINPERSID => {
                    let id = self.pop("BINPERSID with empty stack")?;
                    self.resolve_persistent(id)?;
                }

                // -- Deliberately unsupported --
                EXT1 | EXT2 | EXT4 => {
                    return Err(Error::new(
                        ErrorKind::UnsupportedFeature("extension registry"),
                        self.op_offset,
                    ))
                }
                NEXT_BUFFER => {
                    return Err(Error::new(
                        ErrorKind::UnsupportedFeature("out-of-band buffers"),
                        self.op_offset,
                    ))
                }
                READONLY_BUFFER => {}

                _ => {
                    return Err(Error::new(ErrorKind::UnknownOpcode(op), self.op_offset))
                }
            }
        }
    }

    // -- Stack --

    fn pop(&mut self, ctx: &'static str) -> Result<Value, Error> {
        let value = self.stack.pop().ok_or_else(|| self.underflow(ctx))?;
        self.finalize(value)
    }

    /// Drain the region above the mark (in pickle order, finalized)
    /// and restore the saved stack.
    fn pop_mark(&mut self) -> Result<Vec<Value>, Error> {
        let saved = self
            .metastack
            .pop()
            .ok_or_else(|| self.underflow("pop to mark with no mark"))?;
        let items = std::mem::replace(&mut self.stack, saved);
        items.into_iter().map(|v| self.finalize(v)).collect()
    }

    fn finalize(&mut self, value: Value) -> Result<Value, Error> {
        let mut finalizer = Finalizer {
            memo: &mut self.memo,
            options: self.options,
            offset: self.op_offset,
        };
        finalizer.finalize(value)
    }

    /// Top of the stack as a mutation target, following memo handles
    /// into the store so shared values are mutated in their one
    /// canonical slot.
    fn head_target_mut(&mut self) -> Result<&mut Value, Error> {
        let handle = match self.stack.last() {
            None => return Err(self.underflow("mutation with empty stack")),
            Some(Value::MemoRef(handle)) => Some(*handle),
            Some(_) => None,
        };
        match handle {
            Some(mut handle) => {
                while let Value::MemoRef(next) = self.memo.value(handle) {
                    handle = *next;
                }
                Ok(self.memo.value_mut(handle))
            }
            None => Ok(self.stack.last_mut().unwrap()),
        }
    }

    // -- Mutators --

    fn append_items(&mut self, items: Vec<Value>, op: &'static str) -> Result<(), Error> {
        let offset = self.op_offset;
        match self.head_target_mut()? {
            Value::List(list) => list.extend(items),
            Value::Object(desc) => desc.append_items.extend(items),
            other => {
                return Err(Error::new(
                    ErrorKind::TypeMismatch(format!("{op} on {}", kind_name(other))),
                    offset,
                ))
            }
        }
        Ok(())
    }

    fn set_pairs(&mut self, pairs: Vec<(Value, Value)>, op: &'static str) -> Result<(), Error> {
        let offset = self.op_offset;
        match self.head_target_mut()? {
            Value::Dict(entries) => entries.extend(pairs),
            Value::Object(desc) => desc.set_items.extend(pairs),
            other => {
                return Err(Error::new(
                    ErrorKind::TypeMismatch(format!("{op} on {}", kind_name(other))),
                    offset,
                ))
            }
        }
        Ok(())
    }

    /// Pair a flat `k1 v1 k2 v2 ...` item run in pickle order.
    fn pair_items(&self, items: Vec<Value>) -> Result<Vec<(Value, Value)>, Error> {
        if items.len() % 2 != 0 {
            return Err(self.malformed("odd number of key/value items".into()));
        }
        let mut pairs = Vec::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
            pairs.push((key, value));
        }
        Ok(pairs)
    }

    // -- Memo --

    fn memo_get(&mut self, index: usize) -> Result<(), Error> {
        match self.memo.lookup(index) {
            Some(handle) => {
                self.stack.push(Value::MemoRef(handle));
                Ok(())
            }
            None => Err(self.malformed(format!("memo index {index} is not set"))),
        }
    }

    /// Install the stack head at `index`. The head is replaced by a
    /// handle so that later mutations reach the stored value; a head
    /// that already is a handle gets aliased, not re-wrapped.
    fn memo_put(&mut self, index: usize) -> Result<(), Error> {
        match self.stack.last() {
            None => Err(self.underflow("memo store with empty stack")),
            Some(Value::MemoRef(handle)) => {
                let handle = *handle;
                self.memo.bind(index, handle);
                Ok(())
            }
            Some(_) => {
                let value = self.stack.pop().unwrap();
                let handle = self.memo.install(index, value);
                self.stack.push(Value::MemoRef(handle));
                Ok(())
            }
        }
    }

    // -- Reductions --

    fn newobj_descriptor(
        &self,
        class: Value,
        args: Value,
        kwargs: Vec<(String, Value)>,
    ) -> Result<ObjectDescriptor, Error> {
        let path = class.dotted_path().ok_or_else(|| {
            self.mismatch(format!("NEWOBJ class is {}", kind_name(&class)))
        })?;
        let elements = self.tuple_elements(args, "NEWOBJ args")?;
        let mut all = Vec::with_capacity(elements.len() + 1);
        all.push(class);
        all.extend(elements);
        let mut descriptor = ObjectDescriptor::new(format!("{path}.__new__"), all);
        descriptor.kwargs = kwargs;
        Ok(descriptor)
    }

    fn tuple_elements(&self, value: Value, what: &str) -> Result<Vec<Value>, Error> {
        match value {
            Value::Tuple(items) => Ok(items),
            other => Err(self.mismatch(format!(
                "{what} is {}, expected a tuple",
                kind_name(&other)
            ))),
        }
    }

    fn resolve_persistent(&mut self, id: Value) -> Result<(), Error> {
        let offset = self.op_offset;
        match &self.options.persistent_id_resolver {
            None => Err(Error::new(
                ErrorKind::MissingResolver(display_persistent_id(&id)),
                offset,
            )),
            Some(resolver) => match resolver(&id) {
                Ok(value) => {
                    self.stack.push(value);
                    Ok(())
                }
                Err(msg) => Err(Error::new(ErrorKind::Resolver(msg), offset)),
            },
        }
    }

    // -- Operand parsing --

    fn push_int(&mut self, value: BigInt) {
        match i64::try_from(&value) {
            Ok(small) => self.stack.push(Value::Int(small)),
            Err(_) => self.stack.push(Value::BigInt(value)),
        }
    }

    fn push_unicode(&mut self, n: usize) -> Result<(), Error> {
        let bytes = self.cursor.read_bytes(n)?;
        let text = self.utf8(bytes)?;
        self.stack.push(Value::Text(text));
        Ok(())
    }

    fn len_u64(&mut self) -> Result<usize, Error> {
        let n = self.cursor.read_u64_le()?;
        usize::try_from(n)
            .map_err(|_| self.malformed(format!("length {n} exceeds addressable memory")))
    }

    fn read_line_index(&mut self, op: &'static str) -> Result<usize, Error> {
        let line = self.cursor.read_line()?;
        let text = self.utf8(line)?;
        text.trim()
            .parse::<usize>()
            .map_err(|e| self.malformed(format!("{op} index: {e}")))
    }

    /// Decode a quoted protocol-0 STRING operand: matching quotes
    /// stripped, Python escape sequences expanded. Unknown escapes
    /// pass through backslash-and-all, as CPython's escape decoder
    /// does.
    fn unescape_string(&self, line: &[u8]) -> Result<Vec<u8>, Error> {
        let inner = match line {
            [first @ (b'\'' | b'"'), inner @ .., last] if first == last => inner,
            _ => {
                return Err(self.malformed("string operand missing matching quotes".into()))
            }
        };
        let mut out = Vec::with_capacity(inner.len());
        let mut iter = inner.iter().copied().peekable();
        while let Some(byte) = iter.next() {
            if byte != b'\\' {
                out.push(byte);
                continue;
            }
            match iter.next() {
                None => return Err(self.malformed("dangling backslash in string".into())),
                Some(b'\\') => out.push(b'\\'),
                Some(b'\'') => out.push(b'\''),
                Some(b'"') => out.push(b'"'),
                Some(b'a') => out.push(0x07),
                Some(b'b') => out.push(0x08),
                Some(b't') => out.push(b'\t'),
                Some(b'n') => out.push(b'\n'),
                Some(b'v') => out.push(0x0b),
                Some(b'f') => out.push(0x0c),
                Some(b'r') => out.push(b'\r'),
                Some(b'x') => {
                    let hi = iter.next().and_then(hex_digit);
                    let lo = iter.next().and_then(hex_digit);
                    match (hi, lo) {
                        (Some(hi), Some(lo)) => out.push(hi * 16 + lo),
                        _ => {
                            return Err(
                                self.malformed("invalid \\x escape in string".into())
                            )
                        }
                    }
                }
                Some(digit @ b'0'..=b'7') => {
                    let mut value = (digit - b'0') as u32;
                    for _ in 0..2 {
                        match iter.peek() {
                            Some(&next) if next.is_ascii_digit() && next < b'8' => {
                                value = value * 8 + (next - b'0') as u32;
                                iter.next();
                            }
                            _ => break,
                        }
                    }
                    out.push((value & 0xff) as u8);
                }
                Some(other) => {
                    out.push(b'\\');
                    out.push(other);
                }
            }
        }
        Ok(out)
    }

    fn utf8(&self, bytes: &[u8]) -> Result<String, Error> {
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| self.malformed("invalid UTF-8 in string operand".into()))
    }

    // -- Errors --

    fn underflow(&self, ctx: &'static str) -> Error {
        Error::new(ErrorKind::StackUnderflow(ctx), self.op_offset)
    }

    fn malformed(&self, msg: String) -> Error {
        Error::new(ErrorKind::MalformedOperand(msg), self.op_offset)
    }

    fn mismatch(&self, msg: String) -> Error {
        Error::new(ErrorKind::TypeMismatch(msg), self.op_offset)
    }
}

fn hex_digit(byte: u8) -> Option<u8> {
    (byte as char).to_digit(16).map(|d| d as u8)
}

fn display_persistent_id(id: &Value) -> String {
    match id {
        Value::Text(text) => text.clone(),
        other => format!("{other:?}"),
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::None => "None",
        Value::Bool(_) => "bool",
        Value::Int(_) | Value::BigInt(_) => "int",
        Value::Float(_) => "float",
        Value::Text(_) => "str",
        Value::Bytes(_) => "bytes",
        Value::List(_) => "list",
        Value::Tuple(_) => "tuple",
        Value::Dict(_) => "dict",
        Value::Set(_) => "set",
        Value::FrozenSet(_) => "frozenset",
        Value::Global { .. } => "global",
        Value::Object(_) => "object descriptor",
        Value::MemoRef(_) => "memo ref",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load;

    fn decode(data: &[u8]) -> Value {
        let (value, rest) = load(data, &Options::new()).unwrap();
        assert!(rest.is_empty());
        value
    }

    fn decode_err(data: &[u8]) -> Error {
        load(data, &Options::new()).unwrap_err()
    }

    #[test]
    fn literals() {
        assert_eq!(decode(b"\x80\x02N."), Value::None);
        assert_eq!(decode(b"\x80\x02\x88."), Value::Bool(true));
        assert_eq!(decode(b"\x80\x02\x89."), Value::Bool(false));
    }

    #[test]
    fn binary_ints() {
        assert_eq!(decode(b"\x80\x02K\x2a."), Value::Int(42));
        assert_eq!(decode(b"\x80\x02M\x39\x30."), Value::Int(12345));
        assert_eq!(decode(b"\x80\x02J\xff\xff\xff\xff."), Value::Int(-1));
    }

    #[test]
    fn text_int_and_bool_aliases() {
        assert_eq!(decode(b"I7\n."), Value::Int(7));
        assert_eq!(decode(b"I-3\n."), Value::Int(-3));
        assert_eq!(decode(b"I00\n."), Value::Bool(false));
        assert_eq!(decode(b"I01\n."), Value::Bool(true));
    }

    #[test]
    fn text_long_strips_suffix() {
        assert_eq!(decode(b"L17L\n."), Value::Int(17));
        let huge = decode(b"L170141183460469231731687303715884105728L\n.");
        assert_eq!(
            huge,
            Value::BigInt("170141183460469231731687303715884105728".parse().unwrap())
        );
    }

    #[test]
    fn binary_longs_are_twos_complement() {
        // 255 needs a sign byte: 0xff 0x00
        assert_eq!(decode(b"\x80\x02\x8a\x02\xff\x00."), Value::Int(255));
        assert_eq!(decode(b"\x80\x02\x8a\x01\xff."), Value::Int(-1));
        assert_eq!(decode(b"\x80\x02\x8a\x00."), Value::Int(0));
        assert_eq!(
            decode(b"\x80\x02\x8b\x02\x00\x00\x00\xff\x00."),
            Value::Int(255)
        );
        // 2^64, one byte past i64
        assert_eq!(
            decode(b"\x80\x02\x8a\x09\x00\x00\x00\x00\x00\x00\x00\x00\x01."),
            Value::BigInt(BigInt::from(1u8) << 64)
        );
    }

    #[test]
    fn floats() {
        assert_eq!(decode(b"F2.5\n."), Value::Float(2.5));
        assert_eq!(
            decode(b"\x80\x02G\x3f\xf0\x00\x00\x00\x00\x00\x00."),
            Value::Float(1.0)
        );
    }

    #[test]
    fn quoted_string_unescapes() {
        assert_eq!(decode(b"S'abc'\n."), Value::Bytes(b"abc".to_vec()));
        assert_eq!(decode(b"S\"a'b\"\n."), Value::Bytes(b"a'b".to_vec()));
        assert_eq!(
            decode(b"S'a\\x00\\tb\\\\'\n."),
            Value::Bytes(b"a\x00\tb\\".to_vec())
        );
        assert_eq!(decode(b"S'\\101\\60'\n."), Value::Bytes(b"A0".to_vec()));
    }

    #[test]
    fn quote_mismatch_is_malformed() {
        let err = decode_err(b"S'abc\"\n.");
        assert!(matches!(err.kind, ErrorKind::MalformedOperand(_)));
        let err = decode_err(b"Sabc\n.");
        assert!(matches!(err.kind, ErrorKind::MalformedOperand(_)));
    }

    #[test]
    fn counted_strings_and_bytes() {
        assert_eq!(
            decode(b"\x80\x02U\x05hello."),
            Value::Bytes(b"hello".to_vec())
        );
        assert_eq!(
            decode(b"\x80\x02T\x03\x00\x00\x00abc."),
            Value::Bytes(b"abc".to_vec())
        );
        assert_eq!(
            decode(b"\x80\x03C\x02\x00\xff."),
            Value::Bytes(vec![0, 0xff])
        );
        assert_eq!(
            decode(b"\x80\x04\x8e\x03\x00\x00\x00\x00\x00\x00\x00abc."),
            Value::Bytes(b"abc".to_vec())
        );
        assert_eq!(
            decode(b"\x80\x05\x96\x02\x00\x00\x00\x00\x00\x00\x00hi."),
            Value::Bytes(b"hi".to_vec())
        );
    }

    #[test]
    fn unicode_variants() {
        assert_eq!(
            decode(b"\x80\x04\x8c\x05hello."),
            Value::Text("hello".into())
        );
        assert_eq!(
            decode(b"\x80\x02X\x05\x00\x00\x00hello."),
            Value::Text("hello".into())
        );
        assert_eq!(
            decode(b"\x80\x04\x8d\x05\x00\x00\x00\x00\x00\x00\x00hello."),
            Value::Text("hello".into())
        );
        // obsolete line form passes the raw text through
        assert_eq!(decode(b"Vabc\n."), Value::Text("abc".into()));
    }

    #[test]
    fn tuples_preserve_pickle_order() {
        assert_eq!(decode(b"\x80\x02)."), Value::Tuple(vec![]));
        assert_eq!(
            decode(b"\x80\x02K\x01\x85."),
            Value::Tuple(vec![Value::Int(1)])
        );
        assert_eq!(
            decode(b"\x80\x02K\x01K\x02\x86."),
            Value::Tuple(vec![Value::Int(1), Value::Int(2)])
        );
        assert_eq!(
            decode(b"\x80\x02K\x01K\x02K\x03\x87."),
            Value::Tuple(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
        assert_eq!(
            decode(b"(K\x01K\x02K\x03t."),
            Value::Tuple(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
    }

    #[test]
    fn lists_and_mutators() {
        assert_eq!(decode(b"\x80\x02]."), Value::List(vec![]));
        assert_eq!(
            decode(b"(K\x01K\x02l."),
            Value::List(vec![Value::Int(1), Value::Int(2)])
        );
        assert_eq!(
            decode(b"\x80\x02](K\x01K\x02e."),
            Value::List(vec![Value::Int(1), Value::Int(2)])
        );
    }

    #[test]
    fn dicts_pair_in_pickle_order() {
        assert_eq!(decode(b"\x80\x02}."), Value::Dict(vec![]));
        assert_eq!(
            decode(b"\x80\x02}\x8c\x01aK\x01s."),
            Value::Dict(vec![(Value::Text("a".into()), Value::Int(1))])
        );
        assert_eq!(
            decode(b"\x80\x02}(\x8c\x01aK\x01\x8c\x01bK\x02u."),
            Value::Dict(vec![
                (Value::Text("a".into()), Value::Int(1)),
                (Value::Text("b".into()), Value::Int(2)),
            ])
        );
        assert_eq!(
            decode(b"(\x8c\x01aK\x01d."),
            Value::Dict(vec![(Value::Text("a".into()), Value::Int(1))])
        );
    }

    #[test]
    fn odd_setitems_run_is_malformed() {
        let err = decode_err(b"\x80\x02}(K\x01u.");
        assert!(matches!(err.kind, ErrorKind::MalformedOperand(_)));
    }

    #[test]
    fn sets_and_frozensets() {
        assert_eq!(decode(b"\x80\x04\x8f."), Value::Set(vec![]));
        assert_eq!(
            decode(b"\x80\x04\x8f(K\x01K\x02\x90."),
            Value::Set(vec![Value::Int(1), Value::Int(2)])
        );
        assert_eq!(
            decode(b"\x80\x04(K\x01K\x02\x91."),
            Value::FrozenSet(vec![Value::Int(1), Value::Int(2)])
        );
    }

    #[test]
    fn pop_and_dup_and_pop_mark() {
        assert_eq!(decode(b"K\x01K\x020."), Value::Int(1));
        // DUP then TUPLE2 pairs the duplicate with the original
        assert_eq!(
            decode(b"K\x052\x86."),
            Value::Tuple(vec![Value::Int(5), Value::Int(5)])
        );
        assert_eq!(decode(b"K\x07(K\x01K\x021."), Value::Int(7));
    }

    #[test]
    fn memo_roundtrip_binary() {
        // [1], memoized, fetched twice into a tuple
        let value = decode(b"\x80\x02](K\x01eq\x00h\x00\x86.");
        let list = Value::List(vec![Value::Int(1)]);
        assert_eq!(value, Value::Tuple(vec![list.clone(), list]));
    }

    #[test]
    fn memo_roundtrip_text() {
        assert_eq!(
            decode(b"(lp0\nI1\naI2\na."),
            Value::List(vec![Value::Int(1), Value::Int(2)])
        );
    }

    #[test]
    fn mutation_after_memoize_is_shared() {
        // l = [1, 2]; (l, l) — APPENDS runs after MEMOIZE, both tuple
        // slots must see the appended items
        let value = decode(
            b"\x80\x04\x95\x0d\x00\x00\x00\x00\x00\x00\x00]\x94(K\x01K\x02eh\x00\x86\x94.",
        );
        let list = Value::List(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(value, Value::Tuple(vec![list.clone(), list]));
    }

    #[test]
    fn missing_memo_index_is_malformed() {
        let err = decode_err(b"\x80\x02h\x05.");
        assert!(matches!(err.kind, ErrorKind::MalformedOperand(_)));
    }

    #[test]
    fn globals_and_stack_global() {
        let value = decode(b"cdatetime\ndate\n.");
        assert_eq!(value.dotted_path().as_deref(), Some("datetime.date"));
        let value = decode(b"\x80\x04\x8c\x08builtins\x8c\x05range\x93.");
        assert_eq!(value.dotted_path().as_deref(), Some("builtins.range"));
    }

    #[test]
    fn stack_global_rejects_non_text_name() {
        let err = decode_err(b"\x80\x04\x8c\x08builtinsK\x01\x93.");
        assert!(matches!(err.kind, ErrorKind::TypeMismatch(_)));
    }

    #[test]
    fn reduce_builds_descriptor() {
        // complex(1.0, 2.0) via REDUCE
        let value = decode(
            b"cbuiltins\ncomplex\nG?\xf0\x00\x00\x00\x00\x00\x00G@\x00\x00\x00\x00\x00\x00\x00\x86R.",
        );
        match value {
            Value::Object(desc) => {
                assert_eq!(desc.constructor, "builtins.complex");
                assert_eq!(desc.args, vec![Value::Float(1.0), Value::Float(2.0)]);
                assert!(desc.is_bare());
            }
            other => panic!("expected descriptor, got {other:?}"),
        }
    }

    #[test]
    fn build_attaches_state() {
        let value = decode(b"cmod\nKlass\n)R}\x8c\x01xK\x01sb.");
        match value {
            Value::Object(desc) => {
                assert_eq!(desc.constructor, "mod.Klass");
                assert_eq!(
                    desc.state,
                    Some(Value::Dict(vec![(Value::Text("x".into()), Value::Int(1))]))
                );
            }
            other => panic!("expected descriptor, got {other:?}"),
        }
    }

    #[test]
    fn build_on_non_descriptor_is_mismatch() {
        let err = decode_err(b"K\x01K\x02b.");
        assert!(matches!(err.kind, ErrorKind::TypeMismatch(_)));
    }

    #[test]
    fn inst_and_obj_build_descriptors() {
        let value = decode(b"(K\x01imod\nKlass\n.");
        match value {
            Value::Object(desc) => {
                assert_eq!(desc.constructor, "mod.Klass");
                assert_eq!(desc.args, vec![Value::Int(1)]);
            }
            other => panic!("expected descriptor, got {other:?}"),
        }
        let value = decode(b"(cmod\nKlass\nK\x01K\x02o.");
        match value {
            Value::Object(desc) => {
                assert_eq!(desc.constructor, "mod.Klass");
                assert_eq!(desc.args, vec![Value::Int(1), Value::Int(2)]);
            }
            other => panic!("expected descriptor, got {other:?}"),
        }
    }

    #[test]
    fn newobj_prepends_class() {
        let value = decode(b"\x80\x02cmod\nKlass\nK\x07\x85\x81.");
        match value {
            Value::Object(desc) => {
                assert_eq!(desc.constructor, "mod.Klass.__new__");
                assert_eq!(desc.args.len(), 2);
                assert_eq!(
                    desc.args[0].dotted_path().as_deref(),
                    Some("mod.Klass")
                );
                assert_eq!(desc.args[1], Value::Int(7));
            }
            other => panic!("expected descriptor, got {other:?}"),
        }
    }

    #[test]
    fn newobj_ex_collects_kwargs() {
        let value = decode(b"\x80\x04\x8c\x03mod\x8c\x05Klass\x93)}\x8c\x01nK\x05s\x92.");
        match value {
            Value::Object(desc) => {
                assert_eq!(desc.constructor, "mod.Klass.__new__");
                assert_eq!(desc.kwargs, vec![("n".into(), Value::Int(5))]);
            }
            other => panic!("expected descriptor, got {other:?}"),
        }
    }

    #[test]
    fn descriptor_takes_append_and_set_items() {
        // a reduced object used as the target of APPENDS and SETITEM
        let value = decode(b"cmod\nBag\n)R(K\x01K\x02eK\x09K\x08s.");
        match value {
            Value::Object(desc) => {
                assert_eq!(desc.append_items, vec![Value::Int(1), Value::Int(2)]);
                assert_eq!(desc.set_items, vec![(Value::Int(9), Value::Int(8))]);
            }
            other => panic!("expected descriptor, got {other:?}"),
        }
    }

    #[test]
    fn append_on_scalar_is_mismatch() {
        let err = decode_err(b"K\x01K\x02a.");
        assert!(matches!(err.kind, ErrorKind::TypeMismatch(_)));
    }

    #[test]
    fn protocol_gate() {
        assert_eq!(decode(b"\x80\x05K\x01."), Value::Int(1));
        let err = decode_err(b"\x80\x06K\x01.");
        assert!(matches!(err.kind, ErrorKind::UnsupportedProtocol(6)));
        assert_eq!(err.offset, 0);
    }

    #[test]
    fn unsupported_features() {
        let err = decode_err(b"\x80\x02\x82\x01.");
        assert!(matches!(err.kind, ErrorKind::UnsupportedFeature("extension registry")));
        let err = decode_err(b"\x80\x05\x97.");
        assert!(matches!(
            err.kind,
            ErrorKind::UnsupportedFeature("out-of-band buffers")
        ));
    }

    #[test]
    fn unknown_opcode_reports_byte_and_offset() {
        let err = decode_err(b"\x80\x02\xff.");
        assert!(matches!(err.kind, ErrorKind::UnknownOpcode(0xff)));
        assert_eq!(err.offset, 2);
    }

    #[test]
    fn stack_discipline_errors() {
        let err = decode_err(b".");
        assert!(matches!(err.kind, ErrorKind::StackUnderflow(_)));
        let err = decode_err(b"K\x01K\x02.");
        assert!(matches!(err.kind, ErrorKind::StackUnderflow(_)));
        let err = decode_err(b"(K\x01.");
        assert!(matches!(err.kind, ErrorKind::StackUnderflow(_)));
        let err = decode_err(b"e.");
        assert!(matches!(err.kind, ErrorKind::StackUnderflow(_)));
    }

    #[test]
    fn truncated_operand() {
        let err = decode_err(b"\x80\x02U\x05hi");
        assert!(matches!(err.kind, ErrorKind::Truncated));
        let err = decode_err(b"I42");
        assert!(matches!(err.kind, ErrorKind::Truncated));
    }

    #[test]
    fn frame_is_skipped() {
        assert_eq!(
            decode(b"\x80\x04\x95\x03\x00\x00\x00\x00\x00\x00\x00K\x01."),
            Value::Int(1)
        );
    }

    #[test]
    fn readonly_buffer_is_noop() {
        assert_eq!(decode(b"\x80\x05C\x02hi\x98."), Value::Bytes(b"hi".to_vec()));
    }
}
