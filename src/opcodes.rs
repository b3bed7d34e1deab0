//! Pickle protocol opcodes (protocols 0-5).
//!
//! One byte selects one VM instruction. The names follow Python's
//! pickle.py / pickletools.py so streams can be cross-checked against
//! `pickletools.dis` output.

// -- Protocol 0 (text-based) --
pub const MARK: u8 = b'('; // save the operand stack, start a fresh one
pub const STOP: u8 = b'.'; // end of pickle; top of stack is the result
pub const POP: u8 = b'0'; // discard topmost stack item
pub const POP_MARK: u8 = b'1'; // discard everything down to the mark
pub const DUP: u8 = b'2'; // duplicate top stack item
pub const FLOAT: u8 = b'F'; // push float; decimal string line
pub const INT: u8 = b'I'; // push integer; "00"/"01" are bool aliases
pub const LONG: u8 = b'L'; // push arbitrary-size int; decimal line with L suffix
pub const NONE: u8 = b'N'; // push None
pub const PERSID: u8 = b'P'; // push persistent id; id given as a text line
pub const REDUCE: u8 = b'R'; // apply callable to argtuple, both on stack
pub const STRING: u8 = b'S'; // push quoted string line with Python escapes
pub const UNICODE: u8 = b'V'; // push unicode string; NL-terminated line (obsolete)
pub const APPEND: u8 = b'a'; // append stack top to the list below it
pub const BUILD: u8 = b'b'; // attach state to the object below the top
pub const GLOBAL: u8 = b'c'; // push class/callable; module and name lines
pub const DICT: u8 = b'd'; // build dict from stack items above the mark
pub const EMPTY_DICT: u8 = b'}'; // push empty dict
pub const APPENDS: u8 = b'e'; // extend list with all items above the mark
pub const GET: u8 = b'g'; // push memo item; index given as a text line
pub const INST: u8 = b'i'; // build instance; module/name lines, args above mark
pub const LIST: u8 = b'l'; // build list from stack items above the mark
pub const EMPTY_LIST: u8 = b']'; // push empty list
pub const OBJ: u8 = b'o'; // build instance; class and args above the mark
pub const PUT: u8 = b'p'; // store stack top in memo; index as a text line
pub const SETITEM: u8 = b's'; // add key+value pair to the dict below
pub const TUPLE: u8 = b't'; // build tuple from stack items above the mark
pub const EMPTY_TUPLE: u8 = b')'; // push empty tuple
pub const SETITEMS: u8 = b'u'; // add alternating key/value items above the mark
pub const BINPERSID: u8 = b'Q'; // push persistent id taken from the stack

// -- Protocol 1 (binary) --
pub const BININT: u8 = b'J'; // push 4-byte LE signed int
pub const BININT1: u8 = b'K'; // push 1-byte unsigned int
pub const BININT2: u8 = b'M'; // push 2-byte LE unsigned int
pub const BINSTRING: u8 = b'T'; // push string; 4-byte LE signed length
pub const SHORT_BINSTRING: u8 = b'U'; // push string; 1-byte length
pub const BINUNICODE: u8 = b'X'; // push UTF-8 string; 4-byte LE length
pub const BINFLOAT: u8 = b'G'; // push float; 8-byte big-endian IEEE-754
pub const BINGET: u8 = b'h'; // push memo item; 1-byte index
pub const LONG_BINGET: u8 = b'j'; // push memo item; 4-byte LE index
pub const BINPUT: u8 = b'q'; // store stack top in memo; 1-byte index
pub const LONG_BINPUT: u8 = b'r'; // store stack top in memo; 4-byte LE index

// -- Protocol 2 --
pub const PROTO: u8 = 0x80; // protocol version marker; 1-byte version
pub const NEWOBJ: u8 = 0x81; // build object via cls.__new__(cls, *args)
pub const EXT1: u8 = 0x82; // extension registry ref, 1-byte code (unsupported)
pub const EXT2: u8 = 0x83; // extension registry ref, 2-byte code (unsupported)
pub const EXT4: u8 = 0x84; // extension registry ref, 4-byte code (unsupported)
pub const TUPLE1: u8 = 0x85; // build 1-tuple from the top item
pub const TUPLE2: u8 = 0x86; // build 2-tuple from the top two items
pub const TUPLE3: u8 = 0x87; // build 3-tuple from the top three items
pub const NEWTRUE: u8 = 0x88; // push True
pub const NEWFALSE: u8 = 0x89; // push False
pub const LONG1: u8 = 0x8a; // push int; 1-byte length, LE two's-complement
pub const LONG4: u8 = 0x8b; // push int; 4-byte length, LE two's-complement

// -- Protocol 3 --
pub const BINBYTES: u8 = b'B'; // push bytes; 4-byte LE length
pub const SHORT_BINBYTES: u8 = b'C'; // push bytes; 1-byte length

// -- Protocol 4 --
pub const SHORT_BINUNICODE: u8 = 0x8c; // push UTF-8 string; 1-byte length
pub const BINUNICODE8: u8 = 0x8d; // push UTF-8 string; 8-byte LE length
pub const BINBYTES8: u8 = 0x8e; // push bytes; 8-byte LE length
pub const EMPTY_SET: u8 = 0x8f; // push empty set
pub const ADDITEMS: u8 = 0x90; // add all items above the mark to the set below
pub const FROZENSET: u8 = 0x91; // build frozenset from items above the mark
pub const NEWOBJ_EX: u8 = 0x92; // like NEWOBJ but with a kwargs dict
pub const STACK_GLOBAL: u8 = 0x93; // like GLOBAL but module/name from the stack
pub const MEMOIZE: u8 = 0x94; // store stack top at the next memo index
pub const FRAME: u8 = 0x95; // framing hint; 8-byte LE length, no semantic effect

// -- Protocol 5 --
pub const BYTEARRAY8: u8 = 0x96; // push bytearray; 8-byte LE length
pub const NEXT_BUFFER: u8 = 0x97; // out-of-band buffer (unsupported)
pub const READONLY_BUFFER: u8 = 0x98; // annotation on the top buffer; no-op here
