//! In-memory program model: units, methods, blocks, instructions.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod build;
pub mod instr;
pub mod loader;

pub use build::{MethodBuilder, UnitBuilder};
pub use instr::Instruction;
pub use loader::{decode_unit, encode_unit, encode_unit_with_method};

/// Index of a method within its owning unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MethodId(pub u32);

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Index of a basic block within its owning method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Globally addressable block reference used by coverage records.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    /// Owning unit name.
    pub unit: String,
    /// Owning method index.
    pub method: MethodId,
    /// Block index within the method.
    pub block: BlockId,
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}/{}", self.unit, self.method, self.block)
    }
}

/// Contiguous instruction run with no internal control-flow entry or exit.
///
/// Blocks partition a method: every instruction belongs to exactly one
/// block, with no gaps or overlaps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Stable id, unique within the method.
    pub id: BlockId,
    /// First instruction offset (inclusive).
    pub start: u32,
    /// Past-the-end instruction offset.
    pub end: u32,
}

/// One entry of a method's line table: instructions from `start` up to the
/// next entry originate from source `line`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineEntry {
    /// First instruction offset covered by this entry.
    pub start: u16,
    /// Source line number; 0 marks compiler-synthesized code.
    pub line: u32,
}

/// A decoded method: ordered instructions partitioned into blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Method {
    /// Index within the owning unit.
    pub id: MethodId,
    /// Method name, unique within the unit.
    pub name: String,
    /// Number of arguments.
    pub arity: u8,
    /// Number of local variable slots.
    pub locals: u8,
    /// Decoded instruction stream.
    pub code: Vec<Instruction>,
    /// Blocks partitioning `code`.
    pub blocks: Vec<Block>,
    /// Sorted line table.
    pub lines: Vec<LineEntry>,
}

impl Method {
    /// Block owning the instruction at `offset`.
    pub fn block_of(&self, offset: u32) -> BlockId {
        debug_assert!((offset as usize) < self.code.len());
        match self
            .blocks
            .binary_search_by(|b| {
                if offset < b.start {
                    std::cmp::Ordering::Greater
                } else if offset >= b.end {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            }) {
            Ok(idx) => self.blocks[idx].id,
            Err(_) => BlockId(0),
        }
    }

    /// Source line of the instruction at `offset` (0 when unattributed).
    pub fn line_of(&self, offset: u32) -> u32 {
        let mut line = 0;
        for entry in &self.lines {
            if u32::from(entry.start) <= offset {
                line = entry.line;
            } else {
                break;
            }
        }
        line
    }
}

/// A compiled unit: ordered methods plus identity (name + content hash).
///
/// Immutable once loaded; mutated variants are expressed as freshly
/// encoded byte streams, never by editing a loaded unit in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramUnit {
    /// Fully-qualified unit name.
    pub name: String,
    /// FNV-1a 64 hash of the raw unit bytes.
    pub hash: u64,
    /// Methods in declaration order.
    pub methods: Vec<Method>,
}

impl ProgramUnit {
    /// Look up a method by index.
    pub fn method(&self, id: MethodId) -> Option<&Method> {
        self.methods.get(id.0 as usize)
    }

    /// Look up a method by name.
    pub fn method_by_name(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// The set of loaded units an analysis runs over.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramSet {
    /// Units in load order.
    pub units: Vec<ProgramUnit>,
}

impl ProgramSet {
    /// Build a set from already-decoded units.
    pub fn new(units: Vec<ProgramUnit>) -> Self {
        Self { units }
    }

    /// Look up a unit by name.
    pub fn unit(&self, name: &str) -> Option<&ProgramUnit> {
        self.units.iter().find(|u| u.name == name)
    }

    /// Replace the unit with the same name, returning false if absent.
    pub fn replace_unit(&mut self, unit: ProgramUnit) -> bool {
        match self.units.iter_mut().find(|u| u.name == unit.name) {
            Some(slot) => {
                *slot = unit;
                true
            }
            None => false,
        }
    }
}

/// Raised when input bytes cannot be decoded as a valid instruction stream.
#[derive(Debug, Error)]
pub enum MalformedUnitError {
    /// Leading magic bytes did not match.
    #[error("bad magic: not a bytemute unit")]
    BadMagic,
    /// Format version is not supported by this build.
    #[error("unsupported unit format version {0}")]
    UnsupportedVersion(u8),
    /// Input ended in the middle of a record.
    #[error("unexpected end of input while reading {0}")]
    UnexpectedEof(&'static str),
    /// Name bytes were not valid UTF-8.
    #[error("invalid utf-8 in {0} name")]
    BadName(&'static str),
    /// Unknown opcode byte.
    #[error("unknown opcode 0x{opcode:02x} at instruction {offset}")]
    UnknownOpcode {
        /// Offending opcode byte.
        opcode: u8,
        /// Instruction offset at which it appeared.
        offset: usize,
    },
    /// Branch target is outside the method.
    #[error("jump target {target} out of range in method of {len} instructions")]
    JumpOutOfRange {
        /// Encoded target offset.
        target: u16,
        /// Method length in instructions.
        len: usize,
    },
    /// Argument index is not below the method arity.
    #[error("argument index {index} out of range for arity {arity}")]
    ArgOutOfRange {
        /// Encoded argument index.
        index: u8,
        /// Declared arity.
        arity: u8,
    },
    /// Local slot index is not below the declared local count.
    #[error("local slot {index} out of range for {locals} locals")]
    LocalOutOfRange {
        /// Encoded slot index.
        index: u8,
        /// Declared local count.
        locals: u8,
    },
    /// Call target index is not a method of the unit.
    #[error("call target {index} out of range for unit with {methods} methods")]
    CallOutOfRange {
        /// Encoded method index.
        index: u16,
        /// Number of methods in the unit.
        methods: usize,
    },
    /// Bytes remained after the last declared record.
    #[error("{0} trailing bytes after final method record")]
    TrailingBytes(usize),
}

/// FNV-1a 64-bit over arbitrary bytes; the unit content hash.
pub fn fnv1a_64(input: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;

    let mut hash = OFFSET_BASIS;
    for b in input {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_block_method() -> Method {
        Method {
            id: MethodId(0),
            name: "choose".to_string(),
            arity: 1,
            locals: 0,
            code: vec![
                Instruction::PushArg(0),
                Instruction::JumpIfZero(3),
                Instruction::Jump(4),
                Instruction::Nop,
                Instruction::Return,
            ],
            blocks: vec![
                Block { id: BlockId(0), start: 0, end: 2 },
                Block { id: BlockId(1), start: 2, end: 3 },
                Block { id: BlockId(2), start: 3, end: 4 },
                Block { id: BlockId(3), start: 4, end: 5 },
            ],
            lines: vec![
                LineEntry { start: 0, line: 10 },
                LineEntry { start: 3, line: 12 },
            ],
        }
    }

    #[test]
    fn blocks_partition_lookup_is_exact() {
        let method = two_block_method();
        assert_eq!(method.block_of(0), BlockId(0));
        assert_eq!(method.block_of(1), BlockId(0));
        assert_eq!(method.block_of(2), BlockId(1));
        assert_eq!(method.block_of(3), BlockId(2));
        assert_eq!(method.block_of(4), BlockId(3));
    }

    #[test]
    fn line_table_resolves_ranges() {
        let method = two_block_method();
        assert_eq!(method.line_of(0), 10);
        assert_eq!(method.line_of(2), 10);
        assert_eq!(method.line_of(3), 12);
        assert_eq!(method.line_of(4), 12);
    }

    #[test]
    fn fnv_hash_is_stable_and_input_sensitive() {
        let a = fnv1a_64(b"same-input");
        let b = fnv1a_64(b"same-input");
        let c = fnv1a_64(b"other-input");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn replace_unit_swaps_matching_name_only() {
        let unit = ProgramUnit {
            name: "calc".to_string(),
            hash: 1,
            methods: Vec::new(),
        };
        let mut set = ProgramSet::new(vec![unit.clone()]);

        let mut swapped = unit.clone();
        swapped.hash = 2;
        assert!(set.replace_unit(swapped));
        assert_eq!(set.unit("calc").map(|u| u.hash), Some(2));

        let stranger = ProgramUnit {
            name: "other".to_string(),
            hash: 3,
            methods: Vec::new(),
        };
        assert!(!set.replace_unit(stranger));
    }
}
