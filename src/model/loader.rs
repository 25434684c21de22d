//! Binary unit codec: decode with verification, encode for shipping.
//!
//! Format (all integers little-endian): magic `BMUT`, format version byte,
//! unit name, method records. Each method record carries name, arity,
//! local count, line table, and its instruction bytes.

use super::instr::Instruction;
use super::{Block, BlockId, LineEntry, MalformedUnitError, Method, MethodId, ProgramUnit, fnv1a_64};

/// Leading magic of every encoded unit.
pub const MAGIC: [u8; 4] = *b"BMUT";
/// Format version this build reads and writes.
pub const FORMAT_VERSION: u8 = 1;

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], MalformedUnitError> {
        let slice = self
            .bytes
            .get(self.pos..self.pos + n)
            .ok_or(MalformedUnitError::UnexpectedEof(what))?;
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, MalformedUnitError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, MalformedUnitError> {
        let raw = self.take(2, what)?;
        Ok(u16::from_le_bytes(raw.try_into().expect("slice is 2 bytes")))
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, MalformedUnitError> {
        let raw = self.take(4, what)?;
        Ok(u32::from_le_bytes(raw.try_into().expect("slice is 4 bytes")))
    }

    fn name(&mut self, what: &'static str) -> Result<String, MalformedUnitError> {
        let len = self.u16(what)? as usize;
        let raw = self.take(len, what)?;
        String::from_utf8(raw.to_vec()).map_err(|_| MalformedUnitError::BadName(what))
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }
}

/// Decode and verify one unit from its raw bytes.
pub fn decode_unit(bytes: &[u8]) -> Result<ProgramUnit, MalformedUnitError> {
    let mut r = ByteReader::new(bytes);

    if r.take(4, "magic")? != MAGIC {
        return Err(MalformedUnitError::BadMagic);
    }
    let version = r.u8("format version")?;
    if version != FORMAT_VERSION {
        return Err(MalformedUnitError::UnsupportedVersion(version));
    }

    let unit_name = r.name("unit")?;
    let method_count = r.u16("method count")? as usize;

    let mut methods = Vec::with_capacity(method_count);
    for index in 0..method_count {
        let name = r.name("method")?;
        let arity = r.u8("arity")?;
        let locals = r.u8("local count")?;

        let line_count = r.u16("line table length")? as usize;
        let mut lines = Vec::with_capacity(line_count);
        for _ in 0..line_count {
            let start = r.u16("line entry offset")?;
            let line = r.u32("line entry number")?;
            lines.push(LineEntry { start, line });
        }

        let code_len = r.u32("code length")? as usize;
        let code_bytes = r.take(code_len, "code bytes")?;
        let code = decode_code(code_bytes)?;

        methods.push(Method {
            id: MethodId(index as u32),
            name,
            arity,
            locals,
            blocks: compute_blocks(&code),
            code,
            lines,
        });
    }

    if r.remaining() != 0 {
        return Err(MalformedUnitError::TrailingBytes(r.remaining()));
    }

    let unit = ProgramUnit {
        name: unit_name,
        hash: fnv1a_64(bytes),
        methods,
    };
    verify_unit(&unit)?;
    Ok(unit)
}

fn decode_code(bytes: &[u8]) -> Result<Vec<Instruction>, MalformedUnitError> {
    let mut code = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        code.push(Instruction::decode_from(bytes, &mut pos, code.len())?);
    }
    Ok(code)
}

fn verify_unit(unit: &ProgramUnit) -> Result<(), MalformedUnitError> {
    let method_count = unit.methods.len();
    for method in &unit.methods {
        let len = method.code.len();
        for instr in &method.code {
            match instr {
                Instruction::PushArg(n) if *n >= method.arity => {
                    return Err(MalformedUnitError::ArgOutOfRange {
                        index: *n,
                        arity: method.arity,
                    });
                }
                Instruction::LoadLocal(n) | Instruction::StoreLocal(n)
                    if *n >= method.locals =>
                {
                    return Err(MalformedUnitError::LocalOutOfRange {
                        index: *n,
                        locals: method.locals,
                    });
                }
                Instruction::Call(m) if usize::from(*m) >= method_count => {
                    return Err(MalformedUnitError::CallOutOfRange {
                        index: *m,
                        methods: method_count,
                    });
                }
                _ => {}
            }
            if let Some(target) = instr.branch_target() {
                if usize::from(target) >= len {
                    return Err(MalformedUnitError::JumpOutOfRange { target, len });
                }
            }
        }
    }
    Ok(())
}

/// Partition an instruction stream into basic blocks.
///
/// Leaders are offset 0, every branch target, and every instruction that
/// follows a flow boundary. The result covers the stream with no gaps.
pub fn compute_blocks(code: &[Instruction]) -> Vec<Block> {
    if code.is_empty() {
        return Vec::new();
    }

    let mut leaders = vec![0u32];
    for (offset, instr) in code.iter().enumerate() {
        if let Some(target) = instr.branch_target() {
            leaders.push(u32::from(target));
        }
        if instr.is_flow_boundary() && offset + 1 < code.len() {
            leaders.push(offset as u32 + 1);
        }
    }
    leaders.sort_unstable();
    leaders.dedup();

    let mut blocks = Vec::with_capacity(leaders.len());
    for (idx, window) in leaders.windows(2).enumerate() {
        blocks.push(Block {
            id: BlockId(idx as u32),
            start: window[0],
            end: window[1],
        });
    }
    blocks.push(Block {
        id: BlockId(blocks.len() as u32),
        start: *leaders.last().expect("leaders always holds offset 0"),
        end: code.len() as u32,
    });
    blocks
}

/// Encode a unit back into its binary form.
pub fn encode_unit(unit: &ProgramUnit) -> Vec<u8> {
    encode_with(unit, None)
}

/// Encode a unit with one method's code replaced; the mutant shipping path.
pub fn encode_unit_with_method(
    unit: &ProgramUnit,
    method: MethodId,
    code: &[Instruction],
) -> Vec<u8> {
    encode_with(unit, Some((method, code)))
}

fn encode_with(unit: &ProgramUnit, replace: Option<(MethodId, &[Instruction])>) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.push(FORMAT_VERSION);
    push_name(&mut out, &unit.name);
    out.extend_from_slice(&(unit.methods.len() as u16).to_le_bytes());

    for method in &unit.methods {
        push_name(&mut out, &method.name);
        out.push(method.arity);
        out.push(method.locals);

        out.extend_from_slice(&(method.lines.len() as u16).to_le_bytes());
        for entry in &method.lines {
            out.extend_from_slice(&entry.start.to_le_bytes());
            out.extend_from_slice(&entry.line.to_le_bytes());
        }

        let code: &[Instruction] = match replace {
            Some((id, code)) if id == method.id => code,
            _ => &method.code,
        };
        let mut code_bytes = Vec::new();
        for instr in code {
            instr.encode_into(&mut code_bytes);
        }
        out.extend_from_slice(&(code_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&code_bytes);
    }

    out
}

fn push_name(out: &mut Vec<u8>, name: &str) {
    out.extend_from_slice(&(name.len() as u16).to_le_bytes());
    out.extend_from_slice(name.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UnitBuilder;

    fn sum_unit_bytes() -> Vec<u8> {
        UnitBuilder::new("calc")
            .method("sum", 2, 0, |m| {
                m.instr(Instruction::PushArg(0), 3);
                m.instr(Instruction::PushArg(1), 3);
                m.instr(Instruction::Add, 3);
                m.instr(Instruction::Return, 3);
            })
            .encode()
    }

    #[test]
    fn encode_decode_roundtrips_structure() {
        let bytes = sum_unit_bytes();
        let unit = decode_unit(&bytes).expect("unit should decode");
        assert_eq!(unit.name, "calc");
        assert_eq!(unit.hash, fnv1a_64(&bytes));
        assert_eq!(unit.methods.len(), 1);

        let method = &unit.methods[0];
        assert_eq!(method.name, "sum");
        assert_eq!(method.arity, 2);
        assert_eq!(
            method.code,
            vec![
                Instruction::PushArg(0),
                Instruction::PushArg(1),
                Instruction::Add,
                Instruction::Return,
            ]
        );

        let reencoded = encode_unit(&unit);
        assert_eq!(reencoded, bytes);
    }

    #[test]
    fn bad_magic_and_version_are_rejected() {
        let mut bytes = sum_unit_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            decode_unit(&bytes),
            Err(MalformedUnitError::BadMagic)
        ));

        let mut bytes = sum_unit_bytes();
        bytes[4] = 99;
        assert!(matches!(
            decode_unit(&bytes),
            Err(MalformedUnitError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn truncated_input_is_rejected() {
        let bytes = sum_unit_bytes();
        for cut in [3, 6, bytes.len() - 1] {
            let err = decode_unit(&bytes[..cut]).expect_err("truncated unit should fail");
            assert!(
                matches!(err, MalformedUnitError::UnexpectedEof(_)),
                "cut at {cut} should report eof, got {err:?}"
            );
        }
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = sum_unit_bytes();
        bytes.extend_from_slice(&[0, 0, 0]);
        assert!(matches!(
            decode_unit(&bytes),
            Err(MalformedUnitError::TrailingBytes(3))
        ));
    }

    #[test]
    fn out_of_range_operands_are_rejected() {
        let bytes = UnitBuilder::new("bad")
            .method("arg", 1, 0, |m| {
                m.instr(Instruction::PushArg(1), 1);
                m.instr(Instruction::Return, 1);
            })
            .encode();
        assert!(matches!(
            decode_unit(&bytes),
            Err(MalformedUnitError::ArgOutOfRange { index: 1, arity: 1 })
        ));

        let bytes = UnitBuilder::new("bad")
            .method("jump", 0, 0, |m| {
                m.instr(Instruction::Jump(9), 1);
            })
            .encode();
        assert!(matches!(
            decode_unit(&bytes),
            Err(MalformedUnitError::JumpOutOfRange { target: 9, len: 1 })
        ));

        let bytes = UnitBuilder::new("bad")
            .method("call", 0, 0, |m| {
                m.instr(Instruction::Call(5), 1);
                m.instr(Instruction::Return, 1);
            })
            .encode();
        assert!(matches!(
            decode_unit(&bytes),
            Err(MalformedUnitError::CallOutOfRange { index: 5, methods: 1 })
        ));
    }

    #[test]
    fn blocks_split_at_branches_and_targets() {
        let bytes = UnitBuilder::new("calc")
            .method("max", 2, 0, |m| {
                m.instr(Instruction::PushArg(0), 5);
                m.instr(Instruction::PushArg(1), 5);
                m.instr(Instruction::CmpGt, 5);
                m.instr(Instruction::JumpIfZero(6), 5);
                m.instr(Instruction::PushArg(0), 6);
                m.instr(Instruction::Return, 6);
                m.instr(Instruction::PushArg(1), 7);
                m.instr(Instruction::Return, 7);
            })
            .encode();
        let unit = decode_unit(&bytes).expect("unit should decode");
        let method = &unit.methods[0];

        assert_eq!(
            method.blocks,
            vec![
                Block { id: BlockId(0), start: 0, end: 4 },
                Block { id: BlockId(1), start: 4, end: 6 },
                Block { id: BlockId(2), start: 6, end: 8 },
            ]
        );

        // Partition invariant: no gaps, no overlaps, full cover.
        let mut cursor = 0;
        for block in &method.blocks {
            assert_eq!(block.start, cursor);
            assert!(block.end > block.start);
            cursor = block.end;
        }
        assert_eq!(cursor as usize, method.code.len());
    }

    #[test]
    fn method_replacement_changes_only_target_method() {
        let bytes = UnitBuilder::new("calc")
            .method("sum", 2, 0, |m| {
                m.instr(Instruction::PushArg(0), 3);
                m.instr(Instruction::PushArg(1), 3);
                m.instr(Instruction::Add, 3);
                m.instr(Instruction::Return, 3);
            })
            .method("one", 0, 0, |m| {
                m.instr(Instruction::PushConst(1), 8);
                m.instr(Instruction::Return, 8);
            })
            .encode();
        let unit = decode_unit(&bytes).expect("unit should decode");

        let mutated_code = vec![
            Instruction::PushArg(0),
            Instruction::PushArg(1),
            Instruction::Sub,
            Instruction::Return,
        ];
        let mutated_bytes = encode_unit_with_method(&unit, MethodId(0), &mutated_code);
        let mutated = decode_unit(&mutated_bytes).expect("mutated unit should decode");

        assert_eq!(mutated.methods[0].code[2], Instruction::Sub);
        assert_eq!(mutated.methods[1].code, unit.methods[1].code);
        assert_ne!(mutated.hash, unit.hash);
    }
}
