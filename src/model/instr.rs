//! Stack-machine instruction set and its one-byte-opcode binary encoding.

use serde::{Deserialize, Serialize};

use super::MalformedUnitError;

/// One instruction of the stack machine.
///
/// Values are `i64`. Comparison instructions pop two operands and push 1 or
/// 0. Branch targets are instruction offsets within the owning method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Instruction {
    /// Do nothing.
    Nop,
    /// Push a constant.
    PushConst(i64),
    /// Push argument `n`.
    PushArg(u8),
    /// Push local slot `n`.
    LoadLocal(u8),
    /// Pop into local slot `n`.
    StoreLocal(u8),
    /// Pop two, push sum.
    Add,
    /// Pop two, push difference.
    Sub,
    /// Pop two, push product.
    Mul,
    /// Pop two, push quotient; traps on zero divisor.
    Div,
    /// Pop two, push remainder; traps on zero divisor.
    Rem,
    /// Pop one, push negation.
    Neg,
    /// Pop two, push `a == b`.
    CmpEq,
    /// Pop two, push `a != b`.
    CmpNe,
    /// Pop two, push `a < b`.
    CmpLt,
    /// Pop two, push `a <= b`.
    CmpLe,
    /// Pop two, push `a > b`.
    CmpGt,
    /// Pop two, push `a >= b`.
    CmpGe,
    /// Unconditional branch.
    Jump(u16),
    /// Pop one, branch when it is zero.
    JumpIfZero(u16),
    /// Call method `n` of the same unit; pops its arguments, pushes its
    /// return value.
    Call(u16),
    /// Pop one and discard.
    Pop,
    /// Pop one and return it to the caller.
    Return,
}

const OP_NOP: u8 = 0x00;
const OP_PUSH_CONST: u8 = 0x01;
const OP_PUSH_ARG: u8 = 0x02;
const OP_LOAD_LOCAL: u8 = 0x03;
const OP_STORE_LOCAL: u8 = 0x04;
const OP_ADD: u8 = 0x10;
const OP_SUB: u8 = 0x11;
const OP_MUL: u8 = 0x12;
const OP_DIV: u8 = 0x13;
const OP_REM: u8 = 0x14;
const OP_NEG: u8 = 0x15;
const OP_CMP_EQ: u8 = 0x20;
const OP_CMP_NE: u8 = 0x21;
const OP_CMP_LT: u8 = 0x22;
const OP_CMP_LE: u8 = 0x23;
const OP_CMP_GT: u8 = 0x24;
const OP_CMP_GE: u8 = 0x25;
const OP_JUMP: u8 = 0x30;
const OP_JUMP_IF_ZERO: u8 = 0x31;
const OP_CALL: u8 = 0x40;
const OP_POP: u8 = 0x50;
const OP_RETURN: u8 = 0x51;

impl Instruction {
    /// Append the binary encoding (opcode byte plus little-endian operands).
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Self::Nop => out.push(OP_NOP),
            Self::PushConst(v) => {
                out.push(OP_PUSH_CONST);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Self::PushArg(n) => {
                out.push(OP_PUSH_ARG);
                out.push(*n);
            }
            Self::LoadLocal(n) => {
                out.push(OP_LOAD_LOCAL);
                out.push(*n);
            }
            Self::StoreLocal(n) => {
                out.push(OP_STORE_LOCAL);
                out.push(*n);
            }
            Self::Add => out.push(OP_ADD),
            Self::Sub => out.push(OP_SUB),
            Self::Mul => out.push(OP_MUL),
            Self::Div => out.push(OP_DIV),
            Self::Rem => out.push(OP_REM),
            Self::Neg => out.push(OP_NEG),
            Self::CmpEq => out.push(OP_CMP_EQ),
            Self::CmpNe => out.push(OP_CMP_NE),
            Self::CmpLt => out.push(OP_CMP_LT),
            Self::CmpLe => out.push(OP_CMP_LE),
            Self::CmpGt => out.push(OP_CMP_GT),
            Self::CmpGe => out.push(OP_CMP_GE),
            Self::Jump(t) => {
                out.push(OP_JUMP);
                out.extend_from_slice(&t.to_le_bytes());
            }
            Self::JumpIfZero(t) => {
                out.push(OP_JUMP_IF_ZERO);
                out.extend_from_slice(&t.to_le_bytes());
            }
            Self::Call(m) => {
                out.push(OP_CALL);
                out.extend_from_slice(&m.to_le_bytes());
            }
            Self::Pop => out.push(OP_POP),
            Self::Return => out.push(OP_RETURN),
        }
    }

    /// Decode one instruction starting at `*pos`, advancing `*pos` past it.
    ///
    /// `offset` is the instruction index, used only for diagnostics.
    pub fn decode_from(
        bytes: &[u8],
        pos: &mut usize,
        offset: usize,
    ) -> Result<Self, MalformedUnitError> {
        let opcode = *bytes
            .get(*pos)
            .ok_or(MalformedUnitError::UnexpectedEof("opcode"))?;
        *pos += 1;

        let mut take = |n: usize, what: &'static str| -> Result<&[u8], MalformedUnitError> {
            let slice = bytes
                .get(*pos..*pos + n)
                .ok_or(MalformedUnitError::UnexpectedEof(what))?;
            *pos += n;
            Ok(slice)
        };

        let instr = match opcode {
            OP_NOP => Self::Nop,
            OP_PUSH_CONST => {
                let raw = take(8, "constant operand")?;
                Self::PushConst(i64::from_le_bytes(raw.try_into().expect("slice is 8 bytes")))
            }
            OP_PUSH_ARG => Self::PushArg(take(1, "argument operand")?[0]),
            OP_LOAD_LOCAL => Self::LoadLocal(take(1, "local operand")?[0]),
            OP_STORE_LOCAL => Self::StoreLocal(take(1, "local operand")?[0]),
            OP_ADD => Self::Add,
            OP_SUB => Self::Sub,
            OP_MUL => Self::Mul,
            OP_DIV => Self::Div,
            OP_REM => Self::Rem,
            OP_NEG => Self::Neg,
            OP_CMP_EQ => Self::CmpEq,
            OP_CMP_NE => Self::CmpNe,
            OP_CMP_LT => Self::CmpLt,
            OP_CMP_LE => Self::CmpLe,
            OP_CMP_GT => Self::CmpGt,
            OP_CMP_GE => Self::CmpGe,
            OP_JUMP => {
                let raw = take(2, "jump target")?;
                Self::Jump(u16::from_le_bytes(raw.try_into().expect("slice is 2 bytes")))
            }
            OP_JUMP_IF_ZERO => {
                let raw = take(2, "jump target")?;
                Self::JumpIfZero(u16::from_le_bytes(raw.try_into().expect("slice is 2 bytes")))
            }
            OP_CALL => {
                let raw = take(2, "call target")?;
                Self::Call(u16::from_le_bytes(raw.try_into().expect("slice is 2 bytes")))
            }
            OP_POP => Self::Pop,
            OP_RETURN => Self::Return,
            other => {
                return Err(MalformedUnitError::UnknownOpcode {
                    opcode: other,
                    offset,
                });
            }
        };

        Ok(instr)
    }

    /// Branch target when this instruction transfers control, else `None`.
    pub fn branch_target(&self) -> Option<u16> {
        match self {
            Self::Jump(t) | Self::JumpIfZero(t) => Some(*t),
            _ => None,
        }
    }

    /// True when control never falls through to the next instruction.
    pub fn ends_flow(&self) -> bool {
        matches!(self, Self::Jump(_) | Self::Return)
    }

    /// True for any conditional or unconditional branch or return.
    pub fn is_flow_boundary(&self) -> bool {
        matches!(self, Self::Jump(_) | Self::JumpIfZero(_) | Self::Return)
    }

    /// Short assembler-style mnemonic for descriptions.
    pub fn mnemonic(&self) -> String {
        match self {
            Self::Nop => "nop".to_string(),
            Self::PushConst(v) => format!("push {v}"),
            Self::PushArg(n) => format!("arg {n}"),
            Self::LoadLocal(n) => format!("load {n}"),
            Self::StoreLocal(n) => format!("store {n}"),
            Self::Add => "add".to_string(),
            Self::Sub => "sub".to_string(),
            Self::Mul => "mul".to_string(),
            Self::Div => "div".to_string(),
            Self::Rem => "rem".to_string(),
            Self::Neg => "neg".to_string(),
            Self::CmpEq => "cmpeq".to_string(),
            Self::CmpNe => "cmpne".to_string(),
            Self::CmpLt => "cmplt".to_string(),
            Self::CmpLe => "cmple".to_string(),
            Self::CmpGt => "cmpgt".to_string(),
            Self::CmpGe => "cmpge".to_string(),
            Self::Jump(t) => format!("jump {t}"),
            Self::JumpIfZero(t) => format!("jz {t}"),
            Self::Call(m) => format!("call {m}"),
            Self::Pop => "pop".to_string(),
            Self::Return => "ret".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(instr: Instruction) -> Instruction {
        let mut bytes = Vec::new();
        instr.encode_into(&mut bytes);
        let mut pos = 0;
        let decoded =
            Instruction::decode_from(&bytes, &mut pos, 0).expect("encoded instruction should decode");
        assert_eq!(pos, bytes.len(), "decode should consume every byte");
        decoded
    }

    #[test]
    fn every_instruction_roundtrips() {
        let all = [
            Instruction::Nop,
            Instruction::PushConst(-81_234),
            Instruction::PushArg(3),
            Instruction::LoadLocal(1),
            Instruction::StoreLocal(2),
            Instruction::Add,
            Instruction::Sub,
            Instruction::Mul,
            Instruction::Div,
            Instruction::Rem,
            Instruction::Neg,
            Instruction::CmpEq,
            Instruction::CmpNe,
            Instruction::CmpLt,
            Instruction::CmpLe,
            Instruction::CmpGt,
            Instruction::CmpGe,
            Instruction::Jump(7),
            Instruction::JumpIfZero(9),
            Instruction::Call(2),
            Instruction::Pop,
            Instruction::Return,
        ];
        for instr in all {
            assert_eq!(roundtrip(instr), instr);
        }
    }

    #[test]
    fn unknown_opcode_is_rejected_with_offset() {
        let mut pos = 0;
        let err = Instruction::decode_from(&[0xEE], &mut pos, 41)
            .expect_err("unknown opcode should fail");
        match err {
            MalformedUnitError::UnknownOpcode { opcode, offset } => {
                assert_eq!(opcode, 0xEE);
                assert_eq!(offset, 41);
            }
            other => panic!("expected unknown opcode error, got {other:?}"),
        }
    }

    #[test]
    fn truncated_operand_is_rejected() {
        let mut bytes = Vec::new();
        Instruction::PushConst(5).encode_into(&mut bytes);
        bytes.truncate(4);
        let mut pos = 0;
        let err = Instruction::decode_from(&bytes, &mut pos, 0)
            .expect_err("truncated operand should fail");
        assert!(matches!(err, MalformedUnitError::UnexpectedEof(_)));
    }

    #[test]
    fn flow_classification_matches_semantics() {
        assert!(Instruction::Jump(0).ends_flow());
        assert!(Instruction::Return.ends_flow());
        assert!(!Instruction::JumpIfZero(0).ends_flow());
        assert!(Instruction::JumpIfZero(0).is_flow_boundary());
        assert_eq!(Instruction::JumpIfZero(4).branch_target(), Some(4));
        assert_eq!(Instruction::Add.branch_target(), None);
    }
}
