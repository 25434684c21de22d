//! Stack-machine interpreter: the execution substrate of worker processes.
//!
//! Wall-clock runaways are the scheduler's problem; the interpreter only
//! bounds memory (value stack, call depth) so that a mutant blowing the
//! heap is distinguishable from one that merely loops.

use thiserror::Error;

use crate::model::{BlockRef, Instruction, Method, ProgramSet, ProgramUnit};

/// Value-stack entries allowed per invocation before the interpreter
/// declares memory exhaustion.
pub const STACK_LIMIT: usize = 1 << 16;

/// Nested calls allowed before the interpreter declares memory exhaustion.
pub const CALL_DEPTH_LIMIT: usize = 256;

/// Abnormal termination of an invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Trap {
    /// Division or remainder by zero.
    #[error("division by zero in {method}")]
    DivideByZero {
        /// Method that trapped.
        method: String,
    },
    /// Value stack exceeded [`STACK_LIMIT`].
    #[error("value stack exhausted")]
    StackExhausted,
    /// Call depth exceeded [`CALL_DEPTH_LIMIT`].
    #[error("call depth exhausted")]
    CallDepthExceeded,
    /// An instruction popped from an empty stack.
    #[error("stack underflow in {method}")]
    StackUnderflow {
        /// Method that trapped.
        method: String,
    },
    /// Control fell off the end of a method without returning.
    #[error("fell off the end of {method} without a return")]
    MissingReturn {
        /// Method that trapped.
        method: String,
    },
    /// Invocation named a unit the set does not hold.
    #[error("unknown unit {unit}")]
    UnknownUnit {
        /// Requested unit.
        unit: String,
    },
    /// Invocation named a method the unit does not hold.
    #[error("unknown method {unit}::{method}")]
    UnknownMethod {
        /// Owning unit.
        unit: String,
        /// Requested method.
        method: String,
    },
    /// Invocation supplied the wrong number of arguments.
    #[error("{method} takes {arity} arguments, got {given}")]
    ArityMismatch {
        /// Target method.
        method: String,
        /// Declared arity.
        arity: u8,
        /// Arguments supplied.
        given: usize,
    },
}

impl Trap {
    /// True for traps that signal resource exhaustion rather than a wrong
    /// computation; workers exit with the memory code on these.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self, Self::StackExhausted | Self::CallDepthExceeded)
    }
}

/// Executes methods of a loaded program set.
pub struct Interpreter<'a> {
    set: &'a ProgramSet,
}

impl<'a> Interpreter<'a> {
    /// Build an interpreter over a program set.
    pub fn new(set: &'a ProgramSet) -> Self {
        Self { set }
    }

    /// Invoke `unit::method` with `args`, reporting every block entry to
    /// `observer`, and return the method's result.
    pub fn invoke(
        &self,
        unit: &str,
        method: &str,
        args: &[i64],
        observer: &mut dyn FnMut(BlockRef),
    ) -> Result<i64, Trap> {
        let unit = self.set.unit(unit).ok_or_else(|| Trap::UnknownUnit {
            unit: unit.to_string(),
        })?;
        let method = unit.method_by_name(method).ok_or_else(|| Trap::UnknownMethod {
            unit: unit.name.clone(),
            method: method.to_string(),
        })?;
        self.eval(unit, method, args, 0, observer)
    }

    fn eval(
        &self,
        unit: &ProgramUnit,
        method: &Method,
        args: &[i64],
        depth: usize,
        observer: &mut dyn FnMut(BlockRef),
    ) -> Result<i64, Trap> {
        if depth >= CALL_DEPTH_LIMIT {
            return Err(Trap::CallDepthExceeded);
        }
        if args.len() != usize::from(method.arity) {
            return Err(Trap::ArityMismatch {
                method: method.name.clone(),
                arity: method.arity,
                given: args.len(),
            });
        }

        let mut stack: Vec<i64> = Vec::new();
        let mut locals = vec![0i64; usize::from(method.locals)];
        let mut pc: usize = 0;

        macro_rules! pop {
            () => {
                stack.pop().ok_or_else(|| Trap::StackUnderflow {
                    method: method.name.clone(),
                })?
            };
        }

        loop {
            let Some(instr) = method.code.get(pc) else {
                return Err(Trap::MissingReturn {
                    method: method.name.clone(),
                });
            };

            if is_block_start(method, pc as u32) {
                observer(BlockRef {
                    unit: unit.name.clone(),
                    method: method.id,
                    block: method.block_of(pc as u32),
                });
            }

            match *instr {
                Instruction::Nop => {}
                Instruction::PushConst(v) => push(&mut stack, v)?,
                Instruction::PushArg(n) => push(&mut stack, args[usize::from(n)])?,
                Instruction::LoadLocal(n) => {
                    let v = locals[usize::from(n)];
                    push(&mut stack, v)?;
                }
                Instruction::StoreLocal(n) => {
                    let v = pop!();
                    locals[usize::from(n)] = v;
                }
                Instruction::Add => binary(&mut stack, &method.name, i64::wrapping_add)?,
                Instruction::Sub => binary(&mut stack, &method.name, i64::wrapping_sub)?,
                Instruction::Mul => binary(&mut stack, &method.name, i64::wrapping_mul)?,
                Instruction::Div => {
                    let b = pop!();
                    let a = pop!();
                    if b == 0 {
                        return Err(Trap::DivideByZero {
                            method: method.name.clone(),
                        });
                    }
                    push(&mut stack, a.wrapping_div(b))?;
                }
                Instruction::Rem => {
                    let b = pop!();
                    let a = pop!();
                    if b == 0 {
                        return Err(Trap::DivideByZero {
                            method: method.name.clone(),
                        });
                    }
                    push(&mut stack, a.wrapping_rem(b))?;
                }
                Instruction::Neg => {
                    let v = pop!();
                    push(&mut stack, v.wrapping_neg())?;
                }
                Instruction::CmpEq => binary(&mut stack, &method.name, |a, b| i64::from(a == b))?,
                Instruction::CmpNe => binary(&mut stack, &method.name, |a, b| i64::from(a != b))?,
                Instruction::CmpLt => binary(&mut stack, &method.name, |a, b| i64::from(a < b))?,
                Instruction::CmpLe => binary(&mut stack, &method.name, |a, b| i64::from(a <= b))?,
                Instruction::CmpGt => binary(&mut stack, &method.name, |a, b| i64::from(a > b))?,
                Instruction::CmpGe => binary(&mut stack, &method.name, |a, b| i64::from(a >= b))?,
                Instruction::Jump(target) => {
                    pc = usize::from(target);
                    continue;
                }
                Instruction::JumpIfZero(target) => {
                    if pop!() == 0 {
                        pc = usize::from(target);
                        continue;
                    }
                }
                Instruction::Call(index) => {
                    let callee = &unit.methods[usize::from(index)];
                    let arity = usize::from(callee.arity);
                    if stack.len() < arity {
                        return Err(Trap::StackUnderflow {
                            method: method.name.clone(),
                        });
                    }
                    let call_args = stack.split_off(stack.len() - arity);
                    let value = self.eval(unit, callee, &call_args, depth + 1, observer)?;
                    push(&mut stack, value)?;
                }
                Instruction::Pop => {
                    pop!();
                }
                Instruction::Return => return Ok(pop!()),
            }
            pc += 1;
        }
    }
}

fn push(stack: &mut Vec<i64>, value: i64) -> Result<(), Trap> {
    if stack.len() >= STACK_LIMIT {
        return Err(Trap::StackExhausted);
    }
    stack.push(value);
    Ok(())
}

fn binary(
    stack: &mut Vec<i64>,
    method: &str,
    op: impl FnOnce(i64, i64) -> i64,
) -> Result<(), Trap> {
    let b = stack.pop().ok_or_else(|| Trap::StackUnderflow {
        method: method.to_string(),
    })?;
    let a = stack.pop().ok_or_else(|| Trap::StackUnderflow {
        method: method.to_string(),
    })?;
    push(stack, op(a, b))
}

fn is_block_start(method: &Method, offset: u32) -> bool {
    method
        .blocks
        .binary_search_by_key(&offset, |b| b.start)
        .is_ok()
}
