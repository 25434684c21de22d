//! Mutant generation: operator contract, registry, deterministic scan.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{BlockId, Instruction, MethodId, ProgramUnit, encode_unit_with_method};

pub mod filters;
pub mod operators;

pub use filters::{FilterPipeline, MutantInterceptor};
pub use operators::{MutationOperator, Rewrite};

/// Identity of one mutant.
///
/// The tuple (unit, hash, method, block, offset, operator, occurrence) is
/// stable across runs for unchanged input, which is what makes re-runs
/// comparable and resume possible.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MutantId {
    /// Originating unit name.
    pub unit: String,
    /// Content hash of the originating unit.
    pub unit_hash: u64,
    /// Method containing the mutation site.
    pub method: MethodId,
    /// Block containing the mutation site.
    pub block: BlockId,
    /// Instruction offset of the mutation site.
    pub offset: u32,
    /// Applied operator id.
    pub operator: String,
    /// Ordinal among this operator's matches within the method.
    pub occurrence: u32,
}

impl fmt::Display for MutantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}#{}@{}[{}#{}]",
            self.unit, self.method, self.block, self.offset, self.operator, self.occurrence
        )
    }
}

/// A candidate mutant: identity, provenance, and the rewritten unit bytes
/// shipped to workers. Immutable once the filter pipeline accepts it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutant {
    /// Identity tuple.
    pub id: MutantId,
    /// Name of the mutated method.
    pub method_name: String,
    /// Source line of the mutation site (0 = synthesized code).
    pub line: u32,
    /// Instruction originally at the site.
    pub original: Instruction,
    /// Instruction the operator put there.
    pub replacement: Instruction,
    /// Human-readable description.
    pub description: String,
    /// Fully re-encoded unit with the rewrite applied.
    pub rewritten_unit: Vec<u8>,
}

/// Scans units with a fixed operator registry, in deterministic order:
/// methods in declaration order, instructions in stream order, operators
/// in registry order. Identical input yields identically-ordered output.
pub struct MutantGenerator {
    operators: Vec<Box<dyn MutationOperator>>,
}

impl MutantGenerator {
    /// Build a generator over an explicit operator list.
    pub fn new(operators: Vec<Box<dyn MutationOperator>>) -> Self {
        Self { operators }
    }

    /// Build a generator from named operator groups; `None` when a group
    /// name is unknown.
    pub fn from_groups(groups: &[String]) -> Option<Self> {
        operators::registry_for_groups(groups).map(Self::new)
    }

    /// Operator ids in registry order.
    pub fn operator_ids(&self) -> Vec<&'static str> {
        self.operators.iter().map(|op| op.id()).collect()
    }

    /// Produce every candidate mutant for one unit.
    pub fn generate(&self, unit: &ProgramUnit) -> Vec<Mutant> {
        let mut mutants = Vec::new();
        for method in &unit.methods {
            // occurrence counters reset per method, keyed by registry slot
            let mut occurrences = vec![0u32; self.operators.len()];
            for offset in 0..method.code.len() {
                let window = &method.code[offset..];
                for (slot, operator) in self.operators.iter().enumerate() {
                    let Some(rewrite) = operator.mutate(window) else {
                        continue;
                    };
                    let occurrence = occurrences[slot];
                    occurrences[slot] += 1;

                    let mut code = method.code.clone();
                    code[offset] = rewrite.replacement;
                    let rewritten_unit = encode_unit_with_method(unit, method.id, &code);

                    let offset = offset as u32;
                    let line = method.line_of(offset);
                    mutants.push(Mutant {
                        id: MutantId {
                            unit: unit.name.clone(),
                            unit_hash: unit.hash,
                            method: method.id,
                            block: method.block_of(offset),
                            offset,
                            operator: operator.id().to_string(),
                            occurrence,
                        },
                        method_name: method.name.clone(),
                        line,
                        original: window[0],
                        replacement: rewrite.replacement,
                        description: format!(
                            "{} in {}::{} (line {line})",
                            rewrite.detail, unit.name, method.name
                        ),
                        rewritten_unit,
                    });
                }
            }
        }
        mutants
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{UnitBuilder, decode_unit};

    fn sum_unit() -> ProgramUnit {
        let bytes = UnitBuilder::new("calc")
            .method("sum", 2, 0, |m| {
                m.instr(Instruction::PushArg(0), 3);
                m.instr(Instruction::PushArg(1), 3);
                m.instr(Instruction::Add, 3);
                m.instr(Instruction::Return, 3);
            })
            .encode();
        decode_unit(&bytes).expect("fixture unit should decode")
    }

    #[test]
    fn generation_is_deterministic() {
        let unit = sum_unit();
        let generator = MutantGenerator::from_groups(&operators::default_group_names())
            .expect("default groups should resolve");
        let first = generator.generate(&unit);
        let second = generator.generate(&unit);
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[test]
    fn math_operator_produces_sub_mutant_with_valid_rewrite() {
        let unit = sum_unit();
        let generator =
            MutantGenerator::from_groups(&["MATH".to_string()]).expect("MATH should resolve");
        let mutants = generator.generate(&unit);
        assert_eq!(mutants.len(), 1);

        let mutant = &mutants[0];
        assert_eq!(mutant.original, Instruction::Add);
        assert_eq!(mutant.replacement, Instruction::Sub);
        assert_eq!(mutant.id.offset, 2);
        assert_eq!(mutant.line, 3);

        // The rewritten bytes must still decode and verify.
        let rewritten = decode_unit(&mutant.rewritten_unit).expect("rewrite should decode");
        assert_eq!(rewritten.methods[0].code[2], Instruction::Sub);
    }

    #[test]
    fn occurrence_index_distinguishes_repeated_matches() {
        let bytes = UnitBuilder::new("calc")
            .method("sum3", 3, 0, |m| {
                m.instr(Instruction::PushArg(0), 3);
                m.instr(Instruction::PushArg(1), 3);
                m.instr(Instruction::Add, 3);
                m.instr(Instruction::PushArg(2), 4);
                m.instr(Instruction::Add, 4);
                m.instr(Instruction::Return, 4);
            })
            .encode();
        let unit = decode_unit(&bytes).expect("fixture unit should decode");
        let generator =
            MutantGenerator::from_groups(&["MATH".to_string()]).expect("MATH should resolve");

        let mutants = generator.generate(&unit);
        assert_eq!(mutants.len(), 2);
        assert_eq!(mutants[0].id.occurrence, 0);
        assert_eq!(mutants[1].id.occurrence, 1);
        assert_ne!(mutants[0].id, mutants[1].id);
    }

    #[test]
    fn unknown_group_yields_no_generator() {
        assert!(MutantGenerator::from_groups(&["NOPE".to_string()]).is_none());
    }
}
