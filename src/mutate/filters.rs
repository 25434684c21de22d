//! Mutant filter pipeline: ordered interceptors that drop low-value or
//! provably-equivalent mutants before any worker is spawned.

use std::collections::{BTreeSet, VecDeque};

use crate::model::{BlockId, Instruction, Method, ProgramUnit};

use super::Mutant;

/// One stage of the filter pipeline.
///
/// Interceptors may drop mutants but never alter a surviving mutant's
/// content; pipeline order is significant.
pub trait MutantInterceptor: Send + Sync {
    /// Stable interceptor name, used for feature toggles.
    fn name(&self) -> &'static str;
    /// One-line description for diagnostics.
    fn description(&self) -> &'static str;
    /// Whether the interceptor runs unless explicitly disabled.
    fn on_by_default(&self) -> bool {
        true
    }
    /// Return the surviving subset, preserving order.
    fn intercept(&self, mutants: Vec<Mutant>, unit: &ProgramUnit) -> Vec<Mutant>;
}

/// Ordered interceptor chain.
pub struct FilterPipeline {
    interceptors: Vec<Box<dyn MutantInterceptor>>,
}

impl FilterPipeline {
    /// Build the standard pipeline, honoring the disabled-name list.
    pub fn standard(disabled: &[String]) -> Self {
        let all: Vec<Box<dyn MutantInterceptor>> = vec![
            Box::new(DuplicateMutantFilter),
            Box::new(SyntheticLineFilter),
            Box::new(UnreachableBlockFilter),
            Box::new(ConstantComparisonFilter),
        ];
        let interceptors = all
            .into_iter()
            .filter(|i| i.on_by_default() && !disabled.iter().any(|d| d == i.name()))
            .collect();
        Self { interceptors }
    }

    /// Build a pipeline from an explicit interceptor list.
    pub fn new(interceptors: Vec<Box<dyn MutantInterceptor>>) -> Self {
        Self { interceptors }
    }

    /// Interceptor names in pipeline order.
    pub fn interceptor_names(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    /// Run every interceptor left to right.
    pub fn apply(&self, mut mutants: Vec<Mutant>, unit: &ProgramUnit) -> Vec<Mutant> {
        for interceptor in &self.interceptors {
            mutants = interceptor.intercept(mutants, unit);
        }
        mutants
    }
}

/// Junk filter: different operators can land on the same rewrite (e.g. a
/// decrement and a zero-return of constant 1); keep the first occurrence.
pub struct DuplicateMutantFilter;

impl MutantInterceptor for DuplicateMutantFilter {
    fn name(&self) -> &'static str {
        "duplicate_mutants"
    }

    fn description(&self) -> &'static str {
        "collapses mutants with identical site and rewritten instruction"
    }

    fn intercept(&self, mutants: Vec<Mutant>, _unit: &ProgramUnit) -> Vec<Mutant> {
        let mut seen: BTreeSet<(u32, u32, Instruction)> = BTreeSet::new();
        mutants
            .into_iter()
            .filter(|m| seen.insert((m.id.method.0, m.id.offset, m.replacement)))
            .collect()
    }
}

/// Junk filter: drops mutants on compiler-synthesized instructions, which
/// carry line 0 and represent no programmer-visible logic.
pub struct SyntheticLineFilter;

impl MutantInterceptor for SyntheticLineFilter {
    fn name(&self) -> &'static str {
        "synthetic_lines"
    }

    fn description(&self) -> &'static str {
        "drops mutants in synthesized code with no source attribution"
    }

    fn intercept(&self, mutants: Vec<Mutant>, _unit: &ProgramUnit) -> Vec<Mutant> {
        mutants.into_iter().filter(|m| m.line != 0).collect()
    }
}

/// Equivalence filter: a mutant in a block no path reaches cannot change
/// observable behavior.
pub struct UnreachableBlockFilter;

impl MutantInterceptor for UnreachableBlockFilter {
    fn name(&self) -> &'static str {
        "unreachable_blocks"
    }

    fn description(&self) -> &'static str {
        "drops mutants in blocks unreachable from method entry"
    }

    fn intercept(&self, mutants: Vec<Mutant>, unit: &ProgramUnit) -> Vec<Mutant> {
        mutants
            .into_iter()
            .filter(|m| {
                unit.method(m.id.method)
                    .map(|method| reachable_blocks(method).contains(&m.id.block))
                    .unwrap_or(false)
            })
            .collect()
    }
}

fn reachable_blocks(method: &Method) -> BTreeSet<BlockId> {
    let mut reachable = BTreeSet::new();
    if method.blocks.is_empty() {
        return reachable;
    }

    let mut queue = VecDeque::from([method.blocks[0].id]);
    while let Some(id) = queue.pop_front() {
        if !reachable.insert(id) {
            continue;
        }
        let block = &method.blocks[id.0 as usize];
        let last = method.code[block.end as usize - 1];
        if let Some(target) = last.branch_target() {
            queue.push_back(method.block_of(u32::from(target)));
        }
        if !last.ends_flow() && (block.end as usize) < method.code.len() {
            queue.push_back(method.block_of(block.end));
        }
    }
    reachable
}

/// Equivalence filter: a comparison whose operands are literal constants
/// decides statically; when original and rewrite decide the same way the
/// mutant is behavior-preserving and unkillable by design.
pub struct ConstantComparisonFilter;

impl MutantInterceptor for ConstantComparisonFilter {
    fn name(&self) -> &'static str {
        "constant_comparisons"
    }

    fn description(&self) -> &'static str {
        "drops comparison rewrites that decide identically on literal operands"
    }

    fn intercept(&self, mutants: Vec<Mutant>, unit: &ProgramUnit) -> Vec<Mutant> {
        mutants
            .into_iter()
            .filter(|m| !is_equivalent_constant_comparison(m, unit))
            .collect()
    }
}

fn is_equivalent_constant_comparison(mutant: &Mutant, unit: &ProgramUnit) -> bool {
    let offset = mutant.id.offset as usize;
    if offset < 2 {
        return false;
    }
    let Some(method) = unit.method(mutant.id.method) else {
        return false;
    };
    let (Instruction::PushConst(a), Instruction::PushConst(b)) =
        (method.code[offset - 2], method.code[offset - 1])
    else {
        return false;
    };
    match (
        static_compare(mutant.original, a, b),
        static_compare(mutant.replacement, a, b),
    ) {
        (Some(before), Some(after)) => before == after,
        _ => false,
    }
}

fn static_compare(instr: Instruction, a: i64, b: i64) -> Option<bool> {
    match instr {
        Instruction::CmpEq => Some(a == b),
        Instruction::CmpNe => Some(a != b),
        Instruction::CmpLt => Some(a < b),
        Instruction::CmpLe => Some(a <= b),
        Instruction::CmpGt => Some(a > b),
        Instruction::CmpGe => Some(a >= b),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{UnitBuilder, decode_unit};
    use crate::mutate::MutantGenerator;
    use crate::mutate::operators;

    fn generate(unit: &ProgramUnit, groups: &[&str]) -> Vec<Mutant> {
        let groups: Vec<String> = groups.iter().map(|g| (*g).to_string()).collect();
        MutantGenerator::from_groups(&groups)
            .expect("groups should resolve")
            .generate(unit)
    }

    #[test]
    fn pipeline_never_rewrites_survivors() {
        let bytes = UnitBuilder::new("calc")
            .method("sum", 2, 0, |m| {
                m.instr(Instruction::PushArg(0), 3);
                m.instr(Instruction::PushArg(1), 3);
                m.instr(Instruction::Add, 3);
                m.instr(Instruction::Return, 3);
            })
            .encode();
        let unit = decode_unit(&bytes).expect("fixture should decode");
        let mutants = generate(&unit, &["MATH"]);

        let pipeline = FilterPipeline::standard(&[]);
        let survivors = pipeline.apply(mutants.clone(), &unit);
        for survivor in &survivors {
            let original = mutants
                .iter()
                .find(|m| m.id == survivor.id)
                .expect("survivor should come from the input set");
            assert_eq!(original, survivor);
        }
    }

    #[test]
    fn duplicate_rewrites_collapse_to_first() {
        // Constant 1 feeding a return: decrement_const and zero_returns
        // both rewrite it to push 0.
        let bytes = UnitBuilder::new("calc")
            .method("one", 0, 0, |m| {
                m.instr(Instruction::PushConst(1), 9);
                m.instr(Instruction::Return, 9);
            })
            .encode();
        let unit = decode_unit(&bytes).expect("fixture should decode");
        let mutants = generate(&unit, &["INCREMENTS", "RETURNS"]);

        let zero_rewrites: Vec<_> = mutants
            .iter()
            .filter(|m| m.replacement == Instruction::PushConst(0))
            .collect();
        assert!(
            zero_rewrites.len() >= 2,
            "fixture should produce duplicate zero rewrites, got {}",
            zero_rewrites.len()
        );

        let survivors = DuplicateMutantFilter.intercept(mutants, &unit);
        let zero_survivors: Vec<_> = survivors
            .iter()
            .filter(|m| m.replacement == Instruction::PushConst(0))
            .collect();
        assert_eq!(zero_survivors.len(), 1);
        assert_eq!(zero_survivors[0].id.operator, "decrement_const");
    }

    #[test]
    fn synthetic_line_mutants_are_dropped() {
        let bytes = UnitBuilder::new("calc")
            .method("sum", 2, 0, |m| {
                m.instr(Instruction::PushArg(0), 3);
                m.instr(Instruction::PushArg(1), 3);
                m.instr(Instruction::Add, 0);
                m.instr(Instruction::Return, 3);
            })
            .encode();
        let unit = decode_unit(&bytes).expect("fixture should decode");
        let mutants = generate(&unit, &["MATH"]);
        assert_eq!(mutants.len(), 1);

        let survivors = SyntheticLineFilter.intercept(mutants, &unit);
        assert!(survivors.is_empty());
    }

    #[test]
    fn unreachable_block_mutants_are_dropped() {
        // Offset 2 jumps over the add at offset 3; nothing targets it.
        let bytes = UnitBuilder::new("calc")
            .method("skip", 1, 0, |m| {
                m.instr(Instruction::PushArg(0), 4);
                m.instr(Instruction::PushConst(5), 4);
                m.instr(Instruction::Jump(4), 4);
                m.instr(Instruction::Add, 5);
                m.instr(Instruction::Sub, 6);
                m.instr(Instruction::Return, 6);
            })
            .encode();
        let unit = decode_unit(&bytes).expect("fixture should decode");
        let mutants = generate(&unit, &["MATH"]);
        assert_eq!(mutants.len(), 2);

        let survivors = UnreachableBlockFilter.intercept(mutants, &unit);
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].original, Instruction::Sub);
    }

    #[test]
    fn equivalent_constant_comparison_never_reaches_output() {
        // 3 < 5 and 3 <= 5 decide identically; the boundary mutant is
        // provably behavior-preserving.
        let bytes = UnitBuilder::new("calc")
            .method("gate", 0, 0, |m| {
                m.instr(Instruction::PushConst(3), 2);
                m.instr(Instruction::PushConst(5), 2);
                m.instr(Instruction::CmpLt, 2);
                m.instr(Instruction::Return, 2);
            })
            .encode();
        let unit = decode_unit(&bytes).expect("fixture should decode");
        let mutants = generate(&unit, &["CONDITIONALS_BOUNDARY"]);
        assert_eq!(mutants.len(), 1);

        let survivors = ConstantComparisonFilter.intercept(mutants, &unit);
        assert!(survivors.is_empty());

        // 5 < 5 vs 5 <= 5 decide differently; that mutant must survive.
        let bytes = UnitBuilder::new("calc")
            .method("edge", 0, 0, |m| {
                m.instr(Instruction::PushConst(5), 2);
                m.instr(Instruction::PushConst(5), 2);
                m.instr(Instruction::CmpLt, 2);
                m.instr(Instruction::Return, 2);
            })
            .encode();
        let unit = decode_unit(&bytes).expect("fixture should decode");
        let mutants = generate(&unit, &["CONDITIONALS_BOUNDARY"]);
        let survivors = ConstantComparisonFilter.intercept(mutants, &unit);
        assert_eq!(survivors.len(), 1);
    }

    #[test]
    fn disabled_interceptors_are_skipped() {
        let pipeline = FilterPipeline::standard(&["synthetic_lines".to_string()]);
        assert!(!pipeline.interceptor_names().contains(&"synthetic_lines"));
        assert!(pipeline.interceptor_names().contains(&"duplicate_mutants"));
    }

    #[test]
    fn standard_order_runs_junk_before_equivalence() {
        let pipeline = FilterPipeline::standard(&[]);
        assert_eq!(
            pipeline.interceptor_names(),
            vec![
                "duplicate_mutants",
                "synthetic_lines",
                "unreachable_blocks",
                "constant_comparisons",
            ]
        );
    }

    #[test]
    fn default_groups_on_sum_yield_filtered_deterministic_set() {
        let bytes = UnitBuilder::new("calc")
            .method("sum", 2, 0, |m| {
                m.instr(Instruction::PushArg(0), 3);
                m.instr(Instruction::PushArg(1), 3);
                m.instr(Instruction::Add, 3);
                m.instr(Instruction::Return, 3);
            })
            .encode();
        let unit = decode_unit(&bytes).expect("fixture should decode");
        let groups = operators::default_group_names();
        let group_refs: Vec<&str> = groups.iter().map(|s| s.as_str()).collect();
        let mutants = generate(&unit, &group_refs);

        let pipeline = FilterPipeline::standard(&[]);
        let first = pipeline.apply(mutants.clone(), &unit);
        let second = pipeline.apply(mutants, &unit);
        assert_eq!(first, second);
    }
}
