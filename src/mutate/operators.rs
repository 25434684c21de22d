//! Reference operator set, grouped for selection convenience.
//!
//! Every operator is a pure rewrite of the instruction at the head of its
//! window, with identical stack effect and operand types, so a rewritten
//! unit always re-verifies.

use crate::model::Instruction;

/// A single-site rewrite produced by an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
    /// Instruction replacing the head of the window.
    pub replacement: Instruction,
    /// Short description of the change, e.g. `replaced add with sub`.
    pub detail: String,
}

/// A mutation operator: declares a pattern over an instruction window and,
/// when it matches, yields one stack-effect-preserving replacement.
pub trait MutationOperator: Send + Sync {
    /// Stable operator id, e.g. `math_add_to_sub`.
    fn id(&self) -> &'static str;
    /// One-line description for diagnostics.
    fn description(&self) -> &'static str;
    /// Rewrite the head of `window`, or `None` when the pattern misses.
    /// `window` is never empty; entries past the head are lookahead only.
    fn mutate(&self, window: &[Instruction]) -> Option<Rewrite>;
}

/// Swaps one operand-free opcode for another.
struct OpcodeSwap {
    id: &'static str,
    description: &'static str,
    from: Instruction,
    to: Instruction,
}

impl MutationOperator for OpcodeSwap {
    fn id(&self) -> &'static str {
        self.id
    }

    fn description(&self) -> &'static str {
        self.description
    }

    fn mutate(&self, window: &[Instruction]) -> Option<Rewrite> {
        if window[0] != self.from {
            return None;
        }
        Some(Rewrite {
            replacement: self.to,
            detail: format!(
                "replaced {} with {}",
                self.from.mnemonic(),
                self.to.mnemonic()
            ),
        })
    }
}

/// Shifts an integer constant by a fixed delta.
struct ConstShift {
    id: &'static str,
    description: &'static str,
    delta: i64,
}

impl MutationOperator for ConstShift {
    fn id(&self) -> &'static str {
        self.id
    }

    fn description(&self) -> &'static str {
        self.description
    }

    fn mutate(&self, window: &[Instruction]) -> Option<Rewrite> {
        let Instruction::PushConst(value) = window[0] else {
            return None;
        };
        let shifted = value.wrapping_add(self.delta);
        Some(Rewrite {
            replacement: Instruction::PushConst(shifted),
            detail: format!("replaced constant {value} with {shifted}"),
        })
    }
}

/// Forces a constant feeding a return to a fixed value.
struct ConstReturn {
    id: &'static str,
    description: &'static str,
    forced: i64,
}

impl MutationOperator for ConstReturn {
    fn id(&self) -> &'static str {
        self.id
    }

    fn description(&self) -> &'static str {
        self.description
    }

    fn mutate(&self, window: &[Instruction]) -> Option<Rewrite> {
        let Instruction::PushConst(value) = window[0] else {
            return None;
        };
        if window.get(1) != Some(&Instruction::Return) || value == self.forced {
            return None;
        }
        Some(Rewrite {
            replacement: Instruction::PushConst(self.forced),
            detail: format!("replaced returned constant {value} with {}", self.forced),
        })
    }
}

/// Negates a constant feeding a return.
struct NegatedReturn;

impl MutationOperator for NegatedReturn {
    fn id(&self) -> &'static str {
        "negate_returns"
    }

    fn description(&self) -> &'static str {
        "negates a constant fed straight into a return"
    }

    fn mutate(&self, window: &[Instruction]) -> Option<Rewrite> {
        let Instruction::PushConst(value) = window[0] else {
            return None;
        };
        if window.get(1) != Some(&Instruction::Return) || value == 0 {
            return None;
        }
        Some(Rewrite {
            replacement: Instruction::PushConst(value.wrapping_neg()),
            detail: format!("replaced returned constant {value} with {}", value.wrapping_neg()),
        })
    }
}

/// Group names in default registry order.
pub fn default_group_names() -> Vec<String> {
    GROUP_NAMES.iter().map(|n| (*n).to_string()).collect()
}

const GROUP_NAMES: [&str; 5] = [
    "MATH",
    "CONDITIONALS_BOUNDARY",
    "CONDITIONALS_NEGATE",
    "INCREMENTS",
    "RETURNS",
];

fn group_members(name: &str) -> Option<Vec<Box<dyn MutationOperator>>> {
    use Instruction::*;

    let swap = |id, description, from, to| -> Box<dyn MutationOperator> {
        Box::new(OpcodeSwap {
            id,
            description,
            from,
            to,
        })
    };

    let members: Vec<Box<dyn MutationOperator>> = match name {
        "MATH" => vec![
            swap("math_add_to_sub", "replaces addition with subtraction", Add, Sub),
            swap("math_sub_to_add", "replaces subtraction with addition", Sub, Add),
            swap("math_mul_to_div", "replaces multiplication with division", Mul, Div),
            swap("math_div_to_mul", "replaces division with multiplication", Div, Mul),
            swap("math_rem_to_mul", "replaces remainder with multiplication", Rem, Mul),
        ],
        "CONDITIONALS_BOUNDARY" => vec![
            swap("boundary_lt_to_le", "relaxes < to <=", CmpLt, CmpLe),
            swap("boundary_le_to_lt", "tightens <= to <", CmpLe, CmpLt),
            swap("boundary_gt_to_ge", "relaxes > to >=", CmpGt, CmpGe),
            swap("boundary_ge_to_gt", "tightens >= to >", CmpGe, CmpGt),
        ],
        "CONDITIONALS_NEGATE" => vec![
            swap("negate_eq_to_ne", "negates ==", CmpEq, CmpNe),
            swap("negate_ne_to_eq", "negates !=", CmpNe, CmpEq),
            swap("negate_lt_to_ge", "negates <", CmpLt, CmpGe),
            swap("negate_ge_to_lt", "negates >=", CmpGe, CmpLt),
            swap("negate_gt_to_le", "negates >", CmpGt, CmpLe),
            swap("negate_le_to_gt", "negates <=", CmpLe, CmpGt),
        ],
        "INCREMENTS" => vec![
            Box::new(ConstShift {
                id: "increment_const",
                description: "shifts an integer constant up by one",
                delta: 1,
            }),
            Box::new(ConstShift {
                id: "decrement_const",
                description: "shifts an integer constant down by one",
                delta: -1,
            }),
        ],
        "RETURNS" => vec![
            Box::new(ConstReturn {
                id: "zero_returns",
                description: "forces a returned constant to zero",
                forced: 0,
            }),
            Box::new(ConstReturn {
                id: "one_returns",
                description: "forces a returned constant to one",
                forced: 1,
            }),
            Box::new(NegatedReturn),
        ],
        _ => return None,
    };
    Some(members)
}

/// True when `name` is a registered operator group.
pub fn is_known_group(name: &str) -> bool {
    GROUP_NAMES.contains(&name)
}

/// Resolve group names into a flat operator registry, preserving the given
/// group order and each group's fixed member order. `None` when any name
/// is unknown.
pub fn registry_for_groups(groups: &[String]) -> Option<Vec<Box<dyn MutationOperator>>> {
    let mut registry = Vec::new();
    for group in groups {
        registry.extend(group_members(group)?);
    }
    Some(registry)
}
