//! Peephole simplification of trivial control flow.
//!
//! The rewrites are length preserving: a replaced instruction never
//! occupies more bytes than the original, and freed bytes stay unmapped
//! (the pc-keyed instruction list treats them as padding). Anything the
//! simplifier does not positively recognize is left untouched, so the
//! control flow graph built afterwards is always sound.

use std::collections::BTreeSet;

use log::debug;

use crate::jvm::code::{Instruction, MethodBody, ProgramCounter};

/// Applies the control flow rewrites until none fires anymore. Returns
/// the number of rewrites performed.
pub fn simplify_control_flow(body: &mut MethodBody, method_name: &str) -> usize {
    let mut rewrites = 0;
    loop {
        let changed = simplify_pass(body);
        if changed == 0 {
            break;
        }
        rewrites += changed;
    }
    if rewrites > 0 {
        debug!("simplified control flow of {method_name} ({rewrites} rewrites)");
    }
    rewrites
}

fn simplify_pass(body: &mut MethodBody) -> usize {
    use Instruction::{Goto, GotoW, LookupSwitch, Nop, TableSwitch};
    let mut changed = 0;
    let pcs: Vec<ProgramCounter> = body.instructions.iter().map(|(pc, _)| *pc).collect();
    for pc in pcs {
        let Some(insn) = body.instructions.get(&pc).cloned() else {
            continue;
        };
        match insn {
            Goto(target) | GotoW(target) => {
                // A goto to the immediately following instruction is dead.
                if body.instructions.next_pc_of(&pc) == Some(target) {
                    body.instructions.replace(pc, Nop);
                    changed += 1;
                    continue;
                }
                // A chain of gotos collapses to its final target, offset
                // width permitting.
                let final_target = follow_goto_chain(body, target);
                if final_target != target
                    && (matches!(insn, GotoW(_)) || fits_i16(pc, final_target))
                {
                    let collapsed = match insn {
                        GotoW(_) => GotoW(final_target),
                        _ => Goto(final_target),
                    };
                    body.instructions.replace(pc, collapsed);
                    changed += 1;
                }
            }
            _ if insn.is_conditional_branch() => {
                changed += simplify_conditional(body, pc, &insn);
            }
            TableSwitch {
                default,
                jump_targets,
                ..
            } => {
                if jump_targets.iter().all(|it| *it == default) {
                    changed += rewrite_degenerate_switch(body, pc, default);
                }
            }
            LookupSwitch {
                default,
                match_targets,
            } => {
                if match_targets.values().all(|it| *it == default) {
                    changed += rewrite_degenerate_switch(body, pc, default);
                }
            }
            _ => {}
        }
    }
    changed
}

fn simplify_conditional(body: &mut MethodBody, pc: ProgramCounter, insn: &Instruction) -> usize {
    use Instruction::{Goto, Nop};
    let Some(target) = insn.branch_target() else {
        return 0;
    };
    let pop = pop_for(insn);
    let Some(next) = body.instructions.next_pc_of(&pc) else {
        return 0;
    };
    // A branch to the next instruction only discards its operands.
    if target == next {
        body.instructions.replace(pc, pop);
        return 1;
    }
    // The "useless if": both the branch and the goto on the fall-through
    // path lead to the same place.
    if let Some(Goto(goto_target)) = body.instructions.get(&next) {
        let goto_target = *goto_target;
        let after_goto = body.instructions.next_pc_of(&next);
        if after_goto == Some(target) && goto_target == target {
            body.instructions.replace(pc, pop);
            body.instructions.replace(next, Nop);
            return 1;
        }
        // The "confused if": the branch only skips over an unconditional
        // goto. Negating the branch removes the indirection.
        if after_goto == Some(target)
            && goto_target != target
            && !is_branch_target(body, next)
            && fits_i16(pc, goto_target)
        {
            if let Some(negated) = insn.negated(goto_target) {
                body.instructions.replace(pc, negated);
                body.instructions.replace(next, Nop);
                return 1;
            }
        }
    }
    0
}

/// Replaces a switch whose every case agrees with the default by a `pop`
/// of the selector followed by a `goto` in the switch's padding bytes.
fn rewrite_degenerate_switch(
    body: &mut MethodBody,
    pc: ProgramCounter,
    default: ProgramCounter,
) -> usize {
    use Instruction::{Goto, Pop};
    let goto_pc = ProgramCounter(pc.0 + 1);
    if body.instructions.contains_pc(&goto_pc) || !fits_i16(goto_pc, default) {
        return 0;
    }
    body.instructions.replace(pc, Pop);
    body.instructions.insert_in_gap(goto_pc, Goto(default));
    1
}

/// Follows a chain of gotos to its final target, guarding against cycles.
fn follow_goto_chain(body: &MethodBody, start: ProgramCounter) -> ProgramCounter {
    use Instruction::{Goto, GotoW};
    let mut visited = BTreeSet::from([start]);
    let mut current = start;
    while let Some(Goto(next) | GotoW(next)) = body.instructions.get(&current) {
        if !visited.insert(*next) {
            break;
        }
        current = *next;
    }
    current
}

fn pop_for(branch: &Instruction) -> Instruction {
    match branch.popped_by_branch() {
        Some(2) => Instruction::Pop2,
        _ => Instruction::Pop,
    }
}

/// Checks whether any branch, switch, or exception handler targets `pc`.
fn is_branch_target(body: &MethodBody, pc: ProgramCounter) -> bool {
    use Instruction::{LookupSwitch, TableSwitch};
    let targeted_by_instruction = body.instructions.iter().any(|(_, insn)| match insn {
        TableSwitch {
            default,
            jump_targets,
            ..
        } => *default == pc || jump_targets.contains(&pc),
        LookupSwitch {
            default,
            match_targets,
        } => *default == pc || match_targets.values().any(|it| *it == pc),
        other => other.branch_target() == Some(pc),
    });
    targeted_by_instruction || body.exception_table.iter().any(|it| it.handler_pc == pc)
}

fn fits_i16(from: ProgramCounter, to: ProgramCounter) -> bool {
    let delta = i32::from(to.0) - i32::from(from.0);
    i16::try_from(delta).is_ok()
}
