//! Backward liveness of local variables.
//!
//! Used by the interpreter to clear dead local slots before merging
//! frames, which tightens joins and speeds up convergence. Locals are
//! tracked in a single 64-bit mask; methods with more locals fall back to
//! treating every local as live.

use std::collections::BTreeMap;

use crate::analysis::cfg::{CfgNode, ControlFlowGraph};
use crate::jvm::code::{Instruction, MethodBody, ProgramCounter};

/// The per-instruction liveness of local variables.
#[derive(Debug, Clone)]
pub struct Liveness {
    live_before: BTreeMap<ProgramCounter, u64>,
    tracked: bool,
}

impl Liveness {
    /// Computes liveness for the given body over its control flow graph.
    #[must_use]
    pub fn new(body: &MethodBody, cfg: &ControlFlowGraph) -> Self {
        if body.max_locals > 64 {
            return Self {
                live_before: BTreeMap::new(),
                tracked: false,
            };
        }
        let mut live_in: BTreeMap<ProgramCounter, u64> = BTreeMap::new();
        // Block-level fixpoint.
        loop {
            let mut changed = false;
            for block in cfg.blocks().collect::<Vec<_>>().into_iter().rev() {
                let live_out = block_live_out(cfg, block.start_pc, &live_in);
                let mut live = live_out;
                for (_, insn) in body
                    .instructions
                    .range(block.start_pc..=block.end_pc)
                    .collect::<Vec<_>>()
                    .into_iter()
                    .rev()
                {
                    live = (live & !kill_mask(insn)) | gen_mask(insn);
                }
                let entry = live_in.entry(block.start_pc).or_insert(0);
                if *entry != live {
                    *entry = live;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        // Expand to per-instruction live-before sets.
        let mut live_before = BTreeMap::new();
        for block in cfg.blocks() {
            let mut live = block_live_out(cfg, block.start_pc, &live_in);
            for (pc, insn) in body
                .instructions
                .range(block.start_pc..=block.end_pc)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
            {
                live = (live & !kill_mask(insn)) | gen_mask(insn);
                live_before.insert(*pc, live);
            }
        }
        Self {
            live_before,
            tracked: true,
        }
    }

    /// Checks whether the local with the given index may still be read
    /// when control reaches `pc`. Answers `true` when liveness is not
    /// tracked for this method.
    #[must_use]
    pub fn is_live_before(&self, pc: ProgramCounter, index: u16) -> bool {
        if !self.tracked || index >= 64 {
            return true;
        }
        self.live_before
            .get(&pc)
            .map_or(true, |mask| mask & (1 << index) != 0)
    }
}

fn block_live_out(
    cfg: &ControlFlowGraph,
    start: ProgramCounter,
    live_in: &BTreeMap<ProgramCounter, u64>,
) -> u64 {
    cfg.successors_of(CfgNode::Block(start))
        .into_iter()
        .map(|succ| match succ {
            CfgNode::Block(pc) => live_in.get(&pc).copied().unwrap_or(0),
            CfgNode::Catch(index) => cfg
                .catch_nodes()
                .nth(index)
                .and_then(|catch| live_in.get(&catch.handler_pc))
                .copied()
                .unwrap_or(0),
            CfgNode::NormalReturn | CfgNode::AbnormalReturn => 0,
        })
        .fold(0, |acc, mask| acc | mask)
}

fn bit(index: u16) -> u64 {
    if index < 64 {
        1 << index
    } else {
        0
    }
}

fn wide_bits(index: u16) -> u64 {
    bit(index) | bit(index + 1)
}

/// The locals read by the instruction.
fn gen_mask(insn: &Instruction) -> u64 {
    use Instruction::*;
    match insn {
        ILoad(i) | FLoad(i) | ALoad(i) | Ret(i) => bit(*i),
        LLoad(i) | DLoad(i) => wide_bits(*i),
        ILoad0 | FLoad0 | ALoad0 => bit(0),
        ILoad1 | FLoad1 | ALoad1 => bit(1),
        ILoad2 | FLoad2 | ALoad2 => bit(2),
        ILoad3 | FLoad3 | ALoad3 => bit(3),
        LLoad0 | DLoad0 => wide_bits(0),
        LLoad1 | DLoad1 => wide_bits(1),
        LLoad2 | DLoad2 => wide_bits(2),
        LLoad3 | DLoad3 => wide_bits(3),
        IInc { index, .. } => bit(*index),
        _ => 0,
    }
}

/// The locals overwritten by the instruction.
fn kill_mask(insn: &Instruction) -> u64 {
    use Instruction::*;
    match insn {
        IStore(i) | FStore(i) | AStore(i) => bit(*i),
        LStore(i) | DStore(i) => wide_bits(*i),
        IStore0 | FStore0 | AStore0 => bit(0),
        IStore1 | FStore1 | AStore1 => bit(1),
        IStore2 | FStore2 | AStore2 => bit(2),
        IStore3 | FStore3 | AStore3 => bit(3),
        LStore0 | DStore0 => wide_bits(0),
        LStore1 | DStore1 => wide_bits(1),
        LStore2 | DStore2 => wide_bits(2),
        LStore3 | DStore3 => wide_bits(3),
        _ => 0,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::code::InstructionList;
    use crate::types::hierarchy::ClassHierarchy;
    use Instruction::*;

    fn analyze<const N: usize>(
        max_locals: u16,
        instructions: [(ProgramCounter, Instruction); N],
    ) -> (MethodBody, Liveness) {
        let body = MethodBody {
            max_locals,
            instructions: InstructionList::from(instructions),
            ..Default::default()
        };
        let cfg = ControlFlowGraph::new(&body, &ClassHierarchy::default()).unwrap();
        let liveness = Liveness::new(&body, &cfg);
        (body, liveness)
    }

    #[test]
    fn local_dies_after_last_read() {
        // 0: iload_0  1: istore_1  2: iload_1  3: ireturn
        let (_, liveness) = analyze(
            2,
            [
                (0.into(), ILoad0),
                (1.into(), IStore1),
                (2.into(), ILoad1),
                (3.into(), IReturn),
            ],
        );
        assert!(liveness.is_live_before(0.into(), 0));
        assert!(!liveness.is_live_before(1.into(), 0));
        assert!(liveness.is_live_before(2.into(), 1));
        assert!(!liveness.is_live_before(3.into(), 1));
    }

    #[test]
    fn loop_keeps_the_counter_alive() {
        // 0: iconst_0  1: istore_0  2: iinc 0 1  5: iload_0  6: bipush 10
        // 8: if_icmplt 2  11: return
        let (_, liveness) = analyze(
            1,
            [
                (0.into(), IConst0),
                (1.into(), IStore0),
                (2.into(), IInc { index: 0, constant: 1 }),
                (5.into(), ILoad0),
                (6.into(), BiPush(10)),
                (8.into(), IfICmpLt(2.into())),
                (11.into(), Return),
            ],
        );
        // Alive around the back edge, dead once the loop exits.
        assert!(liveness.is_live_before(2.into(), 0));
        assert!(liveness.is_live_before(8.into(), 0));
        assert!(!liveness.is_live_before(11.into(), 0));
    }

    #[test]
    fn wide_locals_occupy_two_slots() {
        let (_, liveness) = analyze(
            2,
            [
                (0.into(), LLoad0),
                (1.into(), LReturn),
            ],
        );
        assert!(liveness.is_live_before(0.into(), 0));
        assert!(liveness.is_live_before(0.into(), 1));
    }

    #[test]
    fn too_many_locals_fall_back_to_all_live() {
        let (_, liveness) = analyze(
            65,
            [(0.into(), IConst0), (1.into(), IReturn)],
        );
        assert!(liveness.is_live_before(1.into(), 7));
    }
}
