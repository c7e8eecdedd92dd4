//! Control flow graphs over method bodies.
//!
//! The graph consists of basic blocks, one catch node per exception table
//! entry, and two synthetic exit nodes. It is built in a single pass over
//! the instruction list; a branch into the middle of an already formed
//! block splits that block.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::mem;

use log::trace;

use crate::jvm::code::{Instruction, MethodBody, ProgramCounter};
use crate::jvm::references::ClassRef;
use crate::types::hierarchy::ClassHierarchy;

use super::InconsistentCodeShape;

/// A node of the control flow graph.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub enum CfgNode {
    /// The basic block starting at the given program counter.
    Block(ProgramCounter),
    /// The catch node of the exception table entry with the given index.
    Catch(usize),
    /// The synthetic exit reached by the `*return` instructions.
    NormalReturn,
    /// The synthetic exit reached by exceptions escaping the method.
    AbnormalReturn,
}

impl Display for CfgNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Block(pc) => write!(f, "block@{pc}"),
            Self::Catch(index) => write!(f, "catch[{index}]"),
            Self::NormalReturn => write!(f, "normal-return"),
            Self::AbnormalReturn => write!(f, "abnormal-return"),
        }
    }
}

/// A maximal straight-line run of instructions.
///
/// Exception edges do not end a block; they originate from the block as a
/// whole and lead to catch nodes.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    /// The program counter of the first instruction of the block.
    pub start_pc: ProgramCounter,
    /// The program counter of the last instruction of the block.
    pub end_pc: ProgramCounter,
    predecessors: BTreeSet<CfgNode>,
    successors: BTreeSet<CfgNode>,
}

impl BasicBlock {
    /// The predecessors of the block.
    pub fn predecessors(&self) -> impl Iterator<Item = CfgNode> + '_ {
        self.predecessors.iter().copied()
    }

    /// The successors of the block, catch nodes and exits included.
    pub fn successors(&self) -> impl Iterator<Item = CfgNode> + '_ {
        self.successors.iter().copied()
    }

    /// Checks whether the block covers the given program counter.
    #[must_use]
    pub fn covers(&self, pc: ProgramCounter) -> bool {
        self.start_pc <= pc && pc <= self.end_pc
    }
}

/// The entry into an exception handler.
#[derive(Debug, Clone)]
pub struct CatchNode {
    /// The index of the corresponding exception table entry.
    pub handler_index: usize,
    /// The entry point of the handler code.
    pub handler_pc: ProgramCounter,
    /// The caught type; `None` catches everything.
    pub catch_type: Option<ClassRef>,
    predecessors: BTreeSet<CfgNode>,
}

impl CatchNode {
    /// The blocks that may transfer control to this handler.
    pub fn predecessors(&self) -> impl Iterator<Item = CfgNode> + '_ {
        self.predecessors.iter().copied()
    }
}

/// A control flow graph of a method body.
#[derive(Debug, Clone)]
pub struct ControlFlowGraph {
    blocks: BTreeMap<ProgramCounter, BasicBlock>,
    catch_nodes: Vec<CatchNode>,
    normal_return_predecessors: BTreeSet<CfgNode>,
    abnormal_return_predecessors: BTreeSet<CfgNode>,
}

impl ControlFlowGraph {
    /// Builds the control flow graph of a method body.
    ///
    /// # Errors
    /// Returns [`InconsistentCodeShape`] when a branch target or exception
    /// handler entry does not point at an instruction, or when execution
    /// can fall off the end of the code.
    pub fn new(
        body: &MethodBody,
        class_hierarchy: &ClassHierarchy,
    ) -> Result<Self, InconsistentCodeShape> {
        Builder::new(body, class_hierarchy).build()
    }

    /// The entry node of the graph.
    #[must_use]
    pub fn entry_point(&self) -> CfgNode {
        self.blocks
            .keys()
            .next()
            .map_or(CfgNode::NormalReturn, |pc| CfgNode::Block(*pc))
    }

    /// An iterator over the basic blocks in program counter order.
    pub fn blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.values()
    }

    /// An iterator over the catch nodes in exception table order.
    pub fn catch_nodes(&self) -> impl Iterator<Item = &CatchNode> {
        self.catch_nodes.iter()
    }

    /// The block starting exactly at the given program counter.
    #[must_use]
    pub fn block_starting_at(&self, pc: ProgramCounter) -> Option<&BasicBlock> {
        self.blocks.get(&pc)
    }

    /// The block containing the given program counter.
    #[must_use]
    pub fn block_containing(&self, pc: ProgramCounter) -> Option<&BasicBlock> {
        self.blocks
            .range(..=pc)
            .next_back()
            .map(|(_, block)| block)
            .filter(|block| block.covers(pc))
    }

    /// The successors of a node.
    #[must_use]
    pub fn successors_of(&self, node: CfgNode) -> Vec<CfgNode> {
        match node {
            CfgNode::Block(pc) => self
                .blocks
                .get(&pc)
                .map(|block| block.successors.iter().copied().collect())
                .unwrap_or_default(),
            CfgNode::Catch(index) => self
                .catch_nodes
                .get(index)
                .map(|catch| vec![CfgNode::Block(catch.handler_pc)])
                .unwrap_or_default(),
            CfgNode::NormalReturn | CfgNode::AbnormalReturn => Vec::new(),
        }
    }

    /// The predecessors of a node.
    #[must_use]
    pub fn predecessors_of(&self, node: CfgNode) -> Vec<CfgNode> {
        match node {
            CfgNode::Block(pc) => self
                .blocks
                .get(&pc)
                .map(|block| block.predecessors.iter().copied().collect())
                .unwrap_or_default(),
            CfgNode::Catch(index) => self
                .catch_nodes
                .get(index)
                .map(|catch| catch.predecessors.iter().copied().collect())
                .unwrap_or_default(),
            CfgNode::NormalReturn => self.normal_return_predecessors.iter().copied().collect(),
            CfgNode::AbnormalReturn => {
                self.abnormal_return_predecessors.iter().copied().collect()
            }
        }
    }

    /// An iterator over every edge of the graph.
    pub fn edges(&self) -> impl Iterator<Item = (CfgNode, CfgNode)> + '_ {
        let block_edges = self.blocks.iter().flat_map(|(start, block)| {
            block
                .successors
                .iter()
                .map(move |succ| (CfgNode::Block(*start), *succ))
        });
        let catch_edges = self
            .catch_nodes
            .iter()
            .enumerate()
            .map(|(index, catch)| (CfgNode::Catch(index), CfgNode::Block(catch.handler_pc)));
        block_edges.chain(catch_edges)
    }

    /// The regular (non-exceptional, non-exit) successor program counters
    /// of the block-ending instruction at `pc`. Mid-block instructions
    /// have their single fall-through successor inside the block, which
    /// the instruction list answers directly.
    #[must_use]
    pub fn regular_successor_pcs(&self, pc: ProgramCounter) -> Vec<ProgramCounter> {
        self.block_containing(pc)
            .filter(|block| block.end_pc == pc)
            .map(|block| {
                block
                    .successors
                    .iter()
                    .filter_map(|succ| match succ {
                        CfgNode::Block(start) => Some(*start),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Transient state of the single construction pass.
struct Builder<'b> {
    body: &'b MethodBody,
    class_hierarchy: &'b ClassHierarchy,
    blocks: BTreeMap<ProgramCounter, OpenBlock>,
    catch_nodes: Vec<CatchNode>,
    normal_return_predecessors: BTreeSet<CfgNode>,
    abnormal_return_predecessors: BTreeSet<CfgNode>,
    /// Return addresses recorded per subroutine entry point.
    subroutine_returns: BTreeMap<ProgramCounter, BTreeSet<ProgramCounter>>,
}

#[derive(Debug, Default)]
struct OpenBlock {
    end_pc: Option<ProgramCounter>,
    predecessors: BTreeSet<CfgNode>,
    successors: BTreeSet<CfgNode>,
}

impl<'b> Builder<'b> {
    fn new(body: &'b MethodBody, class_hierarchy: &'b ClassHierarchy) -> Self {
        Self {
            body,
            class_hierarchy,
            blocks: BTreeMap::new(),
            catch_nodes: Vec::new(),
            normal_return_predecessors: BTreeSet::new(),
            abnormal_return_predecessors: BTreeSet::new(),
            subroutine_returns: BTreeMap::new(),
        }
    }

    fn build(mut self) -> Result<ControlFlowGraph, InconsistentCodeShape> {
        self.populate_handler_blocks()?;
        self.sweep()?;
        self.resolve_subroutines();
        self.add_exception_edges();
        self.finish()
    }

    /// Creates the catch nodes and the basic blocks at every handler
    /// entry, wiring each catch node to its block.
    fn populate_handler_blocks(&mut self) -> Result<(), InconsistentCodeShape> {
        for (index, entry) in self.body.exception_table.iter().enumerate() {
            let handler_pc = entry.handler_pc;
            if !self.body.instructions.contains_pc(&handler_pc) {
                return Err(InconsistentCodeShape(format!(
                    "exception handler {index} enters at {handler_pc}, which is not an instruction"
                )));
            }
            self.blocks
                .entry(handler_pc)
                .or_default()
                .predecessors
                .insert(CfgNode::Catch(index));
            self.catch_nodes.push(CatchNode {
                handler_index: index,
                handler_pc,
                catch_type: entry.catch_type.clone(),
                predecessors: BTreeSet::new(),
            });
        }
        Ok(())
    }

    /// Makes sure a block starts at `target`, splitting whichever block
    /// currently covers it. Returns the updated running block, if the
    /// running block was the one split.
    fn ensure_block_at(
        &mut self,
        target: ProgramCounter,
        running: Option<ProgramCounter>,
        swept_up_to: ProgramCounter,
    ) -> Result<Option<ProgramCounter>, InconsistentCodeShape> {
        if self.blocks.contains_key(&target) {
            return Ok(running);
        }
        if !self.body.instructions.contains_pc(&target) {
            return Err(InconsistentCodeShape(format!(
                "branch target {target} is not an instruction"
            )));
        }
        let enclosing = self
            .blocks
            .range(..target)
            .next_back()
            .map(|(start, block)| (*start, block.end_pc));
        if let Some((start, end)) = enclosing {
            match end {
                Some(end) if target <= end => {
                    self.split_closed(start, target);
                    return Ok(running);
                }
                // The running block extends up to the sweep position.
                None if running == Some(start) && target <= swept_up_to => {
                    self.split_open(start, target);
                    return Ok(Some(target));
                }
                _ => {}
            }
        }
        self.blocks.entry(target).or_default();
        Ok(running)
    }

    /// Splits the closed block starting at `start` so that a new block
    /// begins at `target`, inheriting the split block's successors.
    fn split_closed(&mut self, start: ProgramCounter, target: ProgramCounter) {
        let prev = self
            .body
            .instructions
            .prev_pc_of(&target)
            .unwrap_or(start);
        let (end_pc, successors) = {
            let block = self.blocks.get_mut(&start).expect("block must exist");
            let end_pc = block.end_pc;
            let successors = mem::take(&mut block.successors);
            block.end_pc = Some(prev);
            block.successors.insert(CfgNode::Block(target));
            (end_pc, successors)
        };
        for successor in &successors {
            self.replace_predecessor(*successor, CfgNode::Block(start), CfgNode::Block(target));
        }
        self.blocks.insert(
            target,
            OpenBlock {
                end_pc,
                predecessors: BTreeSet::from([CfgNode::Block(start)]),
                successors,
            },
        );
        trace!("split block at {start} to start a new block at {target}");
    }

    /// Splits the still running block so that it ends before `target` and
    /// a new running block begins at `target`.
    fn split_open(&mut self, start: ProgramCounter, target: ProgramCounter) {
        let prev = self
            .body
            .instructions
            .prev_pc_of(&target)
            .unwrap_or(start);
        let block = self.blocks.get_mut(&start).expect("block must exist");
        debug_assert!(block.end_pc.is_none());
        block.end_pc = Some(prev);
        block.successors.insert(CfgNode::Block(target));
        self.blocks.insert(
            target,
            OpenBlock {
                end_pc: None,
                predecessors: BTreeSet::from([CfgNode::Block(start)]),
                successors: BTreeSet::new(),
            },
        );
    }

    fn replace_predecessor(&mut self, node: CfgNode, old: CfgNode, new: CfgNode) {
        let predecessors = match node {
            CfgNode::Block(pc) => self.blocks.get_mut(&pc).map(|b| &mut b.predecessors),
            CfgNode::Catch(index) => self.catch_nodes.get_mut(index).map(|c| &mut c.predecessors),
            CfgNode::NormalReturn => Some(&mut self.normal_return_predecessors),
            CfgNode::AbnormalReturn => Some(&mut self.abnormal_return_predecessors),
        };
        if let Some(predecessors) = predecessors {
            predecessors.remove(&old);
            predecessors.insert(new);
        }
    }

    fn add_edge(&mut self, from: ProgramCounter, to: CfgNode) {
        if let Some(block) = self.blocks.get_mut(&from) {
            block.successors.insert(to);
        }
        match to {
            CfgNode::Block(pc) => {
                if let Some(block) = self.blocks.get_mut(&pc) {
                    block.predecessors.insert(CfgNode::Block(from));
                }
            }
            CfgNode::Catch(index) => {
                if let Some(catch) = self.catch_nodes.get_mut(index) {
                    catch.predecessors.insert(CfgNode::Block(from));
                }
            }
            CfgNode::NormalReturn => {
                self.normal_return_predecessors.insert(CfgNode::Block(from));
            }
            CfgNode::AbnormalReturn => {
                self.abnormal_return_predecessors
                    .insert(CfgNode::Block(from));
            }
        }
    }

    fn close(&mut self, start: ProgramCounter, end: ProgramCounter) {
        if let Some(block) = self.blocks.get_mut(&start) {
            if block.end_pc.is_none() {
                block.end_pc = Some(end);
            }
        }
    }

    /// The main pass over the instruction list.
    fn sweep(&mut self) -> Result<(), InconsistentCodeShape> {
        use Instruction::*;
        let instructions: Vec<(ProgramCounter, Instruction)> = self
            .body
            .instructions
            .iter()
            .map(|(pc, insn)| (*pc, insn.clone()))
            .collect();
        let mut running: Option<ProgramCounter> = None;
        for (pc, insn) in &instructions {
            let pc = *pc;
            match running {
                Some(current) if self.blocks.contains_key(&pc) && current != pc => {
                    // A leader interrupts the running block.
                    let prev = self
                        .body
                        .instructions
                        .prev_pc_of(&pc)
                        .unwrap_or(current);
                    self.close(current, prev);
                    let falls_through = self
                        .body
                        .instruction_at(prev)
                        .is_some_and(Instruction::can_fall_through);
                    if falls_through {
                        self.add_edge(current, CfgNode::Block(pc));
                    }
                    running = Some(pc);
                }
                Some(_) => {}
                None => {
                    self.blocks.entry(pc).or_default();
                    running = Some(pc);
                }
            }
            let current = running.unwrap_or(pc);
            match insn {
                _ if insn.is_conditional_branch() => {
                    let target = insn.branch_target().expect("conditional branch");
                    let fall_through = self.body.instructions.next_pc_of(&pc).ok_or_else(|| {
                        InconsistentCodeShape(format!("{} at {pc} falls off the code", insn.name()))
                    })?;
                    running = self.ensure_block_at(target, running, pc)?;
                    running = self.ensure_block_at(fall_through, running, pc)?;
                    let current = running.unwrap_or(current);
                    self.close(current, pc);
                    self.add_edge(current, CfgNode::Block(target));
                    self.add_edge(current, CfgNode::Block(fall_through));
                    running = None;
                }
                Goto(target) | GotoW(target) => {
                    running = self.ensure_block_at(*target, running, pc)?;
                    let current = running.unwrap_or(current);
                    self.close(current, pc);
                    self.add_edge(current, CfgNode::Block(*target));
                    running = None;
                }
                Jsr(target) | JsrW(target) => {
                    let return_pc = self.body.instructions.next_pc_of(&pc).ok_or_else(|| {
                        InconsistentCodeShape(format!("jsr at {pc} falls off the code"))
                    })?;
                    running = self.ensure_block_at(*target, running, pc)?;
                    running = self.ensure_block_at(return_pc, running, pc)?;
                    let current = running.unwrap_or(current);
                    self.close(current, pc);
                    self.add_edge(current, CfgNode::Block(*target));
                    self.subroutine_returns
                        .entry(*target)
                        .or_default()
                        .insert(return_pc);
                    running = None;
                }
                Ret(_) => {
                    // Targets stay deferred until the subroutines resolve.
                    self.close(current, pc);
                    running = None;
                }
                TableSwitch {
                    default,
                    jump_targets,
                    ..
                } => {
                    let mut targets: Vec<ProgramCounter> = jump_targets.clone();
                    targets.push(*default);
                    for target in &targets {
                        running = self.ensure_block_at(*target, running, pc)?;
                    }
                    let current = running.unwrap_or(current);
                    self.close(current, pc);
                    for target in targets {
                        self.add_edge(current, CfgNode::Block(target));
                    }
                    running = None;
                }
                LookupSwitch {
                    default,
                    match_targets,
                } => {
                    let mut targets: Vec<ProgramCounter> = match_targets.values().copied().collect();
                    targets.push(*default);
                    for target in &targets {
                        running = self.ensure_block_at(*target, running, pc)?;
                    }
                    let current = running.unwrap_or(current);
                    self.close(current, pc);
                    for target in targets {
                        self.add_edge(current, CfgNode::Block(target));
                    }
                    running = None;
                }
                _ if insn.is_return() => {
                    self.close(current, pc);
                    self.add_edge(current, CfgNode::NormalReturn);
                    running = None;
                }
                AThrow => {
                    // Exception edges are added for the whole block later.
                    self.close(current, pc);
                    running = None;
                }
                _ => {}
            }
        }
        if let Some(current) = running {
            // Execution must not fall off the end of the method.
            return Err(InconsistentCodeShape(format!(
                "the block starting at {current} falls off the code"
            )));
        }
        Ok(())
    }

    /// Connects every `ret` reachable inside a subroutine to the return
    /// addresses recorded at the corresponding `jsr` sites.
    fn resolve_subroutines(&mut self) {
        use Instruction::{Jsr, JsrW, Ret};
        let returns: Vec<(ProgramCounter, BTreeSet<ProgramCounter>)> = self
            .subroutine_returns
            .iter()
            .map(|(entry, pcs)| (*entry, pcs.clone()))
            .collect();
        for (entry, return_pcs) in returns {
            let mut visited = BTreeSet::new();
            let mut worklist = vec![entry];
            while let Some(start) = worklist.pop() {
                if !visited.insert(start) {
                    continue;
                }
                let Some(block) = self.blocks.get(&start) else {
                    continue;
                };
                let Some(end_pc) = block.end_pc else {
                    continue;
                };
                match self.body.instruction_at(end_pc) {
                    Some(Ret(_)) => {
                        for return_pc in &return_pcs {
                            self.add_edge(start, CfgNode::Block(*return_pc));
                        }
                    }
                    Some(Jsr(_) | JsrW(_)) => {
                        // A nested subroutine eventually returns behind the
                        // jsr; continue the walk there.
                        if let Some(return_pc) = self.body.instructions.next_pc_of(&end_pc) {
                            worklist.push(return_pc);
                        }
                    }
                    _ => {
                        let successors: Vec<ProgramCounter> = self
                            .blocks
                            .get(&start)
                            .map(|block| {
                                block
                                    .successors
                                    .iter()
                                    .filter_map(|succ| match succ {
                                        CfgNode::Block(pc) => Some(*pc),
                                        _ => None,
                                    })
                                    .collect()
                            })
                            .unwrap_or_default();
                        worklist.extend(successors);
                    }
                }
            }
        }
    }

    /// Connects every block containing a potentially throwing instruction
    /// to the applicable catch nodes, and to the abnormal exit when the
    /// exception may escape.
    fn add_exception_edges(&mut self) {
        let block_ranges: Vec<(ProgramCounter, ProgramCounter)> = self
            .blocks
            .iter()
            .filter_map(|(start, block)| block.end_pc.map(|end| (*start, end)))
            .collect();
        for (start, end) in block_ranges {
            let throwing: Vec<(ProgramCounter, Vec<&'static str>)> = self
                .body
                .instructions
                .range(start..=end)
                .filter_map(|(pc, insn)| {
                    let exceptions = insn.jvm_exceptions();
                    if exceptions.is_empty() {
                        None
                    } else {
                        Some((*pc, exceptions.to_vec()))
                    }
                })
                .collect();
            for (pc, exceptions) in throwing {
                for exception in exceptions {
                    let routing = self.body.route_exception(
                        pc,
                        &ClassRef::new(exception),
                        self.class_hierarchy,
                    );
                    for (index, _) in &routing.handlers {
                        self.add_edge(start, CfgNode::Catch(*index));
                    }
                    if !routing.definitely_caught {
                        self.add_edge(start, CfgNode::AbnormalReturn);
                    }
                }
            }
        }
    }

    fn finish(self) -> Result<ControlFlowGraph, InconsistentCodeShape> {
        let mut blocks = BTreeMap::new();
        for (start, block) in self.blocks {
            let Some(end_pc) = block.end_pc else {
                return Err(InconsistentCodeShape(format!(
                    "the block starting at {start} was never completed"
                )));
            };
            blocks.insert(
                start,
                BasicBlock {
                    start_pc: start,
                    end_pc,
                    predecessors: block.predecessors,
                    successors: block.successors,
                },
            );
        }
        Ok(ControlFlowGraph {
            blocks,
            catch_nodes: self.catch_nodes,
            normal_return_predecessors: self.normal_return_predecessors,
            abnormal_return_predecessors: self.abnormal_return_predecessors,
        })
    }
}

// Tests live at the end of the module; they build instruction lists the
// way the loader would and compare the resulting graphs edge by edge.
#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::code::{ExceptionTableEntry, InstructionList};
    use Instruction::*;

    fn build(body: &MethodBody) -> ControlFlowGraph {
        let hierarchy = ClassHierarchy::with_java_lang_types([]);
        ControlFlowGraph::new(body, &hierarchy).expect("the graph must build")
    }

    fn body_of<const N: usize>(instructions: [(ProgramCounter, Instruction); N]) -> MethodBody {
        MethodBody {
            instructions: InstructionList::from(instructions),
            ..Default::default()
        }
    }

    #[test]
    fn straight_line_code_is_one_block() {
        let body = body_of([
            (0.into(), IConst0),
            (1.into(), IConst1),
            (2.into(), IAdd),
            (3.into(), IReturn),
        ]);
        let cfg = build(&body);
        assert_eq!(cfg.blocks().count(), 1);
        let block = cfg.block_starting_at(0.into()).unwrap();
        assert_eq!(block.end_pc, 3.into());
        assert_eq!(
            cfg.successors_of(CfgNode::Block(0.into())),
            vec![CfgNode::NormalReturn]
        );
    }

    #[test]
    fn conditional_branch_forks_the_block() {
        // 0: iload_0  1: ifeq 5  4: iconst_0  5: ireturn
        let body = body_of([
            (0.into(), ILoad0),
            (1.into(), IfEq(5.into())),
            (4.into(), IConst0),
            (5.into(), IReturn),
        ]);
        let cfg = build(&body);
        assert_eq!(cfg.blocks().count(), 3);
        assert_eq!(
            cfg.successors_of(CfgNode::Block(0.into())),
            vec![CfgNode::Block(4.into()), CfgNode::Block(5.into())]
        );
        assert_eq!(
            cfg.successors_of(CfgNode::Block(4.into())),
            vec![CfgNode::Block(5.into())]
        );
    }

    #[test]
    fn backward_branch_splits_the_enclosing_block() {
        // 0: iconst_0  1: istore_0  2: iinc 0 1  5: iload_0  6: bipush 10
        // 8: if_icmplt 2  11: return
        let body = body_of([
            (0.into(), IConst0),
            (1.into(), IStore0),
            (2.into(), IInc { index: 0, constant: 1 }),
            (5.into(), ILoad0),
            (6.into(), BiPush(10)),
            (8.into(), IfICmpLt(2.into())),
            (11.into(), Return),
        ]);
        let cfg = build(&body);
        let first = cfg.block_starting_at(0.into()).unwrap();
        assert_eq!(first.end_pc, 1.into());
        let loop_block = cfg.block_starting_at(2.into()).unwrap();
        assert_eq!(loop_block.end_pc, 8.into());
        assert_eq!(
            cfg.successors_of(CfgNode::Block(2.into())),
            vec![CfgNode::Block(2.into()), CfgNode::Block(11.into())]
        );
        assert!(cfg
            .predecessors_of(CfgNode::Block(2.into()))
            .contains(&CfgNode::Block(0.into())));
    }

    #[test]
    fn switch_connects_default_and_all_cases() {
        let body = body_of([
            (0.into(), ILoad0),
            (
                1.into(),
                TableSwitch {
                    low: 0,
                    high: 1,
                    default: 20.into(),
                    jump_targets: vec![14.into(), 17.into()],
                },
            ),
            (14.into(), IConst0),
            (15.into(), IReturn),
            (17.into(), IConst1),
            (18.into(), IReturn),
            (20.into(), IConstM1),
            (21.into(), IReturn),
        ]);
        let cfg = build(&body);
        assert_eq!(
            cfg.successors_of(CfgNode::Block(0.into())),
            vec![
                CfgNode::Block(14.into()),
                CfgNode::Block(17.into()),
                CfgNode::Block(20.into())
            ]
        );
    }

    #[test]
    fn handler_entry_is_predecessed_by_its_catch_node() {
        let body = MethodBody {
            instructions: InstructionList::from([
                (0.into(), ILoad0),
                (1.into(), ILoad1),
                (2.into(), IDiv),
                (3.into(), IReturn),
                (4.into(), Pop),
                (5.into(), IConstM1),
                (6.into(), IReturn),
            ]),
            exception_table: vec![ExceptionTableEntry {
                covered_pc: 0.into()..=3.into(),
                handler_pc: 4.into(),
                catch_type: Some(ClassRef::new("java/lang/ArithmeticException")),
            }],
            ..Default::default()
        };
        let cfg = build(&body);
        assert!(cfg
            .predecessors_of(CfgNode::Block(4.into()))
            .contains(&CfgNode::Catch(0)));
        // The division may throw into the handler.
        assert!(cfg
            .successors_of(CfgNode::Block(0.into()))
            .contains(&CfgNode::Catch(0)));
        // ArithmeticException is provably caught, so the division itself
        // adds no abnormal exit edge.
        assert_eq!(
            cfg.predecessors_of(CfgNode::AbnormalReturn),
            Vec::<CfgNode>::new()
        );
    }

    #[test]
    fn athrow_may_escape_the_method() {
        let body = body_of([(0.into(), ALoad0), (1.into(), AThrow)]);
        let cfg = build(&body);
        assert_eq!(
            cfg.successors_of(CfgNode::Block(0.into())),
            vec![CfgNode::AbnormalReturn]
        );
    }

    #[test]
    fn subroutine_ret_returns_to_every_call_site() {
        // 0: jsr 8  3: jsr 8  6: nop 7: return  8: astore_0  9: ret 0
        let body = body_of([
            (0.into(), Jsr(8.into())),
            (3.into(), Jsr(8.into())),
            (6.into(), Nop),
            (7.into(), Return),
            (8.into(), AStore0),
            (9.into(), Ret(0)),
        ]);
        let cfg = build(&body);
        let ret_successors = cfg.successors_of(CfgNode::Block(8.into()));
        assert!(ret_successors.contains(&CfgNode::Block(3.into())));
        assert!(ret_successors.contains(&CfgNode::Block(6.into())));
    }

    #[test]
    fn missing_branch_target_is_rejected() {
        let body = body_of([(0.into(), Goto(9.into()))]);
        let hierarchy = ClassHierarchy::default();
        assert!(ControlFlowGraph::new(&body, &hierarchy).is_err());
    }

    #[test]
    fn successors_match_instruction_successors() {
        let body = body_of([
            (0.into(), ILoad0),
            (1.into(), IfEq(6.into())),
            (4.into(), IConst0),
            (5.into(), IReturn),
            (6.into(), IConst1),
            (7.into(), IReturn),
        ]);
        let cfg = build(&body);
        let hierarchy = ClassHierarchy::default();
        for (pc, insn) in body.instructions.iter() {
            let mut from_instruction = insn.next_instructions(*pc, &body, &hierarchy, true);
            from_instruction.sort_unstable();
            let block = cfg.block_containing(*pc).unwrap();
            let mut from_cfg = if *pc == block.end_pc {
                cfg.regular_successor_pcs(*pc)
            } else {
                vec![body.instructions.next_pc_of(pc).unwrap()]
            };
            from_cfg.sort_unstable();
            assert_eq!(from_instruction, from_cfg, "at {pc}");
        }
    }
}
