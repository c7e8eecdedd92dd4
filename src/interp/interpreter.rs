//! The abstract interpreter: a worklist fixed point over the instruction
//! list, merging frames at join points and routing exceptions through the
//! handler table.

use std::collections::{BTreeMap, BTreeSet};

use crate::analysis::fixed_point::{Analyzer, Update};
use crate::analysis::liveness::Liveness;
use crate::jvm::code::{Instruction, MethodBody, ProgramCounter};
use crate::jvm::method::Method;
use crate::jvm::references::{ClassRef, JAVA_LANG_THROWABLE};
use crate::types::field_type::FieldType;

use super::call::CallDispatcher;
use super::domain::reference::{ReferenceValue, TypeBound};
use super::domain::{AbstractValue, Domain};
use super::execution::{execute, Continuation};
use super::frame::{Entry, Frame};
use super::interrupt::InterruptPolicy;
use super::{Configuration, ControlTransfer, InterpretationError};

pub(crate) struct Interpreter<'i, 'b> {
    pub method: &'i Method,
    pub body: &'b MethodBody,
    pub domain: Domain,
    pub config: &'i Configuration,
    pub liveness: Option<Liveness>,
    pub policy: Box<dyn InterruptPolicy>,
    pub dispatcher: Option<&'i mut dyn CallDispatcher>,
    pub returned_values: BTreeMap<ProgramCounter, Option<AbstractValue>>,
    pub escaping_exceptions: BTreeMap<ProgramCounter, Vec<ReferenceValue>>,
    pub control_flow_edges: BTreeSet<(ProgramCounter, ProgramCounter, ControlTransfer)>,
}

impl Interpreter<'_, '_> {
    fn next_pc_of(&self, pc: ProgramCounter) -> Result<ProgramCounter, InterpretationError> {
        self.body
            .instructions
            .next_pc_of(&pc)
            .ok_or(InterpretationError::MalformedControlFlow)
    }

    /// Joins a newly observed returned value into the per-site record.
    fn record_return(&mut self, pc: ProgramCounter, value: Option<AbstractValue>) {
        match self.returned_values.get_mut(&pc) {
            None => {
                self.returned_values.insert(pc, value);
            }
            Some(previous) => {
                if let (Some(current), Some(incoming)) = (previous.as_ref(), value) {
                    if let Some(update) = self.domain.join_values(current, &incoming) {
                        if let Some(joined) = update.into_value() {
                            *previous = Some(joined);
                        }
                    }
                }
            }
        }
    }

    fn record_escaping(&mut self, pc: ProgramCounter, value: ReferenceValue) {
        let escaped = self.escaping_exceptions.entry(pc).or_default();
        if !escaped.contains(&value) {
            escaped.push(value);
        }
    }

    /// The most specific class usable to route an exception value through
    /// the handler table.
    fn exception_class_of(value: &ReferenceValue) -> ClassRef {
        match value.bound() {
            TypeBound::Class(class) => class,
            TypeBound::Intersection(bounds) => bounds
                .into_iter()
                .next()
                .unwrap_or_else(|| ClassRef::new(JAVA_LANG_THROWABLE)),
            _ => ClassRef::new(JAVA_LANG_THROWABLE),
        }
    }

    /// Routes one thrown value through the exception table, producing the
    /// handler entry frames.
    fn route_thrown(
        &mut self,
        pc: ProgramCounter,
        base: &Frame,
        value: ReferenceValue,
        affected: &mut Vec<(ProgramCounter, Frame)>,
    ) {
        let class = Self::exception_class_of(&value);
        let routing = self
            .body
            .route_exception(pc, &class, self.domain.class_hierarchy());
        for (index, handler_pc) in &routing.handlers {
            self.control_flow_edges
                .insert((pc, *handler_pc, ControlTransfer::Exception));
            let caught = match self
                .body
                .exception_table
                .get(*index)
                .and_then(|entry| entry.catch_type.as_ref())
            {
                Some(catch_type) => value
                    .refine_upper_type_bound(
                        &FieldType::Object(catch_type.clone()),
                        self.domain.class_hierarchy(),
                    )
                    .unwrap_or_else(|_| value.clone()),
                None => value.clone(),
            };
            let handler_frame = base
                .same_locals_1_stack_item_frame(Entry::Value(AbstractValue::Reference(caught)));
            affected.push((*handler_pc, handler_frame));
        }
        if !routing.definitely_caught {
            self.record_escaping(pc, value);
        }
    }
}

impl Analyzer for Interpreter<'_, '_> {
    type Location = ProgramCounter;
    type Fact = Frame;
    type Err = InterpretationError;
    type AffectedLocations = Vec<(ProgramCounter, Frame)>;

    fn entry_fact(&mut self) -> Result<(ProgramCounter, Frame), InterpretationError> {
        let first_pc = self
            .body
            .instructions
            .entry_point()
            .ok_or(InterpretationError::MalformedControlFlow)?
            .0
            .to_owned();
        Frame::new(
            self.method.is_static(),
            &self.method.owner,
            &self.method.descriptor,
            self.body.max_locals,
            self.body.max_stack,
            &mut self.domain,
        )
        .map(|frame| (first_pc, frame))
        .map_err(Into::into)
    }

    fn analyze_location(
        &mut self,
        location: &ProgramCounter,
        fact: &Frame,
    ) -> Result<Vec<(ProgramCounter, Frame)>, InterpretationError> {
        use ControlTransfer::{Conditional, SubroutineReturn, Unconditional};
        let location = *location;
        let instruction = self
            .body
            .instruction_at(location)
            .ok_or(InterpretationError::MalformedControlFlow)?;
        let execution = {
            let mut dispatcher = self.dispatcher.take();
            let reborrowed: Option<&mut dyn CallDispatcher> = match &mut dispatcher {
                Some(d) => Some(&mut **d),
                None => None,
            };
            let result = execute(
                instruction,
                location,
                self.body,
                fact,
                &mut self.domain,
                self.config,
                reborrowed,
            );
            self.dispatcher = dispatcher;
            result
        }?;
        let mut affected = Vec::new();
        match execution.continuation {
            Continuation::FallThrough(frame) => {
                let next_pc = self.next_pc_of(location)?;
                self.control_flow_edges
                    .insert((location, next_pc, Unconditional));
                affected.push((next_pc, frame));
            }
            Continuation::Branch { taken, not_taken } => {
                let target = instruction
                    .branch_target()
                    .ok_or(InterpretationError::MalformedControlFlow)?;
                if let Some(frame) = taken {
                    self.control_flow_edges
                        .insert((location, target, Conditional));
                    affected.push((target, frame));
                }
                if let Some(frame) = not_taken {
                    let next_pc = self.next_pc_of(location)?;
                    self.control_flow_edges
                        .insert((location, next_pc, Conditional));
                    affected.push((next_pc, frame));
                }
            }
            Continuation::Jump { target, frame } => {
                self.control_flow_edges
                    .insert((location, target, Unconditional));
                affected.push((target, frame));
            }
            Continuation::Switch(frame) => {
                let targets: Vec<ProgramCounter> = match instruction {
                    Instruction::TableSwitch {
                        default,
                        jump_targets,
                        ..
                    } => jump_targets
                        .iter()
                        .chain(std::iter::once(default))
                        .copied()
                        .collect(),
                    Instruction::LookupSwitch {
                        default,
                        match_targets,
                    } => match_targets
                        .values()
                        .chain(std::iter::once(default))
                        .copied()
                        .collect(),
                    _ => return Err(InterpretationError::MalformedControlFlow),
                };
                let mut seen = BTreeSet::new();
                for target in targets {
                    if seen.insert(target) {
                        self.control_flow_edges
                            .insert((location, target, Conditional));
                        affected.push((target, frame.same_frame()));
                    }
                }
            }
            Continuation::Return(value) => {
                self.record_return(location, value);
            }
            Continuation::Throws => {}
            Continuation::SubroutineReturn(addresses, frame) => {
                for address in addresses {
                    self.control_flow_edges
                        .insert((location, address, SubroutineReturn));
                    affected.push((address, frame.same_frame()));
                }
            }
        }
        for value in execution.thrown {
            self.route_thrown(location, fact, value, &mut affected);
        }
        if let Some(liveness) = &self.liveness {
            for (pc, frame) in &mut affected {
                frame.clear_dead_locals(liveness, *pc);
            }
        }
        Ok(affected)
    }

    fn merge_facts(
        &mut self,
        _location: &ProgramCounter,
        current_fact: &Frame,
        incoming_fact: Frame,
    ) -> Result<Update<Frame>, InterpretationError> {
        current_fact
            .merge(&incoming_fact, &mut self.domain)
            .map_err(Into::into)
    }

    fn is_interrupted(&mut self, transitions: u64) -> bool {
        self.policy.is_interrupted(transitions)
    }
}
