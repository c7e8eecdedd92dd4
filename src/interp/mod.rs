//! Abstract interpretation of method bodies.
//!
//! [`interpret`] drives a method to a fixed point under the value domain
//! in [`domain`], producing an [`AIResult`] with the abstract operand
//! stack and locals at every reachable program counter, the values
//! returned and thrown, and the control flow observed on the way.

pub mod call;
pub mod domain;
mod execution;
pub mod frame;
mod interpreter;
pub mod interrupt;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use crate::analysis::cfg::ControlFlowGraph;
use crate::analysis::fixed_point::Analyzer;
use crate::analysis::liveness::Liveness;
use crate::analysis::simplify::simplify_control_flow;
use crate::analysis::InconsistentCodeShape;
use crate::jvm::code::ProgramCounter;
use crate::jvm::method::Method;
use crate::types::hierarchy::ClassHierarchy;

use self::call::CallDispatcher;
use self::domain::reference::ReferenceValue;
use self::domain::{AbstractValue, Domain, ImpossibleRefinement};
use self::frame::{Entry, ExecutionError, Frame};
use self::interpreter::Interpreter;

/// The options recognized by an interpretation session.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Model the implicit `NullPointerException` of array loads and
    /// stores through arrays of undecided nullness.
    pub throw_null_pointer_exception_on_array_access: bool,
    /// Model the implicit `ArrayIndexOutOfBoundsException` of array
    /// accesses with an unprovable index.
    pub throw_array_index_out_of_bounds_exception: bool,
    /// Model the implicit `ArrayStoreException` of reference array
    /// stores.
    pub throw_array_store_exception: bool,
    /// Model the `ArithmeticException` of divisions whose divisor is not
    /// a known non-zero constant. Division by a known zero always throws,
    /// independent of this option.
    pub throw_arithmetic_exceptions: bool,
    /// Clear provably dead local variables before merging frames.
    pub identify_dead_variables: bool,
    /// The step budget as a multiple of the method's instruction count.
    pub max_evaluation_factor: f64,
    /// The wall clock budget, if any.
    pub max_evaluation_time: Option<Duration>,
    /// Run the control flow simplifier before interpreting.
    pub simplify_control_flow: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            throw_null_pointer_exception_on_array_access: true,
            throw_array_index_out_of_bounds_exception: true,
            throw_array_store_exception: true,
            throw_arithmetic_exceptions: true,
            identify_dead_variables: true,
            max_evaluation_factor: 32.0,
            max_evaluation_time: None,
            simplify_control_flow: true,
        }
    }
}

/// How control was observed to transfer between two program counters.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub enum ControlTransfer {
    /// Straight-line flow or an unconditional jump.
    Unconditional,
    /// One leg of a conditional branch or switch.
    Conditional,
    /// Entry into an exception handler.
    Exception,
    /// A subroutine returning behind its `jsr`.
    SubroutineReturn,
}

/// An error that stops an interpretation session. Budget exhaustion is
/// not an error; it surfaces as [`AIResult::was_aborted`].
#[derive(Debug, thiserror::Error)]
pub enum InterpretationError {
    /// The method is `abstract` or `native`.
    #[error("the method does not have a body")]
    NoMethodBody,
    /// The method contains malformed control flow.
    #[error("the method contains malformed control flow")]
    MalformedControlFlow,
    /// An error that occurs when executing bytecode on an abstract frame.
    #[error("error when executing bytecode on an abstract frame: {0}")]
    Execution(#[from] ExecutionError),
    /// A refinement contradicted what is known about a value.
    #[error(transparent)]
    ImpossibleRefinement(#[from] ImpossibleRefinement),
    /// The shape of the code is broken.
    #[error(transparent)]
    InconsistentCodeShape(#[from] InconsistentCodeShape),
}

/// The result of interpreting one method.
#[derive(Debug)]
pub struct AIResult {
    /// Whether the session ran out of its evaluation budget before
    /// reaching the fixed point. The recorded state is still sound for
    /// everything that was visited.
    pub was_aborted: bool,
    /// The frame observed on entry of every reached program counter.
    pub frames: BTreeMap<ProgramCounter, Frame>,
    /// Per return site, the joined returned value (`None` at `return`).
    pub returned_values: BTreeMap<ProgramCounter, Option<AbstractValue>>,
    /// Per throw site, the exception values that may escape the method.
    pub escaping_exceptions: BTreeMap<ProgramCounter, Vec<ReferenceValue>>,
    /// Every control transfer the session observed.
    pub control_flow_edges: BTreeSet<(ProgramCounter, ProgramCounter, ControlTransfer)>,
    /// The domain, holding the session's values.
    pub domain: Domain,
}

impl AIResult {
    /// The operand stack observed on entry of `pc`.
    #[must_use]
    pub fn operands_at(&self, pc: ProgramCounter) -> Option<&[Entry]> {
        self.frames.get(&pc).map(Frame::operands)
    }

    /// The local variables observed on entry of `pc`.
    #[must_use]
    pub fn locals_at(&self, pc: ProgramCounter) -> Option<&[Entry]> {
        self.frames.get(&pc).map(Frame::locals)
    }

    /// The single joined value of all return sites, if the method can
    /// return a value.
    #[must_use]
    pub fn joined_returned_value(&mut self) -> Option<AbstractValue> {
        let mut accumulated: Option<AbstractValue> = None;
        let values: Vec<AbstractValue> =
            self.returned_values.values().flatten().cloned().collect();
        for value in values {
            accumulated = match accumulated {
                None => Some(value),
                Some(current) => match self.domain.join_values(&current, &value) {
                    Some(update) => Some(update.into_value().unwrap_or(current)),
                    None => Some(current),
                },
            };
        }
        accumulated
    }
}

/// Interprets a method with a fresh domain over the given class
/// hierarchy.
///
/// # Errors
/// See [`InterpretationError`]; running out of the evaluation budget is
/// reported through [`AIResult::was_aborted`] instead.
pub fn interpret(
    method: &Method,
    class_hierarchy: Arc<ClassHierarchy>,
    config: &Configuration,
) -> Result<AIResult, InterpretationError> {
    interpret_with(method, Domain::new(class_hierarchy), config, None)
}

/// Interprets a method with an explicit domain and an optional
/// interprocedural dispatcher.
///
/// # Errors
/// See [`InterpretationError`].
pub fn interpret_with<'i>(
    method: &'i Method,
    domain: Domain,
    config: &'i Configuration,
    dispatcher: Option<&'i mut dyn CallDispatcher>,
) -> Result<AIResult, InterpretationError> {
    let body = method
        .body
        .as_ref()
        .ok_or(InterpretationError::NoMethodBody)?;
    let mut body = body.clone();
    if config.simplify_control_flow {
        simplify_control_flow(&mut body, &format!("{}::{}", method.owner, method.name));
    }
    // Building the graph validates the code shape up front and backs the
    // liveness analysis.
    let cfg = ControlFlowGraph::new(&body, domain.class_hierarchy())?;
    let liveness = config
        .identify_dead_variables
        .then(|| Liveness::new(&body, &cfg));
    let policy = interrupt::policy_for(config, body.instructions.len());
    let mut session = Interpreter {
        method,
        body: &body,
        domain,
        config,
        liveness,
        policy,
        dispatcher,
        returned_values: BTreeMap::new(),
        escaping_exceptions: BTreeMap::new(),
        control_flow_edges: BTreeSet::new(),
    };
    let fixpoint = session.analyze()?;
    Ok(AIResult {
        was_aborted: fixpoint.was_aborted,
        frames: fixpoint.facts,
        returned_values: session.returned_values,
        escaping_exceptions: session.escaping_exceptions,
        control_flow_edges: session.control_flow_edges,
        domain: session.domain,
    })
}

#[cfg(test)]
mod test {
    use super::domain::integer::IntValue;
    use super::domain::reference::{ReferenceValue, TypeBound};
    use super::domain::Origin;
    use super::*;
    use crate::types::field_type::FieldType;
    use crate::jvm::code::{ExceptionTableEntry, Instruction, InstructionList, MethodBody};
    use crate::jvm::method::{MethodAccessFlags, MethodDescriptor};
    use crate::jvm::references::ClassRef;
    use crate::types::hierarchy::TypeDeclaration;
    use crate::types::Answer;
    use std::collections::BTreeMap;
    use std::str::FromStr;

    fn hierarchy() -> Arc<ClassHierarchy> {
        Arc::new(ClassHierarchy::with_java_lang_types([
            TypeDeclaration::interface("java/util/Collection"),
            TypeDeclaration::interface("java/util/List").implements("java/util/Collection"),
        ]))
    }

    fn static_method(
        descriptor: &str,
        max_stack: u16,
        max_locals: u16,
        instructions: Vec<(ProgramCounter, Instruction)>,
        exception_table: Vec<ExceptionTableEntry>,
    ) -> Method {
        Method {
            access_flags: MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
            name: "test".into(),
            descriptor: MethodDescriptor::from_str(descriptor).unwrap(),
            owner: ClassRef::new("com/example/Subject"),
            body: Some(MethodBody {
                max_stack,
                max_locals,
                instructions: InstructionList::from(
                    instructions.into_iter().collect::<BTreeMap<_, _>>(),
                ),
                exception_table,
                ..Default::default()
            }),
        }
    }

    fn reference_in_local(result: &AIResult, pc: u16, index: usize) -> &ReferenceValue {
        match &result.locals_at(pc.into()).expect("the pc must be visited")[index] {
            Entry::Value(AbstractValue::Reference(value)) => value,
            other => panic!("local {index} at #{pc} must be a reference, found {other}"),
        }
    }

    fn int_in_local(result: &AIResult, pc: u16, index: usize) -> IntValue {
        match &result.locals_at(pc.into()).expect("the pc must be visited")[index] {
            Entry::Value(AbstractValue::Int(value)) => *value,
            other => panic!("local {index} at #{pc} must be an int, found {other}"),
        }
    }

    /// `Object m(Object o) { if (o == null) return null; return o; }`
    #[test]
    fn null_check_branches_refine_the_parameter() {
        use Instruction::*;
        let method = static_method(
            "(Ljava/lang/Object;)Ljava/lang/Object;",
            1,
            1,
            vec![
                (0.into(), ALoad0),
                (1.into(), IfNonNull(6.into())),
                (4.into(), AConstNull),
                (5.into(), AReturn),
                (6.into(), ALoad0),
                (7.into(), AReturn),
            ],
            Vec::new(),
        );
        let config = Configuration {
            // Keep the parameter observable on the path that no longer
            // reads it.
            identify_dead_variables: false,
            ..Configuration::default()
        };
        let mut result = interpret(&method, hierarchy(), &config).unwrap();
        assert!(!result.was_aborted);

        // On the fall-through the parameter is null, on the branch it is
        // known non-null.
        let on_null_path = reference_in_local(&result, 4, 0);
        assert_eq!(on_null_path.is_null(), Answer::Yes);
        assert_eq!(on_null_path.single_origin(), Some(Origin::parameter(0)));
        let on_branch = reference_in_local(&result, 6, 0);
        assert_eq!(on_branch.is_null(), Answer::No);

        // Both return sites join back to the undecided parameter shape.
        assert_eq!(result.returned_values.len(), 2);
        let joined = result.joined_returned_value().expect("a value is returned");
        let AbstractValue::Reference(joined) = joined else {
            panic!("an object is returned");
        };
        assert_eq!(joined.is_null(), Answer::Unknown);
        assert_eq!(joined.bound(), TypeBound::Class(ClassRef::object()));
        assert!(!joined.is_precise());
    }

    /// `iconst_5; istore_1; iconst_0; istore_2; loop: iload_2; iload_1;
    /// if_icmpge end; iinc 2 1; goto loop; end: iload_2; ireturn`
    fn counting_loop() -> Method {
        use Instruction::*;
        static_method(
            "()I",
            2,
            3,
            vec![
                (0.into(), IConst5),
                (1.into(), IStore1),
                (2.into(), IConst0),
                (3.into(), IStore2),
                (4.into(), ILoad2),
                (5.into(), ILoad1),
                (6.into(), IfICmpGe(15.into())),
                (9.into(), IInc { index: 2, constant: 1 }),
                (12.into(), Goto(4.into())),
                (15.into(), ILoad2),
                (16.into(), IReturn),
            ],
            Vec::new(),
        )
    }

    #[test]
    fn loop_counter_widens_to_any_int() {
        let config = Configuration {
            // Keep every local observable at the loop exit.
            identify_dead_variables: false,
            ..Configuration::default()
        };
        let result = interpret(&counting_loop(), hierarchy(), &config).unwrap();
        assert!(!result.was_aborted);
        assert_eq!(int_in_local(&result, 15, 2), IntValue::Any);
        assert_eq!(int_in_local(&result, 15, 1), IntValue::Exact(5));
        assert_eq!(
            result.returned_values.get(&16.into()),
            Some(&Some(AbstractValue::Int(IntValue::Any)))
        );
    }

    /// Re-running any instruction against the stored frames must not
    /// widen anything once the session finished without abort.
    #[test]
    fn finished_sessions_are_at_a_fixed_point() {
        let config = Configuration {
            identify_dead_variables: false,
            simplify_control_flow: false,
            ..Configuration::default()
        };
        let method = counting_loop();
        let result = interpret(&method, hierarchy(), &config).unwrap();
        assert!(!result.was_aborted);

        let body = method.body.as_ref().unwrap();
        let mut session = Interpreter {
            method: &method,
            body,
            domain: result.domain.clone(),
            config: &config,
            liveness: None,
            policy: interrupt::policy_for(&config, body.instructions.len()),
            dispatcher: None,
            returned_values: BTreeMap::new(),
            escaping_exceptions: BTreeMap::new(),
            control_flow_edges: BTreeSet::new(),
        };
        use crate::analysis::fixed_point::Analyzer;
        for (pc, frame) in &result.frames {
            let affected = session.analyze_location(pc, frame).unwrap();
            for (successor, incoming) in affected {
                let current = result
                    .frames
                    .get(&successor)
                    .expect("every successor was visited");
                let update = session.merge_facts(&successor, current, incoming).unwrap();
                assert!(!update.is_structural(), "{pc} -> {successor} widened");
            }
        }
    }

    /// A division by a known zero always throws; the handler observes the
    /// exception value, and the return site is never reached.
    #[test]
    fn division_by_zero_reaches_the_handler() {
        use Instruction::*;
        let method = static_method(
            "(I)I",
            2,
            1,
            vec![
                (0.into(), ILoad0),
                (1.into(), IConst0),
                (2.into(), IDiv),
                (3.into(), IReturn),
                (4.into(), Pop),
                (5.into(), IConstM1),
                (6.into(), IReturn),
            ],
            vec![ExceptionTableEntry {
                covered_pc: 0.into()..=3.into(),
                handler_pc: 4.into(),
                catch_type: Some(ClassRef::new("java/lang/ArithmeticException")),
            }],
        );
        let result = interpret(&method, hierarchy(), &Configuration::default()).unwrap();
        assert!(!result.was_aborted);
        assert!(result.frames.get(&ProgramCounter(3)).is_none());
        let handler_stack = result.operands_at(4.into()).unwrap();
        assert_eq!(handler_stack.len(), 1);
        let Entry::Value(AbstractValue::Reference(exception)) = &handler_stack[0] else {
            panic!("the caught exception must sit on the handler's stack");
        };
        assert_eq!(exception.is_null(), Answer::No);
        assert_eq!(
            exception.bound(),
            TypeBound::Class(ClassRef::new("java/lang/ArithmeticException"))
        );
        assert_eq!(
            result.returned_values.keys().copied().collect::<Vec<_>>(),
            vec![ProgramCounter(6)]
        );
        // The exception is provably caught; nothing escapes.
        assert!(result.escaping_exceptions.is_empty());
    }

    /// A step budget of `1.0 * instruction_count` cannot finish a method
    /// whose fixed point needs a second pass over a long loop.
    #[test]
    fn exhausted_budgets_abort_the_session() {
        use Instruction::*;
        let mut instructions = vec![
            (ProgramCounter(0), IConst0),
            (ProgramCounter(1), IStore0),
            (ProgramCounter(2), IInc { index: 0, constant: 1 }),
        ];
        for pc in 5..1997u16 {
            instructions.push((ProgramCounter(pc), Nop));
        }
        instructions.push((ProgramCounter(1997), Goto(2.into())));
        let method = static_method("()V", 1, 1, instructions, Vec::new());
        let config = Configuration {
            max_evaluation_factor: 1.0,
            ..Configuration::default()
        };
        let result = interpret(&method, hierarchy(), &config).unwrap();
        assert!(result.was_aborted);
        // The states recorded up to the abort are still well formed.
        assert!(!result.frames.is_empty());
        assert_eq!(int_in_local(&result, 2, 0).join(IntValue::Any), IntValue::Any);
    }

    /// `aload_0; checkcast List; astore_1; return`: the refinement
    /// replaces every occurrence of the casted value.
    #[test]
    fn checkcast_refines_all_occurrences() {
        use Instruction::*;
        let method = static_method(
            "(Ljava/lang/Object;)V",
            1,
            2,
            vec![
                (0.into(), ALoad0),
                (
                    1.into(),
                    CheckCast(FieldType::Object(ClassRef::new("java/util/List"))),
                ),
                (4.into(), AStore1),
                (5.into(), Instruction::Return),
            ],
            Vec::new(),
        );
        let config = Configuration {
            identify_dead_variables: false,
            ..Configuration::default()
        };
        let result = interpret(&method, hierarchy(), &config).unwrap();
        let slot_zero = reference_in_local(&result, 5, 0);
        let slot_one = reference_in_local(&result, 5, 1);
        assert_eq!(
            slot_zero.bound(),
            TypeBound::Class(ClassRef::new("java/util/List"))
        );
        assert!(!slot_zero.is_precise());
        assert_eq!(slot_zero.is_null(), Answer::Unknown);
        // The stored copy and the register share the refined value.
        assert_eq!(slot_zero, slot_one);
    }

    /// Casting to a final class turns the bound precise, per the
    /// hierarchy's knowledge.
    #[test]
    fn checkcast_to_a_final_class_is_precise() {
        use Instruction::*;
        let method = static_method(
            "(Ljava/lang/Object;)V",
            1,
            2,
            vec![
                (0.into(), ALoad0),
                (
                    1.into(),
                    CheckCast(FieldType::Object(ClassRef::new("java/lang/String"))),
                ),
                (4.into(), AStore1),
                (5.into(), Instruction::Return),
            ],
            Vec::new(),
        );
        let config = Configuration {
            identify_dead_variables: false,
            ..Configuration::default()
        };
        let result = interpret(&method, hierarchy(), &config).unwrap();
        assert!(reference_in_local(&result, 5, 1).is_precise());
    }

    /// The `jsr`/`ret` pair: the subroutine returns to both call sites
    /// with the locals it computed.
    #[test]
    fn subroutines_return_to_every_call_site() {
        use Instruction::*;
        let method = static_method(
            "()V",
            2,
            2,
            vec![
                (0.into(), Jsr(8.into())),
                (3.into(), Jsr(8.into())),
                (6.into(), Instruction::Return),
                (8.into(), AStore0),
                (9.into(), IConst1),
                (10.into(), IStore1),
                (11.into(), Ret(0)),
            ],
            Vec::new(),
        );
        let config = Configuration {
            identify_dead_variables: false,
            ..Configuration::default()
        };
        let result = interpret(&method, hierarchy(), &config).unwrap();
        assert!(!result.was_aborted);
        // Both return addresses are reached with the subroutine's effect.
        assert_eq!(int_in_local(&result, 3, 1), IntValue::Exact(1));
        assert_eq!(int_in_local(&result, 6, 1), IntValue::Exact(1));
        assert!(result
            .control_flow_edges
            .contains(&(11.into(), 3.into(), ControlTransfer::SubroutineReturn)));
        assert!(result
            .control_flow_edges
            .contains(&(11.into(), 6.into(), ControlTransfer::SubroutineReturn)));
    }

    /// An unknown invocation target falls back to a type-level result and
    /// a possibly escaping throwable.
    #[test]
    fn calls_fall_back_to_the_type_level_stub() {
        use crate::jvm::references::MethodRef;
        use Instruction::*;
        let callee = MethodRef {
            owner: ClassRef::new("com/example/Elsewhere"),
            name: "compute".into(),
            descriptor: MethodDescriptor::from_str("(I)Ljava/util/List;").unwrap(),
        };
        let method = static_method(
            "()V",
            1,
            1,
            vec![
                (0.into(), IConst3),
                (1.into(), InvokeStatic(callee)),
                (4.into(), Pop),
                (5.into(), Instruction::Return),
            ],
            Vec::new(),
        );
        let result = interpret(&method, hierarchy(), &Configuration::default()).unwrap();
        let stack = result.operands_at(4.into()).unwrap();
        let Entry::Value(AbstractValue::Reference(value)) = &stack[0] else {
            panic!("the call must leave its result on the stack");
        };
        assert_eq!(value.bound(), TypeBound::Class(ClassRef::new("java/util/List")));
        assert_eq!(value.single_origin(), Some(Origin(1)));
        // The throwable may escape the method.
        assert!(result.escaping_exceptions.contains_key(&ProgramCounter(1)));
    }

    /// Merging `int` and reference states for the same slot poisons the
    /// slot instead of failing, as long as nothing reads it.
    #[test]
    fn diverging_dead_locals_do_not_break_the_merge() {
        use Instruction::*;
        let method = static_method(
            "(I)I",
            2,
            2,
            vec![
                (0.into(), ILoad0),
                (1.into(), IfEq(10.into())),
                (4.into(), IConst1),
                (5.into(), IStore1),
                (6.into(), Goto(13.into())),
                (10.into(), AConstNull),
                (11.into(), AStore1),
                (13.into(), ILoad0),
                (14.into(), IReturn),
            ],
            Vec::new(),
        );
        let result = interpret(&method, hierarchy(), &Configuration::default()).unwrap();
        assert!(!result.was_aborted);
        assert_eq!(
            result.locals_at(13.into()).unwrap()[1],
            Entry::Unusable
        );
        assert_eq!(
            result.returned_values.get(&14.into()),
            Some(&Some(AbstractValue::Int(IntValue::Any)))
        );
    }

    #[test]
    fn methods_without_a_body_are_rejected() {
        let method = Method {
            access_flags: MethodAccessFlags::PUBLIC | MethodAccessFlags::ABSTRACT,
            name: "abstractMethod".into(),
            descriptor: MethodDescriptor::from_str("()V").unwrap(),
            owner: ClassRef::new("com/example/Subject"),
            body: None,
        };
        assert!(matches!(
            interpret(&method, hierarchy(), &Configuration::default()),
            Err(InterpretationError::NoMethodBody)
        ));
    }
}
