//! The transfer function: how a single instruction transforms a frame.
//!
//! Every opcode is handled by the exhaustive match in [`execute`]; adding
//! a variant to [`Instruction`] without handling it here is a compile
//! error.

use std::collections::BTreeSet;

use crate::jvm::code::{ConstantValue, Instruction, MethodBody, ProgramCounter};
use crate::jvm::method::ReturnType;
use crate::jvm::references::{
    ClassRef, MethodRef, ARITHMETIC_EXCEPTION, ARRAY_INDEX_OUT_OF_BOUNDS_EXCEPTION,
    ARRAY_STORE_EXCEPTION, CLASS_CAST_EXCEPTION, JAVA_LANG_THROWABLE,
    NEGATIVE_ARRAY_SIZE_EXCEPTION, NULL_POINTER_EXCEPTION,
};
use crate::types::field_type::FieldType;
use crate::types::Answer;

use super::call::CallDispatcher;
use super::domain::integer::{DivisionOutcome, IntValue, LongValue};
use super::domain::reference::{ReferenceValue, TypeBound};
use super::domain::{AbstractValue, Domain};
use super::frame::{ExecutionError, Frame};
use super::{Configuration, InterpretationError};

/// Where control continues after an instruction completes normally.
#[derive(Debug)]
pub(crate) enum Continuation {
    /// The next instruction in the list.
    FallThrough(Frame),
    /// A conditional branch; an absent side is infeasible.
    Branch {
        taken: Option<Frame>,
        not_taken: Option<Frame>,
    },
    /// An unconditional transfer to `target`.
    Jump {
        target: ProgramCounter,
        frame: Frame,
    },
    /// All successors of a switch whose selector stays abstract.
    Switch(Frame),
    /// The method returns normally with the given value.
    Return(Option<AbstractValue>),
    /// No normal successor: the instruction always throws.
    Throws,
    /// A `ret` transfers control to the recorded return addresses.
    SubroutineReturn(BTreeSet<ProgramCounter>, Frame),
}

/// The effect of one instruction: the continuation of the normal path and
/// the exception values raised at this point.
#[derive(Debug)]
pub(crate) struct Execution {
    pub continuation: Continuation,
    pub thrown: Vec<ReferenceValue>,
}

impl Execution {
    fn falls_through(frame: Frame) -> Self {
        Self {
            continuation: Continuation::FallThrough(frame),
            thrown: Vec::new(),
        }
    }

    fn with_thrown(mut self, thrown: Vec<ReferenceValue>) -> Self {
        self.thrown = thrown;
        self
    }
}

/// Executes one instruction against the incoming frame.
pub(crate) fn execute(
    instruction: &Instruction,
    pc: ProgramCounter,
    body: &MethodBody,
    fact: &Frame,
    domain: &mut Domain,
    config: &Configuration,
    dispatcher: Option<&mut dyn CallDispatcher>,
) -> Result<Execution, InterpretationError> {
    use Instruction::*;
    let mut frame = fact.same_frame();
    let execution = match instruction {
        Nop => Execution::falls_through(frame),

        // Constants.
        AConstNull => {
            let value = domain.null_value(pc);
            frame.push_value(AbstractValue::Reference(value))?;
            Execution::falls_through(frame)
        }
        IConstM1 => push_int(frame, -1)?,
        IConst0 => push_int(frame, 0)?,
        IConst1 => push_int(frame, 1)?,
        IConst2 => push_int(frame, 2)?,
        IConst3 => push_int(frame, 3)?,
        IConst4 => push_int(frame, 4)?,
        IConst5 => push_int(frame, 5)?,
        BiPush(value) => push_int(frame, i32::from(*value))?,
        SiPush(value) => push_int(frame, i32::from(*value))?,
        LConst0 => push_long(frame, 0)?,
        LConst1 => push_long(frame, 1)?,
        FConst0 | FConst1 | FConst2 => {
            frame.push_value(AbstractValue::Float)?;
            Execution::falls_through(frame)
        }
        DConst0 | DConst1 => {
            frame.push_value(AbstractValue::Double)?;
            Execution::falls_through(frame)
        }
        Ldc(constant) | LdcW(constant) | Ldc2W(constant) => {
            let value = load_constant(constant, pc, domain);
            frame.push_value(value)?;
            Execution::falls_through(frame)
        }

        // Local variable loads.
        ILoad(i) => load(frame, *i, Sort::Int)?,
        ILoad0 => load(frame, 0, Sort::Int)?,
        ILoad1 => load(frame, 1, Sort::Int)?,
        ILoad2 => load(frame, 2, Sort::Int)?,
        ILoad3 => load(frame, 3, Sort::Int)?,
        LLoad(i) => load(frame, *i, Sort::Long)?,
        LLoad0 => load(frame, 0, Sort::Long)?,
        LLoad1 => load(frame, 1, Sort::Long)?,
        LLoad2 => load(frame, 2, Sort::Long)?,
        LLoad3 => load(frame, 3, Sort::Long)?,
        FLoad(i) => load(frame, *i, Sort::Float)?,
        FLoad0 => load(frame, 0, Sort::Float)?,
        FLoad1 => load(frame, 1, Sort::Float)?,
        FLoad2 => load(frame, 2, Sort::Float)?,
        FLoad3 => load(frame, 3, Sort::Float)?,
        DLoad(i) => load(frame, *i, Sort::Double)?,
        DLoad0 => load(frame, 0, Sort::Double)?,
        DLoad1 => load(frame, 1, Sort::Double)?,
        DLoad2 => load(frame, 2, Sort::Double)?,
        DLoad3 => load(frame, 3, Sort::Double)?,
        ALoad(i) => load(frame, *i, Sort::Reference)?,
        ALoad0 => load(frame, 0, Sort::Reference)?,
        ALoad1 => load(frame, 1, Sort::Reference)?,
        ALoad2 => load(frame, 2, Sort::Reference)?,
        ALoad3 => load(frame, 3, Sort::Reference)?,

        // Local variable stores.
        IStore(i) => store(frame, *i, Sort::Int)?,
        IStore0 => store(frame, 0, Sort::Int)?,
        IStore1 => store(frame, 1, Sort::Int)?,
        IStore2 => store(frame, 2, Sort::Int)?,
        IStore3 => store(frame, 3, Sort::Int)?,
        LStore(i) => store(frame, *i, Sort::Long)?,
        LStore0 => store(frame, 0, Sort::Long)?,
        LStore1 => store(frame, 1, Sort::Long)?,
        LStore2 => store(frame, 2, Sort::Long)?,
        LStore3 => store(frame, 3, Sort::Long)?,
        FStore(i) => store(frame, *i, Sort::Float)?,
        FStore0 => store(frame, 0, Sort::Float)?,
        FStore1 => store(frame, 1, Sort::Float)?,
        FStore2 => store(frame, 2, Sort::Float)?,
        FStore3 => store(frame, 3, Sort::Float)?,
        DStore(i) => store(frame, *i, Sort::Double)?,
        DStore0 => store(frame, 0, Sort::Double)?,
        DStore1 => store(frame, 1, Sort::Double)?,
        DStore2 => store(frame, 2, Sort::Double)?,
        DStore3 => store(frame, 3, Sort::Double)?,
        AStore(i) => store_reference_or_address(frame, *i)?,
        AStore0 => store_reference_or_address(frame, 0)?,
        AStore1 => store_reference_or_address(frame, 1)?,
        AStore2 => store_reference_or_address(frame, 2)?,
        AStore3 => store_reference_or_address(frame, 3)?,

        // Array loads.
        IALoad | BALoad | CALoad | SALoad => {
            array_load(frame, pc, domain, config, Sort::Int)?
        }
        LALoad => array_load(frame, pc, domain, config, Sort::Long)?,
        FALoad => array_load(frame, pc, domain, config, Sort::Float)?,
        DALoad => array_load(frame, pc, domain, config, Sort::Double)?,
        AALoad => array_load(frame, pc, domain, config, Sort::Reference)?,

        // Array stores.
        IAStore | BAStore | CAStore | SAStore => {
            frame.pop_int()?;
            array_store(frame, pc, domain, config)?
        }
        LAStore => {
            frame.pop_long()?;
            array_store(frame, pc, domain, config)?
        }
        FAStore => {
            frame.pop_float()?;
            array_store(frame, pc, domain, config)?
        }
        DAStore => {
            frame.pop_double()?;
            array_store(frame, pc, domain, config)?
        }
        AAStore => {
            let stored = frame.pop_reference()?;
            let mut execution = array_store(frame, pc, domain, config)?;
            if config.throw_array_store_exception
                && !matches!(execution.continuation, Continuation::Throws)
                && !stored.is_null().is_yes()
            {
                execution
                    .thrown
                    .push(domain.vm_thrown_exception(pc, ARRAY_STORE_EXCEPTION));
            }
            execution
        }

        // Stack management.
        Pop => {
            frame.pop_slots(1)?;
            Execution::falls_through(frame)
        }
        Pop2 => {
            frame.pop_slots(2)?;
            Execution::falls_through(frame)
        }
        Dup => dup(frame, 1, 0)?,
        DupX1 => dup(frame, 1, 1)?,
        DupX2 => dup(frame, 1, 2)?,
        Dup2 => dup(frame, 2, 0)?,
        Dup2X1 => dup(frame, 2, 1)?,
        Dup2X2 => dup(frame, 2, 2)?,
        Swap => {
            frame.swap_top()?;
            Execution::falls_through(frame)
        }

        // Integer arithmetic.
        IAdd => int_binop(frame, IntValue::add)?,
        ISub => int_binop(frame, IntValue::sub)?,
        IMul => int_binop(frame, IntValue::mul)?,
        IAnd => int_binop(frame, IntValue::and)?,
        IOr => int_binop(frame, IntValue::or)?,
        IXor => int_binop(frame, IntValue::xor)?,
        IShl => int_binop(frame, IntValue::shl)?,
        IShr => int_binop(frame, IntValue::shr)?,
        IUShr => int_binop(frame, IntValue::ushr)?,
        INeg => {
            let value = frame.pop_int()?;
            frame.push_value(AbstractValue::Int(value.neg()))?;
            Execution::falls_through(frame)
        }
        IDiv => int_division(frame, pc, domain, config, IntValue::div)?,
        IRem => int_division(frame, pc, domain, config, IntValue::rem)?,
        IInc { index, constant } => {
            let value = match frame.load_local(*index)? {
                AbstractValue::Int(value) => value,
                found => {
                    return Err(ExecutionError::UnexpectedOperand {
                        expected: "an int",
                        found: format!("{found}"),
                    }
                    .into())
                }
            };
            frame.store_local(*index, AbstractValue::Int(value.inc(*constant)))?;
            Execution::falls_through(frame)
        }

        // Long arithmetic.
        LAdd => long_binop(frame, LongValue::add)?,
        LSub => long_binop(frame, LongValue::sub)?,
        LMul => long_binop(frame, LongValue::mul)?,
        LAnd => long_binop(frame, LongValue::and)?,
        LOr => long_binop(frame, LongValue::or)?,
        LXor => long_binop(frame, LongValue::xor)?,
        LShl => long_shift(frame, LongValue::shl)?,
        LShr => long_shift(frame, LongValue::shr)?,
        LUShr => long_shift(frame, LongValue::ushr)?,
        LNeg => {
            let value = frame.pop_long()?;
            frame.push_value(AbstractValue::Long(value.neg()))?;
            Execution::falls_through(frame)
        }
        LDiv => long_division(frame, pc, domain, config, LongValue::div)?,
        LRem => long_division(frame, pc, domain, config, LongValue::rem)?,

        // Float and double arithmetic stays at the type level.
        FAdd | FSub | FMul | FDiv | FRem => {
            frame.pop_float()?;
            frame.pop_float()?;
            frame.push_value(AbstractValue::Float)?;
            Execution::falls_through(frame)
        }
        FNeg => {
            frame.pop_float()?;
            frame.push_value(AbstractValue::Float)?;
            Execution::falls_through(frame)
        }
        DAdd | DSub | DMul | DDiv | DRem => {
            frame.pop_double()?;
            frame.pop_double()?;
            frame.push_value(AbstractValue::Double)?;
            Execution::falls_through(frame)
        }
        DNeg => {
            frame.pop_double()?;
            frame.push_value(AbstractValue::Double)?;
            Execution::falls_through(frame)
        }

        // Conversions.
        I2L => {
            let value = frame.pop_int()?;
            frame.push_value(AbstractValue::Long(value.to_long()))?;
            Execution::falls_through(frame)
        }
        I2B => int_conversion(frame, IntValue::to_byte)?,
        I2C => int_conversion(frame, IntValue::to_char)?,
        I2S => int_conversion(frame, IntValue::to_short)?,
        I2F => {
            frame.pop_int()?;
            frame.push_value(AbstractValue::Float)?;
            Execution::falls_through(frame)
        }
        I2D => {
            frame.pop_int()?;
            frame.push_value(AbstractValue::Double)?;
            Execution::falls_through(frame)
        }
        L2I => {
            let value = frame.pop_long()?;
            frame.push_value(AbstractValue::Int(value.to_int()))?;
            Execution::falls_through(frame)
        }
        L2F => {
            frame.pop_long()?;
            frame.push_value(AbstractValue::Float)?;
            Execution::falls_through(frame)
        }
        L2D => {
            frame.pop_long()?;
            frame.push_value(AbstractValue::Double)?;
            Execution::falls_through(frame)
        }
        F2I => {
            frame.pop_float()?;
            frame.push_value(AbstractValue::Int(IntValue::Any))?;
            Execution::falls_through(frame)
        }
        F2L => {
            frame.pop_float()?;
            frame.push_value(AbstractValue::Long(LongValue::Any))?;
            Execution::falls_through(frame)
        }
        F2D => {
            frame.pop_float()?;
            frame.push_value(AbstractValue::Double)?;
            Execution::falls_through(frame)
        }
        D2I => {
            frame.pop_double()?;
            frame.push_value(AbstractValue::Int(IntValue::Any))?;
            Execution::falls_through(frame)
        }
        D2L => {
            frame.pop_double()?;
            frame.push_value(AbstractValue::Long(LongValue::Any))?;
            Execution::falls_through(frame)
        }
        D2F => {
            frame.pop_double()?;
            frame.push_value(AbstractValue::Float)?;
            Execution::falls_through(frame)
        }

        // Comparisons.
        LCmp => {
            let b = frame.pop_long()?;
            let a = frame.pop_long()?;
            frame.push_value(AbstractValue::Int(a.cmp_value(b)))?;
            Execution::falls_through(frame)
        }
        FCmpL | FCmpG => {
            frame.pop_float()?;
            frame.pop_float()?;
            frame.push_value(AbstractValue::Int(IntValue::Any))?;
            Execution::falls_through(frame)
        }
        DCmpL | DCmpG => {
            frame.pop_double()?;
            frame.pop_double()?;
            frame.push_value(AbstractValue::Int(IntValue::Any))?;
            Execution::falls_through(frame)
        }

        // Branches on a single int.
        IfEq(_) => int_zero_branch(frame, |v| v.is_equal_to(IntValue::Exact(0)))?,
        IfNe(_) => int_zero_branch(frame, |v| !v.is_equal_to(IntValue::Exact(0)))?,
        IfLt(_) => int_zero_branch(frame, |v| v.is_less_than(IntValue::Exact(0)))?,
        IfGe(_) => int_zero_branch(frame, |v| !v.is_less_than(IntValue::Exact(0)))?,
        IfGt(_) => int_zero_branch(frame, |v| IntValue::Exact(0).is_less_than(v))?,
        IfLe(_) => int_zero_branch(frame, |v| v.is_less_or_equal(IntValue::Exact(0)))?,

        // Branches on two ints.
        IfICmpEq(_) => int_compare_branch(frame, |a, b| a.is_equal_to(b))?,
        IfICmpNe(_) => int_compare_branch(frame, |a, b| !a.is_equal_to(b))?,
        IfICmpLt(_) => int_compare_branch(frame, |a, b| a.is_less_than(b))?,
        IfICmpGe(_) => int_compare_branch(frame, |a, b| !a.is_less_than(b))?,
        IfICmpGt(_) => int_compare_branch(frame, |a, b| b.is_less_than(a))?,
        IfICmpLe(_) => int_compare_branch(frame, |a, b| a.is_less_or_equal(b))?,

        // Branches on references.
        IfNull(_) => null_branch(frame, domain, true)?,
        IfNonNull(_) => null_branch(frame, domain, false)?,
        IfACmpEq(_) => reference_compare_branch(frame, domain, true)?,
        IfACmpNe(_) => reference_compare_branch(frame, domain, false)?,

        // Unconditional transfers.
        Goto(target) | GotoW(target) => Execution {
            continuation: Continuation::Jump {
                target: *target,
                frame,
            },
            thrown: Vec::new(),
        },
        Jsr(target) | JsrW(target) => {
            let return_pc = body
                .instructions
                .next_pc_of(&pc)
                .ok_or(InterpretationError::MalformedControlFlow)?;
            frame.push_value(AbstractValue::ReturnAddress(BTreeSet::from([return_pc])))?;
            frame.possible_ret_addresses.insert(return_pc);
            Execution {
                continuation: Continuation::Jump {
                    target: *target,
                    frame,
                },
                thrown: Vec::new(),
            }
        }
        Ret(index) => {
            let recorded = match frame.load_local(*index)? {
                AbstractValue::ReturnAddress(addresses) => addresses,
                found => {
                    return Err(ExecutionError::UnexpectedOperand {
                        expected: "a return address",
                        found: format!("{found}"),
                    }
                    .into())
                }
            };
            let mut addresses = std::mem::take(&mut frame.possible_ret_addresses);
            addresses.extend(recorded);
            Execution {
                continuation: Continuation::SubroutineReturn(addresses, frame),
                thrown: Vec::new(),
            }
        }
        TableSwitch {
            low,
            high,
            default,
            jump_targets,
        } => {
            let selector = frame.pop_int()?;
            match selector {
                IntValue::Exact(v) if v >= *low && v <= *high => {
                    let target = jump_targets
                        .get((v - low) as usize)
                        .copied()
                        .unwrap_or(*default);
                    Execution {
                        continuation: Continuation::Jump { target, frame },
                        thrown: Vec::new(),
                    }
                }
                IntValue::Exact(_) => Execution {
                    continuation: Continuation::Jump {
                        target: *default,
                        frame,
                    },
                    thrown: Vec::new(),
                },
                IntValue::Any => Execution {
                    continuation: Continuation::Switch(frame),
                    thrown: Vec::new(),
                },
            }
        }
        LookupSwitch {
            default,
            match_targets,
        } => {
            let selector = frame.pop_int()?;
            match selector {
                IntValue::Exact(v) => {
                    let target = match_targets.get(&v).copied().unwrap_or(*default);
                    Execution {
                        continuation: Continuation::Jump { target, frame },
                        thrown: Vec::new(),
                    }
                }
                IntValue::Any => Execution {
                    continuation: Continuation::Switch(frame),
                    thrown: Vec::new(),
                },
            }
        }

        // Returns.
        IReturn => {
            let value = frame.pop_int()?;
            Execution {
                continuation: Continuation::Return(Some(AbstractValue::Int(value))),
                thrown: Vec::new(),
            }
        }
        LReturn => {
            let value = frame.pop_long()?;
            Execution {
                continuation: Continuation::Return(Some(AbstractValue::Long(value))),
                thrown: Vec::new(),
            }
        }
        FReturn => {
            frame.pop_float()?;
            Execution {
                continuation: Continuation::Return(Some(AbstractValue::Float)),
                thrown: Vec::new(),
            }
        }
        DReturn => {
            frame.pop_double()?;
            Execution {
                continuation: Continuation::Return(Some(AbstractValue::Double)),
                thrown: Vec::new(),
            }
        }
        AReturn => {
            let value = frame.pop_reference()?;
            let summarized = domain.summarize(pc, &value);
            Execution {
                continuation: Continuation::Return(Some(AbstractValue::Reference(summarized))),
                thrown: Vec::new(),
            }
        }
        Return => Execution {
            continuation: Continuation::Return(None),
            thrown: Vec::new(),
        },

        // Field access.
        GetStatic(field) => {
            let value = domain.value_of_type(pc, &field.field_type);
            frame.push_value(value)?;
            Execution::falls_through(frame)
        }
        PutStatic(_) => {
            frame.pop_value()?;
            Execution::falls_through(frame)
        }
        GetField(field) => {
            let receiver = frame.pop_reference()?;
            match definite_null_guard(&mut frame, &receiver, pc, domain)? {
                ReceiverCheck::Throws(thrown) => Execution {
                    continuation: Continuation::Throws,
                    thrown,
                },
                ReceiverCheck::Proceeds(_) => {
                    let value = domain.value_of_type(pc, &field.field_type);
                    frame.push_value(value)?;
                    Execution::falls_through(frame)
                }
            }
        }
        PutField(_) => {
            frame.pop_value()?;
            let receiver = frame.pop_reference()?;
            match definite_null_guard(&mut frame, &receiver, pc, domain)? {
                ReceiverCheck::Throws(thrown) => Execution {
                    continuation: Continuation::Throws,
                    thrown,
                },
                ReceiverCheck::Proceeds(_) => Execution::falls_through(frame),
            }
        }

        // Method invocation.
        InvokeVirtual(method) | InvokeSpecial(method) | InvokeInterface(method, _) => {
            invoke(frame, pc, method, true, domain, dispatcher)?
        }
        InvokeStatic(method) => invoke(frame, pc, method, false, domain, dispatcher)?,
        InvokeDynamic { descriptor, .. } => {
            for parameter in descriptor.parameters_types.iter().rev() {
                pop_of_type(&mut frame, parameter)?;
            }
            if let ReturnType::Some(t) = &descriptor.return_type {
                let value = domain.value_of_type(pc, t);
                frame.push_value(value)?;
            }
            let thrown = vec![domain.object_value(
                pc,
                Answer::No,
                false,
                ClassRef::new(JAVA_LANG_THROWABLE),
            )];
            Execution::falls_through(frame).with_thrown(thrown)
        }

        // Object management.
        New(class) => {
            let value = domain.new_object(pc, class.clone());
            frame.push_value(AbstractValue::Reference(value))?;
            Execution::falls_through(frame)
        }
        NewArray(primitive) => {
            let component = FieldType::Base(*primitive);
            new_array(frame, pc, domain, component.make_array_type(), 1)?
        }
        ANewArray(component) => {
            let array_type = component.make_array_type();
            new_array(frame, pc, domain, array_type, 1)?
        }
        MultiANewArray(array_type, dims) => {
            new_array(frame, pc, domain, array_type.clone(), usize::from(*dims))?
        }
        ArrayLength => {
            let array = frame.pop_reference()?;
            match definite_null_guard(&mut frame, &array, pc, domain)? {
                ReceiverCheck::Throws(thrown) => Execution {
                    continuation: Continuation::Throws,
                    thrown,
                },
                ReceiverCheck::Proceeds(_) => {
                    frame.push_value(AbstractValue::Int(IntValue::Any))?;
                    Execution::falls_through(frame)
                }
            }
        }
        AThrow => {
            let value = frame.pop_reference()?;
            let mut thrown = Vec::new();
            if !value.is_null().is_no() {
                thrown.push(domain.vm_thrown_exception(pc, NULL_POINTER_EXCEPTION));
            }
            if !value.is_null().is_yes() {
                let non_null = if value.is_null().is_unknown() {
                    value
                        .refine_is_null(Answer::No)
                        .map_err(InterpretationError::ImpossibleRefinement)?
                } else {
                    value
                };
                thrown.push(non_null);
            }
            Execution {
                continuation: Continuation::Throws,
                thrown,
            }
        }
        CheckCast(target) => check_cast(frame, pc, target, domain)?,
        InstanceOf(target) => {
            let value = frame.pop_reference()?;
            let result = if value.is_null().is_yes() {
                IntValue::Exact(0)
            } else {
                match value.is_value_subtype_of(target, domain.class_hierarchy()) {
                    Answer::Yes if value.is_null().is_no() => IntValue::Exact(1),
                    Answer::No => IntValue::Exact(0),
                    _ => IntValue::Any,
                }
            };
            frame.push_value(AbstractValue::Int(result))?;
            Execution::falls_through(frame)
        }
        MonitorEnter | MonitorExit => {
            let receiver = frame.pop_reference()?;
            match definite_null_guard(&mut frame, &receiver, pc, domain)? {
                ReceiverCheck::Throws(thrown) => Execution {
                    continuation: Continuation::Throws,
                    thrown,
                },
                ReceiverCheck::Proceeds(_) => Execution::falls_through(frame),
            }
        }
    };
    Ok(execution)
}

#[derive(Clone, Copy)]
enum Sort {
    Int,
    Long,
    Float,
    Double,
    Reference,
}

fn push_int(mut frame: Frame, value: i32) -> Result<Execution, InterpretationError> {
    frame.push_value(AbstractValue::Int(IntValue::Exact(value)))?;
    Ok(Execution::falls_through(frame))
}

fn push_long(mut frame: Frame, value: i64) -> Result<Execution, InterpretationError> {
    frame.push_value(AbstractValue::Long(LongValue::Exact(value)))?;
    Ok(Execution::falls_through(frame))
}

fn load_constant(constant: &ConstantValue, pc: ProgramCounter, domain: &mut Domain) -> AbstractValue {
    match constant {
        ConstantValue::Integer(v) => AbstractValue::Int(IntValue::Exact(*v)),
        ConstantValue::Long(v) => AbstractValue::Long(LongValue::Exact(*v)),
        ConstantValue::Float(_) => AbstractValue::Float,
        ConstantValue::Double(_) => AbstractValue::Double,
        ConstantValue::String(_) => AbstractValue::Reference(domain.string_value(pc)),
        ConstantValue::Class(_) => AbstractValue::Reference(domain.class_value(pc)),
        ConstantValue::MethodType(_) => AbstractValue::Reference(domain.non_null_object_value(
            pc,
            ClassRef::new("java/lang/invoke/MethodType"),
        )),
        ConstantValue::MethodHandle(_) => AbstractValue::Reference(domain.non_null_object_value(
            pc,
            ClassRef::new("java/lang/invoke/MethodHandle"),
        )),
        ConstantValue::Dynamic(_) => {
            AbstractValue::Reference(domain.initialized_object_value(pc, ClassRef::object()))
        }
    }
}

fn load(mut frame: Frame, index: u16, sort: Sort) -> Result<Execution, InterpretationError> {
    let value = frame.load_local(index)?;
    let matches = matches!(
        (&value, sort),
        (AbstractValue::Int(_), Sort::Int)
            | (AbstractValue::Long(_), Sort::Long)
            | (AbstractValue::Float, Sort::Float)
            | (AbstractValue::Double, Sort::Double)
            | (AbstractValue::Reference(_) | AbstractValue::ReturnAddress(_), Sort::Reference)
    );
    if !matches {
        return Err(ExecutionError::UnexpectedOperand {
            expected: "a local of the instruction's sort",
            found: format!("{value}"),
        }
        .into());
    }
    frame.push_value(value)?;
    Ok(Execution::falls_through(frame))
}

fn store(mut frame: Frame, index: u16, sort: Sort) -> Result<Execution, InterpretationError> {
    let value = match sort {
        Sort::Int => AbstractValue::Int(frame.pop_int()?),
        Sort::Long => AbstractValue::Long(frame.pop_long()?),
        Sort::Float => {
            frame.pop_float()?;
            AbstractValue::Float
        }
        Sort::Double => {
            frame.pop_double()?;
            AbstractValue::Double
        }
        Sort::Reference => AbstractValue::Reference(frame.pop_reference()?),
    };
    frame.store_local(index, value)?;
    Ok(Execution::falls_through(frame))
}

/// `astore` also accepts the return address pushed by `jsr`.
fn store_reference_or_address(
    mut frame: Frame,
    index: u16,
) -> Result<Execution, InterpretationError> {
    let value = frame.pop_value()?;
    match value {
        AbstractValue::Reference(_) | AbstractValue::ReturnAddress(_) => {
            frame.store_local(index, value)?;
            Ok(Execution::falls_through(frame))
        }
        found => Err(ExecutionError::UnexpectedOperand {
            expected: "a reference or a return address",
            found: format!("{found}"),
        }
        .into()),
    }
}

fn dup(mut frame: Frame, count: usize, depth: usize) -> Result<Execution, InterpretationError> {
    frame.duplicate_slots(count, depth)?;
    Ok(Execution::falls_through(frame))
}

fn int_binop(
    mut frame: Frame,
    op: impl FnOnce(IntValue, IntValue) -> IntValue,
) -> Result<Execution, InterpretationError> {
    let b = frame.pop_int()?;
    let a = frame.pop_int()?;
    frame.push_value(AbstractValue::Int(op(a, b)))?;
    Ok(Execution::falls_through(frame))
}

fn int_conversion(
    mut frame: Frame,
    op: impl FnOnce(IntValue) -> IntValue,
) -> Result<Execution, InterpretationError> {
    let value = frame.pop_int()?;
    frame.push_value(AbstractValue::Int(op(value)))?;
    Ok(Execution::falls_through(frame))
}

fn long_binop(
    mut frame: Frame,
    op: impl FnOnce(LongValue, LongValue) -> LongValue,
) -> Result<Execution, InterpretationError> {
    let b = frame.pop_long()?;
    let a = frame.pop_long()?;
    frame.push_value(AbstractValue::Long(op(a, b)))?;
    Ok(Execution::falls_through(frame))
}

fn long_shift(
    mut frame: Frame,
    op: impl FnOnce(LongValue, IntValue) -> LongValue,
) -> Result<Execution, InterpretationError> {
    let shift = frame.pop_int()?;
    let value = frame.pop_long()?;
    frame.push_value(AbstractValue::Long(op(value, shift)))?;
    Ok(Execution::falls_through(frame))
}

fn int_division(
    mut frame: Frame,
    pc: ProgramCounter,
    domain: &mut Domain,
    config: &Configuration,
    op: impl FnOnce(IntValue, IntValue) -> DivisionOutcome<IntValue>,
) -> Result<Execution, InterpretationError> {
    let divisor = frame.pop_int()?;
    let dividend = frame.pop_int()?;
    division(frame, pc, domain, config, op(dividend, divisor), AbstractValue::Int)
}

fn long_division(
    mut frame: Frame,
    pc: ProgramCounter,
    domain: &mut Domain,
    config: &Configuration,
    op: impl FnOnce(LongValue, LongValue) -> DivisionOutcome<LongValue>,
) -> Result<Execution, InterpretationError> {
    let divisor = frame.pop_long()?;
    let dividend = frame.pop_long()?;
    division(frame, pc, domain, config, op(dividend, divisor), AbstractValue::Long)
}

fn division<V>(
    mut frame: Frame,
    pc: ProgramCounter,
    domain: &mut Domain,
    config: &Configuration,
    outcome: DivisionOutcome<V>,
    wrap: impl FnOnce(V) -> AbstractValue,
) -> Result<Execution, InterpretationError> {
    match outcome {
        // Division by a known zero throws no matter how exceptions are
        // configured.
        DivisionOutcome::DivisionByZero => Ok(Execution {
            continuation: Continuation::Throws,
            thrown: vec![domain.vm_thrown_exception(pc, ARITHMETIC_EXCEPTION)],
        }),
        DivisionOutcome::Value(value) => {
            frame.push_value(wrap(value))?;
            Ok(Execution::falls_through(frame))
        }
        DivisionOutcome::MaybeDivisionByZero(value) => {
            frame.push_value(wrap(value))?;
            let thrown = if config.throw_arithmetic_exceptions {
                vec![domain.vm_thrown_exception(pc, ARITHMETIC_EXCEPTION)]
            } else {
                Vec::new()
            };
            Ok(Execution::falls_through(frame).with_thrown(thrown))
        }
    }
}

/// How an access through a possibly-`null` receiver continues.
enum ReceiverCheck {
    /// The receiver is definitely `null`: the access always throws.
    Throws(Vec<ReferenceValue>),
    /// The access proceeds with a receiver known to be non-`null`.
    Proceeds(ReferenceValue),
}

/// Guards an access through a receiver that must not be `null`. A
/// definitely-`null` receiver turns the access into a throw; otherwise
/// the receiver is refined to non-`null` on the normal path, throughout
/// the frame.
fn definite_null_guard(
    frame: &mut Frame,
    receiver: &ReferenceValue,
    pc: ProgramCounter,
    domain: &mut Domain,
) -> Result<ReceiverCheck, InterpretationError> {
    match receiver.is_null() {
        Answer::Yes => Ok(ReceiverCheck::Throws(vec![
            domain.vm_thrown_exception(pc, NULL_POINTER_EXCEPTION)
        ])),
        Answer::Unknown => {
            let refined = frame
                .refine_is_null(receiver, Answer::No, domain)
                .map_err(InterpretationError::ImpossibleRefinement)?;
            Ok(ReceiverCheck::Proceeds(refined))
        }
        Answer::No => Ok(ReceiverCheck::Proceeds(receiver.clone())),
    }
}

fn array_load(
    mut frame: Frame,
    pc: ProgramCounter,
    domain: &mut Domain,
    config: &Configuration,
    element: Sort,
) -> Result<Execution, InterpretationError> {
    let index = frame.pop_int()?;
    let array = frame.pop_reference()?;
    let mut thrown = Vec::new();
    match array.is_null() {
        Answer::Yes => {
            return Ok(Execution {
                continuation: Continuation::Throws,
                thrown: vec![domain.vm_thrown_exception(pc, NULL_POINTER_EXCEPTION)],
            })
        }
        Answer::Unknown => {
            if config.throw_null_pointer_exception_on_array_access {
                thrown.push(domain.vm_thrown_exception(pc, NULL_POINTER_EXCEPTION));
            }
            frame
                .refine_is_null(&array, Answer::No, domain)
                .map_err(InterpretationError::ImpossibleRefinement)?;
        }
        Answer::No => {}
    }
    if let IntValue::Exact(v) = index {
        if v < 0 {
            return Ok(Execution {
                continuation: Continuation::Throws,
                thrown: vec![
                    domain.vm_thrown_exception(pc, ARRAY_INDEX_OUT_OF_BOUNDS_EXCEPTION),
                ],
            });
        }
    }
    if config.throw_array_index_out_of_bounds_exception {
        thrown.push(domain.vm_thrown_exception(pc, ARRAY_INDEX_OUT_OF_BOUNDS_EXCEPTION));
    }
    let value = match element {
        Sort::Int => AbstractValue::Int(IntValue::Any),
        Sort::Long => AbstractValue::Long(LongValue::Any),
        Sort::Float => AbstractValue::Float,
        Sort::Double => AbstractValue::Double,
        Sort::Reference => match array.bound() {
            TypeBound::Array(FieldType::Array(component)) if component.is_reference() => {
                domain.value_of_type(pc, &component)
            }
            _ => AbstractValue::Reference(
                domain.initialized_object_value(pc, ClassRef::object()),
            ),
        },
    };
    frame.push_value(value)?;
    Ok(Execution::falls_through(frame).with_thrown(thrown))
}

/// The stored value has already been popped; this handles the index, the
/// array reference, and the implicit exceptions shared by every `*astore`.
fn array_store(
    mut frame: Frame,
    pc: ProgramCounter,
    domain: &mut Domain,
    config: &Configuration,
) -> Result<Execution, InterpretationError> {
    let index = frame.pop_int()?;
    let array = frame.pop_reference()?;
    let mut thrown = Vec::new();
    match array.is_null() {
        Answer::Yes => {
            return Ok(Execution {
                continuation: Continuation::Throws,
                thrown: vec![domain.vm_thrown_exception(pc, NULL_POINTER_EXCEPTION)],
            })
        }
        Answer::Unknown => {
            if config.throw_null_pointer_exception_on_array_access {
                thrown.push(domain.vm_thrown_exception(pc, NULL_POINTER_EXCEPTION));
            }
            frame
                .refine_is_null(&array, Answer::No, domain)
                .map_err(InterpretationError::ImpossibleRefinement)?;
        }
        Answer::No => {}
    }
    if let IntValue::Exact(v) = index {
        if v < 0 {
            return Ok(Execution {
                continuation: Continuation::Throws,
                thrown: vec![
                    domain.vm_thrown_exception(pc, ARRAY_INDEX_OUT_OF_BOUNDS_EXCEPTION),
                ],
            });
        }
    }
    if config.throw_array_index_out_of_bounds_exception {
        thrown.push(domain.vm_thrown_exception(pc, ARRAY_INDEX_OUT_OF_BOUNDS_EXCEPTION));
    }
    Ok(Execution::falls_through(frame).with_thrown(thrown))
}

fn new_array(
    mut frame: Frame,
    pc: ProgramCounter,
    domain: &mut Domain,
    array_type: FieldType,
    dimensions: usize,
) -> Result<Execution, InterpretationError> {
    let mut definitely_negative = false;
    for _ in 0..dimensions {
        if let IntValue::Exact(v) = frame.pop_int()? {
            definitely_negative |= v < 0;
        }
    }
    if definitely_negative {
        return Ok(Execution {
            continuation: Continuation::Throws,
            thrown: vec![domain.vm_thrown_exception(pc, NEGATIVE_ARRAY_SIZE_EXCEPTION)],
        });
    }
    let value = domain.new_array(pc, array_type);
    frame.push_value(AbstractValue::Reference(value))?;
    Ok(Execution::falls_through(frame))
}

fn int_zero_branch(
    mut frame: Frame,
    predicate: impl FnOnce(IntValue) -> Answer,
) -> Result<Execution, InterpretationError> {
    let value = frame.pop_int()?;
    let continuation = match predicate(value) {
        Answer::Yes => Continuation::Branch {
            taken: Some(frame),
            not_taken: None,
        },
        Answer::No => Continuation::Branch {
            taken: None,
            not_taken: Some(frame),
        },
        Answer::Unknown => Continuation::Branch {
            taken: Some(frame.same_frame()),
            not_taken: Some(frame),
        },
    };
    Ok(Execution {
        continuation,
        thrown: Vec::new(),
    })
}

fn int_compare_branch(
    mut frame: Frame,
    predicate: impl FnOnce(IntValue, IntValue) -> Answer,
) -> Result<Execution, InterpretationError> {
    let b = frame.pop_int()?;
    let a = frame.pop_int()?;
    let continuation = match predicate(a, b) {
        Answer::Yes => Continuation::Branch {
            taken: Some(frame),
            not_taken: None,
        },
        Answer::No => Continuation::Branch {
            taken: None,
            not_taken: Some(frame),
        },
        Answer::Unknown => Continuation::Branch {
            taken: Some(frame.same_frame()),
            not_taken: Some(frame),
        },
    };
    Ok(Execution {
        continuation,
        thrown: Vec::new(),
    })
}

/// `ifnull` (`null_is_taken = true`) and `ifnonnull`. On an undecided
/// value both successors exist, each refined with what the test proved.
fn null_branch(
    mut frame: Frame,
    domain: &mut Domain,
    null_is_taken: bool,
) -> Result<Execution, InterpretationError> {
    let value = frame.pop_reference()?;
    let continuation = match value.is_null() {
        Answer::Yes => {
            if null_is_taken {
                Continuation::Branch {
                    taken: Some(frame),
                    not_taken: None,
                }
            } else {
                Continuation::Branch {
                    taken: None,
                    not_taken: Some(frame),
                }
            }
        }
        Answer::No => {
            if null_is_taken {
                Continuation::Branch {
                    taken: None,
                    not_taken: Some(frame),
                }
            } else {
                Continuation::Branch {
                    taken: Some(frame),
                    not_taken: None,
                }
            }
        }
        Answer::Unknown => {
            let mut null_side = frame.same_frame();
            null_side
                .refine_is_null(&value, Answer::Yes, domain)
                .map_err(InterpretationError::ImpossibleRefinement)?;
            let mut non_null_side = frame;
            non_null_side
                .refine_is_null(&value, Answer::No, domain)
                .map_err(InterpretationError::ImpossibleRefinement)?;
            if null_is_taken {
                Continuation::Branch {
                    taken: Some(null_side),
                    not_taken: Some(non_null_side),
                }
            } else {
                Continuation::Branch {
                    taken: Some(non_null_side),
                    not_taken: Some(null_side),
                }
            }
        }
    };
    Ok(Execution {
        continuation,
        thrown: Vec::new(),
    })
}

/// `if_acmpeq` (`equal_is_taken = true`) and `if_acmpne`. Equal
/// timestamps prove identity; a comparison against a definite `null`
/// refines the other operand on both sides.
fn reference_compare_branch(
    mut frame: Frame,
    domain: &mut Domain,
    equal_is_taken: bool,
) -> Result<Execution, InterpretationError> {
    let b = frame.pop_reference()?;
    let a = frame.pop_reference()?;
    let equal = if a.is_null().is_yes() && b.is_null().is_yes() {
        Answer::Yes
    } else if a.timestamp() == b.timestamp() {
        Answer::Yes
    } else if (a.is_null().is_yes() && b.is_null().is_no())
        || (a.is_null().is_no() && b.is_null().is_yes())
    {
        Answer::No
    } else {
        Answer::Unknown
    };
    let continuation = match equal {
        Answer::Yes => {
            if equal_is_taken {
                Continuation::Branch {
                    taken: Some(frame),
                    not_taken: None,
                }
            } else {
                Continuation::Branch {
                    taken: None,
                    not_taken: Some(frame),
                }
            }
        }
        Answer::No => {
            if equal_is_taken {
                Continuation::Branch {
                    taken: None,
                    not_taken: Some(frame),
                }
            } else {
                Continuation::Branch {
                    taken: Some(frame),
                    not_taken: None,
                }
            }
        }
        Answer::Unknown => {
            let mut equal_side = frame.same_frame();
            let mut unequal_side = frame;
            // Comparing against a definite null decides the other side's
            // nullness per branch.
            for (null_side, other) in [(&a, &b), (&b, &a)] {
                if null_side.is_null().is_yes() && other.is_null().is_unknown() {
                    equal_side
                        .refine_is_null(other, Answer::Yes, domain)
                        .map_err(InterpretationError::ImpossibleRefinement)?;
                    unequal_side
                        .refine_is_null(other, Answer::No, domain)
                        .map_err(InterpretationError::ImpossibleRefinement)?;
                }
            }
            if equal_is_taken {
                Continuation::Branch {
                    taken: Some(equal_side),
                    not_taken: Some(unequal_side),
                }
            } else {
                Continuation::Branch {
                    taken: Some(unequal_side),
                    not_taken: Some(equal_side),
                }
            }
        }
    };
    Ok(Execution {
        continuation,
        thrown: Vec::new(),
    })
}

fn pop_of_type(frame: &mut Frame, t: &FieldType) -> Result<AbstractValue, ExecutionError> {
    use crate::types::field_type::PrimitiveType;
    match t {
        FieldType::Base(PrimitiveType::Long) => frame.pop_long().map(AbstractValue::Long),
        FieldType::Base(PrimitiveType::Float) => frame.pop_float().map(|()| AbstractValue::Float),
        FieldType::Base(PrimitiveType::Double) => {
            frame.pop_double().map(|()| AbstractValue::Double)
        }
        FieldType::Base(_) => frame.pop_int().map(AbstractValue::Int),
        FieldType::Object(_) | FieldType::Array(_) => {
            frame.pop_reference().map(AbstractValue::Reference)
        }
    }
}

fn invoke(
    mut frame: Frame,
    pc: ProgramCounter,
    method: &MethodRef,
    has_receiver: bool,
    domain: &mut Domain,
    dispatcher: Option<&mut dyn CallDispatcher>,
) -> Result<Execution, InterpretationError> {
    let mut arguments = Vec::new();
    for parameter in method.descriptor.parameters_types.iter().rev() {
        arguments.push(pop_of_type(&mut frame, parameter)?);
    }
    arguments.reverse();
    if has_receiver {
        let receiver = frame.pop_reference()?;
        match definite_null_guard(&mut frame, &receiver, pc, domain)? {
            ReceiverCheck::Throws(thrown) => {
                return Ok(Execution {
                    continuation: Continuation::Throws,
                    thrown,
                })
            }
            ReceiverCheck::Proceeds(receiver) => {
                arguments.insert(0, AbstractValue::Reference(receiver));
            }
        }
    }
    if let Some(dispatcher) = dispatcher {
        if let Some(result) = dispatcher.invoke(domain, method, &arguments, pc) {
            match (&method.descriptor.return_type, result.returned) {
                (ReturnType::Void, _) => {}
                (ReturnType::Some(_), Some(returned)) => frame.push_value(returned)?,
                (ReturnType::Some(t), None) => {
                    let value = domain.value_of_type(pc, t);
                    frame.push_value(value)?;
                }
            }
            return Ok(Execution::falls_through(frame).with_thrown(result.thrown));
        }
    }
    // The type-level fallback: an unknown result of the declared return
    // type, and a possibly escaping throwable.
    if let ReturnType::Some(t) = &method.descriptor.return_type {
        let value = domain.value_of_type(pc, t);
        frame.push_value(value)?;
    }
    let thrown = vec![domain.object_value(
        pc,
        Answer::No,
        false,
        ClassRef::new(JAVA_LANG_THROWABLE),
    )];
    Ok(Execution::falls_through(frame).with_thrown(thrown))
}

fn check_cast(
    mut frame: Frame,
    pc: ProgramCounter,
    target: &FieldType,
    domain: &mut Domain,
) -> Result<Execution, InterpretationError> {
    let value = frame.pop_reference()?;
    // null passes every cast.
    if value.is_null().is_yes() {
        frame.push_value(AbstractValue::Reference(value))?;
        return Ok(Execution::falls_through(frame));
    }
    match value.is_value_subtype_of(target, domain.class_hierarchy()) {
        Answer::Yes => {
            frame.push_value(AbstractValue::Reference(value))?;
            Ok(Execution::falls_through(frame))
        }
        Answer::No if value.is_null().is_no() => Ok(Execution {
            continuation: Continuation::Throws,
            thrown: vec![domain.vm_thrown_exception(pc, CLASS_CAST_EXCEPTION)],
        }),
        Answer::No => {
            // Only null survives the cast.
            let refined = frame
                .refine_is_null(&value, Answer::Yes, domain)
                .map_err(InterpretationError::ImpossibleRefinement)?;
            frame.push_value(AbstractValue::Reference(refined))?;
            let thrown = vec![domain.vm_thrown_exception(pc, CLASS_CAST_EXCEPTION)];
            Ok(Execution::falls_through(frame).with_thrown(thrown))
        }
        Answer::Unknown => {
            let refined = match frame.refine_upper_type_bound(&value, target, domain) {
                Ok(refined) => refined,
                // The cast can never succeed for this value.
                Err(_) if !value.is_null().is_no() => {
                    let refined = frame
                        .refine_is_null(&value, Answer::Yes, domain)
                        .map_err(InterpretationError::ImpossibleRefinement)?;
                    frame.push_value(AbstractValue::Reference(refined))?;
                    let thrown = vec![domain.vm_thrown_exception(pc, CLASS_CAST_EXCEPTION)];
                    return Ok(Execution::falls_through(frame).with_thrown(thrown));
                }
                Err(_) => {
                    return Ok(Execution {
                        continuation: Continuation::Throws,
                        thrown: vec![domain.vm_thrown_exception(pc, CLASS_CAST_EXCEPTION)],
                    })
                }
            };
            frame.push_value(AbstractValue::Reference(refined))?;
            let thrown = vec![domain.vm_thrown_exception(pc, CLASS_CAST_EXCEPTION)];
            Ok(Execution::falls_through(frame).with_thrown(thrown))
        }
    }
}
