//! Interprocedural dispatch.
//!
//! On an `invoke*` instruction the interpreter consults a
//! [`CallDispatcher`]; the [`RecursiveDispatcher`] interprets the callee
//! with a fresh domain and translates its results back into the caller.
//! Whenever a callee cannot be handled (unresolvable, abstract, native,
//! marked as skipped, or too deep), the dispatcher answers `None` and the
//! interpreter falls back to the type-level stub.

use std::collections::HashSet;

use log::debug;

use crate::jvm::code::ProgramCounter;
use crate::jvm::method::{Method, MethodAccessFlags};
use crate::jvm::references::MethodRef;

use super::domain::reference::ReferenceValue;
use super::domain::{AbstractValue, Domain, TimestampCounter};
use super::{interpret_with, Configuration};

/// What a dispatched call produced, in caller-domain values.
#[derive(Debug, Clone)]
pub struct CallResult {
    /// The returned value; `None` for `void` callees.
    pub returned: Option<AbstractValue>,
    /// The exceptions that may escape the callee.
    pub thrown: Vec<ReferenceValue>,
}

/// Resolves invocation targets to loaded methods.
pub trait MethodResolver {
    /// The method a reference resolves to, if its class is part of the
    /// project.
    fn resolve(&self, callee: &MethodRef) -> Option<&Method>;
}

impl MethodResolver for Vec<Method> {
    fn resolve(&self, callee: &MethodRef) -> Option<&Method> {
        self.iter().find(|method| {
            method.owner == callee.owner
                && method.name == callee.name
                && method.descriptor == callee.descriptor
        })
    }
}

/// Handles `invoke*` instructions for the interpreter.
pub trait CallDispatcher {
    /// Dispatches a call. `arguments` holds the receiver (for instance
    /// methods) followed by the declared parameters, in caller-domain
    /// values. Answering `None` makes the interpreter fall back to the
    /// type-level stub.
    fn invoke(
        &mut self,
        caller_domain: &mut Domain,
        callee: &MethodRef,
        arguments: &[AbstractValue],
        pc: ProgramCounter,
    ) -> Option<CallResult>;
}

/// A dispatcher that recursively interprets callees up to a bounded
/// depth, each in its own domain.
pub struct RecursiveDispatcher<R> {
    resolver: R,
    config: Configuration,
    max_depth: usize,
    depth: usize,
    do_not_interpret: HashSet<MethodRef>,
}

impl<R: MethodResolver> RecursiveDispatcher<R> {
    /// Creates a dispatcher over the given resolver. Callees are
    /// interpreted with the given configuration.
    #[must_use]
    pub fn new(resolver: R, config: Configuration, max_depth: usize) -> Self {
        Self {
            resolver,
            config,
            max_depth,
            depth: 0,
            do_not_interpret: HashSet::new(),
        }
    }

    /// Marks a method that must never be interpreted (the fallback is
    /// used instead).
    pub fn do_not_interpret(&mut self, callee: MethodRef) {
        self.do_not_interpret.insert(callee);
    }

    /// Maps a callee value back into the caller: a value that still is a
    /// callee parameter becomes the corresponding caller argument, every
    /// other value is rebuilt at the call site.
    fn map_back(
        caller_domain: &mut Domain,
        arguments: &[AbstractValue],
        value: &AbstractValue,
        pc: ProgramCounter,
    ) -> AbstractValue {
        if let AbstractValue::Reference(ReferenceValue::Single(single)) = value {
            let origin = single.origin();
            if origin.is_parameter() && single.timestamp().0 < TimestampCounter::FIRST {
                let index = (-origin.0 - 1) as usize;
                if let Some(argument) = arguments.get(index) {
                    return argument.clone();
                }
            }
        }
        caller_domain.adapt_value(value, pc)
    }

    fn join_into(
        caller_domain: &mut Domain,
        accumulated: Option<AbstractValue>,
        value: AbstractValue,
    ) -> Option<AbstractValue> {
        match accumulated {
            None => Some(value),
            Some(current) => match caller_domain.join_values(&current, &value) {
                Some(update) => Some(update.into_value().unwrap_or(current)),
                None => Some(current),
            },
        }
    }
}

impl<R: MethodResolver> CallDispatcher for RecursiveDispatcher<R> {
    fn invoke(
        &mut self,
        caller_domain: &mut Domain,
        callee: &MethodRef,
        arguments: &[AbstractValue],
        pc: ProgramCounter,
    ) -> Option<CallResult> {
        if self.depth >= self.max_depth || self.do_not_interpret.contains(callee) {
            return None;
        }
        let Some(method) = self.resolver.resolve(callee) else {
            debug!("could not resolve invocation target {callee}");
            return None;
        };
        if method
            .access_flags
            .intersects(MethodAccessFlags::ABSTRACT | MethodAccessFlags::NATIVE)
            || method.body.is_none()
        {
            return None;
        }
        let method = method.clone();
        let config = self.config.clone();
        let callee_domain = Domain::new(caller_domain.class_hierarchy_handle());
        self.depth += 1;
        let outcome = interpret_with(
            &method,
            callee_domain,
            &config,
            Some(self as &mut dyn CallDispatcher),
        );
        self.depth -= 1;
        let result = match outcome {
            Ok(result) if !result.was_aborted => result,
            Ok(_) => {
                debug!("interpretation of {callee} was aborted, falling back");
                return None;
            }
            Err(error) => {
                debug!("interpretation of {callee} failed ({error}), falling back");
                return None;
            }
        };
        let mut returned = None;
        for value in result.returned_values.values().flatten() {
            let mapped = Self::map_back(caller_domain, arguments, value, pc);
            returned = Self::join_into(caller_domain, returned, mapped);
        }
        let thrown = result
            .escaping_exceptions
            .values()
            .flatten()
            .filter_map(|exception| {
                let value = AbstractValue::Reference(exception.clone());
                match Self::map_back(caller_domain, arguments, &value, pc) {
                    AbstractValue::Reference(reference) => Some(reference),
                    _ => None,
                }
            })
            .collect();
        Some(CallResult { returned, thrown })
    }
}
