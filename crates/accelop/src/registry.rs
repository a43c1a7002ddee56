//! Operator registry keyed by graph op type.
//!
//! Built-in operators are always present; downstream crates add their own
//! through [`OPERATOR_REGISTRARS`] without touching this crate.

use std::collections::HashMap;
use std::sync::{OnceLock, PoisonError, RwLock};

use crate::graph::GraphNode;
use crate::ops::Operator;
use crate::spec::{OpError, OpResult};

/// Builds an operator from a graph node, validating it in the process.
pub type OperatorConstructor = fn(&dyn GraphNode) -> OpResult<Box<dyn Operator>>;

/// Registration hooks collected at link time.
///
/// Each entry is called once, the first time the global registry is touched.
///
/// ```ignore
/// #[accelop::linkme::distributed_slice(accelop::registry::OPERATOR_REGISTRARS)]
/// #[linkme(crate = accelop::linkme)]
/// static REGISTER_MY_OP: fn(&OperatorRegistry) = |registry| registry.register("MyOp", build);
/// ```
#[linkme::distributed_slice]
pub static OPERATOR_REGISTRARS: [fn(&OperatorRegistry)] = [..];

/// Mapping from op type to constructor.
#[derive(Default)]
pub struct OperatorRegistry {
    constructors: RwLock<HashMap<String, OperatorConstructor>>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in operators plus every linked registrar.
    pub fn with_registered() -> Self {
        let registry = Self::new();
        crate::ops::register_builtins(&registry);
        for registrar in OPERATOR_REGISTRARS {
            registrar(&registry);
        }
        registry
    }

    /// Registers `constructor` for `op_type`, replacing any previous entry.
    pub fn register(&self, op_type: impl Into<String>, constructor: OperatorConstructor) {
        let op_type = op_type.into();
        let previous = self
            .constructors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(op_type.clone(), constructor);
        if previous.is_some() {
            tracing::debug!(op_type = %op_type, "replaced operator constructor");
        }
    }

    pub fn create(&self, node: &dyn GraphNode) -> OpResult<Box<dyn Operator>> {
        let constructor = self
            .constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node.op_type())
            .copied()
            .ok_or_else(|| OpError::UnknownOperator(node.op_type().to_string()))?;
        constructor(node)
    }

    pub fn contains(&self, op_type: &str) -> bool {
        self.constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(op_type)
    }

    /// Registered op types in sorted order.
    pub fn op_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

static GLOBAL_REGISTRY: OnceLock<OperatorRegistry> = OnceLock::new();

fn global_registry() -> &'static OperatorRegistry {
    GLOBAL_REGISTRY.get_or_init(OperatorRegistry::with_registered)
}

/// Registers an operator constructor in the process-wide registry.
pub fn register_operator(op_type: impl Into<String>, constructor: OperatorConstructor) {
    global_registry().register(op_type, constructor);
}

/// Builds the operator for `node`.
///
/// Fails with [`OpError::UnknownOperator`] when nothing is registered for the
/// node's op type; otherwise returns whatever the constructor reports.
pub fn create_operator(node: &dyn GraphNode) -> OpResult<Box<dyn Operator>> {
    global_registry().create(node)
}

pub fn has_operator(op_type: &str) -> bool {
    global_registry().contains(op_type)
}

pub fn list_operators() -> Vec<String> {
    global_registry().op_types()
}
