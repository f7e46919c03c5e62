//! Registry which maps operator types to sharding rules.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::rule::{DistOp, DistRule};
use crate::rules;

/// Errors that occur when registering or looking up rules.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum RegistryError {
    /// No container is registered for the operator type.
    #[error("operator type \"{op_type}\" has no registered sharding rules")]
    UnsupportedOperatorKind { op_type: String },

    /// A rule was registered for an operator type before its container.
    #[error("no container registered for operator type \"{op_type}\"")]
    UnknownContainer { op_type: String },

    /// A rule with the same name is already registered for the operator type.
    #[error("rule \"{rule}\" is already registered for operator type \"{op_type}\"")]
    DuplicateRule { op_type: String, rule: String },
}

/// Candidate rules for one operator type, in registration order.
pub struct RuleContainer {
    op_type: String,
    rules: Vec<Arc<dyn DistRule>>,
}

impl RuleContainer {
    fn new(op_type: &str) -> Self {
        RuleContainer {
            op_type: op_type.to_string(),
            rules: Vec::new(),
        }
    }

    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    pub fn rules(&self) -> &[Arc<dyn DistRule>] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Find a rule by name.
    pub fn get(&self, name: &str) -> Option<&dyn DistRule> {
        self.rules
            .iter()
            .find(|rule| rule.name() == name)
            .map(|rule| rule.as_ref())
    }

    /// Select the rule to use for an operator.
    ///
    /// Rules are ranked by registration order. The first rule whose input
    /// and output compatibility checks accept the operator is returned.
    pub fn select(&self, op: &DistOp) -> Option<&dyn DistRule> {
        self.rules
            .iter()
            .find(|rule| rule.is_input_compatible(op) && rule.is_output_compatible(op))
            .map(|rule| rule.as_ref())
    }

    /// Return the rule to use for an operator whose dist attr may record a
    /// previously selected rule.
    ///
    /// The recorded rule is kept while it still accepts the operator.
    /// Otherwise this falls back to [`select`](RuleContainer::select).
    pub fn resolve(&self, op: &DistOp) -> Option<&dyn DistRule> {
        op.dist_attr()
            .rule()
            .and_then(|name| self.get(name))
            .filter(|rule| rule.is_input_compatible(op) && rule.is_output_compatible(op))
            .or_else(|| self.select(op))
    }
}

/// Registry of sharding rules, keyed by operator type.
///
/// New registries have no rules registered. To create a registry with all
/// built-in rules, use [`RuleRegistry::with_all_rules`]. Alternatively
/// create an empty registry and register the rules needed:
///
/// ```
/// use std::sync::Arc;
/// use shardprop::RuleRegistry;
/// use shardprop::rules::ShapePreserving;
///
/// let mut reg = RuleRegistry::new();
/// reg.register_container("tanh");
/// reg.register_rule("tanh", Arc::new(ShapePreserving)).unwrap();
/// assert!(reg.contains("tanh"));
/// ```
///
/// Registration only ever adds entries. Once built, a registry is shared
/// by reference with propagation runs, which may read it concurrently.
#[derive(Default)]
pub struct RuleRegistry {
    containers: FxHashMap<String, RuleContainer>,
}

impl RuleRegistry {
    /// Create a new empty registry.
    pub fn new() -> RuleRegistry {
        RuleRegistry::default()
    }

    /// Create a new registry with all built-in rules registered.
    pub fn with_all_rules() -> RuleRegistry {
        let mut reg = RuleRegistry::new();

        macro_rules! register {
            ($rule:expr, [$($op_type:literal),+ $(,)?]) => {
                let rule: Arc<dyn DistRule> = Arc::new($rule);
                $(
                    reg.register_container($op_type);
                    reg.register_rule($op_type, rule.clone())
                        .expect("built-in rules should have unique names");
                )+
            };
        }

        register!(
            rules::ShapePreserving,
            [
                "scale",
                "fill_any_like",
                "where",
                "tanh",
                "relu",
                "gelu",
                "cast",
                "assign",
            ]
        );
        register!(
            rules::Elementwise,
            [
                "elementwise_add",
                "elementwise_sub",
                "elementwise_mul",
                "elementwise_div",
            ]
        );
        register!(rules::MatMul, ["matmul", "matmul_v2"]);
        register!(rules::Reduce, ["reduce_sum", "reduce_mean", "reduce_max"]);

        reg
    }

    /// Declare that operators of type `op_type` take part in propagation.
    ///
    /// Registering a type which is already known returns the existing
    /// container.
    pub fn register_container(&mut self, op_type: &str) -> &mut RuleContainer {
        self.containers
            .entry(op_type.to_string())
            .or_insert_with(|| RuleContainer::new(op_type))
    }

    /// Add a candidate rule for `op_type`.
    ///
    /// The type must have been declared with
    /// [`register_container`](RuleRegistry::register_container). Rules are
    /// never replaced, so registering a second rule with the same name fails.
    pub fn register_rule(
        &mut self,
        op_type: &str,
        rule: Arc<dyn DistRule>,
    ) -> Result<(), RegistryError> {
        let container =
            self.containers
                .get_mut(op_type)
                .ok_or_else(|| RegistryError::UnknownContainer {
                    op_type: op_type.to_string(),
                })?;
        if container.get(rule.name()).is_some() {
            return Err(RegistryError::DuplicateRule {
                op_type: op_type.to_string(),
                rule: rule.name().to_string(),
            });
        }
        container.rules.push(rule);
        Ok(())
    }

    /// Return the rules registered for `op_type`.
    pub fn container(&self, op_type: &str) -> Result<&RuleContainer, RegistryError> {
        self.containers
            .get(op_type)
            .ok_or_else(|| RegistryError::UnsupportedOperatorKind {
                op_type: op_type.to_string(),
            })
    }

    pub fn contains(&self, op_type: &str) -> bool {
        self.containers.contains_key(op_type)
    }

    /// Return the registered operator types, sorted by name.
    pub fn op_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.containers.keys().map(|k| k.as_str()).collect();
        types.sort_unstable();
        types
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{RegistryError, RuleRegistry};
    use crate::graph::{Graph, OperatorDesc};
    use crate::mesh::Mesh;
    use crate::rule::{DistOp, DistRule};
    use crate::rules::ShapePreserving;

    /// Rule which accepts operators with a fixed number of inputs.
    struct InputCount {
        name: &'static str,
        count: usize,
    }

    impl DistRule for InputCount {
        fn name(&self) -> &str {
            self.name
        }

        fn is_input_compatible(&self, op: &DistOp) -> bool {
            op.num_inputs() == self.count
        }

        fn is_output_compatible(&self, _op: &DistOp) -> bool {
            true
        }

        fn is_auto_compatible(&self, _op: &DistOp) -> bool {
            true
        }

        fn update_dims_mapping(&self, _op: &mut DistOp) -> bool {
            false
        }
    }

    #[test]
    fn test_register_container_is_idempotent() {
        let mut reg = RuleRegistry::new();
        reg.register_container("tanh");
        reg.register_rule("tanh", Arc::new(ShapePreserving)).unwrap();
        let container = reg.register_container("tanh");
        assert_eq!(container.op_type(), "tanh");
        assert_eq!(container.rules().len(), 1);
        assert_eq!(reg.op_types(), ["tanh"]);
    }

    #[test]
    fn test_register_errors() {
        let mut reg = RuleRegistry::new();
        let err = reg
            .register_rule("tanh", Arc::new(ShapePreserving))
            .err()
            .unwrap();
        assert_eq!(
            err,
            RegistryError::UnknownContainer {
                op_type: "tanh".into()
            }
        );

        reg.register_container("tanh");
        reg.register_rule("tanh", Arc::new(ShapePreserving)).unwrap();
        let err = reg
            .register_rule("tanh", Arc::new(ShapePreserving))
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::DuplicateRule { .. }));

        let err = reg.container("conv2d").err().unwrap();
        assert_eq!(
            err,
            RegistryError::UnsupportedOperatorKind {
                op_type: "conv2d".into()
            }
        );
    }

    #[test]
    fn test_select_in_registration_order() {
        let mut reg = RuleRegistry::new();
        reg.register_container("custom");
        for (name, count) in [("one_input", 1), ("two_inputs", 2), ("two_inputs_b", 2)] {
            reg.register_rule("custom", Arc::new(InputCount { name, count }))
                .unwrap();
        }

        let mut graph = Graph::new(Arc::new(Mesh::new([2]).unwrap()));
        for name in ["a", "b", "out"] {
            graph.add_tensor(name, &[4]).unwrap();
        }
        let id = graph
            .add_op(OperatorDesc::new("op", "custom", &["a", "b"], &["out"]))
            .unwrap();
        let op = graph.dist_op(id).unwrap();

        let container = reg.container("custom").unwrap();
        assert_eq!(container.select(&op).map(|r| r.name()), Some("two_inputs"));
        assert_eq!(container.get("one_input").map(|r| r.name()), Some("one_input"));
        assert!(container.get("missing").is_none());

        // A recorded rule is preferred while it accepts the operator.
        let mut attr = op.dist_attr().clone();
        attr.set_rule(Some("two_inputs_b"));
        let op = DistOp::new(
            op.desc(),
            (0..op.num_inputs()).filter_map(|i| op.input_shape(i)).collect(),
            (0..op.num_outputs()).filter_map(|i| op.output_shape(i)).collect(),
            attr,
        );
        assert_eq!(container.resolve(&op).map(|r| r.name()), Some("two_inputs_b"));

        let mut attr = op.dist_attr().clone();
        attr.set_rule(Some("one_input"));
        let op = DistOp::new(
            op.desc(),
            (0..op.num_inputs()).filter_map(|i| op.input_shape(i)).collect(),
            (0..op.num_outputs()).filter_map(|i| op.output_shape(i)).collect(),
            attr,
        );
        assert_eq!(container.resolve(&op).map(|r| r.name()), Some("two_inputs"));
    }

    #[test]
    fn test_with_all_rules() {
        let reg = RuleRegistry::with_all_rules();
        for op_type in ["scale", "fill_any_like", "where", "tanh"] {
            let container = reg.container(op_type).unwrap();
            assert_eq!(container.rules()[0].name(), "shape_preserving");
        }
        assert!(reg.contains("matmul_v2"));
        assert!(reg.contains("reduce_sum"));
        assert!(reg.contains("elementwise_add"));
        assert!(!reg.contains("conv2d"));
    }
}
