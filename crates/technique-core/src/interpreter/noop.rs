//! Interpreter for operator types without runtime behavior.

use super::OperatorInterpreter;

pub struct NoopInterpreter;

impl OperatorInterpreter for NoopInterpreter {
    fn changes_behavior(&self) -> bool {
        false
    }
}
