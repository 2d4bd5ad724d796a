use std::any::Any;
use std::sync::Arc;

use crate::error::{HookError, Result};
use crate::tensor::Tensor;

/// Completion payload of a hook's [`AsyncHandle`](super::AsyncHandle).
///
/// Strategies may resolve to any of these; only
/// [`CommHook::process_future`](crate::hook::CommHook::process_future) knows
/// how its own strategy's payload becomes gradient tensors.
#[derive(Clone)]
pub enum HookValue {
    None,
    Int(i64),
    Double(f64),
    Str(String),
    Tensor(Tensor),
    TensorList(Vec<Tensor>),
    List(Vec<HookValue>),
    /// Strategy-private data the hook machinery never looks into.
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl HookValue {
    /// Short name of the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            HookValue::None => "None",
            HookValue::Int(_) => "Int",
            HookValue::Double(_) => "Double",
            HookValue::Str(_) => "Str",
            HookValue::Tensor(_) => "Tensor",
            HookValue::TensorList(_) => "TensorList",
            HookValue::List(_) => "List",
            HookValue::Opaque(_) => "Opaque",
        }
    }

    pub fn is_tensor_list(&self) -> bool {
        matches!(self, HookValue::TensorList(_))
    }

    /// Borrow the tensors of a `TensorList` payload.
    pub fn as_tensor_list(&self) -> Option<&[Tensor]> {
        match self {
            HookValue::TensorList(tensors) => Some(tensors),
            _ => None,
        }
    }

    /// Coerce the payload into a tensor sequence.
    ///
    /// Accepts a `TensorList`, a single `Tensor`, or a `List` made only of
    /// tensors. Anything else is a contract violation.
    pub fn into_tensor_list(self) -> Result<Vec<Tensor>> {
        match self {
            HookValue::TensorList(tensors) => Ok(tensors),
            HookValue::Tensor(t) => Ok(vec![t]),
            HookValue::List(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| match item {
                    HookValue::Tensor(t) => Ok(t),
                    other => Err(HookError::contract(format!(
                        "list element {i} is {}, expected Tensor",
                        other.kind()
                    ))),
                })
                .collect(),
            other => Err(HookError::contract(format!(
                "cannot convert {} payload to a tensor list",
                other.kind()
            ))),
        }
    }
}

impl std::fmt::Debug for HookValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HookValue::None => f.write_str("None"),
            HookValue::Int(v) => write!(f, "Int({v})"),
            HookValue::Double(v) => write!(f, "Double({v})"),
            HookValue::Str(s) => write!(f, "Str({s:?})"),
            HookValue::Tensor(t) => f.debug_tuple("Tensor").field(t).finish(),
            HookValue::TensorList(ts) => f.debug_tuple("TensorList").field(ts).finish(),
            HookValue::List(items) => f.debug_tuple("List").field(items).finish(),
            HookValue::Opaque(_) => f.write_str("Opaque(..)"),
        }
    }
}

impl From<Vec<Tensor>> for HookValue {
    fn from(tensors: Vec<Tensor>) -> Self {
        HookValue::TensorList(tensors)
    }
}

impl From<Tensor> for HookValue {
    fn from(t: Tensor) -> Self {
        HookValue::Tensor(t)
    }
}
