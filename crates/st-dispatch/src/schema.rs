// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.

//! Operator schemas: the declared call shape of an operation.
//!
//! A schema is declared as text (`"(Tensor, Tensor) -> Tensor"`) and
//! cross-checked against the schema inferred from each statically typed
//! kernel's signature, so a kernel whose Rust types disagree with the
//! operator definition is rejected at registration time with a diff.

use std::fmt;
use std::str::FromStr;

use crate::value::{IntoValue, KernelTuple};

/// The argument and return types a schema can speak about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Tensor,
    Int,
    Float,
    Bool,
    Str,
    Unit,
}

impl TypeKind {
    pub const fn name(self) -> &'static str {
        match self {
            TypeKind::Tensor => "Tensor",
            TypeKind::Int => "int",
            TypeKind::Float => "float",
            TypeKind::Bool => "bool",
            TypeKind::Str => "str",
            TypeKind::Unit => "()",
        }
    }

    fn parse(text: &str) -> Result<TypeKind, SchemaParseError> {
        match text {
            "Tensor" => Ok(TypeKind::Tensor),
            "int" => Ok(TypeKind::Int),
            "float" => Ok(TypeKind::Float),
            "bool" => Ok(TypeKind::Bool),
            "str" => Ok(TypeKind::Str),
            "()" => Ok(TypeKind::Unit),
            other => Err(SchemaParseError {
                text: other.to_string(),
                reason: "unknown type name",
            }),
        }
    }
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A declared or inferred call shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSchema {
    args: Vec<TypeKind>,
    ret: TypeKind,
}

impl FunctionSchema {
    pub fn new(args: Vec<TypeKind>, ret: TypeKind) -> FunctionSchema {
        FunctionSchema { args, ret }
    }

    /// The schema implied by a typed kernel's Rust signature.
    pub fn infer<A: KernelTuple, R: IntoValue>() -> FunctionSchema {
        FunctionSchema {
            args: A::type_kinds(),
            ret: R::KIND,
        }
    }

    pub fn args(&self) -> &[TypeKind] {
        &self.args
    }

    pub fn ret(&self) -> TypeKind {
        self.ret
    }

    /// First discrepancy between two schemas, described for an error
    /// message, or `None` when they agree.
    pub fn difference(&self, other: &FunctionSchema) -> Option<String> {
        if self.args.len() != other.args.len() {
            return Some(format!(
                "number of arguments differs: {} vs {}",
                self.args.len(),
                other.args.len()
            ));
        }
        for (i, (a, b)) in self.args.iter().zip(other.args.iter()).enumerate() {
            if a != b {
                return Some(format!("type of argument {i} differs: {a} vs {b}"));
            }
        }
        if self.ret != other.ret {
            return Some(format!(
                "return type differs: {} vs {}",
                self.ret, other.ret
            ));
        }
        None
    }
}

impl fmt::Display for FunctionSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{arg}")?;
        }
        write!(f, ") -> {}", self.ret)
    }
}

/// Error produced when schema text cannot be parsed.
#[derive(Debug, thiserror::Error)]
#[error("could not parse schema '{text}': {reason}")]
pub struct SchemaParseError {
    text: String,
    reason: &'static str,
}

impl FromStr for FunctionSchema {
    type Err = SchemaParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (args_part, ret_part) = s.split_once("->").ok_or(SchemaParseError {
            text: s.to_string(),
            reason: "missing '->'",
        })?;
        let inner = args_part
            .trim()
            .strip_prefix('(')
            .and_then(|t| t.strip_suffix(')'))
            .ok_or(SchemaParseError {
                text: s.to_string(),
                reason: "argument list must be parenthesised",
            })?;
        let args = if inner.trim().is_empty() {
            Vec::new()
        } else {
            inner
                .split(',')
                .map(|t| TypeKind::parse(t.trim()))
                .collect::<Result<Vec<_>, _>>()?
        };
        let ret = TypeKind::parse(ret_part.trim())?;
        Ok(FunctionSchema { args, ret })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::TensorRef;

    #[test]
    fn parse_and_display_round_trip() {
        for text in [
            "(Tensor, Tensor) -> Tensor",
            "() -> ()",
            "(int, float, bool, str) -> Tensor",
        ] {
            let schema: FunctionSchema = text.parse().unwrap();
            assert_eq!(schema.to_string(), text);
        }
    }

    #[test]
    fn rejects_malformed_text() {
        assert!("Tensor -> Tensor".parse::<FunctionSchema>().is_err());
        assert!("(Tensor, Tensor)".parse::<FunctionSchema>().is_err());
        assert!("(Complex) -> Tensor".parse::<FunctionSchema>().is_err());
    }

    #[test]
    fn inference_matches_declared_text() {
        let inferred = FunctionSchema::infer::<(TensorRef, TensorRef), TensorRef>();
        let declared: FunctionSchema = "(Tensor, Tensor) -> Tensor".parse().unwrap();
        assert_eq!(declared.difference(&inferred), None);
    }

    #[test]
    fn differences_are_described() {
        let a: FunctionSchema = "(Tensor, Tensor) -> Tensor".parse().unwrap();
        let b: FunctionSchema = "(Tensor) -> Tensor".parse().unwrap();
        let c: FunctionSchema = "(Tensor, int) -> Tensor".parse().unwrap();
        let d: FunctionSchema = "(Tensor, Tensor) -> ()".parse().unwrap();
        assert!(a.difference(&b).unwrap().contains("number of arguments"));
        assert!(a.difference(&c).unwrap().contains("argument 1"));
        assert!(a.difference(&d).unwrap().contains("return type"));
        assert_eq!(a.difference(&a.clone()), None);
    }
}
