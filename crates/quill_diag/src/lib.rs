//! Compilation errors and warnings.
//!
//! The taxonomy is intentionally coarse: every recoverable condition is either
//! resolved locally by the pass that hit it or converted into a
//! [`CompilationError`] that aborts the current kernel's compilation. Warnings
//! are collected in a [`DiagnosticBag`] and never abort anything.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The compilation stage an error originates from.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompilationStep {
    General,
    Scanner,
    Parser,
    LlvmToIr,
    Optimizer,
    CodeGeneration,
    Linker,
    Verifier,
    Precompilation,
}

impl fmt::Display for CompilationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::General => "general",
            Self::Scanner => "scanner",
            Self::Parser => "parser",
            Self::LlvmToIr => "llvm_to_ir",
            Self::Optimizer => "optimizer",
            Self::CodeGeneration => "code_generation",
            Self::Linker => "linker",
            Self::Verifier => "verifier",
            Self::Precompilation => "precompilation",
        };
        write!(f, "{}", s)
    }
}

/// The single failure type of the compiler.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompilationError {
    pub step: CompilationStep,
    pub message: String,
    /// Textual rendering of the offending value or instruction, if any.
    pub value: Option<String>,
}

impl CompilationError {
    pub fn new(step: CompilationStep, message: impl Into<String>) -> Self {
        Self {
            step,
            message: message.into(),
            value: None,
        }
    }

    pub fn with_value(
        step: CompilationStep,
        message: impl Into<String>,
        value: impl fmt::Display,
    ) -> Self {
        Self {
            step,
            message: message.into(),
            value: Some(value.to_string()),
        }
    }
}

impl fmt::Display for CompilationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "[{}] {}: {}", self.step, self.message, value),
            None => write!(f, "[{}] {}", self.step, self.message),
        }
    }
}

impl std::error::Error for CompilationError {}

pub type Result<T> = std::result::Result<T, CompilationError>;

#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Info,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
}

/// Collector for non-fatal diagnostics emitted while compiling one module.
#[derive(Clone, Debug, Default)]
pub struct DiagnosticBag {
    pub diagnostics: Vec<Diagnostic>,
}

impl DiagnosticBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity: Severity::Warning,
            message: message.into(),
        });
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity: Severity::Info,
            message: message.into(),
        });
    }

    pub fn warning_count(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Warning)
            .count()
    }

    pub fn merge(&mut self, other: DiagnosticBag) {
        self.diagnostics.extend(other.diagnostics);
    }
}
