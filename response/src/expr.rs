//! Model expression trees and response diagnostics
//!
//! Fitting sessions combine source models arithmetically before or
//! after folding them through a response. The tree here captures just
//! enough of that structure to answer a configuration question: does
//! any part of the expression already carry an instrument response?
//! Folding a response around an expression that contains one silently
//! double-counts the instrument, so callers check first.

use crate::fold::{FoldedModel, SourceModel};

/// An arithmetic combination of source models and folded models.
pub enum ModelExpr {
    /// An unfolded physical model
    Source(Box<dyn SourceModel>),
    /// A model already convolved with a response
    Folded(Box<dyn FoldedModel>),
    Sum(Vec<ModelExpr>),
    Product(Vec<ModelExpr>),
}

impl ModelExpr {
    /// Render the expression for log and error messages.
    pub fn name(&self) -> String {
        match self {
            ModelExpr::Source(m) => m.name().to_string(),
            ModelExpr::Folded(m) => m.name().to_string(),
            ModelExpr::Sum(parts) => {
                let names: Vec<String> = parts.iter().map(|p| p.name()).collect();
                format!("({})", names.join(" + "))
            }
            ModelExpr::Product(parts) => {
                let names: Vec<String> = parts.iter().map(|p| p.name()).collect();
                format!("({})", names.join(" * "))
            }
        }
    }

    /// True if any component of the expression is already folded.
    pub fn has_response(&self) -> bool {
        has_response(self)
    }
}

/// Walk an expression and report whether any component already carries
/// an instrument response.
pub fn has_response(expr: &ModelExpr) -> bool {
    match expr {
        ModelExpr::Source(_) => false,
        ModelExpr::Folded(_) => true,
        ModelExpr::Sum(parts) | ModelExpr::Product(parts) => parts.iter().any(has_response),
    }
}
