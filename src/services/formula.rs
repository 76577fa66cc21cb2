//! Formula extraction: called functions, nesting depth, complexity class, error literals
//! and the self-reference heuristic.
//!
//! Everything here is pure over a single formula string. Cycle detection across cells is
//! the calculation engine's job; [`is_possible_circular_reference`] is only an early hint.

use crate::models::{CellLocation, ComplexityClass, FormulaRecord, Severity};
use lru::LruCache;
use once_cell::sync::Lazy;
use regex::Regex;
use smallvec::SmallVec;
use std::num::NonZeroUsize;
use std::sync::Arc;

pub const FORMULA_MARKER: char = '=';

static FUNCTION_CALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([A-Za-z_][A-Za-z0-9_.]*)\(").expect("valid function regex"));

static DDE_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^=?\s*[A-Za-z0-9_]+\|'").expect("valid dde regex"));

/// Function names that indicate shell/process invocation or XLM macro calls.
const RISKY_FUNCTIONS: &[&str] = &[
    "CALL",
    "REGISTER",
    "REGISTER.ID",
    "EXEC",
    "SHELL",
    "RUN",
    "FOPEN",
    "FWRITE",
    "FWRITELN",
    "URLDOWNLOADTOFILE",
    "CREATEOBJECT",
    "WEBSERVICE",
];

const FUNCTION_PREFIXES: &[&str] = &["_XLFN.", "_XLWS.", "_XLUDF."];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormulaAnalysis {
    /// Upper-cased, de-duplicated, in first-seen order.
    pub functions: SmallVec<[String; 4]>,
    /// Total call sites, duplicates included.
    pub call_count: usize,
    pub nesting_depth: usize,
    pub complexity: ComplexityClass,
}

impl FormulaAnalysis {
    pub fn record(&self, location: &CellLocation, formula: &str) -> FormulaRecord {
        FormulaRecord {
            location: location.to_string(),
            formula: formula.to_string(),
            functions: self.functions.to_vec(),
            complexity: self.complexity,
            nesting_depth: self.nesting_depth,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorLiteralClass {
    DivisionByZero,
    InvalidReference,
    Name,
    Value,
    Number,
    Null,
    NotAvailable,
}

impl ErrorLiteralClass {
    const ALL: [ErrorLiteralClass; 7] = [
        ErrorLiteralClass::DivisionByZero,
        ErrorLiteralClass::InvalidReference,
        ErrorLiteralClass::Name,
        ErrorLiteralClass::Value,
        ErrorLiteralClass::Number,
        ErrorLiteralClass::Null,
        ErrorLiteralClass::NotAvailable,
    ];

    pub fn literal(&self) -> &'static str {
        match self {
            ErrorLiteralClass::DivisionByZero => "#DIV/0!",
            ErrorLiteralClass::InvalidReference => "#REF!",
            ErrorLiteralClass::Name => "#NAME?",
            ErrorLiteralClass::Value => "#VALUE!",
            ErrorLiteralClass::Number => "#NUM!",
            ErrorLiteralClass::Null => "#NULL!",
            ErrorLiteralClass::NotAvailable => "#N/A",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ErrorLiteralClass::DivisionByZero => "division by zero",
            ErrorLiteralClass::InvalidReference => "invalid cell reference",
            ErrorLiteralClass::Name => "unrecognized name",
            ErrorLiteralClass::Value => "wrong value type",
            ErrorLiteralClass::Number => "invalid numeric value",
            ErrorLiteralClass::Null => "empty range intersection",
            ErrorLiteralClass::NotAvailable => "value not available",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            ErrorLiteralClass::InvalidReference | ErrorLiteralClass::Name => Severity::High,
            ErrorLiteralClass::DivisionByZero | ErrorLiteralClass::Value | ErrorLiteralClass::Number => {
                Severity::Medium
            }
            ErrorLiteralClass::Null | ErrorLiteralClass::NotAvailable => Severity::Low,
        }
    }
}

/// Returns the first error literal found in `text`, if any.
pub fn detect_error_literal(text: &str) -> Option<ErrorLiteralClass> {
    let upper = text.to_ascii_uppercase();
    ErrorLiteralClass::ALL
        .iter()
        .copied()
        .find(|class| upper.contains(class.literal()))
}

pub fn is_formula_text(text: &str) -> bool {
    text.len() > 1 && text.starts_with(FORMULA_MARKER)
}

/// Ensures the formula marker is present. Readers that hand back bare formula bodies
/// (`SUM(A1:A3)`) go through here.
pub fn normalize_formula(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with(FORMULA_MARKER) {
        trimmed.to_string()
    } else {
        format!("{}{}", FORMULA_MARKER, trimmed)
    }
}

pub fn strip_marker(formula: &str) -> &str {
    formula.trim().trim_start_matches(FORMULA_MARKER)
}

/// Blanks out string literals and quoted sheet names so their contents are never read
/// as calls, parentheses or references.
fn mask_literals(formula: &str) -> String {
    let mut masked = String::with_capacity(formula.len());
    let mut quote: Option<char> = None;
    for c in formula.chars() {
        match quote {
            Some(q) if c == q => {
                quote = None;
                masked.push(c);
            }
            Some(_) => masked.push(' '),
            None => {
                if c == '"' || c == '\'' {
                    quote = Some(c);
                }
                masked.push(c);
            }
        }
    }
    masked
}

fn canonical_function_name(raw: &str) -> String {
    let upper = raw.to_ascii_uppercase();
    FUNCTION_PREFIXES
        .iter()
        .find_map(|prefix| upper.strip_prefix(prefix))
        .map(str::to_string)
        .unwrap_or(upper)
}

pub fn extract_functions(formula: &str) -> Vec<String> {
    analyze_formula(formula).functions.into_vec()
}

pub fn nesting_depth(formula: &str) -> usize {
    max_depth(&mask_literals(formula))
}

fn max_depth(masked: &str) -> usize {
    let mut depth = 0usize;
    let mut max = 0usize;
    for c in masked.chars() {
        match c {
            '(' => {
                depth += 1;
                max = max.max(depth);
            }
            ')' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    max
}

pub fn classify_complexity(call_count: usize, nesting_depth: usize) -> ComplexityClass {
    if call_count <= 1 && nesting_depth <= 1 {
        ComplexityClass::Simple
    } else if call_count <= 3 && nesting_depth <= 2 {
        ComplexityClass::Medium
    } else {
        ComplexityClass::Complex
    }
}

pub fn analyze_formula(formula: &str) -> FormulaAnalysis {
    let masked = mask_literals(formula);
    let mut functions: SmallVec<[String; 4]> = SmallVec::new();
    let mut call_count = 0;

    for caps in FUNCTION_CALL.captures_iter(&masked) {
        call_count += 1;
        let name = canonical_function_name(&caps[1]);
        if !functions.contains(&name) {
            functions.push(name);
        }
    }

    let nesting_depth = max_depth(&masked);
    FormulaAnalysis {
        complexity: classify_complexity(call_count, nesting_depth),
        functions,
        call_count,
        nesting_depth,
    }
}

/// True when the formula text mentions the cell's own address. Substring match: `A1`
/// also matches inside `A10`, and multi-cell cycles are never seen here.
pub fn is_possible_circular_reference(location: &CellLocation, formula: &str) -> bool {
    let body = mask_literals(strip_marker(formula)).to_ascii_uppercase();
    body.contains(&location.address())
}

/// Risk-indicating functions used by the formula, plus a `DDE` marker for dynamic data
/// exchange links such as `=cmd|' /C calc'!A0`.
pub fn risky_calls(formula: &str, analysis: &FormulaAnalysis) -> Vec<String> {
    let mut hits: Vec<String> = analysis
        .functions
        .iter()
        .filter(|name| RISKY_FUNCTIONS.contains(&name.as_str()))
        .cloned()
        .collect();
    if DDE_LINK.is_match(formula) {
        hits.push("DDE".to_string());
    }
    hits
}

/// Memoizes [`analyze_formula`] for repeated formula text (fill-down columns).
pub struct FormulaCache {
    entries: LruCache<String, Arc<FormulaAnalysis>>,
}

impl FormulaCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }

    pub fn analyze(&mut self, formula: &str) -> Arc<FormulaAnalysis> {
        if let Some(hit) = self.entries.get(formula) {
            return Arc::clone(hit);
        }
        let analysis = Arc::new(analyze_formula(formula));
        self.entries.put(formula.to_string(), Arc::clone(&analysis));
        analysis
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for FormulaCache {
    fn default() -> Self {
        Self::new(1_024)
    }
}
