//! Engine wire types. Engine builds disagree on a few shapes (function usage as a map or
//! a list, cycles as arrays or objects), so responses go through lenient raw types and
//! are normalized on the way in.

use crate::models::{CircularReference, DependencyEdge};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// `{ sheetName: [[cell, ...], ...] }`, sheet order preserved.
pub type EngineSheets = serde_json::Map<String, Value>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateSessionResponse {
    #[serde(alias = "session_id", alias = "id")]
    pub session_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct LoadResponse {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AnalyzeResponse {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub data: Option<EngineAnalysis>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ValidateResponse {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub valid: bool,
    #[serde(default)]
    pub errors: Vec<RawIssue>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CalculateResponse {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawFunctions {
    Counts(BTreeMap<String, usize>),
    Names(Vec<RawFunction>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawFunction {
    Name(String),
    Entry {
        name: String,
        #[serde(default = "one", alias = "usage")]
        count: usize,
    },
}

fn one() -> usize {
    1
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct RawDependency {
    #[serde(alias = "cell", alias = "from")]
    dependent: String,
    #[serde(alias = "precedents", alias = "to", alias = "dependsOn")]
    precedent: OneOrMany,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawDependencies {
    Edges(Vec<RawDependency>),
    ByCell(BTreeMap<String, Vec<String>>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCycle {
    Cells(Vec<String>),
    Object {
        #[serde(alias = "cycle", alias = "path")]
        cells: Vec<String>,
    },
    Single(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum RawIssue {
    Message(String),
    Detail {
        #[serde(alias = "error", alias = "description")]
        message: String,
        #[serde(default, alias = "cell", alias = "address")]
        location: Option<String>,
        #[serde(default, rename = "type", alias = "kind")]
        kind: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineIssue {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl From<RawIssue> for EngineIssue {
    fn from(raw: RawIssue) -> Self {
        match raw {
            RawIssue::Message(message) => EngineIssue {
                message,
                location: None,
                kind: None,
            },
            RawIssue::Detail { message, location, kind } => EngineIssue { message, location, kind },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAnalysis {
    #[serde(default)]
    total_formulas: usize,
    #[serde(default)]
    functions: Option<RawFunctions>,
    #[serde(default)]
    errors: Vec<RawIssue>,
    #[serde(default)]
    dependencies: Option<RawDependencies>,
    #[serde(default)]
    circular_references: Vec<RawCycle>,
    #[serde(default, alias = "sheetFormulaCounts")]
    formulas_by_sheet: BTreeMap<String, usize>,
}

/// Normalized `GET /sessions/{id}/analyze` payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawAnalysis", rename_all = "camelCase")]
pub struct EngineAnalysis {
    pub total_formulas: usize,
    pub functions: BTreeMap<String, usize>,
    pub errors: Vec<EngineIssue>,
    pub dependencies: Vec<DependencyEdge>,
    pub circular_references: Vec<CircularReference>,
    pub formulas_by_sheet: BTreeMap<String, usize>,
}

impl From<RawAnalysis> for EngineAnalysis {
    fn from(raw: RawAnalysis) -> Self {
        let functions = match raw.functions {
            Some(RawFunctions::Counts(counts)) => counts,
            Some(RawFunctions::Names(names)) => {
                let mut counts = BTreeMap::new();
                for entry in names {
                    let (name, count) = match entry {
                        RawFunction::Name(name) => (name, 1),
                        RawFunction::Entry { name, count } => (name, count),
                    };
                    *counts.entry(name.to_ascii_uppercase()).or_insert(0) += count;
                }
                counts
            }
            None => BTreeMap::new(),
        };

        let dependencies = match raw.dependencies {
            Some(RawDependencies::Edges(edges)) => edges
                .into_iter()
                .flat_map(|edge| {
                    let precedents = match edge.precedent {
                        OneOrMany::One(p) => vec![p],
                        OneOrMany::Many(ps) => ps,
                    };
                    let dependent = edge.dependent;
                    precedents.into_iter().map(move |precedent| DependencyEdge {
                        dependent: dependent.clone(),
                        precedent,
                    })
                })
                .collect(),
            Some(RawDependencies::ByCell(map)) => map
                .into_iter()
                .flat_map(|(dependent, precedents)| {
                    precedents.into_iter().map(move |precedent| DependencyEdge {
                        dependent: dependent.clone(),
                        precedent,
                    })
                })
                .collect(),
            None => Vec::new(),
        };

        let circular_references = raw
            .circular_references
            .into_iter()
            .map(|cycle| CircularReference {
                cells: match cycle {
                    RawCycle::Cells(cells) | RawCycle::Object { cells } => cells,
                    RawCycle::Single(text) => text
                        .split(|c: char| c == ',' || c == '>' || c == '-' || c.is_whitespace())
                        .filter(|part| !part.is_empty())
                        .map(str::to_string)
                        .collect(),
                },
            })
            .collect();

        EngineAnalysis {
            total_formulas: raw.total_formulas,
            functions,
            errors: raw.errors.into_iter().map(EngineIssue::from).collect(),
            dependencies,
            circular_references,
            formulas_by_sheet: raw.formulas_by_sheet,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormulaValidation {
    pub valid: bool,
    pub errors: Vec<EngineIssue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalculationResult {
    pub formula: String,
    pub value: Value,
}

#[derive(Debug, Deserialize)]
struct RawCatalog {
    #[serde(default)]
    total: Option<usize>,
    #[serde(default)]
    functions: Vec<RawFunction>,
    #[serde(default)]
    categories: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawCatalog")]
pub struct FunctionCatalog {
    pub total: usize,
    pub functions: Vec<String>,
    pub categories: BTreeMap<String, Value>,
}

impl From<RawCatalog> for FunctionCatalog {
    fn from(raw: RawCatalog) -> Self {
        let functions: Vec<String> = raw
            .functions
            .into_iter()
            .map(|f| match f {
                RawFunction::Name(name) | RawFunction::Entry { name, .. } => name,
            })
            .collect();
        FunctionCatalog {
            total: raw.total.unwrap_or(functions.len()),
            functions,
            categories: raw.categories,
        }
    }
}

impl FunctionCatalog {
    pub fn contains(&self, name: &str) -> bool {
        self.functions.iter().any(|f| f.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineHealthReport {
    pub status: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub active_sessions: Option<usize>,
    #[serde(default)]
    pub uptime: Option<f64>,
    #[serde(default)]
    pub memory: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum EngineHealth {
    Healthy(EngineHealthReport),
    #[serde(rename_all = "camelCase")]
    Unreachable { attempts: u32, last_error: String },
}

impl EngineHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, EngineHealth::Healthy(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn analysis_accepts_map_shapes() {
        let analysis: EngineAnalysis = serde_json::from_value(json!({
            "totalFormulas": 2,
            "functions": {"SUM": 2},
            "dependencies": {"Sheet1!B1": ["Sheet1!A1", "Sheet1!A2"]},
            "circularReferences": [["Sheet1!A1", "Sheet1!B1"]],
            "errors": ["bad formula"]
        }))
        .unwrap();
        assert_eq!(analysis.total_formulas, 2);
        assert_eq!(analysis.functions["SUM"], 2);
        assert_eq!(analysis.dependencies.len(), 2);
        assert_eq!(analysis.circular_references[0].cells.len(), 2);
        assert_eq!(analysis.errors[0].message, "bad formula");
    }

    #[test]
    fn analysis_accepts_list_shapes() {
        let analysis: EngineAnalysis = serde_json::from_value(json!({
            "functions": ["sum", {"name": "IF", "count": 3}],
            "dependencies": [{"cell": "B1", "precedents": ["A1"]}, {"from": "C1", "to": "B1"}],
            "circularReferences": [{"cells": ["A1"]}, "B1 -> C1 -> B1"],
            "errors": [{"message": "#REF!", "cell": "Sheet1!C3", "type": "ref"}]
        }))
        .unwrap();
        assert_eq!(analysis.functions["SUM"], 1);
        assert_eq!(analysis.functions["IF"], 3);
        assert_eq!(
            analysis.dependencies[1],
            DependencyEdge {
                dependent: "C1".into(),
                precedent: "B1".into()
            }
        );
        assert_eq!(analysis.circular_references[1].cells, vec!["B1", "C1", "B1"]);
        assert_eq!(analysis.errors[0].location.as_deref(), Some("Sheet1!C3"));
    }

    #[test]
    fn edge_with_formula_text_keeps_the_cell_as_dependent() {
        let analysis: EngineAnalysis = serde_json::from_value(json!({
            "dependencies": [{"cell": "Sheet1!B1", "formula": "=A1", "precedents": ["Sheet1!A1"]}]
        }))
        .unwrap();
        assert_eq!(
            analysis.dependencies,
            vec![DependencyEdge {
                dependent: "Sheet1!B1".into(),
                precedent: "Sheet1!A1".into()
            }]
        );
    }

    #[test]
    fn catalog_counts_functions_when_total_is_missing() {
        let catalog: FunctionCatalog = serde_json::from_value(json!({
            "functions": ["SUM", {"name": "VLOOKUP", "category": "lookup"}],
            "categories": {"math": ["SUM"]}
        }))
        .unwrap();
        assert_eq!(catalog.total, 2);
        assert!(catalog.contains("vlookup"));
    }

    #[test]
    fn health_serializes_with_state_tag() {
        let health = EngineHealth::Unreachable {
            attempts: 3,
            last_error: "HTTP 503".into(),
        };
        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["state"], "unreachable");
        assert_eq!(json["lastError"], "HTTP 503");
    }
}
