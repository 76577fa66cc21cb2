use crate::models::{ComplexityClass, DataType, ErrorRecord, WorkbookMetadata};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

pub const SAMPLE_SIZE: usize = 5;
/// Empty-cell ratio above which a sheet is reported as sparse.
pub const SPARSE_RATIO: f64 = 0.9;
/// Row count above which a sheet gets a performance warning.
pub const LARGE_SHEET_ROWS: usize = 10_000;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetReport {
    pub name: String,
    pub row_count: usize,
    pub column_count: usize,
    pub non_empty_cells: usize,
    pub formula_count: usize,
    pub data_types: BTreeMap<DataType, usize>,
    pub complexity: BTreeMap<ComplexityClass, usize>,
    pub functions: BTreeMap<String, usize>,
    pub sample_data: Vec<Vec<String>>,
}

impl SheetReport {
    pub fn declared_cells(&self) -> usize {
        self.row_count * self.column_count
    }

    pub fn empty_ratio(&self) -> f64 {
        let declared = self.declared_cells();
        if declared == 0 {
            return 0.0;
        }
        (declared - self.non_empty_cells.min(declared)) as f64 / declared as f64
    }
}

/// Output of every format analyzer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatReport {
    pub analyzer: &'static str,
    pub metadata: WorkbookMetadata,
    pub sheets: Vec<SheetReport>,
    pub errors: Vec<ErrorRecord>,
    pub warnings: Vec<ErrorRecord>,
    pub possible_circular_references: Vec<String>,
    pub extension: FormatExtension,
}

impl FormatReport {
    pub fn total_formulas(&self) -> usize {
        self.sheets.iter().map(|s| s.formula_count).sum()
    }

    pub fn total_rows(&self) -> usize {
        self.sheets.iter().map(|s| s.row_count).sum()
    }
}

/// Family-specific part of a [`FormatReport`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FormatExtension {
    ModernXml {
        #[serde(rename = "macroRisk")]
        macro_risk: Option<MacroRiskAssessment>,
    },
    Template(TemplateInventory),
    MacroTemplate {
        template: TemplateInventory,
        #[serde(rename = "macroRisk")]
        macro_risk: MacroRiskAssessment,
    },
    LegacyBinary {
        binary: BinaryMetrics,
        #[serde(rename = "macroRisk")]
        macro_risk: MacroRiskAssessment,
        template: Option<TemplateInventory>,
    },
    BinaryZip {
        binary: BinaryMetrics,
        #[serde(rename = "macroRisk")]
        macro_risk: MacroRiskAssessment,
    },
    OpenDocument(OpenDocumentNotes),
    Delimited {
        delimiter: char,
        encoding: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Placeholder {
    pub name: String,
    pub location: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateInventory {
    pub placeholders: Vec<Placeholder>,
    pub unique_names: BTreeSet<String>,
}

impl TemplateInventory {
    pub fn from_placeholders(placeholders: Vec<Placeholder>) -> Self {
        let unique_names = placeholders.iter().map(|p| p.name.clone()).collect();
        Self {
            placeholders,
            unique_names,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    None,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RiskFinding {
    /// Cell address for formulas, module name for VBA code.
    pub location: String,
    pub indicator: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MacroRiskAssessment {
    pub has_vba_project: bool,
    pub modules: Vec<String>,
    pub auto_exec_entry_points: Vec<String>,
    pub vba_findings: Vec<RiskFinding>,
    pub formula_findings: Vec<RiskFinding>,
    pub risk_level: RiskLevel,
}

impl MacroRiskAssessment {
    pub fn none() -> Self {
        Self {
            has_vba_project: false,
            modules: Vec::new(),
            auto_exec_entry_points: Vec::new(),
            vba_findings: Vec::new(),
            formula_findings: Vec::new(),
            risk_level: RiskLevel::None,
        }
    }

    /// Formula-level findings always raise the level to high.
    pub fn recompute_level(&mut self) {
        self.risk_level = if !self.formula_findings.is_empty()
            || (!self.vba_findings.is_empty() && !self.auto_exec_entry_points.is_empty())
        {
            RiskLevel::High
        } else if !self.vba_findings.is_empty() || !self.auto_exec_entry_points.is_empty() {
            RiskLevel::Medium
        } else if self.has_vba_project {
            RiskLevel::Low
        } else {
            RiskLevel::None
        };
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryMetrics {
    pub container_bytes: u64,
    pub part_count: Option<usize>,
    pub compressed_bytes: Option<u64>,
    pub uncompressed_bytes: Option<u64>,
    /// compressed / uncompressed; lower is better compression.
    pub compression_ratio: Option<f64>,
    /// Non-empty cells over declared cells.
    pub cell_density: f64,
    pub bytes_per_cell: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenDocumentNotes {
    pub mimetype_valid: bool,
    pub normalized_formulas: usize,
    pub libreoffice_only_functions: BTreeSet<String>,
    pub notes: Vec<String>,
}
