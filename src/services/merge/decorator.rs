use std::collections::HashMap;
use std::sync::Arc;

use super::MergedResult;
use crate::error::{KernelError, Result};
use crate::models::{AlgorithmConfig, BoundStatement, MaskRuleConfig, Value};

/// Transforms single column values of a merged row. Never changes the row
/// count or order.
pub trait ColumnDecorator: Send + Sync {
    fn decorate(&self, column: usize, value: Value) -> Result<Value>;
}

pub struct DecoratedMergedResult {
    inner: Box<dyn MergedResult>,
    decorators: Vec<Arc<dyn ColumnDecorator>>,
}

impl DecoratedMergedResult {
    pub fn new(inner: Box<dyn MergedResult>, decorators: Vec<Arc<dyn ColumnDecorator>>) -> Self {
        Self { inner, decorators }
    }
}

impl MergedResult for DecoratedMergedResult {
    fn next(&mut self) -> Result<bool> {
        self.inner.next()
    }

    fn value(&self, column: usize) -> Result<Value> {
        let mut value = self.inner.value(column)?;
        for decorator in &self.decorators {
            value = decorator.decorate(column, value)?;
        }
        Ok(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MaskSide {
    AfterSpecialChars,
    BeforeSpecialChars,
}

/// Masks the characters after (or before) the first occurrence of a marker
/// string
#[derive(Debug, Clone)]
pub struct MaskAlgorithm {
    side: MaskSide,
    special_chars: String,
    replace_char: char,
}

impl MaskAlgorithm {
    pub fn from_config(name: &str, config: &AlgorithmConfig) -> Result<Self> {
        let side = match config.type_name.to_uppercase().as_str() {
            "MASK_AFTER_SPECIAL_CHARS" => MaskSide::AfterSpecialChars,
            "MASK_BEFORE_SPECIAL_CHARS" => MaskSide::BeforeSpecialChars,
            other => {
                return Err(KernelError::AlgorithmInitialization(format!(
                    "unknown mask algorithm type '{}' for '{}'",
                    other, name
                )))
            }
        };
        let special_chars = config
            .prop("special-chars")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                KernelError::AlgorithmInitialization(format!("mask algorithm '{}' requires special-chars", name))
            })?
            .to_string();
        let mut replace = config.prop("replace-char").unwrap_or_default().chars();
        let replace_char = match (replace.next(), replace.next()) {
            (Some(c), None) => c,
            _ => {
                return Err(KernelError::AlgorithmInitialization(format!(
                    "mask algorithm '{}' requires a single replace-char",
                    name
                )))
            }
        };
        Ok(Self {
            side,
            special_chars,
            replace_char,
        })
    }

    pub fn mask_text(&self, text: &str) -> String {
        let Some(start) = text.find(&self.special_chars) else {
            return text.to_string();
        };
        let replace = |s: &str| s.chars().map(|_| self.replace_char).collect::<String>();
        match self.side {
            MaskSide::AfterSpecialChars => {
                let end = start + self.special_chars.len();
                format!("{}{}", &text[..end], replace(&text[end..]))
            }
            MaskSide::BeforeSpecialChars => format!("{}{}", replace(&text[..start]), &text[start..]),
        }
    }

    /// Null stays null; numbers are masked through their text form
    pub fn mask(&self, value: Value) -> Value {
        match value {
            Value::Text(text) => Value::Text(self.mask_text(&text)),
            Value::Int(_) | Value::Float(_) => Value::Text(self.mask_text(&value.to_string())),
            other => other,
        }
    }
}

/// Mask algorithms bound to `table.column`, compiled from `MaskRuleConfig`
#[derive(Debug, Default)]
pub struct MaskRule {
    columns: HashMap<(String, String), Arc<MaskAlgorithm>>,
}

impl MaskRule {
    pub fn from_config(config: &MaskRuleConfig) -> Result<Self> {
        let mut algorithms = HashMap::new();
        for (name, algorithm) in &config.algorithms {
            algorithms.insert(name.as_str(), Arc::new(MaskAlgorithm::from_config(name, algorithm)?));
        }
        let mut columns = HashMap::new();
        for (table, table_columns) in &config.tables {
            for (column, algorithm_name) in table_columns {
                let algorithm = algorithms.get(algorithm_name.as_str()).ok_or_else(|| {
                    KernelError::AlgorithmInitialization(format!(
                        "mask algorithm '{}' of {}.{} is not defined",
                        algorithm_name, table, column
                    ))
                })?;
                columns.insert((table.to_lowercase(), column.to_lowercase()), Arc::clone(algorithm));
            }
        }
        Ok(Self { columns })
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn covers_table(&self, table: &str) -> bool {
        self.columns.keys().any(|(t, _)| t.eq_ignore_ascii_case(table))
    }

    pub fn algorithm(&self, table: &str, column: &str) -> Result<Arc<MaskAlgorithm>> {
        self.columns
            .get(&(table.to_lowercase(), column.to_lowercase()))
            .cloned()
            .ok_or_else(|| KernelError::ColumnRuleNotFound {
                table: table.to_string(),
                column: column.to_string(),
            })
    }
}

/// Masks result columns whose projection is bound to a mask algorithm
pub struct MaskDecorator {
    columns: HashMap<usize, Arc<MaskAlgorithm>>,
}

impl MaskDecorator {
    /// `None` when no projected column is masked. Projections without an
    /// owner resolve against the statement's only table.
    pub fn from_statement(rule: &MaskRule, statement: &BoundStatement) -> Option<Self> {
        let default_table = match statement.tables.as_slice() {
            [table] => Some(table.as_str()),
            _ => None,
        };
        let columns: HashMap<usize, Arc<MaskAlgorithm>> = statement
            .projections
            .iter()
            .enumerate()
            .filter_map(|(index, projection)| {
                let table = projection.table.as_deref().or(default_table)?;
                if !rule.covers_table(table) {
                    return None;
                }
                // Unbound columns of a masked table stay in clear
                rule.algorithm(table, &projection.column)
                    .ok()
                    .map(|algorithm| (index, algorithm))
            })
            .collect();
        if columns.is_empty() {
            None
        } else {
            Some(Self { columns })
        }
    }
}

impl ColumnDecorator for MaskDecorator {
    fn decorate(&self, column: usize, value: Value) -> Result<Value> {
        Ok(match self.columns.get(&column) {
            Some(algorithm) => algorithm.mask(value),
            None => value,
        })
    }
}
