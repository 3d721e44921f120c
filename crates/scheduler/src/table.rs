// table.rs
// 简单的行式表格数据集，供按行、按分组的分区策略和表格合并使用。
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// 表格单元格
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Cell {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
}

impl Cell {
    /// 分组键使用的规范化表示，浮点数按位比较
    fn group_key(&self) -> GroupKey {
        match self {
            Cell::Null => GroupKey::Null,
            Cell::Int(v) => GroupKey::Int(*v),
            Cell::Float(v) => GroupKey::Float(v.to_bits()),
            Cell::Str(v) => GroupKey::Str(v.clone()),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Null => write!(f, "null"),
            Cell::Int(v) => write!(f, "{}", v),
            Cell::Float(v) => write!(f, "{}", v),
            Cell::Str(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for Cell {
    fn from(v: i64) -> Self {
        Cell::Int(v)
    }
}

impl From<f64> for Cell {
    fn from(v: f64) -> Self {
        Cell::Float(v)
    }
}

impl From<&str> for Cell {
    fn from(v: &str) -> Self {
        Cell::Str(v.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum GroupKey {
    Null,
    Int(i64),
    Float(u64),
    Str(String),
}

/// 行式表格：列名 + 行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// 追加一行，列数必须与表头一致
    pub fn push_row(&mut self, row: Vec<Cell>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(Error::PartitionArity(format!(
                "行有 {} 列，表头有 {} 列",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn with_row(mut self, row: Vec<Cell>) -> Result<Self> {
        self.push_row(row)?;
        Ok(self)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| Error::UnknownArgument(format!("表格中不存在列 `{}`", name)))
    }

    pub fn column(&self, name: &str) -> Result<Vec<&Cell>> {
        let idx = self.column_index(name)?;
        Ok(self.rows.iter().map(|r| &r[idx]).collect())
    }

    /// 取 [start, end) 行组成的新表
    pub fn slice(&self, start: usize, end: usize) -> Table {
        let end = end.min(self.rows.len());
        let start = start.min(end);
        Table {
            columns: self.columns.clone(),
            rows: self.rows[start..end].to_vec(),
        }
    }

    /// 按列分组，返回每组的行下标，组的顺序为键首次出现的顺序
    pub fn group_indices(&self, by: &[String]) -> Result<Vec<Vec<usize>>> {
        let columns = by
            .iter()
            .map(|c| self.column_index(c))
            .collect::<Result<Vec<_>>>()?;

        let mut positions: HashMap<Vec<GroupKey>, usize> = HashMap::new();
        let mut groups: Vec<Vec<usize>> = Vec::new();
        for (i, row) in self.rows.iter().enumerate() {
            let key: Vec<GroupKey> = columns.iter().map(|&c| row[c].group_key()).collect();
            let pos = *positions.entry(key).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[pos].push(i);
        }
        Ok(groups)
    }

    /// 按行下标取出新表
    pub fn take(&self, rows: &[usize]) -> Table {
        Table {
            columns: self.columns.clone(),
            rows: rows
                .iter()
                .filter_map(|&i| self.rows.get(i).cloned())
                .collect(),
        }
    }

    /// 按列分组，组的顺序为键首次出现的顺序
    pub fn group_by(&self, by: &[String]) -> Result<Vec<Table>> {
        Ok(self
            .group_indices(by)?
            .iter()
            .map(|rows| self.take(rows))
            .collect())
    }

    /// 按顺序拼接多个表，表头必须一致
    pub fn concat(tables: impl IntoIterator<Item = Table>) -> Result<Table> {
        let mut iter = tables.into_iter();
        let mut merged = match iter.next() {
            Some(first) => first,
            None => return Err(Error::CombineSignature("没有表格可以拼接".to_string())),
        };
        for table in iter {
            if table.columns != merged.columns {
                return Err(Error::CombineSignature(format!(
                    "表头不一致: {:?} 与 {:?}",
                    merged.columns, table.columns
                )));
            }
            merged.rows.extend(table.rows);
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn countries() -> Table {
        Table::new(["country", "value"])
            .with_row(vec!["US".into(), 1i64.into()])
            .unwrap()
            .with_row(vec!["US".into(), 2i64.into()])
            .unwrap()
            .with_row(vec!["DE".into(), 3i64.into()])
            .unwrap()
    }

    #[test]
    fn test_group_by_first_appearance() {
        let groups = countries().group_by(&["country".to_string()]).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].row_count(), 2);
        assert_eq!(groups[1].column("country").unwrap(), vec![&Cell::Str("DE".into())]);
    }

    #[test]
    fn test_slice_and_concat() {
        let table = countries();
        let parts = vec![table.slice(0, 2), table.slice(2, 10)];
        assert_eq!(Table::concat(parts).unwrap(), table);
    }

    #[test]
    fn test_concat_rejects_schema_mismatch() {
        let a = Table::new(["x"]);
        let b = Table::new(["y"]);
        assert!(matches!(Table::concat(vec![a, b]), Err(Error::CombineSignature(_))));
    }

    #[test]
    fn test_push_row_checks_width() {
        let mut table = Table::new(["x", "y"]);
        assert!(table.push_row(vec![Cell::Null]).is_err());
    }
}
