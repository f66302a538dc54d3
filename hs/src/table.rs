//! Persistence for the history store
//!
//! Two on-disk forms:
//! - a positional CSV table (`id, x.., x_cube.., f | fvec.., flags, status`)
//!   that downstream analysis tools can load directly
//! - JSON Lines with a leading metadata line, which round-trips exactly
//!
//! Writers hold an exclusive `fs2` lock on the file, readers a shared one.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{HistoryError, Result};
use crate::record::{EvalStatus, Evaluation, HistoryRecord, ObjectiveShape};
use crate::store::HistoryStore;

/// Metadata line at the top of a JSON Lines history
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableMeta {
    dim: usize,
    shape: ObjectiveShape,
    rows: u64,
}

fn open_for_write(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).write(true).truncate(true).open(path)?;
    file.lock_exclusive()?;
    Ok(file)
}

fn open_for_read(path: &Path) -> Result<File> {
    let file = File::open(path)?;
    FileExt::lock_shared(&file)?;
    Ok(file)
}

fn header(dim: usize, shape: ObjectiveShape) -> Vec<String> {
    let mut columns = vec!["id".to_string()];
    columns.extend((0..dim).map(|i| format!("x{}", i)));
    columns.extend((0..dim).map(|i| format!("x_cube{}", i)));
    match shape {
        ObjectiveShape::Scalar => columns.push("f".to_string()),
        ObjectiveShape::Vector(k) => columns.extend((0..k).map(|i| format!("fvec{}", i))),
    }
    for name in ["returned", "is_local_point", "paused", "status", "worker", "returned_at"] {
        columns.push(name.to_string());
    }
    columns
}

fn parse_f64(field: &str, line: usize) -> Result<f64> {
    field.trim().parse().map_err(|_| HistoryError::Parse {
        line,
        reason: format!("invalid number '{}'", field),
    })
}

fn parse_bool(field: &str, line: usize) -> Result<bool> {
    match field.trim() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(HistoryError::Parse {
            line,
            reason: format!("invalid flag '{}'", other),
        }),
    }
}

impl HistoryStore {
    /// Write the store as a positional CSV table
    pub fn save_table(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        debug!(path = %path.display(), rows = self.count(), "HistoryStore::save_table: called");
        let file = open_for_write(path)?;
        let mut out = BufWriter::new(&file);

        writeln!(out, "{}", header(self.dim(), self.shape()).join(","))?;
        for row in self.iter() {
            let mut fields: Vec<String> = Vec::with_capacity(4 + 2 * self.dim() + self.shape().width() + 6);
            fields.push(row.id.to_string());
            fields.extend(row.x.iter().map(|v| v.to_string()));
            fields.extend(row.x_cube.iter().map(|v| v.to_string()));
            if row.returned {
                fields.extend(row.slots().iter().map(|v| v.to_string()));
            } else {
                fields.extend(std::iter::repeat_n(String::new(), self.shape().width()));
            }
            fields.push(row.returned.to_string());
            fields.push(row.is_local_point.to_string());
            fields.push(row.paused.to_string());
            fields.push(row.status.to_string());
            fields.push(row.worker.map(|w| w.to_string()).unwrap_or_default());
            fields.push(row.returned_at.map(|t| t.to_string()).unwrap_or_default());
            writeln!(out, "{}", fields.join(","))?;
        }
        out.flush()?;
        drop(out);
        FileExt::unlock(&file)?;

        info!(path = %path.display(), rows = self.count(), "Saved history table");
        Ok(())
    }

    /// Load a store written by [`HistoryStore::save_table`]
    pub fn load_table(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "HistoryStore::load_table: called");
        let file = open_for_read(path)?;
        let mut lines = BufReader::new(&file).lines();

        let header_line = lines.next().ok_or(HistoryError::Parse {
            line: 1,
            reason: "missing header".to_string(),
        })??;
        let columns: Vec<&str> = header_line.split(',').map(str::trim).collect();
        let dim = columns
            .iter()
            .filter(|c| c.starts_with('x') && !c.starts_with("x_cube"))
            .count();
        let shape = if columns.contains(&"f") {
            ObjectiveShape::Scalar
        } else {
            ObjectiveShape::Vector(columns.iter().filter(|c| c.starts_with("fvec")).count())
        };
        if columns != header(dim, shape) {
            return Err(HistoryError::Parse {
                line: 1,
                reason: format!("unexpected header '{}'", header_line),
            });
        }

        let width = shape.width();
        let mut records = Vec::new();
        for (index, line) in lines.enumerate() {
            let line_no = index + 2;
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(',').collect();
            if fields.len() != columns.len() {
                return Err(HistoryError::Parse {
                    line: line_no,
                    reason: format!("expected {} fields, got {}", columns.len(), fields.len()),
                });
            }

            let id = fields[0].trim().parse::<u64>().map_err(|_| HistoryError::Parse {
                line: line_no,
                reason: format!("invalid id '{}'", fields[0]),
            })?;
            let x = fields[1..1 + dim]
                .iter()
                .map(|f| parse_f64(f, line_no))
                .collect::<Result<Vec<_>>>()?;
            let x_cube = fields[1 + dim..1 + 2 * dim]
                .iter()
                .map(|f| parse_f64(f, line_no))
                .collect::<Result<Vec<_>>>()?;
            let rest = &fields[1 + 2 * dim..];
            let returned = parse_bool(rest[width], line_no)?;
            let value = if returned {
                let slots = rest[..width]
                    .iter()
                    .map(|f| parse_f64(f, line_no))
                    .collect::<Result<Vec<_>>>()?;
                Some(Evaluation::from_slots(shape, &slots))
            } else {
                None
            };
            let status: EvalStatus = rest[width + 3].trim().parse().map_err(|reason| HistoryError::Parse {
                line: line_no,
                reason,
            })?;
            let worker = match rest[width + 4].trim() {
                "" => None,
                w => Some(w.parse::<u32>().map_err(|_| HistoryError::Parse {
                    line: line_no,
                    reason: format!("invalid worker '{}'", w),
                })?),
            };
            let returned_at = match rest[width + 5].trim() {
                "" => None,
                t => Some(t.parse::<i64>().map_err(|_| HistoryError::Parse {
                    line: line_no,
                    reason: format!("invalid timestamp '{}'", t),
                })?),
            };

            records.push(HistoryRecord {
                id,
                x,
                x_cube,
                value,
                is_local_point: parse_bool(rest[width + 1], line_no)?,
                returned,
                paused: parse_bool(rest[width + 2], line_no)?,
                status,
                worker,
                returned_at,
            });
        }
        FileExt::unlock(&file)?;

        debug!(dim, %shape, rows = records.len(), "HistoryStore::load_table: parsed");
        Self::from_records(dim, shape, &records)
    }

    /// Write the store as JSON Lines with a leading metadata line
    pub fn save_jsonl(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        debug!(path = %path.display(), rows = self.count(), "HistoryStore::save_jsonl: called");
        let file = open_for_write(path)?;
        let mut out = BufWriter::new(&file);

        let meta = TableMeta {
            dim: self.dim(),
            shape: self.shape(),
            rows: self.count(),
        };
        writeln!(out, "{}", serde_json::to_string(&meta)?)?;
        for row in self.iter() {
            writeln!(out, "{}", serde_json::to_string(&row.to_record())?)?;
        }
        out.flush()?;
        drop(out);
        FileExt::unlock(&file)?;

        info!(path = %path.display(), rows = self.count(), "Saved history journal");
        Ok(())
    }

    /// Load a store written by [`HistoryStore::save_jsonl`]
    pub fn load_jsonl(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "HistoryStore::load_jsonl: called");
        let file = open_for_read(path)?;
        let mut lines = BufReader::new(&file).lines();

        let meta_line = lines.next().ok_or(HistoryError::Parse {
            line: 1,
            reason: "missing metadata line".to_string(),
        })??;
        let meta: TableMeta = serde_json::from_str(&meta_line)?;

        let mut records = Vec::with_capacity(meta.rows as usize);
        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str::<HistoryRecord>(&line)?);
        }
        FileExt::unlock(&file)?;

        if records.len() as u64 != meta.rows {
            return Err(HistoryError::Parse {
                line: records.len() + 2,
                reason: format!("metadata announces {} rows, found {}", meta.rows, records.len()),
            });
        }
        Self::from_records(meta.dim, meta.shape, &records)
    }
}
