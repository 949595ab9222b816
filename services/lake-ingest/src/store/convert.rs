//! Frame ↔ arrow conversion.
//!
//! Column types are inferred from the cells: integer columns stay Int64,
//! any float promotes the column to Float64, any string forces Utf8. Nulls
//! are carried through; an all-null column lands as nullable Utf8.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow::array::{Array, ArrayRef, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use arrow::util::display::array_value_to_string;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

use crate::frame::{Cell, Frame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColType {
    Int,
    Float,
    Str,
}

fn infer_column(frame: &Frame, idx: usize) -> ColType {
    let mut inferred = ColType::Int;
    for row in frame.rows() {
        match &row[idx] {
            Cell::Null => {}
            Cell::Int(_) => {}
            Cell::Float(_) => {
                if inferred == ColType::Int {
                    inferred = ColType::Float;
                }
            }
            Cell::Str(_) => return ColType::Str,
        }
    }
    inferred
}

/// Convert a frame into an arrow record batch.
pub fn frame_to_batch(frame: &Frame) -> Result<RecordBatch> {
    if frame.columns().is_empty() {
        bail!("frame has no columns");
    }

    let mut fields = Vec::with_capacity(frame.columns().len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(frame.columns().len());

    for (idx, name) in frame.columns().iter().enumerate() {
        let col_type = infer_column(frame, idx);
        match col_type {
            ColType::Int => {
                let values: Vec<Option<i64>> = frame
                    .rows()
                    .iter()
                    .map(|row| match &row[idx] {
                        Cell::Int(v) => Some(*v),
                        _ => None,
                    })
                    .collect();
                fields.push(Field::new(name, DataType::Int64, true));
                arrays.push(Arc::new(Int64Array::from(values)));
            }
            ColType::Float => {
                let values: Vec<Option<f64>> = frame
                    .rows()
                    .iter()
                    .map(|row| match &row[idx] {
                        Cell::Int(v) => Some(*v as f64),
                        Cell::Float(v) => Some(*v),
                        _ => None,
                    })
                    .collect();
                fields.push(Field::new(name, DataType::Float64, true));
                arrays.push(Arc::new(Float64Array::from(values)));
            }
            ColType::Str => {
                let values: Vec<Option<String>> = frame
                    .rows()
                    .iter()
                    .map(|row| match &row[idx] {
                        Cell::Null => None,
                        Cell::Int(v) => Some(v.to_string()),
                        Cell::Float(v) => Some(v.to_string()),
                        Cell::Str(s) => Some(s.clone()),
                    })
                    .collect();
                fields.push(Field::new(name, DataType::Utf8, true));
                arrays.push(Arc::new(StringArray::from(values)));
            }
        }
    }

    let schema = Arc::new(Schema::new(fields));
    RecordBatch::try_new(schema, arrays).context("failed to assemble record batch")
}

/// Convert an arrow record batch back into a frame.
pub fn batch_to_frame(batch: &RecordBatch) -> Result<Frame> {
    let columns: Vec<String> = batch
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();
    let mut frame = Frame::new(columns);

    for row_idx in 0..batch.num_rows() {
        let mut row = Vec::with_capacity(batch.num_columns());
        for col_idx in 0..batch.num_columns() {
            let array = batch.column(col_idx);
            if array.is_null(row_idx) {
                row.push(Cell::Null);
                continue;
            }
            let cell = match array.data_type() {
                DataType::Int64 => {
                    let arr = array
                        .as_any()
                        .downcast_ref::<Int64Array>()
                        .context("int64 downcast")?;
                    Cell::Int(arr.value(row_idx))
                }
                DataType::Float64 => {
                    let arr = array
                        .as_any()
                        .downcast_ref::<Float64Array>()
                        .context("float64 downcast")?;
                    Cell::Float(arr.value(row_idx))
                }
                DataType::Utf8 => {
                    let arr = array
                        .as_any()
                        .downcast_ref::<StringArray>()
                        .context("utf8 downcast")?;
                    Cell::Str(arr.value(row_idx).to_string())
                }
                _ => Cell::Str(
                    array_value_to_string(array, row_idx)
                        .context("render non-scalar cell")?,
                ),
            };
            row.push(cell);
        }
        frame
            .push_row(row)
            .context("batch row width mismatch")?;
    }

    Ok(frame)
}

/// Read one parquet file back into a frame.
pub fn read_parquet_file(path: &Path) -> Result<Frame> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    read_parquet_handle(file, path)
}

/// Read an already-open parquet handle. A reader that opened the file before
/// a directory swap keeps reading its own handle.
pub fn read_parquet_handle(file: File, origin: &Path) -> Result<Frame> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("read parquet {}", origin.display()))?
        .build()?;

    let mut frame: Option<Frame> = None;
    for batch in reader {
        let part = batch_to_frame(&batch?)?;
        match &mut frame {
            None => frame = Some(part),
            Some(acc) => {
                for row in part.rows() {
                    acc.push_row(row.clone())?;
                }
            }
        }
    }
    Ok(frame.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mixed_frame() -> Frame {
        Frame::from_vendor(
            vec![
                "ts_code".into(),
                "trade_date".into(),
                "close".into(),
                "vol".into(),
            ],
            vec![
                vec![json!("600519.SH"), json!("20240314"), json!(1700.5), json!(12000)],
                vec![json!("600519.SH"), json!("20240315"), json!(1712.0), json!(null)],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_type_inference() {
        let batch = frame_to_batch(&mixed_frame()).unwrap();
        let schema = batch.schema();
        assert_eq!(schema.field(0).data_type(), &DataType::Utf8);
        assert_eq!(schema.field(2).data_type(), &DataType::Float64);
        assert_eq!(schema.field(3).data_type(), &DataType::Int64);
    }

    #[test]
    fn test_int_promotes_to_float() {
        let frame = Frame::from_vendor(
            vec!["v".into()],
            vec![vec![json!(1)], vec![json!(2.5)]],
        )
        .unwrap();
        let batch = frame_to_batch(&frame).unwrap();
        assert_eq!(batch.schema().field(0).data_type(), &DataType::Float64);
    }

    #[test]
    fn test_round_trip() {
        let frame = mixed_frame();
        let batch = frame_to_batch(&frame).unwrap();
        let back = batch_to_frame(&batch).unwrap();
        assert_eq!(back.columns(), frame.columns());
        assert_eq!(back.len(), frame.len());
        assert_eq!(back.rows()[1][3], Cell::Null);
        assert_eq!(back.rows()[0][0], Cell::Str("600519.SH".into()));
    }

    #[test]
    fn test_empty_frame_makes_zero_row_batch() {
        let frame = Frame::new(vec!["a".into(), "b".into()]);
        let batch = frame_to_batch(&frame).unwrap();
        assert_eq!(batch.num_rows(), 0);
        assert_eq!(batch.num_columns(), 2);
    }

    #[test]
    fn test_no_columns_rejected() {
        let frame = Frame::new(vec![]);
        assert!(frame_to_batch(&frame).is_err());
    }
}
