use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// Destination for batches of derived rows. Owned by the single pipeline
/// consumer, so implementations need not be `Sync`.
pub trait RowSink<T>: Send {
    fn write(&mut self, rows: &[T]) -> Result<()>;
}

impl<T: Clone + Send> RowSink<T> for Vec<T> {
    fn write(&mut self, rows: &[T]) -> Result<()> {
        self.extend_from_slice(rows);
        Ok(())
    }
}

/// CSV file with a header row derived from `T`'s field names.
///
/// Each batch is serialized in memory first, so a row that fails to
/// serialize leaves no part of its batch in the file.
pub struct CsvSink<T> {
    path: PathBuf,
    file: BufWriter<File>,
    header_written: bool,
    rows: usize,
    _row: PhantomData<fn(T)>,
}

impl<T: Serialize> CsvSink<T> {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Could not create dir {:?}", parent))?;
        }
        let file = File::create(path).with_context(|| format!("Could not create {:?}", path))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: BufWriter::new(file),
            header_written: false,
            rows: 0,
            _row: PhantomData,
        })
    }

    /// Flush and close; returns the file path and number of rows written.
    pub fn finish(mut self) -> Result<(PathBuf, usize)> {
        self.file
            .flush()
            .with_context(|| format!("flush {:?}", self.path))?;
        Ok((self.path, self.rows))
    }

    fn encode(&self, rows: &[T]) -> Result<Vec<u8>> {
        let mut buf = csv::WriterBuilder::new()
            .has_headers(!self.header_written)
            .from_writer(Vec::new());
        for row in rows {
            buf.serialize(row)?;
        }
        buf.into_inner().map_err(|e| anyhow!("{}", e.error()))
    }
}

impl<T: Serialize> RowSink<T> for CsvSink<T> {
    fn write(&mut self, rows: &[T]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let bytes = self
            .encode(rows)
            .with_context(|| format!("serialize {} rows for {:?}", rows.len(), self.path))?;
        self.file
            .write_all(&bytes)
            .with_context(|| format!("write rows to {:?}", self.path))?;
        self.header_written = true;
        self.rows += rows.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FactorRecord;
    use chrono::NaiveDate;

    #[test]
    fn test_csv_sink_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("factor.csv");
        let mut sink = CsvSink::<FactorRecord>::create(&path).unwrap();
        let row = FactorRecord {
            date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            symbol: "sh600000".into(),
            qfq_factor: 0.5,
            hfq_factor: 1.0,
        };
        sink.write(std::slice::from_ref(&row)).unwrap();
        sink.write(&[row.clone(), row]).unwrap();
        let (written, n) = sink.finish().unwrap();
        assert_eq!(n, 3);
        let text = std::fs::read_to_string(written).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "date,symbol,qfq_factor,hfq_factor");
        assert_eq!(lines[1], "2024-01-02,sh600000,0.5,1.0");
    }

    #[derive(Serialize)]
    struct Checked {
        id: u32,
        #[serde(serialize_with = "reject_negative")]
        value: i32,
    }

    fn reject_negative<S: serde::Serializer>(v: &i32, s: S) -> Result<S::Ok, S::Error> {
        if *v < 0 {
            return Err(serde::ser::Error::custom("negative value"));
        }
        s.serialize_i32(*v)
    }

    #[test]
    fn test_csv_sink_failed_batch_leaves_no_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checked.csv");
        let mut sink = CsvSink::<Checked>::create(&path).unwrap();

        // failure before the header is written must not lose the header
        assert!(sink.write(&[Checked { id: 0, value: -1 }]).is_err());
        sink.write(&[Checked { id: 1, value: 1 }, Checked { id: 2, value: 2 }]).unwrap();
        let err = sink
            .write(&[Checked { id: 3, value: 3 }, Checked { id: 4, value: -4 }])
            .unwrap_err();
        assert!(format!("{:#}", err).contains("negative value"));
        sink.write(&[Checked { id: 5, value: 5 }]).unwrap();

        let (written, n) = sink.finish().unwrap();
        assert_eq!(n, 3);
        let text = std::fs::read_to_string(written).unwrap();
        assert_eq!(text, "id,value\n1,1\n2,2\n5,5\n");
    }

    #[test]
    fn test_vec_sink_collects() {
        let mut sink: Vec<u32> = Vec::new();
        sink.write(&[1, 2]).unwrap();
        sink.write(&[3]).unwrap();
        assert_eq!(sink, vec![1, 2, 3]);
    }
}
