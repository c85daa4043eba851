use std::{io::Write, path::PathBuf};

use arrow::record_batch::RecordBatch;
use sdtp_core::{
    Row, Schema,
    query::QueryResult,
    storage::{OutputLocation, OutputSink, open_output_sink},
    table::rows_to_record_batch,
};
use snafu::ResultExt;
use tabled::{
    builder::Builder,
    settings::{Style, object::Rows, style::LineText, width::MinWidth},
};

use crate::error::{ArrowSnafu, CliResult, EncodeSnafu, StorageSnafu, WriteSnafu};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Csv,
    Jsonl,
}

#[derive(Debug, Clone)]
pub struct QueryOpts {
    pub max_rows: usize,
    pub output: Option<PathBuf>,
    pub format: OutputFormat,
    pub json: bool,
}

fn render_table(columns: &[&str], rows: &[Vec<String>]) -> String {
    if columns.is_empty() {
        return String::new();
    }

    const PREVIEW_LABEL: &str = "Preview output";
    const PREVIEW_OFFSET: usize = 6;
    let min_width = PREVIEW_OFFSET + PREVIEW_LABEL.len() + 4;

    let mut builder = Builder::default();
    builder.push_record(columns.iter().copied());
    for row in rows {
        builder.push_record(row);
    }

    let mut table = builder.build();
    table.with(Style::rounded());
    table.with(MinWidth::new(min_width));
    table.with(LineText::new(PREVIEW_LABEL, Rows::first()).offset(PREVIEW_OFFSET));
    // LineText re-estimates dimensions, so re-apply MinWidth afterwards.
    table.with(MinWidth::new(min_width));
    table.to_string()
}

fn preview_rows(rows: &[Row], max_rows: usize) -> Vec<Vec<String>> {
    rows.iter()
        .take(max_rows)
        .map(|row| row.iter().map(ToString::to_string).collect())
        .collect()
}

pub fn write_query_result<W: Write>(
    res: &QueryResult,
    opts: &QueryOpts,
    out: &mut W,
) -> CliResult<()> {
    if let Some(notice) = res.notice() {
        writeln!(out, "notice: {notice}").context(WriteSnafu)?;
    }

    if opts.json {
        writeln!(out, "{}", res.to_json()).context(WriteSnafu)?;
        return Ok(());
    }

    let preview = preview_rows(&res.rows, opts.max_rows);
    if !preview.is_empty() || (opts.max_rows == 0 && !res.schema.is_empty()) {
        let rendered = render_table(&res.schema.column_names(), &preview);
        writeln!(out, "{rendered}").context(WriteSnafu)?;
    }

    if opts.max_rows == 0 && res.total_rows > 0 {
        writeln!(out, "(preview suppressed; use --max-rows > 0)").context(WriteSnafu)?;
    } else if res.total_rows == 0 {
        writeln!(out, "(no rows)").context(WriteSnafu)?;
    }

    writeln!(out, "total_rows: {}", res.total_rows).context(WriteSnafu)?;
    if let Some(path) = &opts.output {
        writeln!(out, "wrote: {} ({:?})", path.display(), opts.format).context(WriteSnafu)?;
    }
    Ok(())
}

pub fn print_query_result(res: &QueryResult, opts: &QueryOpts) -> CliResult<()> {
    let mut stdout = std::io::stdout();
    write_query_result(res, opts, &mut stdout)
}

struct SinkWriter {
    sink: OutputSink,
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.sink.writer().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.sink.writer().flush()
    }
}

impl SinkWriter {
    async fn finish(self) -> CliResult<()> {
        self.sink.finish().await.context(StorageSnafu)
    }
}

/// Write every row of `rows` to `path` as CSV or JSON lines.
///
/// The file only appears once fully written.
pub async fn write_rows_file(
    path: &std::path::Path,
    format: OutputFormat,
    schema: &Schema,
    rows: &[Row],
) -> CliResult<()> {
    let batch: RecordBatch = rows_to_record_batch(schema, rows).context(EncodeSnafu)?;
    let out = OutputLocation::parse(&path.to_string_lossy()).context(StorageSnafu)?;
    let sink = open_output_sink(&out.storage, &out.rel_path)
        .await
        .context(StorageSnafu)?;
    let writer = SinkWriter { sink };

    let writer = match format {
        OutputFormat::Csv => {
            let mut w = arrow_csv::WriterBuilder::new().build(writer);
            w.write(&batch).context(ArrowSnafu)?;
            w.into_inner()
        }
        OutputFormat::Jsonl => {
            let mut w = arrow_json::LineDelimitedWriter::new(writer);
            w.write_batches(&[&batch]).context(ArrowSnafu)?;
            w.finish().context(ArrowSnafu)?;
            w.into_inner()
        }
    };
    writer.finish().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdtp_core::{FilterResolution, Value};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn result(rows: Vec<Row>, filter: FilterResolution) -> QueryResult {
        QueryResult {
            schema: Schema::from_pairs([("Month", "STRING"), ("Disease", "NUMBER")])
                .expect("schema"),
            total_rows: rows.len(),
            rows,
            filter,
        }
    }

    fn opts(max_rows: usize) -> QueryOpts {
        QueryOpts {
            max_rows,
            output: None,
            format: OutputFormat::Csv,
            json: false,
        }
    }

    fn rendered(res: &QueryResult, opts: &QueryOpts) -> Result<String, Box<dyn std::error::Error>> {
        let mut buf = Vec::new();
        write_query_result(res, opts, &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }

    #[test]
    fn render_table_includes_preview_label_for_narrow_tables() {
        let rendered = render_table(&["x"], &[vec!["1".to_string()]]);
        assert!(rendered.contains("Preview output"));
    }

    #[test]
    fn preview_is_limited_and_total_reported() -> TestResult {
        let rows = vec![
            vec![Value::String("Jan".into()), Value::Number(1200.0)],
            vec![Value::String("Jun".into()), Value::Number(800.5)],
        ];
        let text = rendered(&result(rows, FilterResolution::Unfiltered), &opts(1))?;
        assert!(text.contains("Jan"));
        assert!(text.contains("1200"));
        assert!(!text.contains("Jun"));
        assert!(text.contains("total_rows: 2"));
        Ok(())
    }

    #[test]
    fn empty_and_suppressed_previews() -> TestResult {
        let empty = rendered(&result(Vec::new(), FilterResolution::Unfiltered), &opts(10))?;
        assert!(empty.contains("(no rows)"));

        let rows = vec![vec![Value::String("Jan".into()), Value::Number(1.0)]];
        let suppressed = rendered(&result(rows, FilterResolution::Unfiltered), &opts(0))?;
        assert!(suppressed.contains("preview suppressed"));
        assert!(suppressed.contains("Month"));
        Ok(())
    }

    #[test]
    fn rejected_filter_prints_notice() -> TestResult {
        let filter = FilterResolution::Rejected {
            input: "bogus".into(),
            reason: "bogus is not a valid filter specification".into(),
        };
        let text = rendered(&result(Vec::new(), filter), &opts(10))?;
        assert!(text.starts_with("notice: bogus is not a valid filter specification"));
        Ok(())
    }

    #[tokio::test]
    async fn writes_csv_file() -> TestResult {
        let tmp = tempfile::TempDir::new()?;
        let path = tmp.path().join("out.csv");
        let res = result(
            vec![vec![Value::String("Jan".into()), Value::Number(1200.0)]],
            FilterResolution::Unfiltered,
        );
        write_rows_file(&path, OutputFormat::Csv, &res.schema, &res.rows).await?;
        let text = std::fs::read_to_string(&path)?;
        assert_eq!(text.lines().next(), Some("Month,Disease"));
        assert!(text.contains("Jan,1200"));
        Ok(())
    }
}
