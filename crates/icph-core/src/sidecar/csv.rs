use ::csv::{ReaderBuilder, Trim};
use tracing::debug;

use super::{ParsedSidecar, RawRecord};

/// Column holding the exported file name.
pub const NAME_COLUMN: &str = "imgName";
/// Column holding the capture date.
pub const DATE_COLUMN: &str = "originalCreationDate";
/// Columns that may carry an original identifier, in order of preference.
const ID_COLUMNS: &[&str] = &["fileChecksum", "id"];

/// Parse an iCloud "Photo Details" CSV.
///
/// CSVs without both the name and date columns (album lists, memories, ...)
/// are reported as unrecognised rather than as errors.
pub fn parse_csv(text: &str) -> Result<ParsedSidecar, ::csv::Error> {
    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .trim(Trim::All)
        .from_reader(text.as_bytes());

    let headers = reader.headers()?.clone();
    let column = |name: &str| headers.iter().position(|h| h == name);
    let (Some(name_col), Some(date_col)) = (column(NAME_COLUMN), column(DATE_COLUMN)) else {
        return Ok(ParsedSidecar::Unrecognized);
    };
    let id_col = ID_COLUMNS.iter().find_map(|c| column(c));

    let mut records = Vec::new();
    let mut malformed = 0u64;
    for (i, row) in reader.records().enumerate() {
        let row_no = i + 1;
        let row = match row {
            Ok(row) => row,
            Err(err) => {
                debug!(row = row_no, error = %err, "malformed csv row");
                malformed += 1;
                continue;
            }
        };
        let name = row.get(name_col).unwrap_or("");
        if name.is_empty() {
            malformed += 1;
            continue;
        }
        records.push(RawRecord {
            row: row_no,
            file_name: name.to_string(),
            timestamp: row.get(date_col).unwrap_or("").to_string(),
            original_id: id_col
                .and_then(|c| row.get(c))
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        });
    }

    Ok(ParsedSidecar::Recognized { records, malformed })
}
